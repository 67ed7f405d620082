//! Raw HTTP server for body failures a mock server cannot produce.

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// What the server does after sending the first part of the body
#[derive(Debug, Clone, Copy)]
pub enum Then {
    /// Keep the connection open and send nothing more
    Stall,
    /// Close the connection in the middle of the chunked body
    HangUp,
}

/// Serve one request: a 200 event-stream head, `body` as a single chunk,
/// then `then`. Returns the base URL.
pub async fn serve_partial(body: String, then: Then) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();

        // The request body is irrelevant; wait for the end of its head
        let mut seen = Vec::new();
        let mut buf = [0u8; 4096];
        while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                return;
            }
            seen.extend_from_slice(&buf[..n]);
        }

        let head = "HTTP/1.1 200 OK\r\n\
                    content-type: text/event-stream\r\n\
                    transfer-encoding: chunked\r\n\r\n";
        socket.write_all(head.as_bytes()).await.unwrap();
        let chunk = format!("{:x}\r\n{}\r\n", body.len(), body);
        socket.write_all(chunk.as_bytes()).await.unwrap();
        socket.flush().await.unwrap();

        match then {
            Then::Stall => {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Then::HangUp => {
                socket.write_all(b"ff\r\npartial").await.unwrap();
                socket.shutdown().await.unwrap();
            }
        }
    });

    format!("http://{}", addr)
}
