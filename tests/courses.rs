//! Course library against a mock course service.

use serde_json::json;
use std::sync::Arc;
use studybuddy_client::courses::{LibraryView, UploadStatus};
use studybuddy_client::{
    ApiClient, AuthSession, ClientError, CourseLibrary, SessionContext, UploadFile,
};
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn library(server: &MockServer) -> CourseLibrary {
    let api = ApiClient::with_client(reqwest::Client::new(), &server.uri());
    CourseLibrary::new(
        Arc::new(api),
        SessionContext::with_session(AuthSession::new("tok-123")),
    )
}

fn listed(id: &str, title: &str) -> serde_json::Value {
    json!({
        "id": id,
        "title": title,
        "subject": "Mathématiques",
        "level": "4eme",
        "created_at": "2025-03-01T09:00:00+00:00",
    })
}

#[tokio::test]
async fn list_replaces_local_courses() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/cours/"))
        .and(header("authorization", "Bearer tok-123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            listed("c2", "Théorème de Thalès"),
            listed("c1", "Fractions"),
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let lib = library(&server);
    let courses = lib.refresh().await.unwrap();

    assert_eq!(courses.len(), 2);
    assert_eq!(courses[0].title, "Théorème de Thalès");
    assert_eq!(lib.view().courses, courses);
    server.verify().await;
}

#[tokio::test]
async fn upload_sends_photo_and_prepends_course() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/cours/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([listed("c1", "Fractions")])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/cours/upload"))
        .and(header("authorization", "Bearer tok-123"))
        .and(body_string_contains("name=\"file\"; filename=\"lecon.png\""))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "c9",
            "title": "Les puissances",
            "subject": "Mathématiques",
            "level": "4eme",
            "keywords": ["exposant", "produit"],
            "chunk_count": 4,
            "created_at": "2025-03-02T09:00:00+00:00",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let lib = library(&server);
    lib.refresh().await.unwrap();
    let course = lib
        .upload(UploadFile::new(b"png-bytes".to_vec(), "lecon.png", "image/png"))
        .await
        .unwrap();

    assert_eq!(course.id, "c9");
    assert_eq!(course.keywords, vec!["exposant", "produit"]);

    let view = lib.view();
    assert_eq!(view.upload, UploadStatus::Done);
    let ids: Vec<_> = view.courses.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["c9", "c1"]);
    server.verify().await;
}

#[tokio::test]
async fn upload_failure_reports_server_text() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/cours/upload"))
        .respond_with(
            ResponseTemplate::new(422).set_body_string("Impossible d extraire du texte de cette image."),
        )
        .mount(&server)
        .await;

    let lib = library(&server);
    let err = lib
        .upload(UploadFile::new(b"blurry".to_vec(), "flou.jpg", "image/jpeg"))
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::Http { status: 422, .. }));
    let view = lib.view();
    assert_eq!(view.upload, UploadStatus::Error);
    assert_eq!(
        view.upload_error.as_deref(),
        Some("Impossible d extraire du texte de cette image.")
    );
    assert!(view.courses.is_empty());
}

#[tokio::test]
async fn rejected_image_is_never_sent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;

    let lib = library(&server);
    let err = lib
        .upload(UploadFile::new(b"%PDF".to_vec(), "cours.pdf", "application/pdf"))
        .await
        .unwrap_err();

    assert!(matches!(err, ClientError::RejectedImage(_)));
    assert_eq!(lib.view(), LibraryView::default());
    server.verify().await;
}

#[tokio::test]
async fn show_returns_extracted_text() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/cours/c1"))
        .and(header("authorization", "Bearer tok-123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "c1",
            "title": "Fractions",
            "subject": "Mathématiques",
            "level": "5eme",
            "keywords": ["numérateur"],
            "raw_content": "Une fraction s'écrit a/b avec b ≠ 0.",
            "created_at": "2025-03-01T09:00:00+00:00",
        })))
        .mount(&server)
        .await;

    let detail = library(&server).get("c1").await.unwrap();
    assert_eq!(detail.raw_content, "Une fraction s'écrit a/b avec b ≠ 0.");
    assert_eq!(detail.keywords, vec!["numérateur"]);
}

#[tokio::test]
async fn delete_removes_course_locally() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/cours/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            listed("c2", "Thalès"),
            listed("c1", "Fractions"),
        ])))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/api/cours/c1"))
        .and(header("authorization", "Bearer tok-123"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/api/cours/absent"))
        .respond_with(ResponseTemplate::new(404).set_body_string("Cours introuvable"))
        .mount(&server)
        .await;

    let lib = library(&server);
    lib.refresh().await.unwrap();
    lib.delete("c1").await.unwrap();

    let ids: Vec<_> = lib.view().courses.iter().map(|c| c.id.clone()).collect();
    assert_eq!(ids, vec!["c2"]);

    let missing = lib.delete("absent").await.unwrap_err();
    assert_eq!(missing.user_message(), "Cours introuvable");
    assert_eq!(lib.view().courses.len(), 1);
    server.verify().await;
}

#[tokio::test]
async fn course_calls_need_auth() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(0)
        .mount(&server)
        .await;

    let api = ApiClient::with_client(reqwest::Client::new(), &server.uri());
    let lib = CourseLibrary::new(Arc::new(api), SessionContext::new());
    assert!(matches!(lib.refresh().await, Err(ClientError::MissingAuth)));
    assert!(matches!(lib.get("c1").await, Err(ClientError::MissingAuth)));
    server.verify().await;
}
