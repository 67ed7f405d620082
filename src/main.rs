use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use studybuddy_client::courses::UploadStatus;
use studybuddy_client::credentials;
use studybuddy_client::feedback::{submit_session_feedback, FeedbackRequest};
use studybuddy_client::history::{default_history_path, HistoryEntry, HistoryStore};
use studybuddy_client::metrics::MetricsCollector;
use studybuddy_client::settings::resolve_settings;
use studybuddy_client::{
    ApiClient, AuthSession, ClientSettings, CorrectParams, CorrectionController, CorrectionPhase,
    CorrectionState, Course, CourseLibrary, FollowupContext, FollowupController, FollowupView,
    Rating, Role, SessionContext, UploadFile,
};

#[derive(Parser)]
#[command(name = "studybuddy", version, about = "Get your homework corrected by StudyBuddy")]
struct Cli {
    /// Base URL of the correction service
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Settings file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Correct an exercise photo, then ask follow-up questions
    Correct {
        image: PathBuf,
        /// Force the subject instead of letting the server detect it
        #[arg(long)]
        subject: Option<String>,
        /// Your own attempt, to be reviewed
        #[arg(long)]
        answer: Option<String>,
        /// Follow-up question, asked once the correction is done (repeatable)
        #[arg(long = "ask")]
        questions: Vec<String>,
    },
    /// Rate a correction
    Feedback {
        session_id: String,
        /// up or down
        rating: Rating,
        #[arg(long)]
        comment: Option<String>,
    },
    /// Manage your course library
    Cours {
        #[command(subcommand)]
        action: CoursAction,
    },
    /// List past corrections
    History {
        #[arg(long)]
        clear: bool,
    },
    /// Store an access token in the system keyring
    Login {
        #[arg(long)]
        token: String,
        #[arg(long)]
        user_id: Option<String>,
    },
    /// Remove the stored access token
    Logout,
}

#[derive(Subcommand)]
enum CoursAction {
    /// List your courses
    List,
    /// Show a course and its extracted text
    Show { id: String },
    /// Add a course from a photo of the lesson
    Upload { image: PathBuf },
    /// Delete a course
    Delete { id: String },
}

fn main() {
    // Load .env file if present (for development convenience)
    let _ = dotenvy::dotenv();

    pretty_env_logger::formatted_builder()
        .filter_level(log::LevelFilter::Warn)
        .parse_env("RUST_LOG")
        .init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(message) = runtime.block_on(run(cli)) {
        eprintln!("{}", message);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    let mut settings = resolve_settings(cli.config.as_deref());
    if let Some(url) = cli.api_url {
        settings.api_url = url;
    }
    log::debug!("Using correction service at {}", settings.base_url());

    match cli.command {
        Command::Correct {
            image,
            subject,
            answer,
            questions,
        } => correct(&settings, image, subject, answer, questions).await,
        Command::Feedback {
            session_id,
            rating,
            comment,
        } => feedback(&settings, session_id, rating, comment).await,
        Command::Cours { action } => cours(&settings, action).await,
        Command::History { clear } => history(&settings, clear),
        Command::Login { token, user_id } => {
            let mut session = AuthSession::new(token.trim());
            if let Some(id) = user_id {
                session = session.with_user_id(id);
            }
            credentials::store_session(Some(&session))?;
            eprintln!("Connecté.");
            Ok(())
        }
        Command::Logout => {
            credentials::store_session(None)?;
            eprintln!("Déconnecté.");
            Ok(())
        }
    }
}

fn session_context() -> SessionContext {
    match credentials::resolve_session() {
        Some(session) => SessionContext::with_session(session),
        None => SessionContext::new(),
    }
}

fn api_client(settings: &ClientSettings) -> Result<Arc<ApiClient>, String> {
    ApiClient::new(settings)
        .map(Arc::new)
        .map_err(|e| format!("Failed to build HTTP client: {}", e))
}

fn open_history(settings: &ClientSettings) -> Result<HistoryStore, String> {
    Ok(HistoryStore::open(
        default_history_path()?,
        settings.history_limit,
    ))
}

async fn correct(
    settings: &ClientSettings,
    image: PathBuf,
    subject: Option<String>,
    answer: Option<String>,
    questions: Vec<String>,
) -> Result<(), String> {
    let file = UploadFile::from_path(&image)
        .await
        .map_err(|e| e.to_string())?;
    let mut params = CorrectParams::new(file);
    params.subject = subject;
    params.student_answer = answer;

    let api = api_client(settings)?;
    let auth = session_context();
    let metrics = Arc::new(Mutex::new(MetricsCollector::new()));

    let controller = CorrectionController::new(api.clone(), auth.clone())
        .with_stall_timeout(settings.stall_timeout())
        .with_metrics(metrics.clone());

    let state = stream_correction(&controller, params).await;
    if state.phase == CorrectionPhase::Error {
        return Err(state.error.unwrap_or_default());
    }

    print_summary(&state);
    if let Some(entry) = HistoryEntry::from_session(&state) {
        match open_history(settings).and_then(|mut store| store.add_entry(entry)) {
            Ok(()) => log::debug!("Saved correction to history"),
            Err(e) => log::warn!("Could not save history: {}", e),
        }
    }

    if questions.is_empty() {
        return Ok(());
    }
    let Some(context) = FollowupContext::from_session(&state) else {
        return Err("Impossible de poser une question : matière ou niveau inconnus.".to_string());
    };

    let followup = FollowupController::new(api, auth)
        .with_context(context)
        .with_stall_timeout(settings.stall_timeout())
        .with_metrics(metrics);
    for question in questions {
        eprintln!("\n> {}", question);
        stream_followup(&followup, &question).await?;
    }
    Ok(())
}

/// Run the correction, echoing phases to stderr and text to stdout.
async fn stream_correction(
    controller: &CorrectionController,
    params: CorrectParams,
) -> CorrectionState {
    let mut rx = controller.subscribe();
    let mut printer = CorrectionPrinter::default();

    let run = controller.start(params);
    tokio::pin!(run);
    loop {
        tokio::select! {
            _ = &mut run => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = rx.borrow_and_update().clone();
                printer.render(&state);
            }
        }
    }

    let state = controller.state();
    printer.render(&state);
    println!();
    state
}

#[derive(Default)]
struct CorrectionPrinter {
    phase: CorrectionPhase,
    printed: usize,
}

impl CorrectionPrinter {
    fn render(&mut self, state: &CorrectionState) {
        if state.phase != self.phase {
            self.phase = state.phase;
            if state.phase.is_processing() {
                eprintln!("[{}]", state.phase.label());
            }
        }
        if let Some(new_text) = state.tokens.get(self.printed..) {
            if !new_text.is_empty() {
                print!("{}", new_text);
                let _ = std::io::stdout().flush();
                self.printed = state.tokens.len();
            }
        }
    }
}

fn print_summary(state: &CorrectionState) {
    if let Some(subject) = state.routed_subject() {
        eprintln!("Matière : {}", subject);
    }
    if let Some(score) = state.evaluation_score {
        eprintln!("Score : {:.0}%", score * 100.0);
    }
    if !state.sources.is_empty() {
        eprintln!("Sources :");
        for source in &state.sources {
            eprintln!("  - {}", source.label());
        }
    }
    if let Some(id) = &state.session_id {
        eprintln!("Session : {}", id);
    }
}

async fn stream_followup(controller: &FollowupController, question: &str) -> Result<(), String> {
    let mut rx = controller.subscribe();
    let mut printed = 0usize;
    let mut print_answer = |view: &FollowupView| {
        let Some(last) = view.transcript.last() else {
            return;
        };
        if last.role != Role::Assistant {
            return;
        }
        if let Some(new_text) = last.content.get(printed..) {
            if !new_text.is_empty() {
                print!("{}", new_text);
                let _ = std::io::stdout().flush();
                printed = last.content.len();
            }
        }
    };

    let send = controller.send_message(question);
    tokio::pin!(send);
    let result = loop {
        tokio::select! {
            result = &mut send => break result,
            changed = rx.changed() => {
                if changed.is_err() {
                    continue;
                }
                let view = rx.borrow_and_update().clone();
                print_answer(&view);
            }
        }
    };
    result.map_err(|e| e.user_message())?;

    print_answer(&controller.view());
    println!();
    Ok(())
}

async fn feedback(
    settings: &ClientSettings,
    session_id: String,
    rating: Rating,
    comment: Option<String>,
) -> Result<(), String> {
    let api = api_client(settings)?;
    let auth = session_context();
    if !auth.is_authenticated() {
        return Err(studybuddy_client::ClientError::MissingAuth.user_message());
    }

    let request = FeedbackRequest::new(session_id.clone(), rating, comment);
    submit_session_feedback(api, &auth, request)
        .await
        .map_err(|e| format!("Feedback task failed: {}", e))?;

    let mut store = open_history(settings)?;
    if !store.update_feedback(&session_id, rating)? {
        log::debug!("Session {} not in local history", session_id);
    }
    eprintln!("Merci pour ton retour !");
    Ok(())
}

async fn cours(settings: &ClientSettings, action: CoursAction) -> Result<(), String> {
    let library = CourseLibrary::new(api_client(settings)?, session_context());

    match action {
        CoursAction::List => {
            let courses = library.refresh().await.map_err(|e| e.user_message())?;
            if courses.is_empty() {
                eprintln!("Aucun cours pour l'instant.");
            }
            for course in courses {
                println!(
                    "{}  {}  {} {}",
                    course.id, course.title, course.subject, course.level
                );
            }
        }
        CoursAction::Show { id } => {
            let course = library.get(&id).await.map_err(|e| e.user_message())?;
            eprintln!("{} ({} {})", course.title, course.subject, course.level);
            if !course.keywords.is_empty() {
                eprintln!("Mots-clés : {}", course.keywords.join(", "));
            }
            println!("{}", course.raw_content);
        }
        CoursAction::Upload { image } => {
            let file = UploadFile::from_path(&image)
                .await
                .map_err(|e| e.to_string())?;
            let course = upload_course(&library, file).await?;
            eprintln!("{}", UploadStatus::Done.label());
            println!("{}  {}  {} {}", course.id, course.title, course.subject, course.level);
        }
        CoursAction::Delete { id } => {
            library.delete(&id).await.map_err(|e| e.user_message())?;
            eprintln!("Cours supprimé.");
        }
    }
    Ok(())
}

/// Upload, echoing progress labels to stderr.
async fn upload_course(
    library: &CourseLibrary,
    file: UploadFile,
) -> Result<Course, String> {
    let mut rx = library.subscribe();
    let upload = library.upload(file);
    tokio::pin!(upload);
    let mut shown = UploadStatus::Idle;
    loop {
        tokio::select! {
            result = &mut upload => return result.map_err(|e| e.user_message()),
            changed = rx.changed() => {
                if changed.is_err() {
                    continue;
                }
                let status = rx.borrow_and_update().upload;
                if status != shown && status.is_uploading() {
                    eprintln!("[{}]", status.label());
                }
                shown = status;
            }
        }
    }
}

fn history(settings: &ClientSettings, clear: bool) -> Result<(), String> {
    let mut store = open_history(settings)?;
    if clear {
        store.clear()?;
        eprintln!("Historique effacé.");
        return Ok(());
    }

    if store.entries().is_empty() {
        eprintln!("Aucune correction enregistrée.");
        return Ok(());
    }
    for entry in store.entries() {
        let feedback = match entry.feedback {
            Some(Rating::Helpful) => " 👍",
            Some(Rating::NotHelpful) => " 👎",
            None => "",
        };
        println!(
            "{}  {}  {} {}{}",
            entry.date.format("%Y-%m-%d %H:%M"),
            entry.session_id,
            entry.subject,
            entry.level,
            feedback
        );
    }
    Ok(())
}
