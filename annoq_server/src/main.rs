use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rocket::fairing::AdHoc;
use rocket::http::Status;
use rocket::response::status;
use rocket::serde::json::{json, Value};
use rocket::State;

use annoq_data::{valid_corpus_id, JobOptions, JobRecord, JobSummary, Status as JobStatus};
use annoq_lib::executor::SshExecutor;
use annoq_lib::storage::LocalStorage;
use annoq_lib::{Error, JobManager, Settings};

use crate::auth::{Identity, Operator};
use crate::state::AppState;

#[macro_use]
extern crate rocket;

mod auth;
mod state;

type ApiResponse = status::Custom<Value>;

fn success(message: &str) -> ApiResponse {
    status::Custom(
        Status::Ok,
        json!({"status": "success", "message": message}),
    )
}

fn job_success(message: &str, summary: &JobSummary) -> ApiResponse {
    status::Custom(
        Status::Ok,
        json!({"status": "success", "message": message, "job": summary}),
    )
}

fn failure(code: Status, message: &str, info: Option<String>) -> ApiResponse {
    status::Custom(
        code,
        json!({"status": "error", "message": message, "info": info}),
    )
}

fn error_status(err: &Error) -> Status {
    match err {
        Error::MissingRequirement { .. } => Status::BadRequest,
        Error::ProcessNotRunning => Status::BadRequest,
        Error::ProcessNotFound => Status::NotFound,
        Error::Storage(_) => Status::BadGateway,
        _ => Status::InternalServerError,
    }
}

fn split_csv(value: Option<&str>) -> Option<Vec<String>> {
    value.map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect()
    })
}

/// Build the status view of a job: latest process output, elapsed time and
/// queue priority.
async fn summarize(manager: &JobManager, job: &mut JobRecord) -> JobSummary {
    let parsed = manager.fetch_output(job).await.unwrap_or_default();
    let seconds_taken = manager
        .seconds_taken(job, Utc::now())
        .unwrap_or(job.latest_seconds_taken);
    let mut summary = JobSummary::new(job);
    summary.seconds_taken = seconds_taken;
    summary.warnings = parsed.warnings_text();
    summary.errors = parsed.errors_text();
    summary.output = parsed.misc_text();
    if job.status.is_waiting() {
        summary.priority = manager.priority(&job.corpus_id).ok();
    }
    summary
}

#[get("/")]
fn index(identity: Identity) -> String {
    format!("Hello, {}!", identity.user_id)
}

#[put("/jobs/<corpus_id>/run?<exports>&<files>")]
async fn run_job(
    identity: Identity,
    state: &State<AppState>,
    corpus_id: &str,
    exports: Option<&str>,
    files: Option<&str>,
) -> ApiResponse {
    if !valid_corpus_id(corpus_id) {
        return failure(Status::BadRequest, "Invalid corpus id", None);
    }
    let manager = &state.manager;
    let settings = manager.settings();

    let source_dir = settings.storage_source_dir(corpus_id);
    let source_files = match manager.storage().list_contents(&source_dir).await {
        Ok(files) => files,
        Err(e) => {
            return failure(
                error_status(&e),
                &format!("Failed to list source files in '{}'", corpus_id),
                Some(e.to_string()),
            )
        }
    };
    if source_files.is_empty() {
        return failure(
            Status::NotFound,
            &format!("No source files found for '{}'", corpus_id),
            None,
        );
    }

    let exports = split_csv(exports)
        .filter(|exports| !exports.is_empty())
        .unwrap_or_else(|| settings.default_exports.clone());
    let options = JobOptions {
        user_id: Some(identity.user_id),
        contact: identity.contact,
        exports: Some(exports),
        files: Some(split_csv(files).unwrap_or_default()),
        available_files: Some(source_files),
        ..JobOptions::default()
    };
    let mut job = match manager.get_job(corpus_id, options) {
        Ok(job) => job,
        Err(e) => return failure(error_status(&e), "Failed to load job", Some(e.to_string())),
    };

    if let Err(e) = manager.request_annotation(&mut job).await {
        return failure(
            error_status(&e),
            &format!("Failed to start job for '{}'", corpus_id),
            Some(e.to_string()),
        );
    }
    let summary = summarize(manager, &mut job).await;
    job_success("Job has been queued", &summary)
}

#[put("/jobs/<corpus_id>/install?<scramble>")]
async fn install_job(
    identity: Identity,
    state: &State<AppState>,
    corpus_id: &str,
    scramble: Option<bool>,
) -> ApiResponse {
    if !valid_corpus_id(corpus_id) {
        return failure(Status::BadRequest, "Invalid corpus id", None);
    }
    let manager = &state.manager;
    let options = JobOptions {
        user_id: Some(identity.user_id),
        contact: identity.contact,
        install_scrambled: Some(scramble.unwrap_or(false)),
        ..JobOptions::default()
    };
    let mut job = match manager.get_job(corpus_id, options) {
        Ok(job) => job,
        Err(e) => return failure(error_status(&e), "Failed to load job", Some(e.to_string())),
    };
    if let Err(e) = manager.request_install(&mut job) {
        return failure(
            error_status(&e),
            &format!("Failed to queue install for '{}'", corpus_id),
            Some(e.to_string()),
        );
    }
    let summary = summarize(manager, &mut job).await;
    job_success("Install has been queued", &summary)
}

#[get("/jobs")]
async fn list_jobs(_identity: Identity, state: &State<AppState>) -> ApiResponse {
    let manager = &state.manager;
    let jobs = match manager.list_jobs() {
        Ok(jobs) => jobs,
        Err(e) => return failure(error_status(&e), "Failed to list jobs", Some(e.to_string())),
    };
    let mut summaries = Vec::with_capacity(jobs.len());
    for mut job in jobs {
        summaries.push(summarize(manager, &mut job).await);
    }
    status::Custom(
        Status::Ok,
        json!({"status": "success", "message": "Listing jobs", "jobs": summaries}),
    )
}

#[get("/jobs/<corpus_id>")]
async fn job_status(
    _identity: Identity,
    state: &State<AppState>,
    corpus_id: &str,
) -> ApiResponse {
    let manager = &state.manager;
    let mut job = match manager.get_job(corpus_id, JobOptions::default()) {
        Ok(job) => job,
        Err(e) => return failure(error_status(&e), "Failed to load job", Some(e.to_string())),
    };
    if job.status == JobStatus::None {
        return failure(
            Status::NotFound,
            &format!("There is no active job for '{}'", corpus_id),
            None,
        );
    }
    // Annotation results are fetched on first sight of a finished run.
    if job.status == JobStatus::DoneAnnotating {
        if let Err(e) = manager.sync_results(&mut job).await {
            return failure(
                error_status(&e),
                "Annotation succeeded but results failed to sync to storage",
                Some(e.to_string()),
            );
        }
    }
    let summary = summarize(manager, &mut job).await;
    job_success(job.status.description(), &summary)
}

#[post("/jobs/<corpus_id>/abort")]
async fn abort_job(
    _identity: Identity,
    state: &State<AppState>,
    corpus_id: &str,
) -> ApiResponse {
    let manager = &state.manager;
    let mut job = match manager.get_job(corpus_id, JobOptions::default()) {
        Ok(job) => job,
        Err(e) => return failure(error_status(&e), "Failed to load job", Some(e.to_string())),
    };
    if job.status.is_syncing() {
        return failure(
            Status::ServiceUnavailable,
            "Cannot abort job while syncing files",
            None,
        );
    }
    match manager.abort(&mut job).await {
        Ok(()) => {
            let summary = summarize(manager, &mut job).await;
            job_success("Job aborted", &summary)
        }
        Err(Error::ProcessNotRunning) => {
            success(&format!("No running job found for '{}'", corpus_id))
        }
        Err(e) => failure(
            error_status(&e),
            &format!("Failed to abort job for '{}'", corpus_id),
            Some(e.to_string()),
        ),
    }
}

#[delete("/jobs/<corpus_id>?<force>")]
async fn remove_job(
    _identity: Identity,
    state: &State<AppState>,
    corpus_id: &str,
    force: Option<bool>,
) -> ApiResponse {
    let manager = &state.manager;
    let mut job = match manager.get_job(corpus_id, JobOptions::default()) {
        Ok(job) => job,
        Err(e) => return failure(error_status(&e), "Failed to load job", Some(e.to_string())),
    };
    if let Err(e) = manager.remove_from_remote(&mut job).await {
        return failure(
            error_status(&e),
            &format!("Failed to remove '{}' from the annotation server", corpus_id),
            Some(e.to_string()),
        );
    }
    match manager.drop_job(corpus_id, force.unwrap_or(false)) {
        Ok(()) => success(&format!("Job for '{}' removed", corpus_id)),
        Err(e @ Error::Job(_)) => failure(Status::Conflict, &e.to_string(), None),
        Err(e) => failure(
            error_status(&e),
            &format!("Failed to remove job for '{}'", corpus_id),
            Some(e.to_string()),
        ),
    }
}

#[delete("/jobs/<corpus_id>/annotations")]
async fn clean_annotations(
    _identity: Identity,
    state: &State<AppState>,
    corpus_id: &str,
) -> ApiResponse {
    let manager = &state.manager;
    let job = match manager.get_job(corpus_id, JobOptions::default()) {
        Ok(job) => job,
        Err(e) => return failure(error_status(&e), "Failed to load job", Some(e.to_string())),
    };
    if job.status.is_running() {
        return failure(
            Status::ServiceUnavailable,
            "Cannot clean annotations while a job is running",
            None,
        );
    }
    match manager.clean(&job).await {
        Ok(tool_output) => status::Custom(
            Status::Ok,
            json!({
                "status": "success",
                "message": format!("Annotations for '{}' removed", corpus_id),
                "tool_output": tool_output,
            }),
        ),
        Err(e) => failure(
            error_status(&e),
            "Failed to clean annotations",
            Some(e.to_string()),
        ),
    }
}

#[delete("/jobs/<corpus_id>/exports")]
async fn clean_exports(
    _identity: Identity,
    state: &State<AppState>,
    corpus_id: &str,
) -> ApiResponse {
    let manager = &state.manager;
    let job = match manager.get_job(corpus_id, JobOptions::default()) {
        Ok(job) => job,
        Err(e) => return failure(error_status(&e), "Failed to load job", Some(e.to_string())),
    };
    if job.status.is_running() {
        return failure(
            Status::ServiceUnavailable,
            "Cannot clean exports while a job is running",
            None,
        );
    }
    match manager.clean_exports(&job).await {
        Ok(tool_output) => status::Custom(
            Status::Ok,
            json!({
                "status": "success",
                "message": format!("Exports for '{}' removed", corpus_id),
                "tool_output": tool_output,
            }),
        ),
        Err(e) => failure(
            error_status(&e),
            "Failed to clean exports",
            Some(e.to_string()),
        ),
    }
}

#[put("/advance-queue")]
async fn advance_queue(_operator: Operator, state: &State<AppState>) -> ApiResponse {
    match state.reconciler.tick().await {
        Ok(()) => success("Queue advancing completed"),
        Err(e) => failure(
            error_status(&e),
            "Queue advancing failed",
            Some(e.to_string()),
        ),
    }
}

#[launch]
fn rocket() -> _ {
    tracing_subscriber::fmt::init();

    let figment = rocket::Config::figment();
    let settings: Settings = figment
        .extract_inner("annoq")
        .unwrap_or_else(|_| Settings::default());

    tracing::info!(
        remote_host = %settings.remote_host,
        workers = settings.workers,
        "starting corpus annotation job coordinator"
    );
    let executor = Arc::new(SshExecutor::new(&settings));
    let storage = Arc::new(LocalStorage::new(settings.storage_dir.clone()));
    let frequency = settings.check_queue_frequency;
    let manager = Arc::new(
        JobManager::new(settings, executor, storage).expect("failed to initialize job manager"),
    );
    let app_state = AppState::new(manager);
    let reconciler = app_state.reconciler.clone();

    let mut rocket = rocket::build().manage(app_state).mount(
        "/",
        routes![
            index,
            run_job,
            install_job,
            list_jobs,
            job_status,
            abort_job,
            remove_job,
            clean_annotations,
            clean_exports,
            advance_queue
        ],
    );
    if frequency > 0 {
        rocket = rocket.attach(AdHoc::on_liftoff("queue reconciler", move |_| {
            Box::pin(async move {
                tokio::spawn(reconciler.run(Duration::from_secs(frequency)));
            })
        }));
    }
    rocket
}
