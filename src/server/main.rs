use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post},
    serve,
};
use serde::Deserialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tower_http::cors::CorsLayer;
use tscr::{
    mail::HttpMailer,
    pipeline::{self, AlreadyRunning, DEFAULT_PAGES},
    portal::ScrapeStats,
};

#[derive(Deserialize)]
#[serde(default)]
struct TriggerParams {
    pages: u32,
    today_only: bool,
}

impl Default for TriggerParams {
    fn default() -> Self {
        Self {
            pages: DEFAULT_PAGES,
            today_only: true,
        }
    }
}

async fn health() -> &'static str {
    "ok"
}

/// Manual trigger. Partial per-record failures still come back as
/// counters; only "already running" and an unreachable listing turn into
/// error responses.
async fn trigger(
    State(mailer): State<Arc<HttpMailer>>,
    params: Option<Json<TriggerParams>>,
) -> Result<Json<ScrapeStats>, (StatusCode, Json<serde_json::Value>)> {
    let Json(params) = params.unwrap_or_default();

    match pipeline::run(&*mailer, params.pages, params.today_only).await {
        Ok(stats) => Ok(Json(stats)),
        Err(e) if e.is::<AlreadyRunning>() => Err((
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": "pipeline already running" })),
        )),
        Err(e) => {
            tracing::error!(target: "server", "manual run failed: {e}");
            Err((
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({ "error": e.to_string() })),
            ))
        }
    }
}

async fn schedule_recurring(mailer: Arc<HttpMailer>) -> anyhow::Result<JobScheduler> {
    let schedule = std::env::var("PIPELINE_CRON").unwrap_or_else(|_| "0 0 * * * *".to_owned());

    let scheduler = JobScheduler::new().await?;
    let job = Job::new_async(schedule.as_str(), move |_uuid, _lock| {
        let mailer = Arc::clone(&mailer);
        Box::pin(async move {
            // Scheduled ticks always scan from the start of the current
            // day; a tick that lands mid-run is skipped, not queued.
            match pipeline::run(&*mailer, DEFAULT_PAGES, true).await {
                Ok(stats) => tracing::info!(
                    target: "scheduler",
                    "tick done: +{}, dup {}, filtered {}",
                    stats.added,
                    stats.duplicate_skipped,
                    stats.date_filtered_skipped,
                ),
                Err(e) if e.is::<AlreadyRunning>() => {
                    tracing::warn!(target: "scheduler", "tick skipped: already running");
                }
                Err(e) => tracing::error!(target: "scheduler", "tick failed: {e}"),
            }
        })
    })?;
    scheduler.add(job).await?;
    scheduler.start().await?;

    tracing::info!(target: "scheduler", "recurring trigger at \x1b[1;36m{schedule}\x1b[0m");
    Ok(scheduler)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init_timed();
    tscr::db::init_db().await;

    let mailer = Arc::new(HttpMailer::from_env()?);
    let _scheduler = schedule_recurring(Arc::clone(&mailer)).await?;

    let app: Router = Router::new()
        .route("/health", get(health))
        .route("/trigger", post(trigger))
        .layer(CorsLayer::very_permissive().allow_private_network(true))
        .with_state(mailer);

    let bind = std::env::var("BIND").unwrap_or_else(|_| "0.0.0.0:8180".to_owned());
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(target: "server", "listening on {bind}");
    serve(listener, app).await.map_err(Into::into)
}
