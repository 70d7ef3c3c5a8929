use core::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};

use chrono::TimeDelta;

use crate::{
    dispatch,
    mail::Mailer,
    portal::{PortalSource, ScrapeStats, scrape_with},
    subscription, tender,
};

pub const DEFAULT_PAGES: u32 = 5;
pub const LOOKBACK_HOURS: i64 = 24;
pub const DISPATCH_BATCH: i64 = 200;

static RUNNING: AtomicBool = AtomicBool::new(false);

/// Raised by a trigger that arrives while a run is in flight. Never
/// queued, never silently dropped.
#[derive(Debug)]
pub struct AlreadyRunning;

impl fmt::Display for AlreadyRunning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("pipeline already running")
    }
}

impl std::error::Error for AlreadyRunning {}

/// Process-wide single-flight guard. In-memory only: a crashed process
/// leaves no persisted lock, so a fresh process starts Idle. Released on
/// drop, which also covers a panicking stage.
pub struct RunGuard(());

impl RunGuard {
    pub fn acquire() -> Option<Self> {
        RUNNING
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            .then_some(Self(()))
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        RUNNING.store(false, Ordering::Release);
    }
}

/// The four stages, strictly in order: scrape, reconcile, build queue,
/// process queue. A scrape that cannot reach the listing is fatal for the
/// run; later stages only log their failures — there is no rollback
/// coupling between stages, and the partial counters still come back.
pub async fn run(mailer: &impl Mailer, pages: u32, today_only: bool) -> anyhow::Result<ScrapeStats> {
    let Some(_guard) = RunGuard::acquire() else {
        return Err(AlreadyRunning.into());
    };

    tracing::info!(target: "pipeline", "run start: pages = {pages}, today_only = {today_only}");

    let mut source = PortalSource::open(true)?;
    let stats = scrape_with(&mut source, pages, today_only).await?;
    drop(source);
    tracing::info!(
        target: "pipeline",
        "scrape done: +{}, dup {}, filtered {}",
        stats.added,
        stats.duplicate_skipped,
        stats.date_filtered_skipped,
    );

    match tender::reconcile_expired().await {
        Ok(n) => tracing::info!(target: "pipeline", "{n} records flipped to EXPIRED"),
        Err(e) => tracing::error!(target: "pipeline", "expiry reconcile failed: {e}"),
    }

    match subscription::build_queue(TimeDelta::hours(LOOKBACK_HOURS)).await {
        Ok(n) => tracing::info!(target: "pipeline", "{n} dispatch rows queued"),
        Err(e) => tracing::error!(target: "pipeline", "queue build failed: {e}"),
    }

    match dispatch::process_queue(mailer, DISPATCH_BATCH).await {
        Ok(n) => tracing::info!(target: "pipeline", "{n} alert emails worth of rows sent"),
        Err(e) => tracing::error!(target: "pipeline", "queue processing failed: {e}"),
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_is_single_flight_and_released_on_drop() {
        let first = RunGuard::acquire();
        assert!(first.is_some());
        assert!(RunGuard::acquire().is_none());

        drop(first);
        let again = RunGuard::acquire();
        assert!(again.is_some());
    }

    #[test]
    fn already_running_is_detectable_through_anyhow() {
        let err: anyhow::Error = AlreadyRunning.into();
        assert!(err.is::<AlreadyRunning>());
        assert_eq!(err.to_string(), "pipeline already running");
    }
}
