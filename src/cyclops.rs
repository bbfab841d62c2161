//! The background reconciliation loop (spec C8).
//!
//! The reconcile body is an intentional stub (spec §9 Open Questions: "the
//! Cyclops reconcile body is a stub in the source ... the rewrite must state
//! that no action is guaranteed beyond reading the schedule until a concrete
//! reconciliation contract is specified"). This rewrite does not invent
//! semantics beyond that.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Timelike;

use crate::config::Config;

/// Wakes at the start of every minute, reads the schedule file (creating it
/// as `[]` if absent), logs a reconcile line, and recomputes the next wake
/// from wall-clock `now` so drift never accumulates (spec §4.8, Testable
/// Property #7).
pub async fn run(config: Arc<Config>) -> anyhow::Result<()> {
    ensure_schedule_file(&config).await?;

    loop {
        let sleep_for = time_until_next_minute_boundary();
        tokio::time::sleep(sleep_for).await;

        let schedule = read_schedule(&config).await.unwrap_or_default();
        tracing::info!(entries = schedule.len(), "cyclops reconcile");
    }
}

async fn ensure_schedule_file(config: &Config) -> anyhow::Result<()> {
    let path = config.schedule_file();
    if !path.is_file() {
        crate::catalog::atomic_write(&path, b"[]").await.context("initializing cyclops schedule file")?;
    }
    Ok(())
}

async fn read_schedule(config: &Config) -> anyhow::Result<Vec<serde_json::Value>> {
    let path = config.schedule_file();
    let text = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading cyclops schedule {}", path.display()))?;
    serde_json::from_str(&text).context("cyclops schedule is not a JSON array")
}

/// Rounds up to the next minute boundary, zeroing seconds and
/// sub-second components (spec §4.8). Always recomputed from `now`, never
/// from a previous target, so drift never accumulates.
fn time_until_next_minute_boundary() -> Duration {
    let now = chrono::Utc::now().naive_utc();
    let truncated = now.date().and_hms_opt(now.hour(), now.minute(), 0).unwrap_or(now);
    let next = truncated + chrono::Duration::minutes(1);
    (next - now).to_std().unwrap_or(Duration::from_secs(1))
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn ensure_schedule_file_creates_an_empty_array() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path(), None).unwrap();
        ensure_schedule_file(&config).await.unwrap();
        let text = tokio::fs::read_to_string(config.schedule_file()).await.unwrap();
        assert_eq!("[]", text);
    }

    #[tokio::test]
    async fn ensure_schedule_file_is_idempotent_over_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path(), None).unwrap();
        crate::catalog::atomic_write(&config.schedule_file(), br#"[{"id":"x"}]"#).await.unwrap();
        ensure_schedule_file(&config).await.unwrap();
        let schedule = read_schedule(&config).await.unwrap();
        assert_eq!(1, schedule.len());
    }

    #[test]
    fn next_minute_boundary_is_never_more_than_sixty_seconds_out() {
        let d = time_until_next_minute_boundary();
        assert!(d.as_secs() <= 60);
    }
}
