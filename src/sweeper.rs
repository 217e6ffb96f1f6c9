use std::time::Duration as StdDuration;

use sqlx::PgPool;
use tokio::time;
use tracing::{info, warn};

use crate::config;

/// Spawn the periodic expiry sweeper. Each tick is idempotent; a failing
/// sweep logs and waits for the next tick.
pub fn spawn(pool: PgPool) {
    tokio::spawn(async move {
        let mut ticker = time::interval(StdDuration::from_secs(*config::SWEEP_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            if let Err(err) = sweep(&pool).await {
                warn!(?err, "expiry sweeper tick failed");
            }
        }
    });
}

pub async fn sweep(pool: &PgPool) -> Result<(), sqlx::Error> {
    let confirmation_timeout = *config::CONFIRMATION_TIMEOUT_SECS;
    let timed_out = sweep_stale_planned_runs(pool, confirmation_timeout).await?;
    let expired = sweep_stale_environment_runs(pool, confirmation_timeout).await?;
    let pruned = sweep_old_evaluations(pool, *config::EVALUATION_RETENTION_DAYS).await?;
    if timed_out > 0 || expired > 0 || pruned > 0 {
        info!(timed_out, expired, pruned, "expiry sweep completed");
    }
    Ok(())
}

/// Standalone planned runs waiting for confirmation past the timeout become
/// `timed_out`. Runs inside an environment run are the parent's business.
pub async fn sweep_stale_planned_runs(
    pool: &PgPool,
    confirmation_timeout_secs: i64,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE module_runs SET status = 'timed_out', completed_at = NOW(), updated_at = NOW()
        WHERE status = 'planned'
          AND environment_run_id IS NULL
          AND updated_at < NOW() - make_interval(secs => $1::double precision)
        "#,
    )
    .bind(confirmation_timeout_secs)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Environment runs stuck in `planned` or `running` past the timeout are
/// expired along with their unsettled member runs.
pub async fn sweep_stale_environment_runs(
    pool: &PgPool,
    confirmation_timeout_secs: i64,
) -> Result<u64, sqlx::Error> {
    let stale: Vec<i64> = sqlx::query_scalar(
        r#"
        SELECT id FROM environment_runs
        WHERE status IN ('planned', 'running')
          AND updated_at < NOW() - make_interval(secs => $1::double precision)
        "#,
    )
    .bind(confirmation_timeout_secs)
    .fetch_all(pool)
    .await?;

    for env_run_id in &stale {
        sqlx::query(
            "UPDATE module_runs SET status = 'timed_out', queue_position = NULL, \
             completed_at = NOW(), updated_at = NOW() \
             WHERE environment_run_id = $1 AND status IN \
             ('pending', 'queued', 'running', 'planned', 'confirmed', 'applying')",
        )
        .bind(env_run_id)
        .execute(pool)
        .await?;
        sqlx::query(
            "UPDATE environment_runs SET status = 'expired', completed_at = NOW(), \
             duration_seconds = EXTRACT(EPOCH FROM (NOW() - created_at))::int, \
             updated_at = NOW() WHERE id = $1 AND status IN ('planned', 'running')",
        )
        .bind(env_run_id)
        .execute(pool)
        .await?;
    }
    Ok(stale.len() as u64)
}

/// Policy evaluation rows age out after the retention window.
pub async fn sweep_old_evaluations(
    pool: &PgPool,
    retention_days: i64,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "DELETE FROM policy_evaluations \
         WHERE created_at < NOW() - make_interval(days => $1::int)",
    )
    .bind(retention_days as i32)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
