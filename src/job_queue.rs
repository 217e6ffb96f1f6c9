use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgPool, Row};
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::time::{sleep, Duration};

use crate::cascade;

/// Fire-and-forget work dispatched off the request path. Jobs are persisted
/// so a restart replays anything that never ran.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Job {
    CascadePlans { artifact_id: i32, version: String },
    RecordDownload { artifact_id: i32 },
}

pub async fn enqueue_job(pool: &PgPool, job: &Job) {
    if let Ok(payload) = serde_json::to_value(job) {
        let _ = sqlx::query("INSERT INTO job_queue (payload) VALUES ($1)")
            .bind(payload)
            .execute(pool)
            .await;
    }
}

/// Enqueue durably and hand the job to the in-process worker. A full channel
/// is tolerated; the replay loop will pick the row up again.
pub async fn dispatch(pool: &PgPool, tx: &Sender<Job>, job: Job) {
    enqueue_job(pool, &job).await;
    if let Err(err) = tx.send(job).await {
        tracing::warn!(?err, "job channel closed; relying on replay loop");
    }
}

pub fn start_worker(pool: PgPool) -> Sender<Job> {
    let (tx, mut rx): (Sender<Job>, Receiver<Job>) = channel(64);

    // Replay queued jobs from the database on startup and as a safety net.
    let db_pool = pool.clone();
    let replay_tx = tx.clone();
    tokio::spawn(async move {
        loop {
            let rows =
                sqlx::query("SELECT id, payload FROM job_queue WHERE status = 'queued' ORDER BY id")
                    .fetch_all(&db_pool)
                    .await
                    .unwrap_or_default();
            for row in rows {
                let id: i32 = row.get("id");
                let payload: Value = row.get("payload");
                if let Ok(job) = serde_json::from_value::<Job>(payload) {
                    let _ = sqlx::query("UPDATE job_queue SET status = 'processing' WHERE id = $1")
                        .bind(id)
                        .execute(&db_pool)
                        .await;
                    let _ = replay_tx.send(job).await;
                    let _ = sqlx::query("DELETE FROM job_queue WHERE id = $1")
                        .bind(id)
                        .execute(&db_pool)
                        .await;
                }
            }
            sleep(Duration::from_secs(5)).await;
        }
    });

    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            match job {
                Job::CascadePlans {
                    artifact_id,
                    version,
                } => {
                    let db = pool.clone();
                    tokio::spawn(async move {
                        match cascade::enqueue_cascade_plans(&db, artifact_id, &version).await {
                            Ok(count) => {
                                tracing::info!(
                                    %artifact_id,
                                    %version,
                                    %count,
                                    "cascade plans enqueued",
                                );
                            }
                            Err(err) => {
                                tracing::warn!(?err, %artifact_id, "cascade fan-out failed");
                            }
                        }
                    });
                }
                Job::RecordDownload { artifact_id } => {
                    let db = pool.clone();
                    tokio::spawn(async move {
                        let result = sqlx::query(
                            "UPDATE artifacts SET download_count = download_count + 1 WHERE id = $1",
                        )
                        .bind(artifact_id)
                        .execute(&db)
                        .await;
                        if let Err(err) = result {
                            tracing::warn!(?err, %artifact_id, "download count update failed");
                        }
                    });
                }
            }
        }
    });
    tx
}
