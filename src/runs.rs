use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, PgPool};

use crate::environments::{ensure_unlocked, load_environment};
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::modules::{load_module, ExecutionMode};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "run_operation", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunOperation {
    Plan,
    Apply,
    Destroy,
    Validate,
    Test,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "run_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Queued,
    Running,
    Planned,
    Confirmed,
    Applying,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
    Discarded,
    Skipped,
}

impl RunStatus {
    /// Terminal states never progress again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded
                | RunStatus::Failed
                | RunStatus::Cancelled
                | RunStatus::TimedOut
                | RunStatus::Discarded
                | RunStatus::Skipped
        )
    }

    /// States that occupy the module's single active slot.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            RunStatus::Running | RunStatus::Planned | RunStatus::Confirmed | RunStatus::Applying
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "run_priority", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunPriority {
    User,
    Cascade,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ModuleRun {
    pub id: i64,
    pub module_id: i32,
    pub environment_id: i32,
    pub environment_run_id: Option<i64>,
    pub operation: RunOperation,
    pub mode: ExecutionMode,
    pub status: RunStatus,
    pub priority: RunPriority,
    pub queue_position: Option<i32>,
    pub version: Option<String>,
    #[serde(skip_serializing)]
    pub callback_token_hash: Option<String>,
    #[serde(skip_serializing)]
    pub variables_snapshot: Option<Value>,
    #[serde(skip_serializing)]
    pub env_vars_snapshot: Option<Value>,
    #[serde(skip_serializing)]
    pub state_backend_snapshot: Option<Value>,
    pub tf_outputs: Option<Value>,
    pub resources_to_add: Option<i32>,
    pub resources_to_change: Option<i32>,
    pub resources_to_destroy: Option<i32>,
    pub resource_count_after: Option<i32>,
    pub plan_summary: Option<String>,
    pub exit_code: Option<i32>,
    pub skip_reason: Option<String>,
    pub created_by: Option<i32>,
    pub confirmed_by: Option<i32>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const RUN_COLUMNS: &str = "id, module_id, environment_id, environment_run_id, operation, \
     mode, status, priority, queue_position, version, callback_token_hash, variables_snapshot, \
     env_vars_snapshot, state_backend_snapshot, tf_outputs, resources_to_add, \
     resources_to_change, resources_to_destroy, resource_count_after, plan_summary, exit_code, \
     skip_reason, created_by, confirmed_by, confirmed_at, queued_at, started_at, completed_at, \
     duration_seconds, created_at, updated_at";

/// Everything needed to create one run. DAG-spawned runs pass
/// `hold_pending = true` so they wait for their upstreams.
#[derive(Debug, Clone)]
pub struct NewModuleRun {
    pub module_id: i32,
    pub environment_id: i32,
    pub environment_run_id: Option<i64>,
    pub operation: RunOperation,
    pub mode: ExecutionMode,
    pub priority: RunPriority,
    pub version: Option<String>,
    pub created_by: Option<i32>,
    pub hold_pending: bool,
}

#[derive(Debug)]
pub struct CreatedRun {
    pub run: ModuleRun,
    /// Returned exactly once at creation; only the hash is stored.
    pub callback_token: Option<String>,
}

/// Insert a run, enforcing the per-module queue discipline: at most one run
/// is available or active at a time, later arrivals queue behind it, and
/// queued cascade runs coalesce latest-wins.
pub async fn create_module_run(pool: &PgPool, new: NewModuleRun) -> AppResult<CreatedRun> {
    let module = crate::modules::load_module_by_id(pool, new.module_id).await?;
    let (variables_snapshot, env_vars_snapshot, state_backend_snapshot) =
        crate::variables::resolve_run_snapshots(pool, &module).await?;

    let (callback_token, callback_token_hash) = if new.mode == ExecutionMode::Byoc {
        let (token, hash) = crate::byoc::generate_callback_token();
        (Some(token), Some(hash))
    } else {
        (None, None)
    };

    let mut tx = pool.begin().await?;
    // Serialize queue mutations per module.
    sqlx::query("SELECT id FROM environment_modules WHERE id = $1 FOR UPDATE")
        .bind(new.module_id)
        .fetch_one(&mut *tx)
        .await?;

    if new.priority == RunPriority::Cascade {
        // Latest-wins coalescing: older queued cascade plans are superseded.
        sqlx::query(
            "DELETE FROM module_runs WHERE module_id = $1 AND status = 'queued' \
             AND priority = 'cascade'",
        )
        .bind(new.module_id)
        .execute(&mut *tx)
        .await?;
    }

    let (status, queue_position, queued_at): (RunStatus, Option<i32>, Option<DateTime<Utc>>) =
        if new.hold_pending {
            (RunStatus::Pending, None, None)
        } else {
            let blocking: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM module_runs WHERE module_id = $1 \
                 AND status IN ('queued', 'running', 'planned', 'confirmed', 'applying')",
            )
            .bind(new.module_id)
            .fetch_one(&mut *tx)
            .await?;
            if blocking == 0 {
                (RunStatus::Queued, None, Some(Utc::now()))
            } else {
                let next_position: i32 = sqlx::query_scalar(
                    "SELECT COALESCE(MAX(queue_position), 0) + 1 FROM module_runs \
                     WHERE module_id = $1 AND status = 'queued' AND queue_position IS NOT NULL",
                )
                .bind(new.module_id)
                .fetch_one(&mut *tx)
                .await?;
                (RunStatus::Queued, Some(next_position), None)
            }
        };

    let query = format!(
        "INSERT INTO module_runs (module_id, environment_id, environment_run_id, operation, \
         mode, status, priority, queue_position, version, callback_token_hash, \
         variables_snapshot, env_vars_snapshot, state_backend_snapshot, created_by, queued_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
         RETURNING {RUN_COLUMNS}"
    );
    let run = sqlx::query_as::<_, ModuleRun>(&query)
        .bind(new.module_id)
        .bind(new.environment_id)
        .bind(new.environment_run_id)
        .bind(new.operation)
        .bind(new.mode)
        .bind(status)
        .bind(new.priority)
        .bind(queue_position)
        .bind(new.version.as_deref())
        .bind(callback_token_hash.as_deref())
        .bind(&variables_snapshot)
        .bind(&env_vars_snapshot)
        .bind(state_backend_snapshot.as_ref())
        .bind(new.created_by)
        .bind(queued_at)
        .fetch_one(&mut *tx)
        .await?;
    tx.commit().await?;

    Ok(CreatedRun {
        run,
        callback_token,
    })
}

/// Promote the next waiting run once the module's slot frees up. Picks the
/// smallest (user-priority-first, queue_position) row, clears its position,
/// and compacts the rest of the queue.
pub async fn dequeue_next_module_run(
    pool: &PgPool,
    module_id: i32,
) -> AppResult<Option<ModuleRun>> {
    let mut tx = pool.begin().await?;
    sqlx::query("SELECT id FROM environment_modules WHERE id = $1 FOR UPDATE")
        .bind(module_id)
        .fetch_one(&mut *tx)
        .await?;

    let occupied: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM module_runs WHERE module_id = $1 \
         AND (status IN ('running', 'planned', 'confirmed', 'applying') \
              OR (status = 'queued' AND queue_position IS NULL))",
    )
    .bind(module_id)
    .fetch_one(&mut *tx)
    .await?;
    if occupied > 0 {
        tx.rollback().await?;
        return Ok(None);
    }

    let query = format!(
        "SELECT {RUN_COLUMNS} FROM module_runs \
         WHERE module_id = $1 AND status = 'queued' AND queue_position IS NOT NULL \
         ORDER BY CASE priority WHEN 'user' THEN 0 ELSE 1 END, queue_position \
         LIMIT 1 FOR UPDATE"
    );
    let head = sqlx::query_as::<_, ModuleRun>(&query)
        .bind(module_id)
        .fetch_optional(&mut *tx)
        .await?;
    let Some(head) = head else {
        tx.rollback().await?;
        return Ok(None);
    };

    let promote = format!(
        "UPDATE module_runs SET queue_position = NULL, queued_at = NOW(), updated_at = NOW() \
         WHERE id = $1 RETURNING {RUN_COLUMNS}"
    );
    let promoted = sqlx::query_as::<_, ModuleRun>(&promote)
        .bind(head.id)
        .fetch_one(&mut *tx)
        .await?;

    sqlx::query(
        "UPDATE module_runs SET queue_position = queue_position - 1, updated_at = NOW() \
         WHERE module_id = $1 AND status = 'queued' AND queue_position > $2",
    )
    .bind(module_id)
    .bind(head.queue_position.unwrap_or(0))
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(Some(promoted))
}

pub async fn load_run(pool: &PgPool, run_id: i64) -> AppResult<ModuleRun> {
    let query = format!("SELECT {RUN_COLUMNS} FROM module_runs WHERE id = $1");
    let run = sqlx::query_as::<_, ModuleRun>(&query)
        .bind(run_id)
        .fetch_optional(pool)
        .await?;
    run.ok_or_else(|| AppError::not_found("RUN_NOT_FOUND", "Run not found"))
}

/// Team-scoped run lookup for management endpoints.
async fn load_run_for_team(pool: &PgPool, run_id: i64, team: &str) -> AppResult<ModuleRun> {
    let run = load_run(pool, run_id).await?;
    let owner: Option<String> =
        sqlx::query_scalar("SELECT team FROM environments WHERE id = $1")
            .bind(run.environment_id)
            .fetch_optional(pool)
            .await?;
    if owner.as_deref() != Some(team) {
        return Err(AppError::not_found("RUN_NOT_FOUND", "Run not found"));
    }
    Ok(run)
}

#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    pub operation: RunOperation,
    pub version: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreatedRunResponse {
    pub run: ModuleRun,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub after_sequence: Option<i32>,
}

#[derive(Debug, Serialize, FromRow)]
pub struct RunLogLine {
    pub sequence: i32,
    pub stream: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

pub fn routes() -> Router {
    Router::new()
        .route(
            "/v1/environments/:id/modules/:module_id/runs",
            get(list_module_runs).post(create_run_handler),
        )
        .route("/v1/module-runs/:id", get(get_run_handler))
        .route("/v1/module-runs/:id/logs", get(get_run_logs))
        .route("/v1/module-runs/:id/plan", get(get_run_plan))
        .route("/v1/module-runs/:id/outputs", get(get_run_outputs))
        .route("/v1/module-runs/:id/confirm", post(confirm_run))
        .route("/v1/module-runs/:id/discard", post(discard_run))
        .route("/v1/module-runs/:id/cancel", post(cancel_run))
}

async fn list_module_runs(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path((environment_id, module_id)): Path<(i32, i32)>,
    Query(params): Query<ListRunsQuery>,
) -> AppResult<Json<Vec<ModuleRun>>> {
    let environment = load_environment(&pool, environment_id, &team).await?;
    let module = load_module(&pool, environment.id, module_id).await?;
    let limit = crate::pagination::page_limit(params.limit);
    let query = format!(
        "SELECT {RUN_COLUMNS} FROM module_runs WHERE module_id = $1 \
         ORDER BY created_at DESC, id DESC LIMIT $2"
    );
    let runs = sqlx::query_as::<_, ModuleRun>(&query)
        .bind(module.id)
        .bind(limit)
        .fetch_all(&pool)
        .await?;
    Ok(Json(runs))
}

async fn create_run_handler(
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id, team, .. }: AuthUser,
    Path((environment_id, module_id)): Path<(i32, i32)>,
    Json(payload): Json<CreateRunRequest>,
) -> AppResult<(StatusCode, Json<CreatedRunResponse>)> {
    let environment = load_environment(&pool, environment_id, &team).await?;
    ensure_unlocked(&environment)?;
    let module = load_module(&pool, environment.id, module_id).await?;

    let version = payload
        .version
        .or_else(|| module.pinned_version.clone())
        .or_else(|| module.current_version.clone());

    let created = create_module_run(
        &pool,
        NewModuleRun {
            module_id: module.id,
            environment_id: environment.id,
            environment_run_id: None,
            operation: payload.operation,
            mode: module.execution_mode,
            priority: RunPriority::User,
            version,
            created_by: Some(user_id),
            hold_pending: false,
        },
    )
    .await?;

    tracing::info!(
        run_id = created.run.id,
        module_id = module.id,
        operation = ?created.run.operation,
        "module run created"
    );
    Ok((
        StatusCode::CREATED,
        Json(CreatedRunResponse {
            run: created.run,
            callback_token: created.callback_token,
        }),
    ))
}

async fn get_run_handler(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path(run_id): Path<i64>,
) -> AppResult<Json<ModuleRun>> {
    let run = load_run_for_team(&pool, run_id, &team).await?;
    Ok(Json(run))
}

async fn get_run_logs(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path(run_id): Path<i64>,
    Query(params): Query<LogsQuery>,
) -> AppResult<Json<Vec<RunLogLine>>> {
    let run = load_run_for_team(&pool, run_id, &team).await?;
    let lines = sqlx::query_as::<_, RunLogLine>(
        "SELECT sequence, stream, content, created_at FROM module_run_logs \
         WHERE run_id = $1 AND sequence > $2 ORDER BY sequence",
    )
    .bind(run.id)
    .bind(params.after_sequence.unwrap_or(-1))
    .fetch_all(&pool)
    .await?;
    Ok(Json(lines))
}

async fn get_run_plan(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path(run_id): Path<i64>,
) -> AppResult<Json<Value>> {
    let run = load_run_for_team(&pool, run_id, &team).await?;
    let plan_text: Option<Value> = sqlx::query_scalar(
        "SELECT content FROM module_run_outputs WHERE run_id = $1 AND output_type = 'plan_text'",
    )
    .bind(run.id)
    .fetch_optional(&pool)
    .await?;
    let plan_json: Option<Value> = sqlx::query_scalar(
        "SELECT content FROM module_run_outputs WHERE run_id = $1 AND output_type = 'plan_json'",
    )
    .bind(run.id)
    .fetch_optional(&pool)
    .await?;
    if plan_text.is_none() && plan_json.is_none() {
        return Err(AppError::not_found("PLAN_NOT_FOUND", "No plan recorded"));
    }
    Ok(Json(serde_json::json!({
        "plan_text": plan_text,
        "plan_json": plan_json,
        "plan_summary": run.plan_summary,
        "resources_to_add": run.resources_to_add,
        "resources_to_change": run.resources_to_change,
        "resources_to_destroy": run.resources_to_destroy,
    })))
}

async fn get_run_outputs(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path(run_id): Path<i64>,
) -> AppResult<Json<Value>> {
    let run = load_run_for_team(&pool, run_id, &team).await?;
    Ok(Json(run.tf_outputs.unwrap_or(Value::Null)))
}

async fn confirm_run(
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id, team, .. }: AuthUser,
    Path(run_id): Path<i64>,
) -> AppResult<Json<ModuleRun>> {
    let run = load_run_for_team(&pool, run_id, &team).await?;
    if run.environment_run_id.is_some() {
        return Err(AppError::Conflict(
            "Run belongs to an environment run; confirm the environment run instead".into(),
        ));
    }
    match run.status {
        RunStatus::Planned => {}
        RunStatus::TimedOut => {
            return Err(AppError::Gone("Plan expired before confirmation".into()))
        }
        other => {
            return Err(AppError::Conflict(format!(
                "Run is {:?}, only planned runs can be confirmed",
                other
            )))
        }
    }

    let query = format!(
        "UPDATE module_runs SET status = 'confirmed', confirmed_by = $2, confirmed_at = NOW(), \
         updated_at = NOW() WHERE id = $1 AND status = 'planned' RETURNING {RUN_COLUMNS}"
    );
    let updated = sqlx::query_as::<_, ModuleRun>(&query)
        .bind(run.id)
        .bind(user_id)
        .fetch_optional(&pool)
        .await?;
    updated
        .map(Json)
        .ok_or_else(|| AppError::Conflict("Run state changed concurrently".into()))
}

async fn discard_run(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path(run_id): Path<i64>,
) -> AppResult<Json<ModuleRun>> {
    let run = load_run_for_team(&pool, run_id, &team).await?;
    if run.status != RunStatus::Planned {
        return Err(AppError::Conflict(format!(
            "Run is {:?}, only planned runs can be discarded",
            run.status
        )));
    }
    let query = format!(
        "UPDATE module_runs SET status = 'discarded', completed_at = NOW(), updated_at = NOW() \
         WHERE id = $1 AND status = 'planned' RETURNING {RUN_COLUMNS}"
    );
    let updated = sqlx::query_as::<_, ModuleRun>(&query)
        .bind(run.id)
        .fetch_optional(&pool)
        .await?
        .ok_or_else(|| AppError::Conflict("Run state changed concurrently".into()))?;

    dequeue_next_module_run(&pool, run.module_id).await?;
    Ok(Json(updated))
}

async fn cancel_run(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path(run_id): Path<i64>,
) -> AppResult<Json<ModuleRun>> {
    let run = load_run_for_team(&pool, run_id, &team).await?;
    if run.status.is_terminal() {
        return Err(AppError::Conflict(format!(
            "Run already {:?}",
            run.status
        )));
    }

    let query = format!(
        "UPDATE module_runs SET status = 'cancelled', queue_position = NULL, \
         completed_at = NOW(), updated_at = NOW() WHERE id = $1 RETURNING {RUN_COLUMNS}"
    );
    let updated = sqlx::query_as::<_, ModuleRun>(&query)
        .bind(run.id)
        .fetch_one(&pool)
        .await?;

    // Compact the queue behind the cancelled entry.
    if let Some(position) = run.queue_position {
        sqlx::query(
            "UPDATE module_runs SET queue_position = queue_position - 1, updated_at = NOW() \
             WHERE module_id = $1 AND status = 'queued' AND queue_position > $2",
        )
        .bind(run.module_id)
        .bind(position)
        .execute(&pool)
        .await?;
    }

    if updated.environment_run_id.is_some() {
        crate::dag::on_module_run_transition(&pool, &updated).await?;
    }
    dequeue_next_module_run(&pool, run.module_id).await?;

    tracing::info!(run_id = run.id, "module run cancelled");
    Ok(Json(updated))
}
