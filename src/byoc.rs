use axum::{
    extract::{Extension, Path},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use subtle::ConstantTimeEq;

use crate::artifacts::{KnownStorageConfig, StorageConfig};
use crate::error::{AppError, AppResult};
use crate::modules::EnvironmentModule;
use crate::runs::{
    dequeue_next_module_run, load_run, ModuleRun, RunOperation, RunStatus, RUN_COLUMNS,
};

/// Mint a runner callback token. The cleartext leaves the process exactly
/// once; only the SHA-256 digest is stored.
pub fn generate_callback_token() -> (String, String) {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    let token = format!("brce_{}", hex::encode(bytes));
    let hash = hash_callback_token(&token);
    (token, hash)
}

pub fn hash_callback_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn bearer_token(headers: &HeaderMap) -> AppResult<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|value| value.to_string())
        .ok_or_else(|| AppError::Unauthorized("Missing bearer token".into()))
}

/// Authenticate a callback against the run's stored token hash. Registry API
/// tokens are rejected outright; comparison is constant time.
async fn authenticate_callback(
    pool: &PgPool,
    run_id: i64,
    headers: &HeaderMap,
) -> AppResult<ModuleRun> {
    let token = bearer_token(headers)?;
    if !token.starts_with("brce_") {
        return Err(AppError::Unauthorized(
            "Callback endpoints require a brce_ token".into(),
        ));
    }
    let run = load_run(pool, run_id).await?;
    let Some(stored_hash) = run.callback_token_hash.as_deref() else {
        return Err(AppError::Unauthorized("Run has no callback token".into()));
    };
    let presented = hash_callback_token(&token);
    if presented.as_bytes().ct_eq(stored_hash.as_bytes()).unwrap_u8() != 1 {
        return Err(AppError::Unauthorized("Invalid callback token".into()));
    }
    Ok(run)
}

/// Terminal states a runner can never progress past.
fn ensure_progressive(run: &ModuleRun) -> AppResult<()> {
    if matches!(
        run.status,
        RunStatus::Cancelled | RunStatus::TimedOut | RunStatus::Discarded | RunStatus::Skipped
    ) {
        return Err(AppError::Conflict(format!(
            "Run is {:?} and no longer accepts callbacks",
            run.status
        )));
    }
    Ok(())
}

pub fn routes() -> Router {
    Router::new()
        .route(
            "/v1/ci/module-runs/:id/status",
            post(post_status).get(get_status),
        )
        .route("/v1/ci/module-runs/:id/logs", post(post_logs))
        .route("/v1/ci/module-runs/:id/plan", post(post_plan))
        .route("/v1/ci/module-runs/:id/outputs", post(post_outputs))
        .route("/v1/ci/module-runs/:id/config", get(get_config))
}

#[derive(Debug, Deserialize)]
pub struct StatusCallback {
    pub status: RunStatus,
    pub exit_code: Option<i32>,
    pub resources_to_add: Option<i32>,
    pub resources_to_change: Option<i32>,
    pub resources_to_destroy: Option<i32>,
    pub resource_count_after: Option<i32>,
    pub plan_summary: Option<String>,
    pub plan_json: Option<Value>,
    pub plan_text: Option<String>,
}

async fn post_status(
    Extension(pool): Extension<PgPool>,
    Path(run_id): Path<i64>,
    headers: HeaderMap,
    Json(payload): Json<StatusCallback>,
) -> AppResult<Json<ModuleRun>> {
    let run = authenticate_callback(&pool, run_id, &headers).await?;
    ensure_progressive(&run)?;

    if !matches!(
        payload.status,
        RunStatus::Running
            | RunStatus::Planned
            | RunStatus::Applying
            | RunStatus::Succeeded
            | RunStatus::Failed
    ) {
        return Err(AppError::BadRequest(format!(
            "Runners cannot report status {:?}",
            payload.status
        )));
    }

    // Duplicate reports are no-ops.
    if run.status == payload.status {
        return Ok(Json(run));
    }
    if run.status.is_terminal() {
        return Err(AppError::Conflict(format!(
            "Run already settled as {:?}",
            run.status
        )));
    }

    let query = format!(
        r#"
        UPDATE module_runs SET
            status = $2,
            exit_code = COALESCE($3, exit_code),
            resources_to_add = COALESCE($4, resources_to_add),
            resources_to_change = COALESCE($5, resources_to_change),
            resources_to_destroy = COALESCE($6, resources_to_destroy),
            resource_count_after = COALESCE($7, resource_count_after),
            plan_summary = COALESCE($8, plan_summary),
            started_at = CASE WHEN started_at IS NULL THEN NOW() ELSE started_at END,
            completed_at = CASE WHEN $9 THEN NOW() ELSE completed_at END,
            duration_seconds = CASE WHEN $9
                THEN EXTRACT(EPOCH FROM (NOW() - COALESCE(started_at, created_at)))::int
                ELSE duration_seconds END,
            updated_at = NOW()
        WHERE id = $1
        RETURNING {RUN_COLUMNS}
        "#
    );
    let terminal = matches!(payload.status, RunStatus::Succeeded | RunStatus::Failed);
    let updated = sqlx::query_as::<_, ModuleRun>(&query)
        .bind(run.id)
        .bind(payload.status)
        .bind(payload.exit_code)
        .bind(payload.resources_to_add)
        .bind(payload.resources_to_change)
        .bind(payload.resources_to_destroy)
        .bind(payload.resource_count_after)
        .bind(payload.plan_summary.as_deref())
        .bind(terminal)
        .fetch_one(&pool)
        .await?;

    if let Some(plan_text) = payload.plan_text.as_deref() {
        upsert_output(&pool, run.id, "plan_text", &json!(plan_text)).await?;
    }
    if let Some(plan_json) = payload.plan_json.as_ref() {
        upsert_output(&pool, run.id, "plan_json", plan_json).await?;
    }

    if terminal {
        finalize_module(&pool, &updated).await?;
    }

    if matches!(
        updated.status,
        RunStatus::Planned | RunStatus::Succeeded | RunStatus::Failed
    ) {
        if updated.environment_run_id.is_some() {
            crate::dag::on_module_run_transition(&pool, &updated).await?;
        }
        if terminal {
            dequeue_next_module_run(&pool, updated.module_id).await?;
        }
    }

    tracing::info!(
        run_id = updated.id,
        module_id = updated.module_id,
        status = ?updated.status,
        "runner status ingested"
    );
    Ok(Json(updated))
}

/// Terminal bookkeeping on the module row: last-run markers, the promoted
/// version, and resource counters.
async fn finalize_module(pool: &PgPool, run: &ModuleRun) -> AppResult<()> {
    let previous: Option<i32> =
        sqlx::query_scalar("SELECT resource_count FROM environment_modules WHERE id = $1")
            .bind(run.module_id)
            .fetch_optional(pool)
            .await?;

    sqlx::query(
        r#"
        UPDATE environment_modules SET
            last_run_id = $2,
            last_run_status = $3,
            last_run_at = NOW(),
            current_version = CASE WHEN $4 THEN $5 ELSE current_version END,
            resource_count = COALESCE($6, resource_count),
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(run.module_id)
    .bind(run.id)
    .bind(format!("{:?}", run.status).to_lowercase())
    .bind(run.status == RunStatus::Succeeded && run.version.is_some())
    .bind(run.version.as_deref())
    .bind(run.resource_count_after)
    .execute(pool)
    .await?;

    if let (Some(previous), Some(after)) = (previous, run.resource_count_after) {
        sqlx::query(
            "UPDATE environments SET \
             total_resources = GREATEST(total_resources + ($2 - $3), 0), updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(run.environment_id)
        .bind(after)
        .bind(previous)
        .execute(pool)
        .await?;
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct LogLineInput {
    pub sequence: i32,
    #[serde(default = "default_stream")]
    pub stream: String,
    pub content: String,
}

fn default_stream() -> String {
    "stdout".to_string()
}

async fn post_logs(
    Extension(pool): Extension<PgPool>,
    Path(run_id): Path<i64>,
    headers: HeaderMap,
    Json(lines): Json<Vec<LogLineInput>>,
) -> AppResult<Json<Value>> {
    let run = authenticate_callback(&pool, run_id, &headers).await?;
    ensure_progressive(&run)?;

    let mut tx = pool.begin().await?;
    for line in &lines {
        sqlx::query(
            "INSERT INTO module_run_logs (run_id, sequence, stream, content) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(run.id)
        .bind(line.sequence)
        .bind(&line.stream)
        .bind(&line.content)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(Json(json!({ "appended": lines.len() })))
}

#[derive(Debug, Deserialize)]
pub struct PlanCallback {
    pub plan_json: Option<Value>,
    pub plan_text: Option<String>,
}

async fn post_plan(
    Extension(pool): Extension<PgPool>,
    Path(run_id): Path<i64>,
    headers: HeaderMap,
    Json(payload): Json<PlanCallback>,
) -> AppResult<Json<Value>> {
    let run = authenticate_callback(&pool, run_id, &headers).await?;
    ensure_progressive(&run)?;
    if payload.plan_json.is_none() && payload.plan_text.is_none() {
        return Err(AppError::BadRequest(
            "plan_json or plan_text required".into(),
        ));
    }
    if let Some(plan_text) = payload.plan_text.as_deref() {
        upsert_output(&pool, run.id, "plan_text", &json!(plan_text)).await?;
    }
    if let Some(plan_json) = payload.plan_json.as_ref() {
        upsert_output(&pool, run.id, "plan_json", plan_json).await?;
    }
    Ok(Json(json!({ "stored": true })))
}

async fn post_outputs(
    Extension(pool): Extension<PgPool>,
    Path(run_id): Path<i64>,
    headers: HeaderMap,
    Json(raw): Json<Map<String, Value>>,
) -> AppResult<Json<Value>> {
    let run = authenticate_callback(&pool, run_id, &headers).await?;
    ensure_progressive(&run)?;

    let simplified = simplify_outputs(&raw);

    sqlx::query("UPDATE module_runs SET tf_outputs = $2, updated_at = NOW() WHERE id = $1")
        .bind(run.id)
        .bind(&simplified)
        .execute(&pool)
        .await?;
    upsert_output(&pool, run.id, "tf_outputs", &simplified).await?;
    upsert_output(&pool, run.id, "tf_outputs_raw", &Value::Object(raw)).await?;

    Ok(Json(json!({ "stored": true })))
}

/// Terraform output maps arrive as `{key: {value, type?, sensitive?}}`;
/// storage keeps the flat `{key: value}` form.
pub fn simplify_outputs(raw: &Map<String, Value>) -> Value {
    let mut simplified = Map::new();
    for (key, entry) in raw {
        let value = entry
            .as_object()
            .and_then(|object| object.get("value"))
            .cloned()
            .unwrap_or_else(|| entry.clone());
        simplified.insert(key.clone(), value);
    }
    Value::Object(simplified)
}

async fn upsert_output(
    pool: &PgPool,
    run_id: i64,
    output_type: &str,
    content: &Value,
) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO module_run_outputs (run_id, output_type, content)
        VALUES ($1, $2, $3)
        ON CONFLICT (run_id, output_type) DO UPDATE SET
            content = EXCLUDED.content,
            updated_at = NOW()
        "#,
    )
    .bind(run_id)
    .bind(output_type)
    .bind(content)
    .execute(pool)
    .await?;
    Ok(())
}

/// Cancellation poll. Terminal states come back as data here so the runner
/// can wind down, rather than as the 409 the mutating callbacks produce.
async fn get_status(
    Extension(pool): Extension<PgPool>,
    Path(run_id): Path<i64>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let run = authenticate_callback(&pool, run_id, &headers).await?;
    Ok(Json(json!({
        "id": run.id,
        "module_id": run.module_id,
        "operation": run.operation,
        "status": run.status,
    })))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSource {
    #[serde(rename = "type")]
    pub source_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_repo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionCallbacks {
    pub status: String,
    pub logs: String,
    pub plan: String,
    pub outputs: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionConfig {
    pub run_id: i64,
    pub module_id: i32,
    pub operation: RunOperation,
    pub tf_version: Option<String>,
    pub source: ExecutionSource,
    pub variables: Value,
    pub env_vars: Value,
    pub upstream_outputs: Value,
    pub state_backend: Option<Value>,
    pub callbacks: ExecutionCallbacks,
}

/// Resolve the checkout source: the module's VCS trigger wins, then the
/// artifact's source config, then a git storage backend.
fn resolve_source(
    module: &EnvironmentModule,
    source_config: Option<&Value>,
    storage_config: &Value,
) -> ExecutionSource {
    let trigger: crate::modules::VcsTrigger = module
        .vcs_trigger
        .as_ref()
        .and_then(|value| serde_json::from_value(value.clone()).ok())
        .unwrap_or_default();
    if let Some(repo) = trigger.repo {
        return ExecutionSource {
            source_type: "git".to_string(),
            git_repo: Some(repo),
            git_ref: trigger.branch,
            working_directory: trigger
                .working_directory
                .or_else(|| module.working_directory.clone()),
        };
    }

    if let Some(source) = source_config {
        let git_repo = source
            .get("git_repo")
            .or_else(|| source.get("gitRepo"))
            .and_then(Value::as_str);
        if let Some(repo) = git_repo {
            let git_ref = source
                .get("git_ref")
                .or_else(|| source.get("gitRef"))
                .and_then(Value::as_str);
            return ExecutionSource {
                source_type: "git".to_string(),
                git_repo: Some(repo.to_string()),
                git_ref: git_ref.map(str::to_string),
                working_directory: module.working_directory.clone(),
            };
        }
    }

    if let StorageConfig::Known(KnownStorageConfig::Git {
        repo,
        tag_prefix,
        path,
    }) = StorageConfig::from_value(storage_config)
    {
        return ExecutionSource {
            source_type: "git".to_string(),
            git_repo: Some(repo),
            git_ref: tag_prefix,
            working_directory: path.or_else(|| module.working_directory.clone()),
        };
    }

    ExecutionSource {
        source_type: "none".to_string(),
        git_repo: None,
        git_ref: None,
        working_directory: module.working_directory.clone(),
    }
}

/// The complete execution descriptor the runner works from. The response
/// body carries secret references, so only the run and module ids are
/// logged, never the payload.
async fn get_config(
    Extension(pool): Extension<PgPool>,
    Path(run_id): Path<i64>,
    headers: HeaderMap,
) -> AppResult<Json<ExecutionConfig>> {
    let run = authenticate_callback(&pool, run_id, &headers).await?;
    ensure_progressive(&run)?;

    let module = crate::modules::load_module_by_id(&pool, run.module_id).await?;
    let artifact: Option<(Option<Value>, Value)> = sqlx::query_as(
        "SELECT source_config, storage_config FROM artifacts WHERE id = $1",
    )
    .bind(module.artifact_id)
    .fetch_optional(&pool)
    .await?;
    let (source_config, storage_config) = artifact.unwrap_or((None, Value::Null));

    let (variables, env_vars) = match (&run.variables_snapshot, &run.env_vars_snapshot) {
        (Some(variables), Some(env_vars)) => (variables.clone(), env_vars.clone()),
        _ => {
            let (variables, env_vars, _) =
                crate::variables::resolve_run_snapshots(&pool, &module).await?;
            (variables, env_vars)
        }
    };
    let upstream_outputs = crate::variables::resolve_upstream_outputs(&pool, module.id).await?;

    let config = ExecutionConfig {
        run_id: run.id,
        module_id: module.id,
        operation: run.operation,
        tf_version: module.tf_version.clone(),
        source: resolve_source(&module, source_config.as_ref(), &storage_config),
        variables,
        env_vars,
        upstream_outputs: serde_json::to_value(&upstream_outputs).unwrap_or_else(|_| json!({})),
        state_backend: run
            .state_backend_snapshot
            .clone()
            .or_else(|| module.state_backend.clone()),
        callbacks: ExecutionCallbacks {
            status: format!("/v1/ci/module-runs/{}/status", run.id),
            logs: format!("/v1/ci/module-runs/{}/logs", run.id),
            plan: format!("/v1/ci/module-runs/{}/plan", run.id),
            outputs: format!("/v1/ci/module-runs/{}/outputs", run.id),
        },
    };

    tracing::info!(run_id = run.id, module_id = module.id, "execution config served");
    Ok(Json(config))
}

#[cfg(test)]
mod tests {
    use super::{generate_callback_token, hash_callback_token, simplify_outputs};
    use serde_json::{json, Map, Value};

    #[test]
    fn tokens_are_prefixed_and_hashed() {
        let (token, hash) = generate_callback_token();
        assert!(token.starts_with("brce_"));
        assert_eq!(token.len(), 5 + 64);
        assert_eq!(hash, hash_callback_token(&token));
        assert_ne!(hash, token);
    }

    #[test]
    fn tokens_are_unique() {
        let (first, _) = generate_callback_token();
        let (second, _) = generate_callback_token();
        assert_ne!(first, second);
    }

    #[test]
    fn outputs_simplify_to_flat_values() {
        let raw: Map<String, Value> = serde_json::from_value(json!({
            "vpc_id": {"value": "vpc-123", "type": "string"},
            "subnets": {"value": ["a", "b"], "sensitive": false},
            "already_flat": "plain"
        }))
        .unwrap();
        let simplified = simplify_outputs(&raw);
        assert_eq!(simplified["vpc_id"], json!("vpc-123"));
        assert_eq!(simplified["subnets"], json!(["a", "b"]));
        assert_eq!(simplified["already_flat"], json!("plain"));
    }
}
