use std::collections::{HashMap, HashSet, VecDeque};

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{FromRow, PgPool};

use crate::environments::{ensure_unlocked, load_environment};
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::modules::{list_environment_dependencies, list_environment_modules, topological_sort};
use crate::runs::{
    create_module_run, ModuleRun, NewModuleRun, RunOperation, RunPriority, RunStatus, RUN_COLUMNS,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "environment_run_operation", rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum EnvRunOperation {
    PlanAll,
    ApplyAll,
    DestroyAll,
}

impl EnvRunOperation {
    fn module_operation(self) -> RunOperation {
        match self {
            EnvRunOperation::PlanAll => RunOperation::Plan,
            EnvRunOperation::ApplyAll => RunOperation::Apply,
            EnvRunOperation::DestroyAll => RunOperation::Destroy,
        }
    }

    /// Destroy works leaves-first, so its progression graph is the reverse
    /// of the dependency graph.
    fn reverses_edges(self) -> bool {
        matches!(self, EnvRunOperation::DestroyAll)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "environment_run_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EnvRunStatus {
    Running,
    Planned,
    Succeeded,
    PartialFailure,
    Failed,
    Cancelled,
    Expired,
}

impl EnvRunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, EnvRunStatus::Running | EnvRunStatus::Planned)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EnvironmentRun {
    pub id: i64,
    pub environment_id: i32,
    pub operation: EnvRunOperation,
    pub status: EnvRunStatus,
    pub execution_order: serde_json::Value,
    pub total_modules: i32,
    pub completed_modules: i32,
    pub failed_modules: i32,
    pub skipped_modules: i32,
    pub pending_modules: i32,
    pub created_by: Option<i32>,
    pub confirmed_by: Option<i32>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const ENV_RUN_COLUMNS: &str = "id, environment_id, operation, status, execution_order, \
     total_modules, completed_modules, failed_modules, skipped_modules, pending_modules, \
     created_by, confirmed_by, confirmed_at, completed_at, duration_seconds, created_at, \
     updated_at";

/// Where an environment run stands after a recount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvProgress {
    InProgress,
    AwaitingConfirmation,
    Finished(EnvRunStatus),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RunCounts {
    pub succeeded: i64,
    pub planned: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub skipped: i64,
    pub unsettled: i64,
}

impl RunCounts {
    pub fn completed(&self) -> i64 {
        self.succeeded + self.planned
    }

    pub fn failed_total(&self) -> i64 {
        self.failed + self.cancelled
    }
}

/// Decide the environment run's state from its members' statuses. A plan-all
/// run that settles with plans outstanding waits for confirmation; everything
/// else finalizes by the completed/failed/skipped rule.
pub fn resolve_environment_progress(
    operation: EnvRunOperation,
    confirmed: bool,
    counts: RunCounts,
) -> EnvProgress {
    if counts.unsettled > 0 {
        return EnvProgress::InProgress;
    }
    if operation == EnvRunOperation::PlanAll && !confirmed && counts.planned > 0 {
        return EnvProgress::AwaitingConfirmation;
    }
    let status = if counts.failed_total() == 0 && counts.skipped == 0 {
        EnvRunStatus::Succeeded
    } else if counts.completed() > counts.failed_total() {
        EnvRunStatus::PartialFailure
    } else {
        EnvRunStatus::Failed
    };
    EnvProgress::Finished(status)
}

pub fn routes() -> Router {
    Router::new()
        .route(
            "/v1/environments/:id/runs",
            get(list_environment_runs).post(start_environment_run),
        )
        .route("/v1/environment-runs/:id", get(get_environment_run))
        .route("/v1/environment-runs/:id/confirm", post(confirm_environment_run))
        .route("/v1/environment-runs/:id/cancel", post(cancel_environment_run))
}

#[derive(Debug, Deserialize)]
pub struct StartEnvRunRequest {
    pub operation: EnvRunOperation,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmEnvRunRequest {
    #[serde(default)]
    pub excluded_module_ids: Vec<i32>,
}

#[derive(Debug, Serialize)]
pub struct EnvironmentRunDetail {
    #[serde(flatten)]
    pub run: EnvironmentRun,
    pub module_runs: Vec<ModuleRun>,
}

async fn list_environment_runs(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path(environment_id): Path<i32>,
) -> AppResult<Json<Vec<EnvironmentRun>>> {
    let environment = load_environment(&pool, environment_id, &team).await?;
    let query = format!(
        "SELECT {ENV_RUN_COLUMNS} FROM environment_runs WHERE environment_id = $1 \
         ORDER BY created_at DESC, id DESC LIMIT 50"
    );
    let runs = sqlx::query_as::<_, EnvironmentRun>(&query)
        .bind(environment.id)
        .fetch_all(&pool)
        .await?;
    Ok(Json(runs))
}

/// Kick off an environment-wide operation: topologically order the active
/// modules, spawn one module run each, and release the zero-in-degree roots.
async fn start_environment_run(
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id, team, .. }: AuthUser,
    Path(environment_id): Path<i32>,
    Json(payload): Json<StartEnvRunRequest>,
) -> AppResult<(StatusCode, Json<EnvironmentRunDetail>)> {
    let environment = load_environment(&pool, environment_id, &team).await?;
    ensure_unlocked(&environment)?;

    let modules = list_environment_modules(&pool, environment.id).await?;
    if modules.is_empty() {
        return Err(AppError::BadRequest("Environment has no modules".into()));
    }
    let module_ids: Vec<i32> = modules.iter().map(|module| module.id).collect();
    let names: HashMap<i32, String> = modules
        .iter()
        .map(|module| (module.id, module.name.clone()))
        .collect();

    let dependencies = list_environment_dependencies(&pool, environment.id).await?;
    let mut edges: Vec<(i32, i32)> = dependencies
        .iter()
        .map(|edge| (edge.depends_on_id, edge.module_id))
        .collect();
    if payload.operation.reverses_edges() {
        edges = edges.iter().map(|(up, down)| (*down, *up)).collect();
    }

    // Write-time validation is the primary cycle guard; this assertion
    // should never fire if invariants held.
    let order = topological_sort(&module_ids, &edges).map_err(|remaining| {
        let stuck = remaining
            .iter()
            .map(|id| names.get(id).cloned().unwrap_or_else(|| id.to_string()))
            .collect::<Vec<_>>()
            .join(", ");
        AppError::BadRequest(format!("Dependency cycle detected among: {}", stuck))
    })?;

    let mut in_degree: HashMap<i32, usize> = module_ids.iter().map(|id| (*id, 0)).collect();
    for (_, downstream) in &edges {
        *in_degree.entry(*downstream).or_insert(0) += 1;
    }

    let env_run_query = format!(
        "INSERT INTO environment_runs \
         (environment_id, operation, status, execution_order, total_modules, pending_modules, created_by) \
         VALUES ($1, $2, 'running', $3, $4, $4, $5) RETURNING {ENV_RUN_COLUMNS}"
    );
    let env_run = sqlx::query_as::<_, EnvironmentRun>(&env_run_query)
        .bind(environment.id)
        .bind(payload.operation)
        .bind(json!(order))
        .bind(modules.len() as i32)
        .bind(user_id)
        .fetch_one(&pool)
        .await?;

    let mut module_runs = Vec::with_capacity(modules.len());
    for module in &modules {
        let created = create_module_run(
            &pool,
            NewModuleRun {
                module_id: module.id,
                environment_id: environment.id,
                environment_run_id: Some(env_run.id),
                operation: payload.operation.module_operation(),
                mode: module.execution_mode,
                priority: RunPriority::User,
                version: module
                    .pinned_version
                    .clone()
                    .or_else(|| module.current_version.clone()),
                created_by: Some(user_id),
                hold_pending: in_degree.get(&module.id).copied().unwrap_or(0) > 0,
            },
        )
        .await?;
        module_runs.push(created.run);
    }

    tracing::info!(
        env_run_id = env_run.id,
        environment_id = environment.id,
        operation = ?payload.operation,
        modules = modules.len(),
        "environment run started"
    );

    Ok((
        StatusCode::CREATED,
        Json(EnvironmentRunDetail {
            run: env_run,
            module_runs,
        }),
    ))
}

async fn load_environment_run(pool: &PgPool, id: i64) -> AppResult<EnvironmentRun> {
    let query = format!("SELECT {ENV_RUN_COLUMNS} FROM environment_runs WHERE id = $1");
    let run = sqlx::query_as::<_, EnvironmentRun>(&query)
        .bind(id)
        .fetch_optional(pool)
        .await?;
    run.ok_or_else(|| AppError::not_found("ENVIRONMENT_RUN_NOT_FOUND", "Environment run not found"))
}

async fn load_environment_run_for_team(
    pool: &PgPool,
    id: i64,
    team: &str,
) -> AppResult<EnvironmentRun> {
    let run = load_environment_run(pool, id).await?;
    let owner: Option<String> = sqlx::query_scalar("SELECT team FROM environments WHERE id = $1")
        .bind(run.environment_id)
        .fetch_optional(pool)
        .await?;
    if owner.as_deref() != Some(team) {
        return Err(AppError::not_found(
            "ENVIRONMENT_RUN_NOT_FOUND",
            "Environment run not found",
        ));
    }
    Ok(run)
}

async fn member_runs(pool: &PgPool, env_run_id: i64) -> AppResult<Vec<ModuleRun>> {
    let query = format!(
        "SELECT {RUN_COLUMNS} FROM module_runs WHERE environment_run_id = $1 ORDER BY id"
    );
    let runs = sqlx::query_as::<_, ModuleRun>(&query)
        .bind(env_run_id)
        .fetch_all(pool)
        .await?;
    Ok(runs)
}

async fn get_environment_run(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path(id): Path<i64>,
) -> AppResult<Json<EnvironmentRunDetail>> {
    let run = load_environment_run_for_team(&pool, id, &team).await?;
    let module_runs = member_runs(&pool, run.id).await?;
    Ok(Json(EnvironmentRunDetail { run, module_runs }))
}

/// Progression edges as (upstream, downstream) pairs for this run's
/// operation, with module-id keys.
async fn progression_edges(
    pool: &PgPool,
    environment_id: i32,
    operation: EnvRunOperation,
) -> AppResult<Vec<(i32, i32)>> {
    let dependencies = list_environment_dependencies(pool, environment_id).await?;
    let mut edges: Vec<(i32, i32)> = dependencies
        .iter()
        .map(|edge| (edge.depends_on_id, edge.module_id))
        .collect();
    if operation.reverses_edges() {
        edges = edges.iter().map(|(up, down)| (*down, *up)).collect();
    }
    Ok(edges)
}

/// React to a member run reaching `planned`, `succeeded`, `failed`, or
/// `cancelled`: release satisfied downstreams, propagate failures, and
/// recount the parent. Deterministic over current DB state, so replays and
/// duplicate notifications are harmless.
pub async fn on_module_run_transition(pool: &PgPool, run: &ModuleRun) -> AppResult<()> {
    let Some(env_run_id) = run.environment_run_id else {
        return Ok(());
    };
    let env_run = load_environment_run(pool, env_run_id).await?;
    if env_run.status.is_terminal() {
        return Ok(());
    }

    match run.status {
        RunStatus::Planned | RunStatus::Succeeded => {
            release_satisfied_downstreams(pool, &env_run, run.module_id).await?;
        }
        RunStatus::Failed | RunStatus::Cancelled => {
            propagate_skip(pool, &env_run, run.module_id).await?;
        }
        _ => {}
    }

    recount_environment_run(pool, env_run.id).await?;
    Ok(())
}

/// A downstream is released when every one of its upstreams has settled
/// successfully. In the plan phase that means `planned`; in apply phases it
/// means `succeeded`; `skipped` upstreams were already handled by exclusion
/// or failure propagation and block their dependents there.
async fn release_satisfied_downstreams(
    pool: &PgPool,
    env_run: &EnvironmentRun,
    module_id: i32,
) -> AppResult<()> {
    let edges = progression_edges(pool, env_run.environment_id, env_run.operation).await?;
    let runs = member_runs(pool, env_run.id).await?;
    let by_module: HashMap<i32, &ModuleRun> =
        runs.iter().map(|run| (run.module_id, run)).collect();

    let apply_phase =
        env_run.operation == EnvRunOperation::PlanAll && env_run.confirmed_at.is_some();

    let downstreams: Vec<i32> = edges
        .iter()
        .filter(|(upstream, _)| *upstream == module_id)
        .map(|(_, downstream)| *downstream)
        .collect();

    for downstream in downstreams {
        let Some(candidate) = by_module.get(&downstream) else {
            continue;
        };
        let waiting = if apply_phase {
            candidate.status == RunStatus::Planned
        } else {
            candidate.status == RunStatus::Pending
        };
        if !waiting {
            continue;
        }

        let upstreams: Vec<i32> = edges
            .iter()
            .filter(|(_, down)| *down == downstream)
            .map(|(up, _)| *up)
            .collect();
        let all_satisfied = upstreams.iter().all(|upstream| {
            by_module
                .get(upstream)
                .map(|run| {
                    if apply_phase {
                        // Plan-stage results no longer count once applying.
                        matches!(run.status, RunStatus::Succeeded | RunStatus::Skipped)
                    } else {
                        matches!(run.status, RunStatus::Planned | RunStatus::Succeeded)
                    }
                })
                .unwrap_or(true)
        });
        if !all_satisfied {
            continue;
        }

        if apply_phase {
            sqlx::query(
                "UPDATE module_runs SET status = 'confirmed', confirmed_by = $2, \
                 confirmed_at = NOW(), updated_at = NOW() WHERE id = $1 AND status = 'planned'",
            )
            .bind(candidate.id)
            .bind(env_run.confirmed_by)
            .execute(pool)
            .await?;
        } else {
            sqlx::query(
                "UPDATE module_runs SET status = 'queued', queued_at = NOW(), \
                 updated_at = NOW() WHERE id = $1 AND status = 'pending'",
            )
            .bind(candidate.id)
            .execute(pool)
            .await?;
        }
        tracing::debug!(
            env_run_id = env_run.id,
            module_id = downstream,
            "downstream released"
        );
    }
    Ok(())
}

/// BFS every transitive dependent of the failed module and skip those that
/// have not started. Direct dependents name the failed module; deeper levels
/// name the skipped upstream that blocked them.
async fn propagate_skip(
    pool: &PgPool,
    env_run: &EnvironmentRun,
    failed_module_id: i32,
) -> AppResult<()> {
    let edges = progression_edges(pool, env_run.environment_id, env_run.operation).await?;
    let runs = member_runs(pool, env_run.id).await?;
    let by_module: HashMap<i32, &ModuleRun> =
        runs.iter().map(|run| (run.module_id, run)).collect();
    let names = module_names(pool, env_run.environment_id).await?;

    let mut downstream_of: HashMap<i32, Vec<i32>> = HashMap::new();
    for (upstream, downstream) in &edges {
        downstream_of.entry(*upstream).or_default().push(*downstream);
    }

    let failed_name = names
        .get(&failed_module_id)
        .cloned()
        .unwrap_or_else(|| failed_module_id.to_string());

    let mut queue: VecDeque<(i32, String)> = VecDeque::new();
    let mut visited: HashSet<i32> = HashSet::new();
    for direct in downstream_of.get(&failed_module_id).cloned().unwrap_or_default() {
        queue.push_back((
            direct,
            format!("Upstream module '{}' failed", failed_name),
        ));
    }

    while let Some((module_id, reason)) = queue.pop_front() {
        if !visited.insert(module_id) {
            continue;
        }
        let Some(run) = by_module.get(&module_id) else {
            continue;
        };
        if matches!(
            run.status,
            RunStatus::Pending | RunStatus::Queued | RunStatus::Planned | RunStatus::Confirmed
        ) {
            sqlx::query(
                "UPDATE module_runs SET status = 'skipped', queue_position = NULL, \
                 skip_reason = $2, completed_at = NOW(), updated_at = NOW() \
                 WHERE id = $1 AND status IN ('pending', 'queued', 'planned', 'confirmed')",
            )
            .bind(run.id)
            .bind(&reason)
            .execute(pool)
            .await?;
        }

        let skipped_name = names
            .get(&module_id)
            .cloned()
            .unwrap_or_else(|| module_id.to_string());
        for next in downstream_of.get(&module_id).cloned().unwrap_or_default() {
            queue.push_back((
                next,
                format!("Upstream module '{}' was skipped", skipped_name),
            ));
        }
    }
    Ok(())
}

async fn module_names(pool: &PgPool, environment_id: i32) -> AppResult<HashMap<i32, String>> {
    let modules = list_environment_modules(pool, environment_id).await?;
    Ok(modules
        .into_iter()
        .map(|module| (module.id, module.name))
        .collect())
}

/// Recount member statuses and advance or finalize the environment run.
pub async fn recount_environment_run(pool: &PgPool, env_run_id: i64) -> AppResult<()> {
    let env_run = load_environment_run(pool, env_run_id).await?;
    if env_run.status.is_terminal() {
        return Ok(());
    }
    let runs = member_runs(pool, env_run_id).await?;

    let mut counts = RunCounts::default();
    for run in &runs {
        match run.status {
            RunStatus::Succeeded => counts.succeeded += 1,
            RunStatus::Planned => counts.planned += 1,
            RunStatus::Failed | RunStatus::TimedOut => counts.failed += 1,
            RunStatus::Cancelled | RunStatus::Discarded => counts.cancelled += 1,
            RunStatus::Skipped => counts.skipped += 1,
            RunStatus::Pending
            | RunStatus::Queued
            | RunStatus::Running
            | RunStatus::Confirmed
            | RunStatus::Applying => counts.unsettled += 1,
        }
    }

    let progress = resolve_environment_progress(
        env_run.operation,
        env_run.confirmed_at.is_some(),
        counts,
    );

    match progress {
        EnvProgress::InProgress => {
            sqlx::query(
                "UPDATE environment_runs SET completed_modules = $2, failed_modules = $3, \
                 skipped_modules = $4, pending_modules = $5, updated_at = NOW() WHERE id = $1",
            )
            .bind(env_run_id)
            .bind(counts.completed() as i32)
            .bind(counts.failed_total() as i32)
            .bind(counts.skipped as i32)
            .bind(counts.unsettled as i32)
            .execute(pool)
            .await?;
        }
        EnvProgress::AwaitingConfirmation => {
            sqlx::query(
                "UPDATE environment_runs SET status = 'planned', completed_modules = $2, \
                 failed_modules = $3, skipped_modules = $4, pending_modules = 0, \
                 updated_at = NOW() WHERE id = $1 AND status = 'running'",
            )
            .bind(env_run_id)
            .bind(counts.completed() as i32)
            .bind(counts.failed_total() as i32)
            .bind(counts.skipped as i32)
            .execute(pool)
            .await?;
            tracing::info!(env_run_id, "environment run awaiting confirmation");
        }
        EnvProgress::Finished(status) => {
            sqlx::query(
                "UPDATE environment_runs SET status = $2, completed_modules = $3, \
                 failed_modules = $4, skipped_modules = $5, pending_modules = 0, \
                 completed_at = NOW(), \
                 duration_seconds = EXTRACT(EPOCH FROM (NOW() - created_at))::int, \
                 updated_at = NOW() WHERE id = $1 AND status IN ('running', 'planned')",
            )
            .bind(env_run_id)
            .bind(status)
            .bind(counts.completed() as i32)
            .bind(counts.failed_total() as i32)
            .bind(counts.skipped as i32)
            .execute(pool)
            .await?;
            tracing::info!(env_run_id, status = ?status, "environment run finished");
        }
    }
    Ok(())
}

/// Confirm a planned environment run, optionally excluding modules. The
/// exclusion set closes transitively over the downstream graph before the
/// apply phase begins.
async fn confirm_environment_run(
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id, team, .. }: AuthUser,
    Path(id): Path<i64>,
    Json(payload): Json<ConfirmEnvRunRequest>,
) -> AppResult<Json<EnvironmentRunDetail>> {
    let env_run = load_environment_run_for_team(&pool, id, &team).await?;
    match env_run.status {
        EnvRunStatus::Planned => {}
        EnvRunStatus::Expired => {
            return Err(AppError::Gone("Environment run expired".into()))
        }
        other => {
            return Err(AppError::Conflict(format!(
                "Environment run is {:?}, only planned runs can be confirmed",
                other
            )))
        }
    }

    let edges = progression_edges(&pool, env_run.environment_id, env_run.operation).await?;
    let runs = member_runs(&pool, env_run.id).await?;
    let by_module: HashMap<i32, &ModuleRun> =
        runs.iter().map(|run| (run.module_id, run)).collect();
    let names = module_names(&pool, env_run.environment_id).await?;

    for excluded in &payload.excluded_module_ids {
        if !by_module.contains_key(excluded) {
            return Err(AppError::BadRequest(format!(
                "Module {} is not part of this environment run",
                excluded
            )));
        }
    }

    let closure = exclusion_closure(&payload.excluded_module_ids, &edges);
    for (module_id, source) in &closure {
        let Some(run) = by_module.get(module_id) else {
            continue;
        };
        if run.status != RunStatus::Planned {
            continue;
        }
        let reason = if source == module_id {
            "Excluded from apply at confirmation".to_string()
        } else {
            let source_name = names
                .get(source)
                .cloned()
                .unwrap_or_else(|| source.to_string());
            format!(
                "Upstream module '{}' excluded at confirmation",
                source_name
            )
        };
        sqlx::query(
            "UPDATE module_runs SET status = 'skipped', skip_reason = $2, \
             completed_at = NOW(), updated_at = NOW() WHERE id = $1 AND status = 'planned'",
        )
        .bind(run.id)
        .bind(&reason)
        .execute(&pool)
        .await?;
    }

    let confirm_query = format!(
        "UPDATE environment_runs SET status = 'running', confirmed_by = $2, \
         confirmed_at = NOW(), updated_at = NOW() WHERE id = $1 AND status = 'planned' \
         RETURNING {ENV_RUN_COLUMNS}"
    );
    let confirmed = sqlx::query_as::<_, EnvironmentRun>(&confirm_query)
        .bind(env_run.id)
        .bind(user_id)
        .fetch_optional(&pool)
        .await?
        .ok_or_else(|| AppError::Conflict("Environment run state changed concurrently".into()))?;

    // Release apply-phase roots: planned modules whose upstreams are all
    // settled (skipped upstreams were closed over above).
    let runs = member_runs(&pool, confirmed.id).await?;
    let by_module: HashMap<i32, &ModuleRun> =
        runs.iter().map(|run| (run.module_id, run)).collect();
    for run in &runs {
        if run.status != RunStatus::Planned {
            continue;
        }
        let upstreams: Vec<i32> = edges
            .iter()
            .filter(|(_, down)| *down == run.module_id)
            .map(|(up, _)| *up)
            .collect();
        let ready = upstreams.iter().all(|upstream| {
            by_module
                .get(upstream)
                .map(|up| matches!(up.status, RunStatus::Succeeded | RunStatus::Skipped))
                .unwrap_or(true)
        });
        if ready {
            sqlx::query(
                "UPDATE module_runs SET status = 'confirmed', confirmed_by = $2, \
                 confirmed_at = NOW(), updated_at = NOW() WHERE id = $1 AND status = 'planned'",
            )
            .bind(run.id)
            .bind(user_id)
            .execute(&pool)
            .await?;
        }
    }

    recount_environment_run(&pool, confirmed.id).await?;
    let run = load_environment_run(&pool, confirmed.id).await?;
    let module_runs = member_runs(&pool, run.id).await?;
    tracing::info!(env_run_id = run.id, "environment run confirmed");
    Ok(Json(EnvironmentRunDetail { run, module_runs }))
}

/// Transitive closure of the exclusion set over (upstream, downstream)
/// edges. Each member maps to the directly-excluded module that pulled it
/// in; direct members map to themselves.
pub fn exclusion_closure(excluded: &[i32], edges: &[(i32, i32)]) -> HashMap<i32, i32> {
    let mut downstream_of: HashMap<i32, Vec<i32>> = HashMap::new();
    for (upstream, downstream) in edges {
        downstream_of.entry(*upstream).or_default().push(*downstream);
    }

    let mut closure: HashMap<i32, i32> = HashMap::new();
    let mut queue: VecDeque<i32> = VecDeque::new();
    for id in excluded {
        closure.insert(*id, *id);
        queue.push_back(*id);
    }
    while let Some(current) = queue.pop_front() {
        let source = closure.get(&current).copied().unwrap_or(current);
        for next in downstream_of.get(&current).cloned().unwrap_or_default() {
            if !closure.contains_key(&next) {
                closure.insert(next, source);
                queue.push_back(next);
            }
        }
    }
    closure
}

async fn cancel_environment_run(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path(id): Path<i64>,
) -> AppResult<Json<EnvironmentRunDetail>> {
    let env_run = load_environment_run_for_team(&pool, id, &team).await?;
    if env_run.status.is_terminal() {
        return Err(AppError::Conflict(format!(
            "Environment run already {:?}",
            env_run.status
        )));
    }

    // Runs that never started settle immediately; active runs are marked
    // cancelled and the runner observes it on its next poll or callback.
    sqlx::query(
        "UPDATE module_runs SET status = 'cancelled', queue_position = NULL, \
         completed_at = NOW(), updated_at = NOW() \
         WHERE environment_run_id = $1 AND status IN \
         ('pending', 'queued', 'running', 'planned', 'confirmed', 'applying')",
    )
    .bind(env_run.id)
    .execute(&pool)
    .await?;

    let cancel_query = format!(
        "UPDATE environment_runs SET status = 'cancelled', completed_at = NOW(), \
         duration_seconds = EXTRACT(EPOCH FROM (NOW() - created_at))::int, updated_at = NOW() \
         WHERE id = $1 RETURNING {ENV_RUN_COLUMNS}"
    );
    let run = sqlx::query_as::<_, EnvironmentRun>(&cancel_query)
        .bind(env_run.id)
        .fetch_one(&pool)
        .await?;
    let module_runs = member_runs(&pool, run.id).await?;
    tracing::info!(env_run_id = run.id, "environment run cancelled");
    Ok(Json(EnvironmentRunDetail { run, module_runs }))
}

#[cfg(test)]
mod tests {
    use super::{
        exclusion_closure, resolve_environment_progress, EnvProgress, EnvRunOperation,
        EnvRunStatus, RunCounts,
    };

    #[test]
    fn unsettled_members_keep_the_run_in_progress() {
        let counts = RunCounts {
            succeeded: 2,
            unsettled: 1,
            ..RunCounts::default()
        };
        assert_eq!(
            resolve_environment_progress(EnvRunOperation::ApplyAll, false, counts),
            EnvProgress::InProgress
        );
    }

    #[test]
    fn settled_plan_all_awaits_confirmation() {
        let counts = RunCounts {
            planned: 3,
            skipped: 1,
            ..RunCounts::default()
        };
        assert_eq!(
            resolve_environment_progress(EnvRunOperation::PlanAll, false, counts),
            EnvProgress::AwaitingConfirmation
        );
    }

    #[test]
    fn confirmed_plan_all_finalizes_after_apply() {
        let counts = RunCounts {
            succeeded: 4,
            ..RunCounts::default()
        };
        assert_eq!(
            resolve_environment_progress(EnvRunOperation::PlanAll, true, counts),
            EnvProgress::Finished(EnvRunStatus::Succeeded)
        );
    }

    #[test]
    fn failures_with_majority_completed_are_partial() {
        let counts = RunCounts {
            succeeded: 3,
            failed: 1,
            skipped: 1,
            ..RunCounts::default()
        };
        assert_eq!(
            resolve_environment_progress(EnvRunOperation::ApplyAll, false, counts),
            EnvProgress::Finished(EnvRunStatus::PartialFailure)
        );
    }

    #[test]
    fn failures_without_majority_fail_the_run() {
        let counts = RunCounts {
            succeeded: 1,
            failed: 2,
            skipped: 1,
            ..RunCounts::default()
        };
        assert_eq!(
            resolve_environment_progress(EnvRunOperation::DestroyAll, false, counts),
            EnvProgress::Finished(EnvRunStatus::Failed)
        );
    }

    #[test]
    fn closure_includes_transitive_dependents() {
        // 1 -> 2 -> 4, 1 -> 3
        let edges = vec![(1, 2), (2, 4), (1, 3)];
        let closure = exclusion_closure(&[2], &edges);
        assert_eq!(closure.get(&2), Some(&2));
        assert_eq!(closure.get(&4), Some(&2));
        assert!(!closure.contains_key(&1));
        assert!(!closure.contains_key(&3));
    }

    #[test]
    fn closure_of_empty_set_is_empty() {
        assert!(exclusion_closure(&[], &[(1, 2)]).is_empty());
    }
}
