use std::collections::{HashMap, HashSet};

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::{FromRow, PgPool};

use crate::environments::{ensure_unlocked, load_environment};
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "execution_mode", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Managed,
    Byoc,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "variable_category", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum VariableCategory {
    Terraform,
    Env,
}

/// State backend descriptor; unknown backends round-trip untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateBackend {
    Known(KnownStateBackend),
    Unknown(Value),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum KnownStateBackend {
    S3 {
        bucket: String,
        key: String,
        #[serde(default)]
        region: Option<String>,
    },
    Gcs {
        bucket: String,
        #[serde(default)]
        prefix: Option<String>,
    },
    Azurerm {
        storage_account_name: String,
        container_name: String,
        key: String,
    },
    Local {
        #[serde(default)]
        path: Option<String>,
    },
}

/// VCS trigger descriptor attached to a module.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VcsTrigger {
    pub repo: Option<String>,
    pub branch: Option<String>,
    pub working_directory: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EnvironmentModule {
    pub id: i32,
    pub environment_id: i32,
    pub name: String,
    pub artifact_id: i32,
    pub artifact_namespace: String,
    pub artifact_name: String,
    pub pinned_version: Option<String>,
    pub current_version: Option<String>,
    pub execution_mode: ExecutionMode,
    pub tf_version: Option<String>,
    pub working_directory: Option<String>,
    pub state_backend: Option<Value>,
    pub auto_plan_on_module_update: bool,
    pub auto_plan_on_push: bool,
    pub vcs_trigger: Option<Value>,
    pub resource_count: i32,
    pub last_run_id: Option<i64>,
    pub last_run_status: Option<String>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const MODULE_COLUMNS: &str = "id, environment_id, name, artifact_id, artifact_namespace, \
     artifact_name, pinned_version, current_version, execution_mode, tf_version, \
     working_directory, state_backend, auto_plan_on_module_update, auto_plan_on_push, \
     vcs_trigger, resource_count, last_run_id, last_run_status, last_run_at, created_at, \
     updated_at";

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ModuleDependency {
    pub id: i32,
    pub module_id: i32,
    pub depends_on_id: i32,
    pub output_mapping: Value,
    pub created_at: DateTime<Utc>,
}

/// One upstream-output to downstream-variable projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputMapping {
    pub output: String,
    pub variable: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateModule {
    pub name: String,
    pub artifact_id: i32,
    pub pinned_version: Option<String>,
    #[serde(default)]
    pub execution_mode: Option<ExecutionMode>,
    pub tf_version: Option<String>,
    pub working_directory: Option<String>,
    pub state_backend: Option<Value>,
    #[serde(default)]
    pub auto_plan_on_module_update: bool,
    #[serde(default)]
    pub auto_plan_on_push: bool,
    pub vcs_trigger: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateModule {
    pub pinned_version: Option<String>,
    pub execution_mode: Option<ExecutionMode>,
    pub tf_version: Option<String>,
    pub working_directory: Option<String>,
    pub state_backend: Option<Value>,
    pub auto_plan_on_module_update: Option<bool>,
    pub auto_plan_on_push: Option<bool>,
    pub vcs_trigger: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct DependencyInput {
    pub depends_on_id: i32,
    #[serde(default)]
    pub output_mapping: Vec<OutputMapping>,
}

#[derive(Debug, Deserialize)]
pub struct SetDependencies {
    pub dependencies: Vec<DependencyInput>,
}

#[derive(Debug, Deserialize)]
pub struct VariableInput {
    pub key: String,
    pub value: Option<String>,
    #[serde(default)]
    pub category: Option<VariableCategory>,
    #[serde(default)]
    pub sensitive: bool,
    pub secret_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SetVariables {
    pub variables: Vec<VariableInput>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteVariableQuery {
    pub key: String,
    pub category: Option<VariableCategory>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ModuleVariable {
    pub id: i32,
    pub module_id: i32,
    pub key: String,
    pub value: Option<String>,
    pub category: VariableCategory,
    pub sensitive: bool,
    pub secret_ref: Option<String>,
}

pub fn routes() -> Router {
    Router::new()
        .route(
            "/v1/environments/:id/modules",
            get(list_modules).post(create_module),
        )
        .route(
            "/v1/environments/:id/modules/:module_id",
            get(get_module_handler)
                .patch(update_module)
                .delete(delete_module),
        )
        .route(
            "/v1/environments/:id/modules/:module_id/dependencies",
            get(get_dependencies).put(set_dependencies),
        )
        .route(
            "/v1/environments/:id/modules/:module_id/variables",
            get(list_variables)
                .put(replace_variables)
                .patch(upsert_variable)
                .delete(delete_variable),
        )
}

pub async fn list_environment_modules(
    pool: &PgPool,
    environment_id: i32,
) -> AppResult<Vec<EnvironmentModule>> {
    let query = format!(
        "SELECT {MODULE_COLUMNS} FROM environment_modules WHERE environment_id = $1 ORDER BY id"
    );
    let modules = sqlx::query_as::<_, EnvironmentModule>(&query)
        .bind(environment_id)
        .fetch_all(pool)
        .await?;
    Ok(modules)
}

pub async fn list_environment_dependencies(
    pool: &PgPool,
    environment_id: i32,
) -> AppResult<Vec<ModuleDependency>> {
    let dependencies = sqlx::query_as::<_, ModuleDependency>(
        r#"
        SELECT d.id, d.module_id, d.depends_on_id, d.output_mapping, d.created_at
        FROM module_dependencies d
        JOIN environment_modules m ON m.id = d.module_id
        WHERE m.environment_id = $1
        ORDER BY d.id
        "#,
    )
    .bind(environment_id)
    .fetch_all(pool)
    .await?;
    Ok(dependencies)
}

pub async fn load_module(
    pool: &PgPool,
    environment_id: i32,
    module_id: i32,
) -> AppResult<EnvironmentModule> {
    let query = format!(
        "SELECT {MODULE_COLUMNS} FROM environment_modules WHERE id = $1 AND environment_id = $2"
    );
    let module = sqlx::query_as::<_, EnvironmentModule>(&query)
        .bind(module_id)
        .bind(environment_id)
        .fetch_optional(pool)
        .await?;
    module.ok_or_else(|| AppError::not_found("MODULE_NOT_FOUND", "Module not found"))
}

pub async fn load_module_by_id(pool: &PgPool, module_id: i32) -> AppResult<EnvironmentModule> {
    let query = format!("SELECT {MODULE_COLUMNS} FROM environment_modules WHERE id = $1");
    let module = sqlx::query_as::<_, EnvironmentModule>(&query)
        .bind(module_id)
        .fetch_optional(pool)
        .await?;
    module.ok_or_else(|| AppError::not_found("MODULE_NOT_FOUND", "Module not found"))
}

async fn list_modules(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path(environment_id): Path<i32>,
) -> AppResult<Json<Vec<EnvironmentModule>>> {
    let environment = load_environment(&pool, environment_id, &team).await?;
    let modules = list_environment_modules(&pool, environment.id).await?;
    Ok(Json(modules))
}

async fn create_module(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path(environment_id): Path<i32>,
    Json(payload): Json<CreateModule>,
) -> AppResult<(StatusCode, Json<EnvironmentModule>)> {
    let environment = load_environment(&pool, environment_id, &team).await?;
    ensure_unlocked(&environment)?;
    if payload.name.trim().is_empty() {
        return Err(AppError::BadRequest("Module name required".into()));
    }

    let artifact = sqlx::query_as::<_, crate::artifacts::Artifact>(
        "SELECT id, namespace, name, provider, artifact_type, team, description, storage_config, \
         source_config, approval_policy, tags, category, status, download_count, created_at, \
         updated_at FROM artifacts WHERE id = $1",
    )
    .bind(payload.artifact_id)
    .fetch_optional(&pool)
    .await?
    .ok_or_else(|| AppError::not_found("ARTIFACT_NOT_FOUND", "Artifact not found"))?;

    let mut tx = pool.begin().await?;
    let query = format!(
        "INSERT INTO environment_modules (environment_id, name, artifact_id, artifact_namespace, \
         artifact_name, pinned_version, execution_mode, tf_version, working_directory, \
         state_backend, auto_plan_on_module_update, auto_plan_on_push, vcs_trigger) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13) \
         RETURNING {MODULE_COLUMNS}"
    );
    let result = sqlx::query_as::<_, EnvironmentModule>(&query)
        .bind(environment.id)
        .bind(payload.name.trim())
        .bind(artifact.id)
        .bind(&artifact.namespace)
        .bind(&artifact.name)
        .bind(payload.pinned_version.as_deref())
        .bind(payload.execution_mode.unwrap_or(ExecutionMode::Byoc))
        .bind(payload.tf_version.as_deref())
        .bind(payload.working_directory.as_deref())
        .bind(payload.state_backend.as_ref())
        .bind(payload.auto_plan_on_module_update)
        .bind(payload.auto_plan_on_push)
        .bind(payload.vcs_trigger.as_ref())
        .fetch_one(&mut *tx)
        .await;

    let module = match result {
        Ok(module) => module,
        Err(e) => {
            if let sqlx::Error::Database(db_err) = &e {
                if db_err.constraint() == Some("environment_modules_environment_id_name_key") {
                    return Err(AppError::AlreadyExists(
                        "Module name already in use in this environment".into(),
                    ));
                }
            }
            return Err(AppError::Db(e));
        }
    };

    sqlx::query(
        "UPDATE environments SET module_count = module_count + 1, updated_at = NOW() WHERE id = $1",
    )
    .bind(environment.id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok((StatusCode::CREATED, Json(module)))
}

async fn get_module_handler(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path((environment_id, module_id)): Path<(i32, i32)>,
) -> AppResult<Json<EnvironmentModule>> {
    let environment = load_environment(&pool, environment_id, &team).await?;
    let module = load_module(&pool, environment.id, module_id).await?;
    Ok(Json(module))
}

async fn update_module(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path((environment_id, module_id)): Path<(i32, i32)>,
    Json(payload): Json<UpdateModule>,
) -> AppResult<Json<EnvironmentModule>> {
    let environment = load_environment(&pool, environment_id, &team).await?;
    ensure_unlocked(&environment)?;
    let module = load_module(&pool, environment.id, module_id).await?;

    let query = format!(
        "UPDATE environment_modules SET \
         pinned_version = COALESCE($2, pinned_version), \
         execution_mode = COALESCE($3, execution_mode), \
         tf_version = COALESCE($4, tf_version), \
         working_directory = COALESCE($5, working_directory), \
         state_backend = COALESCE($6, state_backend), \
         auto_plan_on_module_update = COALESCE($7, auto_plan_on_module_update), \
         auto_plan_on_push = COALESCE($8, auto_plan_on_push), \
         vcs_trigger = COALESCE($9, vcs_trigger), \
         updated_at = NOW() \
         WHERE id = $1 RETURNING {MODULE_COLUMNS}"
    );
    let updated = sqlx::query_as::<_, EnvironmentModule>(&query)
        .bind(module.id)
        .bind(payload.pinned_version.as_deref())
        .bind(payload.execution_mode)
        .bind(payload.tf_version.as_deref())
        .bind(payload.working_directory.as_deref())
        .bind(payload.state_backend.as_ref())
        .bind(payload.auto_plan_on_module_update)
        .bind(payload.auto_plan_on_push)
        .bind(payload.vcs_trigger.as_ref())
        .fetch_one(&pool)
        .await?;
    Ok(Json(updated))
}

async fn delete_module(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path((environment_id, module_id)): Path<(i32, i32)>,
) -> AppResult<StatusCode> {
    let environment = load_environment(&pool, environment_id, &team).await?;
    ensure_unlocked(&environment)?;
    let module = load_module(&pool, environment.id, module_id).await?;

    let active: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM module_runs WHERE module_id = $1 \
         AND status IN ('running', 'planned', 'confirmed', 'applying')",
    )
    .bind(module.id)
    .fetch_one(&pool)
    .await?;
    if active > 0 {
        return Err(AppError::Conflict(
            "Module has an active run; cancel it first".into(),
        ));
    }

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM environment_modules WHERE id = $1")
        .bind(module.id)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "UPDATE environments SET module_count = GREATEST(module_count - 1, 0), \
         total_resources = GREATEST(total_resources - $2, 0), updated_at = NOW() WHERE id = $1",
    )
    .bind(environment.id)
    .bind(module.resource_count)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(StatusCode::NO_CONTENT)
}

async fn get_dependencies(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path((environment_id, module_id)): Path<(i32, i32)>,
) -> AppResult<Json<Vec<ModuleDependency>>> {
    let environment = load_environment(&pool, environment_id, &team).await?;
    let module = load_module(&pool, environment.id, module_id).await?;
    let dependencies = sqlx::query_as::<_, ModuleDependency>(
        "SELECT id, module_id, depends_on_id, output_mapping, created_at \
         FROM module_dependencies WHERE module_id = $1 ORDER BY id",
    )
    .bind(module.id)
    .fetch_all(&pool)
    .await?;
    Ok(Json(dependencies))
}

/// Replace a module's dependency edges. The whole read-validate-write runs
/// in one transaction holding the environment row, so concurrent edits of
/// the same graph serialize and the acyclic invariant survives.
async fn set_dependencies(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path((environment_id, module_id)): Path<(i32, i32)>,
    Json(payload): Json<SetDependencies>,
) -> AppResult<Json<Vec<ModuleDependency>>> {
    let environment = load_environment(&pool, environment_id, &team).await?;
    ensure_unlocked(&environment)?;
    let module = load_module(&pool, environment.id, module_id).await?;

    let mut tx = pool.begin().await?;
    // Serialize graph mutations per environment.
    sqlx::query("SELECT id FROM environments WHERE id = $1 FOR UPDATE")
        .bind(environment.id)
        .fetch_one(&mut *tx)
        .await?;

    let list_query = format!(
        "SELECT {MODULE_COLUMNS} FROM environment_modules WHERE environment_id = $1 ORDER BY id"
    );
    let modules = sqlx::query_as::<_, EnvironmentModule>(&list_query)
        .bind(environment.id)
        .fetch_all(&mut *tx)
        .await?;
    let known: HashMap<i32, &EnvironmentModule> =
        modules.iter().map(|module| (module.id, module)).collect();

    let mut proposed = Vec::with_capacity(payload.dependencies.len());
    let mut seen = HashSet::new();
    for dependency in &payload.dependencies {
        if dependency.depends_on_id == module.id {
            return Err(AppError::BadRequest(
                "A module cannot depend on itself".into(),
            ));
        }
        if !known.contains_key(&dependency.depends_on_id) {
            return Err(AppError::BadRequest(format!(
                "Dependency target {} is not a module of this environment",
                dependency.depends_on_id
            )));
        }
        if !seen.insert(dependency.depends_on_id) {
            return Err(AppError::BadRequest(format!(
                "Duplicate dependency on module {}",
                dependency.depends_on_id
            )));
        }
        proposed.push(dependency.depends_on_id);
    }

    // Existing edges, minus the ones this write replaces.
    let existing = sqlx::query_as::<_, ModuleDependency>(
        r#"
        SELECT d.id, d.module_id, d.depends_on_id, d.output_mapping, d.created_at
        FROM module_dependencies d
        JOIN environment_modules m ON m.id = d.module_id
        WHERE m.environment_id = $1
        ORDER BY d.id
        "#,
    )
    .bind(environment.id)
    .fetch_all(&mut *tx)
    .await?;
    let retained: Vec<(i32, i32)> = existing
        .iter()
        .filter(|edge| edge.module_id != module.id)
        .map(|edge| (edge.module_id, edge.depends_on_id))
        .collect();

    if let Some(cycle) = find_dependency_cycle(module.id, &proposed, &retained) {
        let path = cycle
            .iter()
            .map(|id| {
                known
                    .get(id)
                    .map(|module| module.name.clone())
                    .unwrap_or_else(|| id.to_string())
            })
            .collect::<Vec<_>>()
            .join(" -> ");
        return Err(AppError::BadRequest(format!(
            "Dependency cycle detected: {}",
            path
        )));
    }

    sqlx::query("DELETE FROM module_dependencies WHERE module_id = $1")
        .bind(module.id)
        .execute(&mut *tx)
        .await?;
    for dependency in &payload.dependencies {
        sqlx::query(
            "INSERT INTO module_dependencies (module_id, depends_on_id, output_mapping) \
             VALUES ($1, $2, $3)",
        )
        .bind(module.id)
        .bind(dependency.depends_on_id)
        .bind(json!(dependency.output_mapping))
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    let dependencies = sqlx::query_as::<_, ModuleDependency>(
        "SELECT id, module_id, depends_on_id, output_mapping, created_at \
         FROM module_dependencies WHERE module_id = $1 ORDER BY id",
    )
    .bind(module.id)
    .fetch_all(&pool)
    .await?;
    Ok(Json(dependencies))
}

async fn list_variables(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path((environment_id, module_id)): Path<(i32, i32)>,
) -> AppResult<Json<Vec<ModuleVariable>>> {
    let environment = load_environment(&pool, environment_id, &team).await?;
    let module = load_module(&pool, environment.id, module_id).await?;
    let mut variables = sqlx::query_as::<_, ModuleVariable>(
        "SELECT id, module_id, key, value, category, sensitive, secret_ref \
         FROM module_variables WHERE module_id = $1 ORDER BY key",
    )
    .bind(module.id)
    .fetch_all(&pool)
    .await?;
    // Sensitive values never leave the store through previews.
    for variable in &mut variables {
        if variable.sensitive {
            variable.value = None;
        }
    }
    Ok(Json(variables))
}

async fn replace_variables(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path((environment_id, module_id)): Path<(i32, i32)>,
    Json(payload): Json<SetVariables>,
) -> AppResult<StatusCode> {
    let environment = load_environment(&pool, environment_id, &team).await?;
    ensure_unlocked(&environment)?;
    let module = load_module(&pool, environment.id, module_id).await?;

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM module_variables WHERE module_id = $1")
        .bind(module.id)
        .execute(&mut *tx)
        .await?;
    for variable in &payload.variables {
        insert_variable(&mut tx, module.id, variable).await?;
    }
    tx.commit().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn upsert_variable(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path((environment_id, module_id)): Path<(i32, i32)>,
    Json(payload): Json<VariableInput>,
) -> AppResult<StatusCode> {
    let environment = load_environment(&pool, environment_id, &team).await?;
    ensure_unlocked(&environment)?;
    let module = load_module(&pool, environment.id, module_id).await?;

    sqlx::query(
        r#"
        INSERT INTO module_variables (module_id, key, value, category, sensitive, secret_ref)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (module_id, key, category) DO UPDATE SET
            value = EXCLUDED.value,
            sensitive = EXCLUDED.sensitive,
            secret_ref = EXCLUDED.secret_ref,
            updated_at = NOW()
        "#,
    )
    .bind(module.id)
    .bind(&payload.key)
    .bind(payload.value.as_deref())
    .bind(payload.category.unwrap_or(VariableCategory::Terraform))
    .bind(payload.sensitive)
    .bind(payload.secret_ref.as_deref())
    .execute(&pool)
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_variable(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path((environment_id, module_id)): Path<(i32, i32)>,
    Query(params): Query<DeleteVariableQuery>,
) -> AppResult<StatusCode> {
    let environment = load_environment(&pool, environment_id, &team).await?;
    ensure_unlocked(&environment)?;
    let module = load_module(&pool, environment.id, module_id).await?;

    let result = sqlx::query(
        "DELETE FROM module_variables WHERE module_id = $1 AND key = $2 AND category = $3",
    )
    .bind(module.id)
    .bind(&params.key)
    .bind(params.category.unwrap_or(VariableCategory::Terraform))
    .execute(&pool)
    .await?;
    if result.rows_affected() == 0 {
        return Err(AppError::not_found(
            "VARIABLE_NOT_FOUND",
            "Variable not found",
        ));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn insert_variable(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    module_id: i32,
    variable: &VariableInput,
) -> AppResult<()> {
    if variable.key.trim().is_empty() {
        return Err(AppError::BadRequest("Variable key required".into()));
    }
    sqlx::query(
        "INSERT INTO module_variables (module_id, key, value, category, sensitive, secret_ref) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(module_id)
    .bind(variable.key.trim())
    .bind(variable.value.as_deref())
    .bind(variable.category.unwrap_or(VariableCategory::Terraform))
    .bind(variable.sensitive)
    .bind(variable.secret_ref.as_deref())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Kahn's algorithm over (upstream, downstream) edges. Zero in-degree nodes
/// are emitted in ascending id order so the result is deterministic. On a
/// cycle the unprocessed ids come back as the error.
pub fn topological_sort(module_ids: &[i32], edges: &[(i32, i32)]) -> Result<Vec<i32>, Vec<i32>> {
    let nodes: HashSet<i32> = module_ids.iter().copied().collect();
    let mut in_degree: HashMap<i32, usize> = module_ids.iter().map(|id| (*id, 0)).collect();
    let mut downstream: HashMap<i32, Vec<i32>> = HashMap::new();

    for (upstream, dependent) in edges {
        if !nodes.contains(upstream) || !nodes.contains(dependent) {
            continue;
        }
        *in_degree.entry(*dependent).or_insert(0) += 1;
        downstream.entry(*upstream).or_default().push(*dependent);
    }

    let mut ready: Vec<i32> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    ready.sort_unstable();

    let mut order = Vec::with_capacity(module_ids.len());
    while let Some(next) = ready.first().copied() {
        ready.remove(0);
        order.push(next);
        if let Some(dependents) = downstream.get(&next) {
            for dependent in dependents {
                let degree = in_degree.entry(*dependent).or_insert(0);
                *degree = degree.saturating_sub(1);
                if *degree == 0 {
                    let position = ready.binary_search(dependent).unwrap_or_else(|p| p);
                    ready.insert(position, *dependent);
                }
            }
        }
    }

    if order.len() != module_ids.len() {
        let emitted: HashSet<i32> = order.iter().copied().collect();
        let mut remaining: Vec<i32> = module_ids
            .iter()
            .copied()
            .filter(|id| !emitted.contains(id))
            .collect();
        remaining.sort_unstable();
        return Err(remaining);
    }
    Ok(order)
}

/// Write-time cycle check: would `module_id` depending on each of `proposed`
/// close a loop, given the `retained` (module, depends_on) edges of the rest
/// of the environment? Returns the cycle path when one exists.
pub fn find_dependency_cycle(
    module_id: i32,
    proposed: &[i32],
    retained: &[(i32, i32)],
) -> Option<Vec<i32>> {
    let mut depends_on: HashMap<i32, Vec<i32>> = HashMap::new();
    for (module, dependency) in retained {
        depends_on.entry(*module).or_default().push(*dependency);
    }

    for target in proposed {
        let mut stack = vec![(*target, vec![module_id, *target])];
        let mut visited = HashSet::new();
        while let Some((current, path)) = stack.pop() {
            if current == module_id {
                return Some(path);
            }
            if !visited.insert(current) {
                continue;
            }
            if let Some(next) = depends_on.get(&current) {
                for dependency in next {
                    let mut extended = path.clone();
                    extended.push(*dependency);
                    stack.push((*dependency, extended));
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::{find_dependency_cycle, topological_sort};

    #[test]
    fn sorts_diamond_deterministically() {
        // A(1) -> B(2), A -> C(3), B -> D(4), C -> D
        let order = topological_sort(&[1, 2, 3, 4], &[(1, 2), (1, 3), (2, 4), (3, 4)]).unwrap();
        assert_eq!(order, vec![1, 2, 3, 4]);
    }

    #[test]
    fn tie_break_is_ascending_id() {
        let order = topological_sort(&[5, 3, 9], &[]).unwrap();
        assert_eq!(order, vec![3, 5, 9]);
    }

    #[test]
    fn cycle_reports_remaining_nodes() {
        let err = topological_sort(&[1, 2, 3], &[(1, 2), (2, 3), (3, 2)]).unwrap_err();
        assert_eq!(err, vec![2, 3]);
    }

    #[test]
    fn ignores_edges_outside_the_node_set() {
        let order = topological_sort(&[1, 2], &[(1, 2), (7, 1)]).unwrap();
        assert_eq!(order, vec![1, 2]);
    }

    #[test]
    fn detects_direct_cycle() {
        // Module 2 already depends on 1; proposing 1 -> 2 closes the loop.
        let cycle = find_dependency_cycle(1, &[2], &[(2, 1)]).unwrap();
        assert_eq!(cycle.first(), Some(&1));
        assert_eq!(cycle.last(), Some(&1));
    }

    #[test]
    fn detects_transitive_cycle() {
        // 2 depends on 3, 3 depends on 1; proposing 1 -> 2 is circular.
        let cycle = find_dependency_cycle(1, &[2], &[(2, 3), (3, 1)]).unwrap();
        assert_eq!(cycle, vec![1, 2, 3, 1]);
    }

    #[test]
    fn accepts_acyclic_proposal() {
        assert!(find_dependency_cycle(1, &[2, 3], &[(2, 3)]).is_none());
        assert!(find_dependency_cycle(4, &[], &[(1, 2)]).is_none());
    }
}
