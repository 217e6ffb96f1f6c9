use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    routing::{delete, get, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, PgPool};

use crate::environments::{ensure_unlocked, load_environment};
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::modules::{load_module, VariableCategory};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CloudIntegration {
    pub id: i32,
    pub team: String,
    pub name: String,
    pub provider: String,
    pub credential_config: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct VariableSet {
    pub id: i32,
    pub team: String,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct VariableSetEntry {
    pub id: i32,
    pub variable_set_id: i32,
    pub key: String,
    pub value: Option<String>,
    pub category: VariableCategory,
    pub sensitive: bool,
    pub ci_secret_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Binding {
    pub id: i32,
    pub target_id: i32,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateCloudIntegration {
    pub name: String,
    pub provider: String,
    pub credential_config: Value,
}

#[derive(Debug, Deserialize)]
pub struct UpdateCloudIntegration {
    pub name: Option<String>,
    pub credential_config: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct CreateVariableSet {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EntryInput {
    pub key: String,
    pub value: Option<String>,
    #[serde(default)]
    pub category: Option<VariableCategory>,
    #[serde(default)]
    pub sensitive: bool,
    pub ci_secret_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReplaceEntries {
    pub entries: Vec<EntryInput>,
}

#[derive(Debug, Deserialize)]
pub struct BindRequest {
    pub target_id: i32,
    #[serde(default)]
    pub priority: i32,
}

pub fn routes() -> Router {
    Router::new()
        .route(
            "/v1/cloud-integrations",
            get(list_cloud_integrations).post(create_cloud_integration),
        )
        .route(
            "/v1/cloud-integrations/:id",
            get(get_cloud_integration)
                .patch(update_cloud_integration)
                .delete(delete_cloud_integration),
        )
        .route(
            "/v1/variable-sets",
            get(list_variable_sets).post(create_variable_set),
        )
        .route(
            "/v1/variable-sets/:id",
            get(get_variable_set).delete(delete_variable_set),
        )
        .route("/v1/variable-sets/:id/entries", put(replace_entries))
        .route(
            "/v1/environments/:id/cloud-integrations",
            get(list_environment_ci_bindings).post(bind_environment_ci),
        )
        .route(
            "/v1/environments/:id/cloud-integrations/:binding_id",
            delete(unbind_environment_ci),
        )
        .route(
            "/v1/environments/:id/variable-sets",
            get(list_environment_vs_bindings).post(bind_environment_vs),
        )
        .route(
            "/v1/environments/:id/variable-sets/:binding_id",
            delete(unbind_environment_vs),
        )
        .route(
            "/v1/environments/:id/modules/:module_id/cloud-integrations",
            get(list_module_ci_bindings).post(bind_module_ci),
        )
        .route(
            "/v1/environments/:id/modules/:module_id/cloud-integrations/:binding_id",
            delete(unbind_module_ci),
        )
        .route(
            "/v1/environments/:id/modules/:module_id/variable-sets",
            get(list_module_vs_bindings).post(bind_module_vs),
        )
        .route(
            "/v1/environments/:id/modules/:module_id/variable-sets/:binding_id",
            delete(unbind_module_vs),
        )
}

async fn list_cloud_integrations(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
) -> AppResult<Json<Vec<CloudIntegration>>> {
    let integrations = sqlx::query_as::<_, CloudIntegration>(
        "SELECT id, team, name, provider, credential_config, created_at, updated_at \
         FROM cloud_integrations WHERE team = $1 ORDER BY name",
    )
    .bind(&team)
    .fetch_all(&pool)
    .await?;
    Ok(Json(integrations))
}

async fn create_cloud_integration(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Json(payload): Json<CreateCloudIntegration>,
) -> AppResult<(StatusCode, Json<CloudIntegration>)> {
    if payload.name.trim().is_empty() {
        return Err(AppError::BadRequest("Integration name required".into()));
    }
    let result = sqlx::query_as::<_, CloudIntegration>(
        r#"
        INSERT INTO cloud_integrations (team, name, provider, credential_config)
        VALUES ($1, $2, $3, $4)
        RETURNING id, team, name, provider, credential_config, created_at, updated_at
        "#,
    )
    .bind(&team)
    .bind(payload.name.trim())
    .bind(&payload.provider)
    .bind(&payload.credential_config)
    .fetch_one(&pool)
    .await;
    match result {
        Ok(integration) => Ok((StatusCode::CREATED, Json(integration))),
        Err(e) => {
            if let sqlx::Error::Database(db_err) = &e {
                if db_err.constraint() == Some("cloud_integrations_team_name_key") {
                    return Err(AppError::AlreadyExists(
                        "Integration name already in use".into(),
                    ));
                }
            }
            Err(AppError::Db(e))
        }
    }
}

async fn load_cloud_integration(
    pool: &PgPool,
    id: i32,
    team: &str,
) -> AppResult<CloudIntegration> {
    let integration = sqlx::query_as::<_, CloudIntegration>(
        "SELECT id, team, name, provider, credential_config, created_at, updated_at \
         FROM cloud_integrations WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    match integration {
        Some(integration) if integration.team == team => Ok(integration),
        _ => Err(AppError::not_found(
            "INTEGRATION_NOT_FOUND",
            "Cloud integration not found",
        )),
    }
}

async fn get_cloud_integration(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path(id): Path<i32>,
) -> AppResult<Json<CloudIntegration>> {
    let integration = load_cloud_integration(&pool, id, &team).await?;
    Ok(Json(integration))
}

async fn update_cloud_integration(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path(id): Path<i32>,
    Json(payload): Json<UpdateCloudIntegration>,
) -> AppResult<Json<CloudIntegration>> {
    let integration = load_cloud_integration(&pool, id, &team).await?;
    let updated = sqlx::query_as::<_, CloudIntegration>(
        r#"
        UPDATE cloud_integrations SET
            name = COALESCE($2, name),
            credential_config = COALESCE($3, credential_config),
            updated_at = NOW()
        WHERE id = $1
        RETURNING id, team, name, provider, credential_config, created_at, updated_at
        "#,
    )
    .bind(integration.id)
    .bind(payload.name.as_deref())
    .bind(payload.credential_config.as_ref())
    .fetch_one(&pool)
    .await?;
    Ok(Json(updated))
}

async fn delete_cloud_integration(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path(id): Path<i32>,
) -> AppResult<StatusCode> {
    let integration = load_cloud_integration(&pool, id, &team).await?;
    let bound: i64 = sqlx::query_scalar(
        "SELECT (SELECT COUNT(*) FROM environment_cloud_integrations WHERE cloud_integration_id = $1) \
         + (SELECT COUNT(*) FROM module_cloud_integrations WHERE cloud_integration_id = $1)",
    )
    .bind(integration.id)
    .fetch_one(&pool)
    .await?;
    if bound > 0 {
        return Err(AppError::Conflict(
            "Cloud integration is bound to environments or modules".into(),
        ));
    }
    sqlx::query("DELETE FROM cloud_integrations WHERE id = $1")
        .bind(integration.id)
        .execute(&pool)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_variable_sets(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
) -> AppResult<Json<Vec<VariableSet>>> {
    let sets = sqlx::query_as::<_, VariableSet>(
        "SELECT id, team, name, description, created_at, updated_at \
         FROM variable_sets WHERE team = $1 ORDER BY name",
    )
    .bind(&team)
    .fetch_all(&pool)
    .await?;
    Ok(Json(sets))
}

async fn create_variable_set(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Json(payload): Json<CreateVariableSet>,
) -> AppResult<(StatusCode, Json<VariableSet>)> {
    if payload.name.trim().is_empty() {
        return Err(AppError::BadRequest("Variable set name required".into()));
    }
    let result = sqlx::query_as::<_, VariableSet>(
        r#"
        INSERT INTO variable_sets (team, name, description)
        VALUES ($1, $2, $3)
        RETURNING id, team, name, description, created_at, updated_at
        "#,
    )
    .bind(&team)
    .bind(payload.name.trim())
    .bind(payload.description.as_deref())
    .fetch_one(&pool)
    .await;
    match result {
        Ok(set) => Ok((StatusCode::CREATED, Json(set))),
        Err(e) => {
            if let sqlx::Error::Database(db_err) = &e {
                if db_err.constraint() == Some("variable_sets_team_name_key") {
                    return Err(AppError::AlreadyExists(
                        "Variable set name already in use".into(),
                    ));
                }
            }
            Err(AppError::Db(e))
        }
    }
}

async fn load_variable_set(pool: &PgPool, id: i32, team: &str) -> AppResult<VariableSet> {
    let set = sqlx::query_as::<_, VariableSet>(
        "SELECT id, team, name, description, created_at, updated_at FROM variable_sets WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    match set {
        Some(set) if set.team == team => Ok(set),
        _ => Err(AppError::not_found(
            "VARIABLE_SET_NOT_FOUND",
            "Variable set not found",
        )),
    }
}

#[derive(Debug, Serialize)]
pub struct VariableSetDetail {
    #[serde(flatten)]
    pub set: VariableSet,
    pub entries: Vec<VariableSetEntry>,
}

async fn get_variable_set(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path(id): Path<i32>,
) -> AppResult<Json<VariableSetDetail>> {
    let set = load_variable_set(&pool, id, &team).await?;
    let mut entries = sqlx::query_as::<_, VariableSetEntry>(
        "SELECT id, variable_set_id, key, value, category, sensitive, ci_secret_name \
         FROM variable_set_entries WHERE variable_set_id = $1 ORDER BY key",
    )
    .bind(set.id)
    .fetch_all(&pool)
    .await?;
    for entry in &mut entries {
        if entry.sensitive {
            entry.value = None;
        }
    }
    Ok(Json(VariableSetDetail { set, entries }))
}

async fn delete_variable_set(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path(id): Path<i32>,
) -> AppResult<StatusCode> {
    let set = load_variable_set(&pool, id, &team).await?;
    let bound: i64 = sqlx::query_scalar(
        "SELECT (SELECT COUNT(*) FROM environment_variable_sets WHERE variable_set_id = $1) \
         + (SELECT COUNT(*) FROM module_variable_sets WHERE variable_set_id = $1)",
    )
    .bind(set.id)
    .fetch_one(&pool)
    .await?;
    if bound > 0 {
        return Err(AppError::Conflict(
            "Variable set is bound to environments or modules".into(),
        ));
    }
    sqlx::query("DELETE FROM variable_sets WHERE id = $1")
        .bind(set.id)
        .execute(&pool)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Atomic replace: the previous entry list is gone the instant the new one
/// lands, never observable half-written.
async fn replace_entries(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path(id): Path<i32>,
    Json(payload): Json<ReplaceEntries>,
) -> AppResult<StatusCode> {
    let set = load_variable_set(&pool, id, &team).await?;
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM variable_set_entries WHERE variable_set_id = $1")
        .bind(set.id)
        .execute(&mut *tx)
        .await?;
    for entry in &payload.entries {
        if entry.key.trim().is_empty() {
            return Err(AppError::BadRequest("Entry key required".into()));
        }
        sqlx::query(
            "INSERT INTO variable_set_entries \
             (variable_set_id, key, value, category, sensitive, ci_secret_name) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(set.id)
        .bind(entry.key.trim())
        .bind(entry.value.as_deref())
        .bind(entry.category.unwrap_or(VariableCategory::Terraform))
        .bind(entry.sensitive)
        .bind(entry.ci_secret_name.as_deref())
        .execute(&mut *tx)
        .await?;
    }
    sqlx::query("UPDATE variable_sets SET updated_at = NOW() WHERE id = $1")
        .bind(set.id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(StatusCode::NO_CONTENT)
}

// Binding handlers. Environment- and module-level bindings share shape; the
// four table names differ, so each pair gets its own thin handler.

async fn list_bindings_for(
    pool: &PgPool,
    table: &str,
    owner_column: &str,
    target_column: &str,
    owner_id: i32,
) -> AppResult<Vec<Binding>> {
    let query = format!(
        "SELECT id, {target_column} AS target_id, priority, created_at \
         FROM {table} WHERE {owner_column} = $1 ORDER BY priority, id"
    );
    let bindings = sqlx::query_as::<_, Binding>(&query)
        .bind(owner_id)
        .fetch_all(pool)
        .await?;
    Ok(bindings)
}

async fn insert_binding(
    pool: &PgPool,
    table: &str,
    owner_column: &str,
    target_column: &str,
    owner_id: i32,
    target_id: i32,
    priority: i32,
) -> AppResult<Binding> {
    let query = format!(
        "INSERT INTO {table} ({owner_column}, {target_column}, priority) VALUES ($1, $2, $3) \
         RETURNING id, {target_column} AS target_id, priority, created_at"
    );
    let result = sqlx::query_as::<_, Binding>(&query)
        .bind(owner_id)
        .bind(target_id)
        .bind(priority)
        .fetch_one(pool)
        .await;
    match result {
        Ok(binding) => Ok(binding),
        Err(sqlx::Error::Database(db_err)) if db_err.constraint().is_some() => {
            let constraint = db_err.constraint().unwrap_or_default().to_string();
            if constraint.ends_with("_key") {
                Err(AppError::AlreadyExists("Binding already exists".into()))
            } else {
                Err(AppError::not_found(
                    "BINDING_TARGET_NOT_FOUND",
                    "Binding target not found",
                ))
            }
        }
        Err(e) => Err(AppError::Db(e)),
    }
}

async fn delete_binding_for(
    pool: &PgPool,
    table: &str,
    owner_column: &str,
    owner_id: i32,
    binding_id: i32,
) -> AppResult<()> {
    let query = format!("DELETE FROM {table} WHERE id = $1 AND {owner_column} = $2");
    let result = sqlx::query(&query)
        .bind(binding_id)
        .bind(owner_id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(AppError::not_found("BINDING_NOT_FOUND", "Binding not found"));
    }
    Ok(())
}

async fn list_environment_ci_bindings(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path(id): Path<i32>,
) -> AppResult<Json<Vec<Binding>>> {
    let environment = load_environment(&pool, id, &team).await?;
    let bindings = list_bindings_for(
        &pool,
        "environment_cloud_integrations",
        "environment_id",
        "cloud_integration_id",
        environment.id,
    )
    .await?;
    Ok(Json(bindings))
}

async fn bind_environment_ci(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path(id): Path<i32>,
    Json(payload): Json<BindRequest>,
) -> AppResult<(StatusCode, Json<Binding>)> {
    let environment = load_environment(&pool, id, &team).await?;
    ensure_unlocked(&environment)?;
    load_cloud_integration(&pool, payload.target_id, &team).await?;
    let binding = insert_binding(
        &pool,
        "environment_cloud_integrations",
        "environment_id",
        "cloud_integration_id",
        environment.id,
        payload.target_id,
        payload.priority,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(binding)))
}

async fn unbind_environment_ci(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path((id, binding_id)): Path<(i32, i32)>,
) -> AppResult<StatusCode> {
    let environment = load_environment(&pool, id, &team).await?;
    delete_binding_for(
        &pool,
        "environment_cloud_integrations",
        "environment_id",
        environment.id,
        binding_id,
    )
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_environment_vs_bindings(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path(id): Path<i32>,
) -> AppResult<Json<Vec<Binding>>> {
    let environment = load_environment(&pool, id, &team).await?;
    let bindings = list_bindings_for(
        &pool,
        "environment_variable_sets",
        "environment_id",
        "variable_set_id",
        environment.id,
    )
    .await?;
    Ok(Json(bindings))
}

async fn bind_environment_vs(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path(id): Path<i32>,
    Json(payload): Json<BindRequest>,
) -> AppResult<(StatusCode, Json<Binding>)> {
    let environment = load_environment(&pool, id, &team).await?;
    ensure_unlocked(&environment)?;
    load_variable_set(&pool, payload.target_id, &team).await?;
    let binding = insert_binding(
        &pool,
        "environment_variable_sets",
        "environment_id",
        "variable_set_id",
        environment.id,
        payload.target_id,
        payload.priority,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(binding)))
}

async fn unbind_environment_vs(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path((id, binding_id)): Path<(i32, i32)>,
) -> AppResult<StatusCode> {
    let environment = load_environment(&pool, id, &team).await?;
    delete_binding_for(
        &pool,
        "environment_variable_sets",
        "environment_id",
        environment.id,
        binding_id,
    )
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_module_ci_bindings(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path((id, module_id)): Path<(i32, i32)>,
) -> AppResult<Json<Vec<Binding>>> {
    let environment = load_environment(&pool, id, &team).await?;
    let module = load_module(&pool, environment.id, module_id).await?;
    let bindings = list_bindings_for(
        &pool,
        "module_cloud_integrations",
        "module_id",
        "cloud_integration_id",
        module.id,
    )
    .await?;
    Ok(Json(bindings))
}

async fn bind_module_ci(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path((id, module_id)): Path<(i32, i32)>,
    Json(payload): Json<BindRequest>,
) -> AppResult<(StatusCode, Json<Binding>)> {
    let environment = load_environment(&pool, id, &team).await?;
    ensure_unlocked(&environment)?;
    let module = load_module(&pool, environment.id, module_id).await?;
    load_cloud_integration(&pool, payload.target_id, &team).await?;
    let binding = insert_binding(
        &pool,
        "module_cloud_integrations",
        "module_id",
        "cloud_integration_id",
        module.id,
        payload.target_id,
        payload.priority,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(binding)))
}

async fn unbind_module_ci(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path((id, module_id, binding_id)): Path<(i32, i32, i32)>,
) -> AppResult<StatusCode> {
    let environment = load_environment(&pool, id, &team).await?;
    let module = load_module(&pool, environment.id, module_id).await?;
    delete_binding_for(
        &pool,
        "module_cloud_integrations",
        "module_id",
        module.id,
        binding_id,
    )
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_module_vs_bindings(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path((id, module_id)): Path<(i32, i32)>,
) -> AppResult<Json<Vec<Binding>>> {
    let environment = load_environment(&pool, id, &team).await?;
    let module = load_module(&pool, environment.id, module_id).await?;
    let bindings = list_bindings_for(
        &pool,
        "module_variable_sets",
        "module_id",
        "variable_set_id",
        module.id,
    )
    .await?;
    Ok(Json(bindings))
}

async fn bind_module_vs(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path((id, module_id)): Path<(i32, i32)>,
    Json(payload): Json<BindRequest>,
) -> AppResult<(StatusCode, Json<Binding>)> {
    let environment = load_environment(&pool, id, &team).await?;
    ensure_unlocked(&environment)?;
    let module = load_module(&pool, environment.id, module_id).await?;
    load_variable_set(&pool, payload.target_id, &team).await?;
    let binding = insert_binding(
        &pool,
        "module_variable_sets",
        "module_id",
        "variable_set_id",
        module.id,
        payload.target_id,
        payload.priority,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(binding)))
}

async fn unbind_module_vs(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path((id, module_id, binding_id)): Path<(i32, i32, i32)>,
) -> AppResult<StatusCode> {
    let environment = load_environment(&pool, id, &team).await?;
    let module = load_module(&pool, environment.id, module_id).await?;
    delete_binding_for(
        &pool,
        "module_variable_sets",
        "module_id",
        module.id,
        binding_id,
    )
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Module bindings replace environment bindings outright when present.
pub async fn effective_cloud_integrations(
    pool: &PgPool,
    module_id: i32,
    environment_id: i32,
) -> AppResult<Vec<CloudIntegration>> {
    let module_bound = sqlx::query_as::<_, CloudIntegration>(
        r#"
        SELECT c.id, c.team, c.name, c.provider, c.credential_config, c.created_at, c.updated_at
        FROM module_cloud_integrations b
        JOIN cloud_integrations c ON c.id = b.cloud_integration_id
        WHERE b.module_id = $1
        ORDER BY b.priority, b.id
        "#,
    )
    .bind(module_id)
    .fetch_all(pool)
    .await?;
    if !module_bound.is_empty() {
        return Ok(module_bound);
    }
    let environment_bound = sqlx::query_as::<_, CloudIntegration>(
        r#"
        SELECT c.id, c.team, c.name, c.provider, c.credential_config, c.created_at, c.updated_at
        FROM environment_cloud_integrations b
        JOIN cloud_integrations c ON c.id = b.cloud_integration_id
        WHERE b.environment_id = $1
        ORDER BY b.priority, b.id
        "#,
    )
    .bind(environment_id)
    .fetch_all(pool)
    .await?;
    Ok(environment_bound)
}

/// Same override rule for variable sets; entries come back per set, in
/// binding priority order.
pub async fn effective_variable_set_entries(
    pool: &PgPool,
    module_id: i32,
    environment_id: i32,
) -> AppResult<Vec<VariableSetEntry>> {
    // The override keys on bindings existing, not on the bound sets having
    // entries: an empty module-bound set still masks the environment's.
    let module_bindings: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM module_variable_sets WHERE module_id = $1")
            .bind(module_id)
            .fetch_one(pool)
            .await?;
    if module_bindings > 0 {
        let module_bound = sqlx::query_as::<_, VariableSetEntry>(
            r#"
            SELECT e.id, e.variable_set_id, e.key, e.value, e.category, e.sensitive, e.ci_secret_name
            FROM module_variable_sets b
            JOIN variable_set_entries e ON e.variable_set_id = b.variable_set_id
            WHERE b.module_id = $1
            ORDER BY b.priority, b.id, e.key
            "#,
        )
        .bind(module_id)
        .fetch_all(pool)
        .await?;
        return Ok(module_bound);
    }
    let environment_bound = sqlx::query_as::<_, VariableSetEntry>(
        r#"
        SELECT e.id, e.variable_set_id, e.key, e.value, e.category, e.sensitive, e.ci_secret_name
        FROM environment_variable_sets b
        JOIN variable_set_entries e ON e.variable_set_id = b.variable_set_id
        WHERE b.environment_id = $1
        ORDER BY b.priority, b.id, e.key
        "#,
    )
    .bind(environment_id)
    .fetch_all(pool)
    .await?;
    Ok(environment_bound)
}
