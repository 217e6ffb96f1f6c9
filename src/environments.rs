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

use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::modules::{EnvironmentModule, ModuleDependency};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "environment_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentStatus {
    Active,
    Archived,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Environment {
    pub id: i32,
    pub team: String,
    pub name: String,
    pub description: Option<String>,
    pub locked: bool,
    pub locked_by: Option<i32>,
    pub locked_at: Option<DateTime<Utc>>,
    pub lock_reason: Option<String>,
    pub status: EnvironmentStatus,
    pub module_count: i32,
    pub total_resources: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const ENVIRONMENT_COLUMNS: &str = "id, team, name, description, locked, locked_by, locked_at, \
     lock_reason, status, module_count, total_resources, created_at, updated_at";

#[derive(Debug, Deserialize)]
pub struct CreateEnvironment {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateEnvironment {
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: Option<EnvironmentStatus>,
}

#[derive(Debug, Deserialize)]
pub struct LockRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListEnvironmentsQuery {
    pub status: Option<EnvironmentStatus>,
}

pub fn routes() -> Router {
    Router::new()
        .route(
            "/v1/environments",
            get(list_environments).post(create_environment),
        )
        .route(
            "/v1/environments/:id",
            get(get_environment_handler)
                .patch(update_environment)
                .delete(archive_environment),
        )
        .route("/v1/environments/:id/lock", post(lock_environment))
        .route("/v1/environments/:id/unlock", post(unlock_environment))
        .route("/v1/environments/:id/graph", get(environment_graph))
}

/// Load a team's environment. Cross-team ids surface as 404 so existence is
/// never leaked.
pub async fn load_environment(pool: &PgPool, id: i32, team: &str) -> AppResult<Environment> {
    let query = format!("SELECT {ENVIRONMENT_COLUMNS} FROM environments WHERE id = $1");
    let environment = sqlx::query_as::<_, Environment>(&query)
        .bind(id)
        .fetch_optional(pool)
        .await?;
    match environment {
        Some(environment) if environment.team == team => Ok(environment),
        _ => Err(AppError::not_found(
            "ENVIRONMENT_NOT_FOUND",
            "Environment not found",
        )),
    }
}

/// Mutations of a locked environment fail with 423.
pub fn ensure_unlocked(environment: &Environment) -> AppResult<()> {
    if environment.locked {
        return Err(AppError::Locked(format!(
            "Environment {} is locked{}",
            environment.name,
            environment
                .lock_reason
                .as_deref()
                .map(|reason| format!(": {}", reason))
                .unwrap_or_default()
        )));
    }
    Ok(())
}

async fn list_environments(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Query(params): Query<ListEnvironmentsQuery>,
) -> AppResult<Json<Vec<Environment>>> {
    let environments = match params.status {
        Some(status) => {
            let query = format!(
                "SELECT {ENVIRONMENT_COLUMNS} FROM environments \
                 WHERE team = $1 AND status = $2 ORDER BY name"
            );
            sqlx::query_as::<_, Environment>(&query)
                .bind(&team)
                .bind(status)
                .fetch_all(&pool)
                .await?
        }
        None => {
            let query = format!(
                "SELECT {ENVIRONMENT_COLUMNS} FROM environments \
                 WHERE team = $1 AND status <> 'archived' ORDER BY name"
            );
            sqlx::query_as::<_, Environment>(&query)
                .bind(&team)
                .fetch_all(&pool)
                .await?
        }
    };
    Ok(Json(environments))
}

async fn create_environment(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Json(payload): Json<CreateEnvironment>,
) -> AppResult<(StatusCode, Json<Environment>)> {
    if payload.name.trim().is_empty() {
        return Err(AppError::BadRequest("Environment name required".into()));
    }
    let query = format!(
        "INSERT INTO environments (team, name, description) VALUES ($1, $2, $3) \
         RETURNING {ENVIRONMENT_COLUMNS}"
    );
    let result = sqlx::query_as::<_, Environment>(&query)
        .bind(&team)
        .bind(payload.name.trim())
        .bind(payload.description.as_deref())
        .fetch_one(&pool)
        .await;
    match result {
        Ok(environment) => Ok((StatusCode::CREATED, Json(environment))),
        Err(e) => {
            if let sqlx::Error::Database(db_err) = &e {
                if db_err.constraint() == Some("environments_team_name_key") {
                    return Err(AppError::AlreadyExists(
                        "Environment name already in use".into(),
                    ));
                }
            }
            Err(AppError::Db(e))
        }
    }
}

async fn get_environment_handler(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path(id): Path<i32>,
) -> AppResult<Json<Environment>> {
    let environment = load_environment(&pool, id, &team).await?;
    Ok(Json(environment))
}

async fn update_environment(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path(id): Path<i32>,
    Json(payload): Json<UpdateEnvironment>,
) -> AppResult<Json<Environment>> {
    let environment = load_environment(&pool, id, &team).await?;
    ensure_unlocked(&environment)?;
    let query = format!(
        "UPDATE environments SET \
         name = COALESCE($2, name), \
         description = COALESCE($3, description), \
         status = COALESCE($4, status), \
         updated_at = NOW() \
         WHERE id = $1 RETURNING {ENVIRONMENT_COLUMNS}"
    );
    let updated = sqlx::query_as::<_, Environment>(&query)
        .bind(environment.id)
        .bind(payload.name.as_deref())
        .bind(payload.description.as_deref())
        .bind(payload.status)
        .fetch_one(&pool)
        .await?;
    Ok(Json(updated))
}

async fn archive_environment(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path(id): Path<i32>,
) -> AppResult<StatusCode> {
    let environment = load_environment(&pool, id, &team).await?;
    ensure_unlocked(&environment)?;
    sqlx::query("UPDATE environments SET status = 'archived', updated_at = NOW() WHERE id = $1")
        .bind(environment.id)
        .execute(&pool)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn lock_environment(
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id, team, .. }: AuthUser,
    Path(id): Path<i32>,
    Json(payload): Json<LockRequest>,
) -> AppResult<Json<Environment>> {
    let environment = load_environment(&pool, id, &team).await?;
    if environment.locked {
        return Err(AppError::Conflict("Environment already locked".into()));
    }
    let query = format!(
        "UPDATE environments SET locked = TRUE, locked_by = $2, locked_at = NOW(), \
         lock_reason = $3, updated_at = NOW() WHERE id = $1 RETURNING {ENVIRONMENT_COLUMNS}"
    );
    let updated = sqlx::query_as::<_, Environment>(&query)
        .bind(environment.id)
        .bind(user_id)
        .bind(payload.reason.as_deref())
        .fetch_one(&pool)
        .await?;
    Ok(Json(updated))
}

async fn unlock_environment(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path(id): Path<i32>,
) -> AppResult<Json<Environment>> {
    let environment = load_environment(&pool, id, &team).await?;
    if !environment.locked {
        return Err(AppError::Conflict("Environment is not locked".into()));
    }
    let query = format!(
        "UPDATE environments SET locked = FALSE, locked_by = NULL, locked_at = NULL, \
         lock_reason = NULL, updated_at = NOW() WHERE id = $1 RETURNING {ENVIRONMENT_COLUMNS}"
    );
    let updated = sqlx::query_as::<_, Environment>(&query)
        .bind(environment.id)
        .fetch_one(&pool)
        .await?;
    Ok(Json(updated))
}

#[derive(Debug, Serialize)]
pub struct GraphNode {
    pub id: i32,
    pub name: String,
    pub artifact_namespace: String,
    pub artifact_name: String,
    pub current_version: Option<String>,
    pub last_run_status: Option<String>,
    pub last_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct GraphEdge {
    pub from: i32,
    pub to: i32,
    pub output_mapping: Value,
}

#[derive(Debug, Serialize)]
pub struct EnvironmentGraph {
    pub environment_id: i32,
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

async fn environment_graph(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path(id): Path<i32>,
) -> AppResult<Json<EnvironmentGraph>> {
    let environment = load_environment(&pool, id, &team).await?;
    let modules = crate::modules::list_environment_modules(&pool, environment.id).await?;
    let edges = crate::modules::list_environment_dependencies(&pool, environment.id).await?;

    let nodes = modules
        .into_iter()
        .map(|module: EnvironmentModule| GraphNode {
            id: module.id,
            name: module.name,
            artifact_namespace: module.artifact_namespace,
            artifact_name: module.artifact_name,
            current_version: module.current_version,
            last_run_status: module.last_run_status,
            last_run_at: module.last_run_at,
        })
        .collect();
    let edges = edges
        .into_iter()
        .map(|edge: ModuleDependency| GraphEdge {
            from: edge.depends_on_id,
            to: edge.module_id,
            output_mapping: edge.output_mapping,
        })
        .collect();

    Ok(Json(EnvironmentGraph {
        environment_id: environment.id,
        nodes,
        edges,
    }))
}
