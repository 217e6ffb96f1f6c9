use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::{FromRow, PgPool, QueryBuilder};

use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::pagination::{page_limit, Cursor};

static NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]{0,63}$").expect("valid pattern"));

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "artifact_type", rename_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactType {
    IacModule,
    IacProvider,
    Chart,
    PolicyBundle,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "artifact_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Active,
    Deprecated,
    Archived,
}

/// Storage backend descriptor. Unknown payloads round-trip untouched so a
/// newer writer never loses data through an older reader.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StorageConfig {
    Known(KnownStorageConfig),
    Unknown(Value),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum KnownStorageConfig {
    Git {
        repo: String,
        #[serde(default)]
        tag_prefix: Option<String>,
        #[serde(default)]
        path: Option<String>,
    },
    Oci {
        reference: String,
    },
}

impl StorageConfig {
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_else(|_| StorageConfig::Unknown(value.clone()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Artifact {
    pub id: i32,
    pub namespace: String,
    pub name: String,
    pub provider: Option<String>,
    pub artifact_type: ArtifactType,
    pub team: String,
    pub description: Option<String>,
    pub storage_config: Value,
    pub source_config: Option<Value>,
    pub approval_policy: Option<Value>,
    pub tags: Value,
    pub category: Option<String>,
    pub status: ArtifactStatus,
    pub download_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const ARTIFACT_COLUMNS: &str = "id, namespace, name, provider, artifact_type, team, description, \
     storage_config, source_config, approval_policy, tags, category, status, download_count, \
     created_at, updated_at";

#[derive(Debug, Deserialize)]
pub struct CreateArtifact {
    pub namespace: String,
    pub name: String,
    pub provider: Option<String>,
    pub artifact_type: ArtifactType,
    pub description: Option<String>,
    pub storage_config: Value,
    pub source_config: Option<Value>,
    pub approval_policy: Option<Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub category: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateArtifact {
    pub description: Option<String>,
    pub storage_config: Option<Value>,
    pub source_config: Option<Value>,
    pub approval_policy: Option<Value>,
    pub tags: Option<Vec<String>>,
    pub category: Option<String>,
    pub status: Option<ArtifactStatus>,
}

#[derive(Debug, Deserialize)]
pub struct ListArtifactsQuery {
    pub artifact_type: Option<ArtifactType>,
    pub category: Option<String>,
    pub tag: Option<String>,
    pub status: Option<ArtifactStatus>,
    pub search: Option<String>,
    pub cursor: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ProviderQuery {
    pub provider: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ArtifactPage {
    pub items: Vec<Artifact>,
    pub next_cursor: Option<String>,
}

pub fn routes() -> Router {
    Router::new()
        .route("/v1/artifacts", get(list_artifacts).post(create_artifact))
        .route("/v1/artifacts/facets", get(artifact_facets))
        .route(
            "/v1/artifacts/:namespace/:name",
            get(get_artifact_handler)
                .patch(update_artifact)
                .delete(archive_artifact),
        )
        .route(
            "/v1/artifacts/:namespace/:name/deprecate",
            post(deprecate_artifact),
        )
}

/// Look up an artifact by its identity triple. `provider` distinguishes
/// provider artifacts sharing a namespace/name pair.
pub async fn find_artifact(
    pool: &PgPool,
    namespace: &str,
    name: &str,
    provider: Option<&str>,
) -> AppResult<Artifact> {
    let query = format!(
        "SELECT {ARTIFACT_COLUMNS} FROM artifacts \
         WHERE namespace = $1 AND name = $2 AND COALESCE(provider, '') = COALESCE($3, '')"
    );
    let artifact = sqlx::query_as::<_, Artifact>(&query)
        .bind(namespace)
        .bind(name)
        .bind(provider)
        .fetch_optional(pool)
        .await?;
    artifact.ok_or_else(|| AppError::not_found("ARTIFACT_NOT_FOUND", "Artifact not found"))
}

async fn list_artifacts(
    Extension(pool): Extension<PgPool>,
    AuthUser { .. }: AuthUser,
    Query(params): Query<ListArtifactsQuery>,
) -> AppResult<Json<ArtifactPage>> {
    let limit = page_limit(params.limit);
    let mut builder = QueryBuilder::new(format!(
        "SELECT {ARTIFACT_COLUMNS} FROM artifacts WHERE 1 = 1"
    ));

    match params.status {
        Some(status) => {
            builder.push(" AND status = ");
            builder.push_bind(status);
        }
        // Archived artifacts never show up unless asked for.
        None => {
            builder.push(" AND status <> 'archived'");
        }
    }
    if let Some(artifact_type) = params.artifact_type {
        builder.push(" AND artifact_type = ");
        builder.push_bind(artifact_type);
    }
    if let Some(category) = params.category.as_ref() {
        builder.push(" AND category = ");
        builder.push_bind(category);
    }
    if let Some(tag) = params.tag.as_ref() {
        builder.push(" AND tags @> ");
        builder.push_bind(json!([tag]));
    }
    if let Some(search) = params.search.as_ref() {
        builder.push(" AND (name ILIKE ");
        builder.push_bind(format!("%{}%", search));
        builder.push(" OR namespace ILIKE ");
        builder.push_bind(format!("%{}%", search));
        builder.push(")");
    }
    if let Some(raw) = params.cursor.as_ref() {
        let cursor = Cursor::decode(raw)?;
        let sort_value: DateTime<Utc> = serde_json::from_value(cursor.sort_value)
            .map_err(|_| AppError::BadRequest("Malformed cursor".into()))?;
        builder.push(" AND (updated_at, id) < (");
        builder.push_bind(sort_value);
        builder.push(", ");
        builder.push_bind(cursor.id as i32);
        builder.push(")");
    }
    builder.push(" ORDER BY updated_at DESC, id DESC LIMIT ");
    builder.push_bind(limit + 1);

    let mut items = builder
        .build_query_as::<Artifact>()
        .fetch_all(&pool)
        .await?;

    let next_cursor = if items.len() as i64 > limit {
        items.truncate(limit as usize);
        items.last().map(|artifact| {
            Cursor::new(
                serde_json::to_value(artifact.updated_at).unwrap_or(Value::Null),
                artifact.id as i64,
            )
            .encode()
        })
    } else {
        None
    };

    Ok(Json(ArtifactPage { items, next_cursor }))
}

async fn create_artifact(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Json(payload): Json<CreateArtifact>,
) -> AppResult<(StatusCode, Json<Artifact>)> {
    if !NAME_PATTERN.is_match(&payload.namespace) {
        return Err(AppError::BadRequest("Invalid namespace".into()));
    }
    if !NAME_PATTERN.is_match(&payload.name) {
        return Err(AppError::BadRequest("Invalid artifact name".into()));
    }
    if let Some(provider) = payload.provider.as_deref() {
        if !NAME_PATTERN.is_match(provider) {
            return Err(AppError::BadRequest("Invalid provider".into()));
        }
    }
    match StorageConfig::from_value(&payload.storage_config) {
        StorageConfig::Known(KnownStorageConfig::Git { ref repo, .. }) => {
            url::Url::parse(repo)
                .map_err(|_| AppError::BadRequest("storage_config.repo must be a URL".into()))?;
        }
        StorageConfig::Known(KnownStorageConfig::Oci { .. }) => {}
        StorageConfig::Unknown(_) => {
            return Err(AppError::BadRequest(
                "storage_config must describe a git or oci backend".into(),
            ));
        }
    }

    let query = format!(
        "INSERT INTO artifacts (namespace, name, provider, artifact_type, team, description, \
         storage_config, source_config, approval_policy, tags, category) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
         RETURNING {ARTIFACT_COLUMNS}"
    );
    let result = sqlx::query_as::<_, Artifact>(&query)
        .bind(&payload.namespace)
        .bind(&payload.name)
        .bind(payload.provider.as_deref())
        .bind(payload.artifact_type)
        .bind(&team)
        .bind(payload.description.as_deref())
        .bind(&payload.storage_config)
        .bind(payload.source_config.as_ref())
        .bind(payload.approval_policy.as_ref())
        .bind(json!(payload.tags))
        .bind(payload.category.as_deref())
        .fetch_one(&pool)
        .await;

    match result {
        Ok(artifact) => Ok((StatusCode::CREATED, Json(artifact))),
        Err(e) => {
            if let sqlx::Error::Database(db_err) = &e {
                if db_err.constraint() == Some("artifacts_namespace_name_provider_key") {
                    return Err(AppError::AlreadyExists("Artifact already exists".into()));
                }
            }
            Err(AppError::Db(e))
        }
    }
}

async fn get_artifact_handler(
    Extension(pool): Extension<PgPool>,
    AuthUser { .. }: AuthUser,
    Path((namespace, name)): Path<(String, String)>,
    Query(params): Query<ProviderQuery>,
) -> AppResult<Json<Artifact>> {
    let artifact = find_artifact(&pool, &namespace, &name, params.provider.as_deref()).await?;
    Ok(Json(artifact))
}

async fn update_artifact(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path((namespace, name)): Path<(String, String)>,
    Query(params): Query<ProviderQuery>,
    Json(payload): Json<UpdateArtifact>,
) -> AppResult<Json<Artifact>> {
    let artifact = find_artifact(&pool, &namespace, &name, params.provider.as_deref()).await?;
    if artifact.team != team {
        return Err(AppError::not_found("ARTIFACT_NOT_FOUND", "Artifact not found"));
    }

    let query = format!(
        "UPDATE artifacts SET \
         description = COALESCE($2, description), \
         storage_config = COALESCE($3, storage_config), \
         source_config = COALESCE($4, source_config), \
         approval_policy = COALESCE($5, approval_policy), \
         tags = COALESCE($6, tags), \
         category = COALESCE($7, category), \
         status = COALESCE($8, status), \
         updated_at = NOW() \
         WHERE id = $1 \
         RETURNING {ARTIFACT_COLUMNS}"
    );
    let updated = sqlx::query_as::<_, Artifact>(&query)
        .bind(artifact.id)
        .bind(payload.description.as_deref())
        .bind(payload.storage_config.as_ref())
        .bind(payload.source_config.as_ref())
        .bind(payload.approval_policy.as_ref())
        .bind(payload.tags.map(|tags| json!(tags)))
        .bind(payload.category.as_deref())
        .bind(payload.status)
        .fetch_one(&pool)
        .await?;
    Ok(Json(updated))
}

async fn archive_artifact(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path((namespace, name)): Path<(String, String)>,
    Query(params): Query<ProviderQuery>,
) -> AppResult<StatusCode> {
    let artifact = find_artifact(&pool, &namespace, &name, params.provider.as_deref()).await?;
    if artifact.team != team {
        return Err(AppError::not_found("ARTIFACT_NOT_FOUND", "Artifact not found"));
    }
    sqlx::query("UPDATE artifacts SET status = 'archived', updated_at = NOW() WHERE id = $1")
        .bind(artifact.id)
        .execute(&pool)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn deprecate_artifact(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path((namespace, name)): Path<(String, String)>,
    Query(params): Query<ProviderQuery>,
) -> AppResult<Json<Artifact>> {
    let artifact = find_artifact(&pool, &namespace, &name, params.provider.as_deref()).await?;
    if artifact.team != team {
        return Err(AppError::not_found("ARTIFACT_NOT_FOUND", "Artifact not found"));
    }
    let query = format!(
        "UPDATE artifacts SET status = 'deprecated', updated_at = NOW() WHERE id = $1 \
         RETURNING {ARTIFACT_COLUMNS}"
    );
    let updated = sqlx::query_as::<_, Artifact>(&query)
        .bind(artifact.id)
        .fetch_one(&pool)
        .await?;
    Ok(Json(updated))
}

#[derive(Debug, Serialize, FromRow)]
struct FacetRow {
    value: Option<String>,
    count: i64,
}

#[derive(Debug, Serialize)]
pub struct Facets {
    pub types: Vec<FacetEntry>,
    pub categories: Vec<FacetEntry>,
    pub tags: Vec<FacetEntry>,
}

#[derive(Debug, Serialize)]
pub struct FacetEntry {
    pub value: String,
    pub count: i64,
}

async fn artifact_facets(
    Extension(pool): Extension<PgPool>,
    AuthUser { .. }: AuthUser,
) -> AppResult<Json<Facets>> {
    let types = sqlx::query_as::<_, FacetRow>(
        "SELECT artifact_type::text AS value, COUNT(*) AS count FROM artifacts \
         WHERE status <> 'archived' GROUP BY artifact_type ORDER BY count DESC, value",
    )
    .fetch_all(&pool)
    .await?;

    let categories = sqlx::query_as::<_, FacetRow>(
        "SELECT category AS value, COUNT(*) AS count FROM artifacts \
         WHERE status <> 'archived' AND category IS NOT NULL \
         GROUP BY category ORDER BY count DESC, value",
    )
    .fetch_all(&pool)
    .await?;

    let tags = sqlx::query_as::<_, FacetRow>(
        "SELECT tag AS value, COUNT(*) AS count FROM artifacts, \
         jsonb_array_elements_text(tags) AS tag \
         WHERE status <> 'archived' GROUP BY tag ORDER BY count DESC, value",
    )
    .fetch_all(&pool)
    .await?;

    Ok(Json(Facets {
        types: collect_facets(types),
        categories: collect_facets(categories),
        tags: collect_facets(tags),
    }))
}

fn collect_facets(rows: Vec<FacetRow>) -> Vec<FacetEntry> {
    rows.into_iter()
        .filter_map(|row| {
            row.value.map(|value| FacetEntry {
                value,
                count: row.count,
            })
        })
        .collect()
}
