use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    routing::{delete, get},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, PgPool};

use crate::artifacts::find_artifact;
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;

use super::models::{
    EnforcementLevel, PolicyBinding, PolicyEvaluation, PolicyRules, PolicyScope, PolicyTemplate,
};
use super::resolver::{gather_policies, resolve_effective_policy, EffectivePolicy};

pub fn routes() -> Router {
    Router::new()
        .route("/v1/policies", get(list_templates).post(create_template))
        .route(
            "/v1/policies/bindings",
            get(list_bindings).post(create_binding),
        )
        .route("/v1/policies/bindings/:id", delete(delete_binding))
        .route(
            "/v1/policies/:id",
            get(get_template).put(update_template).delete(delete_template),
        )
        .route("/v1/governance/summary", get(governance_summary))
        .route("/v1/governance/approvals", get(pending_approvals))
        .route("/v1/governance/staleness", get(staleness_report))
        .route(
            "/v1/artifacts/:namespace/:name/effective-policy",
            get(effective_policy),
        )
        .route(
            "/v1/artifacts/:namespace/:name/evaluations",
            get(list_evaluations),
        )
}

#[derive(Debug, Deserialize)]
pub struct CreateTemplate {
    pub name: String,
    pub description: Option<String>,
    pub enforcement_level: EnforcementLevel,
    #[serde(default)]
    pub rules: PolicyRules,
}

#[derive(Debug, Deserialize)]
pub struct UpdateTemplate {
    pub description: Option<String>,
    pub enforcement_level: Option<EnforcementLevel>,
    pub rules: Option<PolicyRules>,
}

#[derive(Debug, Deserialize)]
pub struct CreateBinding {
    pub template_id: i32,
    pub scope_type: PolicyScope,
    pub scope_value: Option<String>,
}

async fn list_templates(
    Extension(pool): Extension<PgPool>,
    AuthUser { .. }: AuthUser,
) -> AppResult<Json<Vec<PolicyTemplate>>> {
    let templates = sqlx::query_as::<_, PolicyTemplate>(
        "SELECT id, team, name, description, enforcement_level, rules, created_at, updated_at \
         FROM policy_templates ORDER BY name",
    )
    .fetch_all(&pool)
    .await?;
    Ok(Json(templates))
}

async fn create_template(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Json(payload): Json<CreateTemplate>,
) -> AppResult<(StatusCode, Json<PolicyTemplate>)> {
    if payload.name.trim().is_empty() {
        return Err(AppError::BadRequest("Policy name required".into()));
    }
    let result = sqlx::query_as::<_, PolicyTemplate>(
        r#"
        INSERT INTO policy_templates (team, name, description, enforcement_level, rules)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id, team, name, description, enforcement_level, rules, created_at, updated_at
        "#,
    )
    .bind(&team)
    .bind(payload.name.trim())
    .bind(payload.description.as_deref())
    .bind(payload.enforcement_level)
    .bind(serde_json::to_value(&payload.rules).unwrap_or(Value::Null))
    .fetch_one(&pool)
    .await;

    match result {
        Ok(template) => Ok((StatusCode::CREATED, Json(template))),
        Err(e) => {
            if let sqlx::Error::Database(db_err) = &e {
                if db_err.constraint() == Some("policy_templates_name_key") {
                    return Err(AppError::AlreadyExists("Policy name already in use".into()));
                }
            }
            Err(AppError::Db(e))
        }
    }
}

async fn get_template(
    Extension(pool): Extension<PgPool>,
    AuthUser { .. }: AuthUser,
    Path(id): Path<i32>,
) -> AppResult<Json<PolicyTemplate>> {
    let template = sqlx::query_as::<_, PolicyTemplate>(
        "SELECT id, team, name, description, enforcement_level, rules, created_at, updated_at \
         FROM policy_templates WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(&pool)
    .await?;
    template
        .map(Json)
        .ok_or_else(|| AppError::not_found("POLICY_NOT_FOUND", "Policy not found"))
}

async fn update_template(
    Extension(pool): Extension<PgPool>,
    AuthUser { .. }: AuthUser,
    Path(id): Path<i32>,
    Json(payload): Json<UpdateTemplate>,
) -> AppResult<Json<PolicyTemplate>> {
    let template = sqlx::query_as::<_, PolicyTemplate>(
        r#"
        UPDATE policy_templates SET
            description = COALESCE($2, description),
            enforcement_level = COALESCE($3, enforcement_level),
            rules = COALESCE($4, rules),
            updated_at = NOW()
        WHERE id = $1
        RETURNING id, team, name, description, enforcement_level, rules, created_at, updated_at
        "#,
    )
    .bind(id)
    .bind(payload.description.as_deref())
    .bind(payload.enforcement_level)
    .bind(
        payload
            .rules
            .map(|rules| serde_json::to_value(&rules).unwrap_or(Value::Null)),
    )
    .fetch_optional(&pool)
    .await?;
    template
        .map(Json)
        .ok_or_else(|| AppError::not_found("POLICY_NOT_FOUND", "Policy not found"))
}

async fn delete_template(
    Extension(pool): Extension<PgPool>,
    AuthUser { .. }: AuthUser,
    Path(id): Path<i32>,
) -> AppResult<StatusCode> {
    let bound: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM policy_bindings WHERE template_id = $1")
        .bind(id)
        .fetch_one(&pool)
        .await?;
    if bound > 0 {
        return Err(AppError::Conflict(
            "Policy has active bindings; remove them first".into(),
        ));
    }
    let result = sqlx::query("DELETE FROM policy_templates WHERE id = $1")
        .bind(id)
        .execute(&pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(AppError::not_found("POLICY_NOT_FOUND", "Policy not found"));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn list_bindings(
    Extension(pool): Extension<PgPool>,
    AuthUser { .. }: AuthUser,
) -> AppResult<Json<Vec<PolicyBinding>>> {
    let bindings = sqlx::query_as::<_, PolicyBinding>(
        "SELECT id, template_id, scope_type, scope_value, created_at FROM policy_bindings ORDER BY id",
    )
    .fetch_all(&pool)
    .await?;
    Ok(Json(bindings))
}

async fn create_binding(
    Extension(pool): Extension<PgPool>,
    AuthUser { .. }: AuthUser,
    Json(payload): Json<CreateBinding>,
) -> AppResult<(StatusCode, Json<PolicyBinding>)> {
    match payload.scope_type {
        PolicyScope::Global => {
            if payload.scope_value.is_some() {
                return Err(AppError::BadRequest(
                    "Global bindings must not carry a scope value".into(),
                ));
            }
        }
        _ => {
            if payload.scope_value.as_deref().unwrap_or("").is_empty() {
                return Err(AppError::BadRequest("scope_value required".into()));
            }
        }
    }

    let result = sqlx::query_as::<_, PolicyBinding>(
        r#"
        INSERT INTO policy_bindings (template_id, scope_type, scope_value)
        VALUES ($1, $2, $3)
        RETURNING id, template_id, scope_type, scope_value, created_at
        "#,
    )
    .bind(payload.template_id)
    .bind(payload.scope_type)
    .bind(payload.scope_value.as_deref())
    .fetch_one(&pool)
    .await;

    match result {
        Ok(binding) => Ok((StatusCode::CREATED, Json(binding))),
        Err(e) => {
            if let sqlx::Error::Database(db_err) = &e {
                if db_err.constraint() == Some("policy_bindings_scope_key") {
                    return Err(AppError::AlreadyExists("Binding already exists".into()));
                }
                if db_err.constraint() == Some("policy_bindings_template_id_fkey") {
                    return Err(AppError::not_found("POLICY_NOT_FOUND", "Policy not found"));
                }
            }
            Err(AppError::Db(e))
        }
    }
}

async fn delete_binding(
    Extension(pool): Extension<PgPool>,
    AuthUser { .. }: AuthUser,
    Path(id): Path<i32>,
) -> AppResult<StatusCode> {
    let result = sqlx::query("DELETE FROM policy_bindings WHERE id = $1")
        .bind(id)
        .execute(&pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(AppError::not_found("BINDING_NOT_FOUND", "Binding not found"));
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ProviderQuery {
    pub provider: Option<String>,
}

async fn effective_policy(
    Extension(pool): Extension<PgPool>,
    AuthUser { .. }: AuthUser,
    Path((namespace, name)): Path<(String, String)>,
    Query(params): Query<ProviderQuery>,
) -> AppResult<Json<EffectivePolicy>> {
    let artifact = find_artifact(&pool, &namespace, &name, params.provider.as_deref()).await?;
    let contributions = gather_policies(&pool, &artifact).await?;
    Ok(Json(resolve_effective_policy(&contributions)))
}

async fn list_evaluations(
    Extension(pool): Extension<PgPool>,
    AuthUser { .. }: AuthUser,
    Path((namespace, name)): Path<(String, String)>,
    Query(params): Query<ProviderQuery>,
) -> AppResult<Json<Vec<PolicyEvaluation>>> {
    let artifact = find_artifact(&pool, &namespace, &name, params.provider.as_deref()).await?;
    let evaluations = sqlx::query_as::<_, PolicyEvaluation>(
        r#"
        SELECT id, artifact_id, version_id, evaluation_type, decision, enforcement_level,
               reasons, actor, created_at
        FROM policy_evaluations
        WHERE artifact_id = $1
        ORDER BY created_at DESC, id DESC
        LIMIT 200
        "#,
    )
    .bind(artifact.id)
    .fetch_all(&pool)
    .await?;
    Ok(Json(evaluations))
}

#[derive(Debug, Serialize)]
pub struct GovernanceSummary {
    pub pending_versions: i64,
    pub approved_versions: i64,
    pub rejected_versions: i64,
    pub yanked_versions: i64,
    pub policy_templates: i64,
    pub policy_bindings: i64,
    pub evaluations_last_24h: i64,
}

async fn governance_summary(
    Extension(pool): Extension<PgPool>,
    AuthUser { .. }: AuthUser,
) -> AppResult<Json<GovernanceSummary>> {
    let (pending_versions, approved_versions, rejected_versions, yanked_versions): (
        i64,
        i64,
        i64,
        i64,
    ) = sqlx::query_as(
        r#"
        SELECT
            COUNT(*) FILTER (WHERE approval_status = 'pending'),
            COUNT(*) FILTER (WHERE approval_status = 'approved'),
            COUNT(*) FILTER (WHERE approval_status = 'rejected'),
            COUNT(*) FILTER (WHERE is_bad)
        FROM artifact_versions
        "#,
    )
    .fetch_one(&pool)
    .await?;

    let policy_templates: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM policy_templates")
        .fetch_one(&pool)
        .await?;
    let policy_bindings: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM policy_bindings")
        .fetch_one(&pool)
        .await?;
    let evaluations_last_24h: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM policy_evaluations WHERE created_at > NOW() - INTERVAL '24 hours'",
    )
    .fetch_one(&pool)
    .await?;

    Ok(Json(GovernanceSummary {
        pending_versions,
        approved_versions,
        rejected_versions,
        yanked_versions,
        policy_templates,
        policy_bindings,
        evaluations_last_24h,
    }))
}

#[derive(Debug, Serialize, FromRow)]
struct PendingVersionRow {
    version_id: i32,
    artifact_id: i32,
    namespace: String,
    name: String,
    provider: Option<String>,
    version: String,
    published_by: Option<i32>,
    approvals: i64,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct PendingApproval {
    pub version_id: i32,
    pub namespace: String,
    pub name: String,
    pub provider: Option<String>,
    pub version: String,
    pub published_by: Option<i32>,
    pub approvals: i64,
    pub required_approvals: i32,
    pub created_at: DateTime<Utc>,
}

async fn pending_approvals(
    Extension(pool): Extension<PgPool>,
    AuthUser { .. }: AuthUser,
) -> AppResult<Json<Vec<PendingApproval>>> {
    let rows = sqlx::query_as::<_, PendingVersionRow>(
        r#"
        SELECT v.id AS version_id, a.id AS artifact_id, a.namespace, a.name, a.provider,
               v.version, v.published_by, v.created_at,
               (SELECT COUNT(*) FROM version_approvals va WHERE va.version_id = v.id) AS approvals
        FROM artifact_versions v
        JOIN artifacts a ON a.id = v.artifact_id
        WHERE v.approval_status = 'pending' AND a.status <> 'archived'
        ORDER BY v.created_at ASC
        LIMIT 200
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let mut report = Vec::with_capacity(rows.len());
    for row in rows {
        let artifact = sqlx::query_as::<_, crate::artifacts::Artifact>(
            "SELECT id, namespace, name, provider, artifact_type, team, description, \
             storage_config, source_config, approval_policy, tags, category, status, \
             download_count, created_at, updated_at FROM artifacts WHERE id = $1",
        )
        .bind(row.artifact_id)
        .fetch_one(&pool)
        .await?;
        let contributions = gather_policies(&pool, &artifact).await?;
        let effective = resolve_effective_policy(&contributions);
        report.push(PendingApproval {
            version_id: row.version_id,
            namespace: row.namespace,
            name: row.name,
            provider: row.provider,
            version: row.version,
            published_by: row.published_by,
            approvals: row.approvals,
            required_approvals: effective.min_approvers(),
            created_at: row.created_at,
        });
    }

    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
pub struct StalenessQuery {
    pub days: Option<i64>,
}

#[derive(Debug, Serialize, FromRow)]
pub struct StaleVersion {
    pub namespace: String,
    pub name: String,
    pub version: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, FromRow)]
pub struct QuietArtifact {
    pub namespace: String,
    pub name: String,
    pub last_published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct StalenessReport {
    pub stale_approved_versions: Vec<StaleVersion>,
    pub artifacts_without_recent_publishes: Vec<QuietArtifact>,
}

async fn staleness_report(
    Extension(pool): Extension<PgPool>,
    AuthUser { .. }: AuthUser,
    Query(params): Query<StalenessQuery>,
) -> AppResult<Json<StalenessReport>> {
    let days = params.days.unwrap_or(90).clamp(1, 3650);

    let stale_approved_versions = sqlx::query_as::<_, StaleVersion>(
        r#"
        SELECT a.namespace, a.name, v.version, v.updated_at
        FROM artifact_versions v
        JOIN artifacts a ON a.id = v.artifact_id
        WHERE v.approval_status = 'approved'
          AND v.is_latest
          AND v.updated_at < NOW() - make_interval(days => $1::int)
          AND a.status = 'active'
        ORDER BY v.updated_at ASC
        LIMIT 100
        "#,
    )
    .bind(days as i32)
    .fetch_all(&pool)
    .await?;

    let artifacts_without_recent_publishes = sqlx::query_as::<_, QuietArtifact>(
        r#"
        SELECT a.namespace, a.name, MAX(v.created_at) AS last_published_at
        FROM artifacts a
        LEFT JOIN artifact_versions v ON v.artifact_id = a.id
        WHERE a.status = 'active'
        GROUP BY a.id, a.namespace, a.name
        HAVING MAX(v.created_at) IS NULL
            OR MAX(v.created_at) < NOW() - make_interval(days => $1::int)
        ORDER BY last_published_at ASC NULLS FIRST
        LIMIT 100
        "#,
    )
    .bind(days as i32)
    .fetch_all(&pool)
    .await?;

    Ok(Json(StalenessReport {
        stale_approved_versions,
        artifacts_without_recent_publishes,
    }))
}
