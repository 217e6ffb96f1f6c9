use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::{FromRow, PgPool};
use tokio::sync::mpsc::Sender;

use crate::artifacts::{find_artifact, Artifact};
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::governance::gate::{evaluate_version_rules, record_evaluation};
use crate::governance::models::EnforcementLevel;
use crate::job_queue::{dispatch, Job};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "approval_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ArtifactVersion {
    pub id: i32,
    pub artifact_id: i32,
    pub version: String,
    pub major: i32,
    pub minor: i32,
    pub patch: i32,
    pub prerelease: Option<String>,
    pub approval_status: ApprovalStatus,
    pub is_latest: bool,
    pub is_bad: bool,
    pub yank_reason: Option<String>,
    pub published_by: Option<i32>,
    pub metadata: Option<Value>,
    pub storage_ref: Option<String>,
    pub examples: Value,
    pub dependencies: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const VERSION_COLUMNS: &str = "id, artifact_id, version, major, minor, patch, prerelease, \
     approval_status, is_latest, is_bad, yank_reason, published_by, metadata, storage_ref, \
     examples, dependencies, created_at, updated_at";

#[derive(Debug, Deserialize)]
pub struct PublishVersion {
    pub version: String,
    pub metadata: Option<Value>,
    pub storage_ref: Option<String>,
    #[serde(default)]
    pub examples: Vec<Value>,
    #[serde(default)]
    pub dependencies: Vec<Value>,
}

#[derive(Debug, Deserialize)]
pub struct YankRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CiResultInput {
    pub result_type: String,
    pub grade: Option<String>,
    pub status: String,
    pub details: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct ProviderQuery {
    pub provider: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ApprovalResponse {
    pub approved: bool,
    pub approvals: i64,
    pub required_approvals: i32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub version: ArtifactVersion,
}

pub fn routes() -> Router {
    Router::new()
        .route(
            "/v1/artifacts/:namespace/:name/versions",
            get(list_versions).post(publish_version),
        )
        .route(
            "/v1/artifacts/:namespace/:name/versions/:version",
            get(get_version),
        )
        .route(
            "/v1/artifacts/:namespace/:name/versions/:version/approve",
            post(approve_version),
        )
        .route(
            "/v1/artifacts/:namespace/:name/versions/:version/reject",
            post(reject_version),
        )
        .route(
            "/v1/artifacts/:namespace/:name/versions/:version/yank",
            post(yank_version),
        )
        .route(
            "/v1/artifacts/:namespace/:name/versions/:version/ci-results",
            get(list_ci_results).post(record_ci_result),
        )
}

pub async fn find_version(
    pool: &PgPool,
    artifact_id: i32,
    version: &str,
) -> AppResult<ArtifactVersion> {
    let query = format!(
        "SELECT {VERSION_COLUMNS} FROM artifact_versions WHERE artifact_id = $1 AND version = $2"
    );
    let row = sqlx::query_as::<_, ArtifactVersion>(&query)
        .bind(artifact_id)
        .bind(version)
        .fetch_optional(pool)
        .await?;
    row.ok_or_else(|| AppError::not_found("VERSION_NOT_FOUND", "Version not found"))
}

async fn list_versions(
    Extension(pool): Extension<PgPool>,
    AuthUser { .. }: AuthUser,
    Path((namespace, name)): Path<(String, String)>,
    Query(params): Query<ProviderQuery>,
) -> AppResult<Json<Vec<ArtifactVersion>>> {
    let artifact = find_artifact(&pool, &namespace, &name, params.provider.as_deref()).await?;
    let query = format!(
        "SELECT {VERSION_COLUMNS} FROM artifact_versions WHERE artifact_id = $1 \
         ORDER BY major DESC, minor DESC, patch DESC, id ASC"
    );
    let versions = sqlx::query_as::<_, ArtifactVersion>(&query)
        .bind(artifact.id)
        .fetch_all(&pool)
        .await?;
    Ok(Json(versions))
}

async fn publish_version(
    Extension(pool): Extension<PgPool>,
    Extension(job_tx): Extension<Sender<Job>>,
    AuthUser { user_id, team, .. }: AuthUser,
    Path((namespace, name)): Path<(String, String)>,
    Query(params): Query<ProviderQuery>,
    Json(payload): Json<PublishVersion>,
) -> AppResult<(StatusCode, Json<ArtifactVersion>)> {
    let artifact = find_artifact(&pool, &namespace, &name, params.provider.as_deref()).await?;
    if artifact.team != team {
        return Err(AppError::not_found("ARTIFACT_NOT_FOUND", "Artifact not found"));
    }

    let parsed = semver::Version::parse(payload.version.trim())
        .map_err(|e| AppError::BadRequest(format!("Invalid semver: {}", e)))?;
    let prerelease = if parsed.pre.is_empty() {
        None
    } else {
        Some(parsed.pre.as_str().to_string())
    };

    let query = format!(
        "INSERT INTO artifact_versions (artifact_id, version, major, minor, patch, prerelease, \
         published_by, metadata, storage_ref, examples, dependencies) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) RETURNING {VERSION_COLUMNS}"
    );
    let result = sqlx::query_as::<_, ArtifactVersion>(&query)
        .bind(artifact.id)
        .bind(payload.version.trim())
        .bind(parsed.major as i32)
        .bind(parsed.minor as i32)
        .bind(parsed.patch as i32)
        .bind(prerelease.as_deref())
        .bind(user_id)
        .bind(payload.metadata.as_ref())
        .bind(payload.storage_ref.as_deref())
        .bind(json!(payload.examples))
        .bind(json!(payload.dependencies))
        .fetch_one(&pool)
        .await;

    let version = match result {
        Ok(version) => version,
        Err(e) => {
            if let sqlx::Error::Database(db_err) = &e {
                if db_err.constraint() == Some("artifact_versions_artifact_id_version_key") {
                    return Err(AppError::AlreadyExists("Version already published".into()));
                }
            }
            return Err(AppError::Db(e));
        }
    };

    let version = maybe_auto_approve(&pool, &job_tx, &artifact, version).await?;
    Ok((StatusCode::CREATED, Json(version)))
}

/// Patch releases skip the approval queue when the effective policy opts in
/// and the new version is a clean patch bump over the current latest.
async fn maybe_auto_approve(
    pool: &PgPool,
    job_tx: &Sender<Job>,
    artifact: &Artifact,
    version: ArtifactVersion,
) -> AppResult<ArtifactVersion> {
    let contributions = crate::governance::resolver::gather_policies(pool, artifact).await?;
    let effective = crate::governance::resolver::resolve_effective_policy(&contributions);
    if !effective.rules.auto_approve_patches.unwrap_or(false) || version.prerelease.is_some() {
        return Ok(version);
    }

    let latest = sqlx::query_as::<_, ArtifactVersion>(&format!(
        "SELECT {VERSION_COLUMNS} FROM artifact_versions \
         WHERE artifact_id = $1 AND is_latest AND approval_status = 'approved'"
    ))
    .bind(artifact.id)
    .fetch_optional(pool)
    .await?;
    let Some(latest) = latest else {
        return Ok(version);
    };
    let is_patch_bump = version.major == latest.major
        && version.minor == latest.minor
        && version.patch > latest.patch;
    if !is_patch_bump {
        return Ok(version);
    }

    match approve_version_tx(pool, version.id).await? {
        Some(approved) => {
            record_evaluation(
                pool,
                Some(artifact.id),
                Some(approved.id),
                "approval",
                "auto-approved",
                effective.enforcement_level,
                &[format!("patch release {} auto-approved", approved.version)],
                None,
            )
            .await?;
            dispatch(
                pool,
                job_tx,
                Job::CascadePlans {
                    artifact_id: artifact.id,
                    version: approved.version.clone(),
                },
            )
            .await;
            tracing::info!(
                artifact_id = artifact.id,
                version = %approved.version,
                "patch version auto-approved"
            );
            Ok(approved)
        }
        None => Ok(version),
    }
}

async fn get_version(
    Extension(pool): Extension<PgPool>,
    AuthUser { .. }: AuthUser,
    Path((namespace, name, version)): Path<(String, String, String)>,
    Query(params): Query<ProviderQuery>,
) -> AppResult<Json<ArtifactVersion>> {
    let artifact = find_artifact(&pool, &namespace, &name, params.provider.as_deref()).await?;
    let version = find_version(&pool, artifact.id, &version).await?;
    Ok(Json(version))
}

/// Transactional approve: lock the row, bail if it is no longer pending,
/// clear `is_latest` on siblings, flip the target. Concurrent approvers of
/// the same version race for the row lock and the loser observes a
/// non-pending row. Approvers of two different pending versions race at the
/// `artifact_versions_one_latest` index instead; the loser's flip is
/// rejected by the database and surfaces as the same no-op.
pub async fn approve_version_tx(
    pool: &PgPool,
    version_id: i32,
) -> AppResult<Option<ArtifactVersion>> {
    let mut tx = pool.begin().await?;
    let locked = sqlx::query_as::<_, ArtifactVersion>(&format!(
        "SELECT {VERSION_COLUMNS} FROM artifact_versions WHERE id = $1 FOR UPDATE"
    ))
    .bind(version_id)
    .fetch_optional(&mut *tx)
    .await?;
    let Some(locked) = locked else {
        tx.rollback().await?;
        return Ok(None);
    };
    if locked.approval_status != ApprovalStatus::Pending {
        tx.rollback().await?;
        return Ok(None);
    }

    sqlx::query(
        "UPDATE artifact_versions SET is_latest = FALSE, updated_at = NOW() \
         WHERE artifact_id = $1 AND is_latest",
    )
    .bind(locked.artifact_id)
    .execute(&mut *tx)
    .await?;

    let result = sqlx::query_as::<_, ArtifactVersion>(&format!(
        "UPDATE artifact_versions SET approval_status = 'approved', is_latest = TRUE, \
         updated_at = NOW() WHERE id = $1 RETURNING {VERSION_COLUMNS}"
    ))
    .bind(locked.id)
    .fetch_one(&mut *tx)
    .await;

    let approved = match result {
        Ok(approved) => approved,
        Err(e) => {
            if let sqlx::Error::Database(db_err) = &e {
                if db_err.constraint() == Some("artifact_versions_one_latest") {
                    tx.rollback().await?;
                    return Ok(None);
                }
            }
            return Err(AppError::Db(e));
        }
    };
    tx.commit().await?;
    Ok(Some(approved))
}

async fn approval_count(pool: &PgPool, version_id: i32) -> AppResult<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM version_approvals WHERE version_id = $1")
            .bind(version_id)
            .fetch_one(pool)
            .await?;
    Ok(count)
}

async fn approve_version(
    Extension(pool): Extension<PgPool>,
    Extension(job_tx): Extension<Sender<Job>>,
    AuthUser { user_id, team, .. }: AuthUser,
    Path((namespace, name, version)): Path<(String, String, String)>,
    Query(params): Query<ProviderQuery>,
) -> AppResult<Json<ApprovalResponse>> {
    let artifact = find_artifact(&pool, &namespace, &name, params.provider.as_deref()).await?;
    if artifact.team != team {
        return Err(AppError::not_found("ARTIFACT_NOT_FOUND", "Artifact not found"));
    }
    let target = find_version(&pool, artifact.id, &version).await?;

    if target.approval_status == ApprovalStatus::Rejected {
        return Err(AppError::Conflict("Version was rejected".into()));
    }

    let evaluation = evaluate_version_rules(&pool, &artifact, &target).await?;
    let required_approvals = evaluation.effective.min_approvers();

    if target.approval_status == ApprovalStatus::Approved {
        let approvals = approval_count(&pool, target.id).await?;
        return Ok(Json(ApprovalResponse {
            approved: true,
            approvals,
            required_approvals,
            warnings: Vec::new(),
            version: target,
        }));
    }

    if evaluation.effective.prevent_self_approval()
        && target.published_by == Some(user_id)
    {
        record_evaluation(
            &pool,
            Some(artifact.id),
            Some(target.id),
            "approval",
            "denied",
            evaluation.effective.enforcement_level,
            &["publisher cannot approve their own version".to_string()],
            Some(user_id),
        )
        .await?;
        return Err(AppError::Forbidden(
            "Publishers cannot approve their own versions".into(),
        ));
    }

    let mut warnings = Vec::new();
    if !evaluation.failures.is_empty() {
        match evaluation.effective.enforcement_level {
            EnforcementLevel::Block => {
                record_evaluation(
                    &pool,
                    Some(artifact.id),
                    Some(target.id),
                    "approval",
                    "denied",
                    EnforcementLevel::Block,
                    &evaluation.failures,
                    Some(user_id),
                )
                .await?;
                return Err(AppError::Forbidden(format!(
                    "Approval blocked by policy: {}",
                    evaluation.failures.join("; ")
                )));
            }
            EnforcementLevel::Warn => {
                warnings = evaluation.failures.clone();
            }
            EnforcementLevel::Audit => {}
        }
    }

    // Idempotent signature: one row per (version, actor).
    sqlx::query(
        "INSERT INTO version_approvals (version_id, actor) VALUES ($1, $2) \
         ON CONFLICT (version_id, actor) DO NOTHING",
    )
    .bind(target.id)
    .bind(user_id)
    .execute(&pool)
    .await?;
    let approvals = approval_count(&pool, target.id).await?;

    if approvals < required_approvals as i64 {
        record_evaluation(
            &pool,
            Some(artifact.id),
            Some(target.id),
            "approval",
            "pending",
            evaluation.effective.enforcement_level,
            &[format!(
                "{} of {} required approvals collected",
                approvals, required_approvals
            )],
            Some(user_id),
        )
        .await?;
        return Ok(Json(ApprovalResponse {
            approved: false,
            approvals,
            required_approvals,
            warnings,
            version: target,
        }));
    }

    let outcome = approve_version_tx(&pool, target.id).await?;
    let decision = if warnings.is_empty() { "allowed" } else { "warned" };
    let version = match outcome {
        Some(approved) => {
            record_evaluation(
                &pool,
                Some(artifact.id),
                Some(approved.id),
                "approval",
                decision,
                evaluation.effective.enforcement_level,
                &evaluation.failures,
                Some(user_id),
            )
            .await?;
            dispatch(
                &pool,
                &job_tx,
                Job::CascadePlans {
                    artifact_id: artifact.id,
                    version: approved.version.clone(),
                },
            )
            .await;
            tracing::info!(
                artifact_id = artifact.id,
                version = %approved.version,
                approved_by = user_id,
                "version approved"
            );
            approved
        }
        // A concurrent approver won the row lock; surface the settled row.
        None => find_version(&pool, artifact.id, &version).await?,
    };

    let approvals = approval_count(&pool, version.id).await?;
    Ok(Json(ApprovalResponse {
        approved: version.approval_status == ApprovalStatus::Approved,
        approvals,
        required_approvals,
        warnings,
        version,
    }))
}

async fn reject_version(
    Extension(pool): Extension<PgPool>,
    AuthUser { user_id, team, .. }: AuthUser,
    Path((namespace, name, version)): Path<(String, String, String)>,
    Query(params): Query<ProviderQuery>,
) -> AppResult<Json<ArtifactVersion>> {
    let artifact = find_artifact(&pool, &namespace, &name, params.provider.as_deref()).await?;
    if artifact.team != team {
        return Err(AppError::not_found("ARTIFACT_NOT_FOUND", "Artifact not found"));
    }
    let target = find_version(&pool, artifact.id, &version).await?;
    match target.approval_status {
        ApprovalStatus::Pending => {}
        ApprovalStatus::Rejected => return Ok(Json(target)),
        ApprovalStatus::Approved => {
            return Err(AppError::Conflict(
                "Approved versions cannot be rejected; yank instead".into(),
            ))
        }
    }

    let rejected = sqlx::query_as::<_, ArtifactVersion>(&format!(
        "UPDATE artifact_versions SET approval_status = 'rejected', updated_at = NOW() \
         WHERE id = $1 AND approval_status = 'pending' RETURNING {VERSION_COLUMNS}"
    ))
    .bind(target.id)
    .fetch_optional(&pool)
    .await?
    .ok_or_else(|| AppError::Conflict("Version state changed concurrently".into()))?;

    record_evaluation(
        &pool,
        Some(artifact.id),
        Some(rejected.id),
        "approval",
        "rejected",
        EnforcementLevel::Block,
        &[],
        Some(user_id),
    )
    .await?;
    Ok(Json(rejected))
}

/// Yank marks the version bad but leaves `is_latest` untouched; downloads
/// reject yanked versions regardless.
async fn yank_version(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path((namespace, name, version)): Path<(String, String, String)>,
    Query(params): Query<ProviderQuery>,
    Json(payload): Json<YankRequest>,
) -> AppResult<Json<ArtifactVersion>> {
    let artifact = find_artifact(&pool, &namespace, &name, params.provider.as_deref()).await?;
    if artifact.team != team {
        return Err(AppError::not_found("ARTIFACT_NOT_FOUND", "Artifact not found"));
    }
    let target = find_version(&pool, artifact.id, &version).await?;

    let yanked = sqlx::query_as::<_, ArtifactVersion>(&format!(
        "UPDATE artifact_versions SET is_bad = TRUE, yank_reason = COALESCE($2, yank_reason), \
         updated_at = NOW() WHERE id = $1 RETURNING {VERSION_COLUMNS}"
    ))
    .bind(target.id)
    .bind(payload.reason.as_deref())
    .fetch_one(&pool)
    .await?;
    tracing::info!(
        artifact_id = artifact.id,
        version = %yanked.version,
        "version yanked"
    );
    Ok(Json(yanked))
}

#[derive(Debug, Serialize, FromRow)]
pub struct CiResult {
    pub id: i32,
    pub version_id: i32,
    pub result_type: String,
    pub grade: Option<String>,
    pub status: String,
    pub details: Option<Value>,
    pub created_at: DateTime<Utc>,
}

async fn list_ci_results(
    Extension(pool): Extension<PgPool>,
    AuthUser { .. }: AuthUser,
    Path((namespace, name, version)): Path<(String, String, String)>,
    Query(params): Query<ProviderQuery>,
) -> AppResult<Json<Vec<CiResult>>> {
    let artifact = find_artifact(&pool, &namespace, &name, params.provider.as_deref()).await?;
    let target = find_version(&pool, artifact.id, &version).await?;
    let results = sqlx::query_as::<_, CiResult>(
        "SELECT id, version_id, result_type, grade, status, details, created_at \
         FROM ci_results WHERE version_id = $1 ORDER BY created_at DESC, id DESC",
    )
    .bind(target.id)
    .fetch_all(&pool)
    .await?;
    Ok(Json(results))
}

async fn record_ci_result(
    Extension(pool): Extension<PgPool>,
    AuthUser { team, .. }: AuthUser,
    Path((namespace, name, version)): Path<(String, String, String)>,
    Query(params): Query<ProviderQuery>,
    Json(payload): Json<CiResultInput>,
) -> AppResult<(StatusCode, Json<CiResult>)> {
    let artifact = find_artifact(&pool, &namespace, &name, params.provider.as_deref()).await?;
    if artifact.team != team {
        return Err(AppError::not_found("ARTIFACT_NOT_FOUND", "Artifact not found"));
    }
    let target = find_version(&pool, artifact.id, &version).await?;

    let result = sqlx::query_as::<_, CiResult>(
        r#"
        INSERT INTO ci_results (version_id, result_type, grade, status, details)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id, version_id, result_type, grade, status, details, created_at
        "#,
    )
    .bind(target.id)
    .bind(&payload.result_type)
    .bind(payload.grade.as_deref())
    .bind(&payload.status)
    .bind(payload.details.as_ref())
    .fetch_one(&pool)
    .await?;
    Ok((StatusCode::CREATED, Json(result)))
}
