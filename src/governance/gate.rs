use serde_json::json;
use sqlx::PgPool;

use crate::artifacts::Artifact;
use crate::error::AppResult;
use crate::versions::ArtifactVersion;

use super::models::ScanGrade;
use super::resolver::{gather_policies, resolve_effective_policy, EffectivePolicy};

/// Outcome of evaluating the effective rules against a concrete version.
#[derive(Debug)]
pub struct RuleEvaluation {
    pub effective: EffectivePolicy,
    pub failures: Vec<String>,
}

impl RuleEvaluation {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// What the wire-protocol download layer should do with a request.
#[derive(Debug, PartialEq, Eq)]
pub enum DownloadDecision {
    Allow,
    AllowWithWarning(String),
    Deny(String),
}

/// Evaluate every checkable rule of the effective policy against a version.
/// Self-approval and approver counting are the approve flow's business; this
/// covers the evidence-based rules.
pub async fn evaluate_version_rules(
    pool: &PgPool,
    artifact: &Artifact,
    version: &ArtifactVersion,
) -> AppResult<RuleEvaluation> {
    let contributions = gather_policies(pool, artifact).await?;
    let effective = resolve_effective_policy(&contributions);
    let mut failures = Vec::new();

    if effective.rules.require_passing_tests.unwrap_or(false)
        && !has_passing_run(pool, artifact.id, &version.version, "test").await?
    {
        failures.push(format!(
            "no succeeded test run recorded for version {}",
            version.version
        ));
    }

    if effective.rules.require_passing_validate.unwrap_or(false)
        && !has_passing_run(pool, artifact.id, &version.version, "validate").await?
    {
        failures.push(format!(
            "no succeeded validate run recorded for version {}",
            version.version
        ));
    }

    if let Some(required) = effective.rules.required_scan_grade {
        match best_scan_grade(pool, version.id).await? {
            Some(grade) if grade.satisfies(required) => {}
            Some(grade) => failures.push(format!(
                "security scan grade {:?} does not satisfy required {:?}",
                grade, required
            )),
            None => failures.push(format!(
                "no security scan recorded; required grade {:?}",
                required
            )),
        }
    }

    Ok(RuleEvaluation {
        effective,
        failures,
    })
}

async fn has_passing_run(
    pool: &PgPool,
    artifact_id: i32,
    version: &str,
    operation: &str,
) -> AppResult<bool> {
    let exists: Option<i64> = sqlx::query_scalar(
        r#"
        SELECT mr.id
        FROM module_runs mr
        JOIN environment_modules m ON m.id = mr.module_id
        WHERE m.artifact_id = $1
          AND mr.operation = $2::run_operation
          AND mr.version = $3
          AND mr.status = 'succeeded'
        LIMIT 1
        "#,
    )
    .bind(artifact_id)
    .bind(operation)
    .bind(version)
    .fetch_optional(pool)
    .await?;
    Ok(exists.is_some())
}

/// The strictest security-scan grade recorded for a version, if any.
async fn best_scan_grade(pool: &PgPool, version_id: i32) -> AppResult<Option<ScanGrade>> {
    let grades: Vec<Option<String>> = sqlx::query_scalar(
        "SELECT grade FROM ci_results WHERE version_id = $1 AND result_type = 'security-scan'",
    )
    .bind(version_id)
    .fetch_all(pool)
    .await?;
    Ok(grades
        .into_iter()
        .flatten()
        .filter_map(|raw| ScanGrade::parse(&raw))
        .min())
}

/// Evaluate download policy for an approved, non-yanked version. The caller
/// rejects yanked and unapproved versions before ever reaching this gate.
pub async fn evaluate_download(
    pool: &PgPool,
    artifact: &Artifact,
    version: &ArtifactVersion,
) -> AppResult<DownloadDecision> {
    let evaluation = evaluate_version_rules(pool, artifact, version).await?;
    let mut failures = evaluation.failures;

    let min_approvers = evaluation.effective.min_approvers();
    if min_approvers > 1 {
        let approvals: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM version_approvals WHERE version_id = $1")
                .bind(version.id)
                .fetch_one(pool)
                .await?;
        if (approvals as i32) < min_approvers {
            failures.push(format!(
                "{} of {} required approvals recorded",
                approvals, min_approvers
            ));
        }
    }

    use super::models::EnforcementLevel::*;
    let (decision, verdict) = if failures.is_empty() {
        (DownloadDecision::Allow, "allowed")
    } else {
        match evaluation.effective.enforcement_level {
            Block => (DownloadDecision::Deny(failures.join("; ")), "denied"),
            Warn => (
                DownloadDecision::AllowWithWarning(failures.join("; ")),
                "warned",
            ),
            Audit => (DownloadDecision::Allow, "allowed"),
        }
    };

    record_evaluation(
        pool,
        Some(artifact.id),
        Some(version.id),
        "download",
        verdict,
        evaluation.effective.enforcement_level,
        &failures,
        None,
    )
    .await?;

    Ok(decision)
}

/// Append one row to the policy decision log.
#[allow(clippy::too_many_arguments)]
pub async fn record_evaluation(
    pool: &PgPool,
    artifact_id: Option<i32>,
    version_id: Option<i32>,
    evaluation_type: &str,
    decision: &str,
    enforcement_level: super::models::EnforcementLevel,
    reasons: &[String],
    actor: Option<i32>,
) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO policy_evaluations
            (artifact_id, version_id, evaluation_type, decision, enforcement_level, reasons, actor)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(artifact_id)
    .bind(version_id)
    .bind(evaluation_type)
    .bind(decision)
    .bind(enforcement_level)
    .bind(json!(reasons))
    .bind(actor)
    .execute(pool)
    .await?;
    Ok(())
}
