use serde::Serialize;
use sqlx::{FromRow, PgPool};

use crate::artifacts::Artifact;
use crate::error::AppResult;

use super::models::{
    ContributingPolicy, EnforcementLevel, InlinePolicy, PolicyRules, PolicyScope,
};

/// The merged policy governing one artifact, with the sources that shaped it.
#[derive(Debug, Clone, Serialize)]
pub struct EffectivePolicy {
    pub enforcement_level: EnforcementLevel,
    pub rules: PolicyRules,
    pub sources: Vec<PolicySourceRef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PolicySourceRef {
    pub scope: PolicyScope,
    pub source: String,
}

impl EffectivePolicy {
    pub fn prevent_self_approval(&self) -> bool {
        // Self-approval is blocked unless a policy explicitly allows it.
        self.rules.prevent_self_approval.unwrap_or(true)
    }

    pub fn min_approvers(&self) -> i32 {
        self.rules.min_approvers.unwrap_or(1).max(1)
    }
}

#[derive(FromRow)]
struct BoundPolicyRow {
    name: String,
    scope_type: PolicyScope,
    enforcement_level: EnforcementLevel,
    rules: serde_json::Value,
}

/// Load every policy that applies to the artifact: its inline policy plus
/// bindings at artifact, namespace, team, and global scope.
pub async fn gather_policies(
    pool: &PgPool,
    artifact: &Artifact,
) -> AppResult<Vec<ContributingPolicy>> {
    let mut contributions = Vec::new();

    if let Some(inline) = artifact.approval_policy.as_ref() {
        let parsed: InlinePolicy = serde_json::from_value(inline.clone()).unwrap_or_default();
        if !parsed.rules.is_empty() || parsed.enforcement_level.is_some() {
            contributions.push(ContributingPolicy {
                scope: PolicyScope::Artifact,
                source: "inline".to_string(),
                enforcement_level: parsed.enforcement_level.unwrap_or(EnforcementLevel::Block),
                rules: parsed.rules,
            });
        }
    }

    let artifact_ref = artifact_scope_value(artifact);
    let rows = sqlx::query_as::<_, BoundPolicyRow>(
        r#"
        SELECT t.name, b.scope_type, t.enforcement_level, t.rules
        FROM policy_bindings b
        JOIN policy_templates t ON t.id = b.template_id
        WHERE (b.scope_type = 'artifact' AND b.scope_value = $1)
           OR (b.scope_type = 'namespace' AND b.scope_value = $2)
           OR (b.scope_type = 'team' AND b.scope_value = $3)
           OR (b.scope_type = 'global' AND b.scope_value IS NULL)
        ORDER BY b.id
        "#,
    )
    .bind(&artifact_ref)
    .bind(&artifact.namespace)
    .bind(&artifact.team)
    .fetch_all(pool)
    .await?;

    for row in rows {
        let rules: PolicyRules = serde_json::from_value(row.rules).unwrap_or_default();
        contributions.push(ContributingPolicy {
            scope: row.scope_type,
            source: row.name,
            enforcement_level: row.enforcement_level,
            rules,
        });
    }

    Ok(contributions)
}

/// Binding address for artifact-scope policies.
pub fn artifact_scope_value(artifact: &Artifact) -> String {
    match artifact.provider.as_deref() {
        Some(provider) => format!("{}/{}/{}", artifact.namespace, artifact.name, provider),
        None => format!("{}/{}", artifact.namespace, artifact.name),
    }
}

/// Merge contributing policies into the effective policy.
///
/// Within one scope every rule resolves strictest-wins; across scopes each
/// rule is taken from the most specific scope that sets it. The enforcement
/// level is the strictest seen anywhere. No contributions at all defaults to
/// `block` with empty rules.
pub fn resolve_effective_policy(contributions: &[ContributingPolicy]) -> EffectivePolicy {
    let mut sources: Vec<PolicySourceRef> = contributions
        .iter()
        .map(|policy| PolicySourceRef {
            scope: policy.scope,
            source: policy.source.clone(),
        })
        .collect();
    sources.sort_by_key(|source| source.scope.specificity());

    if contributions.is_empty() {
        return EffectivePolicy {
            enforcement_level: EnforcementLevel::Block,
            rules: PolicyRules::default(),
            sources,
        };
    }

    let enforcement_level = contributions
        .iter()
        .map(|policy| policy.enforcement_level)
        .min()
        .unwrap_or(EnforcementLevel::Block);

    // Per-scope strictest-wins merge, most specific scope first.
    let mut scope_order: Vec<PolicyScope> = contributions.iter().map(|policy| policy.scope).collect();
    scope_order.sort_by_key(|scope| scope.specificity());
    scope_order.dedup();

    let mut rules = PolicyRules::default();
    for scope in scope_order {
        let merged = merge_scope(
            contributions
                .iter()
                .filter(|policy| policy.scope == scope)
                .map(|policy| &policy.rules),
        );
        // Most-specific-wins: only fill rules no more specific scope has set.
        if rules.min_approvers.is_none() {
            rules.min_approvers = merged.min_approvers;
        }
        if rules.required_scan_grade.is_none() {
            rules.required_scan_grade = merged.required_scan_grade;
        }
        if rules.require_passing_tests.is_none() {
            rules.require_passing_tests = merged.require_passing_tests;
        }
        if rules.require_passing_validate.is_none() {
            rules.require_passing_validate = merged.require_passing_validate;
        }
        if rules.prevent_self_approval.is_none() {
            rules.prevent_self_approval = merged.prevent_self_approval;
        }
        if rules.auto_approve_patches.is_none() {
            rules.auto_approve_patches = merged.auto_approve_patches;
        }
    }

    EffectivePolicy {
        enforcement_level,
        rules,
        sources,
    }
}

fn merge_scope<'a>(policies: impl Iterator<Item = &'a PolicyRules>) -> PolicyRules {
    let mut merged = PolicyRules::default();
    for rules in policies {
        merged.min_approvers = match (merged.min_approvers, rules.min_approvers) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        merged.required_scan_grade = match (merged.required_scan_grade, rules.required_scan_grade) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        merged.require_passing_tests =
            strictest_bool_true_wins(merged.require_passing_tests, rules.require_passing_tests);
        merged.require_passing_validate = strictest_bool_true_wins(
            merged.require_passing_validate,
            rules.require_passing_validate,
        );
        merged.prevent_self_approval =
            strictest_bool_true_wins(merged.prevent_self_approval, rules.prevent_self_approval);
        // Restrictive direction inverts for auto-approval: false wins.
        merged.auto_approve_patches = match (merged.auto_approve_patches, rules.auto_approve_patches)
        {
            (Some(a), Some(b)) => Some(a && b),
            (a, b) => a.or(b),
        };
    }
    merged
}

fn strictest_bool_true_wins(current: Option<bool>, incoming: Option<bool>) -> Option<bool> {
    match (current, incoming) {
        (Some(a), Some(b)) => Some(a || b),
        (a, b) => a.or(b),
    }
}
