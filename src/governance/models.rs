use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

/// Enforcement levels ordered strictest-first: `block < warn < audit`.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, sqlx::Type,
)]
#[sqlx(type_name = "enforcement_level", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EnforcementLevel {
    Block,
    Warn,
    Audit,
}

/// Scan grades ordered strictest-first: `A` is the strictest requirement.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord,
)]
pub enum ScanGrade {
    A,
    B,
    C,
    D,
    F,
}

impl ScanGrade {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "A" => Some(ScanGrade::A),
            "B" => Some(ScanGrade::B),
            "C" => Some(ScanGrade::C),
            "D" => Some(ScanGrade::D),
            "F" => Some(ScanGrade::F),
            _ => None,
        }
    }

    /// A grade satisfies a requirement when it is at least as strict.
    pub fn satisfies(self, required: ScanGrade) -> bool {
        self <= required
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "policy_scope", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PolicyScope {
    Artifact,
    Namespace,
    Team,
    Global,
}

impl PolicyScope {
    /// Scope ladder position, most specific first.
    pub fn specificity(self) -> u8 {
        match self {
            PolicyScope::Artifact => 0,
            PolicyScope::Namespace => 1,
            PolicyScope::Team => 2,
            PolicyScope::Global => 3,
        }
    }
}

/// Structured rule set shared by templates and inline artifact policies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyRules {
    pub min_approvers: Option<i32>,
    pub required_scan_grade: Option<ScanGrade>,
    pub require_passing_tests: Option<bool>,
    pub require_passing_validate: Option<bool>,
    pub prevent_self_approval: Option<bool>,
    pub auto_approve_patches: Option<bool>,
}

impl PolicyRules {
    pub fn is_empty(&self) -> bool {
        *self == PolicyRules::default()
    }
}

/// Inline `approval_policy` payload stored on an artifact row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InlinePolicy {
    pub enforcement_level: Option<EnforcementLevel>,
    pub rules: PolicyRules,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PolicyTemplate {
    pub id: i32,
    pub team: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub enforcement_level: EnforcementLevel,
    pub rules: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PolicyBinding {
    pub id: i32,
    pub template_id: i32,
    pub scope_type: PolicyScope,
    pub scope_value: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PolicyEvaluation {
    pub id: i64,
    pub artifact_id: Option<i32>,
    pub version_id: Option<i32>,
    pub evaluation_type: String,
    pub decision: String,
    pub enforcement_level: EnforcementLevel,
    pub reasons: Value,
    pub actor: Option<i32>,
    pub created_at: DateTime<Utc>,
}

/// One policy feeding the resolver, tagged with where it came from.
#[derive(Debug, Clone)]
pub struct ContributingPolicy {
    pub scope: PolicyScope,
    pub source: String,
    pub enforcement_level: EnforcementLevel,
    pub rules: PolicyRules,
}
