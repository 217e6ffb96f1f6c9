use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::PgPool;

use crate::error::AppResult;
use crate::integrations::{
    effective_cloud_integrations, effective_variable_set_entries, VariableSetEntry,
};
use crate::modules::{EnvironmentModule, ModuleVariable, OutputMapping, VariableCategory};

/// Cloud credential descriptor. Unknown providers round-trip untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CredentialConfig {
    Known(KnownCredentialConfig),
    Unknown(Value),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum KnownCredentialConfig {
    Aws {
        #[serde(default)]
        region: Option<String>,
        #[serde(default)]
        access_key_id: Option<String>,
        #[serde(default)]
        secret_access_key_ref: Option<String>,
        #[serde(default)]
        role_arn: Option<String>,
    },
    Gcp {
        #[serde(default)]
        project: Option<String>,
        #[serde(default)]
        region: Option<String>,
        #[serde(default)]
        credentials_ref: Option<String>,
    },
    Azure {
        #[serde(default)]
        client_id: Option<String>,
        #[serde(default)]
        client_secret_ref: Option<String>,
        #[serde(default)]
        tenant_id: Option<String>,
        #[serde(default)]
        subscription_id: Option<String>,
    },
    Custom {
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
}

impl CredentialConfig {
    pub fn from_value(value: &Value) -> Self {
        serde_json::from_value(value.clone())
            .unwrap_or_else(|_| CredentialConfig::Unknown(value.clone()))
    }
}

/// Translate one credential config into well-known provider env vars.
/// Secret material is referenced, never inlined; the runner fetches it.
pub fn cloud_env_vars(config: &CredentialConfig) -> Vec<(String, String)> {
    let mut vars = Vec::new();
    match config {
        CredentialConfig::Known(KnownCredentialConfig::Aws {
            region,
            access_key_id,
            secret_access_key_ref,
            role_arn,
        }) => {
            if let Some(region) = region {
                vars.push(("AWS_REGION".to_string(), region.clone()));
            }
            if let Some(access_key_id) = access_key_id {
                vars.push(("AWS_ACCESS_KEY_ID".to_string(), access_key_id.clone()));
            }
            if let Some(secret_ref) = secret_access_key_ref {
                vars.push(("AWS_SECRET_ACCESS_KEY".to_string(), secret_ref.clone()));
            }
            if let Some(role_arn) = role_arn {
                vars.push(("AWS_ROLE_ARN".to_string(), role_arn.clone()));
            }
        }
        CredentialConfig::Known(KnownCredentialConfig::Gcp {
            project,
            region,
            credentials_ref,
        }) => {
            if let Some(project) = project {
                vars.push(("GOOGLE_PROJECT".to_string(), project.clone()));
            }
            if let Some(region) = region {
                vars.push(("GOOGLE_REGION".to_string(), region.clone()));
            }
            if let Some(credentials_ref) = credentials_ref {
                vars.push(("GOOGLE_CREDENTIALS".to_string(), credentials_ref.clone()));
            }
        }
        CredentialConfig::Known(KnownCredentialConfig::Azure {
            client_id,
            client_secret_ref,
            tenant_id,
            subscription_id,
        }) => {
            if let Some(client_id) = client_id {
                vars.push(("ARM_CLIENT_ID".to_string(), client_id.clone()));
            }
            if let Some(client_secret_ref) = client_secret_ref {
                vars.push(("ARM_CLIENT_SECRET".to_string(), client_secret_ref.clone()));
            }
            if let Some(tenant_id) = tenant_id {
                vars.push(("ARM_TENANT_ID".to_string(), tenant_id.clone()));
            }
            if let Some(subscription_id) = subscription_id {
                vars.push(("ARM_SUBSCRIPTION_ID".to_string(), subscription_id.clone()));
            }
        }
        CredentialConfig::Known(KnownCredentialConfig::Custom { env }) => {
            for (key, value) in env {
                vars.push((key.clone(), value.clone()));
            }
        }
        CredentialConfig::Unknown(_) => {}
    }
    vars
}

/// One resolved terraform variable as handed to the runner. Sensitive
/// variables carry their secret reference, not the secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedVariable {
    pub value: Option<String>,
    pub sensitive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
}

/// Merge the three layers into env vars; later layers win on key conflicts.
/// Layer order: cloud integrations < variable set entries < module env vars.
pub fn merge_env_layers(
    cloud: Vec<(String, String)>,
    entries: &[VariableSetEntry],
    module_env: &[ModuleVariable],
) -> BTreeMap<String, String> {
    let mut merged = BTreeMap::new();
    for (key, value) in cloud {
        merged.insert(key, value);
    }
    for entry in entries {
        let resolved = if entry.sensitive {
            entry.ci_secret_name.clone().unwrap_or_default()
        } else {
            entry.value.clone().unwrap_or_default()
        };
        let key = match entry.category {
            VariableCategory::Terraform => format!("TF_VAR_{}", entry.key),
            VariableCategory::Env => entry.key.clone(),
        };
        merged.insert(key, resolved);
    }
    for variable in module_env {
        let resolved = if variable.sensitive {
            variable.secret_ref.clone().unwrap_or_default()
        } else {
            variable.value.clone().unwrap_or_default()
        };
        merged.insert(variable.key.clone(), resolved);
    }
    merged
}

/// Terraform-category module variables keyed by name.
pub fn terraform_variables(variables: &[ModuleVariable]) -> BTreeMap<String, ResolvedVariable> {
    variables
        .iter()
        .filter(|variable| variable.category == VariableCategory::Terraform)
        .map(|variable| {
            let resolved = if variable.sensitive {
                ResolvedVariable {
                    value: None,
                    sensitive: true,
                    secret_ref: variable.secret_ref.clone(),
                }
            } else {
                ResolvedVariable {
                    value: variable.value.clone(),
                    sensitive: false,
                    secret_ref: None,
                }
            };
            (variable.key.clone(), resolved)
        })
        .collect()
}

async fn module_variables(pool: &PgPool, module_id: i32) -> AppResult<Vec<ModuleVariable>> {
    let variables = sqlx::query_as::<_, ModuleVariable>(
        "SELECT id, module_id, key, value, category, sensitive, secret_ref \
         FROM module_variables WHERE module_id = $1 ORDER BY key",
    )
    .bind(module_id)
    .fetch_all(pool)
    .await?;
    Ok(variables)
}

/// Assemble the snapshots a run carries: merged terraform variables, merged
/// env vars, and the state backend in effect.
pub async fn resolve_run_snapshots(
    pool: &PgPool,
    module: &EnvironmentModule,
) -> AppResult<(Value, Value, Option<Value>)> {
    let integrations =
        effective_cloud_integrations(pool, module.id, module.environment_id).await?;
    let entries = effective_variable_set_entries(pool, module.id, module.environment_id).await?;
    let variables = module_variables(pool, module.id).await?;

    let mut cloud = Vec::new();
    for integration in &integrations {
        cloud.extend(cloud_env_vars(&CredentialConfig::from_value(
            &integration.credential_config,
        )));
    }
    let module_env: Vec<ModuleVariable> = variables
        .iter()
        .filter(|variable| variable.category == VariableCategory::Env)
        .cloned()
        .collect();

    let env_vars = merge_env_layers(cloud, &entries, &module_env);
    let tf_vars = terraform_variables(&variables);

    Ok((
        serde_json::to_value(&tf_vars).unwrap_or_else(|_| json!({})),
        serde_json::to_value(&env_vars).unwrap_or_else(|_| json!({})),
        module.state_backend.clone(),
    ))
}

/// Project upstream outputs through each dependency's output mapping using
/// the dependency's most recent successful run.
pub async fn resolve_upstream_outputs(
    pool: &PgPool,
    module_id: i32,
) -> AppResult<BTreeMap<String, Value>> {
    let dependencies = sqlx::query_as::<_, crate::modules::ModuleDependency>(
        "SELECT id, module_id, depends_on_id, output_mapping, created_at \
         FROM module_dependencies WHERE module_id = $1 ORDER BY id",
    )
    .bind(module_id)
    .fetch_all(pool)
    .await?;

    let mut injected = BTreeMap::new();
    for dependency in dependencies {
        let mappings: Vec<OutputMapping> =
            serde_json::from_value(dependency.output_mapping.clone()).unwrap_or_default();
        if mappings.is_empty() {
            continue;
        }
        let outputs: Option<Value> = sqlx::query_scalar(
            r#"
            SELECT tf_outputs FROM module_runs
            WHERE module_id = $1 AND status = 'succeeded' AND tf_outputs IS NOT NULL
            ORDER BY completed_at DESC NULLS LAST, id DESC
            LIMIT 1
            "#,
        )
        .bind(dependency.depends_on_id)
        .fetch_optional(pool)
        .await?
        .flatten();
        let Some(outputs) = outputs else {
            continue;
        };
        for mapping in mappings {
            if let Some(value) = outputs.get(&mapping.output) {
                injected.insert(mapping.variable.clone(), value.clone());
            }
        }
    }
    Ok(injected)
}
