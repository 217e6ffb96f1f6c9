use axum::{extract::Extension, http::StatusCode, routing::post, Router};
use sqlx::PgPool;

use crate::error::{AppError, AppResult};
use crate::{
    artifacts, byoc, dag, environments, governance, integrations, modules, protocol, runs,
    versions,
};

pub fn api_routes() -> Router {
    Router::new()
        .merge(artifacts::routes())
        .merge(versions::routes())
        .merge(governance::routes())
        .merge(environments::routes())
        .merge(modules::routes())
        .merge(integrations::routes())
        .merge(runs::routes())
        .merge(dag::routes())
        .merge(byoc::routes())
        .merge(protocol::routes())
        .route("/v1/test/reset-all-data", post(reset_all_data))
}

/// Destructive test hook. Refuses to exist unless the operator opted in
/// through the explicit env flag.
async fn reset_all_data(Extension(pool): Extension<PgPool>) -> AppResult<StatusCode> {
    if !*crate::config::ENABLE_TEST_RESET {
        return Err(AppError::Forbidden("Test reset is not enabled".into()));
    }
    sqlx::query(
        "TRUNCATE artifacts, artifact_versions, version_approvals, ci_results, environments, \
         environment_modules, module_dependencies, environment_runs, module_runs, \
         module_run_logs, module_run_outputs, cloud_integrations, variable_sets, \
         variable_set_entries, module_variables, environment_cloud_integrations, \
         module_cloud_integrations, environment_variable_sets, module_variable_sets, \
         policy_templates, policy_bindings, policy_evaluations, job_queue \
         RESTART IDENTITY CASCADE",
    )
    .execute(&pool)
    .await?;
    tracing::warn!("all data reset via test hook");
    Ok(StatusCode::NO_CONTENT)
}
