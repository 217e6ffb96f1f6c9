use sqlx::PgPool;

use crate::error::AppResult;
use crate::modules::{EnvironmentModule, MODULE_COLUMNS};
use crate::runs::{create_module_run, NewModuleRun, RunOperation, RunPriority};

/// Fan a freshly approved artifact version out as speculative plans: every
/// module pinned to the artifact with auto-plan enabled, in an unlocked
/// active environment, gets a cascade-priority plan run. The queue's
/// coalescing rule collapses older queued cascades on the same module.
pub async fn enqueue_cascade_plans(
    pool: &PgPool,
    artifact_id: i32,
    version: &str,
) -> AppResult<usize> {
    let query = format!(
        r#"
        SELECT {columns}
        FROM environment_modules m
        JOIN environments e ON e.id = m.environment_id
        WHERE m.artifact_id = $1
          AND m.auto_plan_on_module_update
          AND e.status = 'active'
          AND NOT e.locked
        ORDER BY m.id
        "#,
        columns = MODULE_COLUMNS
            .split(", ")
            .map(|column| format!("m.{column}"))
            .collect::<Vec<_>>()
            .join(", ")
    );
    let modules = sqlx::query_as::<_, EnvironmentModule>(&query)
        .bind(artifact_id)
        .fetch_all(pool)
        .await?;

    let mut created = 0usize;
    for module in &modules {
        let result = create_module_run(
            pool,
            NewModuleRun {
                module_id: module.id,
                environment_id: module.environment_id,
                environment_run_id: None,
                operation: RunOperation::Plan,
                mode: module.execution_mode,
                priority: RunPriority::Cascade,
                version: Some(version.to_string()),
                created_by: None,
                hold_pending: false,
            },
        )
        .await;
        match result {
            Ok(run) => {
                created += 1;
                tracing::debug!(
                    module_id = module.id,
                    run_id = run.run.id,
                    %version,
                    "cascade plan enqueued"
                );
            }
            Err(err) => {
                // One module's failure never blocks the rest of the fan-out.
                tracing::warn!(?err, module_id = module.id, "cascade plan failed");
            }
        }
    }
    Ok(created)
}
