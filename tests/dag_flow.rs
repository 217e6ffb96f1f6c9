use axum::{Extension, Router};
use butler_registry::byoc::hash_callback_token;
use butler_registry::routes::api_routes;
use chrono::{Duration, Utc};
use hyper::{Body, Request, StatusCode};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use sqlx::PgPool;
use tower::ServiceExt;

fn app(pool: PgPool) -> Router {
    let job_tx = butler_registry::job_queue::start_worker(pool.clone());
    api_routes()
        .layer(Extension(pool))
        .layer(Extension(job_tx))
}

fn auth_token(user_id: i32, team: &str) -> String {
    std::env::set_var("JWT_SECRET", "integration-secret");
    let exp = (Utc::now() + Duration::hours(1)).timestamp();
    let claims = json!({"sub": user_id, "team": team, "role": "admin", "exp": exp});
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(b"integration-secret"),
    )
    .unwrap()
}

async fn seed_artifact(pool: &PgPool, team: &str) -> i32 {
    sqlx::query_scalar(
        "INSERT INTO artifacts (namespace, name, artifact_type, team, storage_config) \
         VALUES ('infra', 'vpc', 'iac-module', $1, '{\"backend\":\"git\",\"repo\":\"https://example.com/vpc.git\"}'::jsonb) \
         RETURNING id",
    )
    .bind(team)
    .fetch_one(pool)
    .await
    .unwrap()
}

async fn seed_environment(pool: &PgPool, team: &str, name: &str) -> i32 {
    sqlx::query_scalar("INSERT INTO environments (team, name) VALUES ($1, $2) RETURNING id")
        .bind(team)
        .bind(name)
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn seed_module(pool: &PgPool, environment_id: i32, artifact_id: i32, name: &str) -> i32 {
    sqlx::query_scalar(
        "INSERT INTO environment_modules \
         (environment_id, name, artifact_id, artifact_namespace, artifact_name, execution_mode) \
         VALUES ($1, $2, $3, 'infra', 'vpc', 'byoc') RETURNING id",
    )
    .bind(environment_id)
    .bind(name)
    .bind(artifact_id)
    .fetch_one(pool)
    .await
    .unwrap()
}

async fn seed_edge(pool: &PgPool, module_id: i32, depends_on_id: i32) {
    sqlx::query(
        "INSERT INTO module_dependencies (module_id, depends_on_id) VALUES ($1, $2)",
    )
    .bind(module_id)
    .bind(depends_on_id)
    .execute(pool)
    .await
    .unwrap();
}

/// A diamond environment: a -> b, a -> c, b -> d, c -> d.
async fn seed_diamond(pool: &PgPool, team: &str) -> (i32, i32, i32, i32, i32) {
    let artifact = seed_artifact(pool, team).await;
    let environment = seed_environment(pool, team, "staging").await;
    let a = seed_module(pool, environment, artifact, "a").await;
    let b = seed_module(pool, environment, artifact, "b").await;
    let c = seed_module(pool, environment, artifact, "c").await;
    let d = seed_module(pool, environment, artifact, "d").await;
    seed_edge(pool, b, a).await;
    seed_edge(pool, c, a).await;
    seed_edge(pool, d, b).await;
    seed_edge(pool, d, c).await;
    (environment, a, b, c, d)
}

async fn start_env_run(app: &Router, token: &str, environment_id: i32, operation: &str) -> Value {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/v1/environments/{}/runs", environment_id))
                .header("Authorization", format!("Bearer {}", token))
                .header("content-type", "application/json")
                .body(Body::from(json!({ "operation": operation }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Set a known callback token on a run so the test can speak the runner
/// protocol against it.
async fn arm_token(pool: &PgPool, run_id: i64) -> String {
    let token = format!("brce_{:064x}", run_id as u128);
    sqlx::query("UPDATE module_runs SET callback_token_hash = $2 WHERE id = $1")
        .bind(run_id)
        .bind(hash_callback_token(&token))
        .execute(pool)
        .await
        .unwrap();
    token
}

async fn post_status(app: &Router, run_id: i64, token: &str, status: &str) -> StatusCode {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/v1/ci/module-runs/{}/status", run_id))
                .header("Authorization", format!("Bearer {}", token))
                .header("content-type", "application/json")
                .body(Body::from(json!({ "status": status }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    response.status()
}

async fn run_status(pool: &PgPool, run_id: i64) -> String {
    sqlx::query_scalar::<_, String>("SELECT status::text FROM module_runs WHERE id = $1")
        .bind(run_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn run_for_module(pool: &PgPool, env_run_id: i64, module_id: i32) -> i64 {
    sqlx::query_scalar(
        "SELECT id FROM module_runs WHERE environment_run_id = $1 AND module_id = $2",
    )
    .bind(env_run_id)
    .bind(module_id)
    .fetch_one(pool)
    .await
    .unwrap()
}

async fn env_run_status(pool: &PgPool, env_run_id: i64) -> String {
    sqlx::query_scalar::<_, String>("SELECT status::text FROM environment_runs WHERE id = $1")
        .bind(env_run_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn diamond_waits_for_both_branches(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let token = auth_token(1, "platform");
    let app = app(pool.clone());
    let (environment, a, b, c, d) = seed_diamond(&pool, "platform").await;

    let detail = start_env_run(&app, &token, environment, "plan-all").await;
    let env_run_id = detail["id"].as_i64().unwrap();

    let run_a = run_for_module(&pool, env_run_id, a).await;
    let run_b = run_for_module(&pool, env_run_id, b).await;
    let run_c = run_for_module(&pool, env_run_id, c).await;
    let run_d = run_for_module(&pool, env_run_id, d).await;

    // Only the root is released at start.
    assert_eq!(run_status(&pool, run_a).await, "queued");
    assert_eq!(run_status(&pool, run_b).await, "pending");
    assert_eq!(run_status(&pool, run_c).await, "pending");
    assert_eq!(run_status(&pool, run_d).await, "pending");

    let token_a = arm_token(&pool, run_a).await;
    assert_eq!(post_status(&app, run_a, &token_a, "running").await, StatusCode::OK);
    assert_eq!(post_status(&app, run_a, &token_a, "planned").await, StatusCode::OK);

    // Both branches open up together; the sink still waits.
    assert_eq!(run_status(&pool, run_b).await, "queued");
    assert_eq!(run_status(&pool, run_c).await, "queued");
    assert_eq!(run_status(&pool, run_d).await, "pending");

    let token_b = arm_token(&pool, run_b).await;
    assert_eq!(post_status(&app, run_b, &token_b, "planned").await, StatusCode::OK);
    assert_eq!(run_status(&pool, run_d).await, "pending");

    let token_c = arm_token(&pool, run_c).await;
    assert_eq!(post_status(&app, run_c, &token_c, "planned").await, StatusCode::OK);
    assert_eq!(run_status(&pool, run_d).await, "queued");

    let token_d = arm_token(&pool, run_d).await;
    assert_eq!(post_status(&app, run_d, &token_d, "planned").await, StatusCode::OK);

    // Every module planned: the run waits for confirmation.
    assert_eq!(env_run_status(&pool, env_run_id).await, "planned");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn failure_skips_transitive_dependents(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let token = auth_token(1, "platform");
    let app = app(pool.clone());
    let (environment, a, b, c, d) = seed_diamond(&pool, "platform").await;

    let detail = start_env_run(&app, &token, environment, "apply-all").await;
    let env_run_id = detail["id"].as_i64().unwrap();

    let run_a = run_for_module(&pool, env_run_id, a).await;
    let run_b = run_for_module(&pool, env_run_id, b).await;
    let run_c = run_for_module(&pool, env_run_id, c).await;
    let run_d = run_for_module(&pool, env_run_id, d).await;

    let token_a = arm_token(&pool, run_a).await;
    assert_eq!(post_status(&app, run_a, &token_a, "succeeded").await, StatusCode::OK);
    assert_eq!(run_status(&pool, run_b).await, "queued");
    assert_eq!(run_status(&pool, run_c).await, "queued");

    let token_b = arm_token(&pool, run_b).await;
    assert_eq!(post_status(&app, run_b, &token_b, "failed").await, StatusCode::OK);

    // The sink is skipped, naming its failed upstream; the other branch is
    // unaffected.
    assert_eq!(run_status(&pool, run_d).await, "skipped");
    let reason: Option<String> =
        sqlx::query_scalar("SELECT skip_reason FROM module_runs WHERE id = $1")
            .bind(run_d)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert!(reason.unwrap_or_default().contains("'b'"));
    assert_eq!(run_status(&pool, run_c).await, "queued");

    let token_c = arm_token(&pool, run_c).await;
    assert_eq!(post_status(&app, run_c, &token_c, "succeeded").await, StatusCode::OK);

    assert_eq!(env_run_status(&pool, env_run_id).await, "partial_failure");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn confirmation_exclusions_close_transitively(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let token = auth_token(1, "platform");
    let app = app(pool.clone());

    // Chain: a -> b -> c
    let artifact = seed_artifact(&pool, "platform").await;
    let environment = seed_environment(&pool, "platform", "prod").await;
    let a = seed_module(&pool, environment, artifact, "a").await;
    let b = seed_module(&pool, environment, artifact, "b").await;
    let c = seed_module(&pool, environment, artifact, "c").await;
    seed_edge(&pool, b, a).await;
    seed_edge(&pool, c, b).await;

    let detail = start_env_run(&app, &token, environment, "plan-all").await;
    let env_run_id = detail["id"].as_i64().unwrap();
    let run_a = run_for_module(&pool, env_run_id, a).await;
    let run_b = run_for_module(&pool, env_run_id, b).await;
    let run_c = run_for_module(&pool, env_run_id, c).await;

    for run_id in [run_a, run_b, run_c] {
        let runner_token = arm_token(&pool, run_id).await;
        assert_eq!(
            post_status(&app, run_id, &runner_token, "planned").await,
            StatusCode::OK
        );
    }
    assert_eq!(env_run_status(&pool, env_run_id).await, "planned");

    // Exclude b: c is swept along; a proceeds to apply.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/v1/environment-runs/{}/confirm", env_run_id))
                .header("Authorization", format!("Bearer {}", token))
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({ "excluded_module_ids": [b] }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    assert_eq!(run_status(&pool, run_a).await, "confirmed");
    assert_eq!(run_status(&pool, run_b).await, "skipped");
    assert_eq!(run_status(&pool, run_c).await, "skipped");

    let token_a = arm_token(&pool, run_a).await;
    assert_eq!(post_status(&app, run_a, &token_a, "applying").await, StatusCode::OK);
    assert_eq!(post_status(&app, run_a, &token_a, "succeeded").await, StatusCode::OK);

    assert_eq!(env_run_status(&pool, env_run_id).await, "partial_failure");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn cancel_sweeps_unstarted_members(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let token = auth_token(1, "platform");
    let app = app(pool.clone());
    let (environment, a, b, c, d) = seed_diamond(&pool, "platform").await;

    let detail = start_env_run(&app, &token, environment, "apply-all").await;
    let env_run_id = detail["id"].as_i64().unwrap();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/v1/environment-runs/{}/cancel", env_run_id))
                .header("Authorization", format!("Bearer {}", token))
                .header("content-type", "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(env_run_status(&pool, env_run_id).await, "cancelled");

    for module in [a, b, c, d] {
        let run_id = run_for_module(&pool, env_run_id, module).await;
        assert_eq!(run_status(&pool, run_id).await, "cancelled");
    }
}
