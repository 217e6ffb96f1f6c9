use axum::{Extension, Router};
use butler_registry::routes::api_routes;
use butler_registry::sweeper;
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

async fn request(
    app: &Router,
    method: &str,
    uri: String,
    bearer: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("Authorization", format!("Bearer {}", bearer));
    let body = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn seed_artifact(pool: &PgPool) -> i32 {
    sqlx::query_scalar(
        "INSERT INTO artifacts (namespace, name, artifact_type, team, storage_config) \
         VALUES ('infra', 'vpc', 'iac-module', 'platform', \
                 '{\"backend\":\"git\",\"repo\":\"https://example.com/vpc.git\"}'::jsonb) \
         RETURNING id",
    )
    .fetch_one(pool)
    .await
    .unwrap()
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn locked_environments_refuse_mutations(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let app = app(pool.clone());
    let token = auth_token(1, "platform");
    let artifact = seed_artifact(&pool).await;

    let (status, environment) = request(
        &app,
        "POST",
        "/v1/environments".to_string(),
        &token,
        Some(json!({"name": "staging"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let environment_id = environment["id"].as_i64().unwrap();

    let (status, locked) = request(
        &app,
        "POST",
        format!("/v1/environments/{}/lock", environment_id),
        &token,
        Some(json!({"reason": "maintenance window"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(locked["locked"], json!(true));

    // Double-locking conflicts; module creation hits the 423.
    let (status, _) = request(
        &app,
        "POST",
        format!("/v1/environments/{}/lock", environment_id),
        &token,
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = request(
        &app,
        "POST",
        format!("/v1/environments/{}/modules", environment_id),
        &token,
        Some(json!({"name": "network", "artifact_id": artifact})),
    )
    .await;
    assert_eq!(status, StatusCode::LOCKED);
    assert_eq!(body["error"]["code"], json!("ENVIRONMENT_LOCKED"));

    let (status, _) = request(
        &app,
        "POST",
        format!("/v1/environments/{}/unlock", environment_id),
        &token,
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = request(
        &app,
        "POST",
        format!("/v1/environments/{}/modules", environment_id),
        &token,
        Some(json!({"name": "network", "artifact_id": artifact})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn cross_team_environments_read_as_missing(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let app = app(pool.clone());

    let (_, environment) = request(
        &app,
        "POST",
        "/v1/environments".to_string(),
        &auth_token(1, "platform"),
        Some(json!({"name": "staging"})),
    )
    .await;
    let environment_id = environment["id"].as_i64().unwrap();

    let (status, body) = request(
        &app,
        "GET",
        format!("/v1/environments/{}", environment_id),
        &auth_token(9, "payments"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], json!("ENVIRONMENT_NOT_FOUND"));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn dependency_cycles_are_rejected_at_write(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let app = app(pool.clone());
    let token = auth_token(1, "platform");
    let artifact = seed_artifact(&pool).await;

    let (_, environment) = request(
        &app,
        "POST",
        "/v1/environments".to_string(),
        &token,
        Some(json!({"name": "staging"})),
    )
    .await;
    let environment_id = environment["id"].as_i64().unwrap();

    let mut modules = Vec::new();
    for name in ["a", "b", "c"] {
        let (status, module) = request(
            &app,
            "POST",
            format!("/v1/environments/{}/modules", environment_id),
            &token,
            Some(json!({"name": name, "artifact_id": artifact})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        modules.push(module["id"].as_i64().unwrap());
    }
    let (a, b, c) = (modules[0], modules[1], modules[2]);

    // b -> a and c -> b are fine.
    let (status, _) = request(
        &app,
        "PUT",
        format!("/v1/environments/{}/modules/{}/dependencies", environment_id, b),
        &token,
        Some(json!({"dependencies": [{"depends_on_id": a}]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = request(
        &app,
        "PUT",
        format!("/v1/environments/{}/modules/{}/dependencies", environment_id, c),
        &token,
        Some(json!({"dependencies": [{"depends_on_id": b}]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // a -> c closes the loop and is refused with the offending path.
    let (status, body) = request(
        &app,
        "PUT",
        format!("/v1/environments/{}/modules/{}/dependencies", environment_id, a),
        &token,
        Some(json!({"dependencies": [{"depends_on_id": c}]})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let message = body["error"]["message"].as_str().unwrap_or_default();
    assert!(message.contains("cycle"));

    // Self-dependencies are refused outright.
    let (status, _) = request(
        &app,
        "PUT",
        format!("/v1/environments/{}/modules/{}/dependencies", environment_id, a),
        &token,
        Some(json!({"dependencies": [{"depends_on_id": a}]})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn graph_lists_nodes_and_edges(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let app = app(pool.clone());
    let token = auth_token(1, "platform");
    let artifact = seed_artifact(&pool).await;

    let (_, environment) = request(
        &app,
        "POST",
        "/v1/environments".to_string(),
        &token,
        Some(json!({"name": "staging"})),
    )
    .await;
    let environment_id = environment["id"].as_i64().unwrap();

    let mut modules = Vec::new();
    for name in ["base", "app"] {
        let (_, module) = request(
            &app,
            "POST",
            format!("/v1/environments/{}/modules", environment_id),
            &token,
            Some(json!({"name": name, "artifact_id": artifact})),
        )
        .await;
        modules.push(module["id"].as_i64().unwrap());
    }
    let (status, _) = request(
        &app,
        "PUT",
        format!(
            "/v1/environments/{}/modules/{}/dependencies",
            environment_id, modules[1]
        ),
        &token,
        Some(json!({"dependencies": [{"depends_on_id": modules[0],
            "output_mapping": [{"output": "vpc_id", "variable": "vpc_id"}]}]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, graph) = request(
        &app,
        "GET",
        format!("/v1/environments/{}/graph", environment_id),
        &token,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(graph["nodes"].as_array().map(Vec::len), Some(2));
    assert_eq!(graph["edges"].as_array().map(Vec::len), Some(1));
    assert_eq!(graph["edges"][0]["from"], json!(modules[0]));
    assert_eq!(graph["edges"][0]["to"], json!(modules[1]));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn sensitive_module_variables_are_masked_on_read(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let app = app(pool.clone());
    let token = auth_token(1, "platform");
    let artifact = seed_artifact(&pool).await;

    let (_, environment) = request(
        &app,
        "POST",
        "/v1/environments".to_string(),
        &token,
        Some(json!({"name": "staging"})),
    )
    .await;
    let environment_id = environment["id"].as_i64().unwrap();
    let (_, module) = request(
        &app,
        "POST",
        format!("/v1/environments/{}/modules", environment_id),
        &token,
        Some(json!({"name": "network", "artifact_id": artifact})),
    )
    .await;
    let module_id = module["id"].as_i64().unwrap();

    let (status, _) = request(
        &app,
        "PUT",
        format!(
            "/v1/environments/{}/modules/{}/variables",
            environment_id, module_id
        ),
        &token,
        Some(json!({"variables": [
            {"key": "cidr", "value": "10.0.0.0/16"},
            {"key": "db_password", "value": "hunter2", "sensitive": true,
             "secret_ref": "vault://db/password"}
        ]})),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, variables) = request(
        &app,
        "GET",
        format!(
            "/v1/environments/{}/modules/{}/variables",
            environment_id, module_id
        ),
        &token,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let list = variables.as_array().unwrap();
    let sensitive = list
        .iter()
        .find(|variable| variable["key"] == json!("db_password"))
        .unwrap();
    assert_eq!(sensitive["value"], Value::Null);
    assert_eq!(sensitive["secret_ref"], json!("vault://db/password"));
    let plain = list
        .iter()
        .find(|variable| variable["key"] == json!("cidr"))
        .unwrap();
    assert_eq!(plain["value"], json!("10.0.0.0/16"));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn sweeper_times_out_stale_planned_runs(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let artifact = seed_artifact(&pool).await;
    let environment: i32 = sqlx::query_scalar(
        "INSERT INTO environments (team, name) VALUES ('platform', 'staging') RETURNING id",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    let module: i32 = sqlx::query_scalar(
        "INSERT INTO environment_modules \
         (environment_id, name, artifact_id, artifact_namespace, artifact_name) \
         VALUES ($1, 'network', $2, 'infra', 'vpc') RETURNING id",
    )
    .bind(environment)
    .bind(artifact)
    .fetch_one(&pool)
    .await
    .unwrap();

    // One stale standalone planned run, one fresh.
    let stale: i64 = sqlx::query_scalar(
        "INSERT INTO module_runs (module_id, environment_id, operation, status, updated_at) \
         VALUES ($1, $2, 'plan', 'planned', NOW() - INTERVAL '2 days') RETURNING id",
    )
    .bind(module)
    .bind(environment)
    .fetch_one(&pool)
    .await
    .unwrap();
    let fresh: i64 = sqlx::query_scalar(
        "INSERT INTO module_runs (module_id, environment_id, operation, status) \
         VALUES ($1, $2, 'plan', 'planned') RETURNING id",
    )
    .bind(module)
    .bind(environment)
    .fetch_one(&pool)
    .await
    .unwrap();

    let swept = sweeper::sweep_stale_planned_runs(&pool, 24 * 60 * 60).await.unwrap();
    assert_eq!(swept, 1);

    let status: String =
        sqlx::query_scalar("SELECT status::text FROM module_runs WHERE id = $1")
            .bind(stale)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(status, "timed_out");
    let status: String =
        sqlx::query_scalar("SELECT status::text FROM module_runs WHERE id = $1")
            .bind(fresh)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(status, "planned");

    // Sweeping again is a no-op.
    let swept = sweeper::sweep_stale_planned_runs(&pool, 24 * 60 * 60).await.unwrap();
    assert_eq!(swept, 0);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn sweeper_expires_stale_environment_runs(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let environment: i32 = sqlx::query_scalar(
        "INSERT INTO environments (team, name) VALUES ('platform', 'staging') RETURNING id",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    let env_run: i64 = sqlx::query_scalar(
        "INSERT INTO environment_runs \
         (environment_id, operation, status, total_modules, pending_modules, updated_at) \
         VALUES ($1, 'plan-all', 'planned', 2, 0, NOW() - INTERVAL '3 days') RETURNING id",
    )
    .bind(environment)
    .fetch_one(&pool)
    .await
    .unwrap();

    let swept = sweeper::sweep_stale_environment_runs(&pool, 24 * 60 * 60).await.unwrap();
    assert_eq!(swept, 1);

    let status: String =
        sqlx::query_scalar("SELECT status::text FROM environment_runs WHERE id = $1")
            .bind(env_run)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(status, "expired");
}
