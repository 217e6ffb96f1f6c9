use axum::{Extension, Router};
use butler_registry::routes::api_routes;
use butler_registry::versions::approve_version_tx;
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

async fn seed_artifact_with_inline_policy(pool: &PgPool, inline: Option<Value>) -> i32 {
    sqlx::query_scalar(
        "INSERT INTO artifacts (namespace, name, artifact_type, team, storage_config, approval_policy) \
         VALUES ('infra', 'vpc', 'iac-module', 'platform', \
                 '{\"backend\":\"git\",\"repo\":\"https://example.com/vpc.git\"}'::jsonb, $1) \
         RETURNING id",
    )
    .bind(inline)
    .fetch_one(pool)
    .await
    .unwrap()
}

async fn bind_global_policy(pool: &PgPool, name: &str, level: &str, rules: Value) {
    let template_id: i32 = sqlx::query_scalar(
        "INSERT INTO policy_templates (name, enforcement_level, rules) \
         VALUES ($1, $2::enforcement_level, $3) RETURNING id",
    )
    .bind(name)
    .bind(level)
    .bind(rules)
    .fetch_one(pool)
    .await
    .unwrap();
    sqlx::query("INSERT INTO policy_bindings (template_id, scope_type) VALUES ($1, 'global')")
        .bind(template_id)
        .execute(pool)
        .await
        .unwrap();
}

async fn seed_version(pool: &PgPool, artifact_id: i32, version: &str, published_by: i32) -> i32 {
    let parsed = semver::Version::parse(version).unwrap();
    sqlx::query_scalar(
        "INSERT INTO artifact_versions (artifact_id, version, major, minor, patch, published_by) \
         VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
    )
    .bind(artifact_id)
    .bind(version)
    .bind(parsed.major as i32)
    .bind(parsed.minor as i32)
    .bind(parsed.patch as i32)
    .bind(published_by)
    .fetch_one(pool)
    .await
    .unwrap()
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn artifact_scope_hides_global_rules(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let app = app(pool.clone());

    // Two global policies at 1 and 3 approvers; the inline artifact policy
    // demands 2 and wins for that rule.
    seed_artifact_with_inline_policy(&pool, Some(json!({"rules": {"minApprovers": 2}}))).await;
    bind_global_policy(&pool, "loose", "block", json!({"minApprovers": 1})).await;
    bind_global_policy(&pool, "strict", "block", json!({"minApprovers": 3})).await;

    let (status, body) = request(
        &app,
        "GET",
        "/v1/artifacts/infra/vpc/effective-policy".to_string(),
        &auth_token(1, "platform"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["rules"]["minApprovers"], json!(2));
    assert_eq!(body["enforcement_level"], json!("block"));
    assert_eq!(body["sources"].as_array().map(Vec::len), Some(3));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn approval_waits_for_the_required_quorum(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let app = app(pool.clone());

    let artifact = seed_artifact_with_inline_policy(&pool, None).await;
    bind_global_policy(&pool, "two-eyes", "block", json!({"minApprovers": 2})).await;
    seed_version(&pool, artifact, "1.0.0", 1).await;

    let uri = "/v1/artifacts/infra/vpc/versions/1.0.0/approve".to_string();

    let (status, body) = request(&app, "POST", uri.clone(), &auth_token(2, "platform"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["approved"], json!(false));
    assert_eq!(body["approvals"], json!(1));
    assert_eq!(body["required_approvals"], json!(2));

    // The same approver again does not move the count.
    let (_, body) = request(&app, "POST", uri.clone(), &auth_token(2, "platform"), None).await;
    assert_eq!(body["approved"], json!(false));
    assert_eq!(body["approvals"], json!(1));

    let (status, body) = request(&app, "POST", uri, &auth_token(3, "platform"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["approved"], json!(true));
    assert_eq!(body["version"]["approval_status"], json!("approved"));
    assert_eq!(body["version"]["is_latest"], json!(true));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn approval_flips_latest_exactly_once(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let app = app(pool.clone());

    let artifact = seed_artifact_with_inline_policy(&pool, None).await;
    seed_version(&pool, artifact, "1.0.0", 1).await;
    seed_version(&pool, artifact, "1.1.0", 1).await;

    for version in ["1.0.0", "1.1.0"] {
        let (status, _) = request(
            &app,
            "POST",
            format!("/v1/artifacts/infra/vpc/versions/{}/approve", version),
            &auth_token(2, "platform"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let latest: Vec<String> = sqlx::query_scalar(
        "SELECT version FROM artifact_versions WHERE artifact_id = $1 AND is_latest",
    )
    .bind(artifact)
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(latest, vec!["1.1.0".to_string()]);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn publishers_cannot_approve_their_own_versions(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let app = app(pool.clone());

    let artifact = seed_artifact_with_inline_policy(&pool, None).await;
    seed_version(&pool, artifact, "1.0.0", 7).await;

    let (status, body) = request(
        &app,
        "POST",
        "/v1/artifacts/infra/vpc/versions/1.0.0/approve".to_string(),
        &auth_token(7, "platform"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], json!("FORBIDDEN"));

    // The denial landed in the decision log.
    let denied: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM policy_evaluations WHERE artifact_id = $1 AND decision = 'denied'",
    )
    .bind(artifact)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(denied, 1);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn blocked_rules_deny_while_warn_passes_through(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let app = app(pool.clone());

    let artifact = seed_artifact_with_inline_policy(&pool, None).await;
    bind_global_policy(
        &pool,
        "scan-required",
        "block",
        json!({"requiredScanGrade": "B"}),
    )
    .await;
    seed_version(&pool, artifact, "1.0.0", 1).await;

    let uri = "/v1/artifacts/infra/vpc/versions/1.0.0/approve".to_string();
    let (status, _) = request(&app, "POST", uri.clone(), &auth_token(2, "platform"), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // A failing grade still blocks; a passing grade clears the gate.
    sqlx::query(
        "INSERT INTO ci_results (version_id, result_type, grade, status) \
         SELECT id, 'security-scan', 'C', 'completed' FROM artifact_versions \
         WHERE artifact_id = $1 AND version = '1.0.0'",
    )
    .bind(artifact)
    .execute(&pool)
    .await
    .unwrap();
    let (status, _) = request(&app, "POST", uri.clone(), &auth_token(2, "platform"), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    sqlx::query(
        "INSERT INTO ci_results (version_id, result_type, grade, status) \
         SELECT id, 'security-scan', 'A', 'completed' FROM artifact_versions \
         WHERE artifact_id = $1 AND version = '1.0.0'",
    )
    .bind(artifact)
    .execute(&pool)
    .await
    .unwrap();
    let (status, body) = request(&app, "POST", uri, &auth_token(2, "platform"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["approved"], json!(true));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn transactional_approve_admits_exactly_one_winner(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let artifact = seed_artifact_with_inline_policy(&pool, None).await;
    let version_id = seed_version(&pool, artifact, "1.0.0", 1).await;

    let first = approve_version_tx(&pool, version_id).await.unwrap();
    assert!(first.is_some());
    // The second caller finds a settled row and no-ops.
    let second = approve_version_tx(&pool, version_id).await.unwrap();
    assert!(second.is_none());

    let approved: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM artifact_versions \
         WHERE artifact_id = $1 AND approval_status = 'approved'",
    )
    .bind(artifact)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(approved, 1);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn the_database_rejects_a_second_latest_row(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let artifact = seed_artifact_with_inline_policy(&pool, None).await;
    let first = seed_version(&pool, artifact, "1.0.0", 1).await;
    let second = seed_version(&pool, artifact, "1.1.0", 1).await;

    sqlx::query("UPDATE artifact_versions SET is_latest = TRUE WHERE id = $1")
        .bind(first)
        .execute(&pool)
        .await
        .unwrap();

    // Even a writer that bypasses the approve transaction cannot produce a
    // second latest row for the same artifact.
    let result = sqlx::query("UPDATE artifact_versions SET is_latest = TRUE WHERE id = $1")
        .bind(second)
        .execute(&pool)
        .await;
    match result {
        Err(sqlx::Error::Database(db_err)) => {
            assert_eq!(db_err.constraint(), Some("artifact_versions_one_latest"));
        }
        other => panic!("expected unique violation, got {:?}", other),
    }

    let latest: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM artifact_versions WHERE artifact_id = $1 AND is_latest",
    )
    .bind(artifact)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(latest, 1);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn rejected_versions_cannot_be_approved(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let app = app(pool.clone());

    let artifact = seed_artifact_with_inline_policy(&pool, None).await;
    seed_version(&pool, artifact, "1.0.0", 1).await;

    let (status, _) = request(
        &app,
        "POST",
        "/v1/artifacts/infra/vpc/versions/1.0.0/reject".to_string(),
        &auth_token(2, "platform"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = request(
        &app,
        "POST",
        "/v1/artifacts/infra/vpc/versions/1.0.0/approve".to_string(),
        &auth_token(3, "platform"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}
