use axum::{Extension, Router};
use butler_registry::routes::api_routes;
use hyper::{Body, Request, StatusCode};
use serde_json::{json, Value};
use sqlx::PgPool;
use tower::ServiceExt;

fn app(pool: PgPool) -> Router {
    let job_tx = butler_registry::job_queue::start_worker(pool.clone());
    api_routes()
        .layer(Extension(pool))
        .layer(Extension(job_tx))
}

async fn get(app: &Router, uri: &str) -> (StatusCode, hyper::HeaderMap, Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, headers, value)
}

async fn seed_module_artifact(pool: &PgPool) -> i32 {
    sqlx::query_scalar(
        "INSERT INTO artifacts (namespace, name, provider, artifact_type, team, storage_config) \
         VALUES ('acme', 'network', 'aws', 'iac-module', 'platform', \
                 '{\"backend\":\"git\",\"repo\":\"https://example.com/network.git\",\"tag_prefix\":\"v\"}'::jsonb) \
         RETURNING id",
    )
    .fetch_one(pool)
    .await
    .unwrap()
}

async fn seed_version_with(
    pool: &PgPool,
    artifact_id: i32,
    version: &str,
    approval_status: &str,
    is_bad: bool,
    metadata: Option<Value>,
) -> i32 {
    let parsed = semver::Version::parse(version).unwrap();
    sqlx::query_scalar(
        "INSERT INTO artifact_versions \
         (artifact_id, version, major, minor, patch, approval_status, is_bad, metadata) \
         VALUES ($1, $2, $3, $4, $5, $6::approval_status, $7, $8) RETURNING id",
    )
    .bind(artifact_id)
    .bind(version)
    .bind(parsed.major as i32)
    .bind(parsed.minor as i32)
    .bind(parsed.patch as i32)
    .bind(approval_status)
    .bind(is_bad)
    .bind(metadata)
    .fetch_one(pool)
    .await
    .unwrap()
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn discovery_names_the_service_paths(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let app = app(pool);
    for uri in ["/.well-known/terraform.json", "/.well-known/opentofu.json"] {
        let (status, _, body) = get(&app, uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["modules.v1"], json!("/v1/modules/"));
        assert_eq!(body["providers.v1"], json!("/v1/providers/"));
    }
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn version_listing_hides_pending_and_yanked(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let artifact = seed_module_artifact(&pool).await;
    seed_version_with(&pool, artifact, "1.0.0", "approved", false, None).await;
    seed_version_with(&pool, artifact, "1.1.0", "pending", false, None).await;
    seed_version_with(&pool, artifact, "0.9.0", "approved", true, None).await;

    let app = app(pool);
    let (status, _, body) = get(&app, "/v1/modules/acme/network/aws/versions").await;
    assert_eq!(status, StatusCode::OK);
    let versions: Vec<&str> = body["modules"][0]["versions"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|entry| entry["version"].as_str())
        .collect();
    assert_eq!(versions, vec!["1.0.0"]);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn module_download_points_at_the_tagged_source(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let artifact = seed_module_artifact(&pool).await;
    seed_version_with(&pool, artifact, "1.0.0", "approved", false, None).await;

    let app = app(pool.clone());
    let (status, headers, _) = get(&app, "/v1/modules/acme/network/aws/1.0.0/download").await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(
        headers.get("x-terraform-get").and_then(|v| v.to_str().ok()),
        Some("git::https://example.com/network.git?ref=v1.0.0")
    );
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn yanked_versions_are_absent_from_downloads(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let artifact = seed_module_artifact(&pool).await;
    seed_version_with(&pool, artifact, "1.0.0", "approved", true, None).await;
    seed_version_with(&pool, artifact, "1.1.0", "pending", false, None).await;

    let app = app(pool);
    let (status, _, _) = get(&app, "/v1/modules/acme/network/aws/1.0.0/download").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _, _) = get(&app, "/v1/modules/acme/network/aws/1.1.0/download").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn block_policies_refuse_downloads(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let artifact = seed_module_artifact(&pool).await;
    seed_version_with(&pool, artifact, "1.0.0", "approved", false, None).await;

    let template_id: i32 = sqlx::query_scalar(
        "INSERT INTO policy_templates (name, enforcement_level, rules) \
         VALUES ('scan-gate', 'block', '{\"requiredScanGrade\": \"A\"}') RETURNING id",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    sqlx::query("INSERT INTO policy_bindings (template_id, scope_type) VALUES ($1, 'global')")
        .bind(template_id)
        .execute(&pool)
        .await
        .unwrap();

    let app = app(pool.clone());
    let (status, _, body) = get(&app, "/v1/modules/acme/network/aws/1.0.0/download").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], json!("FORBIDDEN"));

    // The refusal is in the decision log.
    let denied: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM policy_evaluations \
         WHERE artifact_id = $1 AND evaluation_type = 'download' AND decision = 'denied'",
    )
    .bind(artifact)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(denied, 1);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn provider_download_serves_platform_documents(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let artifact: i32 = sqlx::query_scalar(
        "INSERT INTO artifacts (namespace, name, artifact_type, team, storage_config) \
         VALUES ('acme', 'custom', 'iac-provider', 'platform', \
                 '{\"backend\":\"oci\",\"reference\":\"registry.example.com/providers/custom\"}'::jsonb) \
         RETURNING id",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    seed_version_with(
        &pool,
        artifact,
        "0.3.0",
        "approved",
        false,
        Some(json!({
            "platforms": [
                {"os": "linux", "arch": "amd64", "filename": "custom_0.3.0_linux_amd64.zip",
                 "download_url": "https://releases.example.com/custom_0.3.0_linux_amd64.zip",
                 "shasum": "abc123"},
                {"os": "darwin", "arch": "arm64", "filename": "custom_0.3.0_darwin_arm64.zip",
                 "download_url": "https://releases.example.com/custom_0.3.0_darwin_arm64.zip",
                 "shasum": "def456"}
            ]
        })),
    )
    .await;

    let app = app(pool);
    let (status, _, body) = get(&app, "/v1/providers/acme/custom/versions").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["versions"][0]["version"], json!("0.3.0"));
    assert_eq!(body["versions"][0]["platforms"].as_array().map(Vec::len), Some(2));

    let (status, _, body) =
        get(&app, "/v1/providers/acme/custom/0.3.0/download/linux/amd64").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["filename"], json!("custom_0.3.0_linux_amd64.zip"));
    assert_eq!(body["shasum"], json!("abc123"));
    assert_eq!(body["protocols"], json!(["5.0"]));

    let (status, _, _) =
        get(&app, "/v1/providers/acme/custom/0.3.0/download/windows/386").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn helm_index_revalidates_with_etag(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let chart: i32 = sqlx::query_scalar(
        "INSERT INTO artifacts (namespace, name, artifact_type, team, storage_config) \
         VALUES ('acme', 'web-app', 'chart', 'platform', \
                 '{\"backend\":\"oci\",\"reference\":\"registry.example.com/charts/web-app\"}'::jsonb) \
         RETURNING id",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    seed_version_with(&pool, chart, "2.1.0", "approved", false, None).await;

    let app = app(pool);
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/helm/acme/index.yaml")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let etag = response
        .headers()
        .get("etag")
        .and_then(|value| value.to_str().ok())
        .unwrap()
        .to_string();
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let body = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(body.contains("web-app"));
    assert!(body.contains("2.1.0"));

    let revalidation = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/helm/acme/index.yaml")
                .header("If-None-Match", &etag)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(revalidation.status(), StatusCode::NOT_MODIFIED);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn oci_root_advertises_the_api_version(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let app = app(pool);
    let (status, headers, body) = get(&app, "/oci/v2/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({}));
    assert_eq!(
        headers
            .get("docker-distribution-api-version")
            .and_then(|value| value.to_str().ok()),
        Some("registry/2.0")
    );
}
