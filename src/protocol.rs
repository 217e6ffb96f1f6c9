use axum::{
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use tokio::sync::mpsc::Sender;

use crate::artifacts::{find_artifact, Artifact, KnownStorageConfig, StorageConfig};
use crate::error::{AppError, AppResult};
use crate::governance::gate::{evaluate_download, DownloadDecision};
use crate::job_queue::{dispatch, Job};
use crate::versions::{find_version, ApprovalStatus, ArtifactVersion, VERSION_COLUMNS};

/// Wire protocols the IaC tooling speaks: registry discovery, module and
/// provider download, the Helm repository index, and the OCI v2 root.
/// These endpoints are anonymous; governance gates run per download.
pub fn routes() -> Router {
    Router::new()
        .route("/.well-known/terraform.json", get(discovery_document))
        .route("/.well-known/opentofu.json", get(discovery_document))
        .route(
            "/v1/modules/:namespace/:name/:provider/versions",
            get(module_versions),
        )
        .route(
            "/v1/modules/:namespace/:name/:provider/:version/download",
            get(module_download),
        )
        .route("/v1/providers/:namespace/:type/versions", get(provider_versions))
        .route(
            "/v1/providers/:namespace/:type/:version/download/:os/:arch",
            get(provider_download),
        )
        .route("/helm/:namespace/index.yaml", get(helm_index))
        .route("/oci/v2/", get(oci_root))
}

async fn discovery_document() -> Json<Value> {
    Json(json!({
        "modules.v1": "/v1/modules/",
        "providers.v1": "/v1/providers/",
    }))
}

/// A version is downloadable when approved and not yanked. Everything else
/// is absent as far as the wire protocol is concerned.
fn downloadable(version: &ArtifactVersion) -> bool {
    version.approval_status == ApprovalStatus::Approved && !version.is_bad
}

async fn downloadable_versions(
    pool: &PgPool,
    artifact_id: i32,
) -> AppResult<Vec<ArtifactVersion>> {
    let query = format!(
        "SELECT {VERSION_COLUMNS} FROM artifact_versions \
         WHERE artifact_id = $1 AND approval_status = 'approved' AND NOT is_bad \
         ORDER BY major DESC, minor DESC, patch DESC, id ASC"
    );
    let versions = sqlx::query_as::<_, ArtifactVersion>(&query)
        .bind(artifact_id)
        .fetch_all(pool)
        .await?;
    Ok(versions)
}

async fn wire_artifact(
    pool: &PgPool,
    namespace: &str,
    name: &str,
    provider: Option<&str>,
) -> AppResult<Artifact> {
    let artifact = find_artifact(pool, namespace, name, provider).await?;
    if artifact.status == crate::artifacts::ArtifactStatus::Archived {
        return Err(AppError::not_found("ARTIFACT_NOT_FOUND", "Artifact not found"));
    }
    Ok(artifact)
}

async fn module_versions(
    Extension(pool): Extension<PgPool>,
    Path((namespace, name, provider)): Path<(String, String, String)>,
) -> AppResult<Json<Value>> {
    let artifact = wire_artifact(&pool, &namespace, &name, Some(provider.as_str())).await?;
    let versions = downloadable_versions(&pool, artifact.id).await?;
    let entries: Vec<Value> = versions
        .iter()
        .map(|version| json!({ "version": version.version }))
        .collect();
    Ok(Json(json!({ "modules": [{ "versions": entries }] })))
}

/// Module download per the registry v1 protocol: an empty 204 whose
/// `X-Terraform-Get` header points at the artifact source.
async fn module_download(
    Extension(pool): Extension<PgPool>,
    Extension(job_tx): Extension<Sender<Job>>,
    Path((namespace, name, provider, version)): Path<(String, String, String, String)>,
) -> AppResult<(StatusCode, HeaderMap)> {
    let artifact = wire_artifact(&pool, &namespace, &name, Some(provider.as_str())).await?;
    let target = find_version(&pool, artifact.id, &version).await?;
    if !downloadable(&target) {
        return Err(AppError::not_found("VERSION_NOT_FOUND", "Version not found"));
    }

    let mut headers = HeaderMap::new();
    match evaluate_download(&pool, &artifact, &target).await? {
        DownloadDecision::Allow => {}
        DownloadDecision::AllowWithWarning(warning) => {
            if let Ok(value) = warning.parse() {
                headers.insert("x-butler-policy-warning", value);
            }
        }
        DownloadDecision::Deny(reason) => {
            return Err(AppError::Forbidden(format!(
                "Download blocked by policy: {}",
                reason
            )));
        }
    }

    let location = download_location(&artifact.storage_config, target.storage_ref.as_deref(), &version)
        .ok_or_else(|| {
            AppError::BadRequest("Artifact storage config does not support download".into())
        })?;
    headers.insert(
        "x-terraform-get",
        location
            .parse()
            .map_err(|_| AppError::Message("Invalid download location".into()))?,
    );

    dispatch(
        &pool,
        &job_tx,
        Job::RecordDownload {
            artifact_id: artifact.id,
        },
    )
    .await;

    Ok((StatusCode::NO_CONTENT, headers))
}

/// Source address for `X-Terraform-Get`. Git backends produce a
/// `git::` address pinned to the version tag; OCI backends hand back the
/// version-tagged reference.
pub fn download_location(
    storage_config: &Value,
    storage_ref: Option<&str>,
    version: &str,
) -> Option<String> {
    match StorageConfig::from_value(storage_config) {
        StorageConfig::Known(KnownStorageConfig::Git {
            repo,
            tag_prefix,
            path,
        }) => {
            let prefix = tag_prefix.unwrap_or_default();
            Some(match path {
                Some(path) if !path.is_empty() => {
                    format!("git::{}///{}?ref={}{}", repo, path, prefix, version)
                }
                _ => format!("git::{}?ref={}{}", repo, prefix, version),
            })
        }
        StorageConfig::Known(KnownStorageConfig::Oci { reference }) => {
            Some(format!("oci://{}:{}", reference, version))
        }
        StorageConfig::Unknown(_) => storage_ref.map(str::to_string),
    }
}

async fn provider_versions(
    Extension(pool): Extension<PgPool>,
    Path((namespace, provider_type)): Path<(String, String)>,
) -> AppResult<Json<Value>> {
    let artifact = wire_artifact(&pool, &namespace, &provider_type, None).await?;
    let versions = downloadable_versions(&pool, artifact.id).await?;
    let entries: Vec<Value> = versions
        .iter()
        .map(|version| {
            let platforms = version
                .metadata
                .as_ref()
                .and_then(|metadata| metadata.get("platforms"))
                .and_then(Value::as_array)
                .map(|platforms| {
                    platforms
                        .iter()
                        .map(|platform| {
                            json!({
                                "os": platform.get("os").cloned().unwrap_or(Value::Null),
                                "arch": platform.get("arch").cloned().unwrap_or(Value::Null),
                            })
                        })
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            json!({
                "version": version.version,
                "protocols": ["5.0"],
                "platforms": platforms,
            })
        })
        .collect();
    Ok(Json(json!({ "versions": entries })))
}

async fn provider_download(
    Extension(pool): Extension<PgPool>,
    Extension(job_tx): Extension<Sender<Job>>,
    Path((namespace, provider_type, version, os, arch)): Path<(
        String,
        String,
        String,
        String,
        String,
    )>,
) -> AppResult<Json<Value>> {
    let artifact = wire_artifact(&pool, &namespace, &provider_type, None).await?;
    let target = find_version(&pool, artifact.id, &version).await?;
    if !downloadable(&target) {
        return Err(AppError::not_found("VERSION_NOT_FOUND", "Version not found"));
    }
    if let DownloadDecision::Deny(reason) = evaluate_download(&pool, &artifact, &target).await? {
        return Err(AppError::Forbidden(format!(
            "Download blocked by policy: {}",
            reason
        )));
    }

    let platform = target
        .metadata
        .as_ref()
        .and_then(|metadata| metadata.get("platforms"))
        .and_then(Value::as_array)
        .and_then(|platforms| {
            platforms.iter().find(|platform| {
                platform.get("os").and_then(Value::as_str) == Some(os.as_str())
                    && platform.get("arch").and_then(Value::as_str) == Some(arch.as_str())
            })
        })
        .cloned()
        .ok_or_else(|| {
            AppError::not_found("PLATFORM_NOT_FOUND", "No build for requested platform")
        })?;

    dispatch(
        &pool,
        &job_tx,
        Job::RecordDownload {
            artifact_id: artifact.id,
        },
    )
    .await;

    Ok(Json(json!({
        "protocols": ["5.0"],
        "os": os,
        "arch": arch,
        "filename": platform.get("filename").cloned().unwrap_or(Value::Null),
        "download_url": platform.get("download_url").cloned().unwrap_or(Value::Null),
        "shasum": platform.get("shasum").cloned().unwrap_or(Value::Null),
    })))
}

#[derive(Debug, Serialize)]
struct HelmEntry {
    name: String,
    version: String,
    created: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    urls: Vec<String>,
}

/// Helm repository index for a namespace. The ETag is the digest of the
/// rendered entries, so unchanged indexes revalidate as 304.
async fn helm_index(
    Extension(pool): Extension<PgPool>,
    Path(namespace): Path<String>,
    request_headers: HeaderMap,
) -> AppResult<axum::response::Response> {
    use axum::response::IntoResponse;

    let charts = sqlx::query_as::<_, Artifact>(
        "SELECT id, namespace, name, provider, artifact_type, team, description, storage_config, \
         source_config, approval_policy, tags, category, status, download_count, created_at, \
         updated_at FROM artifacts \
         WHERE namespace = $1 AND artifact_type = 'chart' AND status <> 'archived' ORDER BY name",
    )
    .bind(&namespace)
    .fetch_all(&pool)
    .await?;

    let mut entries: std::collections::BTreeMap<String, Vec<HelmEntry>> =
        std::collections::BTreeMap::new();
    for chart in &charts {
        let versions = downloadable_versions(&pool, chart.id).await?;
        let chart_entries: Vec<HelmEntry> = versions
            .iter()
            .map(|version| HelmEntry {
                name: chart.name.clone(),
                version: version.version.clone(),
                created: version.created_at.to_rfc3339(),
                urls: version
                    .storage_ref
                    .as_ref()
                    .map(|url| vec![url.clone()])
                    .unwrap_or_default(),
            })
            .collect();
        if !chart_entries.is_empty() {
            entries.insert(chart.name.clone(), chart_entries);
        }
    }

    let index = serde_yaml::to_string(&serde_json::json!({
        "apiVersion": "v1",
        "entries": entries.iter().map(|(name, list)| {
            (name.clone(), serde_json::to_value(list).unwrap_or(Value::Null))
        }).collect::<std::collections::BTreeMap<_, _>>(),
    }))
    .map_err(|e| AppError::Message(format!("index render failed: {}", e)))?;

    let etag = format!("\"{}\"", hex::encode(Sha256::digest(index.as_bytes())));
    if request_headers
        .get(axum::http::header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        == Some(etag.as_str())
    {
        return Ok(StatusCode::NOT_MODIFIED.into_response());
    }

    let mut headers = HeaderMap::new();
    headers.insert(
        axum::http::header::ETAG,
        etag.parse()
            .map_err(|_| AppError::Message("Invalid ETag".into()))?,
    );
    headers.insert(
        axum::http::header::CONTENT_TYPE,
        "application/x-yaml"
            .parse()
            .map_err(|_| AppError::Message("Invalid content type".into()))?,
    );
    Ok((StatusCode::OK, headers, index).into_response())
}

async fn oci_root() -> (StatusCode, HeaderMap, Json<Value>) {
    let mut headers = HeaderMap::new();
    if let Ok(value) = "registry/2.0".parse() {
        headers.insert("docker-distribution-api-version", value);
    }
    (StatusCode::OK, headers, Json(json!({})))
}
