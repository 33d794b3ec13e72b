//! HTTP request handlers.

use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use futures::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::errors::BalancerError;
use crate::slug::{decode_segment, decode_slug, hydrate_urls, split_extension};
use crate::streaming::{handler, m3u8};
use crate::web::AppState;

/// Health check in the shape monitoring tools expect.
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "sources": state.config.sources.len(),
        "active_streams": state.registry.active_count().await,
    }))
}

/// `GET /playlist.m3u`: the most recent successfully compiled artifact, or
/// a bare header when none exists yet.
pub async fn serve_playlist(State(state): State<AppState>) -> Response {
    let body = match state.processor.result_path() {
        Some(path) => match tokio::fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) => {
                warn!("Failed to read playlist {}: {}", path.display(), e);
                b"#EXTM3U\n".to_vec()
            }
        },
        None => b"#EXTM3U\n".to_vec(),
    };
    (
        [(header::CONTENT_TYPE, "audio/x-mpegurl")],
        body,
    )
        .into_response()
}

/// `GET /stream/<slug>[.ext]`
pub async fn serve_stream(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    stream_response(state, slug, method, headers).await
}

/// `GET /p/<subpath>/<slug>[.ext]`: the form emitted into the merged
/// playlist; the subpath only exists for player heuristics.
pub async fn serve_stream_subpath(
    State(state): State<AppState>,
    Path((_subpath, slug)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    stream_response(state, slug, method, headers).await
}

async fn stream_response(
    state: AppState,
    slug_segment: String,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let (slug, _ext) = split_extension(&slug_segment);

    let mut info = match decode_slug(slug) {
        Ok(info) => info,
        Err(e) => {
            debug!("Rejecting undecodable stream slug: {}", e);
            return StatusCode::NOT_FOUND.into_response();
        }
    };
    hydrate_urls(&mut info, &state.config.streams_dir());
    if !info.has_urls() {
        return StatusCode::NOT_FOUND.into_response();
    }

    let base_url = effective_base_url(&state.config, &headers);
    let coordinator = state.registry.get_or_create(slug).await;
    let (cursor, first) = coordinator.register_client();

    if first {
        let cancel = CancellationToken::new();
        let result = state
            .balancer
            .balance(to_reqwest_method(&method), &info, &cancel)
            .await;
        match result {
            Ok(result) => {
                let content_type = result
                    .response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok());
                if m3u8::is_manifest(content_type, &result.url) {
                    // Manifests are rewritten and answered directly; no
                    // coordinator is needed for them. Any reader that raced
                    // in behind us gets the terminal and retries.
                    coordinator.abort(
                        crate::errors::StreamStatus::ClientClosed,
                        "upstream is a manifest",
                    );
                    coordinator.unregister_client();
                    state.registry.remove_if_idle(slug).await;
                    return match m3u8::rewrite_manifest(result, &base_url).await {
                        Ok(manifest) => (
                            [(header::CONTENT_TYPE, manifest.content_type)],
                            manifest.body,
                        )
                            .into_response(),
                        Err(e) => {
                            warn!("Manifest rewrite failed for '{}': {}", info.title, e);
                            StatusCode::BAD_GATEWAY.into_response()
                        }
                    };
                }
                coordinator.clone().start_writer(
                    result,
                    Duration::from_secs(state.config.streaming.stream_timeout_secs),
                );
            }
            Err(e) => {
                coordinator.abort(
                    crate::errors::StreamStatus::UpstreamError,
                    "no upstream available",
                );
                coordinator.unregister_client();
                state.registry.remove_if_idle(slug).await;
                warn!("Balancing failed for '{}': {}", info.title, e);
                return balancer_error_response(e);
            }
        }
    }

    let content_type = coordinator.content_type().to_string();
    let (tx, rx) = mpsc::channel::<Result<bytes::Bytes, std::io::Error>>(64);
    let registry = state.registry.clone();
    let relay_coordinator = coordinator.clone();
    let relay_slug = slug.to_string();
    tokio::spawn(async move {
        handler::relay_to_client(
            &registry,
            relay_coordinator,
            &relay_slug,
            cursor,
            tx,
            CancellationToken::new(),
        )
        .await;
    });

    let stream =
        futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|i| (i, rx)) });
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// `GET /segment/<slug>[.ext]`: short-lived direct proxy of one rewritten
/// manifest segment, pinned to the source the manifest came from.
pub async fn serve_segment(
    State(state): State<AppState>,
    Path(slug_segment): Path<String>,
    method: Method,
) -> Response {
    let (slug, _ext) = split_extension(&slug_segment);

    let segment = match decode_segment(slug) {
        Ok(segment) => segment,
        Err(e) => {
            debug!("Rejecting undecodable segment slug: {}", e);
            return StatusCode::NOT_FOUND.into_response();
        }
    };
    let Some((source_id, sub_index)) = segment.source_parts() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let cancel = CancellationToken::new();
    let result = match state
        .balancer
        .balance_pinned(
            to_reqwest_method(&method),
            &segment.url,
            source_id,
            sub_index,
            &cancel,
        )
        .await
    {
        Ok(result) => result,
        Err(e) => return balancer_error_response(e),
    };

    let content_type = result
        .response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    let guard = result.guard;
    let stream = result.response.bytes_stream().map(move |chunk| {
        let _held = &guard; // slot stays occupied until the body finishes
        chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// `GET /a/<base64url>`: transparent logo pass-through.
pub async fn serve_logo(
    State(state): State<AppState>,
    Path(encoded): Path<String>,
) -> Response {
    let Some(decoded) = crate::utils::decode_component(&encoded) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Ok(url) = String::from_utf8(decoded) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let valid = url::Url::parse(&url)
        .map(|u| u.scheme() == "http" || u.scheme() == "https")
        .unwrap_or(false);
    if !valid {
        return StatusCode::NOT_FOUND.into_response();
    }

    let response = match state.client.get(&url).send().await {
        Ok(response) if response.status() == reqwest::StatusCode::OK => response,
        Ok(response) => {
            debug!("Logo upstream answered {}", response.status());
            return StatusCode::BAD_GATEWAY.into_response();
        }
        Err(e) => {
            debug!("Logo fetch failed: {}", e);
            return StatusCode::BAD_GATEWAY.into_response();
        }
    };

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("image/png")
        .to_string();
    let stream = response
        .bytes_stream()
        .map(|chunk| chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Compose the outbound base URL: the configured `BASE_URL`, or the incoming
/// request's scheme and host.
fn effective_base_url(config: &Config, headers: &HeaderMap) -> String {
    if let Some(base) = &config.web.base_url {
        return base.clone();
    }
    let proto = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|h| h.to_string())
        .unwrap_or_else(|| format!("{}:{}", config.web.host, config.web.port));
    format!("{}://{}", proto, host)
}

fn to_reqwest_method(method: &Method) -> reqwest::Method {
    reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::GET)
}

fn balancer_error_response(error: BalancerError) -> Response {
    match error {
        BalancerError::NoUrls { .. } => StatusCode::NOT_FOUND.into_response(),
        BalancerError::AllExhausted { .. } => StatusCode::BAD_GATEWAY.into_response(),
        BalancerError::Cancelled => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_prefers_configuration() {
        let mut config = Config::from_vars(vec![(
            "M3U_URL_1".to_string(),
            "file:///unused".to_string(),
        )])
        .unwrap();
        config.web.base_url = Some("https://proxy.example".to_string());

        let headers = HeaderMap::new();
        assert_eq!(effective_base_url(&config, &headers), "https://proxy.example");
    }

    #[test]
    fn base_url_derives_from_request_headers() {
        let config = Config::from_vars(vec![(
            "M3U_URL_1".to_string(),
            "file:///unused".to_string(),
        )])
        .unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "tv.example:9000".parse().unwrap());
        headers.insert("x-forwarded-proto", "https".parse().unwrap());
        assert_eq!(
            effective_base_url(&config, &headers),
            "https://tv.example:9000"
        );

        let empty = HeaderMap::new();
        assert_eq!(effective_base_url(&config, &empty), "http://0.0.0.0:8080");
    }
}
