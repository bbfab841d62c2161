//! The asset-serving and module-RPC HTTP surface (spec C6), matching
//! `original_source/runtime/server.py` route-for-route. Adapted from the
//! teacher's `dispatcher.rs`/`handlers.rs` pattern: a small state value
//! built once at daemon start, and a router function consulted per request
//! rather than a full routing table, since the route set here is fixed and
//! small (unlike WAGI's user-declared routes).

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hyper::{Body, Method, Request, Response, StatusCode};
use serde_json::json;

use crate::bridge;
use crate::bridge::client::{RpcRequest, RpcResponse};
use crate::config::Config;

pub struct ServerState {
    pub config: Arc<Config>,
}

/// Top-level router, installed as the `hyper` service body (spec §4.6).
pub async fn route(state: Arc<ServerState>, req: Request<Body>, remote_addr: SocketAddr) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    tracing::debug!(%remote_addr, %method, %path, "incoming request");

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/event") => cyclops_event(),
        (&Method::POST, p) if p.starts_with("/module/") && p.ends_with('/') => handle_module_rpc(&state, p, req).await,
        (&Method::GET, p) if p == "/api/modules" || p.starts_with("/api/modules/") => {
            list_assets(&state.config.modules_dir(), p.strip_prefix("/api/modules").unwrap_or(""))
        }
        (&Method::GET, p) if p == "/api/runtime" || p.starts_with("/api/runtime/") => {
            list_assets(&state.config.runtime_dir(), p.strip_prefix("/api/runtime").unwrap_or(""))
        }
        (&Method::GET, p) if p.starts_with("/assets/modules/") => {
            serve_asset(&state.config.modules_dir(), p.strip_prefix("/assets/modules/").unwrap_or(""))
        }
        (&Method::GET, p) if p.starts_with("/assets/runtime/") => {
            serve_asset(&state.config.runtime_dir(), p.strip_prefix("/assets/runtime/").unwrap_or(""))
        }
        (&Method::GET, "/assets/kiwi/") => serve_self_binary(),
        _ => crate::http_util::not_found(),
    };

    Ok(response)
}

fn cyclops_event() -> Response<Body> {
    json_response(StatusCode::OK, &json!({ "status": "ok" }))
}

async fn handle_module_rpc(state: &Arc<ServerState>, path: &str, req: Request<Body>) -> Response<Body> {
    let name = match path.strip_prefix("/module/").and_then(|rest| rest.strip_suffix('/')) {
        Some(n) if !n.is_empty() => n.to_owned(),
        _ => return crate::http_util::not_found(),
    };

    let body_bytes = match hyper::body::to_bytes(req.into_body()).await {
        Ok(b) => b,
        Err(e) => return crate::http_util::internal_error(e),
    };

    let request: RpcRequest = match serde_json::from_slice(&body_bytes) {
        Ok(r) => r,
        Err(e) => return crate::http_util::internal_error(format!("malformed RPC envelope: {}", e)),
    };

    let request_id = bridge::generate_request_id();
    tracing::info!(reqid = %request_id, module = %name, "received");

    let ingress = match bridge::ingress::Ingress::prepare(request_id.clone()) {
        Ok(i) => i,
        Err(e) => return crate::http_util::internal_error(e),
    };

    tracing::info!(reqid = %request_id, "preparing");

    let config = state.config.clone();
    let module_name = name.clone();
    tracing::info!(reqid = %request_id, "running");
    let response = ingress
        .handle(&request, move |bytes| crate::loader::run_server(&config, &module_name, bytes))
        .await;

    tracing::info!(reqid = %request_id, "finalizing");
    ingress.finalize();

    match response {
        Ok(rpc_response) => {
            tracing::info!(reqid = %request_id, "serializing");
            rpc_response_to_http(rpc_response)
        }
        Err(e) => crate::http_util::internal_error(e),
    }
}

fn rpc_response_to_http(resp: RpcResponse) -> Response<Body> {
    let status = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);
    for (k, v) in &resp.headers {
        builder = builder.header(k.as_str(), v.as_str());
    }
    builder.body(Body::from(resp.body)).unwrap_or_else(|e| crate::http_util::internal_error(e))
}

/// `GET /api/{modules,runtime}/[<path>]` — JSON directory/file listing
/// (spec §4.6).
fn list_assets(root: &Path, subpath: &str) -> Response<Body> {
    let target = match safe_join(root, subpath) {
        Some(p) => p,
        None => return crate::http_util::not_found(),
    };

    if target.is_dir() {
        let mut entries = Vec::new();
        let dir = match std::fs::read_dir(&target) {
            Ok(d) => d,
            Err(_) => return crate::http_util::not_found(),
        };
        for entry in dir.flatten() {
            let kind = if entry.path().is_dir() { "dir" } else { "file" };
            entries.push(json!({ "name": entry.file_name().to_string_lossy(), "type": kind }));
        }
        json_response(StatusCode::OK, &json!(entries))
    } else if target.is_file() {
        let name = target.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        json_response(StatusCode::OK, &json!({ "name": name, "type": "file" }))
    } else {
        crate::http_util::not_found()
    }
}

/// `GET /assets/{modules,runtime}/<path>` — raw file bytes, traversal
/// rejected (spec §4.6).
fn serve_asset(root: &Path, subpath: &str) -> Response<Body> {
    let target = match safe_join(root, subpath) {
        Some(p) if p.is_file() => p,
        _ => return crate::http_util::not_found(),
    };

    match std::fs::read(&target) {
        Ok(bytes) => Response::new(Body::from(bytes)),
        Err(e) => crate::http_util::internal_error(e),
    }
}

/// `GET /assets/kiwi/` — the running binary itself, the self-update target.
fn serve_self_binary() -> Response<Body> {
    let path = match std::env::current_exe() {
        Ok(p) => p,
        Err(e) => return crate::http_util::internal_error(e),
    };
    match std::fs::read(&path) {
        Ok(bytes) => Response::new(Body::from(bytes)),
        Err(e) => crate::http_util::internal_error(e),
    }
}

/// Joins `root` with `subpath`, rejecting any `..` component and any result
/// that escapes `root` once canonicalized (spec §4.6 "path traversal
/// rejected").
fn safe_join(root: &Path, subpath: &str) -> Option<PathBuf> {
    if subpath.split('/').any(|seg| seg == "..") {
        return None;
    }
    let candidate = root.join(subpath.trim_start_matches('/'));
    let root_canon = root.canonicalize().ok()?;
    if !candidate.exists() {
        return if candidate.starts_with(&root_canon) { Some(candidate) } else { None };
    }
    let candidate_canon = candidate.canonicalize().ok()?;
    if candidate_canon.starts_with(&root_canon) {
        Some(candidate_canon)
    } else {
        None
    }
}

fn json_response(status: StatusCode, value: &serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(value.to_string()))
        .unwrap_or_else(|e| crate::http_util::internal_error(e))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn safe_join_rejects_dotdot_traversal() {
        let dir = tempfile::tempdir().unwrap();
        assert!(safe_join(dir.path(), "../escape").is_none());
        assert!(safe_join(dir.path(), "a/../../escape").is_none());
    }

    #[test]
    fn safe_join_allows_plain_relative_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("file.txt"), b"hi").unwrap();
        let joined = safe_join(dir.path(), "file.txt").unwrap();
        assert!(joined.ends_with("file.txt"));
    }

    #[test]
    fn cyclops_event_reports_ok() {
        let response = cyclops_event();
        assert_eq!(StatusCode::OK, response.status());
    }
}
