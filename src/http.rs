// src/http.rs
//! CRUD interface on the origin's tree.
//!
//! | Method | Effect | Event |
//! |--------|--------|-------|
//! | `PUT /<path>` | create a directory (trailing `/` or no extension) or a file with the body | `Create` |
//! | `POST /<path>` | replace a file's content with the body | `Update` |
//! | `DELETE /<path>` | remove a file, or a directory recursively | `Delete` |
//! | `GET /<path>` | file bytes (typed by extension), or a JSON list of files under a directory | none |
//!
//! Events are published only after the filesystem operation has completed.

use crate::error::MirrorError;
use crate::event::ChangeKind;
use crate::paths;
use crate::producer::{CrudProducer, Mutation};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Path as UrlPath, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch::Receiver as WatchReceiver;
use tracing::{error, info};

type HttpResult = std::result::Result<Response, (StatusCode, String)>;

/// Shared state for the CRUD handlers.
pub struct CrudState {
    root: PathBuf,
    producer: CrudProducer,
}

impl CrudState {
    pub fn new(root: impl AsRef<Path>, producer: CrudProducer) -> Result<Self> {
        let root = root.as_ref();
        let root = root
            .canonicalize()
            .with_context(|| format!("Cannot resolve CRUD root {}", root.display()))?;
        Ok(CrudState { root, producer })
    }

    /// Resolves a request path to `(absolute path, /a/b event path)`.
    fn resolve(&self, raw: &str) -> std::result::Result<(PathBuf, String), (StatusCode, String)> {
        let target = paths::resolve_within(&self.root, raw).map_err(|e| match e {
            MirrorError::EmptyPath => (
                StatusCode::METHOD_NOT_ALLOWED,
                "The root directory cannot be modified".to_string(),
            ),
            other => (StatusCode::BAD_REQUEST, other.to_string()),
        })?;
        let relative = paths::to_relative(&self.root, &target)
            .ok_or_else(|| (StatusCode::BAD_REQUEST, format!("Invalid path: {}", raw)))?;
        Ok((target, relative))
    }

    fn publish(&self, mutation: Mutation) {
        if let Err(e) = self.producer.notify(mutation) {
            error!("Failed to publish CRUD change: {}", e);
        }
    }
}

/// A request path names a directory if it ends in `/` or has no extension.
fn is_path_dir(raw: &str) -> bool {
    raw.ends_with('/') || Path::new(raw).extension().is_none()
}

fn internal(action: &str, path: &Path, e: std::io::Error) -> (StatusCode, String) {
    error!("{} failed for {}: {}", action, path.display(), e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("{} failed: {}", action, e),
    )
}

async fn list_root(State(state): State<Arc<CrudState>>) -> HttpResult {
    let root = state.root.clone();
    list_directory(&state, &root).await
}

async fn read_path(State(state): State<Arc<CrudState>>, UrlPath(raw): UrlPath<String>) -> HttpResult {
    let (target, _) = state.resolve(&raw)?;
    let meta = fs::metadata(&target)
        .await
        .map_err(|_| (StatusCode::NOT_FOUND, format!("GET 404: {} not found", raw)))?;
    if meta.is_dir() {
        info!("GET: directory list {}", target.display());
        list_directory(&state, &target).await
    } else {
        info!("GET: file {}", target.display());
        let bytes = fs::read(&target)
            .await
            .map_err(|e| internal("GET", &target, e))?;
        let mime = mime_guess::from_path(&target)
            .first_or_octet_stream()
            .to_string();
        Ok(([(header::CONTENT_TYPE, mime)], bytes).into_response())
    }
}

async fn list_directory(state: &CrudState, dir: &Path) -> HttpResult {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut entries = fs::read_dir(&current)
            .await
            .map_err(|e| internal("GET", &current, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| internal("GET", &current, e))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| internal("GET", &entry.path(), e))?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if let Some(relative) = paths::to_relative(&state.root, &entry.path()) {
                files.push(relative);
            }
        }
    }
    files.sort();
    Ok(Json(files).into_response())
}

async fn create_path(
    State(state): State<Arc<CrudState>>,
    UrlPath(raw): UrlPath<String>,
    body: Bytes,
) -> HttpResult {
    let (target, relative) = state.resolve(&raw)?;
    if fs::symlink_metadata(&target).await.is_ok() {
        error!("PUT 405: {} exists", target.display());
        return Err((
            StatusCode::METHOD_NOT_ALLOWED,
            "PUT 405: File/folder exists".to_string(),
        ));
    }

    let is_directory = is_path_dir(&raw);
    state
        .producer
        .announce(&relative, ChangeKind::Create, is_directory);
    if is_directory {
        fs::create_dir_all(&target)
            .await
            .map_err(|e| internal("PUT", &target, e))?;
        info!("PUT: Folder created {}", target.display());
    } else {
        if let Some(parent) = target.parent() {
            if !fs::metadata(parent).await.map(|m| m.is_dir()).unwrap_or(false) {
                return Err((
                    StatusCode::CONFLICT,
                    "PUT 409: Parent folder does not exist".to_string(),
                ));
            }
        }
        fs::write(&target, &body)
            .await
            .map_err(|e| internal("PUT", &target, e))?;
        info!("PUT: File created {} ({} bytes)", target.display(), body.len());
    }

    state.publish(Mutation {
        kind: ChangeKind::Create,
        path: relative,
        is_directory,
        body: (!is_directory).then(|| body.to_vec()),
    });
    Ok(StatusCode::OK.into_response())
}

async fn update_path(
    State(state): State<Arc<CrudState>>,
    UrlPath(raw): UrlPath<String>,
    body: Bytes,
) -> HttpResult {
    let (target, relative) = state.resolve(&raw)?;
    let is_file = fs::metadata(&target)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false);
    if !is_file {
        error!("POST 405: {} doesn't exist or is a folder", target.display());
        return Err((
            StatusCode::METHOD_NOT_ALLOWED,
            "POST 405: File doesn't exist or it's a folder".to_string(),
        ));
    }

    state.producer.announce(&relative, ChangeKind::Update, false);
    let mut file = fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(&target)
        .await
        .map_err(|e| internal("POST", &target, e))?;
    file.write_all(&body)
        .await
        .map_err(|e| internal("POST", &target, e))?;
    file.flush()
        .await
        .map_err(|e| internal("POST", &target, e))?;
    info!("POST: File updated {} ({} bytes)", target.display(), body.len());

    state.publish(Mutation {
        kind: ChangeKind::Update,
        path: relative,
        is_directory: false,
        body: Some(body.to_vec()),
    });
    Ok(StatusCode::OK.into_response())
}

async fn delete_path(State(state): State<Arc<CrudState>>, UrlPath(raw): UrlPath<String>) -> HttpResult {
    let (target, relative) = state.resolve(&raw)?;
    let meta = fs::symlink_metadata(&target).await.map_err(|_| {
        error!("DELETE 400: Invalid path {}", target.display());
        (
            StatusCode::BAD_REQUEST,
            "DELETE 400: Invalid path".to_string(),
        )
    })?;

    let is_directory = meta.is_dir();
    state
        .producer
        .announce(&relative, ChangeKind::Delete, is_directory);
    if is_directory {
        fs::remove_dir_all(&target)
            .await
            .map_err(|e| internal("DELETE", &target, e))?;
        info!("DELETE: Folder deleted {}", target.display());
    } else {
        fs::remove_file(&target)
            .await
            .map_err(|e| internal("DELETE", &target, e))?;
        info!("DELETE: File deleted {}", target.display());
    }

    state.publish(Mutation {
        kind: ChangeKind::Delete,
        path: relative,
        is_directory,
        body: None,
    });
    Ok(StatusCode::OK.into_response())
}

/// Builds the CRUD router.
pub fn router(state: CrudState) -> Router {
    Router::new()
        .route("/", get(list_root))
        .route(
            "/*path",
            get(read_path)
                .put(create_path)
                .post(update_path)
                .delete(delete_path),
        )
        .with_state(Arc::new(state))
}

/// Serves the CRUD interface until the shutdown signal fires.
pub async fn start_server(
    http_addr: &str,
    state: CrudState,
    shutdown_signal: WatchReceiver<bool>,
) -> Result<()> {
    let socket_addr: SocketAddr = http_addr
        .parse()
        .with_context(|| format!("Invalid HTTP address: {}", http_addr))?;
    let app = router(state);

    info!("CRUD server starting on http://{}", socket_addr);

    let mut shutdown = shutdown_signal.clone();
    axum::serve(tokio::net::TcpListener::bind(socket_addr).await?, app)
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
            info!("CRUD server shutting down gracefully.");
        })
        .await?;

    info!("CRUD server stopped.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_detection_follows_extension() {
        assert!(is_path_dir("notes/"));
        assert!(is_path_dir("notes"));
        assert!(!is_path_dir("notes/todo.txt"));
        assert!(is_path_dir("archive.d/"));
    }
}
