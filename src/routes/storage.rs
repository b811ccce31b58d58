//! File-management endpoints.
//!
//! Operations are routed by the `{protocol}_` prefix of the session id:
//! ssh sessions act on the remote host through the live session's SFTP
//! channel, every other protocol acts on a sandboxed local folder under the
//! configured drive root. Every user-supplied path is checked for `..`
//! components before any filesystem or SFTP call.

use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::future::BoxFuture;
use russh_sftp::client::SftpSession;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::sessions::Session;
use crate::terminal::TerminalError;
use crate::AppState;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("illegal_request")]
    PathTraversal,
    #[error("session not found")]
    SessionNotFound,
    #[error("file operations are not available on this session")]
    Unsupported,
    #[error(transparent)]
    Terminal(#[from] TerminalError),
    #[error("sftp error: {0}")]
    Sftp(#[from] russh_sftp::client::error::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    BadRequest(String),
}

impl IntoResponse for StorageError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            StorageError::PathTraversal => (StatusCode::BAD_REQUEST, "illegal_request".to_owned()),
            StorageError::SessionNotFound => (StatusCode::NOT_FOUND, self.to_string()),
            StorageError::Unsupported | StorageError::BadRequest(_) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            StorageError::Terminal(_) | StorageError::Sftp(_) | StorageError::Io(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string())
            }
        };
        (status, Json(json!({"message": message}))).into_response()
    }
}

/// Reject any operand containing a `..` path segment. Runs before any
/// filesystem or SFTP access, so a traversal attempt mutates nothing.
fn guard(path: &str) -> Result<(), StorageError> {
    if path.split(['/', '\\']).any(|seg| seg == "..") {
        return Err(StorageError::PathTraversal);
    }
    Ok(())
}

/// Normalize edited text: CRLF to LF, with a guaranteed trailing newline.
fn normalize_text(content: &str) -> String {
    let mut text = content.replace("\r\n", "\n");
    if !text.ends_with('\n') {
        text.push('\n');
    }
    text
}

fn join_remote(dir: &str, name: &str) -> String {
    if dir.is_empty() || dir == "/" {
        format!("/{name}")
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}

enum FsBackend {
    Sftp(Arc<Session>),
    Local(PathBuf),
}

/// Pick the storage backend for a session id. ssh ids require a live
/// terminal session; everything else gets a per-session local folder.
async fn backend(state: &AppState, session_id: &str) -> Result<FsBackend, StorageError> {
    guard(session_id)?;
    if session_id.split('_').next() == Some("ssh") {
        let session = state
            .registry
            .get(session_id)
            .await
            .ok_or(StorageError::SessionNotFound)?;
        if session.terminal().is_none() {
            return Err(StorageError::Unsupported);
        }
        Ok(FsBackend::Sftp(session))
    } else {
        let root = state.config.guacd.drive.join(session_id);
        tokio::fs::create_dir_all(&root).await?;
        Ok(FsBackend::Local(root))
    }
}

async fn sftp_of(session: &Session) -> Result<&SftpSession, StorageError> {
    let terminal = session.terminal().ok_or(StorageError::Unsupported)?;
    Ok(terminal.sftp().await?)
}

/// Resolve a client path inside a local sandbox root.
fn local_path(root: &FsPath, rel: &str) -> PathBuf {
    root.join(rel.trim_start_matches(['/', '\\']))
}

#[derive(Debug, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    #[serde(rename = "isDir")]
    pub is_dir: bool,
    pub size: u64,
    #[serde(rename = "modTime")]
    pub mod_time: i64,
}

#[derive(Debug, Deserialize)]
pub struct DirRequest {
    pub dir: String,
}

#[derive(Debug, Deserialize)]
pub struct FileRequest {
    pub file: String,
}

#[derive(Debug, Deserialize)]
pub struct FileQuery {
    pub file: String,
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    #[serde(default)]
    pub dir: String,
}

#[derive(Debug, Deserialize)]
pub struct EditRequest {
    pub file: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    #[serde(rename = "oldName")]
    pub old_name: String,
    #[serde(rename = "newName")]
    pub new_name: String,
}

/// `POST /quick/{id}/ls`
pub async fn ls(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<DirRequest>,
) -> Result<Json<Vec<FileEntry>>, StorageError> {
    guard(&req.dir)?;
    let entries = match backend(&state, &session_id).await? {
        FsBackend::Sftp(session) => {
            let sftp = sftp_of(&session).await?;
            let mut out = Vec::new();
            for entry in sftp.read_dir(&req.dir).await? {
                let name = entry.file_name();
                let meta = entry.metadata();
                out.push(FileEntry {
                    path: join_remote(&req.dir, &name),
                    is_dir: entry.file_type().is_dir(),
                    size: meta.size.unwrap_or(0),
                    mod_time: meta.mtime.map_or(0, i64::from),
                    name,
                });
            }
            out
        }
        FsBackend::Local(root) => {
            let dir = local_path(&root, &req.dir);
            let mut out = Vec::new();
            let mut read_dir = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = read_dir.next_entry().await? {
                let meta = entry.metadata().await?;
                let name = entry.file_name().to_string_lossy().into_owned();
                let mod_time = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map_or(0, |d| d.as_secs() as i64);
                out.push(FileEntry {
                    path: join_remote(&req.dir, &name),
                    is_dir: meta.is_dir(),
                    size: meta.len(),
                    mod_time,
                    name,
                });
            }
            out
        }
    };
    Ok(Json(entries))
}

/// `GET /quick/{id}/download?file=...`
pub async fn download(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<FileQuery>,
) -> Result<Response, StorageError> {
    guard(&query.file)?;
    let filename = query
        .file
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("download")
        .to_owned();

    let bytes = match backend(&state, &session_id).await? {
        FsBackend::Sftp(session) => {
            let sftp = sftp_of(&session).await?;
            let mut file = sftp.open(&query.file).await?;
            let mut bytes = Vec::new();
            file.read_to_end(&mut bytes).await?;
            bytes
        }
        FsBackend::Local(root) => tokio::fs::read(local_path(&root, &query.file)).await?,
    };

    let disposition = format!("attachment; filename=\"{filename}\"");
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_owned()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

/// `POST /quick/{id}/upload?dir=...` — multipart form, one part per file.
pub async fn upload(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<UploadQuery>,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>, StorageError> {
    guard(&query.dir)?;
    let target = backend(&state, &session_id).await?;
    let mut uploaded = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| StorageError::BadRequest(e.to_string()))?
    {
        let Some(filename) = field.file_name().map(ToOwned::to_owned) else {
            continue;
        };
        guard(&filename)?;
        let data = field
            .bytes()
            .await
            .map_err(|e| StorageError::BadRequest(e.to_string()))?;

        match &target {
            FsBackend::Sftp(session) => {
                let sftp = sftp_of(session).await?;
                let mut file = sftp.create(join_remote(&query.dir, &filename)).await?;
                file.write_all(&data).await?;
                file.shutdown().await?;
            }
            FsBackend::Local(root) => {
                let path = local_path(root, &query.dir).join(&filename);
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&path, &data).await?;
            }
        }
        uploaded.push(filename);
    }

    Ok(Json(json!({"uploaded": uploaded})))
}

/// `POST /quick/{id}/edit` — replace a text file's content.
pub async fn edit(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<EditRequest>,
) -> Result<Json<serde_json::Value>, StorageError> {
    guard(&req.file)?;
    match backend(&state, &session_id).await? {
        FsBackend::Sftp(session) => {
            let sftp = sftp_of(&session).await?;
            let text = normalize_text(&req.content);
            let mut file = sftp.create(&req.file).await?;
            file.write_all(text.as_bytes()).await?;
            file.shutdown().await?;
        }
        FsBackend::Local(root) => {
            tokio::fs::write(local_path(&root, &req.file), req.content.as_bytes()).await?;
        }
    }
    Ok(Json(json!({"ok": true})))
}

/// `POST /quick/{id}/mkdir`
pub async fn mkdir(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<DirRequest>,
) -> Result<Json<serde_json::Value>, StorageError> {
    guard(&req.dir)?;
    match backend(&state, &session_id).await? {
        FsBackend::Sftp(session) => {
            let sftp = sftp_of(&session).await?;
            sftp.create_dir(&req.dir).await?;
        }
        FsBackend::Local(root) => {
            tokio::fs::create_dir_all(local_path(&root, &req.dir)).await?;
        }
    }
    Ok(Json(json!({"ok": true})))
}

/// Recursive remote removal; SFTP has no single recursive delete.
fn remove_remote<'a>(
    sftp: &'a SftpSession,
    path: String,
    is_dir: bool,
) -> BoxFuture<'a, Result<(), StorageError>> {
    Box::pin(async move {
        if !is_dir {
            sftp.remove_file(&path).await?;
            return Ok(());
        }
        for entry in sftp.read_dir(&path).await? {
            let child = join_remote(&path, &entry.file_name());
            remove_remote(sftp, child, entry.file_type().is_dir()).await?;
        }
        sftp.remove_dir(&path).await?;
        Ok(())
    })
}

/// `POST /quick/{id}/rm`
pub async fn rm(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<FileRequest>,
) -> Result<Json<serde_json::Value>, StorageError> {
    guard(&req.file)?;
    match backend(&state, &session_id).await? {
        FsBackend::Sftp(session) => {
            let sftp = sftp_of(&session).await?;
            let is_dir = sftp.metadata(&req.file).await?.is_dir();
            remove_remote(sftp, req.file.clone(), is_dir).await?;
        }
        FsBackend::Local(root) => {
            let path = local_path(&root, &req.file);
            let meta = tokio::fs::metadata(&path).await?;
            if meta.is_dir() {
                tokio::fs::remove_dir_all(&path).await?;
            } else {
                tokio::fs::remove_file(&path).await?;
            }
        }
    }
    Ok(Json(json!({"ok": true})))
}

/// `POST /quick/{id}/rename`
pub async fn rename(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<RenameRequest>,
) -> Result<Json<serde_json::Value>, StorageError> {
    guard(&req.old_name)?;
    guard(&req.new_name)?;
    match backend(&state, &session_id).await? {
        FsBackend::Sftp(session) => {
            let sftp = sftp_of(&session).await?;
            sftp.rename(&req.old_name, &req.new_name).await?;
        }
        FsBackend::Local(root) => {
            tokio::fs::rename(
                local_path(&root, &req.old_name),
                local_path(&root, &req.new_name),
            )
            .await?;
        }
    }
    Ok(Json(json!({"ok": true})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::sessions::SessionRegistry;

    fn test_state() -> (AppState, PathBuf) {
        let dir = std::env::temp_dir().join(format!("qg-store-{}", uuid::Uuid::new_v4()));
        let mut config = Config::default();
        config.guacd.drive = dir.clone();
        let state = AppState {
            config: Arc::new(config),
            registry: SessionRegistry::new(),
            started_at: std::time::Instant::now(),
        };
        (state, dir)
    }

    #[test]
    fn guard_rejects_parent_segments() {
        assert!(guard("../etc/passwd").is_err());
        assert!(guard("a/../b").is_err());
        assert!(guard("a\\..\\b").is_err());
        assert!(guard("..").is_err());
        assert!(guard("/home/user/notes.txt").is_ok());
        // Dots inside a name are fine.
        assert!(guard("archive..tar").is_ok());
        assert!(guard(".hidden").is_ok());
    }

    #[test]
    fn normalize_text_fixes_line_endings() {
        assert_eq!(normalize_text("a\r\nb"), "a\nb\n");
        assert_eq!(normalize_text("a\n"), "a\n");
        assert_eq!(normalize_text(""), "\n");
    }

    #[test]
    fn remote_paths_join_cleanly() {
        assert_eq!(join_remote("/home/u", "f.txt"), "/home/u/f.txt");
        assert_eq!(join_remote("/home/u/", "f.txt"), "/home/u/f.txt");
        assert_eq!(join_remote("/", "f.txt"), "/f.txt");
        assert_eq!(join_remote("", "f.txt"), "/f.txt");
    }

    #[tokio::test]
    async fn traversal_is_rejected_before_any_fs_access() {
        let (state, dir) = test_state();
        let result = ls(
            State(state),
            Path("rdp_1".to_owned()),
            Json(DirRequest {
                dir: "../outside".to_owned(),
            }),
        )
        .await;
        assert!(matches!(result, Err(StorageError::PathTraversal)));
        // The sandbox root was never even created.
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn ssh_session_ids_require_a_live_session() {
        let (state, _dir) = test_state();
        let result = ls(
            State(state),
            Path("ssh_missing".to_owned()),
            Json(DirRequest { dir: "/".to_owned() }),
        )
        .await;
        assert!(matches!(result, Err(StorageError::SessionNotFound)));
    }

    #[tokio::test]
    async fn local_mkdir_ls_rename_rm_round_trip() {
        let (state, dir) = test_state();
        let id = "rdp_42".to_owned();

        mkdir(
            State(state.clone()),
            Path(id.clone()),
            Json(DirRequest {
                dir: "docs".to_owned(),
            }),
        )
        .await
        .unwrap();

        edit(
            State(state.clone()),
            Path(id.clone()),
            Json(EditRequest {
                file: "docs/readme.txt".to_owned(),
                content: "hi".to_owned(),
            }),
        )
        .await
        .unwrap();

        let listing = ls(
            State(state.clone()),
            Path(id.clone()),
            Json(DirRequest {
                dir: "docs".to_owned(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(listing.0.len(), 1);
        assert_eq!(listing.0[0].name, "readme.txt");
        assert!(!listing.0[0].is_dir);

        rename(
            State(state.clone()),
            Path(id.clone()),
            Json(RenameRequest {
                old_name: "docs/readme.txt".to_owned(),
                new_name: "docs/notes.txt".to_owned(),
            }),
        )
        .await
        .unwrap();
        assert!(dir.join(&id).join("docs/notes.txt").exists());

        rm(
            State(state.clone()),
            Path(id.clone()),
            Json(FileRequest {
                file: "docs".to_owned(),
            }),
        )
        .await
        .unwrap();
        assert!(!dir.join(&id).join("docs").exists());

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
