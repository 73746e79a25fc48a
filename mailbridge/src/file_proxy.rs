//! Local file reads on behalf of the extension, which cannot open paths
//! itself. Only files handed out as attachments of live jobs are served.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;

use crate::bridge::codec::MAX_FRAME_LEN;
use crate::bridge::protocol::FileDataResponse;

/// Largest file whose base64 encoding still fits in one frame, with room
/// for the surrounding fields.
pub const MAX_PROXY_FILE_BYTES: u64 = ((MAX_FRAME_LEN as u64 - 4096) / 4) * 3;

/// Whether `requested` is one of `granted`, comparing canonical paths when
/// both resolve.
pub fn is_granted<'a>(requested: &Path, granted: impl IntoIterator<Item = &'a PathBuf>) -> bool {
    let canonical = requested.canonicalize().ok();
    granted.into_iter().any(|path| {
        path == requested
            || canonical
                .as_ref()
                .is_some_and(|c| path.canonicalize().ok().as_ref() == Some(c))
    })
}

/// Build the reply to a `getFileData` request.
pub fn file_data_response(id: Option<Value>, file_path: &str, granted: bool) -> FileDataResponse {
    if file_path.is_empty() {
        return FileDataResponse::failure(id, "Missing filePath");
    }
    if !granted {
        tracing::warn!(path = %file_path, "Refusing file request outside active attachments");
        return FileDataResponse::failure(id, "Access denied: file is not attached to an active job");
    }

    let path = Path::new(file_path);
    match read_file(path) {
        Ok((data, size)) => {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let mime_type = mime_guess::from_path(path)
                .first_or_octet_stream()
                .essence_str()
                .to_string();
            tracing::debug!(path = %file_path, size, "Serving attachment");
            FileDataResponse::success(id, data, name, size, mime_type)
        }
        Err(reason) => {
            tracing::warn!(path = %file_path, reason = %reason, "File request failed");
            FileDataResponse::failure(id, reason)
        }
    }
}

fn read_file(path: &Path) -> Result<(String, u64), String> {
    let metadata = fs::metadata(path).map_err(describe)?;
    if !metadata.is_file() {
        return Err("Not a regular file".to_string());
    }
    if metadata.len() > MAX_PROXY_FILE_BYTES {
        return Err(format!(
            "File too large to transfer ({} bytes, limit {} bytes)",
            metadata.len(),
            MAX_PROXY_FILE_BYTES
        ));
    }

    let bytes = fs::read(path).map_err(describe)?;
    Ok((STANDARD.encode(&bytes), bytes.len() as u64))
}

fn describe(e: io::Error) -> String {
    match e.kind() {
        io::ErrorKind::NotFound => "File not found".to_string(),
        _ => e.to_string(),
    }
}
