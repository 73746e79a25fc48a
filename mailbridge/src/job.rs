//! Job and result descriptors exchanged through the queue directories.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const MAX_JOB_ID_LEN: usize = 128;

/// Identifier of a job. Doubles as the file stem in every queue directory,
/// so it is restricted to characters that are safe in a file name on every
/// platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid job id {id:?}: {reason}")]
pub struct InvalidJobId {
    pub id: String,
    pub reason: &'static str,
}

impl JobId {
    /// Fresh random id.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn parse(s: impl Into<String>) -> Result<Self, InvalidJobId> {
        let id = s.into();
        let reason = if id.is_empty() {
            Some("empty")
        } else if id.len() > MAX_JOB_ID_LEN {
            Some("longer than 128 characters")
        } else if id.starts_with('.') {
            Some("starts with '.'")
        } else if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            Some("only ASCII letters, digits, '-', '_' and '.' are allowed")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(InvalidJobId { id, reason }),
            None => Ok(Self(id)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `<id>.json`
    pub fn file_name(&self) -> String {
        format!("{}.json", self.0)
    }

    /// Recover an id from a queue file path (`.../<id>.json`).
    pub fn from_path(path: &Path) -> Option<Self> {
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if !is_json {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        Self::parse(stem).ok()
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for JobId {
    type Error = InvalidJobId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> Self {
        id.0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobKind {
    #[default]
    SendEmail,
}

/// Email the extension should compose and send.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailPayload {
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body_html: String,
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
}

impl EmailPayload {
    pub fn attachment_paths(&self) -> Vec<PathBuf> {
        self.attachments.iter().map(|a| a.path.clone()).collect()
    }
}

/// A local file to attach; the extension fetches the bytes via `getFileData`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl AttachmentRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Explicit name, or the file name of the path.
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            self.path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        })
    }
}

/// Producer-side bookkeeping. Never forwarded to the extension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
}

impl JobMeta {
    pub fn is_empty(&self) -> bool {
        self.created_at.is_none() && self.client.is_none()
    }
}

/// Contents of `jobs/<id>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub id: JobId,
    #[serde(rename = "type", default)]
    pub kind: JobKind,
    pub payload: EmailPayload,
    #[serde(default, skip_serializing_if = "JobMeta::is_empty")]
    pub meta: JobMeta,
}

impl JobDescriptor {
    pub fn send_email(payload: EmailPayload) -> Self {
        Self {
            id: JobId::new(),
            kind: JobKind::SendEmail,
            payload,
            meta: JobMeta {
                created_at: Some(Utc::now()),
                client: None,
            },
        }
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = id;
        self
    }

    pub fn with_client(mut self, client: impl Into<String>) -> Self {
        self.meta.client = Some(client.into());
        self
    }

    pub fn attachment_paths(&self) -> Vec<PathBuf> {
        self.payload.attachment_paths()
    }
}

/// Contents of `results/<id>.json`. Written once, never rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub id: JobId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobResult {
    pub fn succeeded(id: JobId) -> Self {
        Self {
            id,
            success: true,
            error: None,
        }
    }

    pub fn failed(id: JobId, error: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            error: Some(error.into()),
        }
    }
}
