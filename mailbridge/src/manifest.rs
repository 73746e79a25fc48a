//! Native messaging host manifest: the JSON file that tells the mail client
//! which executable to launch for the host name.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::HOST_NAME;

pub const DEFAULT_EXTENSION_ID: &str = "email-automation@local";

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("no manifest directory known for this platform")]
    UnsupportedPlatform,

    #[error("manifest I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize manifest: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeHostManifest {
    pub name: String,
    pub description: String,
    pub path: PathBuf,
    #[serde(rename = "type")]
    pub kind: String,
    pub allowed_extensions: Vec<String>,
}

impl NativeHostManifest {
    pub fn new(host_path: impl Into<PathBuf>, extension_id: impl Into<String>) -> Self {
        Self {
            name: HOST_NAME.to_string(),
            description: "Email automation bridge".to_string(),
            path: host_path.into(),
            kind: "stdio".to_string(),
            allowed_extensions: vec![extension_id.into()],
        }
    }
}

/// What `check` found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestStatus {
    Installed(NativeHostManifest),
    Missing,
    /// Present but unparseable or missing required keys.
    Invalid(String),
    /// Valid, but the executable it names does not exist.
    HostMissing(NativeHostManifest),
}

/// Where the mail client looks for host manifests on this platform.
pub fn manifest_dir() -> Option<PathBuf> {
    if cfg!(windows) {
        dirs::config_dir().map(|d| d.join("Thunderbird").join("NativeMessagingHosts"))
    } else if cfg!(target_os = "macos") {
        dirs::home_dir().map(|d| {
            d.join("Library")
                .join("Application Support")
                .join("Thunderbird")
                .join("NativeMessagingHosts")
        })
    } else {
        dirs::home_dir().map(|d| d.join(".thunderbird").join("native-messaging-hosts"))
    }
}

pub fn manifest_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.json"))
}

pub fn resolve_dir(dir: Option<PathBuf>) -> Result<PathBuf, ManifestError> {
    dir.or_else(manifest_dir)
        .ok_or(ManifestError::UnsupportedPlatform)
}

/// Write `manifest` into `dir`, replacing any previous version.
pub fn install(manifest: &NativeHostManifest, dir: &Path) -> Result<PathBuf, ManifestError> {
    fs::create_dir_all(dir).map_err(|source| ManifestError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let path = manifest_path(dir, &manifest.name);
    let json = serde_json::to_string_pretty(manifest)?;
    fs::write(&path, json).map_err(|source| ManifestError::Io {
        path: path.clone(),
        source,
    })?;

    tracing::info!(path = %path.display(), host = %manifest.path.display(), "Installed host manifest");
    Ok(path)
}

/// Remove the manifest for `name`. Returns whether one was there.
pub fn uninstall(name: &str, dir: &Path) -> Result<bool, ManifestError> {
    let path = manifest_path(dir, name);
    match fs::remove_file(&path) {
        Ok(()) => {
            tracing::info!(path = %path.display(), "Removed host manifest");
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(source) => Err(ManifestError::Io { path, source }),
    }
}

pub fn check(name: &str, dir: &Path) -> Result<ManifestStatus, ManifestError> {
    let path = manifest_path(dir, name);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ManifestStatus::Missing),
        Err(source) => return Err(ManifestError::Io { path, source }),
    };

    let manifest: NativeHostManifest = match serde_json::from_slice(&bytes) {
        Ok(manifest) => manifest,
        Err(e) => return Ok(ManifestStatus::Invalid(e.to_string())),
    };
    if manifest.kind != "stdio" {
        return Ok(ManifestStatus::Invalid(format!(
            "unsupported host type {:?}",
            manifest.kind
        )));
    }
    if manifest.path.exists() {
        Ok(ManifestStatus::Installed(manifest))
    } else {
        Ok(ManifestStatus::HostMissing(manifest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_shape() {
        let manifest = NativeHostManifest::new("/opt/mailbridge/mailbridge-host", "ext@example");
        insta::assert_json_snapshot!(manifest, @r#"
        {
          "name": "com.emailautomation.tbhost",
          "description": "Email automation bridge",
          "path": "/opt/mailbridge/mailbridge-host",
          "type": "stdio",
          "allowed_extensions": [
            "ext@example"
          ]
        }
        "#);
    }

    #[test]
    fn install_check_uninstall() {
        let dir = tempfile::tempdir().unwrap();
        let host = dir.path().join("mailbridge-host");
        fs::write(&host, b"").unwrap();
        let manifest = NativeHostManifest::new(&host, DEFAULT_EXTENSION_ID);

        let path = install(&manifest, &dir.path().join("hosts")).unwrap();
        assert_eq!(path.file_name().unwrap(), "com.emailautomation.tbhost.json");
        assert_eq!(
            check(HOST_NAME, &dir.path().join("hosts")).unwrap(),
            ManifestStatus::Installed(manifest)
        );

        assert!(uninstall(HOST_NAME, &dir.path().join("hosts")).unwrap());
        assert!(!uninstall(HOST_NAME, &dir.path().join("hosts")).unwrap());
        assert_eq!(
            check(HOST_NAME, &dir.path().join("hosts")).unwrap(),
            ManifestStatus::Missing
        );
    }

    #[test]
    fn check_flags_missing_keys_and_executable() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            manifest_path(dir.path(), HOST_NAME),
            br#"{"name": "com.emailautomation.tbhost", "type": "stdio"}"#,
        )
        .unwrap();
        assert!(matches!(
            check(HOST_NAME, dir.path()).unwrap(),
            ManifestStatus::Invalid(_)
        ));

        let manifest = NativeHostManifest::new(dir.path().join("gone"), DEFAULT_EXTENSION_ID);
        install(&manifest, dir.path()).unwrap();
        assert!(matches!(
            check(HOST_NAME, dir.path()).unwrap(),
            ManifestStatus::HostMissing(_)
        ));
    }
}
