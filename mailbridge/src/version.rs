//! Version information for mailbridge.

/// Mailbridge version from Cargo.toml
pub const MAILBRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Revision of the frame vocabulary. Bumped on incompatible message changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Version information reported by the `status` command.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub mailbridge: &'static str,
    pub protocol: u32,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            mailbridge: MAILBRIDGE_VERSION,
            protocol: PROTOCOL_VERSION,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_info_has_crate_version() {
        let info = VersionInfo::new();
        assert_eq!(info.mailbridge, MAILBRIDGE_VERSION);
        assert_eq!(info.protocol, PROTOCOL_VERSION);
    }

    #[test]
    fn version_info_serializes() {
        let info = VersionInfo {
            mailbridge: "0.1.0",
            protocol: 1,
        };
        insta::assert_json_snapshot!(info, @r#"
        {
          "mailbridge": "0.1.0",
          "protocol": 1
        }
        "#);
    }
}
