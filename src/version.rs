use serde::{Deserialize, Serialize};

/// Build metadata reported by the `version` subcommand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    #[serde(rename = "gitVersion")]
    pub version: String,
    #[serde(rename = "gitCommit")]
    pub commit: String,
}

impl BuildInfo {
    /// Version from the package manifest, commit from `GIT_COMMIT` at build time.
    pub fn current() -> Self {
        Self {
            version: format!("v{}", env!("CARGO_PKG_VERSION")),
            commit: option_env!("GIT_COMMIT").unwrap_or("unknown").to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_field_names() {
        let info = BuildInfo {
            version: "v1.2.3".to_string(),
            commit: "abc123".to_string(),
        };
        assert_eq!(info.to_json(), r#"{"gitVersion":"v1.2.3","gitCommit":"abc123"}"#);
    }

    #[test]
    fn test_current_uses_package_version() {
        let info = BuildInfo::current();
        assert!(info.version.ends_with(env!("CARGO_PKG_VERSION")));
        assert!(!info.commit.is_empty());
    }
}
