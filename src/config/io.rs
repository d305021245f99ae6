//! Loading and saving MCP settings files.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::data::McpSettings;

/// Errors that can occur when loading settings from disk.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the settings file from disk.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to parse the settings file as valid TOML.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// Failed to serialize or write the settings file.
    Write {
        path: PathBuf,
        message: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "Unable to read {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "Unable to parse {}: {}", path.display(), source)
            }
            ConfigError::Write { path, message } => {
                write!(f, "Unable to write {}: {}", path.display(), message)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Write { .. } => None,
        }
    }
}

impl McpSettings {
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save_to_path(&self, path: &Path) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self).map_err(|err| ConfigError::Write {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        let mut file = fs::File::create(path).map_err(|err| ConfigError::Write {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        file.write_all(contents.as_bytes())
            .map_err(|err| ConfigError::Write {
                path: path.to_path_buf(),
                message: err.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tempfile::TempDir;

    use crate::config::data::{Capability, McpServerConfig, McpSettings};
    use crate::config::io::ConfigError;

    #[test]
    fn settings_round_trip_preserves_stdio_server() {
        let temp_dir = TempDir::new().expect("temp dir");
        let path = temp_dir.path().join("servers.toml");

        let mut env = HashMap::new();
        env.insert("MCP_TOKEN".to_string(), "local-dev".to_string());

        let settings = McpSettings {
            mcp_servers: vec![McpServerConfig {
                id: "fs1".to_string(),
                display_name: "Filesystem".to_string(),
                transport: Some("stdio".to_string()),
                command: Some("mcp-server".to_string()),
                args: Some(vec!["--mode".to_string(), "stdio".to_string()]),
                env: Some(env),
                base_url: None,
                protocol_version: None,
                enabled: Some(true),
                capabilities: vec![Capability {
                    name: "ping".to_string(),
                    description: "test".to_string(),
                }],
            }],
        };

        settings.save_to_path(&path).expect("save should succeed");
        let loaded = McpSettings::load_from_path(&path).expect("load should succeed");

        assert_eq!(loaded.mcp_servers.len(), 1);
        let server = &loaded.mcp_servers[0];
        assert_eq!(server.id, "fs1");
        assert_eq!(server.command.as_deref(), Some("mcp-server"));
        assert_eq!(server.capabilities.len(), 1);
        assert_eq!(server.capabilities[0].name, "ping");
        assert_eq!(
            server.env.as_ref().and_then(|env| env.get("MCP_TOKEN")).map(String::as_str),
            Some("local-dev")
        );
    }

    #[test]
    fn load_missing_file_reports_read_error() {
        let temp_dir = TempDir::new().expect("temp dir");
        let path = temp_dir.path().join("missing.toml");
        let err = McpSettings::load_from_path(&path).expect_err("expected read error");
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn load_invalid_toml_reports_parse_error() {
        let temp_dir = TempDir::new().expect("temp dir");
        let path = temp_dir.path().join("broken.toml");
        std::fs::write(&path, "mcp_servers = not-a-list").expect("write fixture");
        let err = McpSettings::load_from_path(&path).expect_err("expected parse error");
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
