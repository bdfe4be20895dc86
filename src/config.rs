//! Server configuration. Reading a TOML config file is the CLI
//! wrapper's job (out of scope); this module only defines the shape
//! that wrapper deserializes into and the defaults used absent a file.

use serde::Deserialize;

fn default_port() -> u16 {
    5468
}

fn default_dir_level() -> usize {
    2
}

fn default_connection_timeout_secs() -> u64 {
    120
}

fn default_connection_memory_limit() -> usize {
    131_070
}

fn default_post_buffer_fallback_bytes() -> usize {
    64 * 1024
}

fn default_meta_queue_capacity() -> usize {
    256
}

fn default_data_queue_capacity() -> usize {
    256
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FileBackendConfig {
    pub file_directory: String,
    pub dir_level: usize,
}

impl Default for FileBackendConfig {
    fn default() -> Self {
        FileBackendConfig {
            file_directory: "/var/lib/cdpfglserver".to_string(),
            dir_level: default_dir_level(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ServerConfig {
    pub port: u16,
    pub connection_timeout_secs: u64,
    pub connection_memory_limit: usize,
    /// Buffer size used for a POST body when the request carries no
    /// `Content-Length` header (chunked transfer encoding isn't
    /// supported, so this is the only way to size the single
    /// allocation §4.6 mandates in that case).
    pub post_buffer_fallback_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: default_port(),
            connection_timeout_secs: default_connection_timeout_secs(),
            connection_memory_limit: default_connection_memory_limit(),
            post_buffer_fallback_bytes: default_post_buffer_fallback_bytes(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct QueueConfig {
    pub meta_capacity: usize,
    pub data_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            meta_capacity: default_meta_queue_capacity(),
            data_capacity: default_data_queue_capacity(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(rename = "file_backend")]
    pub file_backend: FileBackendConfig,
    pub server: ServerConfig,
    pub queue: QueueConfig,
}

impl Config {
    /// Parses a TOML document into a `Config`, falling back to field
    /// defaults for anything the document omits.
    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = Config::default();
        assert_eq!(config.file_backend.dir_level, 2);
        assert_eq!(config.server.port, 5468);
        assert_eq!(config.server.connection_timeout_secs, 120);
        assert_eq!(config.server.connection_memory_limit, 131_070);
        assert_eq!(config.server.post_buffer_fallback_bytes, 64 * 1024);
    }

    #[test]
    fn partial_toml_keeps_unspecified_defaults() {
        let toml = r#"
            [file_backend]
            file-directory = "/data/backups"
        "#;
        let config = Config::from_toml_str(toml).unwrap();
        assert_eq!(config.file_backend.file_directory, "/data/backups");
        assert_eq!(config.file_backend.dir_level, 2);
        assert_eq!(config.server.port, 5468);
    }
}
