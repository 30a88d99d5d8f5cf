use cortex_lib::buffer::DEFAULT_BUFFER_CAP;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Daemon configuration, read from a TOML file and overridable through the
/// environment. Absence of the `[mesh]` section disables the TLS listener
/// and the replication driver entirely.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Hard cap on concurrently served connections. Accepted sockets past
    /// the cap are refused at the transport, never queued.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Close a connection that stays silent this long. `None` disables.
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
    /// Per-connection receive buffer cap in bytes.
    #[serde(default = "default_buffer_cap")]
    pub buffer_cap_bytes: usize,
    #[serde(default)]
    pub mesh: Option<MeshConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MeshConfig {
    pub node_name: String,
    pub tls_port: u16,
    pub ca_cert: PathBuf,
    pub node_cert: PathBuf,
    pub node_key: PathBuf,
    /// Honor the 5-element metadata frame on the TLS transport. Off by
    /// default; the Unix transport rejects metadata frames regardless.
    #[serde(default)]
    pub accept_frame_metadata: bool,
    #[serde(default)]
    pub nodes: Vec<MeshNode>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MeshNode {
    pub name: String,
    pub host: String,
    pub port: u16,
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/run/cortex/cortex.sock")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/cortex/data")
}

fn default_max_connections() -> usize {
    1000
}

fn default_buffer_cap() -> usize {
    DEFAULT_BUFFER_CAP
}

impl Default for Config {
    fn default() -> Self {
        Config {
            socket_path: default_socket_path(),
            data_dir: default_data_dir(),
            max_connections: default_max_connections(),
            idle_timeout_secs: None,
            buffer_cap_bytes: default_buffer_cap(),
            mesh: None,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let raw = std::fs::read_to_string(path)?;
        let config = toml::from_str(&raw)?;
        Ok(config)
    }

    /// Apply `CORTEX_SOCKET_PATH` and `CORTEX_DATA_DIR` overrides.
    pub fn apply_env(&mut self) {
        if let Ok(path) = std::env::var("CORTEX_SOCKET_PATH") {
            self.socket_path = PathBuf::from(path);
        }
        if let Ok(dir) = std::env::var("CORTEX_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
    }

    /// The name this node goes by in scopes and federated identity
    /// mappings: the mesh name when configured, the hostname otherwise.
    pub fn node_name(&self) -> String {
        if let Some(mesh) = &self.mesh {
            return mesh.node_name.clone();
        }
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "local".to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/run/cortex/cortex.sock"));
        assert_eq!(config.max_connections, 1000);
        assert!(config.mesh.is_none());
        assert!(config.idle_timeout_secs.is_none());
    }

    #[test]
    fn mesh_section_parses() {
        let config: Config = toml::from_str(
            r#"
            socket_path = "/tmp/cortex.sock"

            [mesh]
            node_name = "alpha"
            tls_port = 7443
            ca_cert = "/etc/cortex/ca.pem"
            node_cert = "/etc/cortex/node.pem"
            node_key = "/etc/cortex/node.key"

            [[mesh.nodes]]
            name = "beta"
            host = "10.0.0.2"
            port = 7443
            "#,
        )
        .unwrap();

        let mesh = config.mesh.as_ref().expect("mesh section");
        assert_eq!(mesh.node_name, "alpha");
        assert!(!mesh.accept_frame_metadata);
        assert_eq!(mesh.nodes.len(), 1);
        assert_eq!(config.node_name(), "alpha");
    }
}
