use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use beach_post_core::{ClusterConfig, FanoutMode, SessionConfig};
use clap::Parser;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_POLL_TIMEOUT_SECS: u64 = 20;

#[derive(Debug, Parser)]
#[command(
    name = "beach-post",
    author,
    version,
    about = "Beach Post long-poll relay node"
)]
pub struct Cli {
    /// Optional config file (INI, TOML or JSON, picked by extension).
    #[arg(long, env = "BEACH_POST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Port to serve clients and peers on.
    #[arg(long, env = "BEACH_POST_PORT")]
    pub port: Option<u16>,

    /// Interface to bind.
    #[arg(long, env = "BEACH_POST_BIND_HOST")]
    pub bind_host: Option<IpAddr>,

    /// `host:port` of a node to join through.
    #[arg(long, env = "BEACH_POST_SEED")]
    pub seed: Option<String>,

    /// Cluster-unique id of this node. A random one is generated if unset.
    #[arg(long, env = "BEACH_POST_MACHINE_ID")]
    pub machine_id: Option<String>,

    /// How long `/receive` waits for a message.
    #[arg(long, env = "BEACH_POST_POLL_TIMEOUT_SECS")]
    pub poll_timeout_secs: Option<u64>,

    /// `parallel` or `sequential` forwarding to peers.
    #[arg(long, env = "BEACH_POST_FANOUT")]
    pub fanout: Option<FanoutMode>,

    /// Export tracing spans to stdout through OpenTelemetry.
    #[arg(long, env = "BEACH_POST_OTEL_STDOUT", default_value_t = false)]
    pub otel_stdout: bool,
}

/// Shape of the optional config file. Mirrors the classic `config.ini`:
///
/// ```ini
/// [core]
/// port = 8080
///
/// [cluster]
/// remote-address = 10.0.0.2:8080
/// machineId = node-a
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub core: CoreSection,
    #[serde(default)]
    pub cluster: ClusterSection,
}

#[derive(Debug, Default, Deserialize)]
pub struct CoreSection {
    pub port: Option<u16>,
    #[serde(rename = "bind-host", alias = "bind_host")]
    pub bind_host: Option<String>,
    #[serde(rename = "poll-timeout-secs", alias = "poll_timeout_secs")]
    pub poll_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ClusterSection {
    #[serde(rename = "remote-address", alias = "remote_address")]
    pub remote_address: Option<String>,
    #[serde(
        rename = "machineId",
        alias = "machineid",
        alias = "machine-id",
        alias = "machine_id"
    )]
    pub machine_id: Option<String>,
    pub fanout: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .and_then(|c| c.try_deserialize())
            .with_context(|| format!("failed to read config file {}", path.display()))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("machine id must not be empty")]
    EmptyMachineId,
    #[error("invalid bind host `{0}`")]
    InvalidBindHost(String),
    #[error("{0}")]
    InvalidFanout(String),
    #[error("poll timeout must be at least one second")]
    ZeroPollTimeout,
}

/// Fully resolved node settings.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub listen_addr: SocketAddr,
    pub machine_id: String,
    pub seed: Option<String>,
    pub poll_timeout: Duration,
    pub session: SessionConfig,
    pub cluster: ClusterConfig,
}

impl NodeConfig {
    /// Flags and env vars win over the config file, which wins over defaults.
    pub fn resolve(cli: Cli) -> anyhow::Result<Self> {
        let file = match cli.config.as_deref() {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Ok(Self::merge(cli, file)?)
    }

    pub fn merge(cli: Cli, file: FileConfig) -> Result<Self, ConfigError> {
        let port = cli.port.or(file.core.port).unwrap_or(DEFAULT_PORT);

        let bind_host = match (cli.bind_host, file.core.bind_host) {
            (Some(host), _) => host,
            (None, Some(raw)) => raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidBindHost(raw))?,
            (None, None) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };

        let machine_id = match cli.machine_id.or(file.cluster.machine_id) {
            Some(id) if id.trim().is_empty() => return Err(ConfigError::EmptyMachineId),
            Some(id) => id.trim().to_string(),
            None => Uuid::new_v4().to_string(),
        };

        let seed = cli
            .seed
            .or(file.cluster.remote_address)
            .map(|seed| seed.trim().to_string())
            .filter(|seed| !seed.is_empty());

        let poll_timeout_secs = cli
            .poll_timeout_secs
            .or(file.core.poll_timeout_secs)
            .unwrap_or(DEFAULT_POLL_TIMEOUT_SECS);
        if poll_timeout_secs == 0 {
            return Err(ConfigError::ZeroPollTimeout);
        }

        let fanout = match (cli.fanout, file.cluster.fanout) {
            (Some(mode), _) => mode,
            (None, Some(raw)) => raw.parse().map_err(ConfigError::InvalidFanout)?,
            (None, None) => FanoutMode::default(),
        };

        Ok(Self {
            listen_addr: SocketAddr::new(bind_host, port),
            machine_id,
            seed,
            poll_timeout: Duration::from_secs(poll_timeout_secs),
            session: SessionConfig::default(),
            cluster: ClusterConfig {
                fanout,
                ..ClusterConfig::default()
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["beach-post"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test_timeout::timeout]
    fn defaults_apply_without_flags_or_file() {
        let config = NodeConfig::merge(cli(&[]), FileConfig::default()).unwrap();

        assert_eq!(config.listen_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.poll_timeout, Duration::from_secs(20));
        assert_eq!(config.cluster.fanout, FanoutMode::Parallel);
        assert_eq!(config.cluster.rpc_timeout, Duration::from_secs(1));
        assert_eq!(config.session.grace_window, Duration::from_secs(4));
        assert!(config.seed.is_none());
        assert!(Uuid::parse_str(&config.machine_id).is_ok());
    }

    #[test_timeout::timeout]
    fn flags_override_file_values() {
        let file = FileConfig {
            core: CoreSection {
                port: Some(9000),
                bind_host: Some("127.0.0.1".into()),
                poll_timeout_secs: Some(5),
            },
            cluster: ClusterSection {
                remote_address: Some("10.0.0.2:9000".into()),
                machine_id: Some("from-file".into()),
                fanout: Some("sequential".into()),
            },
        };
        let config = NodeConfig::merge(
            cli(&["--port", "9100", "--machine-id", "from-flag", "--fanout", "parallel"]),
            file,
        )
        .unwrap();

        assert_eq!(config.listen_addr, "127.0.0.1:9100".parse().unwrap());
        assert_eq!(config.machine_id, "from-flag");
        assert_eq!(config.seed.as_deref(), Some("10.0.0.2:9000"));
        assert_eq!(config.poll_timeout, Duration::from_secs(5));
        assert_eq!(config.cluster.fanout, FanoutMode::Parallel);
    }

    #[test_timeout::timeout]
    fn invalid_values_are_rejected() {
        let blank_id = NodeConfig::merge(cli(&["--machine-id", "  "]), FileConfig::default());
        assert_eq!(blank_id.unwrap_err(), ConfigError::EmptyMachineId);

        let zero_poll =
            NodeConfig::merge(cli(&["--poll-timeout-secs", "0"]), FileConfig::default());
        assert_eq!(zero_poll.unwrap_err(), ConfigError::ZeroPollTimeout);

        let mut file = FileConfig::default();
        file.core.bind_host = Some("not-an-ip".into());
        assert_eq!(
            NodeConfig::merge(cli(&[]), file).unwrap_err(),
            ConfigError::InvalidBindHost("not-an-ip".into())
        );

        let mut file = FileConfig::default();
        file.cluster.fanout = Some("gossip".into());
        assert!(matches!(
            NodeConfig::merge(cli(&[]), file),
            Err(ConfigError::InvalidFanout(_))
        ));
    }

    #[test_timeout::timeout]
    fn empty_seed_means_no_seed() {
        let config = NodeConfig::merge(cli(&["--seed", ""]), FileConfig::default()).unwrap();
        assert!(config.seed.is_none());
    }

    #[test_timeout::timeout]
    fn ini_file_uses_classic_keys() {
        let path = std::env::temp_dir().join(format!("beach-post-{}.ini", Uuid::new_v4()));
        std::fs::write(
            &path,
            concat!(
                "[core]\nport = 8181\n\n",
                "[cluster]\nremote-address = 10.0.0.7:8181\nmachineId = node-ini\n",
            ),
        )
        .unwrap();

        let file = FileConfig::load(&path);
        let _ = std::fs::remove_file(&path);
        let file = file.unwrap();

        assert_eq!(file.core.port, Some(8181));
        assert_eq!(file.cluster.remote_address.as_deref(), Some("10.0.0.7:8181"));
        assert_eq!(file.cluster.machine_id.as_deref(), Some("node-ini"));
    }
}
