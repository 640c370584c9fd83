//! Runtime configuration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::Deserialize;

/// The default path to use for data storage.
pub const DEFAULT_DATA_PATH: &str = "/var/lib/hadron-mgmt/db";
/// The default directory of instance dRPC sockets.
pub const DEFAULT_DRPC_SOCKET_DIR: &str = "/var/run/hadron-mgmt";

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The port which cluster-facing management traffic is to use.
    pub client_port: u16,
    /// The port used to serve metrics.
    #[serde(default = "Config::default_metrics_port")]
    pub metrics_port: u16,

    /// The name of the system written into new instance identity records.
    #[serde(default = "Config::default_system_name")]
    pub system_name: String,
    /// The addresses of the management service replicas, as `host:port`.
    #[serde(default)]
    pub access_points: Vec<String>,
    /// The host advertised to the leader when local instances join the system.
    #[serde(default = "Config::default_advertise_host")]
    pub advertise_host: String,
    /// The fabric URI advertised for local instances.
    #[serde(default)]
    pub fabric_uri: String,

    /// The path to the database on disk.
    #[serde(default = "Config::default_data_path")]
    pub storage_data_path: String,
    /// The directory holding the dRPC sockets of local instances.
    #[serde(default = "Config::default_drpc_socket_dir")]
    pub drpc_socket_dir: String,
    /// The worker process executable.
    #[serde(default = "Config::default_instance_binary")]
    pub instance_binary: String,
    /// Arguments passed to the worker process executable.
    #[serde(default)]
    pub instance_args: Vec<String>,
    /// The number of local instances to manage.
    #[serde(default = "Config::default_instance_count")]
    pub instance_count: u32,
    /// The maximum number of local instances allowed per host.
    #[serde(default = "Config::default_max_instances")]
    pub max_instances: u32,
    /// Whether the first local instance hosts a management service replica.
    #[serde(default)]
    pub ms_replica: bool,
    /// Whether instances are started at boot without waiting for a start request.
    #[serde(default = "Config::default_true")]
    pub auto_start: bool,
    /// Whether instances awaiting format get a fresh identity record without further request.
    #[serde(default)]
    pub auto_format: bool,

    /// The deadline of rank fan-out requests and the bound on stop convergence, in milliseconds.
    #[serde(default = "Config::default_rank_request_timeout_ms")]
    pub rank_request_timeout_ms: u64,
    /// The bound on start and reset-format convergence, in milliseconds.
    #[serde(default = "Config::default_rank_start_timeout_ms")]
    pub rank_start_timeout_ms: u64,
    /// The interval at which instance state is polled, in milliseconds.
    #[serde(default = "Config::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routing just parses the runtime environment and builds the application
    /// config from that. In the future, this may take into account an optional config file as
    /// well.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the relationships between config values.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.instance_count > 0, "INSTANCE_COUNT must be greater than 0");
        ensure!(
            self.instance_count <= self.max_instances,
            "INSTANCE_COUNT ({}) exceeds MAX_INSTANCES ({})",
            self.instance_count,
            self.max_instances
        );
        ensure!(self.rank_request_timeout_ms > 0, "RANK_REQUEST_TIMEOUT_MS must be greater than 0");
        ensure!(self.rank_start_timeout_ms > 0, "RANK_START_TIMEOUT_MS must be greater than 0");
        ensure!(self.poll_interval_ms > 0, "POLL_INTERVAL_MS must be greater than 0");
        Ok(())
    }

    /// The deadline of rank fan-out requests, also bounding stop convergence.
    pub fn rank_request_timeout(&self) -> Duration {
        Duration::from_millis(self.rank_request_timeout_ms)
    }

    /// The bound on start and reset-format convergence.
    pub fn rank_start_timeout(&self) -> Duration {
        Duration::from_millis(self.rank_start_timeout_ms)
    }

    /// The interval at which instance state is polled.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// The dRPC socket path of the instance with the given index.
    pub fn drpc_socket_path(&self, index: u32) -> PathBuf {
        PathBuf::from(&self.drpc_socket_dir).join(format!("io_server_{}.sock", index))
    }

    /// The listener address advertised by this host.
    pub fn advertise_addr(&self) -> String {
        format!("{}:{}", self.advertise_host, self.client_port)
    }

    fn default_metrics_port() -> u16 {
        7002
    }

    fn default_system_name() -> String {
        "daos_server".into()
    }

    fn default_advertise_host() -> String {
        "127.0.0.1".into()
    }

    fn default_data_path() -> String {
        DEFAULT_DATA_PATH.into()
    }

    fn default_drpc_socket_dir() -> String {
        DEFAULT_DRPC_SOCKET_DIR.into()
    }

    fn default_instance_binary() -> String {
        "io_server".into()
    }

    fn default_instance_count() -> u32 {
        1
    }

    fn default_max_instances() -> u32 {
        2
    }

    fn default_true() -> bool {
        true
    }

    fn default_rank_request_timeout_ms() -> u64 {
        10_000
    }

    fn default_rank_start_timeout_ms() -> u64 {
        60_000
    }

    fn default_poll_interval_ms() -> u64 {
        500
    }

    /// Build a config for use in tests, backed by a temporary data directory.
    #[cfg(test)]
    pub fn new_test() -> Result<(std::sync::Arc<Self>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir_in("/tmp").context("error creating tmp dir in /tmp")?;
        let config = Self {
            rust_log: "error".into(),
            client_port: 10001,
            metrics_port: Self::default_metrics_port(),
            system_name: Self::default_system_name(),
            access_points: vec!["127.0.0.1:10001".into()],
            advertise_host: Self::default_advertise_host(),
            fabric_uri: "ofi+sockets://127.0.0.1:31416".into(),
            storage_data_path: tmpdir.path().to_string_lossy().to_string(),
            drpc_socket_dir: tmpdir.path().to_string_lossy().to_string(),
            instance_binary: Self::default_instance_binary(),
            instance_args: vec![],
            instance_count: 1,
            max_instances: Self::default_max_instances(),
            ms_replica: true,
            auto_start: false,
            auto_format: false,
            rank_request_timeout_ms: 500,
            rank_start_timeout_ms: 1_000,
            poll_interval_ms: 10,
        };
        Ok((std::sync::Arc::new(config), tmpdir))
    }
}
