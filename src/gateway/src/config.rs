use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Unix socket path to listen on. Takes precedence over `tcp_port`.
    #[serde(default)]
    pub listen_path: Option<PathBuf>,
    #[serde(default)]
    pub tcp_port: Option<u16>,
    #[serde(default = "default_num_io_workers")]
    pub num_io_workers: usize,
    pub func_config_file: PathBuf,
    #[serde(default = "default_root_path_for_ipc")]
    pub root_path_for_ipc: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IoWorkerConfig {
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    #[serde(default = "default_write_buffer_size")]
    pub write_buffer_size: usize,
    #[serde(default = "default_initial_buffers")]
    pub initial_buffers: usize,
    #[serde(default = "default_task_queue_depth")]
    pub task_queue_depth: usize,
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
    #[serde(default = "default_stat_report_interval_secs")]
    pub stat_report_interval_secs: u64,
}

impl IoWorkerConfig {
    #[inline]
    pub fn stat_report_interval(&self) -> Duration {
        Duration::from_secs(self.stat_report_interval_secs)
    }
}

impl Default for IoWorkerConfig {
    fn default() -> Self {
        IoWorkerConfig {
            read_buffer_size: default_read_buffer_size(),
            write_buffer_size: default_write_buffer_size(),
            initial_buffers: default_initial_buffers(),
            task_queue_depth: default_task_queue_depth(),
            events_capacity: default_events_capacity(),
            stat_report_interval_secs: default_stat_report_interval_secs(),
        }
    }
}

fn default_num_io_workers() -> usize {
    1
}

fn default_root_path_for_ipc() -> PathBuf {
    PathBuf::from(ipc::shm::DEFAULT_ROOT_PATH)
}

fn default_read_buffer_size() -> usize {
    65536
}

fn default_write_buffer_size() -> usize {
    4096
}

fn default_initial_buffers() -> usize {
    16
}

fn default_task_queue_depth() -> usize {
    1024
}

fn default_events_capacity() -> usize {
    1024
}

fn default_stat_report_interval_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_owned()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub io_worker: IoWorkerConfig,
}

impl Config {
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config = Self::from_toml(&content)?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        if config.gateway.listen_path.is_none() && config.gateway.tcp_port.is_none() {
            anyhow::bail!("either gateway.listen_path or gateway.tcp_port must be set");
        }
        if config.gateway.num_io_workers == 0 {
            anyhow::bail!("gateway.num_io_workers must be positive");
        }
        if config.io_worker.write_buffer_size < ipc::MESSAGE_SIZE {
            anyhow::bail!(
                "io_worker.write_buffer_size must be at least {} bytes",
                ipc::MESSAGE_SIZE
            );
        }
        Ok(config)
    }
}
