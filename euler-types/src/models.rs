use serde::{Deserialize, Serialize};

use crate::config::GraphConfig;
use crate::errors::TypeError;

/// How queries are planned and executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Local,
    Remote,
    GraphPartition,
}

impl std::str::FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(RunMode::Local),
            "remote" => Ok(RunMode::Remote),
            "graph_partition" => Ok(RunMode::GraphPartition),
            other => Err(format!("unknown mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InitMode {
    #[default]
    Eager,
    Lazy,
}

fn default_num_retries() -> u32 {
    10
}

fn default_num_channels_per_host() -> usize {
    1
}

fn default_bad_host_cleanup_interval_secs() -> u64 {
    1
}

fn default_bad_host_timeout_secs() -> u64 {
    10
}

/// Client-side settings, spec'd keys only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientOptions {
    #[serde(default)]
    pub mode: RunMode,
    #[serde(default)]
    pub shard_num: usize,
    #[serde(default)]
    pub zk_server: Option<String>,
    #[serde(default)]
    pub zk_path: Option<String>,
    #[serde(default = "default_num_retries")]
    pub num_retries: u32,
    #[serde(default = "default_num_channels_per_host")]
    pub num_channels_per_host: usize,
    #[serde(default = "default_bad_host_cleanup_interval_secs")]
    pub bad_host_cleanup_interval_secs: u64,
    #[serde(default = "default_bad_host_timeout_secs")]
    pub bad_host_timeout_secs: u64,
    #[serde(default)]
    pub init: InitMode,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            mode: RunMode::default(),
            shard_num: 1,
            zk_server: None,
            zk_path: None,
            num_retries: default_num_retries(),
            num_channels_per_host: default_num_channels_per_host(),
            bad_host_cleanup_interval_secs: default_bad_host_cleanup_interval_secs(),
            bad_host_timeout_secs: default_bad_host_timeout_secs(),
            init: InitMode::default(),
        }
    }
}

impl ClientOptions {
    pub fn from_config(config: &GraphConfig) -> Result<Self, TypeError> {
        let mut options = Self {
            shard_num: config.get_or("shard_num", 1)?,
            num_retries: config.get_or("num_retries", default_num_retries())?,
            num_channels_per_host: config
                .get_or("num_channels_per_host", default_num_channels_per_host())?,
            bad_host_cleanup_interval_secs: config.get_or(
                "bad_host_cleanup_interval",
                default_bad_host_cleanup_interval_secs(),
            )?,
            bad_host_timeout_secs: config
                .get_or("bad_host_timeout", default_bad_host_timeout_secs())?,
            zk_server: config.get("zk_server").map(str::to_string),
            zk_path: config.get("zk_path").map(str::to_string),
            ..Self::default()
        };
        if let Some(mode) = config.get_parsed::<RunMode>("mode")? {
            options.mode = mode;
        }
        if let Some(init) = config.get("init") {
            options.init = match init {
                "eager" => InitMode::Eager,
                "lazy" => InitMode::Lazy,
                other => {
                    return Err(TypeError::InvalidConfigValue {
                        key: "init".to_string(),
                        value: other.to_string(),
                    })
                }
            };
        }
        Ok(options)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadDataType {
    Node,
    Edge,
    #[default]
    All,
    None,
}

fn default_port() -> u16 {
    9190
}

/// Server-side settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerOptions {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub data_path: Option<String>,
    #[serde(default)]
    pub shard_idx: usize,
    #[serde(default)]
    pub zk_server: Option<String>,
    #[serde(default)]
    pub zk_path: Option<String>,
    #[serde(default)]
    pub load_data_type: LoadDataType,
    #[serde(default)]
    pub global_sampler_type: LoadDataType,
    #[serde(default)]
    pub thread_pool: Option<String>,
    #[serde(default)]
    pub num_threads: Option<usize>,
    /// Overrides the advertised host when set.
    #[serde(default)]
    pub server: Option<String>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            port: default_port(),
            data_path: None,
            shard_idx: 0,
            zk_server: None,
            zk_path: None,
            load_data_type: LoadDataType::default(),
            global_sampler_type: LoadDataType::default(),
            thread_pool: None,
            num_threads: None,
            server: None,
        }
    }
}

impl ServerOptions {
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }
}
