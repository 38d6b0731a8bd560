use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_LINE_BUFFER_SIZE: usize = 10 * 1024 * 1024;
pub const DEFAULT_LOGS_PATTERN: &str = r"\.log(\.\d+)?$";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub ingestor: IngestorConfig,
    pub logs: LogsConfig,
    pub node: NodeConfig,
    pub store: StoreConfig,
    pub server: ServerConfig,
}

/// Which line source feeds the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Our own standard input
    #[default]
    Stdin,
    /// Rotating log files in a directory
    Logs,
    /// Standard output of a spawned node process
    Node,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Stdin => "stdin",
            Mode::Logs => "logs",
            Mode::Node => "node",
        })
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdin" => Ok(Mode::Stdin),
            "logs" => Ok(Mode::Logs),
            "node" => Ok(Mode::Node),
            other => Err(format!(
                "invalid mode: {} (expected one of stdin, logs, node)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestorConfig {
    pub mode: Mode,
    /// Maximum size of a single console line, in bytes
    pub line_buffer_size: usize,
    /// Staging area for one-block files before they land in the store
    pub working_dir: PathBuf,
    /// First block to forward; 0 forwards whatever comes first
    pub start_block_num: u64,
    /// Last block to forward (inclusive); 0 means unbounded
    pub stop_block_num: u64,
    pub blocks_chan_capacity: usize,
    pub lines_chan_capacity: usize,
}

impl Default for IngestorConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Stdin,
            line_buffer_size: DEFAULT_LINE_BUFFER_SIZE,
            working_dir: PathBuf::from("./data/workdir"),
            start_block_num: 0,
            stop_block_num: 0,
            blocks_chan_capacity: 100,
            lines_chan_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogsConfig {
    pub dir: Option<PathBuf>,
    pub pattern: String,
    /// Keep tailing after every file has been read
    pub follow: bool,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            dir: None,
            pattern: DEFAULT_LOGS_PATTERN.to_string(),
            follow: true,
            poll_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub path: Option<PathBuf>,
    pub dir: Option<PathBuf>,
    /// Whitespace separated arguments
    pub args: String,
    /// `KEY=VALUE` pairs separated by whitespace or commas
    pub env: String,
    /// Regex selecting which node stderr lines are logged
    pub logs_filter: Option<String>,
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            path: None,
            dir: None,
            args: String::new(),
            env: String::new(),
            logs_filter: None,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// Appended to every one-block file name when non-empty
    pub suffix: String,
    /// Stop ingestion when a block cannot be persisted
    pub halt_on_error: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/one-blocks"),
            suffix: String::new(),
            halt_on_error: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    /// Blocks queued per subscriber before fan-out waits on it
    pub subscriber_buffer: usize,
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:9000".to_string(),
            subscriber_buffer: 64,
            drain_timeout: Duration::from_secs(5),
        }
    }
}
