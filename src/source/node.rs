use super::reader::{read_line_bounded, LineRead};
use super::{RawLine, SourceError};
use crate::config::types::NodeConfig;
use regex::Regex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Runs the node binary and reads its standard output.
pub struct NodeSource {
    name: Arc<str>,
    path: PathBuf,
    dir: Option<PathBuf>,
    args: Vec<String>,
    env: Vec<(String, String)>,
    logs_filter: Option<Regex>,
    limit: usize,
    process: Option<NodeProcess>,
    exited: bool,
    buf: Vec<u8>,
    next_seq: u64,
}

struct NodeProcess {
    child: Child,
    stdout: BufReader<ChildStdout>,
    stderr_task: JoinHandle<()>,
}

impl NodeSource {
    pub fn new(config: &NodeConfig, limit: usize) -> Result<Self, SourceError> {
        let path = config.path.clone().ok_or(SourceError::Missing("node.path"))?;
        let logs_filter = config
            .logs_filter
            .as_deref()
            .filter(|f| !f.is_empty())
            .map(Regex::new)
            .transpose()?;

        Ok(Self {
            name: Arc::from(format!("node:{}", path.display())),
            path,
            dir: config.dir.clone(),
            args: config.args.split_whitespace().map(str::to_string).collect(),
            env: parse_env(&config.env).map_err(|entry| {
                SourceError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("invalid node env entry '{}'", entry),
                ))
            })?,
            logs_filter,
            limit,
            process: None,
            exited: false,
            buf: Vec::new(),
            next_seq: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn next_line(&mut self) -> Result<Option<RawLine>, SourceError> {
        if self.exited {
            return Ok(None);
        }
        if self.process.is_none() {
            self.process = Some(self.spawn()?);
        }
        let Some(process) = self.process.as_mut() else {
            return Ok(None);
        };

        let seq = self.next_seq;
        match read_line_bounded(&mut process.stdout, &mut self.buf, self.limit, true).await? {
            LineRead::Line(text) => {
                self.next_seq += 1;
                Ok(Some(RawLine {
                    source: Arc::clone(&self.name),
                    seq,
                    text,
                }))
            }
            LineRead::TooLong => Err(SourceError::LineTooLong {
                seq,
                limit: self.limit,
            }),
            LineRead::Eof => {
                self.exited = true;
                let status = process.child.wait().await?;
                if let Err(e) = (&mut process.stderr_task).await {
                    debug!(error = %e, "Node stderr relay ended abnormally");
                }
                if status.success() {
                    info!(%status, "Node process exited");
                    Ok(None)
                } else {
                    Err(SourceError::ProcessExited(status))
                }
            }
        }
    }

    /// Closes the output pipe, asks the process to terminate and waits up to
    /// `grace` for it to exit before killing it.
    pub async fn shutdown(&mut self, grace: Duration) {
        let Some(process) = self.process.take() else {
            return;
        };
        self.exited = true;

        let NodeProcess {
            mut child,
            stdout,
            stderr_task,
        } = process;
        drop(stdout);
        request_exit(&child);

        match timeout(grace, child.wait()).await {
            Ok(Ok(status)) => info!(%status, "Node process stopped"),
            Ok(Err(e)) => warn!(error = %e, "Failed to wait for node process"),
            Err(_) => {
                warn!(grace = ?grace, "Node process did not exit in time, killing it");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill node process");
                }
            }
        }
        stderr_task.abort();
    }

    fn spawn(&self) -> Result<NodeProcess, SourceError> {
        let mut command = Command::new(&self.path);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| SourceError::Spawn {
            path: self.path.clone(),
            source,
        })?;
        info!(path = %self.path.display(), pid = ?child.id(), "Spawned node process");

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "node output pipes were not captured",
            )
            .into());
        };
        let stderr_task = tokio::spawn(forward_stderr(stderr, self.logs_filter.clone()));

        Ok(NodeProcess {
            child,
            stdout: BufReader::new(stdout),
            stderr_task,
        })
    }
}

/// Sends SIGTERM so the node can stop on its own terms.
#[cfg(unix)]
fn request_exit(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) => debug!(pid, "Sent SIGTERM to node process"),
        Err(e) => debug!(pid, error = %e, "Failed to signal node process"),
    }
}

#[cfg(not(unix))]
fn request_exit(_child: &Child) {}

/// Relays the node's stderr into our log, keeping only lines matching the
/// filter when one is configured.
async fn forward_stderr(stderr: ChildStderr, filter: Option<Regex>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if filter.as_ref().map_or(true, |re| re.is_match(&line)) {
                    info!(target: "blockfeed::node", "{}", line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Stopped reading node stderr");
                break;
            }
        }
    }
}

/// Parses `KEY=VALUE` entries separated by whitespace or commas. Returns the
/// first bad entry on failure.
pub fn parse_env(env: &str) -> Result<Vec<(String, String)>, String> {
    env.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(entry.to_string()),
        })
        .collect()
}
