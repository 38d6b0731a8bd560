use crate::config::parse::load_config;
use crate::config::types::{Config, Mode};
use crate::ingestor::{IngestError, Ingestor, ShutdownHandle, ShutdownReason};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub mode: Option<Mode>,
    pub start_block: Option<u64>,
    pub stop_block: Option<u64>,
    pub listen: Option<String>,
}

impl RunOverrides {
    pub fn apply(&self, config: &mut Config) {
        if let Some(mode) = self.mode {
            config.ingestor.mode = mode;
        }
        if let Some(start) = self.start_block {
            config.ingestor.start_block_num = start;
        }
        if let Some(stop) = self.stop_block {
            config.ingestor.stop_block_num = stop;
        }
        if let Some(listen) = &self.listen {
            config.server.listen = listen.clone();
        }
    }
}

/// How long leftover runtime work may hold up process exit. A blocked
/// stdin read never completes on its own.
pub const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Runs `future` on a fresh multi-threaded runtime, then shuts the runtime
/// down waiting at most `grace` for blocking tasks still in flight.
pub fn block_on<F: Future>(future: F, grace: Duration) -> std::io::Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let output = runtime.block_on(future);
    runtime.shutdown_timeout(grace);
    Ok(output)
}

pub async fn run(
    config_path: Option<PathBuf>,
    overrides: RunOverrides,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &config_path {
        Some(path) => {
            info!(config_path = %path.display(), "Loading configuration");
            load_config(path)?
        }
        None => {
            warn!("No config file found, using defaults");
            Config::default()
        }
    };
    overrides.apply(&mut config);

    let reason = run_ingestor(config, config_path.as_deref()).await?;
    match reason {
        ShutdownReason::StopBlockReached(number) => info!(block_num = number, "Stop block reached"),
        ShutdownReason::SourceExhausted => info!("Source exhausted"),
        ShutdownReason::Signal => info!("Shutdown on signal"),
    }
    Ok(())
}

async fn run_ingestor(config: Config, config_path: Option<&Path>) -> Result<ShutdownReason, IngestError> {
    let ingestor = Ingestor::new(config)?;
    if let Some(path) = config_path {
        info!(config_path = %path.display(), "Configuration valid");
    }

    let handle = ingestor.shutdown_handle();
    let signals = tokio::spawn(wait_for_signal(handle));

    info!("Ingestor started, press Ctrl+C to shutdown");
    let result = ingestor.run().await;
    signals.abort();
    result
}

async fn wait_for_signal(handle: ShutdownHandle) {
    #[cfg(unix)]
    {
        let mut terminate = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                let _ = signal::ctrl_c().await;
                info!("Shutdown signal received");
                handle.shutdown();
                return;
            }
        };
        tokio::select! {
            _ = signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }

    info!("Shutdown signal received");
    handle.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_on_does_not_wait_for_stuck_blocking_work() {
        let started = std::time::Instant::now();
        let value = block_on(
            async {
                // Stands in for a stdin read that never returns
                let _reader = tokio::task::spawn_blocking(|| std::thread::sleep(Duration::from_secs(30)));
                7
            },
            Duration::from_millis(100),
        )
        .unwrap();

        assert_eq!(value, 7);
        assert!(started.elapsed() < Duration::from_secs(5), "{:?}", started.elapsed());
    }

    #[test]
    fn test_overrides_take_precedence() {
        let mut config = Config::default();
        config.ingestor.start_block_num = 1;

        let overrides = RunOverrides {
            mode: Some(Mode::Logs),
            start_block: None,
            stop_block: Some(9),
            listen: Some("0.0.0.0:1234".to_string()),
        };
        overrides.apply(&mut config);

        assert_eq!(config.ingestor.mode, Mode::Logs);
        assert_eq!(config.ingestor.start_block_num, 1);
        assert_eq!(config.ingestor.stop_block_num, 9);
        assert_eq!(config.server.listen, "0.0.0.0:1234");
    }
}
