use super::types::*;
use crate::config::{expand_env_vars, expand_tilde, unexpanded_env_vars};
use crate::source::node::parse_env;
use regex::Regex;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let yaml = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    parse_config(&yaml).map_err(|e| match e {
        ConfigError::YamlParse(e) => ConfigError::Validation(format!(
            "in file '{}': {}",
            path.display(),
            e
        )),
        other => other,
    })
}

/// Parses and validates a YAML config. `$env{VAR}` references are expanded
/// first and any left unresolved is an error.
pub fn parse_config(yaml: &str) -> Result<Config, ConfigError> {
    let yaml = expand_env_vars(yaml);

    let missing = unexpanded_env_vars(&yaml);
    if !missing.is_empty() {
        return Err(ConfigError::Validation(format!(
            "environment variables are not set: {}",
            missing.join(", ")
        )));
    }

    let mut config: Config = serde_yaml::from_str(&yaml)?;
    expand_paths(&mut config);
    validate_config(&config)?;
    Ok(config)
}

fn expand_paths(config: &mut Config) {
    config.ingestor.working_dir = expand_tilde(&config.ingestor.working_dir);
    config.store.path = expand_tilde(&config.store.path);
    if let Some(dir) = &config.logs.dir {
        config.logs.dir = Some(expand_tilde(dir));
    }
    if let Some(path) = &config.node.path {
        config.node.path = Some(expand_tilde(path));
    }
    if let Some(dir) = &config.node.dir {
        config.node.dir = Some(expand_tilde(dir));
    }
}

/// Checks that need no filesystem access. Every problem is reported at once.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();
    let ingestor = &config.ingestor;

    if ingestor.line_buffer_size == 0 {
        errors.push("ingestor.line_buffer_size must be greater than 0".to_string());
    }
    if ingestor.blocks_chan_capacity == 0 {
        errors.push("ingestor.blocks_chan_capacity must be greater than 0".to_string());
    }
    if ingestor.lines_chan_capacity == 0 {
        errors.push("ingestor.lines_chan_capacity must be greater than 0".to_string());
    }
    if ingestor.stop_block_num > 0 && ingestor.start_block_num > ingestor.stop_block_num {
        errors.push(format!(
            "ingestor.start_block_num ({}) is after ingestor.stop_block_num ({})",
            ingestor.start_block_num, ingestor.stop_block_num
        ));
    }
    if config.server.subscriber_buffer == 0 {
        errors.push("server.subscriber_buffer must be greater than 0".to_string());
    }
    if config.server.listen.trim().is_empty() {
        errors.push("server.listen must be set".to_string());
    }

    validate_regex("logs.pattern", &config.logs.pattern, &mut errors);
    if let Some(filter) = config.node.logs_filter.as_deref().filter(|f| !f.is_empty()) {
        validate_regex("node.logs_filter", filter, &mut errors);
    }
    if let Err(entry) = parse_env(&config.node.env) {
        errors.push(format!(
            "node.env: '{}' is not a KEY=VALUE pair",
            entry
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

fn validate_regex(context: &str, pattern: &str, errors: &mut Vec<String>) {
    if let Err(e) = Regex::new(pattern) {
        errors.push(format!("{}: invalid regex '{}': {}", context, pattern, e));
    }
}

/// Verifies that the source selected by `ingestor.mode` can be started.
pub fn check_mode_preconditions(config: &Config) -> Result<(), ConfigError> {
    match config.ingestor.mode {
        Mode::Stdin => Ok(()),
        Mode::Logs => check_logs_source(config.logs.dir.as_deref()),
        Mode::Node => check_node_bin_path(config.node.path.as_deref()),
    }
}

fn check_logs_source(dir: Option<&Path>) -> Result<(), ConfigError> {
    let dir = match dir {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => return Err(ConfigError::Validation("logs.dir must be set".to_string())),
    };

    if !expand_tilde(dir).is_dir() {
        return Err(ConfigError::Validation(format!(
            "logs.dir '{}' must exist and be a directory",
            dir.display()
        )));
    }

    Ok(())
}

fn check_node_bin_path(path: Option<&Path>) -> Result<(), ConfigError> {
    let path = match path {
        Some(path) if !path.as_os_str().is_empty() => path,
        _ => return Err(ConfigError::Validation("node.path must be set".to_string())),
    };

    let metadata = std::fs::metadata(path).map_err(|e| {
        ConfigError::Validation(format!(
            "cannot inspect node.path '{}': {}",
            path.display(),
            e
        ))
    })?;

    if metadata.is_dir() {
        return Err(ConfigError::Validation(format!(
            "node.path '{}' is a directory",
            path.display()
        )));
    }

    Ok(())
}
