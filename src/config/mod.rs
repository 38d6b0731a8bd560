pub mod generate;
pub mod parse;
pub mod types;

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub use parse::{check_mode_preconditions, load_config, parse_config, validate_config, ConfigError};
pub use types::{Config, Mode};

fn env_var_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Pattern matches $env{VAR_NAME} where VAR_NAME starts with letter or underscore
    RE.get_or_init(|| Regex::new(r"\$env\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static pattern"))
}

/// Expands environment variables in a string.
/// Supports $env{VAR_NAME} syntax.
/// If an environment variable is not set, it's left unchanged.
pub fn expand_env_vars(text: &str) -> String {
    env_var_regex()
        .replace_all(text, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

/// Names of `$env{...}` references still present after expansion.
pub fn unexpanded_env_vars(text: &str) -> Vec<String> {
    let mut names: Vec<String> = env_var_regex()
        .captures_iter(text)
        .map(|caps| caps[1].to_string())
        .collect();
    names.sort();
    names.dedup();
    names
}

/// Expands tilde (~) in paths to the user's home directory.
/// Returns the path unchanged if it doesn't start with tilde or home directory cannot be determined.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if let Some(rest) = path_str.strip_prefix("~/") {
        if let Some(home_dir) = dirs::home_dir() {
            return home_dir.join(rest);
        }
    } else if path_str == "~" {
        if let Some(home_dir) = dirs::home_dir() {
            return home_dir;
        }
    }

    path.to_path_buf()
}

/// Resolves the config file path based on explicit argument or default locations.
/// Returns the first existing path from:
/// 1. Explicit path (if provided, with tilde expansion)
/// 2. ~/.config/blockfeed/config.yml
/// 3. /etc/blockfeed/config.yml
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(expand_tilde(path));
    }

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            return Some(user_config);
        }
    }

    let system_config = PathBuf::from("/etc/blockfeed/config.yml");
    if system_config.exists() {
        return Some(system_config);
    }

    None
}

pub fn user_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".config/blockfeed/config.yml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars_single() {
        std::env::set_var("BLOCKFEED_TEST_VAR", "test_value");
        let result = expand_env_vars("path/$env{BLOCKFEED_TEST_VAR}/file");
        assert_eq!(result, "path/test_value/file");
        std::env::remove_var("BLOCKFEED_TEST_VAR");
    }

    #[test]
    fn test_expand_env_vars_partial() {
        std::env::set_var("BLOCKFEED_SET_VAR", "exists");
        let result = expand_env_vars("$env{BLOCKFEED_SET_VAR}/$env{BLOCKFEED_UNSET_VAR}");
        assert_eq!(result, "exists/$env{BLOCKFEED_UNSET_VAR}");
        assert_eq!(unexpanded_env_vars(&result), vec!["BLOCKFEED_UNSET_VAR"]);
        std::env::remove_var("BLOCKFEED_SET_VAR");
    }

    #[test]
    fn test_shell_style_vars_are_not_expanded() {
        let result = expand_env_vars("${HOME}/x");
        assert_eq!(result, "${HOME}/x");
        assert!(unexpanded_env_vars(&result).is_empty());
    }

    #[test]
    fn test_expand_tilde() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde(Path::new("~/test/path")), home.join("test/path"));
            assert_eq!(expand_tilde(Path::new("~")), home);
        }
        assert_eq!(expand_tilde(Path::new("/absolute/path")), Path::new("/absolute/path"));
        assert_eq!(expand_tilde(Path::new("relative/~")), Path::new("relative/~"));
    }

    #[test]
    fn test_explicit_config_path_wins() {
        let resolved = resolve_config_path(Some(Path::new("/tmp/custom.yml")));
        assert_eq!(resolved, Some(PathBuf::from("/tmp/custom.yml")));
    }
}
