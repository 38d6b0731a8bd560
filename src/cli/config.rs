use crate::config::generate::generate_starter_config;
use crate::config::{check_mode_preconditions, load_config, user_config_path};
use std::fs;
use std::path::PathBuf;

pub fn init(stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config_content = generate_starter_config();

    if stdout {
        print!("{}", config_content);
        return Ok(());
    }

    // Try ~/.config/blockfeed/config.yml first
    let config_path = match user_config_path() {
        Some(user_config) => match user_config.parent().map(fs::create_dir_all) {
            Some(Err(e)) => {
                eprintln!("Warning: Could not create directory for {}: {}", user_config.display(), e);
                eprintln!("Falling back to /etc/blockfeed/config.yml");
                None
            }
            _ => Some(user_config),
        },
        None => None,
    };
    let config_path = config_path.unwrap_or_else(|| PathBuf::from("/etc/blockfeed/config.yml"));

    if config_path.exists() {
        return Err(format!(
            "config file already exists at {}; remove it first or use --stdout to print the config",
            config_path.display()
        )
        .into());
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&config_path, config_content)?;

    println!("Config file written to {}", config_path.display());
    Ok(())
}

pub fn validate(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let path = config_path.ok_or("No config file found. Use --config to specify a path.")?;

    println!("Validating config file: {}", path.display());

    let config = load_config(&path)?;
    check_mode_preconditions(&config)?;

    println!("✓ Config is valid (mode: {})", config.ingestor.mode);
    Ok(())
}
