//! `pocketcode config`: show, locate or initialize the configuration file.

use pocketcode_config::AppConfig;

const REDACTED: &str = "[REDACTED]";

pub async fn show() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    println!("{}", toml::to_string_pretty(&redacted(config))?);
    Ok(())
}

pub async fn path() -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", AppConfig::config_dir().join("config.toml").display());
    Ok(())
}

/// Write the default configuration. Refuses to overwrite an existing file.
pub async fn init() -> Result<(), Box<dyn std::error::Error>> {
    let dir = AppConfig::config_dir();
    let path = dir.join("config.toml");
    if path.exists() {
        return Err(format!("{} already exists", path.display()).into());
    }
    tokio::fs::create_dir_all(&dir).await?;
    tokio::fs::write(&path, AppConfig::default_toml()).await?;
    println!("Wrote default configuration to {}", path.display());
    println!("Set POCKETCODE_API_KEY or add api_key under [providers.<name>].");
    Ok(())
}

fn redacted(mut config: AppConfig) -> AppConfig {
    if config.api_key.is_some() {
        config.api_key = Some(REDACTED.into());
    }
    for provider in config.providers.values_mut() {
        if provider.api_key.is_some() {
            provider.api_key = Some(REDACTED.into());
        }
    }
    config
}
