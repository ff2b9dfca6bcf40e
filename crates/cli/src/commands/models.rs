//! `pocketcode models`: list configured models and what each provider serves.

use pocketcode_config::AppConfig;
use pocketcode_providers::{ModelRegistry, build_from_config};

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    let registry = ModelRegistry::new(config.model_infos());
    let router = build_from_config(&config)?;

    println!("Configured models:");
    for model in registry.list() {
        let mut flags = Vec::new();
        if model.single_round {
            flags.push("single-round");
        }
        if model.thinking {
            flags.push("thinking");
        }
        let default = if model.id == config.default_model { " (default)" } else { "" };
        println!("  {} [{}]{default} {}", model.id, model.provider, flags.join(", "));
    }

    for name in router.list() {
        let Some(client) = router.get(name) else {
            continue;
        };
        println!();
        match client.fetch_models().await {
            Ok(models) => {
                println!("{name}: {} model(s)", models.len());
                for id in models {
                    println!("  {id}");
                }
            }
            Err(e) => println!("{name}: unavailable ({e})"),
        }
    }
    Ok(())
}
