use anyhow::{bail, Result};
use colored::Colorize;
use dialoguer::{Input, Password};

use crate::api::ApiClient;
use crate::config::Config;

/// Handle the login command
pub async fn run(server_url: Option<String>) -> Result<()> {
    println!("{}", "Outpost Login".bold());
    println!();

    let mut config = Config::load().unwrap_or_default();

    let server_url = match server_url {
        Some(url) => url,
        None => Input::new()
            .with_prompt("Server URL")
            .default(config.server_url().to_string())
            .interact_text()?,
    };
    config.server_url = Some(server_url);

    let api_key: String = Password::new().with_prompt("API key").interact()?;
    if api_key.is_empty() {
        bail!("API key cannot be empty");
    }

    // Verify the key by listing agents
    let api = ApiClient::new(config.server_url(), Some(&api_key))?;
    let agents: Vec<serde_json::Value> = api.get("/api/agents").await.map_err(|e| {
        anyhow::anyhow!("Cannot authenticate against {}: {}", config.server_url(), e)
    })?;

    config.api_key = Some(api_key);
    config.save()?;

    println!();
    println!(
        "{} Logged in to {} ({} agent(s) connected)",
        "✓".green().bold(),
        config.server_url(),
        agents.len()
    );
    println!(
        "  Config saved to {}",
        Config::path()?.display().to_string().dimmed()
    );

    Ok(())
}
