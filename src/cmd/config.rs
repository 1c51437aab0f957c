//! Configuration view and validation commands: `agencyhub config`.

use anyhow::{Context, Result};
use std::path::Path;

use agencyhub::config::{HubToml, config_path, load_effective};

use super::super::ConfigCommands;

pub fn cmd_config(
    project_dir: &Path,
    explicit: Option<&Path>,
    command: Option<ConfigCommands>,
) -> Result<()> {
    let path = config_path(project_dir, explicit);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("AgencyHub Configuration");
            println!("=======================");
            println!();

            if path.exists() {
                println!("Config file: {}", path.display());
            } else {
                println!("No agencyhub.toml found at {}", path.display());
                println!("Using defaults. Run 'agencyhub config init' to create one.");
            }
            println!();

            println!("Effective values (with env overrides):");
            let config = load_effective(project_dir, explicit)?;
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            println!("{}", rendered);

            let key_state = if config.identity.secret_key().is_some() {
                "set"
            } else {
                "not set"
            };
            println!("{} is {}", config.identity.secret_key_env, key_state);
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !path.exists() {
                println!("No agencyhub.toml found. Using defaults (valid).");
                return Ok(());
            }

            let problems = HubToml::load(&path)?.validate();
            if problems.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration problems:");
                for problem in problems {
                    println!("  - {}", problem);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if path.exists() {
                println!("agencyhub.toml already exists at {}", path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            HubToml::default().save(&path)?;

            println!("Created agencyhub.toml at {}", path.display());
            println!();
            println!("You can now customize:");
            println!("  - [server] host, port, db_path, dev_mode");
            println!("  - [identity] api_url, secret_key_env, invitation_redirect_url");
            println!("  - [logging] filter, json, directory");
            println!();
        }
    }

    Ok(())
}
