//! Project setup command: `agencyhub init`.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use agencyhub::config::{HubToml, config_path, load_effective};
use agencyhub::hub::db::HubDb;

use super::resolve_in_project;

pub fn cmd_init(
    project_dir: &Path,
    explicit_config: Option<&Path>,
    db_path: Option<PathBuf>,
) -> Result<()> {
    let path = config_path(project_dir, explicit_config);
    if path.exists() {
        println!("Using existing config at {}", path.display());
    } else {
        let mut toml = HubToml::default();
        if let Some(db_path) = &db_path {
            toml.server.db_path = db_path.clone();
        }
        toml.save(&path)?;
        println!("Created {}", path.display());
    }

    let mut config = load_effective(project_dir, Some(&path))?;
    if let Some(db_path) = db_path {
        config.server.db_path = db_path;
    }
    let db_path = resolve_in_project(project_dir, &config.server.db_path);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    HubDb::new(&db_path)?;

    println!("Initialized agencyhub database at {}", db_path.display());
    Ok(())
}
