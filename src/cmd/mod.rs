//! CLI command implementations.
//!
//! | Module    | Commands handled |
//! |-----------|------------------|
//! | `init`    | `Init`           |
//! | `serve`   | `Serve`          |
//! | `config`  | `Config`         |

pub mod config;
pub mod init;
pub mod serve;

use std::path::{Path, PathBuf};

pub use config::cmd_config;
pub use init::cmd_init;
pub use serve::{ServeOverrides, cmd_serve};

/// Relative paths from the config or CLI are taken from the project directory.
pub fn resolve_in_project(project_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        project_dir.join(path)
    }
}
