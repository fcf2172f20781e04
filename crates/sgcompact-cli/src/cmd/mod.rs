pub mod compact;
pub mod completions;
pub mod order;
pub mod seed;
pub mod sim;
pub mod state;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use sgcompact_core::store::sqlite::{SqliteStore, open_store};

/// Database and scope selection shared by every store-backed command.
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// SQLite database holding state groups and the interval table.
    #[arg(long, value_name = "PATH")]
    pub db: PathBuf,

    /// Room whose state groups are read.
    #[arg(long, value_name = "ROOM")]
    pub scope: String,
}

impl StoreArgs {
    /// Open the database, applying pragmas and migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub fn open(&self) -> Result<SqliteStore> {
        open(&self.db)
    }
}

pub fn open(path: &Path) -> Result<SqliteStore> {
    open_store(path).with_context(|| format!("Failed to open database {}", path.display()))
}
