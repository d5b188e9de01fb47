// Blockstash - Cached Chain Data Service
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Data directory utilities.

use std::{fs, path::PathBuf};

use eyre::Result;

/// File name of the chain database inside the data directory.
pub const CHAIN_DB_FILE: &str = "chain.sqlite3";

/// Trait for data paths.
pub trait DataPath {
    /// Returns the path to blockstash's data dir: `~/.blockstash/data` by default.
    fn data_dir(&self) -> Option<PathBuf>;

    /// Check whether the data dir could be resolved.
    fn is_valid(&self) -> bool {
        self.data_dir().is_some()
    }

    /// Returns the path to the chain database: `<data_root>/chain.sqlite3`.
    fn chain_db_path(&self) -> Option<PathBuf> {
        Some(self.data_dir()?.join(CHAIN_DB_FILE))
    }
}

/// Data path for blockstash.
#[derive(Debug, Clone)]
pub struct BlockstashPath {
    root: Option<PathBuf>,
}

impl Default for BlockstashPath {
    fn default() -> Self {
        Self { root: default_root() }
    }
}

impl BlockstashPath {
    /// New data path, falling back to `~/.blockstash/data` when `root` is `None`.
    pub fn new(root: Option<impl Into<PathBuf>>) -> Self {
        Self { root: root.map(Into::into).or_else(default_root) }
    }

    /// New empty data path.
    pub fn empty() -> Self {
        Self { root: None }
    }

    /// Resolves the chain database path and creates its parent directory.
    pub fn ensure_chain_db_path(&self) -> Result<PathBuf> {
        let path = self
            .chain_db_path()
            .ok_or_else(|| eyre::eyre!("Unable to determine a data directory for blockstash"))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        Ok(path)
    }
}

impl DataPath for BlockstashPath {
    fn data_dir(&self) -> Option<PathBuf> {
        self.root.clone()
    }
}

fn default_root() -> Option<PathBuf> {
    dirs_next::home_dir().map(|p| p.join(".blockstash").join("data"))
}
