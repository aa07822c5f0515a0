// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! File-backed configuration shared by the transaction manager crates.

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};

/// Configuration that can be loaded from and saved to disk.
///
/// Files ending in `.yaml`/`.yml` are parsed as YAML, anything else as JSON.
pub trait Config: Serialize + DeserializeOwned {
    fn persisted(self, path: &Path) -> PersistedConfig<Self>
    where
        Self: Sized,
    {
        PersistedConfig {
            inner: self,
            path: path.to_path_buf(),
        }
    }

    fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = if is_yaml(path) {
            serde_yaml::from_str(&content)
                .with_context(|| format!("invalid YAML config {}", path.display()))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("invalid JSON config {}", path.display()))?
        };
        Ok(config)
    }

    fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("yaml") | Some("yml")
    )
}

pub struct PersistedConfig<C> {
    inner: C,
    path: PathBuf,
}

impl<C: Config> PersistedConfig<C> {
    pub fn read(&self) -> Result<C> {
        C::load(&self.path)
    }

    pub fn save(&self) -> Result<()> {
        self.inner.save(&self.path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
