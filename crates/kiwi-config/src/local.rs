//! Install-side configuration: which shared directories this host uses
//!
//! One partition per line, `path` or `path:label`. The first line is the
//! default partition.

use crate::{ConfigError, ConfigResult};
use std::path::{Path, PathBuf};

/// A shared directory and the label it is selected by
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub path: PathBuf,
    pub label: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalConfig {
    pub partitions: Vec<Partition>,
}

impl LocalConfig {
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> ConfigResult<Self> {
        let mut partitions = Vec::new();

        for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let mut parts = line.split(':');
            let path = parts.next().unwrap_or_default();
            let label = parts.next().map(str::trim).filter(|l| !l.is_empty());

            if parts.next().is_some() || path.is_empty() {
                return Err(ConfigError::LocalConfig(format!("bad line '{}'", line)));
            }

            partitions.push(Partition {
                path: PathBuf::from(path),
                label: label.map(Into::into),
            });
        }

        Ok(Self { partitions })
    }

    /// Shared directory for `label`, or the default partition when None
    pub fn shared_path(&self, label: Option<&str>) -> ConfigResult<&Path> {
        let partition = match label {
            None => self.partitions.first(),
            Some(label) => self
                .partitions
                .iter()
                .find(|p| p.label.as_deref() == Some(label)),
        };

        partition.map(|p| p.path.as_path()).ok_or_else(|| {
            ConfigError::LocalConfig(match label {
                Some(label) => format!("no partition labelled '{}'", label),
                None => "no shared path configured".into(),
            })
        })
    }

    /// Add a partition, or relabel it if the path is already listed
    pub fn set_partition(&mut self, path: PathBuf, label: String) {
        match self.partitions.iter_mut().find(|p| p.path == path) {
            Some(existing) => existing.label = Some(label),
            None => self.partitions.push(Partition {
                path,
                label: Some(label),
            }),
        }
    }

    pub fn render(&self) -> String {
        self.partitions
            .iter()
            .map(|p| match &p.label {
                Some(label) => format!("{}:{}\n", p.path.display(), label),
                None => format!("{}\n", p.path.display()),
            })
            .collect()
    }
}
