//! Resource table configuration.
//!
//! The table of resource instances is loaded once, when a process first
//! initializes (or repairs) the shared segment:
//!
//! 1. the file named by `ESSRMGR_CONFIG_FILE`, if set;
//! 2. otherwise [`DEFAULT_CONFIG_PATH`];
//! 3. otherwise, or when the file yields no entries, the built-in
//!    [`Config::default_topology`].

mod parser;

pub use parser::{ResourceSpec, parse_line};

use crate::caps::{Capabilities, ResourceCaps, ResourceType};
use crate::error::{Error, Result};
use crate::state::MAX_RESOURCES;
use std::path::{Path, PathBuf};

/// Environment variable naming an override config file.
pub const CONFIG_ENV: &str = "ESSRMGR_CONFIG_FILE";

/// Config file used when [`CONFIG_ENV`] is unset.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/default/essrmgr.conf";

/// The configured resource table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Resource instances in table order.
    pub resources: Vec<ResourceSpec>,
}

impl Config {
    /// Load from the environment override, the default path, or built-in defaults.
    pub fn load() -> Self {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        match Self::from_file(&path) {
            Ok(config) if !config.resources.is_empty() => config,
            Ok(_) => {
                tracing::warn!(
                    "config {} defines no resources, using defaults",
                    path.display()
                );
                Self::default_topology()
            }
            Err(e) => {
                tracing::debug!("config {} unavailable ({}), using defaults", path.display(), e);
                Self::default_topology()
            }
        }
    }

    /// Read and parse a config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read. Bad lines are skipped.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Ok(Self::parse(&text))
    }

    /// Parse config text, warning about and skipping bad lines.
    pub fn parse(text: &str) -> Self {
        let mut resources = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            match parse_line(line) {
                Ok(Some(spec)) => {
                    if resources.len() == MAX_RESOURCES {
                        tracing::warn!(
                            "config line {}: table full ({} entries), ignoring",
                            lineno + 1,
                            MAX_RESOURCES
                        );
                        continue;
                    }
                    resources.push(spec);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("config line {}: {}", lineno + 1, e),
            }
        }
        Self { resources }
    }

    /// Built-in table: one hardware video decoder, one limited software
    /// video decoder, one audio decoder and one front-end.
    pub fn default_topology() -> Self {
        let video = |caps| ResourceSpec {
            resource_type: ResourceType::VideoDecoder,
            caps,
        };
        Self {
            resources: vec![
                video(ResourceCaps::new(Capabilities::HARDWARE)),
                video(ResourceCaps::limited(
                    Capabilities::SOFTWARE | Capabilities::LIMITED_PERFORMANCE,
                    crate::caps::DEFAULT_LIMITED_WIDTH,
                    crate::caps::DEFAULT_LIMITED_HEIGHT,
                )),
                ResourceSpec {
                    resource_type: ResourceType::AudioDecoder,
                    caps: ResourceCaps::new(Capabilities::HARDWARE),
                },
                ResourceSpec {
                    resource_type: ResourceType::FrontEnd,
                    caps: ResourceCaps::default(),
                },
            ],
        }
    }

    /// Build a table from explicit specs.
    ///
    /// # Errors
    ///
    /// Returns an error if more than [`MAX_RESOURCES`] entries are given.
    pub fn from_specs(resources: Vec<ResourceSpec>) -> Result<Self> {
        if resources.len() > MAX_RESOURCES {
            return Err(Error::Config(format!(
                "too many resources: {} > {}",
                resources.len(),
                MAX_RESOURCES
            )));
        }
        Ok(Self { resources })
    }

    /// Number of instances of one kind.
    pub fn count(&self, resource_type: ResourceType) -> usize {
        self.resources
            .iter()
            .filter(|r| r.resource_type == resource_type)
            .count()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_topology()
    }
}
