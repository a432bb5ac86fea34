use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use thiserror::Error;

use crate::config::Config;
use crate::config::DaemonArgs;
use crate::config::DeviceIdStrategy;
use crate::config::ResourceSpec;
use crate::config::DEFAULT_RESOURCE_NAME;
use crate::config::DEFAULT_RESOURCE_PATTERN;
use crate::device;
use crate::device::AccelDevice;
use crate::plugin::PluginHandle;
use crate::plugin::ShardPlugin;
use crate::supervisor::PluginSetFactory;

/// Errors raised while constructing the plugin set. These abort the whole
/// pass, no partial set is ever returned.
#[derive(Debug, Error)]
pub enum PluginBuildError {
    #[error("failed to initialize the accelerator driver: {source}")]
    DriverInit {
        #[source]
        source: nvml_wrapper::error::NvmlError,
    },
    #[error("failed to query accelerator devices: {source}")]
    DeviceQuery {
        #[source]
        source: nvml_wrapper::error::NvmlError,
    },
    #[error("invalid device pattern {pattern:?} for resource {resource}: {source}")]
    BadPattern {
        resource: String,
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
}

/// Derives the concrete set of per-resource plugin instances from a
/// normalized configuration.
pub struct PluginManager {
    config: Config,
    matchers: Vec<glob::Pattern>,
    plugin_dir: PathBuf,
}

impl PluginManager {
    /// Build a manager from a normalized config. Fills in the default
    /// resource matching rule and logs the effective configuration.
    pub fn new(mut config: Config, plugin_dir: PathBuf) -> Result<Self, PluginBuildError> {
        add_default_resources(&mut config);

        let mut matchers = Vec::with_capacity(config.resources.len());
        for spec in &config.resources {
            let matcher =
                glob::Pattern::new(&spec.pattern).map_err(|source| PluginBuildError::BadPattern {
                    resource: spec.name.clone(),
                    pattern: spec.pattern.clone(),
                    source,
                })?;
            matchers.push(matcher);
        }

        match serde_json::to_string_pretty(&config) {
            Ok(rendered) => tracing::info!("\nRunning with config:\n{rendered}"),
            Err(e) => tracing::warn!("failed to render effective config: {e}"),
        }

        Ok(Self {
            config,
            matchers,
            plugin_dir,
        })
    }

    /// Construct one plugin per resource family with at least one matched
    /// device. Families with no matched devices are omitted, not an error.
    pub fn build_plugins(&self, inventory: &[AccelDevice]) -> Vec<Box<dyn PluginHandle>> {
        let mut plugins: Vec<Box<dyn PluginHandle>> = Vec::new();
        let mut seen = HashSet::new();

        for (spec, matcher) in self.config.resources.iter().zip(&self.matchers) {
            let (resource_name, replicas) = self.sharing_for(&spec.name);
            if !seen.insert(resource_name.clone()) {
                tracing::warn!("duplicate resource {resource_name} in config, keeping the first entry");
                continue;
            }

            let matched: Vec<&AccelDevice> = inventory
                .iter()
                .filter(|d| matcher.matches(&d.model))
                .collect();
            if matched.is_empty() {
                tracing::info!("No devices matched resource {resource_name}");
                continue;
            }

            let ids = device_ids(&matched, self.config.plugin.device_id_strategy, replicas);
            plugins.push(Box::new(ShardPlugin::new(
                resource_name,
                ids,
                &self.plugin_dir,
                self.config.plugin.clone(),
            )));
        }

        plugins
    }

    /// The advertised name and replica count for a resource family, after
    /// applying the time-slicing policy.
    fn sharing_for(&self, name: &str) -> (String, u32) {
        for entry in &self.config.sharing.time_slicing.resources {
            if entry.name == name {
                let advertised = if entry.rename.is_empty() {
                    name.to_string()
                } else {
                    entry.rename.clone()
                };
                return (advertised, entry.replicas.max(1));
            }
        }
        (name.to_string(), 1)
    }
}

fn add_default_resources(config: &mut Config) {
    if config.resources.is_empty() {
        tracing::info!("Updating config with default resource matching patterns.");
        config.resources.push(ResourceSpec {
            name: DEFAULT_RESOURCE_NAME.to_string(),
            pattern: DEFAULT_RESOURCE_PATTERN.to_string(),
        });
    }
}

fn device_ids(devices: &[&AccelDevice], strategy: DeviceIdStrategy, replicas: u32) -> Vec<String> {
    let mut ids = Vec::new();
    for device in devices {
        let base = match strategy {
            DeviceIdStrategy::Uuid => device.uuid.clone(),
            DeviceIdStrategy::Index => device.index.to_string(),
        };
        if replicas <= 1 {
            ids.push(base);
        } else {
            for r in 0..replicas {
                ids.push(format!("{base}::{r}"));
            }
        }
    }
    ids
}

/// Builds the concrete plugin set for one supervisor pass: load the
/// configuration from scratch, enumerate devices, construct plugins.
pub struct KubeletPluginFactory {
    args: DaemonArgs,
}

impl KubeletPluginFactory {
    pub fn new(args: DaemonArgs) -> Self {
        Self { args }
    }
}

#[async_trait]
impl PluginSetFactory for KubeletPluginFactory {
    async fn build(&self) -> anyhow::Result<Vec<Box<dyn PluginHandle>>> {
        tracing::info!("Loading configuration.");
        let config = Config::load(&self.args).context("unable to load config")?;

        let driver_root = config.plugin.driver_root.clone();
        let manager = PluginManager::new(config, self.args.plugin_dir.clone())
            .context("error creating plugin manager")?;

        tracing::info!("Retrieving plugins.");
        let inventory = device::enumerate(&driver_root).context("error enumerating devices")?;

        Ok(manager.build_plugins(&inventory))
    }
}
