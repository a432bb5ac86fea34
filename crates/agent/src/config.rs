use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;
use clap::Subcommand;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use utils::version;

/// Default resource family advertised when the config names none.
pub const DEFAULT_RESOURCE_NAME: &str = "tessera.io/accel";
/// Default device model pattern, matches every enumerated device.
pub const DEFAULT_RESOURCE_PATTERN: &str = "*";

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the device plugin agent
    Daemon(DaemonArgs),
    /// Show the agent version
    Version,
}

#[derive(Parser, Clone)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "CONFIG_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to a config file as an alternative to command line options or environment variables"
    )]
    pub config_file: Option<PathBuf>,

    #[arg(
        long,
        env = "DEVICE_LIST_STRATEGY",
        default_value = "envvar",
        help = "Strategy for passing the device list to the underlying runtime:\n\t\t[envvar | volume-mounts | cdi-annotations]"
    )]
    pub device_list_strategy: String,

    #[arg(
        long,
        env = "DEVICE_ID_STRATEGY",
        default_value = "uuid",
        help = "Strategy for passing device IDs to the underlying runtime:\n\t\t[uuid | index]"
    )]
    pub device_id_strategy: String,

    #[arg(
        long,
        env = "FAIL_ON_INIT_ERROR",
        default_value_t = true,
        action = clap::ArgAction::Set,
        help = "Fail the agent if an error is encountered during initialization"
    )]
    pub fail_on_init_error: bool,

    #[arg(
        long,
        env = "TESSERA_DRIVER_ROOT",
        default_value = "/",
        help = "Root path of the accelerator driver installation (typical values are '/' or '/run/tessera/driver')"
    )]
    pub driver_root: PathBuf,

    #[arg(
        long,
        env = "PASS_DEVICE_SPECS",
        default_value_t = false,
        action = clap::ArgAction::Set,
        help = "Pass the list of device specs to the kubelet on allocation"
    )]
    pub pass_device_specs: bool,

    #[arg(
        long,
        env = "KUBELET_PLUGIN_DIR",
        default_value = "/var/lib/kubelet/device-plugins",
        help = "Directory where the kubelet exposes its device plugin registration socket"
    )]
    pub plugin_dir: PathBuf,

    #[arg(
        long,
        env = "NODE_NAME",
        help = "Name of the node this agent is running on"
    )]
    pub node_name: Option<String>,

    #[arg(
        long,
        env = "TESSERA_LOG_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "Path for an additional daily rolling log file, e.g. /logs/agent.log"
    )]
    pub log_file: Option<PathBuf>,
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid --{option} option: {value}")]
    InvalidOption { option: &'static str, value: String },
    #[error("failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Strategy for passing the device list to the container runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceListStrategy {
    Envvar,
    VolumeMounts,
    CdiAnnotations,
}

impl FromStr for DeviceListStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "envvar" => Ok(Self::Envvar),
            "volume-mounts" => Ok(Self::VolumeMounts),
            "cdi-annotations" => Ok(Self::CdiAnnotations),
            other => Err(ConfigError::InvalidOption {
                option: "device-list-strategy",
                value: other.to_string(),
            }),
        }
    }
}

/// Strategy for identifying devices towards the container runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceIdStrategy {
    Uuid,
    Index,
}

impl FromStr for DeviceIdStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uuid" => Ok(Self::Uuid),
            "index" => Ok(Self::Index),
            other => Err(ConfigError::InvalidOption {
                option: "device-id-strategy",
                value: other.to_string(),
            }),
        }
    }
}

/// One named resource family and the device model pattern that feeds it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    pub name: String,
    pub pattern: String,
}

/// Selection of devices a shared resource entry applies to.
///
/// The agent only supports the all-devices selection. Subsets are reset
/// during normalization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceSelection {
    pub all: bool,
    pub count: u32,
    pub list: Option<Vec<String>>,
}

impl Default for DeviceSelection {
    fn default() -> Self {
        Self {
            all: true,
            count: 0,
            list: None,
        }
    }
}

/// One resource family entry of the time-slicing policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SharedResource {
    pub name: String,
    #[serde(default)]
    pub rename: String,
    #[serde(default)]
    pub devices: DeviceSelection,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
}

fn default_replicas() -> u32 {
    1
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeSlicing {
    pub rename_by_default: bool,
    pub resources: Vec<SharedResource>,
}

/// Policy describing how a physical device is subdivided into allocatable
/// logical units.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Sharing {
    pub time_slicing: TimeSlicing,
}

/// The policy-determined rename for a shared resource family.
pub fn default_shared_rename(name: &str) -> String {
    format!("{name}.shared")
}

/// On-disk configuration, an alternative source for the flag surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct FileConfig {
    pub device_list_strategy: Option<String>,
    pub device_id_strategy: Option<String>,
    pub fail_on_init_error: Option<bool>,
    pub driver_root: Option<PathBuf>,
    pub pass_device_specs: Option<bool>,
    pub resources: Vec<ResourceSpec>,
    pub sharing: Sharing,
}

/// Behavioural options forwarded to every plugin instance.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PluginOptions {
    pub device_list_strategy: DeviceListStrategy,
    pub device_id_strategy: DeviceIdStrategy,
    pub fail_on_init_error: bool,
    pub driver_root: PathBuf,
    pub pass_device_specs: bool,
}

/// The normalized, validated configuration tree.
///
/// Rebuilt from scratch on every restart pass, never mutated in place
/// across passes.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub plugin: PluginOptions,
    pub resources: Vec<ResourceSpec>,
    pub sharing: Sharing,
}

impl Config {
    /// Load and normalize configuration from the flag surface and the
    /// optional config file. File values take precedence, the file is an
    /// alternative way to provide the same options.
    pub fn load(args: &DaemonArgs) -> Result<Config, ConfigError> {
        let file = match &args.config_file {
            Some(path) => {
                let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                })?;
                serde_yaml::from_str::<FileConfig>(&raw).map_err(|source| ConfigError::Parse {
                    path: path.clone(),
                    source,
                })?
            }
            None => FileConfig::default(),
        };

        let device_list_strategy = file
            .device_list_strategy
            .as_deref()
            .unwrap_or(&args.device_list_strategy)
            .parse()?;
        let device_id_strategy = file
            .device_id_strategy
            .as_deref()
            .unwrap_or(&args.device_id_strategy)
            .parse()?;

        let mut config = Config {
            plugin: PluginOptions {
                device_list_strategy,
                device_id_strategy,
                fail_on_init_error: file.fail_on_init_error.unwrap_or(args.fail_on_init_error),
                driver_root: file.driver_root.unwrap_or_else(|| args.driver_root.clone()),
                pass_device_specs: file.pass_device_specs.unwrap_or(args.pass_device_specs),
            },
            resources: file.resources,
            sharing: file.sharing,
        };
        config.normalize();
        Ok(config)
    }

    /// Reset unsupported customizations to their policy defaults.
    ///
    /// Resource renaming and device subsetting are feature-gated upstream.
    /// Violations are corrected with a warning, never rejected.
    pub fn normalize(&mut self) {
        if !self.resources.is_empty() {
            tracing::warn!(
                "Customizing the 'resources' field is not yet supported in the config. Ignoring..."
            );
            self.resources.clear();
        }

        let rename_by_default = self.sharing.time_slicing.rename_by_default;
        let mut sets_non_default_rename = false;
        let mut sets_devices = false;
        for entry in &mut self.sharing.time_slicing.resources {
            let default_rename = if rename_by_default {
                default_shared_rename(&entry.name)
            } else {
                String::new()
            };
            if entry.rename != default_rename {
                sets_non_default_rename = true;
                entry.rename = default_rename;
            }
            if !entry.devices.all || entry.devices.count != 0 || entry.devices.list.is_some() {
                sets_devices = true;
                entry.devices = DeviceSelection::default();
            }
        }
        if sets_non_default_rename {
            tracing::warn!(
                "Setting the 'rename' field in sharing.timeSlicing.resources is not yet supported in the config. Ignoring..."
            );
        }
        if sets_devices {
            tracing::warn!(
                "Customizing the 'devices' field in sharing.timeSlicing.resources is not yet supported in the config. Ignoring..."
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use clap::Parser;
    use tempfile::NamedTempFile;

    use super::*;

    fn daemon_args(extra: &[&str]) -> DaemonArgs {
        let mut argv = vec!["tessera-agent"];
        argv.extend_from_slice(extra);
        DaemonArgs::parse_from(argv)
    }

    fn args_with_file(yaml: &str) -> (DaemonArgs, NamedTempFile) {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let args = daemon_args(&["--config-file", &path]);
        (args, file)
    }

    #[test]
    fn test_defaults() {
        let config = Config::load(&daemon_args(&[])).unwrap();
        assert_eq!(
            config.plugin.device_list_strategy,
            DeviceListStrategy::Envvar
        );
        assert_eq!(config.plugin.device_id_strategy, DeviceIdStrategy::Uuid);
        assert!(config.plugin.fail_on_init_error);
        assert!(!config.plugin.pass_device_specs);
        assert_eq!(config.plugin.driver_root, PathBuf::from("/"));
        assert!(config.resources.is_empty());
        assert!(config.sharing.time_slicing.resources.is_empty());
    }

    #[test]
    fn test_device_list_strategy_validation() {
        for valid in ["envvar", "volume-mounts", "cdi-annotations"] {
            let args = daemon_args(&["--device-list-strategy", valid]);
            assert!(Config::load(&args).is_ok(), "{valid} should be accepted");
        }
        for invalid in ["", "env-var", "volumeMounts", "annotations", "bogus"] {
            let args = daemon_args(&["--device-list-strategy", invalid]);
            let err = Config::load(&args).unwrap_err();
            assert!(
                matches!(
                    &err,
                    ConfigError::InvalidOption { option, .. }
                        if *option == "device-list-strategy"
                ),
                "{invalid} should be rejected, got {err}"
            );
        }
    }

    #[test]
    fn test_device_id_strategy_validation() {
        for valid in ["uuid", "index"] {
            let args = daemon_args(&["--device-id-strategy", valid]);
            assert!(Config::load(&args).is_ok(), "{valid} should be accepted");
        }
        for invalid in ["", "UUID", "name", "serial"] {
            let args = daemon_args(&["--device-id-strategy", invalid]);
            let err = Config::load(&args).unwrap_err();
            assert!(
                matches!(
                    &err,
                    ConfigError::InvalidOption { option, .. }
                        if *option == "device-id-strategy"
                ),
                "{invalid} should be rejected, got {err}"
            );
        }
    }

    #[test]
    fn test_file_overrides_flags() {
        let yaml = r#"
deviceListStrategy: volume-mounts
deviceIdStrategy: index
failOnInitError: false
"#;
        let (args, _file) = args_with_file(yaml);
        let config = Config::load(&args).unwrap();
        assert_eq!(
            config.plugin.device_list_strategy,
            DeviceListStrategy::VolumeMounts
        );
        assert_eq!(config.plugin.device_id_strategy, DeviceIdStrategy::Index);
        assert!(!config.plugin.fail_on_init_error);
    }

    #[test]
    fn test_missing_config_file_is_io_error() {
        let args = daemon_args(&["--config-file", "/nonexistent/agent.yaml"]);
        assert!(matches!(
            Config::load(&args).unwrap_err(),
            ConfigError::Io { .. }
        ));
    }

    #[test]
    fn test_malformed_config_file_is_parse_error() {
        let (args, _file) = args_with_file("deviceListStrategy: [not, a, string]");
        assert!(matches!(
            Config::load(&args).unwrap_err(),
            ConfigError::Parse { .. }
        ));
    }

    #[test]
    fn test_resource_customization_is_cleared() {
        let yaml = r#"
resources:
  - name: vendor.example/renamed
    pattern: "Tessera T4*"
"#;
        let (args, _file) = args_with_file(yaml);
        let config = Config::load(&args).unwrap();
        assert!(config.resources.is_empty());
    }

    #[test]
    fn test_sharing_policy_enforcement() {
        let yaml = r#"
sharing:
  timeSlicing:
    resources:
      - name: tessera.io/accel
        rename: tessera.io/accel-sliced
        replicas: 4
        devices:
          all: false
          count: 2
      - name: tessera.io/accel-mini
        replicas: 2
        devices:
          all: false
          list: ["ACCEL-0", "ACCEL-1"]
"#;
        let (args, _file) = args_with_file(yaml);
        let config = Config::load(&args).unwrap();
        for entry in &config.sharing.time_slicing.resources {
            assert!(entry.devices.all);
            assert_eq!(entry.devices.count, 0);
            assert_eq!(entry.devices.list, None);
            assert_eq!(entry.rename, "");
        }
        // replicas are not part of the feature gate and survive
        assert_eq!(config.sharing.time_slicing.resources[0].replicas, 4);
    }

    #[test]
    fn test_rename_by_default_resets_to_shared_suffix() {
        let yaml = r#"
sharing:
  timeSlicing:
    renameByDefault: true
    resources:
      - name: tessera.io/accel
        rename: something-else
        replicas: 2
"#;
        let (args, _file) = args_with_file(yaml);
        let config = Config::load(&args).unwrap();
        assert_eq!(
            config.sharing.time_slicing.resources[0].rename,
            "tessera.io/accel.shared"
        );
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let yaml = r#"
sharing:
  timeSlicing:
    renameByDefault: true
    resources:
      - name: tessera.io/accel
        rename: custom
        replicas: 2
        devices:
          all: false
          count: 1
"#;
        let (args, _file) = args_with_file(yaml);
        let mut config = Config::load(&args).unwrap();
        let first = config.clone();
        config.normalize();
        similar_asserts::assert_eq!(first, config);
    }
}
