use std::io;
use std::path::Path;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::PluginOptions;

#[derive(Debug, Error)]
pub enum PluginStartError {
    #[error("plugin for {resource} is already running")]
    AlreadyRunning { resource: String },
    #[error("failed to bind plugin socket {path:?}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
#[error("failed to stop plugin for {resource}: {message}")]
pub struct PluginStopError {
    pub resource: String,
    pub message: String,
}

/// Lifecycle and introspection contract of one per-resource device plugin
/// server. The supervisor owns every handle exclusively for the duration of
/// one pass.
#[async_trait]
pub trait PluginHandle: Send {
    fn resource_name(&self) -> &str;

    /// Device identifiers this plugin currently serves.
    fn devices(&self) -> &[String];

    /// Start the plugin server. Must not be called on a running handle.
    async fn start(&mut self) -> Result<(), PluginStartError>;

    /// Stop the plugin server. Safe to call on a handle that never started
    /// or whose start failed.
    async fn stop(&mut self) -> Result<(), PluginStopError>;
}

struct ServerState {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// A per-resource plugin server backed by a Unix socket in the kubelet
/// plugin directory.
pub struct ShardPlugin {
    resource_name: String,
    devices: Vec<String>,
    socket_path: PathBuf,
    options: PluginOptions,
    server: Option<ServerState>,
}

impl ShardPlugin {
    pub fn new(
        resource_name: String,
        devices: Vec<String>,
        plugin_dir: &Path,
        options: PluginOptions,
    ) -> Self {
        let socket_path = plugin_dir.join(socket_name(&resource_name));
        Self {
            resource_name,
            devices,
            socket_path,
            options,
            server: None,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

/// e.g. "tessera.io/accel" -> "tessera.io-accel.sock"
fn socket_name(resource: &str) -> String {
    format!("{}.sock", resource.replace('/', "-"))
}

#[async_trait]
impl PluginHandle for ShardPlugin {
    fn resource_name(&self) -> &str {
        &self.resource_name
    }

    fn devices(&self) -> &[String] {
        &self.devices
    }

    async fn start(&mut self) -> Result<(), PluginStartError> {
        if self.server.is_some() {
            return Err(PluginStartError::AlreadyRunning {
                resource: self.resource_name.clone(),
            });
        }

        // clean up a stale socket left behind by a previous run
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|source| PluginStartError::Bind {
                path: self.socket_path.clone(),
                source,
            })?;
        }

        let listener =
            UnixListener::bind(&self.socket_path).map_err(|source| PluginStartError::Bind {
                path: self.socket_path.clone(),
                source,
            })?;

        tracing::info!(
            "plugin server for {} listening on {:?}",
            self.resource_name,
            self.socket_path
        );
        tracing::debug!(
            resource = %self.resource_name,
            device_list_strategy = ?self.options.device_list_strategy,
            device_id_strategy = ?self.options.device_id_strategy,
            devices = self.devices.len(),
            "plugin options"
        );

        let token = CancellationToken::new();
        let accept_token = token.clone();
        let resource = self.resource_name.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_token.cancelled() => break,
                    conn = listener.accept() => match conn {
                        Ok(_) => tracing::debug!("kubelet connected to {resource} plugin"),
                        Err(e) => tracing::warn!("accept failed on {resource} plugin socket: {e}"),
                    },
                }
            }
            tracing::info!("plugin server for {resource} stopped");
        });

        self.server = Some(ServerState { token, task });
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), PluginStopError> {
        let Some(server) = self.server.take() else {
            return Ok(());
        };

        server.token.cancel();
        if let Err(e) = server.task.await {
            return Err(PluginStopError {
                resource: self.resource_name.clone(),
                message: e.to_string(),
            });
        }

        if let Err(e) = std::fs::remove_file(self.socket_path()) {
            if e.kind() != io::ErrorKind::NotFound {
                return Err(PluginStopError {
                    resource: self.resource_name.clone(),
                    message: format!("cannot remove socket {:?}: {e}", self.socket_path),
                });
            }
        }

        Ok(())
    }
}
