use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::Instant;

use crate::plugin::PluginHandle;
use crate::plugin::PluginStopError;
use crate::watcher::FsEvent;
use crate::watcher::FsWatcher;
use crate::watcher::SignalEvent;
use crate::watcher::SignalWatcher;

/// Fixed delay before retrying a degraded pass.
pub const RESTART_DELAY: Duration = Duration::from_secs(30);

/// Filename of the kubelet registration socket inside the plugin directory.
/// Its re-creation means the kubelet restarted.
pub const KUBELET_SOCKET: &str = "kubelet.sock";

/// Produces a fresh plugin set for one supervisor pass.
///
/// Invoked once per pass so configuration is rebuilt from scratch on every
/// restart. A build error leaves no safe degraded state and is fatal.
#[async_trait]
pub trait PluginSetFactory: Send {
    async fn build(&self) -> Result<Vec<Box<dyn PluginHandle>>>;
}

enum SupervisorState {
    StartPass,
    Waiting,
    Exiting,
}

/// The plugin lifecycle supervisor.
///
/// Owns the running plugin handles and keeps them consistent with the
/// kubelet by re-running a full load-config/build/start pass whenever the
/// kubelet restarts, a reload signal arrives, or a degraded pass is due for
/// retry. All mutable state lives on this single task.
pub struct Supervisor<F: PluginSetFactory> {
    factory: F,
    fs_watcher: FsWatcher,
    signal_watcher: SignalWatcher,
    plugins: Vec<Box<dyn PluginHandle>>,
    restarting: bool,
    retry_at: Option<Instant>,
}

impl<F: PluginSetFactory> Supervisor<F> {
    pub fn new(factory: F, fs_watcher: FsWatcher, signal_watcher: SignalWatcher) -> Self {
        Self {
            factory,
            fs_watcher,
            signal_watcher,
            plugins: Vec::new(),
            restarting: false,
            retry_at: None,
        }
    }

    /// Run the supervisor until a terminal signal or a fatal construction
    /// error.
    pub async fn run(mut self) -> Result<()> {
        let mut state = SupervisorState::StartPass;
        loop {
            state = match state {
                SupervisorState::StartPass => self.start_pass().await?,
                SupervisorState::Waiting => self.wait_for_event().await,
                SupervisorState::Exiting => break,
            };
        }

        let errors = self.stop_plugins().await;
        report_stop_errors("error stopping plugins", &errors);
        Ok(())
    }

    /// One full pass: stop the previous generation, rebuild the plugin set,
    /// start every plugin that has devices to serve.
    async fn start_pass(&mut self) -> Result<SupervisorState> {
        if self.restarting {
            // Stop failures are reported but never block a new start.
            let errors = self.stop_plugins().await;
            report_stop_errors("error stopping plugins from previous pass", &errors);
        }

        tracing::info!("Starting plugins.");
        let mut plugins = self.factory.build().await?;

        let mut started = 0;
        let mut failed = None;
        for (i, plugin) in plugins.iter_mut().enumerate() {
            if plugin.devices().is_empty() {
                continue;
            }
            if let Err(e) = plugin.start().await {
                tracing::error!("Failed to start plugin for {}: {e}", plugin.resource_name());
                failed = Some(i);
                break;
            }
            started += 1;
        }

        match failed {
            Some(i) => {
                // Keep the handles this pass touched so the retry pass can
                // stop them cleanly; the rest were never started.
                plugins.truncate(i + 1);
                self.plugins = plugins;
                tracing::info!(
                    "Failed to start one or more plugins. Retrying in {}s...",
                    RESTART_DELAY.as_secs()
                );
                self.retry_at = Some(Instant::now() + RESTART_DELAY);
            }
            None => {
                self.plugins = plugins;
                self.retry_at = None;
                if started == 0 {
                    tracing::info!("No devices found. Waiting indefinitely.");
                }
            }
        }

        self.restarting = true;
        Ok(SupervisorState::Waiting)
    }

    /// Block until an event warrants a new pass or shutdown.
    async fn wait_for_event(&mut self) -> SupervisorState {
        loop {
            tokio::select! {
                _ = retry_timer(self.retry_at) => {
                    tracing::info!("Retry timer expired, restarting plugins.");
                    self.retry_at = None;
                    return SupervisorState::StartPass;
                }

                event = self.fs_watcher.recv() => match event {
                    Some(FsEvent::Created(path))
                        if path.file_name().is_some_and(|f| f == KUBELET_SOCKET) =>
                    {
                        tracing::info!("inotify: {KUBELET_SOCKET} created, restarting.");
                        return SupervisorState::StartPass;
                    }
                    Some(FsEvent::Created(_)) => {}
                    Some(FsEvent::Error(message)) => tracing::error!("inotify: {message}"),
                    None => {
                        tracing::error!("filesystem watcher closed unexpectedly, shutting down.");
                        return SupervisorState::Exiting;
                    }
                },

                signal = self.signal_watcher.recv() => match signal {
                    Some(SignalEvent::Reload) => {
                        tracing::info!("Received SIGHUP, restarting.");
                        return SupervisorState::StartPass;
                    }
                    Some(SignalEvent::Terminate(name)) => {
                        tracing::info!("Received signal {name}, shutting down.");
                        return SupervisorState::Exiting;
                    }
                    None => {
                        tracing::error!("signal watcher closed unexpectedly, shutting down.");
                        return SupervisorState::Exiting;
                    }
                },
            }
        }
    }

    /// Stop every owned handle, collecting failures instead of aborting.
    async fn stop_plugins(&mut self) -> Vec<PluginStopError> {
        tracing::info!("Stopping plugins.");
        let mut errors = Vec::new();
        for plugin in self.plugins.iter_mut() {
            if let Err(e) = plugin.stop().await {
                errors.push(e);
            }
        }
        self.plugins.clear();
        errors
    }
}

async fn retry_timer(at: Option<Instant>) {
    match at {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn report_stop_errors(context: &str, errors: &[PluginStopError]) {
    if errors.is_empty() {
        return;
    }
    let joined = errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    tracing::warn!("{context}: {joined}");
}
