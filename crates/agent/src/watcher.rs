use std::io;
use std::path::Path;
use std::path::PathBuf;

use notify::Event;
use notify::EventKind;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::mpsc;

/// Filesystem activity observed in the kubelet plugin directory.
#[derive(Debug, Clone, PartialEq)]
pub enum FsEvent {
    Created(PathBuf),
    Error(String),
}

/// Watches the kubelet plugin directory and forwards file creation events.
///
/// The native watcher runs on its own thread; events cross into the async
/// world through an unbounded channel so the producer never blocks on the
/// supervisor.
pub struct FsWatcher {
    rx: mpsc::UnboundedReceiver<FsEvent>,
    _watcher: Option<notify::RecommendedWatcher>,
}

impl FsWatcher {
    pub fn new(dir: &Path) -> Result<Self, notify::Error> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher =
            notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Create(_)) {
                        for path in event.paths {
                            let _ = tx.send(FsEvent::Created(path));
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.send(FsEvent::Error(e.to_string()));
                }
            })?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;

        tracing::info!("watching plugin directory at: {:?}", dir);
        Ok(Self {
            rx,
            _watcher: Some(watcher),
        })
    }

    pub async fn recv(&mut self) -> Option<FsEvent> {
        self.rx.recv().await
    }

    #[cfg(test)]
    pub(crate) fn for_tests(rx: mpsc::UnboundedReceiver<FsEvent>) -> Self {
        Self { rx, _watcher: None }
    }
}

/// Discrete loop events derived from OS signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    /// SIGHUP, restart the plugins without exiting.
    Reload,
    /// A terminal signal, shut down gracefully.
    Terminate(&'static str),
}

/// Captures termination and reload signals and forwards them as loop
/// events. Signals outside the subscribed set are untouched.
pub struct SignalWatcher {
    rx: mpsc::UnboundedReceiver<SignalEvent>,
}

impl SignalWatcher {
    pub fn spawn() -> io::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut hangup = signal(SignalKind::hangup())?;
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let mut quit = signal(SignalKind::quit())?;

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = hangup.recv() => SignalEvent::Reload,
                    _ = interrupt.recv() => SignalEvent::Terminate("SIGINT"),
                    _ = terminate.recv() => SignalEvent::Terminate("SIGTERM"),
                    _ = quit.recv() => SignalEvent::Terminate("SIGQUIT"),
                };
                if tx.send(event).is_err() {
                    break;
                }
            }
        });

        Ok(Self { rx })
    }

    pub async fn recv(&mut self) -> Option<SignalEvent> {
        self.rx.recv().await
    }

    #[cfg(test)]
    pub(crate) fn for_tests(rx: mpsc::UnboundedReceiver<SignalEvent>) -> Self {
        Self { rx }
    }
}
