mod config;
mod device;
mod manager;
mod plugin;
mod supervisor;
mod watcher;

use anyhow::Result;
use clap::Parser;
use utils::version;

use crate::config::Cli;
use crate::config::Commands;
use crate::config::DaemonArgs;
use crate::manager::KubeletPluginFactory;
use crate::supervisor::Supervisor;
use crate::watcher::FsWatcher;
use crate::watcher::SignalWatcher;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(daemon_args).await,
        Commands::Version => {
            println!("tessera-agent version: {}", &**version::VERSION);
            Ok(())
        }
    }
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    let _guard = utils::logging::init(daemon_args.log_file.clone());

    tracing::info!("Starting tessera agent {}", &**version::VERSION);
    if let Some(node_name) = &daemon_args.node_name {
        tracing::info!("Working on node {}", node_name);
    }

    tracing::info!("Starting FS watcher on {:?}", daemon_args.plugin_dir);
    let fs_watcher = FsWatcher::new(&daemon_args.plugin_dir)?;

    tracing::info!("Starting OS signal watcher.");
    let signal_watcher = SignalWatcher::spawn()?;

    let factory = KubeletPluginFactory::new(daemon_args.clone());
    let supervisor = Supervisor::new(factory, fs_watcher, signal_watcher);

    if let Err(e) = supervisor.run().await {
        tracing::error!("agent failed: {e:#}");
        return Err(e);
    }

    Ok(())
}
