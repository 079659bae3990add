use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use device_plugin::config::Cli;
use device_plugin::config::Commands;
use device_plugin::config::RunArgs;
use device_plugin::device;
use device_plugin::lifecycle::Lifecycle;
use device_plugin::server::PluginServer;
use utils::version;

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
        Commands::Run(run_args) => run(run_args).await,
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let _guard = utils::logging::init();

    tracing::info!(
        "Starting device plugin {} ({})",
        &**version::VERSION,
        version::branch()
    );

    let backend = device::open(&args).context("open device backend failed")?;
    let server = PluginServer::new(&args.socket, backend.capability)
        .map_err(|e| anyhow::anyhow!("create device plugin server failed: {e:?}"))?
        .with_dial_timeout(args.dial_timeout());

    let mut lifecycle = Lifecycle::new(server, &args.kubelet_socket, &args.resource_name);
    if let Some(period) = args.health_interval() {
        lifecycle = lifecycle.with_health_probe(backend.probe, period);
    }

    lifecycle
        .run_until_signal()
        .await
        .map_err(|e| anyhow::anyhow!("device plugin failed: {e:?}"))?;

    tracing::info!("device plugin exited");
    Ok(())
}
