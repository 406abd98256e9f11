use std::net::Ipv6Addr;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use flowmob_net::binding::Target;
use flowmob_net::config::{Role, RouterConfig};
use flowmob_net::controller::HandoverController;
use flowmob_net::engine::FlowEngine;
use flowmob_net::packet::build_flow_packet;
use flowmob_net::replay::{self, Script};
use flowmob_net::router::{DeviceId, InterfaceId};
use flowmob_net::selector::{FlowTuple, PROTO_TCP, PROTO_UDP};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Default configuration file.
const CONFIG_PATH: &str = "/etc/flowmob/router.json";

/// Flow-aware multi-interface router
#[derive(Parser, Debug)]
#[command(name = "flowmob-net", version, about)]
struct Args {
    /// Router configuration file (JSON)
    #[arg(long, default_value = CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the route table and every binding
    Dump,

    /// Route one packet and print the decision
    Select {
        /// Transport protocol (tcp or udp)
        #[arg(long, default_value = "tcp")]
        protocol: String,

        #[arg(long)]
        source: Ipv6Addr,

        #[arg(long)]
        destination: Ipv6Addr,

        #[arg(long, default_value = "0")]
        source_port: u16,

        #[arg(long, default_value = "0")]
        destination_port: u16,

        /// Restrict to one output interface (by name)
        #[arg(long)]
        interface: Option<String>,
    },

    /// Drive a timed event script through the engine
    Replay {
        /// Script file (JSON)
        script: PathBuf,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowmob_net=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let config = RouterConfig::load(&args.config)
        .with_context(|| format!("failed to load config: {}", args.config.display()))?;
    info!(name = %config.name, role = config.role.as_str(), "Router config loaded");

    match config.role {
        Role::Anchor => execute::<InterfaceId>(&config, args.command).await,
        Role::Host => execute::<DeviceId>(&config, args.command).await,
    }
}

async fn execute<T>(config: &RouterConfig, command: Command) -> Result<()>
where
    T: Target + From<u32> + Send + 'static,
{
    match command {
        Command::Dump => {
            let router = config.build::<T>(Instant::now())?;
            print!("{router}");
        }
        Command::Select {
            protocol,
            source,
            destination,
            source_port,
            destination_port,
            interface,
        } => {
            let protocol = match protocol.as_str() {
                "tcp" => PROTO_TCP,
                "udp" => PROTO_UDP,
                other => bail!("unsupported protocol '{other}' (expected tcp or udp)"),
            };
            let output_interface = match interface {
                Some(name) => Some(T::from(
                    config
                        .interface_id(&name)
                        .with_context(|| format!("unknown interface '{name}'"))?,
                )),
                None => None,
            };
            let flow = FlowTuple {
                protocol,
                source,
                destination,
                source_port,
                destination_port,
            };
            let router = config.build::<T>(Instant::now())?;
            let decision = router.route_output(&build_flow_packet(&flow), output_interface);
            println!("{flow}: {decision}");
        }
        Command::Replay { script } => {
            let script = Script::load(&script)?;
            replay_script::<T>(config, &script).await?;
        }
    }
    Ok(())
}

async fn replay_script<T>(config: &RouterConfig, script: &Script) -> Result<()>
where
    T: Target + From<u32> + Send + 'static,
{
    let router = config.build::<T>(tokio::time::Instant::now().into_std())?;
    let (mut engine, handle) = FlowEngine::new(
        router,
        HandoverController::new(config.handover_policy()),
        config.queue_depth,
    );
    if let Some(learner) = config.learner::<T>()? {
        engine = engine.with_learner(learner);
    }
    let engine_task = tokio::spawn(engine.run());

    let mut sigint = signal(SignalKind::interrupt()).context("failed to set up SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("failed to set up SIGTERM handler")?;

    tokio::select! {
        result = replay::run(&handle, config, script) => {
            for line in result? {
                println!("{line}");
            }
        }
        _ = sigint.recv() => warn!("Received SIGINT, stopping replay"),
        _ = sigterm.recv() => warn!("Received SIGTERM, stopping replay"),
    }

    drop(handle);
    let router = engine_task.await.context("flow engine task failed")?;
    info!(bindings = router.bindings().len(), "Replay finished");
    Ok(())
}
