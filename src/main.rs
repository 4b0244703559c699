//! nodewall - node-local iptables agent for Kubernetes Services
//!
//! # Usage
//!
//! ```bash
//! # Run the agent (configuration from the environment)
//! NODE_NAME=worker-1 RULE_EXTERNAL_CLUSTER_ENABLE=true nodewall run
//!
//! # Inspect owned chains
//! nodewall rules
//! nodewall rules --json
//!
//! # Remove every owned chain and JumpLink
//! NET_STACK=ipv4,ipv6 nodewall teardown
//! ```

use clap::{Parser, Subcommand};
use nodewall::config::{RunArgs, parse_net_stack};
use nodewall::core::iptables::{Chain, Iptables};
use nodewall::core::runner::SystemRunner;
use nodewall::k8s::KubeCluster;
use nodewall::policy::{self, ANCHORS};
use nodewall::reconciler::Reconciler;
use nodewall::runtime;
use nodewall::service::PodCidrs;
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{Level, error, info, warn};

shadow_rs::shadow!(build);

#[derive(Parser)]
#[command(name = "nodewall")]
#[command(about = "Node-local iptables policies for Kubernetes Services", long_about = None)]
#[command(version = build::PKG_VERSION)]
struct Cli {
    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true, value_name = "PATH")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent until SIGTERM / Ctrl-C
    Run(RunArgs),
    /// Print the rules of every owned chain
    Rules {
        /// Enabled address families, comma separated (ipv4, ipv6)
        #[arg(long, env = "NET_STACK", default_value = "ipv4")]
        net_stack: String,
        /// Print JSON instead of save-style lines
        #[arg(long)]
        json: bool,
    },
    /// Remove every owned chain and JumpLink
    Teardown {
        /// Enabled address families, comma separated (ipv4, ipv6)
        #[arg(long, env = "NET_STACK", default_value = "ipv4")]
        net_stack: String,
    },
}

/// One owned chain in `rules --json` output
#[derive(Serialize)]
struct ChainDump {
    chain: Chain,
    rules: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_file.as_ref());

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli.command)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// `None` for a name tracing does not know.
fn resolve_level(name: &str) -> Option<Level> {
    Level::from_str(name.trim()).ok()
}

fn init_logging(level: &str, log_file: Option<&PathBuf>) {
    let parsed = resolve_level(level);
    let builder = tracing_subscriber::fmt().with_max_level(parsed.unwrap_or(Level::INFO));

    if let Some(path) = log_file {
        match std::fs::File::create(path) {
            Ok(file) => builder.with_writer(file).with_ansi(false).init(),
            Err(e) => {
                builder.init();
                warn!("Cannot open log file {}: {e}", path.display());
            }
        }
    } else {
        builder.init();
    }

    if parsed.is_none() {
        warn!("Unknown log level {level:?}, using info");
    }
}

async fn handle_cli(command: Commands) -> nodewall::Result<()> {
    if !nix::unistd::getuid().is_root() {
        warn!("Not running as root: iptables commands will likely fail");
    }

    match command {
        Commands::Run(args) => run(args).await,
        Commands::Rules { net_stack, json } => print_rules(&net_stack, json).await,
        Commands::Teardown { net_stack } => teardown(&net_stack).await,
    }
}

async fn run(args: RunArgs) -> nodewall::Result<()> {
    info!(
        version = build::PKG_VERSION,
        commit = build::SHORT_COMMIT,
        built = build::BUILD_TIME,
        "nodewall starting"
    );

    let config = args.into_config()?;
    info!("configuration: {}", serde_json::to_string(&config)?);

    let cluster = KubeCluster::connect().await?;
    let node_cidrs = match (&config.node_name, config.needs_node()) {
        (Some(node), true) => cluster.node_pod_cidrs(node).await?,
        _ => PodCidrs::default(),
    };
    let net = config.network_settings(node_cidrs)?;
    info!(ipv4 = ?net.pod_cidr_v4, ipv6 = ?net.pod_cidr_v6, "pod CIDRs resolved");

    let ipt = Arc::new(Iptables::new(SystemRunner));
    let reconciler = Arc::new(Reconciler::new(ipt, cluster.clone(), config.clone(), net));
    reconciler.bootstrap().await?;

    runtime::run(
        reconciler,
        &config,
        cluster.service_keys(),
        runtime::shutdown_signal(),
    )
    .await;

    info!("nodewall stopped");
    Ok(())
}

async fn print_rules(net_stack: &str, json: bool) -> nodewall::Result<()> {
    let ipt = Iptables::new(SystemRunner);
    let mut dumps = Vec::new();

    for family in parse_net_stack(net_stack)? {
        for anchor in ANCHORS {
            let chain = anchor.owned_chain(family);
            if !ipt.chain_exists(&chain).await? {
                continue;
            }
            let rules = ipt.dump_chain(&chain).await?;
            dumps.push(ChainDump { chain, rules });
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&dumps)?);
    } else {
        for dump in &dumps {
            println!("# {}", dump.chain);
            for rule in &dump.rules {
                println!("{rule}");
            }
        }
    }
    Ok(())
}

async fn teardown(net_stack: &str) -> nodewall::Result<()> {
    let ipt = Iptables::new(SystemRunner);
    for family in parse_net_stack(net_stack)? {
        policy::remove_all(&ipt, family).await?;
        println!("Removed nodewall chains for {family}");
    }
    Ok(())
}
