use std::sync::Arc;

use clap::Parser;
use tracing::Level;

use jobherd::config::{ChildConfig, Config, SimulateConfig};
use jobherd::logging::{self, ForwardLayer};
use jobherd::net::registry::Registry;
use jobherd::supervisor;
use jobherd::worker;

#[derive(Parser, Debug)]
#[command(name = "jobherd")]
#[command(version)]
#[command(about = "Distributes line-oriented jobs across worker subprocesses and network peers")]
struct Args {
    /// Number of worker subprocesses to spawn
    #[arg(long, short = 'w')]
    workers: Option<usize>,

    /// Port to listen on for peers, or to connect to with --connect
    #[arg(long)]
    port: Option<u16>,

    /// Connect to a supervisor at this host and execute its jobs instead of
    /// reading standard input
    #[arg(long, requires = "port")]
    connect: Option<String>,

    /// Run the worker-child supervision loop with this ordinal (internal)
    #[arg(long, short = 'c', requires = "backchannel_fd", hide = true)]
    child: Option<usize>,

    /// Inherited back-channel descriptor number (internal)
    #[arg(long, hide = true)]
    backchannel_fd: Option<i32>,

    /// Run the simulated worker body instead of supervising
    #[arg(long)]
    simulate: bool,

    /// Whether the simulated worker may crash deliberately
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    can_die: bool,

    /// Mean simulated job duration in milliseconds
    #[arg(long, default_value_t = 1000)]
    sim_mean: u64,

    /// Standard deviation of the simulated job duration in milliseconds
    #[arg(long, default_value_t = 500)]
    sim_sd: u64,

    /// Extra capacity advertised to a supervisor, per worker
    #[arg(long, default_value_t = 2)]
    overspill_per_worker: u64,

    /// Suppress the startup banner
    #[arg(long)]
    no_banner: bool,

    /// Worker program and arguments, after `--`; defaults to this binary in
    /// --simulate mode
    #[arg(last = true)]
    exec: Vec<String>,
}

fn main() {
    let args = Args::parse();
    if !args.no_banner {
        eprintln!("jobherd {}", env!("CARGO_PKG_VERSION"));
    }

    if args.simulate {
        let config = SimulateConfig {
            mean_ms: args.sim_mean,
            sd_ms: args.sim_sd,
            can_die: args.can_die,
        };
        std::process::exit(worker::echo::run(&config));
    }

    if let (Some(ordinal), Some(backchannel_fd)) = (args.child, args.backchannel_fd) {
        let config = ChildConfig {
            ordinal,
            backchannel_fd,
            exec: default_exec(args.exec),
        };
        std::process::exit(worker::child::run(&config));
    }

    let registry = Arc::new(Registry::new());
    let netvisor = args.connect.is_some();
    logging::init(netvisor.then(|| ForwardLayer::new(registry.clone(), Level::WARN)));

    let config = Config {
        workers: args.workers.unwrap_or_else(|| Config::default().workers),
        port: args.port,
        connect: args.connect,
        overspill_per_worker: args.overspill_per_worker,
        exec: default_exec(args.exec),
        ..Config::default()
    };
    tracing::info!(
        workers = config.workers,
        port = ?config.port,
        connect = ?config.connect,
        exec = ?config.exec,
        "Starting jobherd"
    );

    let result = if netvisor {
        supervisor::run_netvisor(config, registry)
    } else {
        supervisor::run_supervisor(config, registry)
    };
    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            tracing::error!(error = %err, "Fatal error");
            eprintln!("jobherd: {err}");
            std::process::exit(1);
        }
    }
}

/// The worker program to run: whatever followed `--`, or this binary in
/// simulate mode when nothing was given.
fn default_exec(exec: Vec<String>) -> Vec<String> {
    if !exec.is_empty() {
        return exec;
    }
    let own = std::env::current_exe()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|_| "jobherd".to_string());
    vec![own, "--simulate".into(), "--no-banner".into()]
}
