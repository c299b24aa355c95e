//! labrig command-line entry point.
//!
//! # Usage
//!
//! ```text
//! labrig node add gpu1 --address alice@gpu1.lab --workdir /srv/lr
//! labrig register ./experiments
//! labrig submit ./experiments/sweep.yaml --node gpu1
//! labrig status --node gpu1
//! labrig mum start
//! labrig mum experiments e1
//! ```
//!
//! `mum run` and `kid run` are the foreground loops that `start()` spawns
//! detached; they are not meant to be typed by hand.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process;

use clap::error::ErrorKind;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use labrig_core::controller::Controller;
use labrig_core::daemon::{self, DaemonContext, Entrypoint, Liveness, StopOutcome};
use labrig_core::errors::{DaemonError, RpcError};
use labrig_core::experiment::Experiment;
use labrig_core::kid::run_kid;
use labrig_core::mum::{mum_client, run_mum, ProcessKidLauncher, MUM_INSTANCE};
use labrig_core::node::runner::ShellRunner;
use labrig_core::node::{Node, NodeKind};
use labrig_core::rpc::RpcMessage;
use labrig_core::settings::{resolve_root, Settings};


/// Environment variable holding the log filter.
const LOG_ENV: &str = "LABRIG_LOG";


#[derive(Parser, Debug)]
#[command(name = "labrig", version = labrig_core::VERSION, about = "Run experiments across lab machines")]
struct Cli {
    /// Instance root (default: $LABRIG_ROOT, then ~/.labrig)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}


#[derive(Subcommand, Debug)]
enum Commands {
    /// Orchestrator on this host
    #[command(subcommand)]
    Mum(MumCommands),

    /// Worker agent (spawned by the orchestrator)
    #[command(subcommand, hide = true)]
    Kid(KidCommands),

    /// Node registry
    #[command(subcommand)]
    Node(NodeCommands),

    /// Load and validate every experiment definition in a folder
    Register { folder: PathBuf },

    /// Send an experiment to a node's orchestrator
    Submit {
        /// Experiment definition (YAML or JSON)
        file: PathBuf,
        #[arg(long)]
        node: String,
    },

    /// Experiment report from a node's orchestrator
    Status {
        #[arg(long)]
        node: String,
        /// One experiment id (default: all)
        id: Option<String>,
    },
}


#[derive(Subcommand, Debug)]
enum MumCommands {
    /// Start the orchestrator in the background
    Start {
        /// Run every experiment under `srun <ARGS>`
        #[arg(long, allow_hyphen_values = true)]
        srun_args: Option<String>,
    },
    Stop,
    Restart {
        #[arg(long, allow_hyphen_values = true)]
        srun_args: Option<String>,
    },
    Status,
    /// Remove liveness files of a dead orchestrator
    Cleanup,
    /// Run the orchestrator loop in the foreground
    Run {
        #[arg(long, default_value = MUM_INSTANCE)]
        name: String,
        #[arg(long, allow_hyphen_values = true)]
        srun_args: Option<String>,
    },
    /// Queue an experiment definition (`-` reads stdin)
    Submit { file: String },
    /// Experiments waiting for dispatch
    List,
    Experiments { id: Option<String> },
    Kill { id: String },
}


#[derive(Subcommand, Debug)]
enum KidCommands {
    Run {
        #[arg(long)]
        name: String,
    },
}


#[derive(Subcommand, Debug)]
enum NodeCommands {
    /// Add a node, replacing any node with the same id
    Add {
        id: String,
        #[arg(long)]
        address: String,
        #[arg(long)]
        workdir: String,
        #[arg(long, value_enum, default_value_t = KindArg::Unmanaged)]
        kind: KindArg,
        #[arg(long)]
        ssh_port: Option<u16>,
        /// Scheduler launcher arguments, e.g. "-p gpu -N1"
        #[arg(long, allow_hyphen_values = true)]
        scheduler_args: Option<String>,
    },
    Show { id: String },
    /// Check that the node runs a matching labrig
    Test { id: String },
    List,
}


#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum KindArg {
    Unmanaged,
    BatchScheduler,
}


impl From<KindArg> for NodeKind {
    fn from(kind: KindArg) -> NodeKind {
        match kind {
            KindArg::Unmanaged => NodeKind::Unmanaged,
            KindArg::BatchScheduler => NodeKind::BatchScheduler,
        }
    }
}


/// A failed command: message for stderr plus exit code.
struct Failure {
    code: i32,
    message: String,
}


impl Failure {
    fn new(code: i32, message: impl Into<String>) -> Failure {
        Failure {
            code,
            message: message.into(),
        }
    }
}


impl From<DaemonError> for Failure {
    fn from(e: DaemonError) -> Failure {
        Failure::new(1, e.to_string())
    }
}


impl From<RpcError> for Failure {
    fn from(e: RpcError) -> Failure {
        Failure::new(1, e.to_string())
    }
}


impl From<labrig_core::errors::ControllerError> for Failure {
    fn from(e: labrig_core::errors::ControllerError) -> Failure {
        Failure::new(e.exit_code(), e.to_string())
    }
}


impl From<labrig_core::errors::ExperimentError> for Failure {
    fn from(e: labrig_core::errors::ExperimentError) -> Failure {
        Failure::new(1, e.to_string())
    }
}


fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            process::exit(usage_exit_code(&e));
        }
    };
    init_logging();

    let root = resolve_root(cli.root.as_deref());
    let code = match execute(&root, cli.command) {
        Ok(()) => 0,
        Err(f) => {
            eprintln!("labrig: {}", f.message);
            f.code
        }
    };
    process::exit(code);
}


/// `--help` and `--version` succeed; every other parse error is a bad
/// argument and exits 1 rather than clap's default 2.
fn usage_exit_code(e: &clap::Error) -> i32 {
    match e.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
        _ => 1,
    }
}


fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .with_target(false),
        )
        .init();
}


fn execute(root: &Path, command: Commands) -> Result<(), Failure> {
    let settings = Settings::load(root).map_err(|e| Failure::new(1, e))?;
    match command {
        Commands::Mum(cmd) => execute_mum(root, settings, cmd),
        Commands::Kid(KidCommands::Run { name }) => {
            let ctx = DaemonContext::new(root, &name, settings);
            run_kid(ctx).map_err(|e| {
                error!(instance = %name, error = %e, "worker agent failed");
                Failure::from(e)
            })?;
            Ok(())
        }
        Commands::Node(cmd) => execute_node(root, cmd),
        Commands::Register { folder } => {
            let ctl = Controller::open(root, ShellRunner)?;
            for exp in ctl.register(&folder)? {
                println!("{}\t{}\t{} condition(s)", exp.id, exp.state(), exp.conditions.len());
            }
            Ok(())
        }
        Commands::Submit { file, node } => {
            let ctl = Controller::open(root, ShellRunner)?;
            let exp = read_experiment(&file.display().to_string())?;
            println!("{}", ctl.submit(&exp, &node)?);
            Ok(())
        }
        Commands::Status { node, id } => {
            let ctl = Controller::open(root, ShellRunner)?;
            println!("{}", ctl.status(&node, id.as_deref())?);
            Ok(())
        }
    }
}


fn execute_mum(root: &Path, settings: Settings, cmd: MumCommands) -> Result<(), Failure> {
    let ctx = DaemonContext::new(root, MUM_INSTANCE, settings.clone());
    match cmd {
        MumCommands::Start { srun_args } => {
            let entry = mum_entrypoint(&ctx, srun_args.as_deref())?;
            daemon::start(&ctx, &entry)?;
            println!("mum started on port {}", ctx.instance().read_port().unwrap_or(0));
            Ok(())
        }
        MumCommands::Stop => {
            match daemon::stop(&ctx)? {
                StopOutcome::NotRunning => println!("mum is not running"),
                StopOutcome::Stopped { pid } => println!("mum stopped (pid {})", pid),
                StopOutcome::ForcedCleanup { pid } => match pid {
                    Some(pid) => println!("mum forced down (pid {}), liveness files removed", pid),
                    None => println!("stale liveness files removed"),
                },
            }
            Ok(())
        }
        MumCommands::Restart { srun_args } => {
            let entry = mum_entrypoint(&ctx, srun_args.as_deref())?;
            daemon::restart(&ctx, &entry)?;
            println!("mum restarted on port {}", ctx.instance().read_port().unwrap_or(0));
            Ok(())
        }
        MumCommands::Status => {
            match daemon::status(ctx.instance()) {
                Liveness::Running { pid } => {
                    let port = ctx.instance().read_port().unwrap_or(0);
                    let alive = mum_client(root, &settings).with_trials(1).daemon_is_alive();
                    println!(
                        "mum running (pid {}, port {}){}",
                        pid,
                        port,
                        if alive { "" } else { ", not answering" }
                    );
                }
                Liveness::NotRunning => println!("mum is not running"),
                Liveness::Stale { .. } => println!("mum is dead but liveness files remain (run `labrig mum cleanup`)"),
            }
            Ok(())
        }
        MumCommands::Cleanup => {
            daemon::cleanup(ctx.instance());
            Ok(())
        }
        MumCommands::Run { name, srun_args } => {
            let ctx = DaemonContext::new(root, &name, settings.clone());
            let launcher = ProcessKidLauncher::new(root, settings, srun_wrapper(srun_args.as_deref()));
            run_mum(ctx, Box::new(launcher)).map_err(|e| {
                error!(instance = %name, error = %e, "orchestrator failed");
                Failure::from(e)
            })?;
            Ok(())
        }
        MumCommands::Submit { file } => {
            let exp = read_experiment(&file)?;
            let value = serde_json::to_value(&exp).map_err(|e| Failure::new(1, e.to_string()))?;
            let reply = mum_client(root, &settings).call_ok(&RpcMessage::new("register").kwarg("experiment", value))?;
            println!("{}", reply.msgbody.unwrap_or_default());
            Ok(())
        }
        MumCommands::List => {
            let reply = mum_client(root, &settings).call_ok(&RpcMessage::new("list"))?;
            for id in reply.get_as::<Vec<String>>("pending").unwrap_or_default() {
                println!("{}", id);
            }
            Ok(())
        }
        MumCommands::Experiments { id } => {
            let mut msg = RpcMessage::new("experiments");
            if let Some(id) = id {
                msg = msg.kwarg("id", id);
            }
            let reply = mum_client(root, &settings).call_ok(&msg)?;
            let report = reply.get("experiments").cloned().unwrap_or_default();
            let text = serde_json::to_string_pretty(&report).map_err(|e| Failure::new(1, e.to_string()))?;
            println!("{}", text);
            Ok(())
        }
        MumCommands::Kill { id } => {
            let reply = mum_client(root, &settings).call_ok(&RpcMessage::new("kill").kwarg("id", id))?;
            println!("{}", reply.msgbody.unwrap_or_default());
            Ok(())
        }
    }
}


fn execute_node(root: &Path, cmd: NodeCommands) -> Result<(), Failure> {
    let mut ctl = Controller::open(root, ShellRunner)?;
    match cmd {
        NodeCommands::Add {
            id,
            address,
            workdir,
            kind,
            ssh_port,
            scheduler_args,
        } => {
            let node = Node {
                id: id.clone(),
                kind: kind.into(),
                address,
                ssh_port,
                workdir,
                scheduler_args: split_args(scheduler_args.as_deref()),
            };
            let replaced = ctl.add_node(node)?.is_some();
            println!("{} {}", if replaced { "updated" } else { "added" }, id);
        }
        NodeCommands::Show { id } => {
            let node = ctl.describe_node(&id)?;
            let text = serde_yaml::to_string(node).map_err(|e| Failure::new(1, e.to_string()))?;
            print!("{}", text);
        }
        NodeCommands::Test { id } => {
            println!("{}", ctl.test_node(&id)?);
        }
        NodeCommands::List => {
            for node in ctl.nodes() {
                println!("{}\t{:?}\t{}\t{}", node.id, node.kind, node.address, node.workdir);
            }
        }
    }
    Ok(())
}


fn mum_entrypoint(ctx: &DaemonContext, srun_args: Option<&str>) -> Result<Entrypoint, Failure> {
    let mut extra = Vec::new();
    if let Some(args) = srun_args {
        extra.push("--srun-args".to_string());
        extra.push(args.to_string());
    }
    Entrypoint::current("mum", ctx.instance(), &extra)
        .map_err(|e| Failure::new(1, format!("cannot locate labrig binary: {}", e)))
}


/// `srun` plus its arguments, or nothing when experiments run directly.
fn srun_wrapper(srun_args: Option<&str>) -> Vec<String> {
    match srun_args {
        Some(args) => {
            let mut wrapper = vec!["srun".to_string()];
            wrapper.extend(split_args(Some(args)));
            wrapper
        }
        None => Vec::new(),
    }
}


fn split_args(args: Option<&str>) -> Vec<String> {
    args.map(|a| a.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}


/// Read one experiment definition from a file, or from stdin for `-`.
fn read_experiment(source: &str) -> Result<Experiment, Failure> {
    let (content, path) = if source == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .map_err(|e| Failure::new(1, format!("cannot read stdin: {}", e)))?;
        (buf, PathBuf::from("<stdin>"))
    } else {
        let path = PathBuf::from(source);
        let content = std::fs::read_to_string(&path)
            .map_err(|e| Failure::new(1, format!("cannot read {}: {}", path.display(), e)))?;
        (content, path)
    };
    // YAML is a superset of JSON, so one parser covers both.
    Ok(Experiment::from_yaml(&content, &path)?)
}
