use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use tokio::process::Command as Process;
use tokio::sync::mpsc::UnboundedReceiver;

use raftctl::config::DaemonConfig;
use raftctl::control::{self, Command as ControlCommand};
use raftctl::raft::{Raft, Subscribers, Transition};

/// Size limits for the daemon log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rotation {
    max_bytes: u64,
    /// Rotated copies kept next to the live file (`<path>.1` is the newest).
    keep: u32,
}

impl Rotation {
    /// `RAFTCTL_LOG_MAX_SIZE_MB` (default 10) and `RAFTCTL_LOG_MAX_FILES` (default 3).
    fn from_env() -> Self {
        fn var<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|v| v.parse().ok())
        }
        Self {
            max_bytes: var::<u64>("RAFTCTL_LOG_MAX_SIZE_MB").unwrap_or(10) * 1024 * 1024,
            keep: var("RAFTCTL_LOG_MAX_FILES").unwrap_or(3),
        }
    }
}

/// Append-only log target that moves itself aside once a write would take
/// it past `max_bytes`. A single write is never split across files.
struct LogFile {
    path: PathBuf,
    rotation: Rotation,
    file: File,
    written: u64,
}

impl LogFile {
    fn open(path: PathBuf, rotation: Rotation) -> io::Result<Self> {
        let file = append_to(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            rotation,
            file,
            written,
        })
    }

    fn backup(&self, n: u32) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{n}"));
        name.into()
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        if self.rotation.keep == 0 {
            self.file = OpenOptions::new()
                .write(true)
                .truncate(true)
                .open(&self.path)?;
        } else {
            for n in (1..self.rotation.keep).rev() {
                let older = self.backup(n);
                if older.exists() {
                    fs::rename(older, self.backup(n + 1))?;
                }
            }
            fs::rename(&self.path, self.backup(1))?;
            self.file = append_to(&self.path)?;
        }
        self.written = 0;
        Ok(())
    }
}

fn append_to(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl Write for LogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.rotation.max_bytes {
            self.rotate()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// `RUST_LOG` filters as usual (default `info`). A log file from the config,
/// or `RAFTCTL_LOG_FILE`, redirects output to a size-rotated file. Lines are
/// prefixed with the node address when one is known.
fn init_logging(identifier: Option<&str>, log_file: Option<&str>) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));

    if let Some(identifier) = identifier {
        let identifier = identifier.to_string();
        builder.format(move |buf, record| {
            writeln!(
                buf,
                "[{identifier}] {} {:<5} {} - {}",
                buf.timestamp_millis(),
                record.level(),
                record.target(),
                record.args()
            )
        });
    }

    let path = std::env::var("RAFTCTL_LOG_FILE")
        .ok()
        .or_else(|| log_file.map(str::to_string));
    if let Some(path) = path {
        match LogFile::open(PathBuf::from(&path), Rotation::from_env()) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Cannot open log file {path}: {e}; logging to stderr"),
        }
    }

    let _ = builder.try_init();
}

#[derive(Parser)]
#[command(name = "raftctl")]
#[command(about = "Leader-election daemon built on a simplified Raft protocol")]
struct Cli {
    /// Path to the config file
    #[arg(short, long, global = true, default_value = "/etc/raftctl/config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a node from the configuration file
    Start,

    /// Print the state of the running node
    State,

    /// Tell the running node to join a cluster through any member at <address>
    Join {
        /// Address of any cluster member, e.g. tcp://127.0.0.1:8089
        address: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = DaemonConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Command::Start => run_daemon(config).await,
        Command::State => {
            init_logging(None, None);
            print_reply(&config, &ControlCommand::State).await
        }
        Command::Join { address } => {
            init_logging(None, None);
            print_reply(&config, &ControlCommand::Join { address }).await
        }
    }
}

async fn print_reply(config: &DaemonConfig, command: &ControlCommand) -> Result<()> {
    let reply = control::send_command(config.command_port, command, Duration::from_secs(5))
        .await
        .context("Error connecting to daemon. Is it running?")?;
    println!("{reply}");
    Ok(())
}

async fn run_daemon(config: DaemonConfig) -> Result<()> {
    init_logging(Some(&config.address), config.log_file.as_deref());
    info!("--- Starting daemon for {} ---", config.address);

    let raft_config = config.to_raft_config()?;
    let mut subscribers = Subscribers::new();
    let transitions = subscribers.on_transition(None);
    let raft = Raft::start_with(raft_config, subscribers)
        .await
        .context("starting node")?;
    info!("Raft node listening at {}", raft.address());

    let listener = control::bind(config.command_port)
        .await
        .with_context(|| format!("binding command port {}", config.command_port))?;
    let commands = tokio::spawn(control::serve(listener, raft.clone()));
    let scripts = tokio::spawn(run_event_scripts(config.clone(), transitions));

    let mut failures = raft.failures().await?;
    tokio::spawn(async move {
        while let Some(failure) = failures.recv().await {
            error!("Node failure: {failure:?}");
        }
    });

    if !config.cluster_nodes.is_empty() {
        info!("Attempting to join cluster nodes...");
    }
    for node in config
        .cluster_nodes
        .iter()
        .filter(|node| !is_same_node(node, raft.address()))
    {
        let raft = raft.clone();
        let node = node.clone();
        tokio::spawn(async move {
            if let Err(e) = raft.discover_and_join(&node).await {
                warn!("Could not join via {node}: {e}");
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    commands.abort();
    scripts.abort();
    raft.shutdown().await?;
    Ok(())
}

fn is_same_node(node: &str, own: &str) -> bool {
    let normalise = |a: &str| raftctl::network::socket_address(a).ok();
    match (normalise(node), normalise(own)) {
        (Some(a), Some(b)) => a == b,
        _ => node == own,
    }
}

async fn run_event_scripts(config: DaemonConfig, mut transitions: UnboundedReceiver<Transition>) {
    while let Some(transition) = transitions.recv().await {
        for (event, script) in config.scripts_for(transition.to) {
            info!("[Event: {event}] Executing script: {script}");
            match Process::new(script).spawn() {
                Ok(mut child) => {
                    let script = script.to_string();
                    tokio::spawn(async move {
                        match child.wait().await {
                            Ok(status) if !status.success() => {
                                warn!("Script {script} exited with {status}")
                            }
                            Ok(_) => {}
                            Err(e) => warn!("Script {script} failed: {e}"),
                        }
                    });
                }
                Err(e) => error!("Failed to run {script}: {e}"),
            }
        }
    }
}
