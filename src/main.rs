use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use crest::config::{self, ContainerConfig, DEFAULT_SPEC_FILE};
use crest::container::{ContainerId, LinuxFactory};
use crest::criu::{self as criu_backend, Criu};
use crest::logging;
use crest::restore::{RestoreParams, RestoreRequest, Restorer};
use crest::signals::HostSignals;
use std::env;
use std::path::{Path, PathBuf};
use std::process;

#[derive(Parser, Debug)]
#[command(name = "crest")]
#[command(about = "restore checkpointed OCI containers with criu", long_about = None)]
struct Cli {
    /// Container id (defaults to the name of the current directory)
    #[arg(long, global = true)]
    id: Option<String>,

    /// Directory holding container state
    #[arg(long, global = true, default_value = "/run/oci", value_name = "DIR")]
    root: PathBuf,

    /// CRIU binary to run
    #[arg(long, global = true, default_value = criu_backend::DEFAULT_BINARY, value_name = "PATH")]
    criu: PathBuf,

    /// Debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true, value_name = "FILE")]
    log: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Restore a container from a previous checkpoint
    Restore(RestoreArgs),
}

#[derive(Args, Debug)]
struct RestoreArgs {
    /// Path to the OCI runtime spec
    #[arg(default_value = DEFAULT_SPEC_FILE)]
    spec: PathBuf,

    /// Checkpoint image directory (defaults to <root>/<id>/checkpoint)
    #[arg(long, value_name = "DIR")]
    image_path: Option<PathBuf>,

    /// Directory for CRIU logs and work files
    #[arg(long, value_name = "DIR")]
    work_path: Option<PathBuf>,

    /// Restore established TCP connections
    #[arg(long)]
    tcp_established: bool,

    /// Allow external unix sockets
    #[arg(long)]
    ext_unix_sk: bool,

    /// Allow shell jobs
    #[arg(long)]
    shell_job: bool,

    /// Restore file locks
    #[arg(long)]
    file_locks: bool,
}

impl From<&RestoreArgs> for RestoreParams {
    fn from(args: &RestoreArgs) -> Self {
        RestoreParams {
            image_path: args.image_path.clone(),
            work_path: args.work_path.clone(),
            tcp_established: args.tcp_established,
            ext_unix_sk: args.ext_unix_sk,
            shell_job: args.shell_job,
            file_locks: args.file_locks,
            leave_running: false,
        }
    }
}

fn default_id() -> anyhow::Result<String> {
    let cwd = env::current_dir()?;
    cwd.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .context("cannot derive a container id from the current directory, pass --id")
}

/// Directory the spec file lives in.
fn bundle_dir(spec: &Path) -> anyhow::Result<PathBuf> {
    let dir = match spec.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok(env::current_dir()?.join(dir))
}

fn restore(cli: &Cli, args: &RestoreArgs) -> anyhow::Result<i32> {
    let id = match &cli.id {
        Some(id) => id.clone(),
        None => default_id()?,
    };
    let id = ContainerId::new(id)?;

    let spec = config::load_spec(&args.spec)?;
    let config = ContainerConfig::build(&id, &spec, &bundle_dir(&args.spec)?)?;

    let factory = LinuxFactory::new(&cli.root, Criu::new(&cli.criu));
    log::debug!(
        "Restoring {} under {} with {}",
        id,
        factory.root().display(),
        cli.criu.display()
    );

    let request = RestoreRequest {
        id,
        root: cli.root.clone(),
        config,
        params: RestoreParams::from(args),
    };
    let restorer = Restorer::new(&factory, &HostSignals, log::logger());
    let code = restorer.restore(&request).map_err(|e| {
        log::debug!("Restore failed ({:?})", e.kind());
        e
    })?;
    Ok(code)
}

fn run() -> anyhow::Result<i32> {
    let cli = Cli::parse();
    logging::init(cli.debug, cli.log.as_deref())?;

    match &cli.command {
        Command::Restore(args) => restore(&cli, args),
    }
}

fn main() {
    match run() {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("crest: {:#}", e);
            process::exit(1);
        }
    }
}
