use std::path::{Path, PathBuf};
use std::process::{Command as ProcessCommand, ExitCode};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::runtime::Runtime;
use tracing::info;

use crate::classify::{self, ArchMapping};
use crate::config::{self, CONFIG_FILE_NAME, ProjectConfig};
use crate::readiness::CancellationToken;
use crate::registry::{InstanceInfo, Registry};
use crate::state::{self, InstanceRecord, StopOutcome};

const COMMAND_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "ephemeral-mysql")]
#[command(about = "Ephemeral MySQL instances for build and test pipelines", version)]
pub struct Cli {
    /// Project file with instance defaults.
    #[arg(long, global = true, default_value = CONFIG_FILE_NAME)]
    config: PathBuf,
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,
    #[arg(short, long, global = true)]
    quiet: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Run(RunArgs),
    Stop(StopArgs),
    Status(StatusArgs),
    Classify(ClassifyArgs),
}

#[derive(Args, Clone, Debug, Default)]
struct InstanceArgs {
    #[arg(long)]
    port: Option<u16>,
    /// Unpacked MySQL distribution.
    #[arg(long)]
    dist: Option<PathBuf>,
    /// Directory holding data, logs, socket and pid file.
    #[arg(long)]
    data: Option<PathBuf>,
    #[arg(long)]
    user: Option<String>,
    #[arg(long)]
    password: Option<String>,
    #[arg(long)]
    dbname: Option<String>,
    #[arg(long)]
    socket: Option<PathBuf>,
    /// Wipe the data directory even if it holds a database.
    #[arg(long, conflicts_with = "keep_data")]
    erase: bool,
    /// Reuse an existing database in the data directory.
    #[arg(long)]
    keep_data: bool,
    /// Extra server flag without the leading `--`; repeatable.
    #[arg(long = "option", value_name = "FLAG")]
    options: Vec<String>,
    #[arg(long)]
    startup_timeout_secs: Option<u64>,
}

#[derive(Parser)]
#[command(
    about = "Start an instance and keep it up until Ctrl+C or until COMMAND exits.",
    after_help = "COMMAND receives MYSQL_PORT, MYSQL_USER, MYSQL_PASSWORD, MYSQL_DATABASE,\nMYSQL_SOCKET and EPHEMERAL_MYSQL_REUSED in its environment."
)]
struct RunArgs {
    #[command(flatten)]
    instance: InstanceArgs,
    #[arg(long)]
    skip: bool,
    #[arg(last = true, value_name = "COMMAND")]
    command: Vec<String>,
}

#[derive(Parser)]
#[command(about = "Stop the instance recorded in the data directory.")]
struct StopArgs {
    #[command(flatten)]
    instance: InstanceArgs,
}

#[derive(Parser)]
#[command(about = "Show the instance recorded in the data directory.")]
struct StatusArgs {
    #[command(flatten)]
    instance: InstanceArgs,
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
#[command(about = "Print the platform classifier (<os>-<arch>).")]
struct ClassifyArgs {
    /// Architecture rename as `from->to`; repeatable.
    #[arg(long = "mapping", default_value = classify::DEFAULT_MAPPING)]
    mappings: Vec<String>,
}

impl Cli {
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::WARN
        } else {
            tracing::Level::INFO
        }
    }

    pub fn run(self) -> anyhow::Result<ExitCode> {
        match self.command {
            Command::Run(args) => run_instance(&self.config, args),
            Command::Stop(args) => {
                let project = load_project(&self.config, &args.instance)?;
                let timeout = project.registry_settings().stop_timeout;
                match state::stop_recorded(&project.data, timeout)? {
                    StopOutcome::Stopped => println!("Stopped MySQL in {}", project.data.display()),
                    StopOutcome::NotRunning => {
                        println!("No running MySQL recorded in {}", project.data.display())
                    }
                }
                Ok(ExitCode::SUCCESS)
            }
            Command::Status(args) => {
                let project = load_project(&self.config, &args.instance)?;
                print_status(&project.data, args.json)?;
                Ok(ExitCode::SUCCESS)
            }
            Command::Classify(args) => {
                let mappings = args
                    .mappings
                    .iter()
                    .map(|value| ArchMapping::parse(value))
                    .collect::<anyhow::Result<Vec<_>>>()?;
                println!("{}", classify::host_classifier(&mappings));
                Ok(ExitCode::SUCCESS)
            }
        }
    }
}

fn load_project(config_path: &Path, overrides: &InstanceArgs) -> anyhow::Result<ProjectConfig> {
    let root = std::env::current_dir()?;
    let mut project = config::load_project_config(config_path)
        .with_context(|| format!("unable to read {}", config_path.display()))?
        .unwrap_or_default();
    apply_overrides(&mut project, overrides);
    project.resolve_paths(&root);
    Ok(project)
}

fn apply_overrides(project: &mut ProjectConfig, overrides: &InstanceArgs) {
    if let Some(port) = overrides.port {
        project.port = port;
    }
    if let Some(dist) = &overrides.dist {
        project.dist = dist.clone();
    }
    if let Some(data) = &overrides.data {
        project.data = data.clone();
    }
    if let Some(user) = &overrides.user {
        project.user = user.clone();
    }
    if let Some(password) = &overrides.password {
        project.password = password.clone();
    }
    if let Some(dbname) = &overrides.dbname {
        project.dbname = dbname.clone();
    }
    if let Some(socket) = &overrides.socket {
        project.socket = Some(socket.clone());
    }
    if overrides.erase {
        project.erase = true;
    }
    if overrides.keep_data {
        project.erase = false;
    }
    if !overrides.options.is_empty() {
        project.options = overrides.options.clone();
    }
    if let Some(secs) = overrides.startup_timeout_secs {
        project.startup_timeout_secs = Some(secs);
    }
}

fn run_instance(config_path: &Path, args: RunArgs) -> anyhow::Result<ExitCode> {
    let mut project = load_project(config_path, &args.instance)?;
    project.skip |= args.skip;
    if project.skip {
        info!("execution skipped because of 'skip' option");
        return Ok(ExitCode::SUCCESS);
    }
    let instance = project.instance_config()?;
    let token = CancellationToken::new();
    let interrupts = spawn_signal_listener(token.clone())?;
    let registry = Registry::new(project.registry_settings()).with_cancellation(token);

    let info = registry
        .start(
            &instance,
            &project.dist,
            &project.data,
            project.erase,
            project.socket.as_deref(),
        )
        .context("failed to start MySQL server")?;
    state::write_record(&info.target, &InstanceRecord::from(&info))?;
    println!("MySQL is up and running on port {}", info.port);
    println!(
        "User: {}, password: {}, database: {}",
        instance.user(),
        instance.password(),
        instance.database()
    );
    println!("Reused existing database: {}", registry.reused_existing_database());

    let outcome = if args.command.is_empty() {
        println!("Press Ctrl+C to stop...");
        let _ = interrupts.recv();
        Ok(ExitCode::SUCCESS)
    } else {
        run_command(&args.command, &info, &project, &interrupts)
    };

    registry.stop(info.port);
    state::remove_record(&info.target)?;
    outcome
}

fn run_command(
    command: &[String],
    info: &InstanceInfo,
    project: &ProjectConfig,
    interrupts: &mpsc::Receiver<Shutdown>,
) -> anyhow::Result<ExitCode> {
    let mut child = ProcessCommand::new(&command[0])
        .args(&command[1..])
        .envs(command_env(info, project))
        .spawn()
        .with_context(|| format!("failed to run {}", command[0]))?;
    loop {
        if let Some(status) = child.try_wait()? {
            info!("{} exited with {status}", command[0]);
            let code = status.code().unwrap_or(1);
            return Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)));
        }
        if let Ok(signal) = interrupts.try_recv() {
            info!("stopping {} after {signal:?}", command[0]);
            let timeout = project.registry_settings().stop_timeout;
            state::terminate_process(child.id(), timeout)?;
            child.wait()?;
            return Ok(ExitCode::from(signal.exit_code()));
        }
        thread::sleep(COMMAND_POLL_INTERVAL);
    }
}

fn command_env(info: &InstanceInfo, project: &ProjectConfig) -> Vec<(&'static str, String)> {
    vec![
        ("MYSQL_PORT", info.port.to_string()),
        ("MYSQL_USER", project.user.clone()),
        ("MYSQL_PASSWORD", project.password.clone()),
        ("MYSQL_DATABASE", project.dbname.clone()),
        ("MYSQL_SOCKET", info.socket.display().to_string()),
        ("EPHEMERAL_MYSQL_REUSED", info.reused.to_string()),
    ]
}

/// Signal that ends a `run`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Shutdown {
    Interrupt,
    Terminate,
    Hangup,
}

impl Shutdown {
    /// Shell convention: 128 plus the signal number.
    fn exit_code(self) -> u8 {
        match self {
            Shutdown::Interrupt => 130,
            Shutdown::Terminate => 143,
            Shutdown::Hangup => 129,
        }
    }
}

/// Cancels `token` and notifies the returned channel on Ctrl+C, and on
/// SIGTERM or SIGHUP under unix.
///
/// Handlers are installed before this returns so a signal arriving during
/// `start` is never handled by the default action.
fn spawn_signal_listener(token: CancellationToken) -> anyhow::Result<mpsc::Receiver<Shutdown>> {
    let (sender, receiver) = mpsc::channel();
    let runtime = Runtime::new().context("failed to create tokio runtime for signal handling")?;
    let signals = {
        let _guard = runtime.enter();
        ShutdownSignals::install()?
    };
    thread::Builder::new()
        .name("signal-listener".to_string())
        .spawn(move || {
            if let Some(signal) = runtime.block_on(signals.recv()) {
                info!("{signal:?} received, shutting down");
                token.cancel();
                let _ = sender.send(signal);
            }
        })
        .context("failed to spawn signal listener thread")?;
    Ok(receiver)
}

#[cfg(unix)]
struct ShutdownSignals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ShutdownSignals {
    fn install() -> anyhow::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?,
            terminate: signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?,
            hangup: signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?,
        })
    }

    async fn recv(mut self) -> Option<Shutdown> {
        tokio::select! {
            Some(()) = self.interrupt.recv() => Some(Shutdown::Interrupt),
            Some(()) = self.terminate.recv() => Some(Shutdown::Terminate),
            Some(()) = self.hangup.recv() => Some(Shutdown::Hangup),
            else => None,
        }
    }
}

#[cfg(not(unix))]
struct ShutdownSignals;

#[cfg(not(unix))]
impl ShutdownSignals {
    fn install() -> anyhow::Result<Self> {
        Ok(Self)
    }

    async fn recv(self) -> Option<Shutdown> {
        tokio::signal::ctrl_c().await.ok().map(|()| Shutdown::Interrupt)
    }
}

fn print_status(data: &Path, json: bool) -> anyhow::Result<()> {
    let Some(record) = state::read_record(data)? else {
        println!("No MySQL instance recorded in {}", data.display());
        return Ok(());
    };
    let running = state::is_running(record.pid);
    if json {
        let mut value = serde_json::to_value(&record)?;
        value["running"] = serde_json::Value::Bool(running);
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }
    println!("port:       {}", record.port);
    println!("pid:        {} ({})", record.pid, if running { "running" } else { "not running" });
    println!("started at: {}", record.started_at.to_rfc3339());
    println!("reused:     {}", record.reused);
    println!("socket:     {}", record.socket.display());
    println!("data dir:   {}", record.data_dir.display());
    Ok(())
}
