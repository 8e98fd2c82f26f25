use clap::{ArgAction, Parser};
use dblayer::config::{self, Config};
use dblayer::core::db::{ConnectionContext, ConnectionHandle, DriverRegistry};
use dblayer::core::DbError;
use dblayer::migrate::{StepOutcome, StepReport};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, Level};

/// Brings database schema modules up to their latest version.
#[derive(Parser, Debug)]
#[command(name = "dbsetup", version, about)]
struct Args {
    /// Setup configuration file (default: <config dir>/dblayer/setup.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Connection URI, overrides `database.uri`
    #[arg(long)]
    uri: Option<String>,

    /// Module to set up; repeat for several. Defaults to all modules.
    #[arg(short, long = "module")]
    modules: Vec<String>,

    /// Print stored and latest versions instead of migrating
    #[arg(long)]
    status: bool,

    /// More log output; repeat for debug
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Only report errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

/// Initialize the tracing subscriber for logging.
fn init_tracing(args: &Args) {
    let level = match (args.quiet, args.verbose) {
        (true, _) => Level::ERROR,
        (false, 0) => Level::WARN,
        (false, 1) => Level::INFO,
        _ => Level::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn load(args: &Args) -> Result<Config, DbError> {
    match &args.config {
        Some(path) => config::load_config(path),
        None => match config::default_config_path() {
            Some(path) if path.exists() => config::load_config(path),
            _ => Ok(Config::default()),
        },
    }
}

fn print_step(report: &StepReport) {
    let note = match report.outcome {
        StepOutcome::Applied => report.comment.clone().unwrap_or_default(),
        StepOutcome::AlreadyApplied => "already applied".to_string(),
    };
    println!(
        "{}: {} -> {} ({} ms) {}",
        report.module,
        report.from,
        report.to,
        report.elapsed.as_millis(),
        note
    );
}

fn run(args: &Args) -> Result<(), DbError> {
    let config = load(args)?;
    let uri = args
        .uri
        .clone()
        .or_else(|| config.database.uri.clone())
        .ok_or_else(|| DbError::Config("no database URI: pass --uri or set database.uri".to_string()))?;

    let mut runner = config.build_runner()?;
    if !args.quiet {
        runner = runner.on_step(print_step);
    }

    let registry = DriverRegistry::with_defaults();
    let mut handle = ConnectionHandle::open(&uri, ConnectionContext::Batch, &registry)?;
    info!("Connected to {}", handle.params().masked());

    if args.status {
        let stored = runner.status(&mut handle)?;
        for (id, latest) in runner.modules() {
            let version = stored
                .iter()
                .find(|v| v.module == id)
                .map_or(0, |v| v.version);
            println!("{}: {}/{}", id, version, latest);
        }
        return Ok(());
    }

    let versions = if args.modules.is_empty() {
        runner.setup_all(&mut handle)?
    } else {
        let ids: Vec<&str> = args.modules.iter().map(String::as_str).collect();
        runner.setup_modules(&mut handle, &ids)?
    };
    info!(modules = versions.len(), "Setup complete");
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&args);

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match &err {
                DbError::Migration { module, from, to, source } => {
                    eprintln!("{}: migration {} -> {} failed: {}", module, from, to, source);
                }
                other => eprintln!("dbsetup: {}", other),
            }
            error!("Setup aborted: {}", err);
            match err {
                DbError::Config(_) | DbError::UnknownModule(_) | DbError::DependencyCycle(_) => {
                    ExitCode::from(2)
                }
                _ => ExitCode::FAILURE,
            }
        }
    }
}
