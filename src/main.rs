//! WesRunner CLI Entry Point
//!
//! Runs a single workflow submission through the service core and waits
//! for it to finish.
//!
//! # Usage
//!
//! ```bash
//! # Submit a run request with default settings
//! wesrunner request.json
//!
//! # With a configuration file
//! wesrunner --config wes.yaml request.json
//!
//! # Keep run documents across invocations
//! wesrunner --snapshot runs.json request.json
//! ```
//!
//! Pressing Ctrl-C once cancels the run; the CLI keeps waiting until the
//! cancellation has finished.

use std::env;
use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use log::{error, info, warn};
use serde_json::Value;

use wesrunner::config::ServiceConfig;
use wesrunner::run::Requester;
use wesrunner::store::{MemoryRunStore, RunStore};
use wesrunner::tes::HttpTesClient;
use wesrunner::{State, WesService, APP_NAME, VERSION};

/// Interval between status checks while waiting for a run.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default)]
struct CliArgs {
    request_path: Option<PathBuf>,
    config_path: Option<PathBuf>,
    snapshot_path: Option<PathBuf>,
    user: Option<String>,
    verbose: bool,
}

/// Compact log lines with a wall-clock prefix; levels are shown only for
/// warnings and errors.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            let time = chrono::Local::now().format("%H:%M:%S");
            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "{} [{}] {}", time, record.level(), record.args())
                }
                _ => writeln!(buf, "{} {}", time, record.args()),
            }
        })
        .init();
}

fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Workflow Execution Service");
    println!();
}

fn print_usage() {
    println!("Usage: wesrunner [OPTIONS] <REQUEST_JSON>");
    println!();
    println!("Arguments:");
    println!("  <REQUEST_JSON>      Path to a workflow run request (JSON)");
    println!();
    println!("Options:");
    println!("  --config FILE       Service configuration (YAML)");
    println!("  --snapshot FILE     Persist run documents to a JSON snapshot");
    println!("  --user NAME         Submit as this user");
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  wesrunner request.json");
    println!("  wesrunner --config wes.yaml --verbose request.json");
}

/// Parses command-line arguments.
fn parse_arguments(args: &[String]) -> Result<CliArgs, String> {
    let mut cli = CliArgs::default();
    let mut i = 1;

    let value_of = |i: &mut usize, flag: &str| -> Result<String, String> {
        *i += 1;
        args.get(*i)
            .cloned()
            .ok_or_else(|| format!("{} requires an argument", flag))
    };

    while i < args.len() {
        let arg = args[i].as_str();

        match arg {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => cli.verbose = true,
            "--config" => cli.config_path = Some(PathBuf::from(value_of(&mut i, arg)?)),
            "--snapshot" => cli.snapshot_path = Some(PathBuf::from(value_of(&mut i, arg)?)),
            "--user" => cli.user = Some(value_of(&mut i, arg)?),
            _ if arg.starts_with('-') => return Err(format!("Unknown option: {}", arg)),
            _ if cli.request_path.is_none() => cli.request_path = Some(PathBuf::from(arg)),
            _ => return Err(format!("Unexpected argument: {}", arg)),
        }
        i += 1;
    }

    Ok(cli)
}

fn colored_state(state: State) -> String {
    let label = state.as_str();
    match state {
        State::Complete => label.green().bold().to_string(),
        State::ExecutorError | State::SystemError => label.red().bold().to_string(),
        State::Canceled | State::Canceling => label.yellow().to_string(),
        _ => label.cyan().to_string(),
    }
}

/// Polls the run until it finishes. The first Ctrl-C requests cancellation.
async fn wait_for_run(
    service: &WesService,
    run_id: &str,
    owner: Option<&Requester>,
) -> Result<State, Box<dyn Error>> {
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    let mut last = None;
    let mut cancel_requested = false;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            signal = tokio::signal::ctrl_c(), if !cancel_requested => {
                signal?;
                cancel_requested = true;
                warn!("Interrupted, canceling run '{}'", run_id);
                service.cancel(run_id, owner).await?;
            }
        }

        let state = service.get_status(run_id, owner).await?.state;
        if last != Some(state) {
            println!("  {} {}", "state:".bold(), colored_state(state));
            last = Some(state);
        }
        if state.is_finished() {
            return Ok(state);
        }
    }
}

/// Main application entry point.
async fn run() -> Result<State, Box<dyn Error>> {
    let args: Vec<String> = env::args().collect();

    let cli = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;
    let Some(request_path) = cli.request_path else {
        print_usage();
        return Err("no run request given".into());
    };

    setup_logging(cli.verbose);
    print_banner();

    let mut config = match &cli.config_path {
        Some(path) => ServiceConfig::load(path)?,
        None => ServiceConfig::default(),
    };
    if cli.user.is_some() {
        config.security.authorization_required = true;
    }
    let config = Arc::new(config);

    let store: Arc<dyn RunStore> = match &cli.snapshot_path {
        Some(path) => Arc::new(MemoryRunStore::with_snapshot(path)?),
        None => Arc::new(MemoryRunStore::new()),
    };
    let tes = HttpTesClient::new(&config.controller.tes_server)?;
    info!("TES backend: {}", config.controller.tes_server.url);

    let service = WesService::start(Arc::clone(&config), store, Arc::new(tes));

    info!("Reading run request: {}", request_path.display());
    let content = tokio::fs::read_to_string(&request_path)
        .await
        .map_err(|e| format!("Could not read '{}': {}", request_path.display(), e))?;
    let body: Value = serde_json::from_str(&content)?;

    let owner = cli.user.map(Requester::new);
    let run_id = service.submit(body, owner.as_ref(), &[]).await.map_err(|e| {
        error!("Submission rejected: {}", e);
        e
    })?;
    println!("{} {}", "Run:".bold(), run_id);

    let state = wait_for_run(&service, &run_id, owner.as_ref()).await?;
    let log = service.get_log(&run_id, owner.as_ref()).await?;

    println!();
    println!("{}", serde_json::to_string_pretty(&log)?);
    Ok(state)
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(State::Complete) => ExitCode::SUCCESS,
        Ok(state) => {
            eprintln!();
            eprintln!("Run finished in state {}", colored_state(state));
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
