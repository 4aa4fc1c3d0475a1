use anyhow::{Context, Result};
use asm_engine::{
    init_tracing, CommandSpec, EngineConfig, EtaModel, ExecutionEvent, ExecutionSession, HostProbe,
    JsonFileStore, OperationHistory, OperationKey, Outcome, SessionContext, SystemProbe,
};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "asm-engine")]
#[command(about = "Run package operations with learned progress estimates")]
struct Cli {
    /// Engine config file [default: ~/.config/tys-asm/engine.json]
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command and stream its events
    Run {
        /// Run through the elevation agent when one is available
        #[arg(long)]
        privileged: bool,
        /// The command prompts for credentials itself (AUR helpers)
        #[arg(long)]
        helper: bool,
        /// Expected number of output lines
        #[arg(long)]
        lines: Option<u32>,
        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
        /// Command and arguments, after `--`
        #[arg(required = true, last = true)]
        argv: Vec<String>,
    },
    /// Show predictions derived from recorded history
    History {
        /// Operation key, e.g. `pacman_-S`
        key: Option<String>,
    },
    /// Show the elevation agent and terminal detected on this host
    Probe,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path),
        None => EngineConfig::load_default(),
    };
    if let Err(error) = init_tracing(&config.log_dir) {
        eprintln!("logging disabled: {}", error);
    }

    match cli.command {
        Commands::Run {
            privileged,
            helper,
            lines,
            json,
            argv,
        } => {
            let mut spec = CommandSpec::new(argv);
            if privileged {
                spec = spec.privileged();
            }
            if helper {
                spec = spec.interactive_helper();
            }
            if let Some(lines) = lines {
                spec = spec.with_line_hint(lines);
            }
            let outcome = run(&config, spec, json).await?;
            std::process::exit(exit_code(outcome));
        }
        Commands::History { key } => history(&config, key),
        Commands::Probe => probe(&config),
    }
}

async fn run(config: &EngineConfig, spec: CommandSpec, json: bool) -> Result<Outcome> {
    let context = SessionContext::from_config(config);
    let mut handle = ExecutionSession::new(spec, context).start();

    let canceller = handle.canceller();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            canceller.cancel();
        }
    });

    let mut stdout = std::io::stdout();
    let mut outcome = Outcome::Failed { exit_code: None };
    while let Some(event) = handle.next_event().await {
        if json {
            writeln!(stdout, "{}", serde_json::to_string(&event)?)?;
        } else {
            print_event(&event);
        }
        if let ExecutionEvent::Terminated { outcome: final_outcome, .. } = event {
            outcome = final_outcome;
        }
    }
    stdout.flush()?;
    Ok(outcome)
}

fn print_event(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::StatusChanged { message } => eprintln!("==> {}", message),
        ExecutionEvent::LineReceived { text } => println!("{}", text),
        ExecutionEvent::Progress { percent, eta, .. } => match eta {
            Some(eta) => eprintln!("[{:>2}%] {}", percent, eta),
            None => eprintln!("[{:>2}%]", percent),
        },
        ExecutionEvent::Indeterminate { active: true } => eprintln!("==> estimating..."),
        ExecutionEvent::Indeterminate { active: false } => {}
        ExecutionEvent::Terminated { outcome, message } => {
            eprintln!("==> {}: {}", outcome.as_str(), message)
        }
    }
}

fn exit_code(outcome: Outcome) -> i32 {
    match outcome {
        Outcome::Succeeded => 0,
        Outcome::Failed { exit_code } => exit_code.filter(|code| *code != 0).unwrap_or(1),
        Outcome::NotFound => 127,
        Outcome::Cancelled => 130,
    }
}

fn history(config: &EngineConfig, key: Option<String>) -> Result<()> {
    let history = Arc::new(OperationHistory::new(Arc::new(JsonFileStore::new(
        config.history_path.clone(),
    ))));
    let model = EtaModel::new(history.clone());

    let keys: Vec<OperationKey> = match key {
        Some(key) => vec![OperationKey::from(key.as_str())],
        None => history.snapshot().into_keys().collect(),
    };
    let mut report = serde_json::Map::new();
    for key in keys {
        let samples = history.samples(&key).lines.len();
        report.insert(
            key.to_string(),
            serde_json::json!({
                "samples": samples,
                "prediction": model.predict_key(&key),
            }),
        );
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("failed to render history")?
    );
    Ok(())
}

fn probe(config: &EngineConfig) -> Result<()> {
    let probe = SystemProbe::from_config(config);
    println!(
        "{}",
        serde_json::to_string_pretty(&probe.capabilities()).context("failed to render capabilities")?
    );
    Ok(())
}
