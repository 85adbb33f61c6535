//! clawlog - Log Watch Agent
//!
//! Tails a log file, detects errors by pattern, assembles the surrounding
//! context and writes one analyzed outcome per error as a JSON line.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use claw_logwatch::{
    default_rule_specs, HeuristicAnalyzer, JsonLinesSink, LogMonitor, LogParser, LogwatchConfig,
    RawLine,
};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "clawlog")]
#[command(about = "Clawbernetes log watch agent")]
#[command(version)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true, env = "CLAWLOG_JSON_LOGS")]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Monitor a log file until interrupted
    Run {
        /// Path to config file
        #[arg(short, long, env = "CLAWLOG_CONFIG")]
        config: Option<PathBuf>,

        /// Log file to monitor (overrides the config file)
        #[arg(short, long, env = "CLAWLOG_FILE")]
        file: Option<PathBuf>,
    },

    /// Parse a log file and print records as JSON lines
    Parse {
        /// Log file to parse
        file: PathBuf,
    },

    /// Print the built-in rule set
    Rules,

    /// Generate a default config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "./clawlog.json")]
        output: PathBuf,
    },
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("claw_logwatch=info".parse()?);
    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs)?;

    match cli.command {
        Commands::Run { config, file } => {
            run_monitor(config, file).await?;
        }

        Commands::Parse { file } => {
            parse_file(&file)?;
        }

        Commands::Rules => {
            print_rules()?;
        }

        Commands::InitConfig { output } => {
            init_config(&output)?;
        }
    }

    Ok(())
}

async fn run_monitor(config_path: Option<PathBuf>, file: Option<PathBuf>) -> anyhow::Result<()> {
    let mut config = match &config_path {
        Some(path) => {
            info!(config = %path.display(), "loading config");
            LogwatchConfig::from_file(path)?
        }
        None => LogwatchConfig::default(),
    };
    if let Some(file) = file {
        config.log_file = file;
    }

    let interval = Duration::from_secs(config.stats_interval_secs.max(1));
    let mut monitor = LogMonitor::new(config, HeuristicAnalyzer::new(), JsonLinesSink::stdout())?;
    monitor.start();

    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("interrupt received");
                break;
            }
            _ = ticker.tick() => {
                let stats = monitor.stats();
                info!(
                    lines = stats.lines_ingested,
                    errors = stats.errors_detected(),
                    full = stats.bundles_full,
                    partial = stats.bundles_partial,
                    dropped = stats.bundles_dropped,
                    queue_depth = stats.queue_depth,
                    reopens = stats.source_reopens,
                    "pipeline stats"
                );
            }
        }
    }

    monitor.stop().await?;
    Ok(())
}

fn parse_file(path: &Path) -> anyhow::Result<()> {
    let bytes = std::fs::read(path)?;
    let content = String::from_utf8_lossy(&bytes);
    let mut parser = LogParser::new();

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        let record = parser.parse(&RawLine::complete(line));
        writeln!(out, "{}", serde_json::to_string(&record)?)?;
    }
    Ok(())
}

fn print_rules() -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&default_rule_specs())?);
    Ok(())
}

fn init_config(output: &Path) -> anyhow::Result<()> {
    LogwatchConfig::default().save(output)?;
    info!(path = %output.display(), "wrote default config");
    println!("Config written to: {}", output.display());
    Ok(())
}
