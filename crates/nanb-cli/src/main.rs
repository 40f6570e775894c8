use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{debug, info};
use nanb::cell::CellState;
use nanb::protocol::Stream;
use nanb::{parse, Cell, KernelManager, Session, SessionEvent, Settings};
use tabled::{settings::Style, Table, Tabled};
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "nanb", author, version, about = "Not-a-notebook: run plain source files cell by cell")]
struct Cli {
    /// Configuration directory (default: ~/.nanb)
    #[arg(short = 'c', long)]
    config_dir: Option<PathBuf>,

    /// Kernel log file, overrides the settings file
    #[arg(short = 'L', long)]
    kernel_log: Option<PathBuf>,

    /// Log level for this process and the kernel
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every code cell of a file in order, printing its output
    Run {
        /// Source file to run
        file: PathBuf,
    },
    /// Show how a file splits into cells
    Cells {
        file: PathBuf,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Print settings as JSON
    Config {
        /// Print the settings loaded from the config directory instead of
        /// the defaults
        #[arg(long)]
        effective: bool,
    },
}

#[derive(Tabled)]
struct CellTableRow {
    #[tabled(rename = "#")]
    number: usize,
    #[tabled(rename = "KIND")]
    kind: String,
    #[tabled(rename = "LABEL")]
    label: String,
    #[tabled(rename = "LINES")]
    lines: String,
    #[tabled(rename = "FIRST LINE")]
    first_line: String,
}

impl CellTableRow {
    fn new(cell: &Cell, max_label: usize) -> Self {
        let first_line = cell
            .source
            .lines()
            .find(|l| !l.trim().is_empty())
            .map(|l| truncate(l.trim(), 40))
            .unwrap_or_else(|| "-".to_string());
        CellTableRow {
            number: cell.id + 1,
            kind: cell.kind.to_string(),
            label: cell
                .display_label(max_label)
                .unwrap_or_else(|| "-".to_string()),
            lines: format!("{}-{}", cell.line_start, cell.line_end),
            first_line,
        }
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let config_dir = cli
        .config_dir
        .clone()
        .unwrap_or_else(nanb::default_config_dir);
    let mut settings = Settings::load(&config_dir)?;
    if let Some(log) = &cli.kernel_log {
        settings.server.log_file = log.clone();
    }
    debug!("Loaded settings from {}", config_dir.display());
    Ok(settings)
}

fn read_source(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    match &cli.command {
        Commands::Run { file } => {
            let settings = load_settings(&cli)?;
            let clean = run_file(file, settings, &cli.log_level).await?;
            if !clean {
                std::process::exit(1);
            }
        }
        Commands::Cells { file, json } => {
            let settings = load_settings(&cli)?;
            let cells = parse(&read_source(file)?);
            if *json {
                println!("{}", serde_json::to_string_pretty(&cells)?);
            } else {
                let rows: Vec<CellTableRow> = cells
                    .iter()
                    .map(|c| CellTableRow::new(c, settings.cell_name_max))
                    .collect();
                let table = Table::new(rows).with(Style::rounded()).to_string();
                println!("{}", table);
            }
        }
        Commands::Config { effective } => {
            let settings = if *effective {
                load_settings(&cli)?
            } else {
                Settings::default()
            };
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }
    }

    Ok(())
}

/// Run all cells of `file` headlessly. Returns `false` when the kernel died.
async fn run_file(file: &Path, settings: Settings, log_level: &str) -> Result<bool> {
    let text = read_source(file)?;
    let max_label = settings.cell_name_max;
    let launcher = KernelManager::new(settings.clone()).with_log_level(log_level);
    let mut session = Session::new(parse(&text), launcher, settings)
        .await
        .context("Could not start kernel")?;
    info!(
        "Kernel {} ready, logging to {}",
        session.kernel().interpreter(),
        session.settings().server.log_file.display()
    );

    let mut interrupts = signal(SignalKind::interrupt())?;
    let queued = session.run_all()?;
    debug!("Queued {} cells", queued);

    let mut kernel_died = false;
    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();

    while !session.is_idle() {
        tokio::select! {
            event = session.next_event() => {
                let Some(event) = event else { break };
                match event {
                    SessionEvent::StateChanged { cell, state: CellState::Running } => {
                        if let Some(cell) = session.cell(cell) {
                            println!("\n### {}", cell.title(max_label));
                        }
                    }
                    SessionEvent::StateChanged { cell, state } => {
                        if matches!(state, CellState::Failed | CellState::Interrupted) {
                            eprintln!("[cell {} {}]", cell + 1, state);
                        }
                    }
                    SessionEvent::Output { stream, data, .. } => match stream {
                        Stream::Stdout | Stream::Result => {
                            stdout.write_all(&data)?;
                            stdout.flush()?;
                        }
                        Stream::Stderr | Stream::Error => {
                            stderr.write_all(&data)?;
                            stderr.flush()?;
                        }
                    },
                    SessionEvent::KernelDead { reason } => {
                        eprintln!("Kernel died: {}", reason);
                        kernel_died = true;
                        break;
                    }
                }
            }
            Some(()) = interrupts.recv() => {
                match session.interrupt() {
                    Ok(()) => eprintln!("\nInterrupting..."),
                    Err(nanb::Error::NotRunning) => {
                        eprintln!("\nNothing is running, stopping");
                        break;
                    }
                    Err(e) => eprintln!("\nCould not interrupt: {}", e),
                }
            }
        }
    }

    let (succeeded, failed) = session
        .cells()
        .iter()
        .filter(|c| c.is_code())
        .fold((0, 0), |(ok, bad), c| match c.state() {
            CellState::Succeeded => (ok + 1, bad),
            CellState::Failed | CellState::Interrupted => (ok, bad + 1),
            _ => (ok, bad),
        });
    println!("\n{} succeeded, {} failed or interrupted", succeeded, failed);

    session.shutdown().await;
    Ok(!kernel_died)
}
