use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use solver::capture::FileCapture;
use solver::parse::{Complexity, ParsedResponse, Section};
use solver::{CaptureError, Config, GuardError, ProgressEvent, ProgressSender, QueueKind, Solver};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::info;

#[derive(Parser)]
#[command(name = "snapsolve", about = "Solve coding problems from screenshots")]
struct Cli {
    /// Path to config.toml (defaults to config.toml next to this exe)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send screenshots of a problem and print the solution
    Solve {
        /// Image files to use instead of capturing the screen (max 2 kept)
        #[arg(short, long)]
        image: Vec<PathBuf>,

        /// Solution language (python, javascript, java, cpp, go, rust)
        #[arg(short, long)]
        language: Option<String>,

        /// Stream the reply as it is generated
        #[arg(long)]
        stream: bool,
    },
    /// Debug a previous solution with extra screenshots (errors, failing tests)
    Refine {
        /// Screenshots of the original problem
        #[arg(short, long, required = true)]
        image: Vec<PathBuf>,

        /// Screenshots with the new information
        #[arg(short, long, required = true)]
        extra: Vec<PathBuf>,

        #[arg(short, long)]
        language: Option<String>,

        #[arg(long)]
        stream: bool,
    },
    /// Parse a saved model reply and print its sections
    Parse { file: PathBuf },
}

fn load_config(cli_path: Option<&Path>) -> Config {
    let config_path = match cli_path {
        Some(p) => p.to_path_buf(),
        None => {
            let Ok(mut exe) = std::env::current_exe() else {
                return Config::default();
            };
            exe.pop();
            exe.push("config.toml");
            exe
        }
    };
    Config::load(&config_path)
}

// --- Capture feeding ---

/// Capture `count` times, waiting out throttling between attempts.
async fn capture_times(solver: &Solver, count: usize) -> Result<()> {
    for _ in 0..count {
        loop {
            match solver.capture().await {
                Ok(_) => break,
                Err(CaptureError::Guard(GuardError::Throttled { wait_secs })) => {
                    tokio::time::sleep(Duration::from_secs(wait_secs.max(1))).await;
                }
                Err(CaptureError::Guard(GuardError::RateLimited { window_secs, .. })) => {
                    tokio::time::sleep(Duration::from_secs(window_secs.max(1))).await;
                }
                Err(e) => return Err(e).context("Screenshot capture failed"),
            }
        }
    }
    Ok(())
}

// --- Output ---

fn print_events(mut rx: UnboundedReceiver<ProgressEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut streaming = false;
        while let Some(event) = rx.recv().await {
            if let ProgressEvent::ExchangeChunk { text, .. } = &event {
                streaming = true;
                eprint!("{text}");
                let _ = std::io::stderr().flush();
                continue;
            }
            if std::mem::take(&mut streaming) {
                eprintln!();
            }
            match event {
                ProgressEvent::CaptureSucceeded { id, queue } => {
                    eprintln!("Captured screenshot {id} into {queue} queue")
                }
                ProgressEvent::CaptureFailed { message } => eprintln!("Capture: {message}"),
                ProgressEvent::QueueChanged { queue, len } => {
                    eprintln!("{queue} queue: {len} screenshot(s)")
                }
                ProgressEvent::ExchangeStarted { kind } => eprintln!("Processing ({kind})..."),
                ProgressEvent::ExchangeSucceeded { kind, partial, .. } => {
                    if partial {
                        eprintln!("Done ({kind}); the reply was cut short")
                    } else {
                        eprintln!("Done ({kind})")
                    }
                }
                ProgressEvent::ExchangeFailed { kind, message } => {
                    eprintln!("Failed ({kind}): {message}")
                }
                ProgressEvent::ExchangeChunk { .. } => {}
            }
        }
    })
}

fn print_section(title: &str, section: &Section) {
    println!("## {title}");
    match section {
        Section::Block(text) => println!("{text}"),
        Section::List(items) => {
            for item in items {
                println!("- {item}");
            }
        }
    }
    println!();
}

fn print_response(response: &ParsedResponse) {
    if response.is_empty() {
        println!("{}", response.raw);
        return;
    }
    if let Some(analysis) = &response.analysis {
        print_section("Problem Analysis", &Section::Block(analysis.clone()));
    }
    if let Some(approach) = &response.approach {
        print_section("Approach", approach);
    }
    if let Some(code) = &response.code {
        println!("## Code\n```\n{code}\n```\n");
    }
    match &response.complexity {
        Some(Complexity::Bounds { time, space }) => {
            println!("## Complexity\n- Time: {time}\n- Space: {space}\n");
        }
        Some(Complexity::Summary(section)) => print_section("Complexity", section),
        None => {}
    }
    if let Some(recommendations) = &response.recommendations {
        print_section("Recommendations", recommendations);
    }
}

// --- Main ---

async fn run_exchange(
    config: Config,
    primary: Vec<PathBuf>,
    extra: Vec<PathBuf>,
    language: Option<String>,
) -> Result<()> {
    let (progress, rx) = ProgressSender::channel();
    let printer = print_events(rx);

    let mut solver = Solver::new(config, progress).context("Failed to set up screenshot storage")?;
    let (primary_count, extra_count) = (primary.len(), extra.len());
    if primary_count > 0 {
        let files = primary.into_iter().chain(extra);
        solver = solver.with_capturer(Arc::new(FileCapture::new(files)));
    }

    capture_times(&solver, primary_count.max(1)).await?;

    let result = if extra_count > 0 {
        solver.switch_mode(QueueKind::Supplementary);
        capture_times(&solver, extra_count).await?;
        solver.refine(language.as_deref()).await
    } else {
        solver.solve(language.as_deref()).await
    };

    // Closing the channel lets the printer drain and exit.
    drop(solver);
    let _ = printer.await;

    let solution = result?;
    info!(kind = %solution.kind, language = solution.language, "Exchange complete");
    if solution.compression_attempts > 0 {
        eprintln!(
            "Screenshots were compressed {} time(s) to fit the payload limit",
            solution.compression_attempts
        );
    }
    print_response(&solution.response);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref());

    match cli.command {
        Command::Parse { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let response = solver::parse_response(&raw);
            if response.is_empty() && raw.trim().is_empty() {
                bail!("{} is empty", file.display());
            }
            print_response(&response);
            Ok(())
        }
        Command::Solve {
            image,
            language,
            stream,
        } => {
            config.api.stream |= stream;
            let _log_guard = solver::logging::init_tracing(&config.logging);
            run_exchange(config, image, Vec::new(), language).await
        }
        Command::Refine {
            image,
            extra,
            language,
            stream,
        } => {
            config.api.stream |= stream;
            let _log_guard = solver::logging::init_tracing(&config.logging);
            run_exchange(config, image, extra, language).await
        }
    }
}
