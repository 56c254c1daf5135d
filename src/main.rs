mod cli;
mod ui;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::sleep;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command, DemoArgs};
use settle::{EpochOutcome, SettleConfig, SettleTimer};
use ui::EpochProgress;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            if !path.exists() {
                bail!("Config file not found: {}", path.display());
            }
            SettleConfig::load_from(path)?
        }
        None => SettleConfig::load()?,
    };
    init_tracing(&config, cli.verbose);

    match cli.command {
        Command::Demo(args) => run_demo(&config, args).await,
        Command::Lines { interval_ms } => run_lines(&config, interval_ms).await,
        Command::Config => {
            print!("{}", toml::to_string(&config)?);
            Ok(())
        }
    }
}

fn init_tracing(config: &SettleConfig, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn interval_for(config: &SettleConfig, override_ms: Option<u64>) -> Duration {
    override_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| config.interval())
}

/// Fires a burst of restarts, optionally cancels, and reports the epoch.
async fn run_demo(config: &SettleConfig, args: DemoArgs) -> Result<()> {
    let interval = interval_for(config, args.interval_ms);
    let timer = SettleTimer::<u32>::builder()
        .config(config)
        .interval(interval)
        .complete_action(|last: Option<&u32>| {
            info!(last_restart = ?last, "settled after the last restart");
        })
        .build()?;

    let progress = (!args.json).then(|| EpochProgress::start(interval));
    if let Some(progress) = progress.clone() {
        timer.subscribe(move |event| progress.event(event));
    }

    let finalizers = args.finalizers;
    let item_duration = Duration::from_millis(args.finalizer_ms);
    let item_progress = progress.clone();
    timer.on_finalizing(move |finalizing| {
        if finalizing.is_cancelled() {
            return;
        }
        for index in 1..=finalizers {
            let progress = item_progress.clone();
            finalizing.add(move || async move {
                sleep(item_duration).await;
                if let Some(progress) = progress {
                    progress.finalized(index);
                }
                Ok(())
            });
        }
    });

    let stop = Arc::new(AtomicBool::new(false));
    if let Some(delay) = args.cancel_after_ms {
        let canceller = timer.clone();
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            sleep(Duration::from_millis(delay)).await;
            // Raised first so the burst cannot start a fresh epoch afterwards.
            stop.store(true, Ordering::Release);
            canceller.cancel();
        });
    }

    let spacing = Duration::from_millis(args.spacing_ms);
    let outcome = drive_burst(&timer, args.restarts, spacing, &stop, |index| {
        if let Some(progress) = &progress {
            progress.restart(index, args.restarts);
        }
    })
    .await;

    let Some(outcome) = outcome else {
        if let Some(progress) = &progress {
            progress.clear();
        }
        if stop.load(Ordering::Acquire) {
            println!("Cancelled before the first restart.");
        } else {
            println!("No epoch ran. Pass --restarts to start one.");
        }
        return Ok(());
    };
    if let Some(progress) = &progress {
        progress.complete(&outcome);
    }

    if let Some(record) = timer.last_record() {
        if args.json {
            println!("{}", serde_json::to_string_pretty(&record)?);
        } else if let Some(progress) = &progress {
            progress.print_record(&record);
        }
    }
    Ok(())
}

/// Restarts `timer` up to `restarts` times, `spacing` apart, then waits for
/// the epoch the burst drove.
///
/// The burst ends early once `stop` is raised. Returns `None` if no restart
/// was fired.
async fn drive_burst(
    timer: &SettleTimer<u32>,
    restarts: u32,
    spacing: Duration,
    stop: &AtomicBool,
    mut on_restart: impl FnMut(u32),
) -> Option<EpochOutcome> {
    let mut fired = 0;
    for index in 1..=restarts {
        if index > 1 {
            sleep(spacing).await;
        }
        if stop.load(Ordering::Acquire) {
            break;
        }
        timer.start_or_restart_with_payload(index);
        on_restart(index);
        fired += 1;
    }

    if fired == 0 {
        return None;
    }
    Some(timer.settled().await)
}

/// Echoes a stdin line once input has been quiet for the interval.
async fn run_lines(config: &SettleConfig, interval_ms: Option<u64>) -> Result<()> {
    let timer = SettleTimer::<String>::builder()
        .config(config)
        .interval(interval_for(config, interval_ms))
        .complete_action(|line: Option<&String>| {
            if let Some(line) = line {
                println!("{line}");
            }
        })
        .build()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        timer.start_or_restart_with_payload(line);
    }

    // Let the last burst settle before exiting.
    timer.settled().await;
    Ok(())
}
