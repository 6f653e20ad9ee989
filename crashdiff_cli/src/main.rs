use anyhow::Context;
use clap::Parser;
use crashdiff_core::{
    CancelToken, Collaborators, CrashdiffConfig, DifferentialReport, Reproducer, Verdict,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

const DEFAULT_CONFIG_FILE: &str = "crashdiff.toml";

/// Rebuilds a project at its vulnerable and fixed commits and checks whether
/// the reported crash reproduces on one and not the other.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Vulnerability id, e.g. OSV-2021-1361
    id: String,

    #[clap(short, long, value_parser)]
    config: Option<PathBuf>,

    /// Directory receiving `<id>/report.json`
    #[clap(short, long)]
    output_dir: Option<PathBuf>,

    /// Leave run containers behind for inspection
    #[clap(long)]
    keep_containers: bool,

    /// Use the closest snapshot when none exists for the exact commit time
    #[clap(long)]
    nearest_snapshot: bool,

    /// Wall-clock limit of each reproduction run
    #[clap(long)]
    timeout_secs: Option<u64>,

    /// Number of stack frames compared between crashes
    #[clap(long)]
    frame_depth: Option<usize>,

    #[clap(short, long)]
    verbose: bool,
}

fn load_config(cli: &Cli) -> anyhow::Result<CrashdiffConfig> {
    let mut config = match &cli.config {
        Some(config_path) => {
            info!(path = ?config_path, "Loading configuration");
            CrashdiffConfig::load_from_file(config_path)?
        }
        None => {
            let default_config_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if default_config_path.exists() {
                info!(path = ?default_config_path, "No config file specified, loading default");
                CrashdiffConfig::load_from_file(&default_config_path)?
            } else {
                info!("No config file specified and {DEFAULT_CONFIG_FILE} not found, using built-in defaults");
                CrashdiffConfig::default()
            }
        }
    };

    if let Some(dir) = &cli.output_dir {
        config.output.dir = dir.clone();
    }
    if cli.keep_containers {
        config.run.keep_containers = true;
    }
    if cli.nearest_snapshot {
        config.fetch.nearest_snapshot = true;
    }
    if let Some(timeout) = cli.timeout_secs {
        config.run.timeout_secs = timeout;
    }
    if let Some(depth) = cli.frame_depth {
        config.verify.frame_depth = depth;
    }
    config.validate()?;

    tracing::debug!("Effective configuration: {config:#?}");
    Ok(config)
}

fn print_summary(report: &DifferentialReport, reproducer: &Reproducer) {
    println!("{}: {} ({:?} confidence)", report.record_id, report.verdict, report.confidence);
    for outcome in [&report.vulnerable, &report.fixed] {
        let signature = outcome
            .signature
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<10} {} {:?} {}",
            outcome.target.role.as_str(), outcome.target.pin.commit, outcome.classification, signature
        );
    }
    if let Some(blocking) = &report.blocking {
        println!(
            "  blocked at {} ({}): {}",
            blocking.stage, blocking.role, blocking.reason
        );
    }
    for note in &report.notes {
        println!("  note: {note}");
    }
    println!("Report: {}", reproducer.report_path(&report.record_id).display());
}

/// Cancels `cancel` on the first interrupt; a second one exits immediately.
fn interrupt_handler(cancel: CancelToken) -> impl FnMut() + Send + 'static {
    move || {
        if cancel.is_cancelled() {
            eprintln!("Interrupted again, exiting");
            std::process::exit(130);
        }
        warn!("Interrupted, stopping containers and writing a partial report");
        cancel.cancel();
    }
}

fn run(cli: &Cli) -> anyhow::Result<Verdict> {
    let config = load_config(cli)?;
    let reproducer = Reproducer::from_config(&config, Collaborators::from_config(&config))
        .context("Failed to set up the reproduction pipeline")?;

    let cancel = CancelToken::new();
    ctrlc::set_handler(interrupt_handler(cancel.clone()))
        .context("Failed to install the interrupt handler")?;

    let report = reproducer
        .reproduce(&cli.id, &cancel)
        .with_context(|| format!("Failed to reproduce {}", cli.id))?;
    print_summary(&report, &reproducer);
    Ok(report.verdict)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set subscriber: {e}");
    }

    match run(&cli) {
        Ok(verdict) if verdict.is_success() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(1),
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(2)
        }
    }
}
