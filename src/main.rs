//! Kiln CLI - incremental task-graph build runner

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use colored::Colorize;

use kiln::error::Hint;
use kiln::{manifest, CancelToken, Context, KilnError, Settings};

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Kiln - incremental task-graph build runner")]
#[command(version)]
struct Cli {
    /// Task selectors like `:gen` or `:lib:compile`; empty runs the
    /// manifest's default tasks
    selectors: Vec<String>,

    /// Build manifest to load
    #[arg(short, long, default_value = "kiln.yaml")]
    manifest: PathBuf,

    /// Worker count (defaults to hardware parallelism)
    #[arg(short, long)]
    parallel: Option<usize>,

    /// Ignore stored fingerprints and rerun everything
    #[arg(long)]
    force_rerun: bool,

    /// Keep running dependents of failed tasks
    #[arg(long)]
    continue_on_error: bool,

    /// Override the build-output directory
    #[arg(long)]
    build_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Usage errors exit 4; clap handles --help/--version itself
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            return ExitCode::from(4);
        }
        Err(e) => {
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings = build_settings(&cli);
    if !settings.color {
        colored::control::set_override(false);
    }

    match build(cli, settings).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("  {} {}", "hint:".yellow(), hint);
            }
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn build_settings(cli: &Cli) -> Settings {
    let root = cli
        .manifest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut settings = Settings::for_dir(root)
        .with_force_rerun(cli.force_rerun)
        .with_continue_on_error(cli.continue_on_error);
    if let Some(parallel) = cli.parallel {
        settings = settings.with_parallel(parallel);
    }
    if let Some(dir) = &cli.build_dir {
        settings = settings.with_build_dir(dir);
    }
    settings
}

async fn build(cli: Cli, settings: Settings) -> Result<u8, KilnError> {
    let mut ctx = Context::new(settings);
    manifest::load_file(&mut ctx, &cli.manifest)?;

    // Ctrl-C drains the scheduler; a second one kills the process
    let cancel = CancelToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n{}", "interrupted, draining...".yellow());
            interrupt.cancel();
        }
    });

    let report = ctx.execute_with_cancel(&cli.selectors, cancel).await?;

    println!("{}", report.render());
    if let Some(first) = report.first_failure() {
        if let Some(log_path) = &first.log_path {
            if let Ok(log) = std::fs::read_to_string(log_path) {
                eprintln!("{} {}", "log of".red(), first.path);
                eprintln!("{}", log);
            }
        }
        for other in report
            .entries
            .iter()
            .filter(|e| e.status == kiln::TaskStatus::Failed && e.path != first.path)
        {
            if let Some(log_path) = &other.log_path {
                eprintln!("{} {}", "see log:".red(), log_path.display());
            }
        }
    }

    Ok(report.exit_code() as u8)
}
