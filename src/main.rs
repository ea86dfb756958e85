use anyhow::{bail, Context, Result};
use clap::Parser;
use retailflow::{
    logging::init_logging, normalize::dedup::DedupPolicy, pipeline, PipelineConfig,
};
use std::{fs, path::PathBuf, process::ExitCode};
use tracing::{error, info};

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Conform raw retail sources into silver and summarize them into gold"
)]
struct Args {
    /// YAML pipeline config
    #[arg(short, long, conflicts_with = "root")]
    config: Option<PathBuf>,
    /// Data root holding bronze/, silver/ and gold/
    #[arg(long)]
    root: Option<PathBuf>,
    /// Override the customer dedup policy
    #[arg(long, value_enum)]
    dedup_policy: Option<DedupPolicy>,
    /// Write the run report as JSON to this path
    #[arg(long)]
    report: Option<PathBuf>,
}

fn load_config(args: &Args) -> Result<PipelineConfig> {
    let mut cfg = match (&args.config, &args.root) {
        (Some(path), _) => PipelineConfig::load(path)?,
        (None, Some(root)) => PipelineConfig::from_root(root),
        (None, None) => bail!("either --config or --root is required"),
    };
    if let Some(policy) = args.dedup_policy {
        cfg.dedup_policy = policy;
    }
    cfg.validate()?;
    Ok(cfg)
}

fn execute(args: &Args) -> Result<()> {
    let cfg = load_config(args)?;
    let report = pipeline::run(&cfg)?;

    if let Some(path) = &args.report {
        let json = serde_json::to_string_pretty(&report).context("serializing run report")?;
        fs::write(path, json).with_context(|| format!("writing report {}", path.display()))?;
        info!(report = %path.display(), "wrote run report");
    }
    println!(
        "silver: {} rows (v{}), gold: {} rows (v{}), dropped {} transactions, {} cast failures",
        report.silver_rows,
        report.silver_version,
        report.gold_rows,
        report.gold_version,
        report.quality.join_drops.total(),
        report.quality.total_cast_failures(),
    );
    Ok(())
}

fn main() -> ExitCode {
    init_logging("info");
    let args = Args::parse();
    match execute(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{:#}", e), "run failed");
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
