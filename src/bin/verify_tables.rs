use anyhow::{bail, Result};
use clap::Parser;
use retailflow::{logging::init_logging, store::TableStore, verify::verify_tables};
use std::path::PathBuf;
use tracing::info;

/// Re-check a committed silver/gold pair.
#[derive(Parser)]
#[command(author, version)]
struct Args {
    #[arg(long)]
    silver: PathBuf,
    #[arg(long)]
    gold: PathBuf,
}

fn main() -> Result<()> {
    init_logging("warn");
    let args = Args::parse();

    let silver = TableStore::new(&args.silver, "silver").read()?;
    let gold = TableStore::new(&args.gold, "gold").read()?;
    info!(silver_rows = silver.num_rows(), gold_rows = gold.num_rows(), "loaded tables");

    let report = verify_tables(&silver, &gold)?;
    print!("{}", report);
    if !report.passed() {
        bail!("verification failed");
    }
    println!("all checks passed");
    Ok(())
}
