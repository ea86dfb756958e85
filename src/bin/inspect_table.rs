use anyhow::{Context, Result};
use clap::Parser;
use parquet::file::metadata::RowGroupMetaData;
use parquet::file::reader::{FileReader, SerializedFileReader};
use retailflow::store::{log, TableStore};
use std::{fs::File, path::PathBuf};

/// Print the current version of a committed table: manifest, declared
/// columns and the row groups of every data file.
#[derive(Parser)]
#[command(author, version)]
struct Args {
    /// Table location (directory holding `_log/`)
    location: PathBuf,
    /// Also list every committed version still in the log
    #[arg(long)]
    history: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let store = TableStore::new(&args.location, "");
    let manifest = store
        .current()?
        .with_context(|| format!("no committed table at {}", args.location.display()))?;

    println!("=== Table: {} ===", manifest.table_name);
    println!("Location:     {}", args.location.display());
    println!("Version:      {}", manifest.version);
    println!("Committed at: {}", manifest.committed_at.to_rfc3339());
    println!("Rows:         {}", manifest.num_rows);
    println!("Data files:   {}", manifest.files.len());
    println!();

    if args.history {
        println!("=== Log ===");
        for v in log::list_versions(&args.location)? {
            let m = log::read_manifest(&args.location, v)?;
            println!("- v{:<6} {}  {} rows", m.version, m.committed_at.to_rfc3339(), m.num_rows);
        }
        println!();
    }

    println!("=== Columns ===");
    for col in &manifest.columns {
        println!("- {:<30} | {:?}", col.name, col.ty);
    }
    println!();

    for file in &manifest.files {
        let path = args.location.join(file);
        let reader = SerializedFileReader::new(
            File::open(&path).with_context(|| format!("opening {}", path.display()))?,
        )
        .with_context(|| format!("reading parquet footer of {}", path.display()))?;
        let meta = reader.metadata();
        let size = std::fs::metadata(&path)?.len();
        println!("=== {} ===", file);
        println!(
            "  {} rows, {} row groups, {} bytes on disk",
            meta.file_metadata().num_rows(),
            meta.num_row_groups(),
            size
        );
        for (idx, rg) in meta.row_groups().iter().enumerate() {
            print_row_group(idx, rg);
        }
    }
    Ok(())
}

fn print_row_group(idx: usize, rg: &RowGroupMetaData) {
    println!("  --- Row Group {} ({} rows, {} bytes uncompressed) ---", idx, rg.num_rows(), rg.total_byte_size());
    for col in rg.columns() {
        let nulls = col
            .statistics()
            .and_then(|s| s.null_count_opt())
            .map_or("?".to_string(), |n| n.to_string());
        println!(
            "    {:<28} {:?} compressed {:>8} B, nulls {}",
            col.column_descr().name(),
            col.compression(),
            col.compressed_size(),
            nulls
        );
    }
}
