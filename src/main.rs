use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use esgf_sample::archive::{ArchiveClient, DatasetRecord};
use esgf_sample::registry;
use esgf_sample::request::{self, DatasetRequest};
use esgf_sample::store::ZarrStore;

#[derive(Parser)]
#[command(name = "esgf-sample")]
#[command(version)]
#[command(about = "Fetches CMIP6 and Obs4MIPs datasets and decimates them into small test fixtures")]
struct Args {
    /// Output directory for the decimated stores
    #[arg(short, long, default_value = "data")]
    output: PathBuf,

    /// Archive to search: an http(s) federation index or a local catalog directory
    #[arg(long, default_value = "archive")]
    archive: String,

    /// Cache directory for files mirrored from a remote archive
    #[arg(long, default_value = ".esgf-cache", value_name = "DIR")]
    cache_dir: PathBuf,

    /// JSON file with the dataset requests (defaults to the built-in sample set)
    #[arg(long, value_name = "FILE")]
    requests: Option<PathBuf>,

    /// Column stride and row window width for curvilinear grids
    #[arg(long, default_value_t = 10)]
    factor: usize,

    /// Where to write the checksum manifest
    #[arg(long, default_value = "registry.txt", value_name = "FILE")]
    registry: PathBuf,

    /// Keep the full horizontal grid, applying only the time window
    #[arg(long)]
    no_decimate: bool,

    /// Suppress progress output
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{} {}", "Error:".red().bold(), e);

        // Print the error chain for better context
        for cause in e.chain().skip(1) {
            eprintln!("  Caused by: {}", cause);
        }

        process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();

    let requests = match &args.requests {
        Some(path) => request::load_requests(path)?,
        None => request::default_requests(),
    };
    let archive = ArchiveClient::from_source(&args.archive, &args.cache_dir);

    // search every request, then drop datasets matched more than once
    let mut matched: Vec<(usize, DatasetRecord)> = Vec::new();
    for (index, request) in requests.iter().enumerate() {
        let records = archive
            .search(&request.facets, request.remove_ensembles)
            .await
            .with_context(|| {
                format!("Search failed for request {} of {}", index + 1, requests.len())
            })?;
        if !args.quiet {
            println!(
                "Request {} of {}: {} dataset(s)",
                index + 1,
                requests.len(),
                records.len()
            );
        }
        matched.extend(records.into_iter().map(|record| (index, record)));
    }
    let mut seen = HashSet::new();
    matched.retain(|(_, record)| seen.insert(record.key.clone()));

    let mut written = 0usize;
    let mut skipped = 0usize;
    let mut failed = 0usize;
    for (index, record) in &matched {
        let request = &requests[*index];
        if !args.quiet {
            println!("{}", record.key.bold());
        }
        for file in &record.files {
            match process_file(request, record, file, &args) {
                Ok(Some(path)) => {
                    written += 1;
                    if !args.quiet {
                        println!("  {} {}", "wrote".green(), path.display());
                    }
                }
                Ok(None) => {
                    skipped += 1;
                    if !args.quiet {
                        println!(
                            "  {} {} (no data in the requested window)",
                            "skipped".yellow(),
                            file.display()
                        );
                    }
                }
                Err(e) => {
                    failed += 1;
                    eprintln!(
                        "{} {} ({}): {}",
                        "Failed:".red().bold(),
                        record.key,
                        file.display(),
                        e
                    );
                    for cause in e.chain().skip(1) {
                        eprintln!("  Caused by: {}", cause);
                    }
                }
            }
        }
    }

    fs::create_dir_all(&args.output).with_context(|| {
        format!("Failed to create output directory '{}'", args.output.display())
    })?;
    let entries = registry::write_registry(&args.output, &args.registry)?;
    if !args.quiet {
        println!(
            "{} {} written, {} skipped, {} failed; registry '{}' lists {} file(s)",
            "Done:".green().bold(),
            written,
            skipped,
            failed,
            args.registry.display(),
            entries
        );
    }
    Ok(())
}

/// Shrinks one store and writes it under the output tree. `Ok(None)`
/// means every time step fell outside the requested window and nothing
/// was written.
fn process_file(
    request: &DatasetRequest,
    record: &DatasetRecord,
    file: &Path,
    args: &Args,
) -> Result<Option<PathBuf>> {
    let dataset = ZarrStore::open(file)?
        .read_dataset()
        .with_context(|| format!("Failed to load store '{}'", file.display()))?;
    let Some(decimated) = request.decimate_dataset(&dataset, args.factor, !args.no_decimate)?
    else {
        return Ok(None);
    };
    let relative = request.output_path(&record.key, &record.facets, &decimated, file)?;
    let path = args.output.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory '{}'", parent.display()))?;
    }
    ZarrStore::create(&path, &decimated)
        .with_context(|| format!("Failed to write store '{}'", path.display()))?;
    Ok(Some(path))
}
