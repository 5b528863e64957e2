//! CLI tool for changeset files.
//!
//! Provides commands for:
//! - Dumping records as text or JSON
//! - Combining several changesets into one
//! - Inverting a changeset
//! - Per-table statistics

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use changesync_core::{Changegroup, Changeset, OpKind, Value};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every record of a changeset
    Dump {
        /// Changeset or patchset file
        file: PathBuf,

        /// Print the decoded table groups as JSON
        #[arg(long)]
        json: bool,
    },

    /// Combine changesets into one, in the order given
    Combine {
        /// Input files
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Output file
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Write the changeset that undoes a changeset
    Invert {
        /// Input file
        file: PathBuf,

        /// Output file
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Show record counts per table and operation
    Stats {
        /// Changeset or patchset file
        file: PathBuf,
    },
}

fn read_changeset(path: &Path) -> Result<Changeset> {
    let data = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Changeset::from_bytes(data).with_context(|| format!("Invalid changeset {}", path.display()))
}

fn write_changeset(path: &Path, changeset: &Changeset) -> Result<()> {
    fs::write(path, changeset.as_bytes())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    tracing::info!(
        "Wrote {} records ({} bytes) to {}",
        changeset.record_count(),
        changeset.len(),
        path.display()
    );
    Ok(())
}

fn format_cells(cells: &[Value]) -> String {
    let cells: Vec<String> = cells.iter().map(Value::to_string).collect();
    format!("({})", cells.join(", "))
}

fn dump(changeset: &Changeset, json: bool) -> Result<String> {
    let groups = changeset.groups()?;
    if json {
        return Ok(serde_json::to_string_pretty(&groups)?);
    }

    let mut out = format!("{:?}\n", changeset.kind());
    for group in &groups {
        out.push_str(&format!("table {}\n", group.header.name));
        for record in &group.records {
            let flag = if record.indirect { " indirect" } else { "" };
            out.push_str(&format!("  {}{}", record.op, flag));
            if record.op.has_old() {
                out.push_str(&format!(" old={}", format_cells(&record.old)));
            }
            if record.op.has_new() {
                out.push_str(&format!(" new={}", format_cells(&record.new)));
            }
            out.push('\n');
        }
    }
    Ok(out)
}

fn combine(files: &[PathBuf]) -> Result<Changeset> {
    let mut group = Changegroup::new();
    for path in files {
        let changeset = read_changeset(path)?;
        group
            .add(&changeset)
            .with_context(|| format!("Failed to combine {}", path.display()))?;
        tracing::debug!("Added {}", path.display());
    }
    Ok(group.output()?)
}

fn stats(changeset: &Changeset) -> Result<String> {
    let mut counts: BTreeMap<String, [usize; 3]> = BTreeMap::new();
    let mut iter = changeset.iter()?;
    while iter.next()? {
        let (table, _, op, _) = iter.op()?;
        let slot = match op {
            OpKind::Insert => 0,
            OpKind::Update => 1,
            OpKind::Delete => 2,
        };
        counts.entry(table.to_string()).or_default()[slot] += 1;
    }

    let mut out = format!(
        "kind: {:?}\nbytes: {}\nrecords: {}\n",
        changeset.kind(),
        changeset.len(),
        changeset.record_count()
    );
    for (table, [inserts, updates, deletes]) in counts {
        out.push_str(&format!(
            "{}: {} inserts, {} updates, {} deletes\n",
            table, inserts, updates, deletes
        ));
    }
    Ok(out)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt::init();

    match cli.command {
        Commands::Dump { file, json } => {
            print!("{}", dump(&read_changeset(&file)?, json)?);
        }
        Commands::Combine { files, output } => {
            let combined = combine(&files)?;
            write_changeset(&output, &combined)?;
        }
        Commands::Invert { file, output } => {
            let inverted = read_changeset(&file)?.invert()?;
            write_changeset(&output, &inverted)?;
        }
        Commands::Stats { file } => {
            print!("{}", stats(&read_changeset(&file)?)?);
        }
    }
    Ok(())
}
