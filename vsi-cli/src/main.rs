//! Command-line tools for the VSI shared-memory signal store: inspect a
//! segment, read and write individual signals, and bulk-import VSS
//! definition files.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::debug;
use vsi_core::{Vsi, VsiConfig};

#[derive(Parser)]
#[command(name = "vsi", version, about = "Vehicle Signal Interface tools")]
struct Cli {
    /// Segment file (defaults to the configured path).
    #[arg(long, global = true, env = "VSI_SEGMENT")]
    file: Option<PathBuf>,

    /// Create a fresh segment instead of opening an existing one.
    #[arg(long, global = true)]
    create: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Display signals, groups, and memory accounting.
    Dump {
        /// Show only the signal directory.
        #[arg(long)]
        signals: bool,
        /// Show only the group registry.
        #[arg(long)]
        groups: bool,
        /// Show only allocator accounting and integrity.
        #[arg(long)]
        memory: bool,
    },
    /// Fetch one signal payload (newest by default).
    Read {
        #[arg(short = 'd', long)]
        domain: u32,
        #[arg(short = 's', long)]
        signal: u32,
        /// Fetch the oldest payload destructively instead of peeking the
        /// newest.
        #[arg(short = 'o', long)]
        oldest: bool,
    },
    /// Insert one signal payload.
    Write {
        #[arg(short = 'd', long)]
        domain: u32,
        #[arg(short = 's', long)]
        signal: u32,
        /// Payload bytes, taken verbatim.
        #[arg(short = 'v', long)]
        value: String,
    },
    /// Import a VSS definition file into a domain.
    ImportVss {
        #[arg(id = "vss_file")]
        file: PathBuf,
        domain: u32,
    },
}

fn hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn dump(vsi: &Vsi, signals: bool, groups: bool, memory: bool) -> anyhow::Result<()> {
    // No section flags means every section.
    let all = !(signals || groups || memory);

    if all || signals {
        println!("signals:");
        for info in vsi.signals()? {
            println!(
                "  {}/{} name {} private {} queued {} ({} bytes)",
                info.domain,
                info.signal,
                info.name.as_deref().unwrap_or("-"),
                info.private_id,
                info.queued,
                info.total_bytes
            );
        }
    }
    if all || groups {
        println!("groups:");
        for group in vsi.signal_groups()? {
            let members: Vec<String> = group
                .members
                .iter()
                .map(|(d, s)| format!("{d}/{s}"))
                .collect();
            println!("  {}: [{}]", group.id, members.join(", "));
        }
    }
    if all || memory {
        let stats = vsi.memory_stats()?;
        println!(
            "memory: arena {} bytes, {} free in {} blocks (largest {})",
            stats.arena_size, stats.free_bytes, stats.free_blocks, stats.largest_free
        );
        vsi.verify().context("segment integrity check failed")?;
        println!("integrity: ok");
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut cfg = VsiConfig::load();
    if let Some(file) = cli.file {
        cfg.segment_path = file;
    }
    debug!("using segment {}", cfg.segment_path.display());
    let vsi = Vsi::initialize(&cfg, cli.create)
        .with_context(|| format!("opening segment {}", cfg.segment_path.display()))?;

    match cli.command {
        Command::Dump {
            signals,
            groups,
            memory,
        } => dump(&vsi, signals, groups, memory)?,
        Command::Read {
            domain,
            signal,
            oldest,
        } => {
            let data = if oldest {
                vsi.get_oldest_signal(domain, signal, false)
            } else {
                vsi.get_newest_signal(domain, signal, false)
            }
            .with_context(|| format!("reading signal {domain}/{signal}"))?;
            println!(
                "{domain}/{signal}: {} ({} bytes: {})",
                String::from_utf8_lossy(&data),
                data.len(),
                hex(&data)
            );
        }
        Command::Write {
            domain,
            signal,
            value,
        } => {
            vsi.insert_signal(domain, signal, value.as_bytes())
                .with_context(|| format!("writing signal {domain}/{signal}"))?;
            println!("wrote {} bytes to {domain}/{signal}", value.len());
        }
        Command::ImportVss { file, domain } => {
            let stats = vsi
                .vss_import(&file, domain)
                .with_context(|| format!("importing {}", file.display()))?;
            println!(
                "imported {} signals into domain {domain} ({} skipped)",
                stats.defined, stats.skipped
            );
        }
    }
    Ok(())
}
