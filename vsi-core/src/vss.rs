//! VSS text-file ingestion.
//!
//! Whitespace-separated records, one per line; `#` starts a comment. The
//! first non-comment line with exactly one token is the version string.
//! Every other line is `name id` or `name id private_id`. Malformed
//! lines are reported and skipped; they never abort the import.

use std::path::Path;

use log::{info, warn};

use crate::error::Result;
use crate::vsi::Vsi;

#[derive(Debug, Default, Clone)]
pub struct ImportStats {
    pub defined: u32,
    pub skipped: u32,
    pub version: Option<String>,
}

/// Import every signal definition in `path` into `domain`.
pub fn import(vsi: &Vsi, path: &Path, domain: u32) -> Result<ImportStats> {
    let contents = std::fs::read_to_string(path)?;
    let mut stats = ImportStats::default();

    for (lineno, line) in contents.lines().enumerate() {
        let lineno = lineno + 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if stats.version.is_none() && tokens.len() == 1 {
            stats.version = Some(tokens[0].to_string());
            continue;
        }
        if tokens.len() != 2 && tokens.len() != 3 {
            warn!("{}:{lineno}: expected `name id [private_id]`", path.display());
            stats.skipped += 1;
            continue;
        }
        let name = tokens[0];
        let id = match tokens[1].parse::<u32>() {
            Ok(id) => id,
            Err(_) => {
                warn!("{}:{lineno}: bad signal id {:?}", path.display(), tokens[1]);
                stats.skipped += 1;
                continue;
            }
        };
        let private = if tokens.len() == 3 {
            match tokens[2].parse::<u32>() {
                Ok(p) => p,
                Err(_) => {
                    warn!(
                        "{}:{lineno}: bad private id {:?}",
                        path.display(),
                        tokens[2]
                    );
                    stats.skipped += 1;
                    continue;
                }
            }
        } else {
            0
        };
        match vsi.define_signal(domain, id, private, name) {
            Ok(()) => stats.defined += 1,
            Err(err) => {
                warn!("{}:{lineno}: define {name:?} failed: {err}", path.display());
                stats.skipped += 1;
            }
        }
    }
    info!(
        "imported {} signals from {} ({} skipped, version {:?})",
        stats.defined,
        path.display(),
        stats.skipped,
        stats.version
    );
    Ok(stats)
}
