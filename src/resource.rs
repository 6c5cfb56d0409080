// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs;
use std::path::PathBuf;

use log::debug;
use sysinfo::System;

/// Platform probe for the RAM admission check. Kept behind a trait so
/// tests can report whatever memory size a scenario needs.
pub trait ResourceProbe: Send + Sync {
    /// Total physical memory in bytes. Returns 0 when it cannot be
    /// determined; the solve engine treats unknown as "refuse parallel".
    fn installed_ram_bytes(&self) -> u64;
}

/// Queries the host OS via sysinfo.
pub struct SystemProbe;

impl ResourceProbe for SystemProbe {
    fn installed_ram_bytes(&self) -> u64 {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.total_memory()
    }
}

/// Total on-disk footprint of the index files (`*.fits` / `*.fit`) sitting
/// directly in each of the given folders. Folders that do not exist
/// contribute nothing.
pub fn index_footprint_bytes(folders: &[PathBuf]) -> u64 {
    let mut total = 0u64;
    for folder in folders {
        let entries = match fs::read_dir(folder) {
            Ok(entries) => entries,
            Err(_) => {
                debug!("index folder {} not readable, skipping", folder.display());
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let is_index = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case("fits") || e.eq_ignore_ascii_case("fit"))
                .unwrap_or(false);
            if is_index {
                if let Ok(meta) = entry.metadata() {
                    total += meta.len();
                }
            }
        }
    }
    total
}

fn home_dir() -> Option<PathBuf> {
    let var = if cfg!(windows) { "USERPROFILE" } else { "HOME" };
    std::env::var_os(var).map(PathBuf::from)
}

/// The conventional astrometry.net index locations for the host OS. Only
/// paths that exist are returned.
pub fn default_index_folder_paths() -> Vec<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if cfg!(target_os = "macos") {
        if let Some(home) = home_dir() {
            candidates.push(home.join("Library/Application Support/Astrometry"));
        }
        candidates.push(PathBuf::from("/usr/local/share/astrometry"));
    } else if cfg!(target_os = "linux") {
        candidates.push(PathBuf::from("/usr/share/astrometry/"));
        if let Some(home) = home_dir() {
            candidates.push(home.join(".local/share/kstars/astrometry/"));
        }
    } else if cfg!(windows) {
        if let Some(home) = home_dir() {
            candidates.push(home.join("AppData/Local/cygwin_ansvr/usr/share/astrometry/data"));
        }
        candidates.push(PathBuf::from("C:/cygwin/usr/share/astrometry/data"));
    }
    candidates.into_iter().filter(|p| p.exists()).collect()
}
