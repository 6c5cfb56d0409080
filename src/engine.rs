// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::debug;

use crate::error::SolveError;
use crate::params::SearchParity;
use crate::star::Solution;
use crate::wcs::WcsProjector;

/// Cooperative cancellation shared between a worker and whatever is doing
/// its blocking work. Cancelling sets an in-process flag and, when a
/// sentinel path is configured, creates that file. The file exists because
/// the production matching engine is an external library that polls for a
/// well-known path; in-process implementations and tests can run with the
/// flag alone.
#[derive(Clone)]
pub struct CancelMonitor {
    flag: Arc<AtomicBool>,
    cancel_file: Option<PathBuf>,
}

impl CancelMonitor {
    pub fn new(cancel_file: Option<PathBuf>) -> Self {
        CancelMonitor {
            flag: Arc::new(AtomicBool::new(false)),
            cancel_file,
        }
    }

    /// Requests cancellation. Idempotent and safe from any thread.
    pub fn cancel(&self) {
        if self.flag.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(path) = &self.cancel_file {
            if path.parent().map(Path::exists).unwrap_or(false) {
                if let Err(e) = fs::write(path, b"Cancel") {
                    debug!("could not create cancel file {}: {}", path.display(), e);
                }
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self
                .cancel_file
                .as_deref()
                .map(Path::exists)
                .unwrap_or(false)
    }

    pub fn cancel_file(&self) -> Option<&Path> {
        self.cancel_file.as_deref()
    }

    /// Removes the sentinel from disk, leaving the in-process flag alone.
    pub fn remove_file(&self) {
        if let Some(path) = &self.cancel_file {
            let _ = fs::remove_file(path);
        }
    }
}

/// One unit of matching work handed to the astrometric engine.
#[derive(Clone, Debug)]
pub struct SolveJob {
    /// Pixel positions of the field stars, brightest first when resorted.
    pub stars: Vec<(f64, f64)>,
    pub image_width: usize,
    pub image_height: usize,
    /// Scale window in arcseconds per pixel, when a scale hint is in force.
    pub scale_low_app: Option<f64>,
    pub scale_high_app: Option<f64>,
    /// Field width bounds in degrees, consulted when no scale window is set.
    pub min_width_deg: f64,
    pub max_width_deg: f64,
    /// Window of source depths to try; None means the engine's defaults.
    pub depth_low: Option<u32>,
    pub depth_high: Option<u32>,
    /// Search center (ra, dec) in degrees and the radius around it.
    pub center: Option<(f64, f64)>,
    pub search_radius: f64,
    pub parity: SearchParity,
    /// Whether the engine may load its index files in parallel.
    pub in_parallel: bool,
    pub time_limit: Duration,
    pub logratio_tosolve: f64,
    pub logratio_tokeep: f64,
    pub logratio_totune: f64,
    pub index_folders: Vec<PathBuf>,
}

/// What a successful match produces: the field solution, plus a projection
/// when the engine computed full WCS data.
pub struct EngineSolution {
    pub solution: Solution,
    pub projector: Option<Box<dyn WcsProjector>>,
}

/// Astrometric matching kernel contract.
///
/// `solve` is a blocking call. Implementations must poll `cancel` at their
/// own cadence and return `SolveError::Aborted` once it trips, return
/// `SolveError::Timeout` when `job.time_limit` elapses, and
/// `SolveError::NoSolution` when the scale/depth window is exhausted
/// without a match.
pub trait AstrometryEngine: Send + Sync {
    fn solve(&self, job: &SolveJob, cancel: &CancelMonitor) -> Result<EngineSolution, SolveError>;
}

/// Placeholder wired in until the caller supplies a real engine; internal
/// solves cannot run against it.
pub(crate) struct UnconfiguredEngine;

impl AstrometryEngine for UnconfiguredEngine {
    fn solve(&self, _job: &SolveJob, _cancel: &CancelMonitor) -> Result<EngineSolution, SolveError> {
        Err(SolveError::InvalidInput(
            "no astrometric engine configured".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_only_monitor() {
        let monitor = CancelMonitor::new(None);
        assert!(!monitor.is_cancelled());
        monitor.cancel();
        assert!(monitor.is_cancelled());
        // Idempotent.
        monitor.cancel();
        assert!(monitor.is_cancelled());
    }

    #[test]
    fn test_sentinel_file_created_and_observed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker_1.cancel");
        let monitor = CancelMonitor::new(Some(path.clone()));
        monitor.cancel();
        assert!(path.exists());

        // A second monitor watching the same path sees the cancellation
        // through the filesystem alone.
        let watcher = CancelMonitor::new(Some(path.clone()));
        assert!(watcher.is_cancelled());

        monitor.remove_file();
        assert!(!path.exists());
    }

    #[test]
    fn test_clones_share_the_flag() {
        let monitor = CancelMonitor::new(None);
        let clone = monitor.clone();
        clone.cancel();
        assert!(monitor.is_cancelled());
    }
}
