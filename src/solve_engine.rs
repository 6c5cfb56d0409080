// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::thread::JoinHandle;

use log::{debug, info, warn};

use crate::engine::{AstrometryEngine, CancelMonitor, UnconfiguredEngine};
use crate::error::{most_informative, SolveError};
use crate::external_worker::{ExternalSolverKind, ExternalWorker};
use crate::extractor::{ConvolutionExtractor, Extractor};
use crate::image::ImageDescriptor;
use crate::internal_worker::InternalWorker;
use crate::online_worker::OnlineWorker;
use crate::params::{MultiAlgorithm, Parameters, ScaleUnits};
use crate::resource::{default_index_folder_paths, index_footprint_bytes, ResourceProbe, SystemProbe};
use crate::star::{Background, Solution, Star};
use crate::wcs::{annotate_stars, wcs_coordinate_grid, WcsProjector};
use crate::worker::{start_worker, ProcessType, RunningWorker, SolverWorker, WorkerOutcome};

/// Everything a finished run produced. Extraction-only runs carry stars
/// and background; solve runs add the solution, with `wcs_ready` set when
/// the stars were annotated from the winning WCS.
#[derive(Debug)]
pub struct SolveOutcome {
    pub stars: Vec<Star>,
    pub background: Option<Background>,
    pub solution: Option<Solution>,
    pub wcs_ready: bool,
}

/// Fans a global abort out to every worker the engine has started.
#[derive(Clone)]
struct AbortFan {
    flag: CancelMonitor,
    targets: Arc<Mutex<Vec<CancelMonitor>>>,
}

impl AbortFan {
    fn new() -> Self {
        AbortFan {
            flag: CancelMonitor::new(None),
            targets: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn abort(&self) {
        self.flag.cancel();
        for target in self.targets.lock().unwrap().iter() {
            target.cancel();
        }
    }

    fn is_aborted(&self) -> bool {
        self.flag.is_cancelled()
    }

    /// Registers a worker; if the global abort already happened the worker
    /// is cancelled on the spot, so it will refuse to start.
    fn register(&self, monitor: CancelMonitor) {
        if self.flag.is_cancelled() {
            monitor.cancel();
        }
        self.targets.lock().unwrap().push(monitor);
    }
}

/// Orchestrates one plate-solving run: builds the primary worker for the
/// configured back-end, performs the RAM admission check, resolves the
/// multi-solver strategy, races child workers over disjoint slices of the
/// search space, and post-processes the winner's WCS onto the star list.
///
/// An engine is single-shot: once a run reaches a terminal state, start a
/// fresh engine for the next image.
pub struct SolveEngine {
    process_type: ProcessType,
    image: ImageDescriptor,
    params: Parameters,
    index_folders: Vec<PathBuf>,

    scale: Option<(f64, f64, ScaleUnits)>,
    position: Option<(f64, f64)>,

    extractor: Arc<dyn Extractor>,
    astrometry: Arc<dyn AstrometryEngine>,
    probe: Arc<dyn ResourceProbe>,
    thread_count: Option<usize>,
    load_wcs: bool,
    base_path: Option<PathBuf>,

    // External back-end configuration, passed through to the workers.
    pub solver_kind: ExternalSolverKind,
    pub sextractor_path: Option<PathBuf>,
    pub solver_path: Option<PathBuf>,
    pub astap_path: Option<PathBuf>,
    pub file_to_process: Option<PathBuf>,
    pub cleanup_temporary_files: bool,
    pub auto_generate_config: bool,

    // Online back-end configuration.
    pub api_url: String,
    pub api_key: String,

    aborter: AbortFan,
    ran: bool,

    stars: Vec<Star>,
    background: Option<Background>,
    solution: Option<Solution>,
    projector: Option<Box<dyn WcsProjector>>,
}

impl SolveEngine {
    pub fn new(image: ImageDescriptor, params: Parameters, process_type: ProcessType) -> Self {
        SolveEngine {
            process_type,
            image,
            params,
            index_folders: default_index_folder_paths(),
            scale: None,
            position: None,
            extractor: Arc::new(ConvolutionExtractor),
            astrometry: Arc::new(UnconfiguredEngine),
            probe: Arc::new(SystemProbe),
            thread_count: None,
            load_wcs: true,
            base_path: None,
            solver_kind: ExternalSolverKind::AstrometryNet,
            sextractor_path: None,
            solver_path: None,
            astap_path: None,
            file_to_process: None,
            cleanup_temporary_files: true,
            auto_generate_config: true,
            api_url: "http://nova.astrometry.net".into(),
            api_key: String::new(),
            aborter: AbortFan::new(),
            ran: false,
            stars: Vec::new(),
            background: None,
            solution: None,
            projector: None,
        }
    }

    pub fn set_index_folder_paths(&mut self, folders: Vec<PathBuf>) {
        self.index_folders = folders;
    }

    /// Scale hint: bounds on the field scale in the given units.
    pub fn set_search_scale(&mut self, low: f64, high: f64, units: ScaleUnits) {
        self.scale = Some((low, high, units));
    }

    /// Position hint in decimal degrees.
    pub fn set_search_position_deg(&mut self, ra: f64, dec: f64) {
        self.position = Some((ra, dec));
    }

    /// Position hint with the right ascension in hours.
    pub fn set_search_position_hms(&mut self, ra_hours: f64, dec: f64) {
        self.set_search_position_deg(ra_hours * 15.0, dec);
    }

    pub fn set_use_subframe(&mut self, x: i64, y: i64, w: i64, h: i64) -> Result<(), SolveError> {
        self.image.set_subframe(x, y, w, h)
    }

    pub fn set_extractor(&mut self, extractor: Arc<dyn Extractor>) {
        self.extractor = extractor;
    }

    pub fn set_astrometry_engine(&mut self, engine: Arc<dyn AstrometryEngine>) {
        self.astrometry = engine;
    }

    pub fn set_resource_probe(&mut self, probe: Arc<dyn ResourceProbe>) {
        self.probe = probe;
    }

    /// Overrides the racing width; defaults to the machine's parallelism.
    pub fn set_thread_count(&mut self, threads: usize) {
        self.thread_count = Some(threads.max(1));
    }

    /// Whether to compute WCS star annotations after a successful solve.
    pub fn set_load_wcs(&mut self, load: bool) {
        self.load_wcs = load;
    }

    /// Directory for the workers' temp files and sentinels.
    pub fn set_base_path(&mut self, base_path: PathBuf) {
        self.base_path = Some(base_path);
    }

    pub fn stars(&self) -> &[Star] {
        &self.stars
    }

    pub fn background(&self) -> Option<Background> {
        self.background
    }

    pub fn solution(&self) -> Option<&Solution> {
        self.solution.as_ref()
    }

    pub fn has_wcs(&self) -> bool {
        self.projector.is_some()
    }

    /// Dense per-pixel (ra, dec) grid from the winning solve. Computed on
    /// demand; None until a solve with WCS data has finished.
    pub fn wcs_coordinate_map(&self) -> Option<Vec<(f32, f32)>> {
        self.projector
            .as_ref()
            .map(|p| wcs_coordinate_grid(p.as_ref(), self.image.width(), self.image.height()))
    }

    fn thread_count(&self) -> usize {
        self.thread_count
            .unwrap_or_else(|| thread::available_parallelism().map(|n| n.get()).unwrap_or(1))
    }

    /// Resolves MultiAuto against the available hints and applies the RAM
    /// admission rule for parallel index loading.
    fn check_parameters(&mut self) -> MultiAlgorithm {
        let mut multi = resolve_multi_algorithm(
            self.params.multi_algorithm,
            self.scale.is_some(),
            self.position.is_some(),
        );
        if multi != self.params.multi_algorithm {
            debug!("resolved multi-solver strategy to {:?}", multi);
        }

        if self.params.in_parallel && self.process_type.solves() && !self.process_type.is_online()
        {
            let footprint = index_footprint_bytes(&self.index_folders);
            let installed = self.probe.installed_ram_bytes();
            if installed == 0 {
                warn!("cannot determine installed RAM; disabling parallel index loading");
                self.params.in_parallel = false;
            } else if footprint > installed {
                warn!(
                    "index files need {} bytes but only {} bytes of RAM are installed; \
                     disabling parallel index loading",
                    footprint, installed
                );
                self.params.in_parallel = false;
            } else {
                debug!(
                    "index files fit in RAM ({} of {} bytes)",
                    footprint, installed
                );
            }
        }
        if !self.params.in_parallel {
            multi = MultiAlgorithm::NotMulti;
        }
        multi
    }

    fn create_worker(&self) -> Result<Box<dyn SolverWorker>, SolveError> {
        let mut worker: Box<dyn SolverWorker> = match self.process_type {
            ProcessType::IntExtract | ProcessType::IntExtractHfr | ProcessType::IntSolve => {
                let mut w = InternalWorker::new(
                    self.process_type,
                    self.image.clone(),
                    self.params.clone(),
                    self.extractor.clone(),
                    self.astrometry.clone(),
                );
                w.set_index_folder_paths(self.index_folders.clone());
                if let Some(base) = &self.base_path {
                    w.set_base_path(base.clone());
                }
                Box::new(w)
            }
            ProcessType::ExtExtract
            | ProcessType::ExtExtractHfr
            | ProcessType::ExtSolve
            | ProcessType::IntExtractExtSolve => {
                let mut w = ExternalWorker::new(
                    self.process_type,
                    self.image.clone(),
                    self.params.clone(),
                    self.extractor.clone(),
                );
                w.set_index_folder_paths(self.index_folders.clone());
                if let Some(base) = &self.base_path {
                    w.set_base_path(base.clone());
                }
                w.solver_kind = self.solver_kind;
                if let Some(p) = &self.sextractor_path {
                    w.sextractor_path = p.clone();
                }
                if let Some(p) = &self.solver_path {
                    w.solver_path = p.clone();
                }
                if let Some(p) = &self.astap_path {
                    w.astap_path = p.clone();
                }
                w.file_to_process = self.file_to_process.clone();
                w.cleanup_temporary_files = self.cleanup_temporary_files;
                w.auto_generate_config = self.auto_generate_config;
                Box::new(w)
            }
            ProcessType::OnlineSolve | ProcessType::IntExtractOnlineSolve => {
                if self.api_key.is_empty() {
                    return Err(SolveError::InvalidInput(
                        "online solving needs an API key".into(),
                    ));
                }
                let mut w = OnlineWorker::new(
                    self.process_type,
                    self.image.clone(),
                    self.params.clone(),
                    self.extractor.clone(),
                );
                w.api_url = self.api_url.clone();
                w.api_key = self.api_key.clone();
                w.file_to_process = self.file_to_process.clone();
                Box::new(w)
            }
        };
        if let Some((lo, hi, units)) = self.scale {
            worker.set_search_scale(lo, hi, units);
        }
        if let Some((ra, dec)) = self.position {
            worker.set_search_position_deg(ra, dec);
        }
        Ok(worker)
    }

    /// Runs the whole job on the calling thread. Use [`SolveEngine::start`]
    /// for the own-thread variant.
    pub fn execute_blocking(&mut self) -> Result<SolveOutcome, SolveError> {
        if self.ran {
            return Err(SolveError::InvalidInput(
                "this engine already ran; construct a fresh one".into(),
            ));
        }
        self.ran = true;
        if self.aborter.is_aborted() {
            return Err(SolveError::Aborted("aborted before start".into()));
        }

        let multi = self.check_parameters();
        let primary = self.create_worker()?;
        self.aborter.register(primary.cancel_monitor());

        let result = if multi != MultiAlgorithm::NotMulti && self.process_type.supports_parallel()
        {
            self.run_parallel(primary, multi)
        } else {
            self.run_single(primary)
        };
        info!("all processes complete");
        result
    }

    /// Moves the engine onto its own thread, returning a handle that can
    /// abort the run and wait for the result.
    pub fn start(mut self) -> SolveEngineHandle {
        let aborter = self.aborter.clone();
        let join = thread::spawn(move || {
            let result = self.execute_blocking();
            (self, result)
        });
        SolveEngineHandle { aborter, join }
    }

    fn run_single(&mut self, primary: Box<dyn SolverWorker>) -> Result<SolveOutcome, SolveError> {
        let (events, finished) = mpsc::channel();
        let running = start_worker(0, primary, events);
        let event = finished
            .recv()
            .map_err(|_| SolveError::Aborted("worker vanished".into()))?;
        let mut worker = running.join();

        let outcome = event.result?;
        self.stars = worker.stars().to_vec();
        self.background = worker.background();
        if outcome == WorkerOutcome::Solved {
            self.solution = worker.solution().cloned();
            self.projector = worker.take_projector();
        }
        let wcs_ready = self.annotate_from_wcs();
        Ok(SolveOutcome {
            stars: self.stars.clone(),
            background: self.background,
            solution: self.solution.clone(),
            wcs_ready,
        })
    }

    fn run_parallel(
        &mut self,
        mut primary: Box<dyn SolverWorker>,
        multi: MultiAlgorithm,
    ) -> Result<SolveOutcome, SolveError> {
        // Extraction happens exactly once, before any child exists.
        primary.extract()?;
        self.stars = primary.stars().to_vec();
        self.background = primary.background();
        if self.aborter.is_aborted() {
            return Err(SolveError::Aborted("aborted after extraction".into()));
        }

        let threads = self.thread_count();
        let mut children: Vec<Box<dyn SolverWorker>> = Vec::new();
        match multi {
            MultiAlgorithm::MultiScales => {
                let (min_scale, max_scale, units) = match self.scale {
                    Some((lo, hi, units)) => (lo, hi, units),
                    None => (
                        self.params.min_width,
                        self.params.max_width,
                        ScaleUnits::DegWidth,
                    ),
                };
                let slices = multi_scale_slices(min_scale, max_scale, threads);
                info!(
                    "starting {} child solvers over scales {}..{} {}",
                    slices.len(),
                    min_scale,
                    max_scale,
                    units.unit_string()
                );
                for (n, (low, high)) in slices.into_iter().enumerate() {
                    let mut child = primary.spawn_child(n)?;
                    child.set_search_scale(low, high, units);
                    debug!("child solver {}: scale {:.4}..{:.4}", n + 1, low, high);
                    children.push(child);
                }
            }
            MultiAlgorithm::MultiDepths => {
                let windows = multi_depth_windows(self.params.keep_num, threads);
                info!("starting {} child solvers over source depths", windows.len());
                for (n, (low, high)) in windows.into_iter().enumerate() {
                    let mut child = primary.spawn_child(n)?;
                    child.set_depth_window(low, high);
                    debug!("child solver {}: depth {}..{}", n + 1, low, high);
                    children.push(child);
                }
            }
            _ => unreachable!("resolved strategy is always concrete here"),
        }
        drop(primary);

        // Race: the first success wins, everyone else is aborted. The run
        // is not over until every child reached a terminal state.
        let (events, finished) = mpsc::channel();
        let mut running: Vec<RunningWorker> = Vec::new();
        for (n, child) in children.into_iter().enumerate() {
            let monitor = child.cancel_monitor();
            self.aborter.register(monitor);
            running.push(start_worker(n, child, events.clone()));
        }
        drop(events);

        let mut winner_index: Option<usize> = None;
        let mut failures: Vec<SolveError> = Vec::new();
        while let Ok(event) = finished.recv() {
            match event.result {
                Ok(_) if winner_index.is_none() => {
                    winner_index = Some(event.index);
                    info!("child solver {} solved the field", event.index + 1);
                    for worker in &running {
                        if worker.index() != event.index {
                            worker.abort();
                        }
                    }
                }
                Ok(_) => {
                    // A sibling crossed the line after the winner; its
                    // result is discarded.
                    debug!("child solver {} finished after the winner", event.index + 1);
                }
                Err(e) => {
                    debug!("child solver {} failed: {}", event.index + 1, e);
                    failures.push(e);
                }
            }
        }

        let mut winner: Option<Box<dyn SolverWorker>> = None;
        for worker in running {
            let index = worker.index();
            let finished_worker = worker.join();
            if Some(index) == winner_index {
                winner = Some(finished_worker);
            }
        }

        if self.aborter.is_aborted() {
            return Err(SolveError::Aborted("solve aborted".into()));
        }
        match winner {
            Some(mut worker) => {
                self.solution = worker.solution().cloned();
                self.projector = worker.take_projector();
                let wcs_ready = self.annotate_from_wcs();
                Ok(SolveOutcome {
                    stars: self.stars.clone(),
                    background: self.background,
                    solution: self.solution.clone(),
                    wcs_ready,
                })
            }
            None => Err(most_informative(failures)),
        }
    }

    /// Applies the winning WCS to the extracted star list. Returns whether
    /// annotations were produced.
    fn annotate_from_wcs(&mut self) -> bool {
        if !self.load_wcs {
            return false;
        }
        match &self.projector {
            Some(projector) => {
                annotate_stars(&mut self.stars, projector.as_ref());
                info!("WCS data ready: {} stars annotated", self.stars.len());
                true
            }
            None => false,
        }
    }
}

/// A running engine on its own thread.
pub struct SolveEngineHandle {
    aborter: AbortFan,
    join: JoinHandle<(SolveEngine, Result<SolveOutcome, SolveError>)>,
}

impl SolveEngineHandle {
    /// Aborts the primary worker and every child. Safe from any thread and
    /// idempotent.
    pub fn abort(&self) {
        self.aborter.abort();
    }

    /// Waits for the run to reach a terminal state. The engine comes back
    /// for result accessors like [`SolveEngine::wcs_coordinate_map`].
    pub fn wait(self) -> (SolveEngine, Result<SolveOutcome, SolveError>) {
        self.join.join().expect("solve engine thread panicked")
    }
}

/// Resolution table for MultiAuto. Without hints there is no scale to
/// anchor a depth split, so scales win; with both hints a single solver is
/// already well constrained.
pub(crate) fn resolve_multi_algorithm(
    configured: MultiAlgorithm,
    has_scale: bool,
    has_position: bool,
) -> MultiAlgorithm {
    if configured != MultiAlgorithm::MultiAuto {
        return configured;
    }
    match (has_scale, has_position) {
        (true, true) => MultiAlgorithm::NotMulti,
        (true, false) => MultiAlgorithm::MultiDepths,
        (false, true) => MultiAlgorithm::MultiScales,
        (false, false) => MultiAlgorithm::MultiScales,
    }
}

/// Quadratic partition of a scale range: thread `i` of `t` covers
/// `[min + k i^2, min + k (i+1)^2]` with `k = (max - min) / t^2`, so the
/// large-scale slices (which solve faster per unit of range) are wider.
pub(crate) fn multi_scale_slices(
    min_scale: f64,
    max_scale: f64,
    threads: usize,
) -> Vec<(f64, f64)> {
    let threads = threads.max(1);
    let k = (max_scale - min_scale) / (threads * threads) as f64;
    (0..threads)
        .map(|i| {
            let low = min_scale + k * (i * i) as f64;
            let high = min_scale + k * ((i + 1) * (i + 1)) as f64;
            (low, high)
        })
        .collect()
}

/// Depth windows `[i, i + inc)` stepping from 1 toward the source count,
/// with `inc` clamped so no window is narrower than 10 sources. Fewer than
/// `threads` windows come back when the clamp engages.
pub(crate) fn multi_depth_windows(keep_num: u32, threads: usize) -> Vec<(u32, u32)> {
    let source_num = if keep_num > 0 { keep_num } else { 200 };
    let threads = threads.max(1) as u32;
    let inc = (source_num / threads).max(10);
    let mut windows = Vec::new();
    let mut i = 1u32;
    while i < source_num {
        windows.push((i, i + inc));
        i += inc;
    }
    windows
}
