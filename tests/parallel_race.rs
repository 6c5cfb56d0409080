// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! End-to-end exercises of the racing solve engine against scripted
//! astrometric engines: winner selection, loser cancellation, failure
//! collapse, RAM admission and global abort.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use platesolve::{
    AstrometryEngine, CancelMonitor, EngineSolution, ImageDescriptor, MultiAlgorithm, Parameters,
    Parity, PixelFormat, ProcessType, ResourceProbe, ScaleUnits, SolveEngine, SolveError,
    SolveJob, Solution, TanWcs,
};

/// Captures the engines' log output under the test harness. Repeated
/// initialization is a no-op.
fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Renders a synthetic field of Gaussian stars on a noisy pedestal.
fn star_field_image(width: usize, height: usize, star_count: usize) -> ImageDescriptor {
    let mut img = vec![0.0f32; width * height];
    for y in 0..height {
        for x in 0..width {
            img[y * width + x] = 100.0 + ((x * 7 + y * 13) % 17) as f32 * 0.3;
        }
    }
    let sigma = 3.0 / 2.3548f64;
    let per_row = 8usize;
    for i in 0..star_count {
        let sx = ((i % per_row) as f64 + 0.6) * width as f64 / (per_row as f64 + 0.4);
        let sy = ((i / per_row) as f64 + 0.7) * height as f64 / (star_count as f64 / per_row as f64 + 1.0);
        let peak = 800.0 + 25.0 * i as f64;
        for dy in -8i64..=8 {
            for dx in -8i64..=8 {
                let x = sx as i64 + dx;
                let y = sy as i64 + dy;
                if x < 0 || y < 0 || x >= width as i64 || y >= height as i64 {
                    continue;
                }
                let fx = x as f64 - sx;
                let fy = y as f64 - sy;
                let v = peak * (-(fx * fx + fy * fy) / (2.0 * sigma * sigma)).exp();
                img[y as usize * width + x as usize] += v as f32;
            }
        }
    }
    let bytes: Vec<u8> = img.iter().flat_map(|v| v.to_ne_bytes()).collect();
    ImageDescriptor::new(bytes, width, height, PixelFormat::MonoF32).unwrap()
}

fn sample_solution() -> Solution {
    Solution {
        ra: 210.125,
        dec: 54.35,
        orientation: 12.5,
        pixscale: 7.0,
        parity: Parity::Positive,
        field_width: 60.0,
        field_height: 60.0,
        ra_error: None,
        dec_error: None,
    }
}

fn engine_solution(width: usize, height: usize) -> EngineSolution {
    let solution = sample_solution();
    let projector = TanWcs::from_center(
        solution.ra,
        solution.dec,
        width as f64 / 2.0,
        height as f64 / 2.0,
        solution.pixscale,
        solution.orientation,
        solution.parity,
    );
    EngineSolution {
        solution,
        projector: Some(Box::new(projector)),
    }
}

/// Succeeds only when the job's scale window covers the target field
/// width; other slices block until their cancel sentinel trips.
struct SliceTargetEngine {
    target_width_deg: f64,
    solve_calls: AtomicUsize,
    successes: AtomicUsize,
}

impl SliceTargetEngine {
    fn new(target_width_deg: f64) -> Self {
        SliceTargetEngine {
            target_width_deg,
            solve_calls: AtomicUsize::new(0),
            successes: AtomicUsize::new(0),
        }
    }
}

fn wait_for_cancel(cancel: &CancelMonitor, limit: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < limit {
        if cancel.is_cancelled() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

impl AstrometryEngine for SliceTargetEngine {
    fn solve(&self, job: &SolveJob, cancel: &CancelMonitor) -> Result<EngineSolution, SolveError> {
        self.solve_calls.fetch_add(1, Ordering::SeqCst);
        let target_app = self.target_width_deg * 3600.0 / job.image_width as f64;
        let hit = match (job.scale_low_app, job.scale_high_app) {
            (Some(lo), Some(hi)) => lo <= target_app && target_app <= hi,
            _ => true,
        };
        if hit {
            std::thread::sleep(Duration::from_millis(50));
            self.successes.fetch_add(1, Ordering::SeqCst);
            return Ok(engine_solution(job.image_width, job.image_height));
        }
        if wait_for_cancel(cancel, Duration::from_secs(30)) {
            Err(SolveError::Aborted("cancel sentinel observed".into()))
        } else {
            Err(SolveError::NoSolution("scale window exhausted".into()))
        }
    }
}

/// Records depth windows; succeeds on one specific window.
struct DepthTargetEngine {
    winning_depth_low: u32,
    windows: Mutex<Vec<(u32, u32)>>,
    successes: AtomicUsize,
}

impl AstrometryEngine for DepthTargetEngine {
    fn solve(&self, job: &SolveJob, cancel: &CancelMonitor) -> Result<EngineSolution, SolveError> {
        let window = (job.depth_low.unwrap_or(0), job.depth_high.unwrap_or(0));
        self.windows.lock().unwrap().push(window);
        if window.0 == self.winning_depth_low {
            std::thread::sleep(Duration::from_millis(30));
            self.successes.fetch_add(1, Ordering::SeqCst);
            return Ok(engine_solution(job.image_width, job.image_height));
        }
        if wait_for_cancel(cancel, Duration::from_secs(30)) {
            Err(SolveError::Aborted("cancel sentinel observed".into()))
        } else {
            Err(SolveError::NoSolution("depth window exhausted".into()))
        }
    }
}

/// One slice times out, the rest find nothing.
struct FailingEngine;

impl AstrometryEngine for FailingEngine {
    fn solve(&self, job: &SolveJob, _cancel: &CancelMonitor) -> Result<EngineSolution, SolveError> {
        let covers_8_deg = match (job.scale_low_app, job.scale_high_app) {
            (Some(lo), Some(hi)) => {
                let app = 8.0 * 3600.0 / job.image_width as f64;
                lo <= app && app <= hi
            }
            _ => false,
        };
        if covers_8_deg {
            Err(SolveError::Timeout("simulated solver timeout".into()))
        } else {
            Err(SolveError::NoSolution("nothing matched".into()))
        }
    }
}

/// Blocks until cancelled.
struct BlockingEngine;

impl AstrometryEngine for BlockingEngine {
    fn solve(&self, _job: &SolveJob, cancel: &CancelMonitor) -> Result<EngineSolution, SolveError> {
        if wait_for_cancel(cancel, Duration::from_secs(30)) {
            Err(SolveError::Aborted("cancel sentinel observed".into()))
        } else {
            Err(SolveError::NoSolution("never cancelled".into()))
        }
    }
}

/// Solves anything immediately, counting invocations.
struct CountingEngine {
    solve_calls: AtomicUsize,
}

impl AstrometryEngine for CountingEngine {
    fn solve(&self, job: &SolveJob, _cancel: &CancelMonitor) -> Result<EngineSolution, SolveError> {
        self.solve_calls.fetch_add(1, Ordering::SeqCst);
        Ok(engine_solution(job.image_width, job.image_height))
    }
}

struct FixedProbe(u64);

impl ResourceProbe for FixedProbe {
    fn installed_ram_bytes(&self) -> u64 {
        self.0
    }
}

fn parallel_params() -> Parameters {
    let mut params = Parameters::default();
    params.multi_algorithm = MultiAlgorithm::MultiAuto;
    params.min_width = 1.0;
    params.max_width = 10.0;
    params.keep_num = 50;
    params
}

fn racing_engine(astrometry: Arc<dyn AstrometryEngine>) -> SolveEngine {
    let image = star_field_image(512, 512, 32);
    let mut engine = SolveEngine::new(image, parallel_params(), ProcessType::IntSolve);
    engine.set_astrometry_engine(astrometry);
    engine.set_resource_probe(Arc::new(FixedProbe(u64::MAX)));
    engine.set_index_folder_paths(Vec::new());
    engine.set_thread_count(4);
    engine
}

#[test]
fn test_first_successful_child_wins_and_others_abort() {
    init_logging();
    let astrometry = Arc::new(SliceTargetEngine::new(2.0));
    let mut engine = racing_engine(astrometry.clone());
    let outcome = engine.execute_blocking().unwrap();

    // Up to four children raced (a loser can be cancelled before its
    // solver is even entered); exactly one crossed the line.
    let calls = astrometry.solve_calls.load(Ordering::SeqCst);
    assert!((1..=4).contains(&calls), "{} solve calls", calls);
    assert_eq!(astrometry.successes.load(Ordering::SeqCst), 1);

    let solution = outcome.solution.expect("race should produce a solution");
    assert_eq!(solution.ra, 210.125);
    assert!(outcome.wcs_ready);
    assert!(!outcome.stars.is_empty());
    assert!(outcome.stars.iter().all(|s| s.ra.is_some() && s.dec.is_some()));
    for star in &outcome.stars {
        let ra = star.ra.unwrap();
        let dec = star.dec.unwrap();
        assert!((0.0..360.0).contains(&ra));
        assert!((-90.0..=90.0).contains(&dec));
    }
}

#[test]
fn test_multi_depths_scheduling_with_scale_hint() {
    init_logging();
    let astrometry = Arc::new(DepthTargetEngine {
        winning_depth_low: 25,
        windows: Mutex::new(Vec::new()),
        successes: AtomicUsize::new(0),
    });
    let mut engine = racing_engine(astrometry.clone());
    // A scale hint alone resolves MultiAuto to depth racing.
    engine.set_search_scale(0.5, 2.0, ScaleUnits::ArcsecPerPix);
    let outcome = engine.execute_blocking().unwrap();
    assert!(outcome.solution.is_some());
    assert_eq!(astrometry.successes.load(Ordering::SeqCst), 1);

    let windows = astrometry.windows.lock().unwrap().clone();
    // keep_num 50 across 4 threads: inc 12, windows stepping from depth 1.
    // Losers cancelled before entering the solver leave no record, but
    // every observed window must come from that partition and the winning
    // one must be among them.
    let expected = [(1, 13), (13, 25), (25, 37), (37, 49), (49, 61)];
    assert!(windows.iter().all(|w| expected.contains(w)), "{:?}", windows);
    assert!(windows.contains(&(25, 37)));
}

#[test]
fn test_scale_and_position_hints_disable_racing() {
    init_logging();
    let astrometry = Arc::new(CountingEngine {
        solve_calls: AtomicUsize::new(0),
    });
    let mut engine = racing_engine(astrometry.clone());
    engine.set_search_scale(0.5, 2.0, ScaleUnits::ArcsecPerPix);
    engine.set_search_position_deg(10.0, 41.0);
    let outcome = engine.execute_blocking().unwrap();

    // MultiAuto with both hints means one fully-constrained solver.
    assert_eq!(astrometry.solve_calls.load(Ordering::SeqCst), 1);
    let solution = outcome.solution.unwrap();
    assert!(solution.ra_error.is_some());
    assert!(solution.dec_error.is_some());
}

#[test]
fn test_all_children_failing_reports_most_informative_error() {
    init_logging();
    let mut engine = racing_engine(Arc::new(FailingEngine));
    let err = engine.execute_blocking().unwrap_err();
    // One slice timed out, the others found nothing: timeout wins.
    assert!(matches!(err, SolveError::Timeout(_)), "got {:?}", err);
}

#[test]
fn test_global_abort_drains_quickly_without_wcs() {
    init_logging();
    let engine = racing_engine(Arc::new(BlockingEngine));
    let handle = engine.start();
    std::thread::sleep(Duration::from_millis(100));
    let abort_time = Instant::now();
    handle.abort();
    let (engine, result) = handle.wait();

    assert!(
        abort_time.elapsed() < Duration::from_secs(2),
        "abort took {:?}",
        abort_time.elapsed()
    );
    assert!(matches!(result, Err(SolveError::Aborted(_))));
    assert!(!engine.has_wcs());
    assert!(engine.wcs_coordinate_map().is_none());
}

#[test]
fn test_ram_admission_forces_single_worker() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index-4107.fits"), vec![0u8; 4096]).unwrap();

    let astrometry = Arc::new(CountingEngine {
        solve_calls: AtomicUsize::new(0),
    });
    let image = star_field_image(512, 512, 32);
    let mut engine = SolveEngine::new(image, parallel_params(), ProcessType::IntSolve);
    engine.set_astrometry_engine(astrometry.clone());
    engine.set_index_folder_paths(vec![dir.path().to_path_buf()]);
    engine.set_thread_count(4);
    // The indexes outweigh installed memory: no parallel solving.
    engine.set_resource_probe(Arc::new(FixedProbe(1024)));

    let outcome = engine.execute_blocking().unwrap();
    assert_eq!(astrometry.solve_calls.load(Ordering::SeqCst), 1);
    assert!(outcome.solution.is_some());
}

#[test]
fn test_unknown_ram_refuses_parallel() {
    init_logging();
    let astrometry = Arc::new(CountingEngine {
        solve_calls: AtomicUsize::new(0),
    });
    let mut engine = racing_engine(astrometry.clone());
    engine.set_resource_probe(Arc::new(FixedProbe(0)));
    engine.execute_blocking().unwrap();
    assert_eq!(astrometry.solve_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_engine_is_single_shot() {
    init_logging();
    let astrometry = Arc::new(CountingEngine {
        solve_calls: AtomicUsize::new(0),
    });
    let mut engine = racing_engine(astrometry);
    engine.set_search_scale(0.5, 2.0, ScaleUnits::ArcsecPerPix);
    engine.set_search_position_deg(10.0, 41.0);
    engine.execute_blocking().unwrap();
    let err = engine.execute_blocking().unwrap_err();
    assert!(matches!(err, SolveError::InvalidInput(_)));
}

#[test]
fn test_extraction_only_run() {
    init_logging();
    let image = star_field_image(512, 512, 32);
    let mut params = Parameters::default();
    params.keep_num = 30;
    let mut engine = SolveEngine::new(image, params, ProcessType::IntExtract);
    let outcome = engine.execute_blocking().unwrap();
    assert_eq!(outcome.stars.len(), 30);
    assert!(outcome.background.is_some());
    assert!(outcome.solution.is_none());
    assert!(!outcome.wcs_ready);
}
