// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::thread::JoinHandle;

use log::debug;

use crate::engine::CancelMonitor;
use crate::error::SolveError;
use crate::params::ScaleUnits;
use crate::star::{Background, Solution, Star};
use crate::wcs::WcsProjector;

/// What a worker does when started.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessType {
    /// In-process extraction only.
    IntExtract,
    /// In-process extraction with half-flux radii.
    IntExtractHfr,
    /// In-process extraction (unless already done) plus in-process solving.
    IntSolve,
    /// External extractor binary only.
    ExtExtract,
    ExtExtractHfr,
    /// External extraction (unless already done) plus external solving.
    ExtSolve,
    /// In-process extraction feeding the external solver.
    IntExtractExtSolve,
    /// Upload the image file to the online service.
    OnlineSolve,
    /// In-process extraction, then upload the star list.
    IntExtractOnlineSolve,
}

impl ProcessType {
    pub fn wants_hfr(self) -> bool {
        matches!(self, ProcessType::IntExtractHfr | ProcessType::ExtExtractHfr)
    }

    pub fn extraction_only(self) -> bool {
        matches!(
            self,
            ProcessType::IntExtract
                | ProcessType::IntExtractHfr
                | ProcessType::ExtExtract
                | ProcessType::ExtExtractHfr
        )
    }

    pub fn solves(self) -> bool {
        !self.extraction_only()
    }

    /// Whether this job extracts its own star list before solving.
    pub fn extracts_before_solving(self) -> bool {
        matches!(
            self,
            ProcessType::IntSolve
                | ProcessType::ExtSolve
                | ProcessType::IntExtractExtSolve
                | ProcessType::IntExtractOnlineSolve
        )
    }

    /// Back-ends that can race multiple children over a split search
    /// space. Online solving never parallelizes.
    pub fn supports_parallel(self) -> bool {
        matches!(
            self,
            ProcessType::IntSolve | ProcessType::ExtSolve | ProcessType::IntExtractExtSolve
        )
    }

    pub fn is_online(self) -> bool {
        matches!(
            self,
            ProcessType::OnlineSolve | ProcessType::IntExtractOnlineSolve
        )
    }

    /// The solve-only process a spawned child runs, given that it inherits
    /// the parent's already-extracted star list.
    pub(crate) fn child_type(self) -> ProcessType {
        match self {
            ProcessType::IntExtractExtSolve => ProcessType::ExtSolve,
            ProcessType::IntExtractOnlineSolve => ProcessType::OnlineSolve,
            other => other,
        }
    }
}

/// How a worker's job ended when it succeeded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerOutcome {
    Extracted,
    Solved,
}

/// Worker lifecycle. Transitions are monotonic and the four final states
/// are sticky; a worker that has reached one never runs again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    SucceededExtract,
    SucceededSolve,
    Failed,
    Aborted,
}

impl WorkerState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, WorkerState::Idle | WorkerState::Running)
    }
}

/// One unit that can extract, solve, or both, depending on its process
/// type. Concrete variants cover the in-process, external-binary and
/// online back-ends.
pub trait SolverWorker: Send {
    fn process_type(&self) -> ProcessType;

    /// Shared cancellation handle. Cancelling it requests a cooperative
    /// abort: the flag trips immediately and the worker's cancel-sentinel
    /// file is created for engines that poll the filesystem. Safe to call
    /// before the worker starts; it will then refuse to run.
    fn cancel_monitor(&self) -> CancelMonitor;

    /// Runs detection on the image, respecting any subframe. On success
    /// the star list and background are populated.
    fn extract(&mut self) -> Result<(), SolveError>;

    /// Runs matching with the current scale/position hints and depth
    /// window. On success the solution (and WCS data, when available) is
    /// populated.
    fn solve(&mut self) -> Result<(), SolveError>;

    /// Produces a solve-only sibling that reuses this worker's extracted
    /// star list and background. `n` tags the child for temp-file naming
    /// and logging.
    fn spawn_child(&self, n: usize) -> Result<Box<dyn SolverWorker>, SolveError>;

    fn set_search_scale(&mut self, low: f64, high: f64, units: ScaleUnits);
    fn set_search_position_deg(&mut self, ra: f64, dec: f64);
    fn set_depth_window(&mut self, low: u32, high: u32);

    fn has_extracted(&self) -> bool;
    fn has_solved(&self) -> bool;
    fn stars(&self) -> &[Star];
    fn background(&self) -> Option<Background>;
    fn solution(&self) -> Option<&Solution>;

    /// Hands off the winning projection, leaving the worker without WCS
    /// data. Returns None when the solve produced no WCS.
    fn take_projector(&mut self) -> Option<Box<dyn WcsProjector>>;

    /// Runs whichever of extract/solve the process type implies. This is
    /// the blocking entry point; [`start_worker`] is the threaded one.
    fn execute(&mut self) -> Result<WorkerOutcome, SolveError> {
        if self.cancel_monitor().is_cancelled() {
            return Err(SolveError::Aborted("aborted before start".into()));
        }
        if self.process_type().extraction_only() {
            self.extract()?;
            return Ok(WorkerOutcome::Extracted);
        }
        if self.process_type().extracts_before_solving() && !self.has_extracted() {
            self.extract()?;
        }
        self.solve()?;
        Ok(WorkerOutcome::Solved)
    }
}

/// Terminal report delivered exactly once per started worker.
pub struct FinishedEvent {
    pub index: usize,
    pub result: Result<WorkerOutcome, SolveError>,
}

/// A worker running on its own thread.
pub struct RunningWorker {
    index: usize,
    cancel: CancelMonitor,
    state: Arc<Mutex<WorkerState>>,
    join: Option<JoinHandle<Box<dyn SolverWorker>>>,
}

/// Moves the worker onto its own OS thread. The single `FinishedEvent` is
/// sent just before the thread exits; joining the returned handle gives
/// the worker back for result retrieval.
pub fn start_worker(
    index: usize,
    mut worker: Box<dyn SolverWorker>,
    events: mpsc::Sender<FinishedEvent>,
) -> RunningWorker {
    let cancel = worker.cancel_monitor();
    let state = Arc::new(Mutex::new(WorkerState::Running));
    let thread_state = state.clone();
    let join = thread::spawn(move || {
        let result = worker.execute();
        let next = match &result {
            Ok(WorkerOutcome::Extracted) => WorkerState::SucceededExtract,
            Ok(WorkerOutcome::Solved) => WorkerState::SucceededSolve,
            Err(SolveError::Aborted(_)) => WorkerState::Aborted,
            Err(_) => WorkerState::Failed,
        };
        *thread_state.lock().unwrap() = next;
        if let Err(e) = &result {
            debug!("worker {} finished with {}", index, e);
        }
        // The receiver may already have what it needs and be gone.
        let _ = events.send(FinishedEvent { index, result });
        worker
    });
    RunningWorker {
        index,
        cancel,
        state,
        join: Some(join),
    }
}

impl RunningWorker {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap()
    }

    /// Fire-and-forget cooperative abort.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Blocks until the worker reaches a terminal state, returning it.
    pub fn join(mut self) -> Box<dyn SolverWorker> {
        self.join
            .take()
            .expect("worker joined twice")
            .join()
            .expect("worker thread panicked")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// A scripted worker for exercising the runner.
    struct ScriptedWorker {
        cancel: CancelMonitor,
        result: Result<WorkerOutcome, SolveError>,
        delay: Duration,
        stars: Vec<Star>,
    }

    impl ScriptedWorker {
        fn new(result: Result<WorkerOutcome, SolveError>) -> Self {
            ScriptedWorker {
                cancel: CancelMonitor::new(None),
                result,
                delay: Duration::ZERO,
                stars: Vec::new(),
            }
        }
    }

    impl SolverWorker for ScriptedWorker {
        fn process_type(&self) -> ProcessType {
            ProcessType::IntSolve
        }
        fn cancel_monitor(&self) -> CancelMonitor {
            self.cancel.clone()
        }
        fn extract(&mut self) -> Result<(), SolveError> {
            Ok(())
        }
        fn solve(&mut self) -> Result<(), SolveError> {
            Ok(())
        }
        fn spawn_child(&self, _n: usize) -> Result<Box<dyn SolverWorker>, SolveError> {
            Err(SolveError::InvalidInput("not spawnable".into()))
        }
        fn set_search_scale(&mut self, _low: f64, _high: f64, _units: ScaleUnits) {}
        fn set_search_position_deg(&mut self, _ra: f64, _dec: f64) {}
        fn set_depth_window(&mut self, _low: u32, _high: u32) {}
        fn has_extracted(&self) -> bool {
            true
        }
        fn has_solved(&self) -> bool {
            false
        }
        fn stars(&self) -> &[Star] {
            &self.stars
        }
        fn background(&self) -> Option<Background> {
            None
        }
        fn solution(&self) -> Option<&Solution> {
            None
        }
        fn take_projector(&mut self) -> Option<Box<dyn WcsProjector>> {
            None
        }
        fn execute(&mut self) -> Result<WorkerOutcome, SolveError> {
            if self.cancel_monitor().is_cancelled() {
                return Err(SolveError::Aborted("aborted before start".into()));
            }
            std::thread::sleep(self.delay);
            self.result.clone()
        }
    }

    #[test]
    fn test_exactly_one_finished_event() {
        let (tx, rx) = mpsc::channel();
        let running = start_worker(3, Box::new(ScriptedWorker::new(Ok(WorkerOutcome::Solved))), tx);
        let event = rx.recv().unwrap();
        assert_eq!(event.index, 3);
        assert_eq!(event.result.unwrap(), WorkerOutcome::Solved);
        // Channel closes after the single event.
        assert!(rx.recv().is_err());
        let _ = running.join();
    }

    #[test]
    fn test_states_are_terminal() {
        let (tx, rx) = mpsc::channel();
        let running = start_worker(
            0,
            Box::new(ScriptedWorker::new(Err(SolveError::NoSolution("n".into())))),
            tx,
        );
        rx.recv().unwrap().result.unwrap_err();
        let worker = {
            let r = running;
            // join waits for the terminal state.
            r.join()
        };
        assert!(!worker.has_solved());
    }

    #[test]
    fn test_abort_before_start_marks_will_abort() {
        let worker = ScriptedWorker::new(Ok(WorkerOutcome::Solved));
        worker.cancel_monitor().cancel();
        let (tx, rx) = mpsc::channel();
        let running = start_worker(1, Box::new(worker), tx);
        let event = rx.recv().unwrap();
        assert!(matches!(event.result, Err(SolveError::Aborted(_))));
        assert_eq!(running.state(), WorkerState::Aborted);
        let _ = running.join();
    }

    #[test]
    fn test_abort_is_idempotent() {
        let mut worker = ScriptedWorker::new(Err(SolveError::Aborted("cancelled".into())));
        worker.delay = Duration::from_millis(50);
        let (tx, rx) = mpsc::channel();
        let running = start_worker(0, Box::new(worker), tx);
        running.abort();
        running.abort();
        assert!(matches!(
            rx.recv().unwrap().result,
            Err(SolveError::Aborted(_))
        ));
        let _ = running.join();
    }
}
