// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Embeddable astrometric plate solving: star extraction, a racing
//! multi-solver orchestration engine over in-process, external-binary and
//! online back-ends, and WCS annotation of the extracted star list.

pub mod engine;
pub mod error;
pub mod external_worker;
pub mod extractor;
pub mod image;
pub mod internal_worker;
pub mod online_worker;
pub mod params;
pub mod profiles;
pub mod resource;
pub mod solve_engine;
pub mod star;
pub mod wcs;
pub mod worker;
pub mod xyls;

pub use engine::{AstrometryEngine, CancelMonitor, EngineSolution, SolveJob};
pub use error::SolveError;
pub use extractor::{ConvolutionExtractor, Extraction, Extractor};
pub use image::{ImageDescriptor, PixelFormat, Rect};
pub use params::{ApertureShape, MultiAlgorithm, Parameters, ScaleUnits, SearchParity};
pub use profiles::StockProfile;
pub use resource::{ResourceProbe, SystemProbe};
pub use solve_engine::{SolveEngine, SolveEngineHandle, SolveOutcome};
pub use star::{Background, Parity, Solution, Star};
pub use wcs::{TanWcs, WcsProjector};
pub use worker::{ProcessType, SolverWorker, WorkerState};
