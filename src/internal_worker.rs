// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};

use crate::engine::{AstrometryEngine, CancelMonitor, SolveJob};
use crate::error::SolveError;
use crate::extractor::Extractor;
use crate::image::{downsample_floats, ImageDescriptor};
use crate::params::{arcsec_per_pixel_window, Parameters, ScaleUnits};
use crate::star::{Background, Solution, Star};
use crate::wcs::WcsProjector;
use crate::worker::{ProcessType, SolverWorker};

/// Fewest stars worth handing to the matching engine.
pub(crate) const MIN_STARS_TO_SOLVE: usize = 4;

/// Applies the post-extraction star filters in a fixed, total order so two
/// runs over the same input produce identical lists: brightness sort, size
/// window, ellipticity, saturation, keep-N, then the bright/dim percentage
/// trims.
pub(crate) fn apply_star_filters(
    params: &Parameters,
    mut stars: Vec<Star>,
    saturation_ceiling: Option<f64>,
) -> Vec<Star> {
    let before = stars.len();
    if params.resort {
        // Brightest first; ties broken spatially to keep the order total.
        stars.sort_by(|s1, s2| {
            s2.flux
                .total_cmp(&s1.flux)
                .then(s1.y.total_cmp(&s2.y))
                .then(s1.x.total_cmp(&s2.x))
        });
    }

    if params.max_size > 0.0 {
        stars.retain(|s| s.a as f64 <= params.max_size && s.b as f64 <= params.max_size);
    }
    if params.min_size > 0.0 {
        stars.retain(|s| s.a as f64 >= params.min_size && s.b as f64 >= params.min_size);
    }
    if params.max_ellipse > 1.0 {
        stars.retain(|s| (s.a / s.b.max(f32::EPSILON)) as f64 <= params.max_ellipse);
    }
    if params.saturation_limit > 0.0 && params.saturation_limit < 100.0 {
        if let Some(ceiling) = saturation_ceiling {
            let cutoff = params.saturation_limit / 100.0 * ceiling;
            stars.retain(|s| (s.peak as f64) <= cutoff);
        }
    }
    if params.resort && params.keep_num > 0 {
        stars.truncate(params.keep_num as usize);
    }
    if params.resort && params.remove_brightest > 0.0 && params.remove_brightest < 100.0 {
        let n = (stars.len() as f64 * params.remove_brightest / 100.0) as usize;
        stars.drain(..n);
    }
    if params.resort && params.remove_dimmest > 0.0 && params.remove_dimmest < 100.0 {
        let n = (stars.len() as f64 * params.remove_dimmest / 100.0) as usize;
        stars.truncate(stars.len() - n);
    }
    debug!("star filters kept {} of {} sources", stars.len(), before);
    stars
}

/// Runs the in-process extractor over the image's effective region and
/// applies the star filters. Downsampling (solve path only) is undone in
/// the returned pixel coordinates so everything downstream works in the
/// full-resolution frame.
pub(crate) fn run_internal_extraction(
    image: &ImageDescriptor,
    params: &Parameters,
    compute_hfr: bool,
    for_solving: bool,
    extractor: &dyn Extractor,
) -> Result<(Vec<Star>, Background), SolveError> {
    let rect = image.effective_rect();
    let mut pixels = image.to_float();
    let mut width = rect.width;
    let mut height = rect.height;
    let mut factor = 1usize;
    if for_solving && params.downsample > 1 {
        factor = params.downsample as usize;
        let (ds, w, h) = downsample_floats(&pixels, width, height, factor);
        pixels = ds;
        width = w;
        height = h;
    }

    let extraction = extractor.extract(&pixels, width, height, params, compute_hfr)?;
    if extraction.stars.is_empty() {
        return Err(SolveError::ExtractionFailed(
            "extractor returned no stars".into(),
        ));
    }

    let mut stars = extraction.stars;
    if factor > 1 || rect.x > 0 || rect.y > 0 {
        let f = factor as f32;
        let center = (factor as f32 - 1.0) / 2.0;
        for star in &mut stars {
            star.x = star.x * f + center + rect.x as f32;
            star.y = star.y * f + center + rect.y as f32;
            star.a *= f;
            star.b *= f;
            if let Some(hfr) = star.hfr {
                star.hfr = Some(hfr * f);
            }
        }
    }

    let stars = apply_star_filters(params, stars, image.format().saturation_ceiling());
    Ok((stars, extraction.background))
}

/// SolverWorker backed by the in-process extractor and matching engine.
pub struct InternalWorker {
    process_type: ProcessType,
    image: ImageDescriptor,
    params: Parameters,
    extractor: Arc<dyn Extractor>,
    engine: Arc<dyn AstrometryEngine>,
    index_folders: Vec<PathBuf>,

    base_path: PathBuf,
    base_name: String,
    cancel: CancelMonitor,

    scale: Option<(f64, f64, ScaleUnits)>,
    position: Option<(f64, f64)>,
    depth: Option<(u32, u32)>,

    stars: Vec<Star>,
    background: Option<Background>,
    solution: Option<Solution>,
    projector: Option<Box<dyn WcsProjector>>,
    has_extracted: bool,
    has_solved: bool,
}

impl InternalWorker {
    pub fn new(
        process_type: ProcessType,
        image: ImageDescriptor,
        params: Parameters,
        extractor: Arc<dyn Extractor>,
        engine: Arc<dyn AstrometryEngine>,
    ) -> Self {
        let base_path = std::env::temp_dir();
        let base_name = format!("internal_solver_{}", rand::random::<u32>());
        let cancel = CancelMonitor::new(Some(base_path.join(format!("{}.cancel", base_name))));
        InternalWorker {
            process_type,
            image,
            params,
            extractor,
            engine,
            index_folders: Vec::new(),
            base_path,
            base_name,
            cancel,
            scale: None,
            position: None,
            depth: None,
            stars: Vec::new(),
            background: None,
            solution: None,
            projector: None,
            has_extracted: false,
            has_solved: false,
        }
    }

    pub fn set_index_folder_paths(&mut self, folders: Vec<PathBuf>) {
        self.index_folders = folders;
    }

    /// Moves the worker's cancel sentinel under a different directory.
    pub fn set_base_path(&mut self, base_path: PathBuf) {
        self.base_path = base_path;
        self.cancel = CancelMonitor::new(Some(
            self.base_path.join(format!("{}.cancel", self.base_name)),
        ));
    }

    fn build_job(&self) -> SolveJob {
        let (scale_low, scale_high) = match self.scale {
            Some((lo, hi, units)) => {
                let (l, h) = arcsec_per_pixel_window(lo, hi, units, self.image.width());
                (Some(l), Some(h))
            }
            None => (None, None),
        };
        SolveJob {
            stars: self
                .stars
                .iter()
                .map(|s| (s.x as f64, s.y as f64))
                .collect(),
            image_width: self.image.width(),
            image_height: self.image.height(),
            scale_low_app: scale_low,
            scale_high_app: scale_high,
            min_width_deg: self.params.min_width,
            max_width_deg: self.params.max_width,
            depth_low: self.depth.map(|d| d.0),
            depth_high: self.depth.map(|d| d.1),
            center: self.position,
            search_radius: self.params.search_radius,
            parity: self.params.search_parity,
            in_parallel: self.params.in_parallel,
            time_limit: Duration::from_secs(self.params.solver_time_limit as u64),
            logratio_tosolve: self.params.logratio_tosolve,
            logratio_tokeep: self.params.logratio_tokeep,
            logratio_totune: self.params.logratio_totune,
            index_folders: self.index_folders.clone(),
        }
    }
}

impl Drop for InternalWorker {
    fn drop(&mut self) {
        self.cancel.remove_file();
    }
}

impl SolverWorker for InternalWorker {
    fn process_type(&self) -> ProcessType {
        self.process_type
    }

    fn cancel_monitor(&self) -> CancelMonitor {
        self.cancel.clone()
    }

    fn extract(&mut self) -> Result<(), SolveError> {
        let (stars, background) = run_internal_extraction(
            &self.image,
            &self.params,
            self.process_type.wants_hfr(),
            self.process_type.solves(),
            self.extractor.as_ref(),
        )?;
        info!("extraction found {} stars", stars.len());
        self.stars = stars;
        self.background = Some(background);
        self.has_extracted = true;
        Ok(())
    }

    fn solve(&mut self) -> Result<(), SolveError> {
        if self.stars.len() < MIN_STARS_TO_SOLVE {
            return Err(SolveError::InsufficientStars(format!(
                "{} stars after filtering, need at least {}",
                self.stars.len(),
                MIN_STARS_TO_SOLVE
            )));
        }
        let job = self.build_job();
        debug!(
            "solver {} starting: scale {:?}-{:?} app, depth {:?}",
            self.base_name, job.scale_low_app, job.scale_high_app, self.depth
        );
        let engine_solution = self.engine.solve(&job, &self.cancel)?;

        let mut solution = engine_solution.solution;
        if let Some((ra, dec)) = self.position {
            solution.ra_error = Some((ra - solution.ra) * 3600.0);
            solution.dec_error = Some((dec - solution.dec) * 3600.0);
        }
        info!(
            "field center ({:.6}, {:.6}) deg, scale {:.4}\"/px, rotation {:.2} deg",
            solution.ra, solution.dec, solution.pixscale, solution.orientation
        );
        self.solution = Some(solution);
        self.projector = engine_solution.projector;
        self.has_solved = true;
        Ok(())
    }

    fn spawn_child(&self, n: usize) -> Result<Box<dyn SolverWorker>, SolveError> {
        if !self.has_extracted {
            return Err(SolveError::InvalidInput(
                "cannot spawn a child before extraction".into(),
            ));
        }
        let child_name = format!("{}_{}", self.base_name, n);
        let mut child = InternalWorker::new(
            self.process_type.child_type(),
            self.image.clone(),
            self.params.clone(),
            self.extractor.clone(),
            self.engine.clone(),
        );
        child.base_path = self.base_path.clone();
        child.base_name = child_name.clone();
        child.cancel =
            CancelMonitor::new(Some(self.base_path.join(format!("{}.cancel", child_name))));
        child.index_folders = self.index_folders.clone();
        child.scale = self.scale;
        child.position = self.position;
        child.stars = self.stars.clone();
        child.background = self.background;
        child.has_extracted = true;
        Ok(Box::new(child))
    }

    fn set_search_scale(&mut self, low: f64, high: f64, units: ScaleUnits) {
        self.scale = Some((low, high, units));
    }

    fn set_search_position_deg(&mut self, ra: f64, dec: f64) {
        self.position = Some((ra, dec));
    }

    fn set_depth_window(&mut self, low: u32, high: u32) {
        self.depth = Some((low, high));
    }

    fn has_extracted(&self) -> bool {
        self.has_extracted
    }

    fn has_solved(&self) -> bool {
        self.has_solved
    }

    fn stars(&self) -> &[Star] {
        &self.stars
    }

    fn background(&self) -> Option<Background> {
        self.background
    }

    fn solution(&self) -> Option<&Solution> {
        self.solution.as_ref()
    }

    fn take_projector(&mut self) -> Option<Box<dyn WcsProjector>> {
        self.projector.take()
    }
}
