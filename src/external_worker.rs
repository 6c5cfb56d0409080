// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::engine::CancelMonitor;
use crate::error::SolveError;
use crate::extractor::Extractor;
use crate::image::ImageDescriptor;
use crate::internal_worker::{apply_star_filters, run_internal_extraction, MIN_STARS_TO_SOLVE};
use crate::params::{convert_to_degree_height, Parameters, ScaleUnits};
use crate::star::{Background, Solution, Star};
use crate::wcs::{normalize_ra, TanWcs, WcsProjector};
use crate::worker::{ProcessType, SolverWorker};
use crate::xyls;

/// Which external solver binary does the matching.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExternalSolverKind {
    AstrometryNet,
    Astap,
}

/// How long a process gets to exit on its own after a cancel request
/// before it is killed.
const KILL_GRACE: Duration = Duration::from_secs(1);

/// SolverWorker driving the external SExtractor / solve-field / ASTAP
/// binaries through child processes and temp files.
pub struct ExternalWorker {
    process_type: ProcessType,
    image: ImageDescriptor,
    params: Parameters,
    extractor: Arc<dyn Extractor>,
    index_folders: Vec<PathBuf>,

    base_path: PathBuf,
    base_name: String,
    cancel: CancelMonitor,
    solved_file: PathBuf,
    temp_files: Vec<PathBuf>,

    pub sextractor_path: PathBuf,
    pub solver_path: PathBuf,
    pub astap_path: PathBuf,
    pub solver_kind: ExternalSolverKind,
    /// Path of the image file on disk, required by the binaries that read
    /// images rather than star lists.
    pub file_to_process: Option<PathBuf>,
    pub config_path: Option<PathBuf>,
    pub cleanup_temporary_files: bool,
    pub auto_generate_config: bool,

    scale: Option<(f64, f64, ScaleUnits)>,
    position: Option<(f64, f64)>,
    depth: Option<(u32, u32)>,

    stars: Vec<Star>,
    background: Option<Background>,
    solution: Option<Solution>,
    projector: Option<Box<dyn WcsProjector>>,
    has_extracted: bool,
    has_solved: bool,
    is_child: bool,
}

impl ExternalWorker {
    pub fn new(
        process_type: ProcessType,
        image: ImageDescriptor,
        params: Parameters,
        extractor: Arc<dyn Extractor>,
    ) -> Self {
        let base_path = std::env::temp_dir();
        let base_name = format!("external_solver_{}", rand::random::<u32>());
        let cancel = CancelMonitor::new(Some(base_path.join(format!("{}.cancel", base_name))));
        let solved_file = base_path.join(format!("{}.solved", base_name));
        let (sextractor_path, solver_path, astap_path) = default_binary_paths();
        ExternalWorker {
            process_type,
            image,
            params,
            extractor,
            index_folders: Vec::new(),
            base_path,
            base_name,
            cancel,
            solved_file,
            temp_files: Vec::new(),
            sextractor_path,
            solver_path,
            astap_path,
            solver_kind: ExternalSolverKind::AstrometryNet,
            file_to_process: None,
            config_path: None,
            cleanup_temporary_files: true,
            auto_generate_config: true,
            scale: None,
            position: None,
            depth: None,
            stars: Vec::new(),
            background: None,
            solution: None,
            projector: None,
            has_extracted: false,
            has_solved: false,
            is_child: false,
        }
    }

    pub fn set_index_folder_paths(&mut self, folders: Vec<PathBuf>) {
        self.index_folders = folders;
    }

    pub fn set_base_path(&mut self, base_path: PathBuf) {
        self.base_path = base_path;
        self.cancel = CancelMonitor::new(Some(
            self.base_path.join(format!("{}.cancel", self.base_name)),
        ));
        self.solved_file = self.base_path.join(format!("{}.solved", self.base_name));
    }

    fn temp_path(&mut self, suffix: &str) -> PathBuf {
        let path = self.base_path.join(format!("{}.{}", self.base_name, suffix));
        if !self.temp_files.contains(&path) {
            self.temp_files.push(path.clone());
        }
        path
    }

    /// Runs the external SExtractor binary over `file_to_process` and reads
    /// its catalog back.
    fn run_external_sextractor(&mut self) -> Result<(), SolveError> {
        let input = self
            .file_to_process
            .clone()
            .ok_or_else(|| {
                SolveError::InvalidInput(
                    "external extraction needs file_to_process set to the image on disk".into(),
                )
            })?;
        if !input.exists() {
            return Err(SolveError::ExternalToolFailure(format!(
                "image file {} does not exist",
                input.display()
            )));
        }

        let catalog = self.temp_path("xyls");
        let param_file = self.temp_path("param");
        let conv_file = self.temp_path("conv");
        write_text(&param_file, "X_IMAGE\nY_IMAGE\nMAG_AUTO\n")?;
        write_text(&conv_file, &conv_filter_text(&self.params.conv_filter))?;

        let mut cmd = Command::new(&self.sextractor_path);
        cmd.arg(&input)
            .arg("-CATALOG_NAME")
            .arg(&catalog)
            .arg("-CATALOG_TYPE")
            .arg("FITS_1.0")
            .arg("-PARAMETERS_NAME")
            .arg(&param_file)
            .arg("-FILTER")
            .arg("Y")
            .arg("-FILTER_NAME")
            .arg(&conv_file)
            .arg("-MAG_ZEROPOINT")
            .arg(self.params.magzero.to_string())
            .arg("-DETECT_MINAREA")
            .arg(self.params.minarea.to_string())
            .arg("-DEBLEND_NTHRESH")
            .arg(self.params.deblend_thresh.to_string())
            .arg("-DEBLEND_MINCONT")
            .arg(self.params.deblend_contrast.to_string())
            .arg("-CLEAN")
            .arg(if self.params.clean { "Y" } else { "N" })
            .arg("-CLEAN_PARAM")
            .arg(self.params.clean_param.to_string());

        let status = self.run_to_completion(cmd, "sextractor")?;
        if status != 0 {
            return Err(SolveError::ExternalToolFailure(format!(
                "sextractor exited with status {}",
                status
            )));
        }

        let rows = xyls::read_xyls(&catalog)?;
        let mut stars: Vec<Star> = rows
            .into_iter()
            .map(|(x, y, mag)| {
                let mut s = Star::new(x, y);
                s.mag = mag;
                s.flux = 10f32.powf((self.params.magzero as f32 - mag) / 2.5);
                s
            })
            .collect();
        if stars.is_empty() {
            return Err(SolveError::ExtractionFailed(
                "external extractor found no stars".into(),
            ));
        }
        // The three-column catalog carries no shape information, so the
        // size and ellipticity filters cannot run here.
        let mut filter_params = self.params.clone();
        filter_params.min_size = 0.0;
        filter_params.max_size = 0.0;
        filter_params.max_ellipse = 0.0;
        stars = apply_star_filters(&filter_params, stars, None);
        self.stars = stars;
        self.background = Some(Background::default());
        self.has_extracted = true;
        Ok(())
    }

    fn solver_args(&mut self, xyls_file: &Path, wcs_file: &Path) -> Result<Vec<String>, SolveError> {
        let mut args: Vec<String> = Vec::new();
        let push = |args: &mut Vec<String>, items: &[&str]| {
            for item in items {
                args.push(item.to_string());
            }
        };
        // Always overwrite, skip plots/verification, and solve for the
        // image center.
        push(&mut args, &["-O", "--no-plots", "--no-verify", "--crpix-center"]);
        // Suppress the output files nothing here consumes.
        push(&mut args, &["--match", "none"]);
        push(&mut args, &["--corr", "none"]);
        push(&mut args, &["--new-fits", "none"]);
        push(&mut args, &["--rdls", "none"]);

        if self.params.resort {
            args.push("--resort".into());
        }
        if let Some((lo, hi)) = self.depth {
            args.push("--depth".into());
            args.push(format!("{}-{}", lo, hi));
        }
        if self.params.keep_num > 0 {
            args.push("--objs".into());
            args.push(self.params.keep_num.to_string());
        }
        args.push("--odds-to-solve".into());
        args.push(self.params.logratio_tosolve.exp().to_string());
        args.push("--odds-to-tune-up".into());
        args.push(self.params.logratio_totune.exp().to_string());

        if let Some((lo, hi, units)) = self.scale {
            push(&mut args, &["-L"]);
            args.push(lo.to_string());
            push(&mut args, &["-H"]);
            args.push(hi.to_string());
            push(&mut args, &["-u"]);
            args.push(units.unit_string().into());
        }
        if let Some((ra, dec)) = self.position {
            args.push("-3".into());
            args.push(ra.to_string());
            args.push("-4".into());
            args.push(dec.to_string());
            args.push("-5".into());
            args.push(self.params.search_radius.to_string());
        }

        // Star-list input: dimensions and column names, sorted brightest
        // first, with the image-specific spatial filters disabled.
        args.push("--width".into());
        args.push(self.image.width().to_string());
        args.push("--height".into());
        args.push(self.image.height().to_string());
        push(&mut args, &["--x-column", "X_IMAGE", "--y-column", "Y_IMAGE"]);
        if self.params.resort {
            push(&mut args, &["--sort-column", "MAG_AUTO", "--sort-ascending"]);
        }
        push(&mut args, &["--no-remove-lines", "--uniformize", "0"]);

        let config = self.ensure_config()?;
        push(&mut args, &["--backend-config"]);
        args.push(config.display().to_string());

        args.push("--cancel".into());
        args.push(
            self.cancel
                .cancel_file()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        );
        args.push("--solved".into());
        args.push(self.solved_file.display().to_string());
        args.push("-W".into());
        args.push(wcs_file.display().to_string());

        args.push(xyls_file.display().to_string());
        Ok(args)
    }

    /// Writes the solver configuration file when auto-generation is on and
    /// no usable config exists yet.
    fn ensure_config(&mut self) -> Result<PathBuf, SolveError> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Ok(path.clone());
            }
        }
        if !self.auto_generate_config {
            return Err(SolveError::InvalidInput(
                "no solver configuration file and auto-generation is off".into(),
            ));
        }
        let path = match &self.config_path {
            Some(p) => p.clone(),
            None => self.temp_path("cfg"),
        };
        let mut text = String::new();
        if self.params.in_parallel {
            text.push_str("inparallel\n");
        }
        text.push_str(&format!("minwidth {}\n", self.params.min_width));
        text.push_str(&format!("maxwidth {}\n", self.params.max_width));
        text.push_str(&format!("cpulimit {}\n", self.params.solver_time_limit));
        text.push_str("autoindex\n");
        for folder in &self.index_folders {
            text.push_str(&format!("add_path {}\n", folder.display()));
        }
        write_text(&path, &text)?;
        self.config_path = Some(path.clone());
        Ok(path)
    }

    /// Runs solve-field over the extracted star list and loads the WCS it
    /// writes back.
    fn run_solve_field(&mut self) -> Result<(), SolveError> {
        let xyls_file = self.temp_path("xyls");
        let wcs_file = self.temp_path("wcs");
        xyls::write_xyls(&xyls_file, &self.stars, self.image.width(), self.image.height())?;
        let args = self.solver_args(&xyls_file, &wcs_file)?;

        let mut cmd = Command::new(&self.solver_path);
        cmd.args(&args);
        debug!("running {} {}", self.solver_path.display(), args.join(" "));
        let status = self.run_to_completion(cmd, "solve-field")?;
        if self.cancel.is_cancelled() && !wcs_file.exists() {
            return Err(SolveError::Aborted("solve-field cancelled".into()));
        }
        if status != 0 {
            return Err(SolveError::ExternalToolFailure(format!(
                "solve-field exited with status {}",
                status
            )));
        }
        if !wcs_file.exists() {
            return Err(SolveError::NoSolution(
                "solve-field wrote no WCS file".into(),
            ));
        }
        self.load_solution_from_wcs(&wcs_file)
    }

    /// Runs the ASTAP CLI over the image file.
    fn run_astap(&mut self) -> Result<(), SolveError> {
        let input = self.file_to_process.clone().ok_or_else(|| {
            SolveError::InvalidInput("ASTAP needs file_to_process set to the image on disk".into())
        })?;
        let solution_file = self.temp_path("ini");
        let wcs_file = input.with_extension("wcs");
        self.temp_files.push(wcs_file.clone());

        let mut cmd = Command::new(&self.astap_path);
        cmd.arg("-o")
            .arg(&solution_file)
            .arg("-speed")
            .arg("auto")
            .arg("-f")
            .arg(&input)
            .arg("-wcs");
        if self.params.downsample > 1 {
            cmd.arg("-z").arg(self.params.downsample.to_string());
        }
        if let Some((lo, hi, units)) = self.scale {
            let fov = convert_to_degree_height((lo + hi) / 2.0, units, self.image.height());
            cmd.arg("-fov").arg(fov.to_string());
        }
        if let Some((ra, dec)) = self.position {
            cmd.arg("-ra").arg((ra / 15.0).to_string());
            cmd.arg("-spd").arg((dec + 90.0).to_string());
            cmd.arg("-r").arg(self.params.search_radius.to_string());
        }

        let status = self.run_to_completion(cmd, "astap")?;
        if self.cancel.is_cancelled() {
            return Err(SolveError::Aborted("astap cancelled".into()));
        }
        if status != 0 {
            return Err(SolveError::ExternalToolFailure(format!(
                "astap exited with status {}",
                status
            )));
        }
        if !wcs_file.exists() {
            return Err(SolveError::NoSolution("astap wrote no WCS file".into()));
        }
        self.load_solution_from_wcs(&wcs_file)
    }

    fn load_solution_from_wcs(&mut self, wcs_file: &Path) -> Result<(), SolveError> {
        let cards = parse_wcs_file(wcs_file)?;
        let (solution, projector) =
            solution_from_wcs_cards(&cards, self.image.width(), self.image.height(), self.position)?;
        info!(
            "field center ({:.6}, {:.6}) deg, scale {:.4}\"/px, rotation {:.2} deg",
            solution.ra, solution.dec, solution.pixscale, solution.orientation
        );
        self.solution = Some(solution);
        self.projector = Some(Box::new(projector));
        self.has_solved = true;
        // Let any racing siblings know the field is done.
        let _ = fs::write(&self.solved_file, b"solved");
        Ok(())
    }

    /// Waits for a spawned process, enforcing the solve time limit and the
    /// cancel protocol (grace period, then kill). Stdout/stderr are
    /// drained into the log.
    fn run_to_completion(&self, mut cmd: Command, tag: &'static str) -> Result<i32, SolveError> {
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child: Child = cmd.spawn().map_err(|e| {
            SolveError::ExternalToolFailure(format!("could not start {}: {}", tag, e))
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_worker = stdout.map(|out| {
            thread::spawn(move || {
                for line in BufReader::new(out).lines().map_while(Result::ok) {
                    debug!("{}: {}", tag, line);
                }
            })
        });
        let err_worker = stderr.map(|err| {
            thread::spawn(move || {
                for line in BufReader::new(err).lines().map_while(Result::ok) {
                    warn!("{}: {}", tag, line);
                }
            })
        });

        let deadline =
            Instant::now() + Duration::from_secs(self.params.solver_time_limit as u64).mul_f64(1.2);
        let mut cancel_seen: Option<Instant> = None;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(e) => {
                    let _ = child.kill();
                    return Err(SolveError::ExternalToolFailure(format!(
                        "waiting on {}: {}",
                        tag, e
                    )));
                }
            }
            if self.cancel.is_cancelled() {
                match cancel_seen {
                    None => cancel_seen = Some(Instant::now()),
                    Some(seen) if seen.elapsed() > KILL_GRACE => {
                        debug!("{} ignored the cancel sentinel, killing it", tag);
                        let _ = child.kill();
                    }
                    Some(_) => {}
                }
            } else if Instant::now() > deadline {
                warn!("{} ran past the solve time limit, killing it", tag);
                let _ = child.kill();
                let _ = child.wait();
                if let Some(w) = out_worker {
                    let _ = w.join();
                }
                if let Some(w) = err_worker {
                    let _ = w.join();
                }
                return Err(SolveError::Timeout(format!(
                    "{} exceeded {} s",
                    tag, self.params.solver_time_limit
                )));
            }
            thread::sleep(Duration::from_millis(100));
        };

        if let Some(w) = out_worker {
            let _ = w.join();
        }
        if let Some(w) = err_worker {
            let _ = w.join();
        }
        Ok(status.code().unwrap_or(-1))
    }

    fn cleanup_temp_files(&mut self) {
        if !self.cleanup_temporary_files {
            return;
        }
        for path in self.temp_files.drain(..) {
            let _ = fs::remove_file(path);
        }
        if !self.is_child {
            self.cancel.remove_file();
            let _ = fs::remove_file(&self.solved_file);
        }
    }
}

impl Drop for ExternalWorker {
    fn drop(&mut self) {
        self.cleanup_temp_files();
    }
}

impl SolverWorker for ExternalWorker {
    fn process_type(&self) -> ProcessType {
        self.process_type
    }

    fn cancel_monitor(&self) -> CancelMonitor {
        self.cancel.clone()
    }

    fn extract(&mut self) -> Result<(), SolveError> {
        if self.process_type == ProcessType::IntExtractExtSolve {
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
        } else {
            self.run_external_sextractor()
        }
    }

    fn solve(&mut self) -> Result<(), SolveError> {
        if self.solved_file.exists() {
            return Err(SolveError::Aborted(
                "a sibling already solved the field".into(),
            ));
        }
        match self.solver_kind {
            ExternalSolverKind::Astap => self.run_astap(),
            ExternalSolverKind::AstrometryNet => {
                if self.stars.len() < MIN_STARS_TO_SOLVE {
                    return Err(SolveError::InsufficientStars(format!(
                        "{} stars after filtering, need at least {}",
                        self.stars.len(),
                        MIN_STARS_TO_SOLVE
                    )));
                }
                self.run_solve_field()
            }
        }
    }

    fn spawn_child(&self, n: usize) -> Result<Box<dyn SolverWorker>, SolveError> {
        if !self.has_extracted {
            return Err(SolveError::InvalidInput(
                "cannot spawn a child before extraction".into(),
            ));
        }
        let mut child = ExternalWorker::new(
            self.process_type.child_type(),
            self.image.clone(),
            self.params.clone(),
            self.extractor.clone(),
        );
        child.base_path = self.base_path.clone();
        child.base_name = format!("{}_{}", self.base_name, n);
        child.cancel = CancelMonitor::new(Some(
            self.base_path.join(format!("{}.cancel", child.base_name)),
        ));
        // Siblings watch one solved sentinel so the first success stops
        // the rest even without shared memory.
        child.solved_file = self.solved_file.clone();
        child.index_folders = self.index_folders.clone();
        child.sextractor_path = self.sextractor_path.clone();
        child.solver_path = self.solver_path.clone();
        child.astap_path = self.astap_path.clone();
        child.solver_kind = self.solver_kind;
        child.file_to_process = self.file_to_process.clone();
        child.cleanup_temporary_files = self.cleanup_temporary_files;
        child.auto_generate_config = self.auto_generate_config;
        child.scale = self.scale;
        child.position = self.position;
        child.stars = self.stars.clone();
        child.background = self.background;
        child.has_extracted = true;
        child.is_child = true;
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

fn default_binary_paths() -> (PathBuf, PathBuf, PathBuf) {
    if cfg!(target_os = "macos") {
        (
            PathBuf::from("/usr/local/bin/sex"),
            PathBuf::from("/usr/local/bin/solve-field"),
            PathBuf::from("/usr/local/opt/astap/astap"),
        )
    } else if cfg!(windows) {
        (
            PathBuf::from("C:/cygwin/bin/sextractor.exe"),
            PathBuf::from("C:/cygwin/bin/solve-field.exe"),
            PathBuf::from("C:/Program Files/astap/astap.exe"),
        )
    } else {
        (
            PathBuf::from("/usr/bin/sextractor"),
            PathBuf::from("/usr/bin/solve-field"),
            PathBuf::from("/opt/astap/astap"),
        )
    }
}

fn write_text(path: &Path, text: &str) -> Result<(), SolveError> {
    let mut file = fs::File::create(path).map_err(|e| {
        SolveError::ExternalToolFailure(format!("could not create {}: {}", path.display(), e))
    })?;
    file.write_all(text.as_bytes()).map_err(|e| {
        SolveError::ExternalToolFailure(format!("could not write {}: {}", path.display(), e))
    })
}

/// Renders the convolution kernel in SExtractor's filter-file format.
fn conv_filter_text(filter: &[f32]) -> String {
    let size = (filter.len() as f64).sqrt() as usize;
    let mut text = String::from("CONV NORM\n");
    for row in filter.chunks(size.max(1)) {
        let cells: Vec<String> = row.iter().map(|v| format!("{:.6}", v)).collect();
        text.push_str(&cells.join(" "));
        text.push('\n');
    }
    text
}

/// Reads the key/value cards out of a WCS output file. solve-field writes
/// a FITS header block (80-column cards, no newlines); ASTAP writes plain
/// text lines. Both shapes land in the same map.
pub(crate) fn parse_wcs_file(path: &Path) -> Result<HashMap<String, f64>, SolveError> {
    let bytes = fs::read(path).map_err(|e| {
        SolveError::ExternalToolFailure(format!("could not read {}: {}", path.display(), e))
    })?;
    let text = String::from_utf8_lossy(&bytes);
    let cards: Vec<String> = if text.contains('\n') {
        text.lines().map(|l| l.to_string()).collect()
    } else {
        text.as_bytes()
            .chunks(80)
            .map(|c| String::from_utf8_lossy(c).to_string())
            .collect()
    };

    let mut values = HashMap::new();
    for card in cards {
        let Some(eq) = card.find('=') else { continue };
        let key = card[..eq].trim().to_string();
        if key.is_empty() || key == "COMMENT" || key == "HISTORY" {
            continue;
        }
        let value_part = card[eq + 1..].trim();
        let value_token = value_part.split(['/', ' ']).next().unwrap_or("");
        if let Ok(value) = value_token.parse::<f64>() {
            values.insert(key, value);
        }
    }
    Ok(values)
}

/// Builds the solution and projection from parsed WCS cards. Accepts
/// either a CD matrix or the CDELT/CROTA form.
pub(crate) fn solution_from_wcs_cards(
    cards: &HashMap<String, f64>,
    image_width: usize,
    image_height: usize,
    position_hint: Option<(f64, f64)>,
) -> Result<(Solution, TanWcs), SolveError> {
    let get = |key: &str| cards.get(key).copied();
    let crval1 = get("CRVAL1");
    let crval2 = get("CRVAL2");
    let (crval1, crval2) = match (crval1, crval2) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(SolveError::NoSolution(
                "WCS output lacks CRVAL keywords".into(),
            ))
        }
    };
    let crpix1 = get("CRPIX1").unwrap_or(image_width as f64 / 2.0);
    let crpix2 = get("CRPIX2").unwrap_or(image_height as f64 / 2.0);

    let cd = match (get("CD1_1"), get("CD1_2"), get("CD2_1"), get("CD2_2")) {
        (Some(a), Some(b), Some(c), Some(d)) => [[a, b], [c, d]],
        _ => {
            let cdelt1 = get("CDELT1").ok_or_else(|| {
                SolveError::NoSolution("WCS output lacks both CD matrix and CDELT".into())
            })?;
            let cdelt2 = get("CDELT2").unwrap_or(cdelt1.abs());
            let rota = get("CROTA2").or(get("CROTA1")).unwrap_or(0.0).to_radians();
            [
                [cdelt1 * rota.cos(), -cdelt2 * rota.sin()],
                [cdelt1 * rota.sin(), cdelt2 * rota.cos()],
            ]
        }
    };

    let wcs = TanWcs::new(crval1, crval2, crpix1, crpix2, cd, 1);
    let pixscale = wcs.pixel_scale_arcsec();
    if pixscale <= 0.0 {
        return Err(SolveError::NoSolution("WCS output has no pixel scale".into()));
    }
    let mut solution = Solution {
        ra: normalize_ra(crval1),
        dec: crval2,
        orientation: wcs.orientation_deg(),
        pixscale,
        parity: wcs.parity(),
        field_width: image_width as f64 * pixscale / 60.0,
        field_height: image_height as f64 * pixscale / 60.0,
        ra_error: None,
        dec_error: None,
    };
    if let Some((ra, dec)) = position_hint {
        solution.ra_error = Some((ra - solution.ra) * 3600.0);
        solution.dec_error = Some((dec - solution.dec) * 3600.0);
    }
    Ok((solution, wcs))
}
