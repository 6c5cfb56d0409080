// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};
use serde_json::{json, Value};

use crate::engine::CancelMonitor;
use crate::error::SolveError;
use crate::extractor::Extractor;
use crate::image::ImageDescriptor;
use crate::internal_worker::{run_internal_extraction, MIN_STARS_TO_SOLVE};
use crate::params::{Parameters, ScaleUnits};
use crate::star::{Background, Parity, Solution, Star};
use crate::wcs::{normalize_ra, TanWcs, WcsProjector};
use crate::worker::{ProcessType, SolverWorker};
use crate::xyls;

/// How often the job queue is polled.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// SolverWorker backed by a remote astrometry.net-compatible HTTP service:
/// log in with the API key, upload the image or the extracted star list,
/// poll the submission until a job appears, poll the job until it settles,
/// then fetch the calibration.
pub struct OnlineWorker {
    process_type: ProcessType,
    image: ImageDescriptor,
    params: Parameters,
    extractor: Arc<dyn Extractor>,

    pub api_url: String,
    pub api_key: String,
    /// Image on disk, uploaded when the process type does not extract.
    pub file_to_process: Option<PathBuf>,

    base_path: PathBuf,
    base_name: String,
    cancel: CancelMonitor,

    scale: Option<(f64, f64, ScaleUnits)>,
    position: Option<(f64, f64)>,

    stars: Vec<Star>,
    background: Option<Background>,
    solution: Option<Solution>,
    projector: Option<Box<dyn WcsProjector>>,
    has_extracted: bool,
    has_solved: bool,
}

impl OnlineWorker {
    pub fn new(
        process_type: ProcessType,
        image: ImageDescriptor,
        params: Parameters,
        extractor: Arc<dyn Extractor>,
    ) -> Self {
        let base_path = std::env::temp_dir();
        let base_name = format!("online_solver_{}", rand::random::<u32>());
        let cancel = CancelMonitor::new(Some(base_path.join(format!("{}.cancel", base_name))));
        OnlineWorker {
            process_type,
            image,
            params,
            extractor,
            api_url: "http://nova.astrometry.net".into(),
            api_key: String::new(),
            file_to_process: None,
            base_path,
            base_name,
            cancel,
            scale: None,
            position: None,
            stars: Vec::new(),
            background: None,
            solution: None,
            projector: None,
            has_extracted: false,
            has_solved: false,
        }
    }

    /// The request-json body for the upload call.
    fn build_upload_request(&self, session: &str) -> Value {
        let mut req = json!({
            "session": session,
            "publicly_visible": "n",
            "allow_modifications": "n",
            "allow_commercial_use": "n",
            "crpix_center": true,
            "parity": self.params.search_parity.as_code(),
        });
        if self.has_extracted {
            req["image_width"] = json!(self.image.width());
            req["image_height"] = json!(self.image.height());
        }
        if self.params.downsample > 1 {
            req["downsample_factor"] = json!(self.params.downsample);
        }
        if let Some((lo, hi, units)) = self.scale {
            req["scale_type"] = json!("ul");
            req["scale_units"] = json!(units.unit_string());
            req["scale_lower"] = json!(lo);
            req["scale_upper"] = json!(hi);
        }
        if let Some((ra, dec)) = self.position {
            req["center_ra"] = json!(ra);
            req["center_dec"] = json!(dec);
            req["radius"] = json!(self.params.search_radius);
        }
        req
    }

    fn transport(e: reqwest::Error) -> SolveError {
        SolveError::TransportFailure(e.to_string())
    }

    fn check_cancel(&self, deadline: Instant) -> Result<(), SolveError> {
        if self.cancel.is_cancelled() {
            return Err(SolveError::Aborted("online solve cancelled".into()));
        }
        if Instant::now() > deadline {
            return Err(SolveError::Timeout(format!(
                "online solve exceeded {} s",
                self.params.solver_time_limit
            )));
        }
        Ok(())
    }

    fn login(&self, client: &reqwest::blocking::Client) -> Result<String, SolveError> {
        let body = json!({ "apikey": self.api_key });
        let response: Value = client
            .post(format!("{}/api/login", self.api_url))
            .form(&[("request-json", body.to_string())])
            .send()
            .map_err(Self::transport)?
            .json()
            .map_err(Self::transport)?;
        if response["status"].as_str() != Some("success") {
            return Err(SolveError::TransportFailure(format!(
                "login rejected: {}",
                response["errormessage"].as_str().unwrap_or("unknown error")
            )));
        }
        response["session"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| SolveError::TransportFailure("login reply had no session".into()))
    }

    fn upload(
        &mut self,
        client: &reqwest::blocking::Client,
        session: &str,
    ) -> Result<u64, SolveError> {
        // Upload the star list when it exists, otherwise the image file.
        let (file_name, payload) = if self.has_extracted {
            let xyls_path = self.base_path.join(format!("{}.xyls", self.base_name));
            xyls::write_xyls(
                &xyls_path,
                &self.stars,
                self.image.width(),
                self.image.height(),
            )?;
            let bytes = fs::read(&xyls_path).map_err(|e| {
                SolveError::TransportFailure(format!("could not reread star list: {}", e))
            })?;
            let _ = fs::remove_file(&xyls_path);
            (format!("{}.xyls", self.base_name), bytes)
        } else {
            let path = self.file_to_process.clone().ok_or_else(|| {
                SolveError::InvalidInput(
                    "online image upload needs file_to_process set to the image on disk".into(),
                )
            })?;
            let bytes = fs::read(&path).map_err(|e| {
                SolveError::TransportFailure(format!("could not read {}: {}", path.display(), e))
            })?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "image.fits".into());
            (name, bytes)
        };

        let request_json = self.build_upload_request(session).to_string();
        let part = reqwest::blocking::multipart::Part::bytes(payload)
            .file_name(file_name)
            .mime_str("application/octet-stream")
            .map_err(Self::transport)?;
        let form = reqwest::blocking::multipart::Form::new()
            .text("request-json", request_json)
            .part("file", part);

        let response: Value = client
            .post(format!("{}/api/upload", self.api_url))
            .multipart(form)
            .send()
            .map_err(Self::transport)?
            .json()
            .map_err(Self::transport)?;
        if response["status"].as_str() != Some("success") {
            return Err(SolveError::TransportFailure(format!(
                "upload rejected: {}",
                response["errormessage"].as_str().unwrap_or("unknown error")
            )));
        }
        response["subid"]
            .as_u64()
            .ok_or_else(|| SolveError::TransportFailure("upload reply had no subid".into()))
    }

    fn wait_for_job(
        &self,
        client: &reqwest::blocking::Client,
        subid: u64,
        deadline: Instant,
    ) -> Result<u64, SolveError> {
        loop {
            self.check_cancel(deadline)?;
            let status: Value = client
                .get(format!("{}/api/submissions/{}", self.api_url, subid))
                .send()
                .map_err(Self::transport)?
                .json()
                .map_err(Self::transport)?;
            if let Some(jobs) = status["jobs"].as_array() {
                if let Some(id) = jobs.iter().filter_map(|j| j.as_u64()).find(|&id| id > 0) {
                    return Ok(id);
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn wait_for_solution(
        &self,
        client: &reqwest::blocking::Client,
        job: u64,
        deadline: Instant,
    ) -> Result<(), SolveError> {
        loop {
            self.check_cancel(deadline)?;
            let status: Value = client
                .get(format!("{}/api/jobs/{}", self.api_url, job))
                .send()
                .map_err(Self::transport)?
                .json()
                .map_err(Self::transport)?;
            match status["status"].as_str() {
                Some("success") => return Ok(()),
                Some("failure") => {
                    return Err(SolveError::NoSolution(
                        "online service found no match".into(),
                    ))
                }
                _ => {}
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn fetch_calibration(
        &mut self,
        client: &reqwest::blocking::Client,
        job: u64,
    ) -> Result<(), SolveError> {
        let cal: Value = client
            .get(format!("{}/api/jobs/{}/calibration", self.api_url, job))
            .send()
            .map_err(Self::transport)?
            .json()
            .map_err(Self::transport)?;
        debug!("calibration reply: {}", cal);

        let ra = cal["ra"]
            .as_f64()
            .ok_or_else(|| SolveError::NoSolution("calibration had no field center".into()))?;
        let dec = cal["dec"].as_f64().unwrap_or(0.0);
        let orientation = cal["orientation"].as_f64().unwrap_or(0.0);
        let pixscale = cal["pixscale"].as_f64().unwrap_or(0.0);
        if pixscale <= 0.0 {
            return Err(SolveError::NoSolution("calibration had no pixel scale".into()));
        }
        let parity = match cal["parity"].as_f64() {
            Some(p) if p < 0.0 => Parity::Negative,
            _ => Parity::Positive,
        };

        let width = self.image.width();
        let height = self.image.height();
        let mut solution = Solution {
            ra: normalize_ra(ra),
            dec,
            orientation,
            pixscale,
            parity,
            field_width: width as f64 * pixscale / 60.0,
            field_height: height as f64 * pixscale / 60.0,
            ra_error: None,
            dec_error: None,
        };
        if let Some((hint_ra, hint_dec)) = self.position {
            solution.ra_error = Some((hint_ra - solution.ra) * 3600.0);
            solution.dec_error = Some((hint_dec - solution.dec) * 3600.0);
        }
        info!(
            "online solve: field center ({:.6}, {:.6}) deg, scale {:.4}\"/px",
            solution.ra, solution.dec, solution.pixscale
        );
        let wcs = TanWcs::from_center(
            solution.ra,
            solution.dec,
            width as f64 / 2.0 + 0.5,
            height as f64 / 2.0 + 0.5,
            pixscale,
            orientation,
            parity,
        );
        self.solution = Some(solution);
        self.projector = Some(Box::new(wcs));
        self.has_solved = true;
        Ok(())
    }
}

impl Drop for OnlineWorker {
    fn drop(&mut self) {
        self.cancel.remove_file();
    }
}

impl SolverWorker for OnlineWorker {
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
            false,
            true,
            self.extractor.as_ref(),
        )?;
        info!("extraction found {} stars", stars.len());
        self.stars = stars;
        self.background = Some(background);
        self.has_extracted = true;
        Ok(())
    }

    fn solve(&mut self) -> Result<(), SolveError> {
        if self.api_url.is_empty() {
            return Err(SolveError::InvalidInput("online solver needs an API URL".into()));
        }
        if self.has_extracted && self.stars.len() < MIN_STARS_TO_SOLVE {
            return Err(SolveError::InsufficientStars(format!(
                "{} stars after filtering, need at least {}",
                self.stars.len(),
                MIN_STARS_TO_SOLVE
            )));
        }
        let deadline =
            Instant::now() + Duration::from_secs(self.params.solver_time_limit as u64);
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(Self::transport)?;

        self.check_cancel(deadline)?;
        let session = self.login(&client)?;
        self.check_cancel(deadline)?;
        let subid = self.upload(&client, &session)?;
        info!("online solve submitted as {}", subid);
        let job = self.wait_for_job(&client, subid, deadline)?;
        debug!("submission {} became job {}", subid, job);
        self.wait_for_solution(&client, job, deadline)?;
        self.fetch_calibration(&client, job)
    }

    fn spawn_child(&self, _n: usize) -> Result<Box<dyn SolverWorker>, SolveError> {
        Err(SolveError::InvalidInput(
            "online solving does not parallelize".into(),
        ))
    }

    fn set_search_scale(&mut self, low: f64, high: f64, units: ScaleUnits) {
        self.scale = Some((low, high, units));
    }

    fn set_search_position_deg(&mut self, ra: f64, dec: f64) {
        self.position = Some((ra, dec));
    }

    fn set_depth_window(&mut self, _low: u32, _high: u32) {
        // The online service owns its own search depth.
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::ConvolutionExtractor;
    use crate::image::PixelFormat;

    fn worker() -> OnlineWorker {
        let image = ImageDescriptor::new(vec![0u8; 128 * 128], 128, 128, PixelFormat::Mono8).unwrap();
        let mut w = OnlineWorker::new(
            ProcessType::IntExtractOnlineSolve,
            image,
            Parameters::default(),
            Arc::new(ConvolutionExtractor),
        );
        w.api_key = "abcdef".into();
        w
    }

    #[test]
    fn test_upload_request_carries_hints() {
        let mut w = worker();
        w.has_extracted = true;
        w.set_search_scale(0.5, 2.0, ScaleUnits::ArcsecPerPix);
        w.set_search_position_deg(10.0, 41.0);
        let req = w.build_upload_request("sess1");
        assert_eq!(req["session"], "sess1");
        assert_eq!(req["scale_type"], "ul");
        assert_eq!(req["scale_units"], "arcsecperpix");
        assert_eq!(req["scale_lower"], 0.5);
        assert_eq!(req["scale_upper"], 2.0);
        assert_eq!(req["center_ra"], 10.0);
        assert_eq!(req["center_dec"], 41.0);
        assert_eq!(req["radius"], 15.0);
        assert_eq!(req["image_width"], 128);
        assert_eq!(req["crpix_center"], true);
        assert_eq!(req["publicly_visible"], "n");
    }

    #[test]
    fn test_upload_request_without_hints() {
        let w = worker();
        let req = w.build_upload_request("sess2");
        assert!(req.get("scale_lower").is_none());
        assert!(req.get("center_ra").is_none());
        assert!(req.get("image_width").is_none());
    }

    #[test]
    fn test_online_never_spawns_children() {
        let w = worker();
        assert!(w.spawn_child(0).is_err());
        assert!(!ProcessType::OnlineSolve.supports_parallel());
        assert!(!ProcessType::IntExtractOnlineSolve.supports_parallel());
    }

    #[test]
    fn test_cancel_preempts_network_work() {
        let mut w = worker();
        w.cancel_monitor().cancel();
        let err = w.solve().unwrap_err();
        assert!(matches!(err, SolveError::Aborted(_)));
    }

    #[test]
    fn test_image_upload_requires_file() {
        let mut w = worker();
        // No extraction and no file on disk: nothing to upload.
        let client = reqwest::blocking::Client::new();
        let err = w.upload(&client, "sess").unwrap_err();
        assert!(matches!(err, SolveError::InvalidInput(_)));
    }
}
