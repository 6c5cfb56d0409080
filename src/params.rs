// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

/// Whether flux is summed over a circle, the fitted ellipse, or whichever
/// the measured kron radius calls for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApertureShape {
    Auto,
    Circle,
    Ellipse,
}

/// Units of a scale hint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScaleUnits {
    /// Field width in degrees.
    DegWidth,
    /// Field width in arcminutes.
    ArcminWidth,
    /// Arcseconds per pixel.
    ArcsecPerPix,
    /// Lens focal length in millimeters (35 mm equivalent).
    FocalMm,
}

impl ScaleUnits {
    /// The unit string the astrometry.net tools expect.
    pub fn unit_string(self) -> &'static str {
        match self {
            ScaleUnits::DegWidth => "degwidth",
            ScaleUnits::ArcminWidth => "arcminwidth",
            ScaleUnits::ArcsecPerPix => "arcsecperpix",
            ScaleUnits::FocalMm => "focalmm",
        }
    }
}

/// Strategy for splitting a solve across multiple concurrent child solvers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MultiAlgorithm {
    NotMulti,
    /// Each child searches a disjoint slice of the scale range.
    MultiScales,
    /// Each child searches a disjoint window of source depths.
    MultiDepths,
    /// Pick a strategy from which hints are available.
    MultiAuto,
}

/// Which detector parity the solver should consider.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchParity {
    Positive,
    Negative,
    Both,
}

impl SearchParity {
    pub fn as_code(self) -> u8 {
        match self {
            SearchParity::Positive => 0,
            SearchParity::Negative => 1,
            SearchParity::Both => 2,
        }
    }
    pub fn from_code(code: u8) -> SearchParity {
        match code {
            0 => SearchParity::Positive,
            1 => SearchParity::Negative,
            _ => SearchParity::Both,
        }
    }
}

/// The full tuning surface for extraction and solving. A `Parameters` value
/// is what a profile stores and what the map (de)serialization in
/// `profiles` round-trips.
#[derive(Clone, Debug, PartialEq)]
pub struct Parameters {
    /// Name of this particular profile of options.
    pub list_name: String,

    // Photometry.
    pub aperture_shape: ApertureShape,
    pub kron_fact: f64,
    pub subpix: u32,
    pub r_min: f64,

    // Extraction.
    /// Zero-point used to set the magnitude scale during extraction.
    pub magzero: f64,
    /// Minimum area in pixels for a detection; smaller sources are ignored.
    pub minarea: usize,
    pub deblend_thresh: u32,
    pub deblend_contrast: f64,
    pub clean: bool,
    pub clean_param: f64,
    /// FWHM the convolution filter was generated from. Changing this field
    /// does not regenerate the filter; use [`generate_conv_filter`].
    pub fwhm: f64,
    /// Row-major square convolution kernel applied before thresholding.
    pub conv_filter: Vec<f32>,

    // Star filters.
    /// Maximum semi-axis in pixels; 0 disables.
    pub max_size: f64,
    /// Minimum semi-axis in pixels; 0 disables.
    pub min_size: f64,
    /// Maximum a/b ratio; values <= 1 disable.
    pub max_ellipse: f64,
    /// Keep only the N brightest stars; 0 keeps all.
    pub keep_num: u32,
    /// Percentage of the brightest stars to drop.
    pub remove_brightest: f64,
    /// Percentage of the dimmest stars to drop.
    pub remove_dimmest: f64,
    /// Drop stars whose peak exceeds this percentage of the dynamic range;
    /// 0 disables.
    pub saturation_limit: f64,

    // Solving.
    pub multi_algorithm: MultiAlgorithm,
    /// Load index files in parallel. Requires as much physical memory as
    /// the indexes occupy on disk; the engine downgrades this when the RAM
    /// admission check fails.
    pub in_parallel: bool,
    /// Give up solving after this many seconds.
    pub solver_time_limit: u32,
    /// Bounds on the field width in degrees when no scale hint is given.
    pub min_width: f64,
    pub max_width: f64,
    /// Resort stars by brightness. Required for the percentage and keep_num
    /// filters to be meaningful.
    pub resort: bool,
    /// Downsampling factor applied before extraction when solving.
    pub downsample: u32,
    pub search_parity: SearchParity,
    /// Only search indexes within this many degrees of the position hint.
    pub search_radius: f64,

    // Log-odds thresholds.
    pub logratio_tokeep: f64,
    pub logratio_totune: f64,
    pub logratio_tosolve: f64,
}

impl Default for Parameters {
    fn default() -> Self {
        Parameters {
            list_name: "Default".into(),
            aperture_shape: ApertureShape::Circle,
            kron_fact: 2.5,
            subpix: 5,
            r_min: 3.5,
            magzero: 20.0,
            minarea: 5,
            deblend_thresh: 32,
            deblend_contrast: 0.005,
            clean: true,
            clean_param: 1.0,
            fwhm: 2.0,
            conv_filter: generate_conv_filter(2.0),
            max_size: 0.0,
            min_size: 0.0,
            max_ellipse: 0.0,
            keep_num: 0,
            remove_brightest: 0.0,
            remove_dimmest: 0.0,
            saturation_limit: 0.0,
            multi_algorithm: MultiAlgorithm::NotMulti,
            in_parallel: true,
            solver_time_limit: 600,
            min_width: 0.1,
            max_width: 180.0,
            resort: true,
            downsample: 1,
            search_parity: SearchParity::Both,
            search_radius: 15.0,
            logratio_tokeep: 1.0e9f64.ln(),
            logratio_totune: 1.0e6f64.ln(),
            logratio_tosolve: 1.0e9f64.ln(),
        }
    }
}

/// Generates a square Gaussian convolution kernel from a FWHM:
/// `G(x, y) = exp(-4 ln2 (x^2 + y^2) / fwhm^2)`, row-major, sized so the
/// kernel spans a bit over half the FWHM on each side of center (fwhm 2
/// gives 3x3, fwhm 4 gives 5x5).
pub fn generate_conv_filter(fwhm: f64) -> Vec<f32> {
    let size = ((fwhm.abs() * 0.6).floor() as i64).max(1);
    let mut filter = Vec::with_capacity(((2 * size + 1) * (2 * size + 1)) as usize);
    for y in -size..=size {
        for x in -size..=size {
            let r2 = (x * x + y * y) as f64;
            let value = (-4.0 * 2.0f64.ln() * r2 / (fwhm * fwhm)).exp();
            filter.push(value as f32);
        }
    }
    filter
}

/// Regenerates the convolution filter for a new FWHM, keeping the two
/// fields consistent.
pub fn set_conv_filter_from_fwhm(params: &mut Parameters, fwhm: f64) {
    params.fwhm = fwhm;
    params.conv_filter = generate_conv_filter(fwhm);
}

/// Converts a scale value in the given units to a field height in degrees.
pub fn convert_to_degree_height(scale: f64, units: ScaleUnits, image_height: usize) -> f64 {
    match units {
        ScaleUnits::DegWidth => scale,
        ScaleUnits::ArcminWidth => scale / 60.0,
        ScaleUnits::ArcsecPerPix => scale * image_height as f64 / 3600.0,
        ScaleUnits::FocalMm => {
            // "35 mm" film is 36 mm wide.
            (2.0 * (36.0 / (2.0 * scale)).atan()).to_degrees()
        }
    }
}

/// Converts a scale-hint window to the arcseconds-per-pixel range the
/// matching engine searches. Focal length maps inversely, so its bounds
/// swap.
pub fn arcsec_per_pixel_window(
    low: f64,
    high: f64,
    units: ScaleUnits,
    image_width: usize,
) -> (f64, f64) {
    let w = image_width as f64;
    match units {
        ScaleUnits::DegWidth => (low * 3600.0 / w, high * 3600.0 / w),
        ScaleUnits::ArcminWidth => (low * 60.0 / w, high * 60.0 / w),
        ScaleUnits::ArcsecPerPix => (low, high),
        ScaleUnits::FocalMm => {
            let fov_of = |f: f64| (2.0 * (36.0 / (2.0 * f)).atan()).to_degrees() * 3600.0;
            (fov_of(high) / w, fov_of(low) / w)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_conv_filter_fwhm_2() {
        let filter = generate_conv_filter(2.0);
        assert_eq!(filter.len(), 9);
        assert_abs_diff_eq!(filter[4], 1.0, epsilon = 1e-6);
        // Edge-adjacent values: exp(-4 ln2 / 4) = 0.5.
        assert_abs_diff_eq!(filter[1], 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(filter[3], 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(filter[5], 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(filter[7], 0.5, epsilon = 1e-6);
        // Corners: exp(-4 ln2 * 2 / 4) = 0.25.
        assert_abs_diff_eq!(filter[0], 0.25, epsilon = 1e-6);
    }

    #[test]
    fn test_conv_filter_grows_with_fwhm() {
        assert_eq!(generate_conv_filter(1.0).len(), 9);
        assert_eq!(generate_conv_filter(4.0).len(), 25);
        assert_eq!(generate_conv_filter(8.0).len(), 81);
        // Sign of the FWHM does not matter.
        assert_eq!(generate_conv_filter(-4.0).len(), 25);
    }

    #[test]
    fn test_degree_height_conversions() {
        assert_abs_diff_eq!(
            convert_to_degree_height(90.0, ScaleUnits::ArcminWidth, 1024),
            1.5
        );
        assert_abs_diff_eq!(
            convert_to_degree_height(2.0, ScaleUnits::ArcsecPerPix, 1800),
            1.0
        );
        assert_abs_diff_eq!(convert_to_degree_height(3.2, ScaleUnits::DegWidth, 77), 3.2);
        // 18 mm focal: 2 atan(1) = 90 degrees.
        assert_abs_diff_eq!(
            convert_to_degree_height(18.0, ScaleUnits::FocalMm, 100),
            90.0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_arcsec_window_focal_bounds_swap() {
        let (lo, hi) = arcsec_per_pixel_window(50.0, 200.0, ScaleUnits::FocalMm, 1000);
        // Longer focal length means a narrower field and a smaller scale.
        assert!(lo < hi);
        let (lo2, hi2) = arcsec_per_pixel_window(1.0, 2.0, ScaleUnits::DegWidth, 3600);
        assert_abs_diff_eq!(lo2, 1.0);
        assert_abs_diff_eq!(hi2, 2.0);
    }

    #[test]
    fn test_default_conv_filter_matches_default_fwhm() {
        let params = Parameters::default();
        assert_eq!(params.conv_filter, generate_conv_filter(params.fwhm));
    }
}
