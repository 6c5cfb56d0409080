// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use crate::star::{Parity, Star};

/// Projection from detector pixels to celestial coordinates.
///
/// Implementations report (ra, dec) in decimal degrees with ra normalized
/// to [0, 360) and dec in [-90, 90]. Pixel coordinates are zero-based
/// full-resolution detector coordinates; implementations account for any
/// downsampling that was applied before solving.
pub trait WcsProjector: Send + Sync {
    fn pixel_to_world(&self, x: f64, y: f64) -> (f64, f64);
}

/// Tangent-plane (gnomonic) projection built from the standard FITS WCS
/// quantities: reference point CRVAL/CRPIX and the CD rotation/scale
/// matrix in degrees per pixel. CRPIX follows the FITS convention of
/// one-based pixel centers.
#[derive(Clone, Debug)]
pub struct TanWcs {
    crval1: f64,
    crval2: f64,
    crpix1: f64,
    crpix2: f64,
    cd: [[f64; 2]; 2],
    /// Downsampling factor the solve ran at; incoming full-resolution
    /// pixel coordinates are divided by this.
    downsample: f64,
}

impl TanWcs {
    pub fn new(
        crval1: f64,
        crval2: f64,
        crpix1: f64,
        crpix2: f64,
        cd: [[f64; 2]; 2],
        downsample: u32,
    ) -> Self {
        TanWcs {
            crval1: normalize_ra(crval1),
            crval2,
            crpix1,
            crpix2,
            cd,
            downsample: downsample.max(1) as f64,
        }
    }

    /// Builds the projection from a solved field center, pixel scale
    /// (arcsec/pixel) and orientation (degrees east of north).
    pub fn from_center(
        ra: f64,
        dec: f64,
        crpix1: f64,
        crpix2: f64,
        pixscale_arcsec: f64,
        orientation_deg: f64,
        parity: Parity,
    ) -> Self {
        let scale = pixscale_arcsec / 3600.0;
        let theta = orientation_deg.to_radians();
        let sign = match parity {
            Parity::Positive => -1.0,
            Parity::Negative => 1.0,
        };
        let cd = [
            [sign * scale * theta.cos(), scale * theta.sin()],
            [sign * scale * theta.sin(), scale * theta.cos()],
        ];
        TanWcs::new(ra, dec, crpix1, crpix2, cd, 1)
    }

    pub fn pixel_scale_arcsec(&self) -> f64 {
        let det = self.cd[0][0] * self.cd[1][1] - self.cd[0][1] * self.cd[1][0];
        det.abs().sqrt() * 3600.0 / self.downsample
    }

    /// Negative CD determinant corresponds to positive parity.
    pub fn parity(&self) -> Parity {
        let det = self.cd[0][0] * self.cd[1][1] - self.cd[0][1] * self.cd[1][0];
        if det < 0.0 {
            Parity::Positive
        } else {
            Parity::Negative
        }
    }

    /// Field rotation, degrees east of north.
    pub fn orientation_deg(&self) -> f64 {
        self.cd[1][0].atan2(self.cd[1][1]).to_degrees()
    }
}

impl WcsProjector for TanWcs {
    fn pixel_to_world(&self, x: f64, y: f64) -> (f64, f64) {
        // One-based FITS pixel coordinates at the solve's resolution.
        let px = x / self.downsample + 1.0 - self.crpix1;
        let py = y / self.downsample + 1.0 - self.crpix2;
        // Intermediate world coordinates (standard coordinates), radians.
        let xi = (self.cd[0][0] * px + self.cd[0][1] * py).to_radians();
        let eta = (self.cd[1][0] * px + self.cd[1][1] * py).to_radians();

        let ra0 = self.crval1.to_radians();
        let dec0 = self.crval2.to_radians();
        let den = dec0.cos() - eta * dec0.sin();
        let ra = ra0 + xi.atan2(den);
        let dec = (dec0.sin() + eta * dec0.cos())
            .atan2((xi * xi + den * den).sqrt());
        (normalize_ra(ra.to_degrees()), dec.to_degrees())
    }
}

/// Wraps a right ascension into [0, 360).
pub fn normalize_ra(ra_deg: f64) -> f64 {
    let mut ra = ra_deg % 360.0;
    if ra < 0.0 {
        ra += 360.0;
    }
    ra
}

/// Fills in ra/dec on every star from the winning projection.
pub fn annotate_stars(stars: &mut [Star], projector: &dyn WcsProjector) {
    for star in stars.iter_mut() {
        let (ra, dec) = projector.pixel_to_world(star.x as f64, star.y as f64);
        star.ra = Some(ra);
        star.dec = Some(dec);
    }
}

/// Dense per-pixel celestial coordinate grid, row-major `[y][x]`. This is
/// sizeable for large sensors, so callers request it explicitly rather
/// than getting it with every solve.
pub fn wcs_coordinate_grid(
    projector: &dyn WcsProjector,
    width: usize,
    height: usize,
) -> Vec<(f32, f32)> {
    let mut grid = Vec::with_capacity(width * height);
    for y in 0..height {
        for x in 0..width {
            let (ra, dec) = projector.pixel_to_world(x as f64, y as f64);
            grid.push((ra as f32, dec as f32));
        }
    }
    grid
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn sample_wcs() -> TanWcs {
        TanWcs::from_center(120.0, 45.0, 513.0, 513.0, 2.0, 0.0, Parity::Positive)
    }

    #[test]
    fn test_reference_pixel_maps_to_center() {
        let wcs = sample_wcs();
        // Zero-based pixel 512 is one-based 513.
        let (ra, dec) = wcs.pixel_to_world(512.0, 512.0);
        assert_abs_diff_eq!(ra, 120.0, epsilon = 1e-9);
        assert_abs_diff_eq!(dec, 45.0, epsilon = 1e-9);
    }

    #[test]
    fn test_pixel_scale_round_trip() {
        let wcs = sample_wcs();
        assert_abs_diff_eq!(wcs.pixel_scale_arcsec(), 2.0, epsilon = 1e-9);
        assert_eq!(wcs.parity(), Parity::Positive);
        assert_abs_diff_eq!(wcs.orientation_deg(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_north_offset_moves_declination() {
        let wcs = sample_wcs();
        // With zero rotation, one pixel along +y moves ~1 pixel scale north.
        let (_, dec) = wcs.pixel_to_world(512.0, 512.0 + 1800.0);
        assert_abs_diff_eq!(dec, 46.0, epsilon = 1e-3);
    }

    #[test]
    fn test_ra_normalized() {
        assert_abs_diff_eq!(normalize_ra(-10.0), 350.0);
        assert_abs_diff_eq!(normalize_ra(370.0), 10.0);
        assert_abs_diff_eq!(normalize_ra(0.0), 0.0);
        let wcs = TanWcs::from_center(359.999, 0.0, 1.0, 1.0, 2.0, 0.0, Parity::Positive);
        let (ra, _) = wcs.pixel_to_world(5000.0, 0.0);
        assert!((0.0..360.0).contains(&ra));
    }

    #[test]
    fn test_downsample_scales_pixels() {
        let full = TanWcs::from_center(10.0, 20.0, 101.0, 101.0, 2.0, 0.0, Parity::Positive);
        let half = TanWcs::new(
            10.0,
            20.0,
            101.0,
            101.0,
            [[-2.0 / 3600.0, 0.0], [0.0, 2.0 / 3600.0]],
            2,
        );
        // Full-resolution pixel 200 lands on the downsampled reference 100.
        let (ra_a, dec_a) = full.pixel_to_world(100.0, 100.0);
        let (ra_b, dec_b) = half.pixel_to_world(200.0, 200.0);
        assert_abs_diff_eq!(ra_a, ra_b, epsilon = 1e-9);
        assert_abs_diff_eq!(dec_a, dec_b, epsilon = 1e-9);
    }

    #[test]
    fn test_annotate_stars_populates_coordinates() {
        let wcs = sample_wcs();
        let mut stars = vec![crate::star::Star::new(10.0, 20.0), crate::star::Star::new(900.0, 700.0)];
        annotate_stars(&mut stars, &wcs);
        for star in &stars {
            let ra = star.ra.unwrap();
            let dec = star.dec.unwrap();
            assert!((0.0..360.0).contains(&ra));
            assert!((-90.0..=90.0).contains(&dec));
        }
    }

    #[test]
    fn test_grid_dimensions() {
        let wcs = sample_wcs();
        let grid = wcs_coordinate_grid(&wcs, 8, 4);
        assert_eq!(grid.len(), 32);
    }
}
