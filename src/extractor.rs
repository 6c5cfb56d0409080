// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use log::debug;

use crate::error::SolveError;
use crate::params::Parameters;
use crate::star::{Background, Star};

/// Everything produced by one extraction pass.
#[derive(Clone, Debug)]
pub struct Extraction {
    pub stars: Vec<Star>,
    pub background: Background,
}

/// Source-extraction kernel contract.
///
/// `pixels` is a single-channel row-major buffer; positions in the returned
/// stars are relative to that buffer (the caller re-offsets for subframes).
/// Implementations must be deterministic: the same buffer and parameters
/// produce an identical star list.
pub trait Extractor: Send + Sync {
    fn extract(
        &self,
        pixels: &[f32],
        width: usize,
        height: usize,
        params: &Parameters,
        compute_hfr: bool,
    ) -> Result<Extraction, SolveError>;
}

/// Reference extractor: sigma-clipped background estimation, convolution by
/// the parameter kernel, absolute thresholding at twice the background RMS,
/// and connected-component measurement. Aperture photometry is approximated
/// by summation over the component; a SEP-backed implementation of
/// [`Extractor`] slots in behind the same trait when exact Kron/elliptical
/// fluxes are needed.
pub struct ConvolutionExtractor;

impl Extractor for ConvolutionExtractor {
    fn extract(
        &self,
        pixels: &[f32],
        width: usize,
        height: usize,
        params: &Parameters,
        compute_hfr: bool,
    ) -> Result<Extraction, SolveError> {
        if params.conv_filter.is_empty() {
            return Err(SolveError::ExtractionFailed(
                "no convolution filter configured".into(),
            ));
        }
        let ksize = (params.conv_filter.len() as f64).sqrt() as usize;
        if ksize * ksize != params.conv_filter.len() {
            return Err(SolveError::InvalidInput(format!(
                "convolution filter of {} values is not square",
                params.conv_filter.len()
            )));
        }
        if pixels.len() < width * height || width == 0 || height == 0 {
            return Err(SolveError::InvalidInput(
                "pixel buffer smaller than stated dimensions".into(),
            ));
        }

        let background = estimate_background(pixels);
        let smoothed = convolve_normalized(pixels, width, height, &params.conv_filter, ksize);
        let threshold = background.mean + 2.0 * background.global_rms;

        let stars = measure_components(
            pixels,
            &smoothed,
            width,
            height,
            background,
            threshold,
            params,
            compute_hfr,
        );
        debug!(
            "extracted {} sources (background {:.2} rms {:.2})",
            stars.len(),
            background.mean,
            background.global_rms
        );
        Ok(Extraction { stars, background })
    }
}

/// Sigma-clipped global background: subsample the frame, then three rounds
/// of 3-sigma clipping around the mean.
fn estimate_background(pixels: &[f32]) -> Background {
    let stride = (pixels.len() / 500_000).max(1);
    let mut samples: Vec<f32> = pixels
        .iter()
        .step_by(stride)
        .copied()
        .filter(|v| v.is_finite())
        .collect();
    if samples.is_empty() {
        return Background {
            mean: 0.0,
            sigma: 1.0,
            global_rms: 1.0,
        };
    }
    let mut mean = 0.0f64;
    let mut sigma = 0.0f64;
    for _ in 0..3 {
        let n = samples.len() as f64;
        mean = samples.iter().map(|&v| v as f64).sum::<f64>() / n;
        let var = samples
            .iter()
            .map(|&v| (v as f64 - mean) * (v as f64 - mean))
            .sum::<f64>()
            / n.max(1.0);
        sigma = var.sqrt();
        if sigma <= f64::EPSILON {
            break;
        }
        let lo = (mean - 3.0 * sigma) as f32;
        let hi = (mean + 3.0 * sigma) as f32;
        samples.retain(|&v| v >= lo && v <= hi);
        if samples.is_empty() {
            break;
        }
    }
    let sigma = sigma.max(1e-6);
    Background {
        mean: mean as f32,
        sigma: sigma as f32,
        global_rms: sigma as f32,
    }
}

fn convolve_normalized(
    pixels: &[f32],
    width: usize,
    height: usize,
    kernel: &[f32],
    ksize: usize,
) -> Vec<f32> {
    let ksum: f32 = kernel.iter().sum();
    let ksum = if ksum.abs() < f32::EPSILON { 1.0 } else { ksum };
    let half = (ksize / 2) as isize;
    let mut out = vec![0.0f32; width * height];
    for y in 0..height as isize {
        for x in 0..width as isize {
            let mut total = 0.0f32;
            for ky in 0..ksize as isize {
                let iy = (y + ky - half).clamp(0, height as isize - 1) as usize;
                for kx in 0..ksize as isize {
                    let ix = (x + kx - half).clamp(0, width as isize - 1) as usize;
                    total += pixels[iy * width + ix] * kernel[(ky * ksize as isize + kx) as usize];
                }
            }
            out[y as usize * width + x as usize] = total / ksum;
        }
    }
    out
}

#[allow(clippy::too_many_arguments)]
fn measure_components(
    pixels: &[f32],
    smoothed: &[f32],
    width: usize,
    height: usize,
    background: Background,
    threshold: f32,
    params: &Parameters,
    compute_hfr: bool,
) -> Vec<Star> {
    let mut visited = vec![false; width * height];
    let mut stars = Vec::new();
    let mut queue = std::collections::VecDeque::new();

    for start in 0..width * height {
        if visited[start] || smoothed[start] <= threshold || !smoothed[start].is_finite() {
            continue;
        }
        // Flood-fill one above-threshold component, 8-connected.
        queue.clear();
        queue.push_back(start);
        visited[start] = true;
        let mut component: Vec<usize> = Vec::new();
        while let Some(at) = queue.pop_front() {
            component.push(at);
            let (cx, cy) = (at % width, at / width);
            for dy in -1i64..=1 {
                for dx in -1i64..=1 {
                    let nx = cx as i64 + dx;
                    let ny = cy as i64 + dy;
                    if nx < 0 || ny < 0 || nx >= width as i64 || ny >= height as i64 {
                        continue;
                    }
                    let n = ny as usize * width + nx as usize;
                    if !visited[n] && smoothed[n] > threshold && smoothed[n].is_finite() {
                        visited[n] = true;
                        queue.push_back(n);
                    }
                }
            }
        }
        if component.len() < params.minarea {
            continue;
        }
        if let Some(star) = measure_one(pixels, width, &component, background, params, compute_hfr)
        {
            stars.push(star);
        }
    }
    stars
}

fn measure_one(
    pixels: &[f32],
    width: usize,
    component: &[usize],
    background: Background,
    params: &Parameters,
    compute_hfr: bool,
) -> Option<Star> {
    let mut flux = 0.0f64;
    let mut sum_x = 0.0f64;
    let mut sum_y = 0.0f64;
    let mut peak = 0.0f32;
    for &at in component {
        let v = (pixels[at] - background.mean).max(0.0);
        let (x, y) = ((at % width) as f64, (at / width) as f64);
        flux += v as f64;
        sum_x += x * v as f64;
        sum_y += y * v as f64;
        peak = peak.max(v);
    }
    if flux <= 0.0 {
        return None;
    }
    let cx = sum_x / flux;
    let cy = sum_y / flux;

    // Intensity-weighted second-order moments give the ellipse axes and
    // orientation, SExtractor-style.
    let mut mxx = 0.0f64;
    let mut myy = 0.0f64;
    let mut mxy = 0.0f64;
    for &at in component {
        let v = (pixels[at] - background.mean).max(0.0) as f64;
        let dx = (at % width) as f64 - cx;
        let dy = (at / width) as f64 - cy;
        mxx += dx * dx * v;
        myy += dy * dy * v;
        mxy += dx * dy * v;
    }
    mxx /= flux;
    myy /= flux;
    mxy /= flux;
    let trace_half = (mxx + myy) / 2.0;
    let disc = (((mxx - myy) / 2.0) * ((mxx - myy) / 2.0) + mxy * mxy).sqrt();
    let a = (trace_half + disc).max(0.0).sqrt().max(0.5);
    let b = (trace_half - disc).max(0.0).sqrt().max(0.25);
    let theta = 0.5 * (2.0 * mxy).atan2(mxx - myy);

    let hfr = if compute_hfr {
        Some(half_flux_radius(pixels, width, component, background, cx, cy, flux))
    } else {
        None
    };

    Some(Star {
        x: cx as f32,
        y: cy as f32,
        mag: (params.magzero - 2.5 * flux.log10()) as f32,
        flux: flux as f32,
        peak,
        hfr,
        a: a as f32,
        b: b as f32,
        theta: theta.to_degrees() as f32,
        ra: None,
        dec: None,
    })
}

/// Radius of the circle around the centroid containing half the flux,
/// computed over the component's own pixels.
fn half_flux_radius(
    pixels: &[f32],
    width: usize,
    component: &[usize],
    background: Background,
    cx: f64,
    cy: f64,
    flux: f64,
) -> f32 {
    let mut by_distance: Vec<(f64, f64)> = component
        .iter()
        .map(|&at| {
            let dx = (at % width) as f64 - cx;
            let dy = (at / width) as f64 - cy;
            let v = (pixels[at] - background.mean).max(0.0) as f64;
            ((dx * dx + dy * dy).sqrt(), v)
        })
        .collect();
    by_distance.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    let mut running = 0.0f64;
    for (dist, v) in by_distance {
        running += v;
        if running >= flux / 2.0 {
            return dist.max(0.5) as f32;
        }
    }
    0.5
}


#[cfg(test)]
mod tests {
    use super::test_image::{fifty_star_positions, synthetic_star_field};
    use super::*;

    #[test]
    fn test_finds_injected_stars() {
        let positions = fifty_star_positions(1024, 1024);
        let img = synthetic_star_field(1024, 1024, 3.0, &positions);
        let extraction = ConvolutionExtractor
            .extract(&img, 1024, 1024, &Parameters::default(), false)
            .unwrap();
        assert!(
            extraction.stars.len() >= 50,
            "found {} stars",
            extraction.stars.len()
        );
        assert!(extraction.background.global_rms > 0.0);
        assert!((extraction.background.mean - 102.0).abs() < 5.0);
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let positions = fifty_star_positions(512, 512);
        let img = synthetic_star_field(512, 512, 3.0, &positions);
        let params = Parameters::default();
        let first = ConvolutionExtractor
            .extract(&img, 512, 512, &params, true)
            .unwrap();
        let second = ConvolutionExtractor
            .extract(&img, 512, 512, &params, true)
            .unwrap();
        assert_eq!(first.stars, second.stars);
        assert_eq!(first.background, second.background);
    }

    #[test]
    fn test_centroid_accuracy() {
        let img = synthetic_star_field(256, 256, 3.0, &[(100.25, 140.5, 2000.0)]);
        let extraction = ConvolutionExtractor
            .extract(&img, 256, 256, &Parameters::default(), false)
            .unwrap();
        assert_eq!(extraction.stars.len(), 1);
        let star = &extraction.stars[0];
        assert!((star.x - 100.25).abs() < 0.5, "x = {}", star.x);
        assert!((star.y - 140.5).abs() < 0.5, "y = {}", star.y);
        assert!(star.peak > 1000.0);
    }

    #[test]
    fn test_flat_image_has_no_detections() {
        let img = synthetic_star_field(128, 128, 3.0, &[]);
        let extraction = ConvolutionExtractor
            .extract(&img, 128, 128, &Parameters::default(), false)
            .unwrap();
        assert!(extraction.stars.is_empty());
    }

    #[test]
    fn test_hfr_populated_on_request() {
        let img = synthetic_star_field(128, 128, 4.0, &[(64.0, 64.0, 3000.0)]);
        let with = ConvolutionExtractor
            .extract(&img, 128, 128, &Parameters::default(), true)
            .unwrap();
        let without = ConvolutionExtractor
            .extract(&img, 128, 128, &Parameters::default(), false)
            .unwrap();
        assert!(with.stars[0].hfr.is_some());
        let hfr = with.stars[0].hfr.unwrap();
        assert!(hfr > 0.5 && hfr < 6.0, "hfr = {}", hfr);
        assert!(without.stars[0].hfr.is_none());
    }

    #[test]
    fn test_empty_conv_filter_fails() {
        let mut params = Parameters::default();
        params.conv_filter.clear();
        let img = vec![0.0f32; 64 * 64];
        let r = ConvolutionExtractor.extract(&img, 64, 64, &params, false);
        assert!(matches!(r, Err(SolveError::ExtractionFailed(_))));
    }
}
