// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use serde::{Deserialize, Serialize};

/// A single extracted source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Star {
    /// Centroid in detector pixels, origin at the image's upper-left.
    pub x: f32,
    pub y: f32,
    /// Instrumental magnitude, `magzero - 2.5 log10(flux)`.
    pub mag: f32,
    /// Total background-subtracted flux.
    pub flux: f32,
    /// Peak value above background.
    pub peak: f32,
    /// Half-flux radius; populated only when HFR computation was requested.
    pub hfr: Option<f32>,
    /// Semi-major axis of the fitted ellipse, pixels.
    pub a: f32,
    /// Semi-minor axis of the fitted ellipse, pixels.
    pub b: f32,
    /// Orientation of the ellipse, degrees.
    pub theta: f32,
    /// Celestial coordinates, populated by WCS post-processing after a
    /// successful solve. Degrees; ra in [0, 360), dec in [-90, 90].
    pub ra: Option<f64>,
    pub dec: Option<f64>,
}

impl Star {
    pub fn new(x: f32, y: f32) -> Self {
        Star {
            x,
            y,
            mag: 0.0,
            flux: 0.0,
            peak: 0.0,
            hfr: None,
            a: 0.0,
            b: 0.0,
            theta: 0.0,
            ra: None,
            dec: None,
        }
    }
}

/// Global background estimate. Produced once per extraction, immutable
/// afterwards.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Background {
    /// Global mean background level.
    pub mean: f32,
    /// Per-pixel noise sigma.
    pub sigma: f32,
    /// Global RMS of the background mesh.
    pub global_rms: f32,
}

/// Image parity: whether east is counter-clockwise (positive) or clockwise
/// (negative) of north on the detector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    Positive,
    Negative,
}

/// Field solution returned by a successful solve.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Solution {
    /// Right ascension of the field center, degrees in [0, 360).
    pub ra: f64,
    /// Declination of the field center, degrees in [-90, 90].
    pub dec: f64,
    /// Field rotation: up is this many degrees east of north.
    pub orientation: f64,
    /// Pixel scale, arcseconds per pixel. Always positive.
    pub pixscale: f64,
    pub parity: Parity,
    /// Field extent, arcminutes.
    pub field_width: f64,
    pub field_height: f64,
    /// Offset of the solution from the search position hint, arcseconds.
    /// Present only when a position hint was supplied.
    pub ra_error: Option<f64>,
    pub dec_error: Option<f64>,
}
