//! Crop quality scoring from exposure, contrast and sharpness on grayscale.
//!
//! Cheap enough to run on every surviving candidate before embedding
//! extraction; rejects blank walls, glare and motion blur.

use image::{GrayImage, RgbImage};
use serde::Serialize;

/// Scores below this are not matched.
pub const DEFAULT_QUALITY_THRESHOLD: f32 = 0.3;

const MIN_BRIGHTNESS: f64 = 40.0;
const MAX_BRIGHTNESS: f64 = 220.0;
const MIN_CONTRAST: f64 = 30.0;
const MIN_SHARPNESS: f64 = 100.0;

// Hard-penalty scores; each sits below the default cutoff.
const EXPOSURE_SCORE: f32 = 0.1;
const LOW_CONTRAST_SCORE: f32 = 0.2;
const BLUR_SCORE: f32 = 0.25;

const CONTRAST_NORM: f64 = 80.0;
const SHARPNESS_NORM: f64 = 500.0;

/// Why a crop received a hard penalty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityIssue {
    /// Mean intensity outside [40, 220].
    Exposure,
    /// Intensity standard deviation below 30.
    LowContrast,
    /// Laplacian variance below 100.
    Blur,
}

/// Raw signals and final score for one crop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QualityReport {
    pub brightness: f64,
    pub contrast: f64,
    pub sharpness: f64,
    pub score: f32,
    pub issue: Option<QualityIssue>,
}

#[derive(Debug, Clone, Copy)]
pub struct QualityGate {
    threshold: f32,
}

impl Default for QualityGate {
    fn default() -> Self {
        Self::new(DEFAULT_QUALITY_THRESHOLD)
    }
}

impl QualityGate {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    /// Quality score in [0, 1] for an RGB crop.
    pub fn score(&self, crop: &RgbImage) -> f32 {
        self.assess(crop).score
    }

    pub fn is_acceptable(&self, score: f32) -> bool {
        score >= self.threshold
    }

    pub fn assess(&self, crop: &RgbImage) -> QualityReport {
        assess_gray(&image::imageops::grayscale(crop))
    }
}

/// Score a grayscale crop.
///
/// Hard penalties are checked in order (exposure, contrast, blur) and the
/// first one that triggers caps the score. Otherwise the score is the mean
/// of the three normalized sub-scores.
pub fn assess_gray(gray: &GrayImage) -> QualityReport {
    let (brightness, contrast) = mean_and_stddev(gray);
    let sharpness = laplacian_variance(gray);

    let issue = if !(MIN_BRIGHTNESS..=MAX_BRIGHTNESS).contains(&brightness) {
        Some(QualityIssue::Exposure)
    } else if contrast < MIN_CONTRAST {
        Some(QualityIssue::LowContrast)
    } else if sharpness < MIN_SHARPNESS {
        Some(QualityIssue::Blur)
    } else {
        None
    };

    let score = match issue {
        Some(QualityIssue::Exposure) => EXPOSURE_SCORE,
        Some(QualityIssue::LowContrast) => LOW_CONTRAST_SCORE,
        Some(QualityIssue::Blur) => BLUR_SCORE,
        None => {
            let brightness_score = 1.0 - (brightness - 128.0).abs() / 128.0;
            let contrast_score = (contrast / CONTRAST_NORM).min(1.0);
            let sharpness_score = (sharpness / SHARPNESS_NORM).min(1.0);
            ((brightness_score + contrast_score + sharpness_score) / 3.0).clamp(0.0, 1.0) as f32
        }
    };

    QualityReport {
        brightness,
        contrast,
        sharpness,
        score,
        issue,
    }
}

/// Population mean and standard deviation of pixel intensity.
fn mean_and_stddev(gray: &GrayImage) -> (f64, f64) {
    let pixels = gray.as_raw();
    if pixels.is_empty() {
        return (0.0, 0.0);
    }
    let n = pixels.len() as f64;
    let mean = pixels.iter().map(|&p| f64::from(p)).sum::<f64>() / n;
    let variance = pixels
        .iter()
        .map(|&p| (f64::from(p) - mean).powi(2))
        .sum::<f64>()
        / n;
    (mean, variance.sqrt())
}

/// Variance of the 4-neighbour Laplacian response.
///
/// Borders use reflect-101 padding so every pixel contributes.
fn laplacian_variance(gray: &GrayImage) -> f64 {
    let (w, h) = gray.dimensions();
    if w == 0 || h == 0 {
        return 0.0;
    }
    let (w, h) = (w as i64, h as i64);
    let px = |x: i64, y: i64| -> f64 {
        f64::from(gray.get_pixel(reflect101(x, w) as u32, reflect101(y, h) as u32)[0])
    };

    let mut responses = Vec::with_capacity((w * h) as usize);
    for y in 0..h {
        for x in 0..w {
            let lap = px(x - 1, y) + px(x + 1, y) + px(x, y - 1) + px(x, y + 1) - 4.0 * px(x, y);
            responses.push(lap);
        }
    }

    let n = responses.len() as f64;
    let mean = responses.iter().sum::<f64>() / n;
    responses.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n
}

fn reflect101(i: i64, n: i64) -> i64 {
    if n == 1 {
        return 0;
    }
    if i < 0 {
        -i
    } else if i >= n {
        2 * n - 2 - i
    } else {
        i
    }
}
