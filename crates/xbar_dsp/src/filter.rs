//! Biquad Filter Design
//!
//! Parameter validation and coefficient computation for the filter engine.
//! The coefficients follow the Zoelzer formulations, with the peak and
//! shelving filters split into boost (V >= 1) and cut (V < 1) cases and
//! Butterworth pole placement for higher-order low-/high-pass sections.
//!
//! All filters are realized as Direct Form 1 biquad sections:
//!
//! ```text
//! y[n] = b0*x[n] + b1*x[n-1] + b2*x[n-2] - (a1*y[n-1] + a2*y[n-2])
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{DspError, DspResult};

/// Number of coefficients per biquad section (b0, b1, b2, a1, a2).
pub const BIQUAD_COEFFS: usize = 5;

/// Number of state variables per biquad section (x1, x2, y1, y2).
pub const BIQUAD_STATES: usize = 4;

/// Parameter bounds accepted by [`check_params`].
pub const MIN_FREQ: u32 = 10;
pub const MIN_GAIN: f32 = 0.001;
pub const MAX_GAIN: f32 = 1000.0;
pub const MIN_QUALITY: f32 = 0.01;
pub const MAX_QUALITY: f32 = 100.0;
pub const MAX_ORDER: u32 = 20;

// Below these corner frequencies (or above this Q) the recursion becomes
// numerically delicate in f32 and the engine switches to the f64 plane.
const PEAK_FREQ_BORDER: u32 = 300;
const PEAK_QUALITY_BORDER: f32 = 1.0;
const SHELVING_FREQ_BORDER: u32 = 200;
const HIGHPASS_FREQ_BORDER: u32 = 200;
const LOWPASS_FREQ_BORDER: u32 = 200;

/// Filter type of one biquad stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterType {
    Flat,
    Peak,
    Bandpass,
    Lowpass,
    Highpass,
    LowShelving,
    HighShelving,
}

/// Parameters of one filter stage.
///
/// Higher-order Butterworth low-/high-pass filters are realized by cascading
/// several biquad stages; `order` carries the overall filter order and
/// `section` selects which pole pair this stage implements (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterParams {
    /// Cut-off or mid frequency in Hz.
    pub freq: u32,
    /// Gain, linear (not dB). Only used by peak and shelving filters.
    pub gain: f32,
    /// Quality. Only used by band-pass and peak filters.
    pub quality: f32,
    pub kind: FilterType,
    pub order: u32,
    /// Section to implement, only relevant for order > 2.
    pub section: u32,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            freq: 1000,
            gain: 1.0,
            quality: 1.0,
            kind: FilterType::Flat,
            order: 2,
            section: 1,
        }
    }
}

/// Verify that a filter parameter set is valid for the given sample rate.
///
/// The `section` field is only checked for higher-order low-/high-pass
/// filters, where it selects the implemented pole pair.
pub fn check_params(params: &FilterParams, sample_rate: u32) -> DspResult<()> {
    if params.kind == FilterType::Flat {
        // Flat needs no further parameters.
        return Ok(());
    }

    if params.freq < MIN_FREQ || params.freq > (sample_rate >> 1) {
        return Err(DspError::InvalidFilterParams(format!(
            "freq {} Hz outside [{}, {}]",
            params.freq,
            MIN_FREQ,
            sample_rate >> 1
        )));
    }

    match params.kind {
        FilterType::Peak => {
            if params.gain < MIN_GAIN
                || params.gain > MAX_GAIN
                || params.quality < MIN_QUALITY
                || params.quality > MAX_QUALITY
                || params.order != 2
            {
                return Err(DspError::InvalidFilterParams(
                    "peak filter requires gain/quality in range and order == 2".into(),
                ));
            }
        }
        FilterType::Bandpass => {
            if params.quality < MIN_QUALITY || params.quality > MAX_QUALITY || params.order != 2 {
                return Err(DspError::InvalidFilterParams(
                    "band-pass filter requires quality in range and order == 2".into(),
                ));
            }
        }
        FilterType::Lowpass | FilterType::Highpass => {
            if params.order < 1 || params.order > MAX_ORDER {
                return Err(DspError::InvalidFilterParams(format!(
                    "order {} outside [1, {}]",
                    params.order, MAX_ORDER
                )));
            }
            if params.order > 2
                && (params.section < 1 || params.section > ((params.order + 1) >> 1))
            {
                return Err(DspError::InvalidFilterParams(format!(
                    "section {} invalid for order {}",
                    params.section, params.order
                )));
            }
        }
        FilterType::LowShelving | FilterType::HighShelving => {
            if params.gain < MIN_GAIN
                || params.gain > MAX_GAIN
                || params.order < 1
                || params.order > 2
            {
                return Err(DspError::InvalidFilterParams(
                    "shelving filter requires gain in range and order 1 or 2".into(),
                ));
            }
        }
        FilterType::Flat => unreachable!(),
    }

    Ok(())
}

/// Pre-warped, normalized cut-off frequency, `K = tan(pi * fc / fs)`.
#[inline]
pub fn pre_warped_frequency(freq: f32, sample_rate: f32) -> f32 {
    (std::f32::consts::PI * freq / sample_rate).tan()
}

/// Decide whether a filter with these parameters needs the f64 plane.
pub fn needs_double_precision(params: &FilterParams) -> bool {
    match params.kind {
        FilterType::Peak => {
            params.freq < PEAK_FREQ_BORDER || params.quality > PEAK_QUALITY_BORDER
        }
        FilterType::Lowpass => params.freq < LOWPASS_FREQ_BORDER,
        FilterType::Highpass => params.freq < HIGHPASS_FREQ_BORDER,
        FilterType::LowShelving | FilterType::HighShelving => {
            params.freq <= SHELVING_FREQ_BORDER && params.order == 2
        }
        _ => false,
    }
}

/// Butterworth pole parameter alpha for a given order and section.
///
/// See the Butterworth coefficient tables: the poles of an Nth-order filter
/// lie on the unit circle, and each biquad section realizes one conjugate
/// pair selected by `section`.
fn alpha_butterworth(order: u32, section: u32) -> DspResult<f32> {
    use std::f32::consts::PI;
    debug_assert!(order > 1);
    if order == 2 {
        Ok(2.0 * (PI * 1.0 / 4.0).cos())
    } else if order & 1 == 1 {
        // Odd order: section 1 is the first-order stage, pairs start at 2.
        if section < 2 || 2 * section > order + 1 {
            return Err(DspError::InvalidFilterParams(format!(
                "section {} invalid for odd order {}",
                section, order
            )));
        }
        Ok(2.0 * (PI * (section - 1) as f32 / order as f32).cos())
    } else {
        if section < 1 || 2 * section > order {
            return Err(DspError::InvalidFilterParams(format!(
                "section {} invalid for even order {}",
                section, order
            )));
        }
        Ok(2.0 * (PI * (2 * section - 1) as f32 / (2 * order) as f32).cos())
    }
}

/// Compute the coefficients `[b0, b1, b2, a1, a2]` of one biquad stage.
///
/// * `k` - pre-warped frequency, `tan(pi * fc / fs)`
/// * `v` - linear gain of a peak or shelving filter
/// * `q` - quality of a peak or band-pass filter
///
/// For higher-order filters only the pole/zero pair selected by `section`
/// is produced. The same values cast to f64 form the double-precision
/// coefficient set.
pub fn biquad_coeffs(
    k: f32,
    v: f32,
    q: f32,
    kind: FilterType,
    order: u32,
    section: u32,
) -> DspResult<[f32; BIQUAD_COEFFS]> {
    let c: [f32; BIQUAD_COEFFS] = match kind {
        FilterType::Flat => [1.0, 0.0, 0.0, 0.0, 0.0],

        FilterType::Peak => {
            if v >= 1.0 {
                let den = 1.0 / (1.0 + k / q + k * k);
                [
                    (1.0 + (v / q) * k + k * k) * den,
                    2.0 * (k * k - 1.0) * den,
                    (1.0 - (v / q) * k + k * k) * den,
                    2.0 * (k * k - 1.0) * den,
                    (1.0 - k / q + k * k) * den,
                ]
            } else {
                // Note that this definition of V differs from Zoelzer's.
                let den = 1.0 / (1.0 + k / (v * q) + k * k);
                [
                    (1.0 + k / q + k * k) * den,
                    2.0 * (k * k - 1.0) * den,
                    (1.0 - k / q + k * k) * den,
                    2.0 * (k * k - 1.0) * den,
                    (1.0 - k / (v * q) + k * k) * den,
                ]
            }
        }

        FilterType::Bandpass => {
            let den = 1.0 / (1.0 + k / q + k * k);
            [
                (k / q) * den,
                0.0,
                -(k / q) * den,
                2.0 * (k * k - 1.0) * den,
                (1.0 - k / q + k * k) * den,
            ]
        }

        FilterType::Lowpass => {
            if order == 1 || (order & 1 == 1 && section == 1) {
                // 1st order filter or 1st section of an odd-order filter.
                let den = 1.0 / (k + 1.0);
                [k * den, k * den, 0.0, (k - 1.0) * den, 0.0]
            } else {
                let alpha = alpha_butterworth(order, section)?;
                let den = 1.0 / (1.0 + alpha * k + k * k);
                [
                    k * k * den,
                    2.0 * k * k * den,
                    k * k * den,
                    2.0 * (k * k - 1.0) * den,
                    (1.0 - alpha * k + k * k) * den,
                ]
            }
        }

        FilterType::Highpass => {
            if order == 1 || (order & 1 == 1 && section == 1) {
                let den = 1.0 / (k + 1.0);
                [den, -den, 0.0, (k - 1.0) * den, 0.0]
            } else {
                let alpha = alpha_butterworth(order, section)?;
                let den = 1.0 / (1.0 + alpha * k + k * k);
                [
                    den,
                    -2.0 * den,
                    den,
                    2.0 * (k * k - 1.0) * den,
                    (1.0 - alpha * k + k * k) * den,
                ]
            }
        }

        FilterType::LowShelving => {
            if order == 1 {
                if v >= 1.0 {
                    let den = 1.0 / (k + 1.0);
                    [
                        (k * v + 1.0) * den,
                        (k * v - 1.0) * den,
                        0.0,
                        (k - 1.0) * den,
                        0.0,
                    ]
                } else {
                    let den = 1.0 / (k / v + 1.0);
                    [
                        (k + 1.0) * den,
                        (k - 1.0) * den,
                        0.0,
                        (k / v - 1.0) * den,
                        0.0,
                    ]
                }
            } else if order == 2 {
                let sqrt2 = std::f32::consts::SQRT_2;
                let sqrt_v = v.sqrt();
                if v >= 1.0 {
                    let den = 1.0 / (1.0 + sqrt2 * k + k * k);
                    [
                        (1.0 + sqrt2 * sqrt_v * k + v * k * k) * den,
                        2.0 * (v * k * k - 1.0) * den,
                        (1.0 - sqrt2 * sqrt_v * k + v * k * k) * den,
                        2.0 * (k * k - 1.0) * den,
                        (1.0 - sqrt2 * k + k * k) * den,
                    ]
                } else {
                    // Note that this definition of V differs from Zoelzer's.
                    let den = 1.0 / (1.0 + sqrt2 * k / sqrt_v + k * k / v);
                    [
                        (1.0 + sqrt2 * k + k * k) * den,
                        2.0 * (k * k - 1.0) * den,
                        (1.0 - sqrt2 * k + k * k) * den,
                        2.0 * (k * k / v - 1.0) * den,
                        (1.0 - sqrt2 * k / sqrt_v + k * k / v) * den,
                    ]
                }
            } else {
                return Err(DspError::InvalidFilterParams(
                    "shelving order must be 1 or 2".into(),
                ));
            }
        }

        FilterType::HighShelving => {
            if order == 1 {
                if v >= 1.0 {
                    let den = 1.0 / (k + 1.0);
                    [
                        (k + v) * den,
                        (k - v) * den,
                        0.0,
                        (k - 1.0) * den,
                        0.0,
                    ]
                } else {
                    let den = 1.0 / (k + 1.0 / v);
                    [
                        (k + 1.0) * den,
                        (k - 1.0) * den,
                        0.0,
                        (k - 1.0 / v) * den,
                        0.0,
                    ]
                }
            } else if order == 2 {
                let sqrt2 = std::f32::consts::SQRT_2;
                let sqrt_v = v.sqrt();
                if v >= 1.0 {
                    let den = 1.0 / (1.0 + sqrt2 * k + k * k);
                    [
                        (v + sqrt2 * sqrt_v * k + k * k) * den,
                        2.0 * (k * k - v) * den,
                        (v - sqrt2 * sqrt_v * k + k * k) * den,
                        2.0 * (k * k - 1.0) * den,
                        (1.0 - sqrt2 * k + k * k) * den,
                    ]
                } else {
                    // Note that this definition of V differs from Zoelzer's.
                    let den1 = 1.0 / (1.0 / v + sqrt2 * k / sqrt_v + k * k);
                    let den2 = 1.0 / (1.0 + sqrt2 * k * sqrt_v + k * k * v);
                    [
                        (1.0 + sqrt2 * k + k * k) * den1,
                        2.0 * (k * k - 1.0) * den1,
                        (1.0 - sqrt2 * k + k * k) * den1,
                        2.0 * (k * k * v - 1.0) * den2,
                        (1.0 - sqrt2 * k * sqrt_v + k * k * v) * den2,
                    ]
                }
            } else {
                return Err(DspError::InvalidFilterParams(
                    "shelving order must be 1 or 2".into(),
                ));
            }
        }
    };

    Ok(c)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FS: u32 = 48_000;

    fn coeffs_for(params: &FilterParams) -> [f32; 5] {
        let k = pre_warped_frequency(params.freq as f32, FS as f32);
        biquad_coeffs(
            k,
            params.gain,
            params.quality,
            params.kind,
            params.order,
            params.section,
        )
        .unwrap()
    }

    #[test]
    fn test_flat_coeffs() {
        let c = coeffs_for(&FilterParams::default());
        assert_eq!(c, [1.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_first_order_lowpass_200hz() {
        // K = tan(pi*200/48000) ~= 0.01308996
        // b0 = K/(K+1) ~= 0.01292063, b1 = b0, a1 = (K-1)/(K+1) ~= -0.97415874
        let params = FilterParams {
            freq: 200,
            kind: FilterType::Lowpass,
            order: 1,
            ..Default::default()
        };
        let c = coeffs_for(&params);
        assert!((c[0] - 0.01292063).abs() < 1e-6, "b0 = {}", c[0]);
        assert!((c[1] - 0.01292063).abs() < 1e-6, "b1 = {}", c[1]);
        assert_eq!(c[2], 0.0);
        assert!((c[3] - (-0.97415874)).abs() < 1e-6, "a1 = {}", c[3]);
        assert_eq!(c[4], 0.0);
    }

    #[test]
    fn test_peak_1khz_q1_v2() {
        // Boost case, K = tan(pi/48).
        let k = (std::f32::consts::PI / 48.0).tan();
        let params = FilterParams {
            freq: 1000,
            gain: 2.0,
            quality: 1.0,
            kind: FilterType::Peak,
            order: 2,
            section: 1,
        };
        let c = coeffs_for(&params);
        let den = 1.0 / (1.0 + k + k * k);
        assert!((c[0] - (1.0 + 2.0 * k + k * k) * den).abs() < 1e-6);
        assert!((c[1] - 2.0 * (k * k - 1.0) * den).abs() < 1e-6);
        assert!((c[2] - (1.0 - 2.0 * k + k * k) * den).abs() < 1e-6);
        assert!((c[3] - c[1]).abs() < 1e-7, "a1 equals b1 for the peak filter");
        assert!((c[4] - (1.0 - k + k * k) * den).abs() < 1e-6);
    }

    #[test]
    fn test_peak_cut_case_differs_from_boost() {
        let boost = coeffs_for(&FilterParams {
            freq: 1000,
            gain: 2.0,
            quality: 1.0,
            kind: FilterType::Peak,
            order: 2,
            section: 1,
        });
        let cut = coeffs_for(&FilterParams {
            freq: 1000,
            gain: 0.5,
            quality: 1.0,
            kind: FilterType::Peak,
            order: 2,
            section: 1,
        });
        assert_ne!(boost, cut);
        // A cut filter attenuates: b0 must be below the boost b0.
        assert!(cut[0] < boost[0]);
    }

    #[test]
    fn test_check_params_ranges() {
        let valid = FilterParams {
            freq: 1000,
            gain: 2.0,
            quality: 1.0,
            kind: FilterType::Peak,
            order: 2,
            section: 1,
        };
        assert!(check_params(&valid, FS).is_ok());

        // Frequency above Nyquist.
        let mut p = valid;
        p.freq = 25_000;
        assert!(check_params(&p, FS).is_err());

        // Frequency below the minimum.
        p = valid;
        p.freq = 5;
        assert!(check_params(&p, FS).is_err());

        // Gain out of range.
        p = valid;
        p.gain = 2000.0;
        assert!(check_params(&p, FS).is_err());

        // Peak filter must be order 2.
        p = valid;
        p.order = 4;
        assert!(check_params(&p, FS).is_err());

        // Shelving order at most 2.
        p = valid;
        p.kind = FilterType::LowShelving;
        p.order = 3;
        assert!(check_params(&p, FS).is_err());

        // High-order low-pass with a section beyond ceil(order/2).
        p = valid;
        p.kind = FilterType::Lowpass;
        p.order = 6;
        p.section = 4;
        assert!(check_params(&p, FS).is_err());
        p.section = 3;
        assert!(check_params(&p, FS).is_ok());

        // Flat accepts anything.
        p = valid;
        p.kind = FilterType::Flat;
        p.freq = 0;
        assert!(check_params(&p, FS).is_ok());
    }

    #[test]
    fn test_precision_decision() {
        let mut p = FilterParams {
            freq: 100,
            gain: 2.0,
            quality: 1.0,
            kind: FilterType::Peak,
            order: 2,
            section: 1,
        };
        // Peak below 300 Hz.
        assert!(needs_double_precision(&p));
        // Peak above 300 Hz with Q <= 1.
        p.freq = 1000;
        assert!(!needs_double_precision(&p));
        // Peak with Q > 1.
        p.quality = 2.0;
        assert!(needs_double_precision(&p));

        // Shelving at the border frequency, order 2.
        p = FilterParams {
            freq: 200,
            gain: 2.0,
            quality: 1.0,
            kind: FilterType::HighShelving,
            order: 2,
            section: 1,
        };
        assert!(needs_double_precision(&p));
        p.order = 1;
        assert!(!needs_double_precision(&p));

        // Flat never needs it.
        assert!(!needs_double_precision(&FilterParams::default()));
    }

    #[test]
    fn test_butterworth_sections_differ() {
        let p1 = FilterParams {
            freq: 1000,
            kind: FilterType::Lowpass,
            order: 4,
            section: 1,
            ..Default::default()
        };
        let mut p2 = p1;
        p2.section = 2;
        assert_ne!(coeffs_for(&p1), coeffs_for(&p2));
    }

    #[test]
    fn test_bandpass_zero_at_dc() {
        let c = coeffs_for(&FilterParams {
            freq: 1000,
            quality: 1.0,
            kind: FilterType::Bandpass,
            order: 2,
            ..Default::default()
        });
        // b0 + b1 + b2 == 0 -> zero gain at DC.
        assert!((c[0] + c[1] + c[2]).abs() < 1e-7);
    }
}
