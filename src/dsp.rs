//! Stateless signal math: spectrum, RMS/peak extraction, dB conversion and
//! the tone generator used by stimulus expansion.

use crate::error::{Result, RigError};
use log::warn;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use std::f64::consts::{PI, SQRT_2};

/// 20 for amplitude ratios.
pub const DB_FACTOR: f64 = 20.0;

/// Single-sided amplitude spectrum: `|Re(FFT(signal))| / N` for bins
/// `0..=N/2`, with bin `k` at `k * rate / N` Hz.
///
/// Returns `(freqs, spectrum)`.
pub fn calc_spectrum(signal: &[f64], rate: f64) -> (Vec<f64>, Vec<f64>) {
    let npts = signal.len();
    if npts == 0 {
        return (Vec::new(), Vec::new());
    }
    let mut buf: Vec<Complex<f64>> = signal.iter().map(|&x| Complex::new(x, 0.0)).collect();
    let mut planner = FftPlanner::<f64>::new();
    planner.plan_fft_forward(npts).process(&mut buf);

    let nbins = npts / 2 + 1;
    let freqs = (0..nbins).map(|k| bin_frequency(k, npts, rate)).collect();
    let spectrum = buf[..nbins]
        .iter()
        .map(|c| (c.re / npts as f64).abs())
        .collect();
    (freqs, spectrum)
}

/// Frequency of FFT bin `k` for an `npts`-point transform at `rate`.
pub fn bin_frequency(k: usize, npts: usize, rate: f64) -> f64 {
    k as f64 * rate / npts as f64
}

/// Spectral value at exactly `frequency`. Bin frequencies are compared with
/// a relative tolerance of 1e-9 to absorb floating-point noise only.
pub fn fft_peak_at(freqs: &[f64], spectrum: &[f64], frequency: f64) -> Result<f64> {
    let tol = 1e-9 * frequency.abs().max(1.0);
    let mut hits = freqs
        .iter()
        .zip(spectrum)
        .filter(|(f, _)| (*f - frequency).abs() <= tol);
    match (hits.next(), hits.next()) {
        (Some((_, &v)), None) => Ok(v),
        _ => Err(RigError::CalibrationMeasurementMissing { frequency }),
    }
}

/// Root mean square of a buffer.
pub fn compute_rms(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f64).sqrt()
}

/// Peak amplitude of the sinusoid with the same RMS as `samples`.
pub fn rms_peak_equivalent(samples: &[f64]) -> f64 {
    compute_rms(samples) * SQRT_2
}

pub fn max_abs(samples: &[f64]) -> f64 {
    samples.iter().fold(0.0f64, |m, s| m.max(s.abs()))
}

/// `20*log10(peak/cal_peak) + caldb`, or an error when the ratio is undefined.
pub fn try_calc_db(peak: f64, caldb: f64, cal_peak: f64) -> Result<f64> {
    let ratio = peak / cal_peak;
    if cal_peak == 0.0 || !ratio.is_finite() || ratio < 0.0 {
        return Err(RigError::UndefinedCalibrationRatio {
            peak,
            reference: cal_peak,
        });
    }
    Ok(DB_FACTOR * ratio.log10() + caldb)
}

/// `20*log10(peak/cal_peak) + caldb`; NaN when the ratio is undefined.
pub fn calc_db(peak: f64, caldb: f64, cal_peak: f64) -> f64 {
    try_calc_db(peak, caldb, cal_peak).unwrap_or_else(|e| {
        warn!("{}", e);
        f64::NAN
    })
}

pub fn db_to_gain(db: f64) -> f64 {
    10f64.powf(db / DB_FACTOR)
}

/// Pure tone at `db` SPL, given that `calv` volts produces `caldb` SPL.
/// `risefall` seconds of linear ramp are applied at each end.
pub fn make_tone(
    freq: f64,
    db: f64,
    dur: f64,
    risefall: f64,
    samplerate: f64,
    caldb: f64,
    calv: f64,
) -> Vec<f64> {
    let npts = (dur * samplerate).round().max(0.0) as usize;
    let amp = db_to_gain(db - caldb) * calv;
    let mut tone: Vec<f64> = (0..npts)
        .map(|i| amp * (2.0 * PI * freq * i as f64 / samplerate).sin())
        .collect();
    apply_risefall(&mut tone, risefall, samplerate);
    tone
}

/// Linear ramp up over the first `risefall` seconds and down over the last.
pub fn apply_risefall(signal: &mut [f64], risefall: f64, samplerate: f64) {
    let rf = ((risefall * samplerate).round().max(0.0) as usize).min(signal.len() / 2);
    if rf < 2 {
        return;
    }
    let n = signal.len();
    for i in 0..rf {
        let g = i as f64 / (rf - 1) as f64;
        signal[i] *= g;
        signal[n - 1 - i] *= g;
    }
}

/// Piecewise-linear interpolation of `(xp, fp)` at `x`, clamped to the end
/// values outside the sampled range. `xp` must be ascending. NaN in, NaN out.
pub fn interp(x: f64, xp: &[f64], fp: &[f64]) -> f64 {
    let n = xp.len().min(fp.len());
    if n == 0 {
        return 0.0;
    }
    if x.is_nan() {
        return f64::NAN;
    }
    if x <= xp[0] {
        return fp[0];
    }
    if x >= xp[n - 1] {
        return fp[n - 1];
    }
    let i = xp[..n].partition_point(|&v| v <= x);
    let (x0, x1) = (xp[i - 1], xp[i]);
    let (y0, y1) = (fp[i - 1], fp[i]);
    if x1 == x0 {
        return y0;
    }
    y0 + (y1 - y0) * (x - x0) / (x1 - x0)
}
