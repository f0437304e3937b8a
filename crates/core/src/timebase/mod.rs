//! Absolute-time cursor shared by every output channel.

use crate::{Result, ScanError};

/// Tolerance used when checking that a duration spans a whole number of samples.
const WHOLE_SAMPLE_TOLERANCE: f64 = 1e-6;

/// Tracks the absolute time of the first sample of the next block.
///
/// The cursor is kept as an integer sample position modulo the wrap period,
/// so it never grows without bound and returns exactly to zero after one
/// wrap period's worth of samples.
#[derive(Debug, Clone)]
pub struct Timebase {
    sample_rate: f64,
    wrap_samples: u64,
    position: u64,
}

impl Timebase {
    /// Creates a timebase at cursor zero.
    ///
    /// `wrap_period * sample_rate` must be a whole number of samples,
    /// otherwise wrapping would shift the phase of every channel.
    pub fn new(sample_rate: f64, wrap_period: f64) -> Result<Self> {
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(ScanError::configuration(format!(
                "sample rate {sample_rate} must be positive"
            )));
        }
        let wrap_samples = wrap_samples(sample_rate, wrap_period)?;
        Ok(Self {
            sample_rate,
            wrap_samples,
            position: 0,
        })
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Absolute time, in seconds, of the next sample to be generated.
    pub fn cursor(&self) -> f64 {
        self.position as f64 / self.sample_rate
    }

    pub fn wrap_period(&self) -> f64 {
        self.wrap_samples as f64 / self.sample_rate
    }

    pub fn wrap_samples(&self) -> u64 {
        self.wrap_samples
    }

    /// Returns the timestamps of the next `n_samples` samples and advances
    /// the cursor past them.
    pub fn next_block_times(&mut self, n_samples: usize) -> Vec<f64> {
        let mut times = vec![0.0; n_samples];
        self.fill_next_block(&mut times);
        times
    }

    /// Allocation-free variant of [`next_block_times`](Self::next_block_times).
    /// Must be called exactly once per refill; the filled slice is the one
    /// timebase every channel renders against.
    pub fn fill_next_block(&mut self, times: &mut [f64]) {
        let start = self.position;
        for (offset, t) in times.iter_mut().enumerate() {
            *t = (start + offset as u64) as f64 / self.sample_rate;
        }
        self.position = (start + times.len() as u64) % self.wrap_samples;
    }

    /// Replaces the wrap period and resets the cursor to zero.
    pub fn set_wrap_period(&mut self, wrap_period: f64) -> Result<()> {
        self.wrap_samples = wrap_samples(self.sample_rate, wrap_period)?;
        self.position = 0;
        Ok(())
    }

    pub fn reset(&mut self) {
        self.position = 0;
    }
}

fn wrap_samples(sample_rate: f64, wrap_period: f64) -> Result<u64> {
    if !(wrap_period.is_finite() && wrap_period > 0.0) {
        return Err(ScanError::configuration(format!(
            "wrap period {wrap_period} must be positive"
        )));
    }
    let exact = wrap_period * sample_rate;
    let rounded = exact.round();
    if rounded < 1.0 || (exact - rounded).abs() > WHOLE_SAMPLE_TOLERANCE * rounded.max(1.0) {
        return Err(ScanError::configuration(format!(
            "wrap period {wrap_period}s is not a whole number of samples at {sample_rate} Hz"
        )));
    }
    Ok(rounded as u64)
}
