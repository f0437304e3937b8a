//! Periodic waveform sources evaluated as pure functions of absolute time.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::{Result, ScanError};

/// Offset applied to the pulse phase so the edge at `t = 0` never lands
/// exactly on the discontinuity.
const PULSE_EDGE_OFFSET: f64 = 1e-5;

/// Shape of a periodic output channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum WaveformKind {
    /// Linear ramp from `range_min` to `range_max`, repeating every period.
    Ramp,
    /// Rectangular pulse, at `range_max` for the first `duty_cycle` fraction
    /// of each period and at `range_min` for the rest.
    Pulse { duty_cycle: f64 },
}

impl WaveformKind {
    /// Voltage of this shape at absolute time `t`.
    #[inline]
    pub fn voltage(self, t: f64, frequency: f64, range_min: f64, range_max: f64) -> f64 {
        match self {
            WaveformKind::Ramp => {
                let phase = (t * frequency).rem_euclid(1.0);
                range_min + phase * (range_max - range_min)
            }
            WaveformKind::Pulse { duty_cycle } => {
                let phase = (t * frequency - PULSE_EDGE_OFFSET).rem_euclid(1.0);
                if phase >= duty_cycle {
                    range_min
                } else {
                    range_max
                }
            }
        }
    }
}

/// `f64` stored as raw bits so readers never observe a partially written value.
#[derive(Debug)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    #[inline]
    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// One logical output channel bound to a physical analog output line.
///
/// The hardware limits are fixed once constructed. The operator range and
/// the frequency may be changed from another thread while a refill reads
/// them; each field is read individually, so a block may pair a new
/// `range_min` with an old `range_max`.
#[derive(Debug)]
pub struct WaveformSpec {
    channel_id: String,
    label: String,
    min_val: f64,
    max_val: f64,
    range_min: AtomicF64,
    range_max: AtomicF64,
    frequency: AtomicF64,
    kind: WaveformKind,
}

impl WaveformSpec {
    /// Creates a channel whose operator range spans the full hardware limits.
    pub fn new(
        channel_id: impl Into<String>,
        min_val: f64,
        max_val: f64,
        kind: WaveformKind,
        frequency: f64,
    ) -> Result<Self> {
        let channel_id = channel_id.into();
        if !(min_val.is_finite() && max_val.is_finite()) || min_val >= max_val {
            return Err(ScanError::configuration(format!(
                "channel `{channel_id}` has invalid limits [{min_val}, {max_val}]"
            )));
        }
        if let WaveformKind::Pulse { duty_cycle } = kind {
            if !(0.0..=1.0).contains(&duty_cycle) {
                return Err(ScanError::configuration(format!(
                    "channel `{channel_id}` has duty cycle {duty_cycle} outside [0, 1]"
                )));
            }
        }
        if !(frequency.is_finite() && frequency > 0.0) {
            return Err(ScanError::configuration(format!(
                "channel `{channel_id}` has non-positive frequency {frequency}"
            )));
        }

        Ok(Self {
            label: channel_id.clone(),
            channel_id,
            min_val,
            max_val,
            range_min: AtomicF64::new(min_val),
            range_max: AtomicF64::new(max_val),
            frequency: AtomicF64::new(frequency),
            kind,
        })
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Sets the initial operator range, rejecting values outside the limits.
    pub fn with_range(self, range_min: f64, range_max: f64) -> Result<Self> {
        self.check_range(range_min, range_max)
            .map_err(ScanError::Configuration)?;
        self.store_range(range_min, range_max);
        Ok(self)
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn min_val(&self) -> f64 {
        self.min_val
    }

    pub fn max_val(&self) -> f64 {
        self.max_val
    }

    pub fn kind(&self) -> WaveformKind {
        self.kind
    }

    pub fn range(&self) -> (f64, f64) {
        (self.range_min.load(), self.range_max.load())
    }

    /// Updates the operator range. Takes effect on the next rendered block.
    pub fn set_range(&self, range_min: f64, range_max: f64) -> Result<()> {
        self.check_range(range_min, range_max)
            .map_err(ScanError::PreconditionViolation)?;
        self.store_range(range_min, range_max);
        Ok(())
    }

    pub fn frequency(&self) -> f64 {
        self.frequency.load()
    }

    /// Frequency changes move the wrap period of the whole channel set, so
    /// only the engine's timebase critical section may call this.
    pub(crate) fn store_frequency(&self, frequency: f64) {
        self.frequency.store(frequency);
    }

    /// Evaluates the channel at each timestamp.
    pub fn generate(&self, sample_times: &[f64]) -> Vec<f64> {
        let mut out = vec![0.0; sample_times.len()];
        self.render_into(sample_times, &mut out);
        out
    }

    /// Allocation-free variant of [`generate`](Self::generate) used on the
    /// refill path. `out` must be as long as `sample_times`.
    pub fn render_into(&self, sample_times: &[f64], out: &mut [f64]) {
        debug_assert_eq!(sample_times.len(), out.len());
        let (range_min, range_max) = self.range();
        let frequency = self.frequency();
        let kind = self.kind;
        for (value, &t) in out.iter_mut().zip(sample_times) {
            *value = kind.voltage(t, frequency, range_min, range_max);
        }
    }

    fn store_range(&self, range_min: f64, range_max: f64) {
        self.range_min.store(range_min);
        self.range_max.store(range_max);
    }

    fn check_range(&self, range_min: f64, range_max: f64) -> std::result::Result<(), String> {
        if !(range_min.is_finite() && range_max.is_finite()) || range_min > range_max {
            return Err(format!(
                "range [{range_min}, {range_max}] for `{}` is not ordered",
                self.channel_id
            ));
        }
        if range_min < self.min_val || range_max > self.max_val {
            return Err(format!(
                "range [{range_min}, {range_max}] for `{}` exceeds limits [{}, {}]",
                self.channel_id, self.min_val, self.max_val
            ));
        }
        Ok(())
    }
}
