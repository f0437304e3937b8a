use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    channel::{check_below_nyquist, check_frequency_ratios},
    Result, ScanError, Timebase, WaveformKind,
};

/// Top-level configuration structure for the scanner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub device: DeviceConfig,
    pub stream: StreamConfig,
    pub scan: ScanTiming,
    pub outputs: Vec<OutputChannelConfig>,
    pub inputs: Vec<InputChannelConfig>,
    pub park: ParkConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            stream: StreamConfig::default(),
            scan: ScanTiming::default(),
            outputs: vec![
                OutputChannelConfig {
                    channel_id: "ao0".to_string(),
                    label: "x galvo".to_string(),
                    min_val: -10.0,
                    max_val: 10.0,
                    range: Some((-5.0, 5.0)),
                    axis: ScanAxis::Fast,
                    waveform: WaveformKind::Ramp,
                },
                OutputChannelConfig {
                    channel_id: "ao1".to_string(),
                    label: "z galvo".to_string(),
                    min_val: -10.0,
                    max_val: 10.0,
                    range: Some((-5.0, 5.0)),
                    axis: ScanAxis::Volume,
                    waveform: WaveformKind::Ramp,
                },
                OutputChannelConfig {
                    channel_id: "ao2".to_string(),
                    label: "piezo".to_string(),
                    min_val: 0.0,
                    max_val: 10.0,
                    range: Some((0.0, 5.0)),
                    axis: ScanAxis::Volume,
                    waveform: WaveformKind::Ramp,
                },
                OutputChannelConfig {
                    channel_id: "ao3".to_string(),
                    label: "camera trigger".to_string(),
                    min_val: 0.0,
                    max_val: 5.0,
                    range: None,
                    axis: ScanAxis::Fast,
                    waveform: WaveformKind::Pulse { duty_cycle: 0.5 },
                },
            ],
            inputs: vec![InputChannelConfig {
                channel_id: "ai0".to_string(),
                min_val: -10.0,
                max_val: 10.0,
                terminal: TerminalConfig::Rse,
            }],
            park: ParkConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Frequency of every output channel, in channel order.
    pub fn frequencies(&self) -> Vec<f64> {
        self.frequencies_for(&self.scan)
    }

    pub fn frequencies_for(&self, timing: &ScanTiming) -> Vec<f64> {
        self.outputs
            .iter()
            .map(|output| timing.frequency(output.axis, self.stream.refreshes_per_sec))
            .collect()
    }

    /// Checks everything that can be checked without a device.
    pub fn validate(&self) -> Result<()> {
        let stream = &self.stream;
        if !(stream.sample_rate.is_finite() && stream.sample_rate > 0.0) {
            return Err(ScanError::configuration(format!(
                "sample rate {} must be positive",
                stream.sample_rate
            )));
        }
        if stream.refreshes_per_sec == 0 || stream.samples_per_refresh() == 0 {
            return Err(ScanError::configuration(
                "refresh rate leaves no samples per refresh",
            ));
        }
        if stream.buffer_oversize == 0 {
            return Err(ScanError::configuration("buffer oversize must be at least 1"));
        }
        for timeout in [
            stream.write_timeout_secs,
            stream.read_timeout_secs,
            stream.single_write_timeout_secs,
        ] {
            if !(timeout > 0.0 && Duration::try_from_secs_f64(timeout).is_ok()) {
                return Err(ScanError::configuration(format!(
                    "timeout {timeout}s must be positive and representable"
                )));
            }
        }
        let widest = self.outputs.len().max(self.inputs.len());
        if stream
            .samples_per_refresh()
            .checked_mul(widest)
            .and_then(|samples| samples.checked_mul(stream.buffer_oversize))
            .is_none()
        {
            return Err(ScanError::configuration(format!(
                "buffer of {} blocks does not fit in memory",
                stream.buffer_oversize
            )));
        }
        if self.scan.frames_per_buffer == 0 || self.scan.buffers_per_volume == 0 {
            return Err(ScanError::configuration("scan timing values must be non-zero"));
        }
        if self.outputs.is_empty() {
            return Err(ScanError::configuration("at least one output channel is required"));
        }
        for input in &self.inputs {
            if !(input.min_val.is_finite() && input.max_val.is_finite())
                || input.min_val >= input.max_val
            {
                return Err(ScanError::configuration(format!(
                    "input `{}` has invalid limits [{}, {}]",
                    input.channel_id, input.min_val, input.max_val
                )));
            }
        }
        let frequencies = self.frequencies();
        check_below_nyquist(&frequencies, stream.sample_rate)?;
        check_frequency_ratios(&frequencies)?;
        let slowest = frequencies.iter().copied().fold(f64::INFINITY, f64::min);
        Timebase::new(stream.sample_rate, 1.0 / slowest).map(|_| ())
    }
}

/// Device the channels are bound to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub name: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "Dev2".to_string(),
        }
    }
}

impl DeviceConfig {
    /// Fully qualified physical line, e.g. `Dev2/ao0`.
    pub fn line(&self, channel_id: &str) -> String {
        format!("{}/{}", self.name, channel_id)
    }
}

/// Sample clock and buffering of the output and input streams.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub sample_rate: f64,
    /// Approximate number of refill callbacks per second.
    pub refreshes_per_sec: u32,
    /// How many blocks the hardware buffer holds.
    pub buffer_oversize: usize,
    pub write_timeout_secs: f64,
    pub read_timeout_secs: f64,
    pub single_write_timeout_secs: f64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            sample_rate: 100_000.0,
            refreshes_per_sec: 10,
            buffer_oversize: 5,
            write_timeout_secs: 5.0,
            read_timeout_secs: 5.0,
            single_write_timeout_secs: 2.0,
        }
    }
}

impl StreamConfig {
    pub fn samples_per_refresh(&self) -> usize {
        (self.sample_rate / self.refreshes_per_sec as f64).floor() as usize
    }

    pub fn write_timeout(&self) -> Duration {
        seconds(self.write_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        seconds(self.read_timeout_secs)
    }

    pub fn single_write_timeout(&self) -> Duration {
        seconds(self.single_write_timeout_secs)
    }
}

/// Unrepresentable values are rejected by `AppConfig::validate`; saturate
/// here so an unvalidated config cannot panic.
fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
}

/// Global scan parameters from which channel frequencies are derived.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanTiming {
    /// Fast-axis frames per refill block.
    pub frames_per_buffer: u32,
    /// Refill blocks per volume sweep.
    pub buffers_per_volume: u32,
}

impl Default for ScanTiming {
    fn default() -> Self {
        Self {
            frames_per_buffer: 4,
            buffers_per_volume: 5,
        }
    }
}

impl ScanTiming {
    pub fn fast_axis_hz(&self, refreshes_per_sec: u32) -> f64 {
        f64::from(self.frames_per_buffer) * f64::from(refreshes_per_sec)
    }

    pub fn volume_rate_hz(&self, refreshes_per_sec: u32) -> f64 {
        f64::from(refreshes_per_sec) / f64::from(self.buffers_per_volume)
    }

    pub fn frequency(&self, axis: ScanAxis, refreshes_per_sec: u32) -> f64 {
        match axis {
            ScanAxis::Fast => self.fast_axis_hz(refreshes_per_sec),
            ScanAxis::Volume => self.volume_rate_hz(refreshes_per_sec),
        }
    }
}

/// Which scan rate a channel follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanAxis {
    /// One period per frame.
    Fast,
    /// One period per volume.
    Volume,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputChannelConfig {
    pub channel_id: String,
    #[serde(default)]
    pub label: String,
    pub min_val: f64,
    pub max_val: f64,
    /// Initial operator range. Defaults to the full limits.
    #[serde(default)]
    pub range: Option<(f64, f64)>,
    pub axis: ScanAxis,
    pub waveform: WaveformKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputChannelConfig {
    pub channel_id: String,
    pub min_val: f64,
    pub max_val: f64,
    #[serde(default)]
    pub terminal: TerminalConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalConfig {
    #[default]
    Rse,
    Nrse,
    Differential,
}

/// Galvo and piezo voltages used by the park operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ParkConfig {
    pub x: f64,
    pub z: f64,
    pub piezo: f64,
}

impl Default for ParkConfig {
    fn default() -> Self {
        Self {
            x: 8.0,
            z: 8.0,
            piezo: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();

        assert_eq!(config.stream.samples_per_refresh(), 10_000);
        assert_eq!(config.frequencies(), vec![40.0, 2.0, 2.0, 40.0]);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config = AppConfig::from_json_str(
            r#"{ "stream": { "sample_rate": 50000.0 }, "scan": { "frames_per_buffer": 8 } }"#,
        )
        .unwrap();

        assert_eq!(config.stream.sample_rate, 50_000.0);
        assert_eq!(config.stream.refreshes_per_sec, 10);
        assert_eq!(config.scan.buffers_per_volume, 5);
        assert_eq!(config.outputs.len(), 4);
        assert_eq!(config.frequencies()[0], 80.0);
    }

    #[test]
    fn parses_waveform_shapes() {
        let config = AppConfig::from_json_str(
            r#"{
                "outputs": [
                    { "channel_id": "ao0", "min_val": -1.0, "max_val": 1.0,
                      "axis": "volume", "waveform": { "shape": "ramp" } },
                    { "channel_id": "ao1", "min_val": 0.0, "max_val": 5.0,
                      "axis": "fast", "waveform": { "shape": "pulse", "duty_cycle": 0.25 } }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.outputs[0].waveform, WaveformKind::Ramp);
        assert_eq!(
            config.outputs[1].waveform,
            WaveformKind::Pulse { duty_cycle: 0.25 }
        );
        assert!(config.outputs[1].range.is_none());
    }

    #[test]
    fn rejects_zero_refresh_rate() {
        let mut config = AppConfig::default();
        config.stream.refreshes_per_sec = 0;
        assert!(matches!(config.validate(), Err(ScanError::Configuration(_))));
    }

    #[test]
    fn rejects_wrap_period_between_samples() {
        let mut config = AppConfig::default();
        config.stream.sample_rate = 100_001.0;
        let err = config.validate().unwrap_err();
        assert!(format!("{err}").contains("whole number of samples"));
    }

    #[test]
    fn huge_frame_count_is_a_configuration_error() {
        let err = AppConfig::from_json_str(r#"{ "scan": { "frames_per_buffer": 4294967295 } }"#)
            .unwrap_err();
        assert!(matches!(err, ScanError::Configuration(_)));
        assert!(format!("{err}").contains("Nyquist"));
    }

    #[test]
    fn unrepresentable_timeout_is_a_configuration_error() {
        let mut config = AppConfig::default();
        config.stream.write_timeout_secs = 1e30;
        assert!(matches!(config.validate(), Err(ScanError::Configuration(_))));
        assert_eq!(config.stream.write_timeout(), Duration::MAX);

        config.stream.write_timeout_secs = f64::NAN;
        assert!(matches!(config.validate(), Err(ScanError::Configuration(_))));
    }

    #[test]
    fn oversized_buffer_is_a_configuration_error() {
        let mut config = AppConfig::default();
        config.stream.buffer_oversize = usize::MAX;
        assert!(matches!(config.validate(), Err(ScanError::Configuration(_))));
    }

    #[test]
    fn qualifies_physical_lines() {
        assert_eq!(DeviceConfig::default().line("ao0"), "Dev2/ao0");
    }
}
