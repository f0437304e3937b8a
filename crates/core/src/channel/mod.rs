use std::sync::Arc;

use crate::{Block, Result, ScanError, WaveformSpec};

/// Tolerance for deciding that a frequency ratio is a whole number.
const RATIO_TOLERANCE: f64 = 1e-6;

/// Ordered set of output channels. The order is the physical line order and
/// the row order of every rendered block.
///
/// Cloning is cheap and every clone shares the same specs, so a range set on
/// one clone is seen by the engine's next refill.
#[derive(Debug, Clone)]
pub struct ChannelSet {
    specs: Arc<[WaveformSpec]>,
}

impl ChannelSet {
    pub fn new(specs: Vec<WaveformSpec>) -> Result<Self> {
        if specs.is_empty() {
            return Err(ScanError::configuration("at least one output channel is required"));
        }
        for (index, spec) in specs.iter().enumerate() {
            if specs[..index]
                .iter()
                .any(|other| other.channel_id() == spec.channel_id())
            {
                return Err(ScanError::configuration(format!(
                    "channel `{}` is listed twice",
                    spec.channel_id()
                )));
            }
        }
        let set = Self {
            specs: specs.into(),
        };
        check_frequency_ratios(&set.frequencies())?;
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WaveformSpec> {
        self.specs.iter()
    }

    pub fn get(&self, channel_id: &str) -> Option<&WaveformSpec> {
        self.specs.iter().find(|spec| spec.channel_id() == channel_id)
    }

    pub fn frequencies(&self) -> Vec<f64> {
        self.specs.iter().map(WaveformSpec::frequency).collect()
    }

    /// Period of the slowest channel, which every other period divides.
    pub fn wrap_period(&self) -> f64 {
        let slowest = self
            .specs
            .iter()
            .map(WaveformSpec::frequency)
            .fold(f64::INFINITY, f64::min);
        1.0 / slowest
    }

    /// Renders one block with one row per channel.
    pub fn render_block(&self, times: &[f64]) -> Block {
        let mut block = Block::new(self.len(), times.len());
        self.render_into(times, &mut block);
        block
    }

    /// Renders into a preallocated block of shape `(len(), times.len())`.
    pub fn render_into(&self, times: &[f64], block: &mut Block) {
        debug_assert_eq!(block.channels(), self.len());
        debug_assert_eq!(block.samples(), times.len());
        for (index, spec) in self.specs.iter().enumerate() {
            spec.render_into(times, block.row_mut(index));
        }
    }

    /// Stores new frequencies, one per channel in order.
    ///
    /// Callers must hold the timebase lock and reset the wrap period
    /// afterwards.
    pub(crate) fn store_frequencies(&self, frequencies: &[f64]) -> Result<()> {
        if frequencies.len() != self.len() {
            return Err(ScanError::precondition(format!(
                "expected {} frequencies, got {}",
                self.len(),
                frequencies.len()
            )));
        }
        check_frequency_ratios(frequencies)?;
        for (spec, &frequency) in self.specs.iter().zip(frequencies) {
            spec.store_frequency(frequency);
        }
        Ok(())
    }
}

/// Every channel frequency must be a whole multiple of the slowest one, so
/// the slowest period is a common period of all channels.
pub fn check_frequency_ratios(frequencies: &[f64]) -> Result<()> {
    if let Some(bad) = frequencies
        .iter()
        .find(|frequency| !(frequency.is_finite() && **frequency > 0.0))
    {
        return Err(ScanError::configuration(format!(
            "frequency {bad} must be positive"
        )));
    }
    let slowest = frequencies.iter().copied().fold(f64::INFINITY, f64::min);
    for &frequency in frequencies {
        let ratio = frequency / slowest;
        if (ratio - ratio.round()).abs() > RATIO_TOLERANCE * ratio {
            return Err(ScanError::configuration(format!(
                "frequency {frequency} Hz is not a whole multiple of {slowest} Hz"
            )));
        }
    }
    Ok(())
}

/// Every channel must stay below half the sample rate to be representable.
pub fn check_below_nyquist(frequencies: &[f64], sample_rate: f64) -> Result<()> {
    let nyquist = sample_rate / 2.0;
    match frequencies.iter().find(|frequency| **frequency > nyquist) {
        Some(frequency) => Err(ScanError::configuration(format!(
            "frequency {frequency} Hz is above the {nyquist} Hz Nyquist limit"
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WaveformKind;

    fn scan_channels() -> ChannelSet {
        ChannelSet::new(vec![
            WaveformSpec::new("ao0", -10.0, 10.0, WaveformKind::Ramp, 40.0)
                .unwrap()
                .with_range(-5.0, 5.0)
                .unwrap(),
            WaveformSpec::new("ao1", -10.0, 10.0, WaveformKind::Ramp, 2.0).unwrap(),
            WaveformSpec::new("ao3", 0.0, 5.0, WaveformKind::Pulse { duty_cycle: 0.5 }, 40.0)
                .unwrap(),
        ])
        .unwrap()
    }

    #[test]
    fn renders_rows_in_channel_order() {
        let channels = scan_channels();
        let block = channels.render_block(&[0.0, 0.00625]);

        assert_eq!(block.channels(), 3);
        assert_eq!(block.get(0, 0), -5.0);
        assert!((block.get(0, 1) - -2.5).abs() < 1e-9);
        assert!((block.get(1, 1) - (-10.0 + 20.0 * 0.0125)).abs() < 1e-9);
        assert_eq!(block.row(2), &[0.0, 5.0]);
    }

    #[test]
    fn wrap_period_follows_slowest_channel() {
        assert_eq!(scan_channels().wrap_period(), 0.5);
    }

    #[test]
    fn clones_share_ranges() {
        let channels = scan_channels();
        let ui_view = channels.clone();
        ui_view.get("ao0").unwrap().set_range(0.0, 1.0).unwrap();

        assert_eq!(channels.get("ao0").unwrap().range(), (0.0, 1.0));
    }

    #[test]
    fn rejects_incommensurate_frequencies() {
        let err = ChannelSet::new(vec![
            WaveformSpec::new("ao0", -10.0, 10.0, WaveformKind::Ramp, 3.0).unwrap(),
            WaveformSpec::new("ao1", -10.0, 10.0, WaveformKind::Ramp, 2.0).unwrap(),
        ])
        .unwrap_err();
        assert!(format!("{err}").contains("whole multiple"));
    }

    #[test]
    fn rejects_duplicate_channels() {
        let err = ChannelSet::new(vec![
            WaveformSpec::new("ao0", -10.0, 10.0, WaveformKind::Ramp, 2.0).unwrap(),
            WaveformSpec::new("ao0", -10.0, 10.0, WaveformKind::Ramp, 2.0).unwrap(),
        ])
        .unwrap_err();
        assert!(matches!(err, ScanError::Configuration(_)));
    }

    #[test]
    fn nyquist_limit_is_half_the_sample_rate() {
        assert!(check_below_nyquist(&[40.0, 5_000.0], 10_000.0).is_ok());
        let err = check_below_nyquist(&[40.0, 5_001.0], 10_000.0).unwrap_err();
        assert!(format!("{err}").contains("Nyquist"));
    }

    #[test]
    fn storing_frequencies_checks_ratios() {
        let channels = scan_channels();
        assert!(channels.store_frequencies(&[20.0, 2.5, 20.0]).is_err());
        assert_eq!(channels.frequencies(), vec![40.0, 2.0, 40.0]);

        channels.store_frequencies(&[20.0, 1.0, 20.0]).unwrap();
        assert_eq!(channels.wrap_period(), 1.0);
    }
}
