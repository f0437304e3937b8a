/// Multi-channel chunk of samples, stored channel-major with shape
/// `(channels, samples)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    channels: usize,
    samples: usize,
    data: Vec<f64>,
}

impl Block {
    /// Creates a zero-filled block.
    pub fn new(channels: usize, samples: usize) -> Self {
        Self {
            channels,
            samples,
            data: vec![0.0; channels * samples],
        }
    }

    /// Builds a block from one row per channel. All rows must share a length.
    pub fn from_rows(rows: &[Vec<f64>]) -> Option<Self> {
        let samples = rows.first().map(Vec::len).unwrap_or(0);
        if rows.iter().any(|row| row.len() != samples) {
            return None;
        }
        Some(Self {
            channels: rows.len(),
            samples,
            data: rows.concat(),
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    /// Total number of scalar values held by the block.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn row(&self, channel: usize) -> &[f64] {
        let start = channel * self.samples;
        &self.data[start..start + self.samples]
    }

    pub fn row_mut(&mut self, channel: usize) -> &mut [f64] {
        let start = channel * self.samples;
        &mut self.data[start..start + self.samples]
    }

    pub fn get(&self, channel: usize, sample: usize) -> f64 {
        self.data[channel * self.samples + sample]
    }

    pub fn set(&mut self, channel: usize, sample: usize, value: f64) {
        self.data[channel * self.samples + sample] = value;
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_are_channel_major() {
        let block = Block::from_rows(&[vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]).unwrap();

        assert_eq!(block.channels(), 2);
        assert_eq!(block.samples(), 3);
        assert_eq!(block.row(1), &[4.0, 5.0, 6.0]);
        assert_eq!(block.get(0, 2), 3.0);
        assert_eq!(block.as_slice(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn rejects_ragged_rows() {
        assert!(Block::from_rows(&[vec![1.0], vec![1.0, 2.0]]).is_none());
    }
}
