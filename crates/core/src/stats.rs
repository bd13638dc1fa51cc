//! Token length statistics for encoded datasets.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct LengthStats {
    pub count: usize,
    pub mean: f64,
    /// Population standard deviation.
    pub std: f64,
    pub min: usize,
    pub max: usize,
}

impl LengthStats {
    pub fn from_lengths(lengths: &[usize]) -> Self {
        let count = lengths.len();
        if count == 0 {
            return Self::default();
        }
        let mean = lengths.iter().sum::<usize>() as f64 / count as f64;
        let variance = lengths
            .iter()
            .map(|&len| (len as f64 - mean).powi(2))
            .sum::<f64>()
            / count as f64;
        Self {
            count,
            mean,
            std: variance.sqrt(),
            min: lengths.iter().copied().min().unwrap_or(0),
            max: lengths.iter().copied().max().unwrap_or(0),
        }
    }
}

impl std::fmt::Display for LengthStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} samples, {:.1}±{:.1} tokens, min={}, max={}",
            self.count, self.mean, self.std, self.min, self.max
        )
    }
}
