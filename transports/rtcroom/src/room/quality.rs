//! Debounced room quality

use crate::peer::QualityLevel;

/// Tracks the worst quality across live connections
///
/// Only a change of the minimum is reported.
#[derive(Debug, Default)]
pub struct QualityAggregator {
    current: Option<QualityLevel>,
}

impl QualityAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last reported minimum
    pub fn current(&self) -> Option<QualityLevel> {
        self.current
    }

    /// Recompute from the levels of every live stream's connection
    ///
    /// Returns the new minimum when it differs from the previous one.
    pub fn update<I>(&mut self, levels: I) -> Option<QualityLevel>
    where
        I: IntoIterator<Item = QualityLevel>,
    {
        let minimum = levels.into_iter().min();
        if minimum == self.current {
            return None;
        }
        self.current = minimum;
        minimum
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use QualityLevel::*;

    #[test]
    fn test_emits_only_on_change() {
        let mut aggregator = QualityAggregator::new();
        assert_eq!(aggregator.update([Good, Good, LowPacketLosses]), Some(LowPacketLosses));
        assert_eq!(aggregator.update([Good, Good, LowPacketLosses]), None);
        assert_eq!(aggregator.update([Good, LowPacketLosses, LowPacketLosses]), None);
        assert_eq!(aggregator.update([Good, Good, Good]), Some(Good));
        assert_eq!(aggregator.current(), Some(Good));
    }

    #[test]
    fn test_empty_set_is_silent() {
        let mut aggregator = QualityAggregator::new();
        assert_eq!(aggregator.update(std::iter::empty()), None);
        assert_eq!(aggregator.update([HighPacketLosses]), Some(HighPacketLosses));
        assert_eq!(aggregator.update(std::iter::empty()), None);
        assert_eq!(aggregator.current(), None);
    }
}
