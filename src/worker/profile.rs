use std::time::Duration;

use serde::Serialize;

/// Rolling histogram of durations with geometrically growing buckets,
/// dumped as JSON diagnostics at shutdown.
#[derive(Debug, Clone, Serialize)]
pub struct DurationProfile {
    base_us: f64,
    factor: f64,
    counts: Vec<u64>,
    overflow: u64,
}

impl DurationProfile {
    pub fn new(base: Duration, factor: f64, buckets: usize) -> Self {
        Self {
            base_us: base.as_secs_f64() * 1e6,
            factor,
            counts: vec![0; buckets],
            overflow: 0,
        }
    }

    pub fn record(&mut self, elapsed: Duration) {
        let micros = elapsed.as_secs_f64() * 1e6;
        let mut bound = self.base_us;
        for count in &mut self.counts {
            if micros < bound {
                *count += 1;
                return;
            }
            bound *= self.factor;
        }
        self.overflow += 1;
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum::<u64>() + self.overflow
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_land_in_geometric_buckets() {
        let mut profile = DurationProfile::new(Duration::from_millis(1), 2.0, 4);
        // Bucket bounds: 1ms, 2ms, 4ms, 8ms.
        profile.record(Duration::from_micros(500));
        profile.record(Duration::from_micros(1500));
        profile.record(Duration::from_micros(3000));
        profile.record(Duration::from_micros(7000));
        profile.record(Duration::from_millis(20));

        assert_eq!(profile.counts, vec![1, 1, 1, 1]);
        assert_eq!(profile.overflow, 1);
        assert_eq!(profile.total(), 5);
    }

    #[test]
    fn starts_empty() {
        let profile = DurationProfile::new(Duration::from_millis(1), 1.2, 8);
        assert!(profile.is_empty());
    }

    #[test]
    fn serializes_with_stable_shape() {
        let mut profile = DurationProfile::new(Duration::from_millis(1), 1.2, 2);
        profile.record(Duration::from_micros(100));
        let value = serde_json::to_value(&profile).expect("profile serializes");
        assert!(value.get("counts").is_some());
        assert!(value.get("overflow").is_some());
        assert!(value.get("base_us").is_some());
    }
}
