use crate::config::ProbeConfig;
use std::time::Duration;

/// Delays before each health probe: zero for the first, then `initial`,
/// doubling each time. Ends after `max_attempts` probes, or earlier when the
/// next delay would exceed `max_delay`, so delays are strictly increasing and
/// the whole schedule is bounded.
#[derive(Debug, Clone)]
pub struct ProbeSchedule {
    remaining: u32,
    next: Option<Duration>,
    max_delay: Duration,
    first: bool,
}

impl ProbeSchedule {
    pub fn new(config: &ProbeConfig) -> Self {
        Self {
            remaining: config.max_attempts,
            next: Some(Duration::from_millis(config.initial_delay_ms.max(1))),
            max_delay: Duration::from_millis(config.max_delay_ms),
            first: true,
        }
    }

    /// Upper bound on total waiting time across the schedule.
    pub fn total_delay(&self) -> Duration {
        self.clone().sum()
    }
}

impl Iterator for ProbeSchedule {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        if self.first {
            self.first = false;
            self.remaining -= 1;
            return Some(Duration::ZERO);
        }
        let delay = self.next?;
        if delay > self.max_delay {
            self.remaining = 0;
            return None;
        }
        self.remaining -= 1;
        self.next = delay.checked_mul(2);
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(max_attempts: u32, initial: u64, max: u64) -> ProbeConfig {
        ProbeConfig {
            max_attempts,
            initial_delay_ms: initial,
            max_delay_ms: max,
        }
    }

    #[test]
    fn doubles_from_initial() {
        let delays: Vec<u64> = ProbeSchedule::new(&cfg(5, 100, 10_000))
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![0, 100, 200, 400, 800]);
    }

    #[test]
    fn stops_at_max_delay() {
        let delays: Vec<u64> = ProbeSchedule::new(&cfg(10, 1000, 3000))
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![0, 1000, 2000]);
    }

    #[test]
    fn zero_attempts_never_probes() {
        assert_eq!(ProbeSchedule::new(&cfg(0, 100, 1000)).count(), 0);
    }

    #[test]
    fn strictly_increasing_and_bounded() {
        let s = ProbeSchedule::new(&ProbeConfig::default());
        let delays: Vec<Duration> = s.clone().collect();
        assert!(delays.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(s.total_delay(), delays.iter().sum());
        assert!(delays.len() <= ProbeConfig::default().max_attempts as usize);
    }
}
