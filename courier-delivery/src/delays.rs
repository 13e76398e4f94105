use std::time::Duration;

use courier_common::internal;

use crate::delay::{DEFAULT_DELAY_TIME, Delay, DelayError, MAX_SCHEDULE_ATTEMPTS};

/// The retry schedule reconciled against the maximum number of retries.
///
/// After construction the attempts of all steps add up to `max_retries`:
/// a schedule with more attempts raises the maximum, a schedule with fewer
/// attempts stretches its last step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelaysAndMaxRetry {
    max_retries: u32,
    delays: Vec<Delay>,
    expanded: Vec<Duration>,
}

impl DelaysAndMaxRetry {
    /// Builds the schedule from a comma separated list of delays.
    ///
    /// `None` (or a blank string) yields the single default step.
    ///
    /// # Errors
    ///
    /// Any entry that does not parse makes the whole schedule invalid, as
    /// does a schedule or maximum above [`MAX_SCHEDULE_ATTEMPTS`].
    pub fn from(intended_max_retries: u32, delays: Option<&str>) -> Result<Self, DelayError> {
        let delays = match delays.map(str::trim) {
            None | Some("") => vec![Delay::default()],
            Some(schedule) => schedule
                .split(',')
                .map(str::parse)
                .collect::<Result<Vec<Delay>, _>>()?,
        };

        Self::reconcile(intended_max_retries, delays)
    }

    fn reconcile(intended_max_retries: u32, mut delays: Vec<Delay>) -> Result<Self, DelayError> {
        let total = delays
            .iter()
            .try_fold(0_u32, |sum, delay| sum.checked_add(delay.attempts()))
            .filter(|total| *total <= MAX_SCHEDULE_ATTEMPTS)
            .ok_or_else(|| {
                DelayError::TooManyAttempts(delays.iter().map(|d| u64::from(d.attempts())).sum())
            })?;

        if intended_max_retries > MAX_SCHEDULE_ATTEMPTS {
            return Err(DelayError::TooManyAttempts(u64::from(intended_max_retries)));
        }

        let max_retries = if total > intended_max_retries {
            internal!(
                level = WARN,
                total,
                intended_max_retries,
                "Delay schedule has more attempts than max_retries, raising max_retries to match"
            );
            total
        } else {
            if let Some(last) = delays.last_mut() {
                let stretched = last.attempts() + (intended_max_retries - total);
                internal!(
                    level = DEBUG,
                    from = last.attempts(),
                    to = stretched,
                    "Extending the last delay step to cover max_retries"
                );
                last.set_attempts(stretched);
            }
            intended_max_retries
        };

        let expanded = delays.iter().flat_map(Delay::expand).collect();

        Ok(Self {
            max_retries,
            delays,
            expanded,
        })
    }

    #[must_use]
    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    #[must_use]
    pub fn delays(&self) -> &[Delay] {
        &self.delays
    }

    /// One wait per retry: entry `i` is used before retry `i + 1`.
    #[must_use]
    pub fn expanded_delays(&self) -> &[Duration] {
        &self.expanded
    }

    /// The wait before retry number `retry` (1-based), falling back to
    /// [`DEFAULT_DELAY_TIME`] outside the schedule.
    #[must_use]
    pub fn next_delay(&self, retry: u32) -> Duration {
        (retry as usize)
            .checked_sub(1)
            .and_then(|index| self.expanded.get(index))
            .copied()
            .unwrap_or(DEFAULT_DELAY_TIME)
    }
}

impl Default for DelaysAndMaxRetry {
    fn default() -> Self {
        let max_retries = crate::config::DEFAULT_MAX_RETRIES;

        Self {
            max_retries,
            delays: vec![Delay::new(max_retries, DEFAULT_DELAY_TIME)],
            expanded: vec![DEFAULT_DELAY_TIME; max_retries as usize],
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn schedule(max: u32, delays: &str) -> DelaysAndMaxRetry {
        DelaysAndMaxRetry::from(max, Some(delays)).unwrap()
    }

    fn total(schedule: &DelaysAndMaxRetry) -> u32 {
        schedule.delays().iter().map(Delay::attempts).sum()
    }

    #[test]
    fn consistent_schedule_expands_in_order() {
        let schedule = schedule(3, "2*4000, 1*300000");

        assert_eq!(schedule.max_retries(), 3);
        assert_eq!(
            schedule.expanded_delays(),
            vec![
                Duration::from_millis(4000),
                Duration::from_millis(4000),
                Duration::from_millis(300_000),
            ]
        );
    }

    #[test]
    fn shortfall_stretches_the_last_step() {
        let schedule = schedule(5, "1*1s, 1*1minute");

        assert_eq!(schedule.max_retries(), 5);
        assert_eq!(schedule.delays()[0].attempts(), 1);
        assert_eq!(schedule.delays()[1].attempts(), 4);
        assert_eq!(total(&schedule), 5);
        assert_eq!(schedule.expanded_delays().len(), 5);
    }

    #[test]
    fn excess_attempts_raise_max_retries() {
        let schedule = schedule(2, "3*1s, 2*1minute");

        assert_eq!(schedule.max_retries(), 5);
        assert_eq!(total(&schedule), 5);
        assert_eq!(schedule.expanded_delays().len(), 5);
    }

    #[test]
    fn missing_schedule_uses_the_default_step() {
        let schedule = DelaysAndMaxRetry::from(5, None).unwrap();

        assert_eq!(schedule.max_retries(), 5);
        assert_eq!(schedule.delays().len(), 1);
        assert_eq!(schedule.delays()[0].delay_time(), DEFAULT_DELAY_TIME);
        assert_eq!(schedule.expanded_delays(), vec![DEFAULT_DELAY_TIME; 5]);

        assert_eq!(DelaysAndMaxRetry::from(5, Some("  ")).unwrap(), schedule);
        assert_eq!(DelaysAndMaxRetry::default(), schedule);
    }

    #[test]
    fn malformed_entry_rejects_the_whole_schedule() {
        assert!(DelaysAndMaxRetry::from(5, Some("1*1s, nonsense")).is_err());
        assert!(DelaysAndMaxRetry::from(5, Some("1*1s,,2*1s")).is_err());
    }

    #[test]
    fn oversized_schedules_are_rejected() {
        assert_eq!(
            DelaysAndMaxRetry::from(5, Some("4294967295*1s, 1*1s")),
            Err(DelayError::TooManyAttempts(4_294_967_296))
        );
        assert_eq!(
            DelaysAndMaxRetry::from(5, Some("10001*1s")),
            Err(DelayError::TooManyAttempts(10_001))
        );
        assert_eq!(
            DelaysAndMaxRetry::from(MAX_SCHEDULE_ATTEMPTS + 1, None),
            Err(DelayError::TooManyAttempts(10_001))
        );

        let largest = schedule(MAX_SCHEDULE_ATTEMPTS, "1*1s");
        assert_eq!(largest.max_retries(), MAX_SCHEDULE_ATTEMPTS);
        assert_eq!(largest.expanded_delays().len(), MAX_SCHEDULE_ATTEMPTS as usize);
    }

    #[test]
    fn zero_max_retries_keeps_the_schedule() {
        let schedule = schedule(0, "2*1s");
        assert_eq!(schedule.max_retries(), 2);
        assert_eq!(total(&schedule), 2);
    }

    #[test]
    fn next_delay_indexes_from_one_and_falls_back() {
        let schedule = schedule(3, "2*4000, 1*300000");

        assert_eq!(schedule.next_delay(1), Duration::from_millis(4000));
        assert_eq!(schedule.next_delay(3), Duration::from_millis(300_000));
        assert_eq!(schedule.next_delay(4), DEFAULT_DELAY_TIME);
        assert_eq!(schedule.next_delay(0), DEFAULT_DELAY_TIME);
        assert_eq!(schedule.next_delay(u32::MAX), DEFAULT_DELAY_TIME);
    }

    #[test]
    fn next_delay_agrees_with_the_expansion() {
        let schedule = schedule(6, "1*1000, 2*5000, 1*1h");

        for (index, expected) in schedule.expanded_delays().iter().enumerate() {
            let retry = u32::try_from(index).unwrap() + 1;
            assert_eq!(schedule.next_delay(retry), *expected, "retry {retry}");
        }
    }

    #[test]
    fn expansion_length_matches_max_retries_for_many_shapes() {
        let shapes = ["1s", "2*1s", "1s,2s,3s", "4*1s,4*2s", "10*1ms"];

        for max in 0..8 {
            for shape in shapes {
                let schedule = schedule(max, shape);
                assert_eq!(total(&schedule), schedule.max_retries(), "{max} {shape}");
                assert_eq!(
                    schedule.expanded_delays().len(),
                    schedule.max_retries() as usize,
                    "{max} {shape}"
                );
            }
        }
    }
}
