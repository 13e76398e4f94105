//! A single step of the retry schedule: `[attempts*]delay[unit]`.
//!
//! `"2*500msec"` waits 500 ms before each of two retries, `"1 hour"` waits
//! one hour before a single retry. Units are case-insensitive and default to
//! milliseconds.

use std::{
    fmt::{self, Display},
    str::FromStr,
    time::Duration,
};

use thiserror::Error;

/// Six hours, the wait used when no schedule applies.
pub const DEFAULT_DELAY_TIME: Duration = Duration::from_millis(21_600_000);

/// Upper bound on the retries a reconciled schedule may hold.
pub const MAX_SCHEDULE_ATTEMPTS: u32 = 10_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DelayError {
    #[error("Invalid delay '{0}', expected [attempts*]delay[unit]")]
    Syntax(String),

    #[error("Unknown delay unit '{unit}' in '{input}'")]
    UnknownUnit { input: String, unit: String },

    #[error("Delay '{0}' overflows")]
    Overflow(String),

    #[error("Delay '{0}' must have at least one attempt")]
    ZeroAttempts(String),

    #[error("Delay schedule needs {0} attempts, the limit is {MAX_SCHEDULE_ATTEMPTS}")]
    TooManyAttempts(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delay {
    attempts: u32,
    delay_time: Duration,
}

impl Delay {
    #[must_use]
    pub const fn new(attempts: u32, delay_time: Duration) -> Self {
        Self {
            attempts,
            delay_time,
        }
    }

    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    pub const fn set_attempts(&mut self, attempts: u32) {
        self.attempts = attempts;
    }

    #[must_use]
    pub const fn delay_time(&self) -> Duration {
        self.delay_time
    }

    /// The wait before each attempt of this step, repeated `attempts` times.
    pub fn expand(&self) -> impl Iterator<Item = Duration> + '_ {
        std::iter::repeat_n(self.delay_time, self.attempts as usize)
    }
}

impl Default for Delay {
    fn default() -> Self {
        Self::new(1, DEFAULT_DELAY_TIME)
    }
}

fn unit_multiplier(unit: &str) -> Option<u64> {
    let multiplier = match unit.to_ascii_lowercase().as_str() {
        "" | "ms" | "msec" | "msecs" => 1,
        "s" | "sec" | "secs" | "second" | "seconds" => 1_000,
        "m" | "min" | "mins" | "minute" | "minutes" => 60_000,
        "h" | "hour" | "hours" => 3_600_000,
        "d" | "day" | "days" => 86_400_000,
        _ => return None,
    };

    Some(multiplier)
}

fn parse_number<T: FromStr>(digits: &str, input: &str) -> Result<T, DelayError> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(DelayError::Syntax(input.to_string()));
    }

    // Only digits remain, so a failure here is an out of range value.
    digits
        .parse()
        .map_err(|_| DelayError::Overflow(input.to_string()))
}

impl FromStr for Delay {
    type Err = DelayError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (attempts, rest) = match input.split_once('*') {
            Some((attempts, rest)) => (parse_number::<u32>(attempts.trim(), input)?, rest),
            None => (1, input),
        };

        if attempts == 0 {
            return Err(DelayError::ZeroAttempts(input.to_string()));
        }

        let rest = rest.trim();
        let split = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        let (value, unit) = rest.split_at(split);

        let value = parse_number::<u64>(value, input)?;
        let unit = unit.trim();
        let multiplier = unit_multiplier(unit).ok_or_else(|| DelayError::UnknownUnit {
            input: input.to_string(),
            unit: unit.to_string(),
        })?;

        let millis = value
            .checked_mul(multiplier)
            .ok_or_else(|| DelayError::Overflow(input.to_string()))?;

        Ok(Self::new(attempts, Duration::from_millis(millis)))
    }
}

impl Display for Delay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}*{}msecs", self.attempts, self.delay_time.as_millis())
    }
}
