use crate::error::RepeaterError;
use chrono::{DateTime, NaiveTime, Utc};
use std::time::Duration;

pub const MIN_INTERVAL: Duration = Duration::from_secs(10);
pub const MAX_INTERVAL: Duration = Duration::from_secs(25_000 * 60);
/// Discord's message length limit.
pub const MAX_MESSAGE_CHARS: usize = 2000;
pub const MAX_REPEATERS_PER_GUILD: usize = 5;

/// A message re-posted to a channel on a schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repeater {
    pub id: i64,
    pub guild_id: u64,
    pub channel_id: u64,
    pub message: String,
    pub interval: Duration,
    /// Wall-clock time (guild time zone) the schedule is aligned to.
    pub start_time_of_day: Option<NaiveTime>,
    /// Skip a post when nobody has written in the channel since the last one.
    pub no_redundant: bool,
    pub last_message_id: Option<u64>,
    pub date_added: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRepeater {
    pub guild_id: u64,
    pub channel_id: u64,
    pub message: String,
    pub interval: Duration,
    pub start_time_of_day: Option<NaiveTime>,
    pub no_redundant: bool,
}

impl NewRepeater {
    pub fn validate(&self) -> Result<(), RepeaterError> {
        validate_interval(self.interval)?;
        validate_message(&self.message)
    }
}

pub fn validate_interval(interval: Duration) -> Result<(), RepeaterError> {
    if interval < MIN_INTERVAL {
        return Err(RepeaterError::IntervalTooShort {
            interval,
            min: MIN_INTERVAL,
        });
    }
    if interval > MAX_INTERVAL {
        return Err(RepeaterError::IntervalTooLong {
            interval,
            max: MAX_INTERVAL,
        });
    }
    Ok(())
}

pub fn validate_message(message: &str) -> Result<(), RepeaterError> {
    if message.trim().is_empty() {
        return Err(RepeaterError::EmptyMessage);
    }
    let len = message.chars().count();
    if len > MAX_MESSAGE_CHARS {
        return Err(RepeaterError::MessageTooLong {
            len,
            max: MAX_MESSAGE_CHARS,
        });
    }
    Ok(())
}
