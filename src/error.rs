use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings file `{}` is corrupt: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("settings file `{}`: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("unknown setting `{0}`")]
    UnknownKey(String),

    #[error("`{value}` is not a valid value for `{key}`")]
    Parse { key: String, value: String },

    #[error("`{value}` is not allowed for `{key}`")]
    Rejected { key: String, value: String },
}

#[derive(Debug, Error)]
pub enum RepeaterError {
    #[error("interval {} is shorter than the minimum of {}", fmt_duration(.interval), fmt_duration(.min))]
    IntervalTooShort { interval: Duration, min: Duration },

    #[error("interval {} is longer than the maximum of {}", fmt_duration(.interval), fmt_duration(.max))]
    IntervalTooLong { interval: Duration, max: Duration },

    #[error("repeater message cannot be empty")]
    EmptyMessage,

    #[error("repeater message is {len} characters long (max {max})")]
    MessageTooLong { len: usize, max: usize },

    #[error("this server already has the maximum of {max} repeaters")]
    TooMany { max: usize },

    #[error("repeaters are still loading")]
    NotReady,

    #[error("repeater {0} not found")]
    NotFound(i64),

    #[error("no repeaters are configured on this server")]
    NoRepeaters,

    #[error("index {index} is out of range (this server has {count} repeaters)")]
    IndexOutOfRange { index: usize, count: usize },

    #[error("unknown time zone `{0}`")]
    InvalidTimezone(String),

    #[error("repeater storage failed: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Failure of an outbound Discord call, split by whether retrying can help.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("channel {channel_id} is unreachable: {reason}")]
    DestinationUnreachable { channel_id: u64, reason: String },

    #[error("transient send failure: {0}")]
    Transient(String),
}

impl SendError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, SendError::DestinationUnreachable { .. })
    }
}

fn fmt_duration(d: &Duration) -> humantime::FormattedDuration {
    humantime::format_duration(*d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_messages_are_human_readable() {
        let err = RepeaterError::IntervalTooShort {
            interval: Duration::from_secs(5),
            min: Duration::from_secs(10),
        };
        assert_eq!(
            err.to_string(),
            "interval 5s is shorter than the minimum of 10s"
        );

        let err = RepeaterError::IndexOutOfRange { index: 4, count: 2 };
        assert!(err.to_string().contains("has 2 repeaters"));
    }
}
