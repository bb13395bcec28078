//! Where a consumer job starts reading, and where it stops.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConsumerError;

/// Starting point of a consumption run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum ConsumptionPolicy {
    /// Oldest retained offset of every partition
    Earliest,
    /// Current high-watermark of every partition; tails until stopped
    Latest,
    /// Timestamp range, upper bound optional
    Custom {
        start_timestamp_ms: i64,
        stop_timestamp_ms: Option<i64>,
    },
}

impl ConsumptionPolicy {
    /// Reject settings that can never produce a sensible run.
    pub fn validate(&self) -> Result<(), ConsumerError> {
        if let Self::Custom {
            start_timestamp_ms,
            stop_timestamp_ms: Some(stop),
        } = *self
        {
            if stop < start_timestamp_ms {
                return Err(ConsumerError::Validation(format!(
                    "stop timestamp {stop} is before start timestamp {start_timestamp_ms}"
                )));
            }
        }
        Ok(())
    }

    /// Whether the run can finish without a stop request on an open topic.
    #[must_use]
    pub fn is_bounded(&self) -> bool {
        matches!(
            self,
            Self::Custom {
                stop_timestamp_ms: Some(_),
                ..
            }
        )
    }
}

impl fmt::Display for ConsumptionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Earliest => f.write_str("earliest"),
            Self::Latest => f.write_str("latest"),
            Self::Custom {
                start_timestamp_ms,
                stop_timestamp_ms: None,
            } => write!(f, "custom({start_timestamp_ms}..)"),
            Self::Custom {
                start_timestamp_ms,
                stop_timestamp_ms: Some(stop),
            } => write!(f, "custom({start_timestamp_ms}..{stop})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_before_start_is_rejected() {
        let policy = ConsumptionPolicy::Custom {
            start_timestamp_ms: 2_000,
            stop_timestamp_ms: Some(1_000),
        };
        assert!(matches!(
            policy.validate(),
            Err(ConsumerError::Validation(_))
        ));
    }

    #[test]
    fn equal_bounds_are_accepted() {
        let policy = ConsumptionPolicy::Custom {
            start_timestamp_ms: 1_000,
            stop_timestamp_ms: Some(1_000),
        };
        policy.validate().unwrap();
        assert!(policy.is_bounded());
    }

    #[test]
    fn earliest_latest_and_open_custom_are_unbounded() {
        for policy in [
            ConsumptionPolicy::Earliest,
            ConsumptionPolicy::Latest,
            ConsumptionPolicy::Custom {
                start_timestamp_ms: 0,
                stop_timestamp_ms: None,
            },
        ] {
            policy.validate().unwrap();
            assert!(!policy.is_bounded());
        }
    }

    #[test]
    fn serde_uses_tagged_form() {
        let policy: ConsumptionPolicy = serde_json::from_str(
            r#"{"from":"custom","start_timestamp_ms":10,"stop_timestamp_ms":null}"#,
        )
        .unwrap();
        assert_eq!(
            policy,
            ConsumptionPolicy::Custom {
                start_timestamp_ms: 10,
                stop_timestamp_ms: None
            }
        );
        let json = serde_json::to_string(&ConsumptionPolicy::Latest).unwrap();
        assert_eq!(json, r#"{"from":"latest"}"#);
    }

    #[test]
    fn display_is_compact() {
        assert_eq!(ConsumptionPolicy::Earliest.to_string(), "earliest");
        let custom = ConsumptionPolicy::Custom {
            start_timestamp_ms: 1,
            stop_timestamp_ms: Some(2),
        };
        assert_eq!(custom.to_string(), "custom(1..2)");
    }
}
