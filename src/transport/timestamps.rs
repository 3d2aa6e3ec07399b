// src/transport/timestamps.rs

use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TimestampError {
    #[error("timestamp missing")]
    Missing,
    #[error("timestamp is not RFC 3339")]
    Malformed,
    #[error("timestamp skew {skew_ms}ms exceeds max {max_skew_ms}ms")]
    Skew { skew_ms: i64, max_skew_ms: i64 },
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, TimestampError> {
    if value.is_empty() {
        return Err(TimestampError::Missing);
    }
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| TimestampError::Malformed)
}

/// 时钟偏移闸门：|now - ts| 超过 max_skew_ms 即拒绝。
/// 这里用的是服务器挂钟；窗口截止时间另外由单调时钟负责。
pub fn assert_within_skew(
    value: &str,
    now: DateTime<Utc>,
    max_skew_ms: i64,
) -> Result<DateTime<Utc>, TimestampError> {
    let ts = parse_timestamp(value)?;
    let skew_ms = (now - ts).num_milliseconds().abs();
    if skew_ms > max_skew_ms {
        return Err(TimestampError::Skew {
            skew_ms,
            max_skew_ms,
        });
    }
    Ok(ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn accepts_within_skew() {
        let now = Utc::now();
        let ts = (now - Duration::milliseconds(300)).to_rfc3339();
        assert!(assert_within_skew(&ts, now, 500).is_ok());
    }

    #[test]
    fn rejects_drift_beyond_skew() {
        // 快 600ms、慢 600ms 都超出 500ms 的允许偏移
        let now = Utc::now();
        for drift in [-600i64, 600] {
            let ts = (now + Duration::milliseconds(drift)).to_rfc3339();
            let err = assert_within_skew(&ts, now, 500).unwrap_err();
            assert!(matches!(err, TimestampError::Skew { .. }));
        }
    }

    #[test]
    fn rejects_malformed() {
        let now = Utc::now();
        assert!(matches!(
            assert_within_skew("", now, 500),
            Err(TimestampError::Missing)
        ));
        assert!(matches!(
            assert_within_skew("2026-08-02 10:00:00", now, 500),
            Err(TimestampError::Malformed)
        ));
    }
}
