pub mod app_context;
pub mod attachments;
pub mod commit;
pub mod config;
pub mod context;
pub mod error;
pub mod memory;
pub mod metric_consts;
pub mod normalize;
pub mod payload;
pub mod pg;
pub mod plugins;
pub mod quotas;
pub mod reprocessing;
pub mod settings;
pub mod stacktraces;
pub mod stages;
pub mod storage;
pub mod tasks;
pub mod test_utils;
pub mod worker;

use chrono::{DateTime, Utc};

/// Current time as fractional seconds since the Unix epoch, the unit event
/// timestamps and pipeline start times are expressed in.
pub fn epoch_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

pub fn to_datetime(epoch_seconds: f64) -> Option<DateTime<Utc>> {
    if !epoch_seconds.is_finite() {
        return None;
    }
    let seconds = epoch_seconds.floor();
    let nanos = ((epoch_seconds - seconds) * 1_000_000_000.0) as u32;
    DateTime::from_timestamp(seconds as i64, nanos.min(999_999_999))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_epoch_seconds() {
        let datetime = to_datetime(1_700_000_000.5).unwrap();
        assert_eq!(datetime.timestamp(), 1_700_000_000);
        assert_eq!(datetime.timestamp_subsec_millis(), 500);

        assert_eq!(to_datetime(f64::NAN), None);
    }
}
