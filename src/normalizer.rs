// Counter normalizer
//
// RouterOS reports every queue counter as a single "upload/download" string
// (e.g. bytes="1234/5678"). This module turns a raw record into a fixed,
// typed metric. Nothing past this boundary sees the string form.
//
// Policy: a counter that is absent, empty or malformed becomes (0, 0). Only a
// record without a name is rejected.

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::device::RawCounterRecord;

/// Separator between the upload and download halves of a counter
pub const PAIR_DELIMITER: char = '/';

/// Placeholder for missing target addresses and plan profiles
pub const UNKNOWN: &str = "unknown";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecordParseError {
    #[error("Record has no name")]
    MissingIdentity,
}

/// Traffic counters for one queue/subscriber
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NormalizedMetric {
    pub name: String,
    pub target_ip: String,
    pub plan_profile: String,

    /// Instantaneous rates (bits per second)
    pub upload_bps: u64,
    pub download_bps: u64,

    /// Cumulative byte counters, written as reported
    pub upload_bytes: u64,
    pub download_bytes: u64,

    /// Cumulative packet counters
    pub upload_packets: u64,
    pub download_packets: u64,

    /// Cumulative dropped packets
    pub dropped_upload: u64,
    pub dropped_download: u64,
}

/// Splits an "A/B" counter into its two halves
///
/// Returns (0, 0) for anything that is not exactly two non-negative integers.
///
/// # Examples
/// ```
/// assert_eq!(split_pair(Some("1024/2048")), (1024, 2048));
/// assert_eq!(split_pair(Some("garbage")), (0, 0));
/// assert_eq!(split_pair(None), (0, 0));
/// ```
pub fn split_pair(value: Option<&str>) -> (u64, u64) {
    let Some((up, down)) = value.and_then(|v| v.split_once(PAIR_DELIMITER)) else {
        return (0, 0);
    };

    match (up.trim().parse::<u64>(), down.trim().parse::<u64>()) {
        (Ok(up), Ok(down)) => (up, down),
        _ => (0, 0),
    }
}

/// Drops a network-mask suffix ("10.0.0.5/32" -> "10.0.0.5")
pub fn strip_mask(target: Option<&str>) -> String {
    match target.map(str::trim).filter(|t| !t.is_empty()) {
        Some(t) => t.split(PAIR_DELIMITER).next().unwrap_or(t).to_string(),
        None => UNKNOWN.to_string(),
    }
}

/// Converts one raw queue record into a typed metric
pub fn normalize(record: &RawCounterRecord) -> Result<NormalizedMetric, RecordParseError> {
    let name = record
        .get("name")
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .ok_or(RecordParseError::MissingIdentity)?;

    let (upload_bps, download_bps) = split_pair(record.get("rate"));
    let (upload_bytes, download_bytes) = split_pair(record.get("bytes"));
    let (upload_packets, download_packets) = split_pair(record.get("packets"));
    let (dropped_upload, dropped_download) = split_pair(record.get("dropped"));

    let plan_profile = record
        .get("comment")
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .unwrap_or(UNKNOWN)
        .to_string();

    Ok(NormalizedMetric {
        name: name.to_string(),
        target_ip: strip_mask(record.get("target")),
        plan_profile,
        upload_bps,
        download_bps,
        upload_bytes,
        download_bytes,
        upload_packets,
        download_packets,
        dropped_upload,
        dropped_download,
    })
}

/// Normalizes every record of a device, dropping (and logging) the ones
/// without an identity
pub fn normalize_all(records: &[RawCounterRecord], device_alias: &str) -> Vec<NormalizedMetric> {
    records
        .iter()
        .enumerate()
        .filter_map(|(index, record)| match normalize(record) {
            Ok(metric) => Some(metric),
            Err(e) => {
                warn!("Dropping record #{} from '{}': {}", index, device_alias, e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, &str)]) -> RawCounterRecord {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_split_pair_valid() {
        assert_eq!(split_pair(Some("0/0")), (0, 0));
        assert_eq!(split_pair(Some("1234/5678")), (1234, 5678));
        assert_eq!(
            split_pair(Some("18446744073709551615/1")),
            (u64::MAX, 1)
        );
    }

    #[test]
    fn test_split_pair_malformed_is_zero() {
        for input in ["", "/", "12", "12/", "/34", "a/b", "-1/5", "1/2/3", "1.5/2"] {
            assert_eq!(split_pair(Some(input)), (0, 0), "input {:?}", input);
        }
        assert_eq!(split_pair(None), (0, 0));
    }

    #[test]
    fn test_strip_mask() {
        assert_eq!(strip_mask(Some("10.0.0.5/32")), "10.0.0.5");
        assert_eq!(strip_mask(Some("192.168.1.10")), "192.168.1.10");
        assert_eq!(strip_mask(Some("")), UNKNOWN);
        assert_eq!(strip_mask(None), UNKNOWN);
    }

    #[test]
    fn test_normalize_full_record() {
        let metric = normalize(&record(&[
            ("name", "alice"),
            ("target", "10.0.0.5/32"),
            ("rate", "1000/2000"),
            ("bytes", "300/400"),
            ("packets", "5/6"),
            ("dropped", "7/8"),
            ("comment", "plan-50M"),
        ]))
        .unwrap();

        assert_eq!(
            metric,
            NormalizedMetric {
                name: "alice".into(),
                target_ip: "10.0.0.5".into(),
                plan_profile: "plan-50M".into(),
                upload_bps: 1000,
                download_bps: 2000,
                upload_bytes: 300,
                download_bytes: 400,
                upload_packets: 5,
                download_packets: 6,
                dropped_upload: 7,
                dropped_download: 8,
            }
        );
    }

    #[test]
    fn test_one_bad_counter_keeps_the_rest() {
        let metric = normalize(&record(&[
            ("name", "bob"),
            ("rate", "oops"),
            ("bytes", "10/20"),
        ]))
        .unwrap();

        assert_eq!((metric.upload_bps, metric.download_bps), (0, 0));
        assert_eq!((metric.upload_bytes, metric.download_bytes), (10, 20));
        assert_eq!(metric.target_ip, UNKNOWN);
        assert_eq!(metric.plan_profile, UNKNOWN);
    }

    #[test]
    fn test_missing_name_is_dropped() {
        assert_eq!(
            normalize(&record(&[("target", "10.0.0.1/32")])),
            Err(RecordParseError::MissingIdentity)
        );
        assert_eq!(
            normalize(&record(&[("name", "  ")])),
            Err(RecordParseError::MissingIdentity)
        );

        let records = vec![
            record(&[("name", "a")]),
            record(&[("bytes", "1/1")]),
            record(&[("name", "c")]),
        ];
        let names: Vec<_> = normalize_all(&records, "r1")
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["a", "c"]);
    }
}
