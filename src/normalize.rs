//! Point normalizer: heterogeneous location-history exports → canonical
//! [`RawPoint`] sequence.
//!
//! Three schema variants are recognized, classified once per record and never
//! branched on downstream:
//!
//! - **Semantic timeline** (newer mobile exports): entries carrying an
//!   `activity` (start/end `geo:` strings), a `visit`
//!   (`topCandidate.placeLocation`), or a `timelinePath` (points with a
//!   minutes offset from the entry start).
//! - **Legacy records** (older full-history exports): `timestampMs` plus
//!   `latitudeE7`/`longitudeE7` integers.
//! - **Canonical re-import**: this crate's own normalized output, an optional
//!   `_metadata` header plus a `points` array.
//!
//! Records missing a timestamp or coordinates are fatal
//! ([`AnalyzerError::MalformedInput`] with the record index). Records missing
//! only confidence/accuracy get documented defaults substituted and are
//! counted, not failed. A visit normalizes to two points (entry start and
//! end, same coordinates) so the stay detector can reconstruct the dwell
//! span from the flat point sequence.

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AnalyzerError, OptionExt, Result};
use crate::filter::FilterConfig;
use crate::{is_valid_coord, RawPoint, TimeRange};

/// Configuration for the point normalizer.
#[derive(Debug, Clone)]
pub struct NormalizeConfig {
    /// Substituted when a record has no accuracy field.
    pub default_accuracy_m: f64,
    /// Substituted when a record has no confidence field.
    pub default_confidence: f64,
    /// Caller-supplied date range. Overrides any range embedded in the
    /// export's `_metadata` header.
    pub date_range: Option<TimeRange>,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            default_accuracy_m: RawPoint::DEFAULT_ACCURACY_M,
            default_confidence: RawPoint::DEFAULT_CONFIDENCE,
            date_range: None,
        }
    }
}

/// Embedded `_metadata` header describing a previously normalized export.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportHeader {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parsed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_range: Option<HeaderDateRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_settings: Option<HeaderFilterSettings>,
}

/// Inclusive date range in the header, `YYYY-MM-DD` on both ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderDateRange {
    pub from: String,
    pub to: String,
}

/// Thresholds that were applied when the export was produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderFilterSettings {
    pub distance_threshold: f64,
    pub probability_threshold: f64,
    pub duration_threshold: f64,
}

impl ExportHeader {
    /// The header's date range as a half-open UTC interval; the `to` date is
    /// inclusive, so the interval ends at the following midnight.
    pub fn time_range(&self) -> Option<TimeRange> {
        let range = self.date_range.as_ref()?;
        let from = NaiveDate::parse_from_str(&range.from, "%Y-%m-%d").ok()?;
        let to = NaiveDate::parse_from_str(&range.to, "%Y-%m-%d").ok()?;
        let start = Utc.from_utc_datetime(&from.and_hms_opt(0, 0, 0)?);
        let end = Utc.from_utc_datetime(&(to + Duration::days(1)).and_hms_opt(0, 0, 0)?);
        Some(TimeRange::new(start, end))
    }
}

/// Output of the point normalizer.
#[derive(Debug, Clone)]
pub struct NormalizedExport {
    /// Header preserved from the input, if one was embedded.
    pub header: Option<ExportHeader>,
    /// Canonical points, non-decreasing in timestamp (ties keep input order).
    pub points: Vec<RawPoint>,
    /// Source records examined.
    pub records_seen: usize,
    /// Records that needed a default substituted for an absent
    /// confidence/accuracy field.
    pub dropped_missing_fields: usize,
    /// Range the points were filtered to: caller override, else header range.
    pub effective_range: Option<TimeRange>,
}

// ============================================================================
// Parsing
// ============================================================================

/// Parse a location-history export into a canonical point sequence.
pub fn parse_export(json: &str, config: &NormalizeConfig) -> Result<NormalizedExport> {
    let value: Value = serde_json::from_str(json).map_err(|e| AnalyzerError::MalformedInput {
        record_index: 0,
        message: format!("not valid JSON: {}", e),
    })?;

    let header = match value.get("_metadata") {
        Some(meta) => Some(serde_json::from_value::<ExportHeader>(meta.clone()).map_err(
            |e| AnalyzerError::MalformedInput {
                record_index: 0,
                message: format!("invalid _metadata header: {}", e),
            },
        )?),
        None => None,
    };

    let records = locate_records(&value)?;
    let effective_range = config
        .date_range
        .or_else(|| header.as_ref().and_then(|h| h.time_range()));

    let mut points = Vec::new();
    let mut dropped = 0usize;

    for (idx, record) in records.iter().enumerate() {
        let obj = record
            .as_object()
            .ok_or_malformed(idx, "record is not an object")?;

        let before = points.len();
        let substituted = if obj.contains_key("activity") {
            normalize_activity(idx, record, config, &mut points)?
        } else if obj.contains_key("visit") {
            normalize_visit(idx, record, config, &mut points)?
        } else if obj.contains_key("timelinePath") {
            normalize_timeline_path(idx, record, config, &mut points)?
        } else if obj.contains_key("timestampMs") {
            normalize_legacy(idx, record, config, &mut points)?
        } else if obj.contains_key("timestamp") {
            normalize_canonical(idx, record, config, &mut points)?
        } else {
            return Err(AnalyzerError::MalformedInput {
                record_index: idx,
                message: "unrecognized record shape".to_string(),
            });
        };
        if substituted {
            dropped += 1;
        }
        debug_assert!(points.len() >= before);
    }

    if let Some(range) = effective_range {
        points.retain(|p| range.contains(p.timestamp));
    }

    // Stable: equal timestamps keep input order
    points.sort_by_key(|p| p.timestamp);

    debug!(
        "normalized {} records into {} points ({} with substituted defaults)",
        records.len(),
        points.len(),
        dropped
    );

    Ok(NormalizedExport {
        header,
        points,
        records_seen: records.len(),
        dropped_missing_fields: dropped,
        effective_range,
    })
}

/// Find the record array in any of the accepted top-level shapes.
fn locate_records(value: &Value) -> Result<&Vec<Value>> {
    if let Some(arr) = value.as_array() {
        return Ok(arr);
    }
    for key in ["timelineObjects", "locations", "points"] {
        if let Some(arr) = value.get(key).and_then(Value::as_array) {
            return Ok(arr);
        }
    }
    Err(AnalyzerError::MalformedInput {
        record_index: 0,
        message: "no recognizable record array (expected a top-level array, \
                  timelineObjects, locations, or points)"
            .to_string(),
    })
}

// ============================================================================
// Per-variant normalization
// ============================================================================
//
// Each function returns whether a default was substituted for an absent
// confidence/accuracy field in this record.

fn normalize_activity(
    idx: usize,
    record: &Value,
    config: &NormalizeConfig,
    out: &mut Vec<RawPoint>,
) -> Result<bool> {
    let start_ts = parse_timestamp_value(record.get("startTime"))
        .ok_or_malformed(idx, "activity record missing startTime")?;
    let end_ts = parse_timestamp_value(record.get("endTime"))
        .ok_or_malformed(idx, "activity record missing endTime")?;
    let activity = &record["activity"];

    let (start_lat, start_lon) = parse_coord_value(activity.get("start"))
        .ok_or_malformed(idx, "activity record missing start coordinates")?;
    let (end_lat, end_lon) = parse_coord_value(activity.get("end"))
        .ok_or_malformed(idx, "activity record missing end coordinates")?;

    let confidence = parse_f64_value(activity.get("probability"));
    let substituted = confidence.is_none();
    let confidence = confidence.unwrap_or(config.default_confidence);

    out.push(RawPoint {
        timestamp: start_ts,
        latitude: start_lat,
        longitude: start_lon,
        accuracy_meters: config.default_accuracy_m,
        confidence,
        altitude: None,
    });
    out.push(RawPoint {
        timestamp: end_ts,
        latitude: end_lat,
        longitude: end_lon,
        accuracy_meters: config.default_accuracy_m,
        confidence,
        altitude: None,
    });
    Ok(substituted)
}

fn normalize_visit(
    idx: usize,
    record: &Value,
    config: &NormalizeConfig,
    out: &mut Vec<RawPoint>,
) -> Result<bool> {
    let start_ts = parse_timestamp_value(record.get("startTime"))
        .ok_or_malformed(idx, "visit record missing startTime")?;
    let end_ts = parse_timestamp_value(record.get("endTime"))
        .ok_or_malformed(idx, "visit record missing endTime")?;
    let visit = &record["visit"];

    let location = visit
        .get("topCandidate")
        .and_then(|tc| tc.get("placeLocation"));
    let (lat, lon) =
        parse_coord_value(location).ok_or_malformed(idx, "visit record missing placeLocation")?;

    let confidence = parse_f64_value(visit.get("probability")).or_else(|| {
        parse_f64_value(visit.get("topCandidate").and_then(|tc| tc.get("probability")))
    });
    let substituted = confidence.is_none();
    let confidence = confidence.unwrap_or(config.default_confidence);

    // Two points bracket the dwell so the stay detector recovers its span.
    for ts in [start_ts, end_ts] {
        out.push(RawPoint {
            timestamp: ts,
            latitude: lat,
            longitude: lon,
            accuracy_meters: config.default_accuracy_m,
            confidence,
            altitude: None,
        });
    }
    Ok(substituted)
}

fn normalize_timeline_path(
    idx: usize,
    record: &Value,
    config: &NormalizeConfig,
    out: &mut Vec<RawPoint>,
) -> Result<bool> {
    let start_ts = parse_timestamp_value(record.get("startTime"))
        .ok_or_malformed(idx, "timelinePath record missing startTime")?;
    let path = record["timelinePath"]
        .as_array()
        .ok_or_malformed(idx, "timelinePath is not an array")?;

    for point in path {
        let (lat, lon) = parse_coord_value(point.get("point"))
            .ok_or_malformed(idx, "timelinePath point missing coordinates")?;
        let offset_minutes = parse_f64_value(point.get("durationMinutesOffsetFromStartTime"))
            .unwrap_or(0.0);
        let ts = start_ts + Duration::minutes(offset_minutes as i64);

        out.push(RawPoint {
            timestamp: ts,
            latitude: lat,
            longitude: lon,
            accuracy_meters: config.default_accuracy_m,
            confidence: config.default_confidence,
            altitude: None,
        });
    }
    // Path points carry no confidence field at all
    Ok(!path.is_empty())
}

fn normalize_legacy(
    idx: usize,
    record: &Value,
    config: &NormalizeConfig,
    out: &mut Vec<RawPoint>,
) -> Result<bool> {
    let ts = parse_timestamp_value(record.get("timestampMs"))
        .ok_or_malformed(idx, "legacy record missing timestampMs")?;
    let (lat, lon) = parse_coord_value(Some(record))
        .ok_or_malformed(idx, "legacy record missing latitudeE7/longitudeE7")?;

    let accuracy = parse_f64_value(record.get("accuracy"));
    let substituted = accuracy.is_none();
    let accuracy = accuracy.unwrap_or(config.default_accuracy_m);

    out.push(RawPoint {
        timestamp: ts,
        latitude: lat,
        longitude: lon,
        accuracy_meters: accuracy,
        // Legacy records carry no confidence
        confidence: config.default_confidence,
        altitude: parse_f64_value(record.get("altitude")),
    });
    Ok(substituted)
}

fn normalize_canonical(
    idx: usize,
    record: &Value,
    config: &NormalizeConfig,
    out: &mut Vec<RawPoint>,
) -> Result<bool> {
    let ts = parse_timestamp_value(record.get("timestamp"))
        .ok_or_malformed(idx, "point record missing timestamp")?;
    let (lat, lon) = parse_coord_value(Some(record))
        .ok_or_malformed(idx, "point record missing latitude/longitude")?;

    let accuracy = parse_f64_value(record.get("accuracyMeters"));
    let confidence = parse_f64_value(record.get("confidence"));
    let substituted = accuracy.is_none() || confidence.is_none();

    out.push(RawPoint {
        timestamp: ts,
        latitude: lat,
        longitude: lon,
        accuracy_meters: accuracy.unwrap_or(config.default_accuracy_m),
        confidence: confidence.unwrap_or(config.default_confidence),
        altitude: parse_f64_value(record.get("altitude")),
    });
    Ok(substituted)
}

// ============================================================================
// Field parsing helpers
// ============================================================================

/// Parse a timestamp from any accepted representation: RFC 3339 strings,
/// epoch seconds/milliseconds as numbers or digit strings (13 digits = ms,
/// 10 digits = seconds).
fn parse_timestamp_value(value: Option<&Value>) -> Option<DateTime<Utc>> {
    match value? {
        Value::String(s) => {
            if let Ok(ts) = s.parse::<DateTime<Utc>>() {
                return Some(ts);
            }
            if s.chars().all(|c| c.is_ascii_digit()) {
                return epoch_to_datetime(s.parse::<i64>().ok()?);
            }
            None
        }
        Value::Number(n) => epoch_to_datetime(n.as_i64()?),
        _ => None,
    }
}

fn epoch_to_datetime(epoch: i64) -> Option<DateTime<Utc>> {
    let digits = epoch.abs().to_string().len();
    if digits >= 12 {
        Utc.timestamp_millis_opt(epoch).single()
    } else {
        Utc.timestamp_opt(epoch, 0).single()
    }
}

/// Parse coordinates from a `geo:lat,lon` string, an E7 object, or a
/// decimal-degrees object. Out-of-range coordinates are rejected.
fn parse_coord_value(value: Option<&Value>) -> Option<(f64, f64)> {
    let value = value?;
    let (lat, lon) = match value {
        Value::String(s) => {
            let rest = s.strip_prefix("geo:")?;
            let mut parts = rest.splitn(2, ',');
            let lat = parts.next()?.trim().parse::<f64>().ok()?;
            let lon = parts.next()?.trim().parse::<f64>().ok()?;
            (lat, lon)
        }
        Value::Object(obj) => {
            if obj.contains_key("latitudeE7") && obj.contains_key("longitudeE7") {
                let lat = parse_f64_value(obj.get("latitudeE7"))? / 1e7;
                let lon = parse_f64_value(obj.get("longitudeE7"))? / 1e7;
                (lat, lon)
            } else {
                let lat = parse_f64_value(obj.get("latitude"))?;
                let lon = parse_f64_value(obj.get("longitude"))?;
                (lat, lon)
            }
        }
        _ => return None,
    };
    if is_valid_coord(lat, lon) {
        Some((lat, lon))
    } else {
        None
    }
}

/// Parse a float that exports encode either as a number or a string.
fn parse_f64_value(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

// ============================================================================
// Canonical output
// ============================================================================

#[derive(Serialize)]
struct NormalizedFile<'a> {
    #[serde(rename = "_metadata")]
    metadata: ExportHeader,
    points: &'a [RawPoint],
}

/// Serialize a normalized point sequence with a `_metadata` header so a
/// later run can re-ingest it (canonical variant) without redoing this work.
pub fn write_normalized(
    export: &NormalizedExport,
    filter: Option<&FilterConfig>,
) -> Result<String> {
    let date_range = export.effective_range.map(|range| HeaderDateRange {
        from: range.start.format("%Y-%m-%d").to_string(),
        // Half-open end instant back to an inclusive date
        to: (range.end - Duration::days(1)).format("%Y-%m-%d").to_string(),
    });

    let metadata = ExportHeader {
        version: "1.0".to_string(),
        parsed_at: Some(Utc::now()),
        date_range,
        filter_settings: filter.map(|f| HeaderFilterSettings {
            distance_threshold: f.distance_threshold_m,
            probability_threshold: f.probability_threshold,
            duration_threshold: f.duration_threshold_s as f64,
        }),
    };

    let file = NormalizedFile {
        metadata,
        points: &export.points,
    };
    serde_json::to_string_pretty(&file).map_err(|e| AnalyzerError::Internal {
        message: format!("failed to serialize normalized output: {}", e),
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> NormalizedExport {
        parse_export(json, &NormalizeConfig::default()).unwrap()
    }

    #[test]
    fn test_visit_emits_dwell_bracket() {
        let json = r#"[{
            "startTime": "2024-05-01T08:00:00Z",
            "endTime": "2024-05-01T09:00:00Z",
            "visit": {
                "probability": "0.92",
                "topCandidate": {"placeLocation": "geo:47.609000,-122.333000"}
            }
        }]"#;
        let export = parse(json);
        assert_eq!(export.points.len(), 2);
        assert_eq!(export.points[0].latitude, 47.609);
        assert_eq!(export.points[0].confidence, 0.92);
        assert_eq!(export.points[1].timestamp - export.points[0].timestamp,
                   Duration::hours(1));
        assert_eq!(export.dropped_missing_fields, 0);
    }

    #[test]
    fn test_activity_emits_endpoints() {
        let json = r#"[{
            "startTime": "2024-05-01T08:00:00Z",
            "endTime": "2024-05-01T08:30:00Z",
            "activity": {
                "start": "geo:47.609,-122.333",
                "end": "geo:47.620,-122.349",
                "distanceMeters": "1800",
                "probability": 0.8
            }
        }]"#;
        let export = parse(json);
        assert_eq!(export.points.len(), 2);
        assert_eq!(export.points[1].latitude, 47.620);
        assert_eq!(export.points[1].confidence, 0.8);
    }

    #[test]
    fn test_timeline_path_offsets() {
        let json = r#"{"timelineObjects": [{
            "startTime": "2024-05-01T08:00:00Z",
            "endTime": "2024-05-01T09:00:00Z",
            "timelinePath": [
                {"point": "geo:47.609,-122.333", "durationMinutesOffsetFromStartTime": "0"},
                {"point": "geo:47.615,-122.340", "durationMinutesOffsetFromStartTime": "15"},
                {"point": "geo:47.620,-122.349", "durationMinutesOffsetFromStartTime": "45"}
            ]
        }]}"#;
        let export = parse(json);
        assert_eq!(export.points.len(), 3);
        assert_eq!(
            export.points[2].timestamp - export.points[0].timestamp,
            Duration::minutes(45)
        );
        // Path points never carry confidence, so defaults are counted
        assert_eq!(export.dropped_missing_fields, 1);
    }

    #[test]
    fn test_legacy_e7_records() {
        let json = r#"{"locations": [
            {"timestampMs": "1714550400000", "latitudeE7": 476090000, "longitudeE7": -1223330000, "accuracy": 12},
            {"timestampMs": "1714554000000", "latitudeE7": 476200000, "longitudeE7": -1223490000}
        ]}"#;
        let export = parse(json);
        assert_eq!(export.points.len(), 2);
        assert!((export.points[0].latitude - 47.609).abs() < 1e-9);
        assert_eq!(export.points[0].accuracy_meters, 12.0);
        // Second record had no accuracy field
        assert_eq!(export.dropped_missing_fields, 1);
        assert_eq!(
            export.points[0].timestamp,
            Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_missing_timestamp_is_fatal() {
        let json = r#"[
            {"startTime": "2024-05-01T08:00:00Z", "endTime": "2024-05-01T09:00:00Z",
             "visit": {"topCandidate": {"placeLocation": "geo:47.609,-122.333"}}},
            {"visit": {"topCandidate": {"placeLocation": "geo:47.609,-122.333"}}}
        ]"#;
        let err = parse_export(json, &NormalizeConfig::default()).unwrap_err();
        match err {
            AnalyzerError::MalformedInput { record_index, .. } => assert_eq!(record_index, 1),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_missing_coordinates_is_fatal() {
        let json = r#"[{"timestampMs": "1714550400000"}]"#;
        assert!(matches!(
            parse_export(json, &NormalizeConfig::default()),
            Err(AnalyzerError::MalformedInput { record_index: 0, .. })
        ));
    }

    #[test]
    fn test_out_of_range_coordinates_rejected() {
        let json = r#"[{"timestampMs": 1714550400000, "latitudeE7": 950000000, "longitudeE7": 0}]"#;
        assert!(parse_export(json, &NormalizeConfig::default()).is_err());
    }

    #[test]
    fn test_output_sorted_and_stable() {
        let json = r#"{"locations": [
            {"timestampMs": 1714554000000, "latitudeE7": 476200000, "longitudeE7": -1223490000, "accuracy": 1},
            {"timestampMs": 1714550400000, "latitudeE7": 476090000, "longitudeE7": -1223330000, "accuracy": 2},
            {"timestampMs": 1714550400000, "latitudeE7": 476100000, "longitudeE7": -1223340000, "accuracy": 3}
        ]}"#;
        let export = parse(json);
        assert_eq!(export.points[0].accuracy_meters, 2.0);
        // Tie keeps input order
        assert_eq!(export.points[1].accuracy_meters, 3.0);
        assert_eq!(export.points[2].accuracy_meters, 1.0);
    }

    #[test]
    fn test_header_range_is_default_filter() {
        let json = r#"{
            "_metadata": {
                "version": "1.0",
                "dateRange": {"from": "2024-05-01", "to": "2024-05-01"}
            },
            "timelineObjects": [
                {"startTime": "2024-05-01T08:00:00Z", "endTime": "2024-05-01T09:00:00Z",
                 "visit": {"probability": 0.9,
                           "topCandidate": {"placeLocation": "geo:47.609,-122.333"}}},
                {"startTime": "2024-06-10T08:00:00Z", "endTime": "2024-06-10T09:00:00Z",
                 "visit": {"probability": 0.9,
                           "topCandidate": {"placeLocation": "geo:43.497,-114.296"}}}
            ]
        }"#;
        let export = parse(json);
        // Second visit falls outside the header range
        assert_eq!(export.points.len(), 2);
        assert!(export.points.iter().all(|p| p.latitude > 47.0));
        assert!(export.header.is_some());

        // Caller override beats the header
        let june = TimeRange::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap(),
        );
        let config = NormalizeConfig {
            date_range: Some(june),
            ..NormalizeConfig::default()
        };
        let export = parse_export(json, &config).unwrap();
        assert_eq!(export.points.len(), 2);
        assert!(export.points.iter().all(|p| p.latitude < 44.0));
    }

    #[test]
    fn test_canonical_roundtrip() {
        let json = r#"[{
            "startTime": "2024-05-01T08:00:00Z",
            "endTime": "2024-05-01T09:00:00Z",
            "visit": {"probability": 0.9,
                      "topCandidate": {"placeLocation": "geo:47.609,-122.333"}}
        }]"#;
        let mut export = parse(json);
        export.effective_range = Some(TimeRange::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap(),
        ));

        let written = write_normalized(&export, Some(&FilterConfig::default())).unwrap();
        let reparsed = parse(&written);
        assert_eq!(reparsed.points, export.points);
        let header = reparsed.header.unwrap();
        assert_eq!(header.time_range(), export.effective_range);
        assert_eq!(
            header.filter_settings.unwrap().distance_threshold,
            FilterConfig::default().distance_threshold_m
        );
    }

    #[test]
    fn test_unrecognized_record_shape() {
        let json = r#"[{"foo": 1}]"#;
        assert!(matches!(
            parse_export(json, &NormalizeConfig::default()),
            Err(AnalyzerError::MalformedInput { record_index: 0, .. })
        ));
    }
}
