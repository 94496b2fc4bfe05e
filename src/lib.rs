//! # Travel Analyzer
//!
//! Location-history reduction and travel analytics.
//!
//! This library ingests raw location-history exports (timestamped GPS samples
//! with accuracy and confidence metadata), reduces them to a denoised
//! trajectory of stay/transit segments, resolves stays to human-readable
//! places through a cached reverse-geocoding collaborator, and aggregates the
//! result into dwell tables and place-to-place jumps with inferred travel
//! mode.
//!
//! The pipeline runs strictly left to right:
//!
//! normalize → filter → resolve → aggregate
//!
//! Only the geocode resolver performs I/O; everything else is a pure,
//! deterministic transformation.
//!
//! ## Quick Start
//!
//! ```rust
//! use chrono::{Duration, TimeZone, Utc};
//! use travel_analyzer::{detect_segments, FilterConfig, RawPoint, SegmentKind, TimeRange};
//!
//! let base = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
//! let points: Vec<RawPoint> = (0..8)
//!     .map(|i| RawPoint::new(base + Duration::minutes(i * 2), 47.6090, -122.3330))
//!     .collect();
//!
//! let range = TimeRange::new(base, base + Duration::minutes(20));
//! let outcome = detect_segments(&points, &FilterConfig::default(), range).unwrap();
//! assert!(outcome.segments.iter().any(|s| s.kind == SegmentKind::Stay));
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{AnalyzerError, OptionExt, Result};

// Geographic utilities (haversine distance, coordinate validation)
pub mod geo_utils;
pub use geo_utils::{haversine_km, haversine_m, is_valid_coord};

// Progress events and per-run statistics
pub mod progress;
pub use progress::{PipelineStats, ProgressCallback, ProgressEvent, StatsSnapshot};

// Point normalizer (raw export → canonical point sequence)
pub mod normalize;
pub use normalize::{parse_export, write_normalized, ExportHeader, NormalizeConfig, NormalizedExport};

// Noise filter / stay detector (points → segments)
pub mod filter;
pub use filter::{detect_segments, FilterConfig, FilterOutcome};

// Persistent geocode cache (per-user SQLite plus in-memory fallback)
pub mod cache;
pub use cache::{MemoryCache, PlaceCache, SqliteCache};

// Geocode resolver (cache + batched external lookups)
pub mod geocode;
pub use geocode::{
    resolve_stays, CancelFlag, GeoapifyClient, GeocodeFailure, Geocoder, ResolveConfig,
};

// Aggregator (dwell tables, jumps, mode inference)
pub mod aggregate;
pub use aggregate::{aggregate, DayDwellRow, DwellRow, ModeConfig, TravelReport};

// Pipeline coordinator (one run end to end)
pub mod pipeline;
pub use pipeline::{run_pipeline, run_pipeline_blocking, PipelineConfig, PipelineOutput};

// ============================================================================
// Core Types
// ============================================================================

/// A single canonical location sample.
///
/// Produced by the point normalizer from any supported export variant and
/// immutable afterwards. Absent accuracy/confidence fields are substituted
/// with [`RawPoint::DEFAULT_ACCURACY_M`] and [`RawPoint::DEFAULT_CONFIDENCE`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPoint {
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_meters: f64,
    /// Source confidence in 0..1.
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
}

impl RawPoint {
    /// Substituted when a source record carries no accuracy field.
    pub const DEFAULT_ACCURACY_M: f64 = 50.0;
    /// Substituted when a source record carries no confidence field.
    pub const DEFAULT_CONFIDENCE: f64 = 1.0;

    /// Create a point with default accuracy and confidence.
    pub fn new(timestamp: DateTime<Utc>, latitude: f64, longitude: f64) -> Self {
        Self {
            timestamp,
            latitude,
            longitude,
            accuracy_meters: Self::DEFAULT_ACCURACY_M,
            confidence: Self::DEFAULT_CONFIDENCE,
            altitude: None,
        }
    }

    /// Same point with a different confidence.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    /// Check that the coordinates are finite and in range.
    pub fn is_valid(&self) -> bool {
        is_valid_coord(self.latitude, self.longitude)
    }
}

/// A half-open time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }

    pub fn duration_secs(&self) -> i64 {
        (self.end - self.start).num_seconds()
    }
}

/// Whether a segment represents dwelling at one place or travel between two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentKind {
    Stay,
    Transit,
}

/// One contiguous span of the input time range.
///
/// Segments are emitted in strict chronological order; consecutive segments
/// share a boundary instant so their union covers the full requested range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub kind: SegmentKind,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Cluster centroid for stays; a nearby sample for transits.
    pub representative_point: RawPoint,
    /// Raw points that contributed to this segment.
    pub point_count: usize,
}

impl Segment {
    pub fn is_stay(&self) -> bool {
        self.kind == SegmentKind::Stay
    }

    pub fn duration(&self) -> chrono::Duration {
        self.end_time - self.start_time
    }
}

/// The resolved identity of a stay's representative coordinate.
///
/// Immutable once cached; stays whose coordinates collide into the same
/// cache key share one place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Place {
    pub city: String,
    pub region_or_state: String,
    pub country: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl Place {
    /// Label used for stays that could not be resolved.
    pub const UNKNOWN: &'static str = "Unknown";

    /// Sentinel place for a stay whose coordinate could not be resolved.
    /// Keeps the original coordinates so jump distances stay meaningful.
    pub fn unresolved(latitude: f64, longitude: f64) -> Self {
        Self {
            city: Self::UNKNOWN.to_string(),
            region_or_state: String::new(),
            country: String::new(),
            latitude,
            longitude,
        }
    }

    pub fn is_unresolved(&self) -> bool {
        self.city == Self::UNKNOWN && self.country.is_empty()
    }

    /// Dwell-table label for the region dimension: state for US places,
    /// country otherwise, "Unknown" when unresolved.
    pub fn region_label(&self) -> String {
        if self.is_unresolved() {
            return Self::UNKNOWN.to_string();
        }
        let is_us = matches!(
            self.country.as_str(),
            "United States" | "United States of America" | "USA"
        );
        if is_us && !self.region_or_state.is_empty() {
            self.region_or_state.clone()
        } else if !self.country.is_empty() {
            self.country.clone()
        } else {
            Self::UNKNOWN.to_string()
        }
    }

    /// Whether two places name the same location. Unresolved places compare
    /// by coordinate key since they have no name to compare.
    pub fn same_place(&self, other: &Place) -> bool {
        if self.is_unresolved() || other.is_unresolved() {
            return self.is_unresolved()
                && other.is_unresolved()
                && CoordKey::from_coords(self.latitude, self.longitude)
                    == CoordKey::from_coords(other.latitude, other.longitude);
        }
        self.city == other.city
            && self.region_or_state == other.region_or_state
            && self.country == other.country
    }
}

/// A stay segment joined to its resolved place.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedStay {
    pub segment: Segment,
    pub place: Place,
    pub dwell: chrono::Duration,
}

impl ResolvedStay {
    pub fn new(segment: Segment, place: Place) -> Self {
        let dwell = segment.duration();
        Self {
            segment,
            place,
            dwell,
        }
    }
}

/// Inferred travel mode for a jump, bucketed by average speed and distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TravelMode {
    Walking,
    Biking,
    Driving,
    Flight,
    Unknown,
}

impl std::fmt::Display for TravelMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TravelMode::Walking => "walking",
            TravelMode::Biking => "biking",
            TravelMode::Driving => "driving",
            TravelMode::Flight => "flight",
            TravelMode::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// One place-to-place movement between consecutive distinct stays.
///
/// Derived per run from the resolved stay sequence; never persisted on its
/// own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Jump {
    pub from_place: Place,
    pub to_place: Place,
    pub depart_time: DateTime<Utc>,
    pub arrive_time: DateTime<Utc>,
    pub distance_km: f64,
    pub inferred_mode: TravelMode,
    /// Running total over the chronological jump list, this jump included.
    pub cumulative_km: f64,
}

/// Cache key: a coordinate rounded to 4 decimal places (~11 m), well inside
/// the default 200 m cluster threshold so repeated runs over overlapping
/// ranges collide into the same entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CoordKey(String);

impl CoordKey {
    pub fn from_coords(latitude: f64, longitude: f64) -> Self {
        Self(format!("{:.4},{:.4}", latitude, longitude))
    }

    pub fn from_point(point: &RawPoint) -> Self {
        Self::from_coords(point.latitude, point.longitude)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CoordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_raw_point_defaults() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let p = RawPoint::new(ts, 47.609, -122.333);
        assert_eq!(p.accuracy_meters, RawPoint::DEFAULT_ACCURACY_M);
        assert_eq!(p.confidence, RawPoint::DEFAULT_CONFIDENCE);
        assert!(p.altitude.is_none());
        assert!(p.is_valid());
    }

    #[test]
    fn test_raw_point_validation() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert!(!RawPoint::new(ts, 91.0, 0.0).is_valid());
        assert!(!RawPoint::new(ts, 0.0, -200.0).is_valid());
    }

    #[test]
    fn test_coord_key_rounding() {
        // Points within ~11m collide into the same key
        let a = CoordKey::from_coords(47.60901, -122.33302);
        let b = CoordKey::from_coords(47.60899, -122.33298);
        assert_eq!(a, b);

        let c = CoordKey::from_coords(47.6190, -122.3330);
        assert_ne!(a, c);
    }

    #[test]
    fn test_coord_key_stability() {
        let a = CoordKey::from_coords(47.609, -122.333);
        assert_eq!(a.as_str(), "47.6090,-122.3330");
    }

    #[test]
    fn test_region_label() {
        let seattle = Place {
            city: "Seattle".to_string(),
            region_or_state: "Washington".to_string(),
            country: "United States".to_string(),
            latitude: 47.609,
            longitude: -122.333,
        };
        assert_eq!(seattle.region_label(), "Washington");

        let paris = Place {
            city: "Paris".to_string(),
            region_or_state: "Île-de-France".to_string(),
            country: "France".to_string(),
            latitude: 48.8566,
            longitude: 2.3522,
        };
        assert_eq!(paris.region_label(), "France");

        let nowhere = Place::unresolved(0.0, 0.0);
        assert_eq!(nowhere.region_label(), "Unknown");
    }

    #[test]
    fn test_same_place() {
        let a = Place {
            city: "Seattle".to_string(),
            region_or_state: "Washington".to_string(),
            country: "United States".to_string(),
            latitude: 47.609,
            longitude: -122.333,
        };
        let mut b = a.clone();
        b.latitude += 0.5; // same name, different coordinate
        assert!(a.same_place(&b));

        let u1 = Place::unresolved(47.609, -122.333);
        let u2 = Place::unresolved(47.609, -122.333);
        let u3 = Place::unresolved(43.497, -114.296);
        assert!(u1.same_place(&u2));
        assert!(!u1.same_place(&u3));
        assert!(!a.same_place(&u1));
    }

    #[test]
    fn test_time_range() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap();
        let range = TimeRange::new(start, end);
        assert!(range.contains(start));
        assert!(!range.contains(end));
        assert_eq!(range.duration_secs(), 86_400);
    }
}
