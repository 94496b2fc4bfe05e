//! Noise filter / stay detector: canonical points → alternating stay and
//! transit segments.
//!
//! A candidate cluster grows forward from the current point. Three
//! independent rules are AND-combined:
//!
//! - a point farther than `distance_threshold_m` from the running centroid
//!   closes the cluster and starts a new one; a point at or inside the
//!   threshold merges into the temporally preceding (current) cluster,
//!   which also settles the equidistant tie-break;
//! - a closed cluster becomes a Stay only when its time span reaches
//!   `duration_threshold_s`, otherwise its points only shape transit timing;
//! - a point below `probability_threshold` is discarded outright, unless
//!   discarding would leave the whole range without points.
//!
//! This stage is pure and deterministic: no I/O, identical input and
//! thresholds always yield identical segment boundaries.

use chrono::{DateTime, Utc};
use log::debug;

use crate::error::Result;
use crate::geo_utils::haversine_m;
use crate::{RawPoint, Segment, SegmentKind, TimeRange};

/// Thresholds for stay detection.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterConfig {
    /// A new cluster starts only when a point is farther than this from the
    /// running centroid. Default: 200 m.
    pub distance_threshold_m: f64,
    /// Minimum cluster time span to qualify as a Stay. Default: 600 s.
    pub duration_threshold_s: i64,
    /// Points below this confidence are discarded. Default: 0.1.
    pub probability_threshold: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            distance_threshold_m: 200.0,
            duration_threshold_s: 600,
            probability_threshold: 0.1,
        }
    }
}

/// Output of the stay detector.
#[derive(Debug, Clone)]
pub struct FilterOutcome {
    /// Chronological, gap-free, non-overlapping segments covering the range.
    pub segments: Vec<Segment>,
    /// Points dropped by the probability threshold.
    pub discarded_low_confidence: usize,
}

/// A candidate cluster being grown forward.
#[derive(Debug)]
struct Cluster {
    points: Vec<RawPoint>,
    lat_sum: f64,
    lon_sum: f64,
}

impl Cluster {
    fn start(point: RawPoint) -> Self {
        Self {
            points: vec![point],
            lat_sum: point.latitude,
            lon_sum: point.longitude,
        }
    }

    fn merge(&mut self, point: RawPoint) {
        self.lat_sum += point.latitude;
        self.lon_sum += point.longitude;
        self.points.push(point);
    }

    fn centroid(&self) -> (f64, f64) {
        let n = self.points.len() as f64;
        (self.lat_sum / n, self.lon_sum / n)
    }

    fn first_ts(&self) -> DateTime<Utc> {
        self.points[0].timestamp
    }

    fn last_ts(&self) -> DateTime<Utc> {
        self.points[self.points.len() - 1].timestamp
    }

    fn span_secs(&self) -> i64 {
        (self.last_ts() - self.first_ts()).num_seconds()
    }

    /// Representative point: centroid coordinates, first timestamp, mean
    /// accuracy, best confidence seen.
    fn representative(&self) -> RawPoint {
        let (lat, lon) = self.centroid();
        let n = self.points.len() as f64;
        RawPoint {
            timestamp: self.first_ts(),
            latitude: lat,
            longitude: lon,
            accuracy_meters: self.points.iter().map(|p| p.accuracy_meters).sum::<f64>() / n,
            confidence: self
                .points
                .iter()
                .map(|p| p.confidence)
                .fold(0.0, f64::max),
            altitude: None,
        }
    }
}

/// Collapse a time-ordered point sequence into stay/transit segments
/// covering `range` exactly, with no gaps or overlaps.
pub fn detect_segments(
    points: &[RawPoint],
    config: &FilterConfig,
    range: TimeRange,
) -> Result<FilterOutcome> {
    let mut admitted: Vec<RawPoint> = points
        .iter()
        .filter(|p| p.confidence >= config.probability_threshold)
        .copied()
        .collect();
    let mut discarded = points.len() - admitted.len();

    // Never leave the range without points when the input had some
    if admitted.is_empty() && !points.is_empty() {
        admitted = points.to_vec();
        discarded = 0;
    }

    let clusters = grow_clusters(&admitted, config);
    let segments = assemble_segments(&clusters, config, range);

    debug!(
        "detected {} segments ({} stays) from {} points, {} discarded",
        segments.len(),
        segments.iter().filter(|s| s.is_stay()).count(),
        points.len(),
        discarded
    );

    Ok(FilterOutcome {
        segments,
        discarded_low_confidence: discarded,
    })
}

fn grow_clusters(points: &[RawPoint], config: &FilterConfig) -> Vec<Cluster> {
    let mut clusters: Vec<Cluster> = Vec::new();
    let mut current: Option<Cluster> = None;

    for &point in points {
        match current.as_mut() {
            None => current = Some(Cluster::start(point)),
            Some(cluster) => {
                let (clat, clon) = cluster.centroid();
                let dist = haversine_m(clat, clon, point.latitude, point.longitude);
                if dist <= config.distance_threshold_m {
                    cluster.merge(point);
                } else {
                    clusters.push(current.take().unwrap());
                    current = Some(Cluster::start(point));
                }
            }
        }
    }
    if let Some(cluster) = current {
        clusters.push(cluster);
    }
    clusters
}

/// Build the gap-free segment timeline. Stays come straight from qualifying
/// clusters; everything between them (and the range edges) is transit.
fn assemble_segments(
    clusters: &[Cluster],
    config: &FilterConfig,
    range: TimeRange,
) -> Vec<Segment> {
    let stays: Vec<&Cluster> = clusters
        .iter()
        .filter(|c| c.span_secs() >= config.duration_threshold_s)
        .collect();

    // All points not inside a stay cluster: used for transit point counts
    // and transit representatives.
    let transit_points: Vec<RawPoint> = clusters
        .iter()
        .filter(|c| c.span_secs() < config.duration_threshold_s)
        .flat_map(|c| c.points.iter().copied())
        .collect();

    let mut segments = Vec::new();

    if stays.is_empty() {
        if range.start < range.end {
            let representative = transit_points
                .first()
                .copied()
                .unwrap_or_else(|| RawPoint::new(range.start, 0.0, 0.0).with_confidence(0.0));
            segments.push(Segment {
                kind: SegmentKind::Transit,
                start_time: range.start,
                end_time: range.end,
                representative_point: representative,
                point_count: transit_points.len(),
            });
        }
        return segments;
    }

    let mut cursor = range.start;
    for stay in &stays {
        let stay_start = stay.first_ts().max(range.start).max(cursor);
        let stay_end = stay.last_ts().min(range.end);
        if stay_end < stay_start {
            continue;
        }

        if stay_start > cursor {
            segments.push(transit_segment(
                cursor,
                stay_start,
                &transit_points,
                stay.representative(),
            ));
        }
        segments.push(Segment {
            kind: SegmentKind::Stay,
            start_time: stay_start,
            end_time: stay_end,
            representative_point: stay.representative(),
            point_count: stay.points.len(),
        });
        cursor = stay_end;
    }

    if cursor < range.end {
        let fallback = stays[stays.len() - 1].representative();
        segments.push(transit_segment(cursor, range.end, &transit_points, fallback));
    }

    segments
}

fn transit_segment(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    transit_points: &[RawPoint],
    fallback: RawPoint,
) -> Segment {
    let window: Vec<&RawPoint> = transit_points
        .iter()
        .filter(|p| p.timestamp >= start && p.timestamp < end)
        .collect();
    let representative = window.first().map(|p| **p).unwrap_or_else(|| {
        let mut p = fallback;
        p.timestamp = start;
        p
    });
    Segment {
        kind: SegmentKind::Transit,
        start_time: start,
        end_time: end,
        representative_point: representative,
        point_count: window.len(),
    }
}

// ============================================================================
// Tests
// ============================================================================
