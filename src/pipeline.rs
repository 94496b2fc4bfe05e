//! Pipeline coordinator: normalize, segment, resolve, aggregate.
//!
//! The coordinator owns stage ordering and the effective time range (caller
//! override, then export header, then data extent) and threads the shared
//! stats and cancellation flag through the stages. Cancellation is a clean
//! partial return: whatever resolved before the flag was seen still flows
//! into the report, with the rest in the Unknown bucket.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Duration;
use log::info;
use tokio::runtime::Runtime;

use crate::aggregate::{aggregate, ModeConfig, TravelReport};
use crate::cache::PlaceCache;
use crate::error::{AnalyzerError, Result};
use crate::filter::{detect_segments, FilterConfig};
use crate::geocode::{resolve_stays, CancelFlag, Geocoder, ResolveConfig};
use crate::normalize::{parse_export, NormalizeConfig, NormalizedExport};
use crate::progress::{PipelineStats, ProgressCallback, ProgressEvent, StatsSnapshot};
use crate::{Segment, TimeRange};

/// Per-run configuration for the whole pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub normalize: NormalizeConfig,
    pub filter: FilterConfig,
    pub resolve: ResolveConfig,
    pub mode: ModeConfig,
    /// Caller-supplied analysis window. Takes precedence over both the
    /// normalize config's range and the export header's range.
    pub date_range: Option<TimeRange>,
}

/// Everything one pipeline run produces.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub report: TravelReport,
    /// The full stay/transit segmentation, for callers that render a
    /// timeline rather than just the tables.
    pub segments: Vec<Segment>,
    pub stats: StatsSnapshot,
    pub normalized: NormalizedExport,
}

/// Run the full pipeline over one export.
pub async fn run_pipeline(
    input_json: &str,
    config: &PipelineConfig,
    cache: &mut dyn PlaceCache,
    geocoder: Arc<dyn Geocoder>,
    cancel: &CancelFlag,
    progress: Option<ProgressCallback>,
) -> Result<PipelineOutput> {
    let stats = Arc::new(PipelineStats::new());

    let mut norm_config = config.normalize.clone();
    if config.date_range.is_some() {
        norm_config.date_range = config.date_range;
    }

    let normalized = parse_export(input_json, &norm_config)?;
    stats
        .records_dropped_fields
        .fetch_add(normalized.dropped_missing_fields as u64, Ordering::Relaxed);
    if let Some(cb) = &progress {
        cb(ProgressEvent::PointsNormalized {
            points: normalized.points.len(),
            dropped_fields: normalized.dropped_missing_fields,
        });
    }

    if normalized.points.is_empty() {
        info!("no points in range, producing an empty report");
        return Ok(PipelineOutput {
            report: aggregate(&[], &config.mode),
            segments: Vec::new(),
            stats: stats.snapshot(),
            normalized,
        });
    }

    let range = effective_range(&normalized);
    let outcome = detect_segments(&normalized.points, &config.filter, range)?;
    stats
        .points_discarded_low_confidence
        .fetch_add(outcome.discarded_low_confidence as u64, Ordering::Relaxed);

    let stays: Vec<Segment> = outcome
        .segments
        .iter()
        .filter(|s| s.is_stay())
        .cloned()
        .collect();
    if let Some(cb) = &progress {
        cb(ProgressEvent::SegmentsDetected {
            stays: stays.len(),
            transits: outcome.segments.len() - stays.len(),
        });
    }

    let resolved = resolve_stays(
        &stays,
        cache,
        geocoder,
        &config.resolve,
        cancel,
        Arc::clone(&stats),
        progress.as_ref(),
    )
    .await?;

    let report = aggregate(&resolved, &config.mode);
    if let Some(cb) = &progress {
        cb(ProgressEvent::ReportReady {
            jumps: report.jumps.len(),
        });
    }

    Ok(PipelineOutput {
        report,
        segments: outcome.segments,
        stats: stats.snapshot(),
        normalized,
    })
}

/// Run the pipeline from synchronous code. Owns a runtime for the duration
/// of the call.
pub fn run_pipeline_blocking(
    input_json: &str,
    config: &PipelineConfig,
    cache: &mut dyn PlaceCache,
    geocoder: Arc<dyn Geocoder>,
    cancel: &CancelFlag,
    progress: Option<ProgressCallback>,
) -> Result<PipelineOutput> {
    let runtime = Runtime::new().map_err(|e| AnalyzerError::Internal {
        message: format!("failed to create async runtime: {}", e),
    })?;
    runtime.block_on(run_pipeline(
        input_json, config, cache, geocoder, cancel, progress,
    ))
}

/// The window the segmentation must cover: configured range if any,
/// otherwise the data extent (end nudged past the last point so the
/// half-open range includes it).
fn effective_range(normalized: &NormalizedExport) -> TimeRange {
    match normalized.effective_range {
        Some(range) => range,
        None => {
            // points is non-empty and sorted here
            let first = normalized.points[0].timestamp;
            let last = normalized.points[normalized.points.len() - 1].timestamp;
            TimeRange::new(first, last + Duration::seconds(1))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::geocode::GeocodeFailure;
    use crate::Place;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    /// Returns a city named after the rounded coordinate, counting calls.
    struct GridGeocoder {
        calls: AtomicU32,
    }

    impl GridGeocoder {
        fn new() -> Self {
            Self {
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Geocoder for GridGeocoder {
        async fn reverse(
            &self,
            latitude: f64,
            longitude: f64,
        ) -> std::result::Result<Place, GeocodeFailure> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(Place {
                city: format!("City {:.1},{:.1}", latitude, longitude),
                region_or_state: String::new(),
                country: "Testland".to_string(),
                latitude,
                longitude,
            })
        }
    }

    fn canonical_point(ts: &str, lat: f64, lon: f64) -> serde_json::Value {
        serde_json::json!({
            "timestamp": ts,
            "latitude": lat,
            "longitude": lon,
            "accuracyMeters": 10.0,
            "confidence": 0.9,
        })
    }

    /// Eight points over 20 minutes at one spot, then six at another.
    fn two_stop_export() -> String {
        let mut records = Vec::new();
        for i in 0..8 {
            records.push(canonical_point(
                &format!("2024-05-01T08:{:02}:00Z", i * 3),
                47.609,
                -122.333,
            ));
        }
        for i in 0..6 {
            records.push(canonical_point(
                &format!("2024-05-01T10:{:02}:00Z", i * 4),
                47.615,
                -122.200,
            ));
        }
        serde_json::to_string(&records).unwrap()
    }

    #[tokio::test]
    async fn test_end_to_end_two_stays() {
        let geocoder = Arc::new(GridGeocoder::new());
        let mut cache = MemoryCache::new();
        let output = run_pipeline(
            &two_stop_export(),
            &PipelineConfig::default(),
            &mut cache,
            geocoder.clone(),
            &CancelFlag::new(),
            None,
        )
        .await
        .unwrap();

        assert_eq!(output.report.dwell_by_city.len(), 2);
        assert_eq!(output.report.jumps.len(), 1);
        assert_eq!(geocoder.calls.load(Ordering::Relaxed), 2);
        assert_eq!(output.stats.cache_misses, 2);
        assert_eq!(output.stats.unresolved, 0);

        // Coverage invariant: segments tile the range with no gaps
        let range = output.normalized.effective_range.unwrap_or(TimeRange::new(
            output.segments[0].start_time,
            output.segments[output.segments.len() - 1].end_time,
        ));
        assert_eq!(output.segments[0].start_time, range.start);
        for pair in output.segments.windows(2) {
            assert_eq!(pair[0].end_time, pair[1].start_time);
        }
    }

    #[tokio::test]
    async fn test_second_run_is_served_from_cache() {
        let geocoder = Arc::new(GridGeocoder::new());
        let mut cache = MemoryCache::new();
        let config = PipelineConfig::default();
        let input = two_stop_export();

        let first = run_pipeline(
            &input,
            &config,
            &mut cache,
            geocoder.clone(),
            &CancelFlag::new(),
            None,
        )
        .await
        .unwrap();
        let calls_after_first = geocoder.calls.load(Ordering::Relaxed);

        let second = run_pipeline(
            &input,
            &config,
            &mut cache,
            geocoder.clone(),
            &CancelFlag::new(),
            None,
        )
        .await
        .unwrap();

        assert_eq!(geocoder.calls.load(Ordering::Relaxed), calls_after_first);
        assert_eq!(second.stats.cache_hits, 2);
        assert_eq!(second.stats.api_calls, 0);
        assert_eq!(
            first.report.dwell_by_city,
            second.report.dwell_by_city
        );
    }

    #[tokio::test]
    async fn test_cancelled_run_returns_partial_report() {
        let geocoder = Arc::new(GridGeocoder::new());
        let mut cache = MemoryCache::new();
        let cancel = CancelFlag::new();
        cancel.cancel();

        let output = run_pipeline(
            &two_stop_export(),
            &PipelineConfig::default(),
            &mut cache,
            geocoder.clone(),
            &CancelFlag::default(),
            None,
        )
        .await
        .unwrap();
        let full_total = output.report.total_stay_secs;

        let mut cache = MemoryCache::new();
        let partial = run_pipeline(
            &two_stop_export(),
            &PipelineConfig::default(),
            &mut cache,
            geocoder,
            &cancel,
            None,
        )
        .await
        .unwrap();

        // Every stay is still present, just unlabeled; dwell is conserved.
        assert_eq!(partial.report.total_stay_secs, full_total);
        assert_eq!(partial.stats.unresolved, 2);
        assert!(partial
            .report
            .dwell_by_city
            .iter()
            .all(|r| r.label == crate::Place::UNKNOWN));
    }

    #[tokio::test]
    async fn test_empty_input_yields_empty_report() {
        let geocoder = Arc::new(GridGeocoder::new());
        let mut cache = MemoryCache::new();
        let output = run_pipeline(
            "[]",
            &PipelineConfig::default(),
            &mut cache,
            geocoder.clone(),
            &CancelFlag::new(),
            None,
        )
        .await
        .unwrap();

        assert!(output.report.dwell_by_city.is_empty());
        assert!(output.segments.is_empty());
        assert_eq!(geocoder.calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_malformed_input_is_fatal() {
        let geocoder = Arc::new(GridGeocoder::new());
        let mut cache = MemoryCache::new();
        let err = run_pipeline(
            "{\"nothing\": true}",
            &PipelineConfig::default(),
            &mut cache,
            geocoder,
            &CancelFlag::new(),
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AnalyzerError::MalformedInput { .. }));
    }

    #[test]
    fn test_blocking_wrapper() {
        let geocoder = Arc::new(GridGeocoder::new());
        let mut cache = MemoryCache::new();
        let output = run_pipeline_blocking(
            &two_stop_export(),
            &PipelineConfig::default(),
            &mut cache,
            geocoder,
            &CancelFlag::new(),
            None,
        )
        .unwrap();
        assert_eq!(output.report.dwell_by_city.len(), 2);
    }

    #[tokio::test]
    async fn test_progress_events_fire_in_order() {
        let geocoder = Arc::new(GridGeocoder::new());
        let mut cache = MemoryCache::new();
        let events: Arc<Mutex<Vec<ProgressEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let callback: ProgressCallback = Arc::new(move |event| {
            sink.lock().unwrap().push(event);
        });

        run_pipeline(
            &two_stop_export(),
            &PipelineConfig::default(),
            &mut cache,
            geocoder,
            &CancelFlag::new(),
            Some(callback),
        )
        .await
        .unwrap();

        let events = events.lock().unwrap();
        assert!(matches!(
            events.first(),
            Some(ProgressEvent::PointsNormalized { .. })
        ));
        assert!(matches!(
            events.last(),
            Some(ProgressEvent::ReportReady { .. })
        ));
        assert!(events
            .iter()
            .any(|e| matches!(e, ProgressEvent::SegmentsDetected { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, ProgressEvent::CacheChecked { .. })));
    }
}
