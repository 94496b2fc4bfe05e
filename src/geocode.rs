//! Geocode resolver: stay coordinates → places, through a persistent cache
//! and bounded-concurrency batched lookups against an external service.
//!
//! The resolver is the pipeline's only concurrency boundary. Cache lookups
//! always come first; misses are coalesced per coordinate key, chunked into
//! bounded batches, and dispatched through a semaphore-limited worker pool
//! with per-request retry and exponential backoff. Workers report results to
//! the single coordinating writer, which persists each success before the
//! aggregator ever sees it. Results re-join the original chronological stay
//! order, so resolution order never affects output.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Deserialize;
use tokio::sync::Semaphore;

use crate::cache::PlaceCache;
use crate::error::{AnalyzerError, Result};
use crate::progress::{PipelineStats, ProgressCallback, ProgressEvent};
use crate::{CoordKey, Place, ResolvedStay, Segment};

/// How a single geocode lookup failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeocodeFailure {
    /// The service asked us to slow down; retried after backoff.
    RateLimited,
    /// Timeout, transport error, or server error; retried after backoff.
    Transient(String),
    /// No place exists for this coordinate (or the request can never
    /// succeed). Terminal: the stay becomes Unresolved without retry.
    NoResult,
}

/// Reverse-geocoding collaborator contract.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn reverse(
        &self,
        latitude: f64,
        longitude: f64,
    ) -> std::result::Result<Place, GeocodeFailure>;
}

/// Configuration for batched resolution.
#[derive(Debug, Clone)]
pub struct ResolveConfig {
    /// Unique coordinates per dispatched batch. Default: 25.
    pub batch_size: usize,
    /// Maximum concurrent in-flight lookups. Default: 8.
    pub concurrency: usize,
    /// Attempts per coordinate before marking it Unresolved. Default: 3.
    pub max_attempts: u32,
    /// Backoff base; attempt n sleeps `base * 2^(n-1)`. Default: 250 ms.
    pub backoff_base_ms: u64,
}

impl Default for ResolveConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            concurrency: 8,
            max_attempts: 3,
            backoff_base_ms: 250,
        }
    }
}

/// Cooperative cancellation signal shared between the caller and the
/// resolver. Cancelling stops new dispatch; in-flight requests finish or
/// time out, and already-resolved stays are returned.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// Resolve every stay segment to a place.
///
/// `stays` must be chronological stay segments; the returned vector matches
/// their order one to one. Stays whose coordinate cannot be resolved carry
/// [`Place::unresolved`] rather than failing the run.
pub async fn resolve_stays(
    stays: &[Segment],
    cache: &mut dyn PlaceCache,
    geocoder: Arc<dyn Geocoder>,
    config: &ResolveConfig,
    cancel: &CancelFlag,
    stats: Arc<PipelineStats>,
    progress: Option<&ProgressCallback>,
) -> Result<Vec<ResolvedStay>> {
    let mut places: Vec<Option<Place>> = vec![None; stays.len()];
    // Keys still needing the external service, in first-seen order, with the
    // stay indices waiting on each key (request de-duplication).
    let mut pending: Vec<CoordKey> = Vec::new();
    let mut waiting: HashMap<CoordKey, Vec<usize>> = HashMap::new();
    let mut coords: HashMap<CoordKey, (f64, f64)> = HashMap::new();
    let mut degraded = false;

    for (i, stay) in stays.iter().enumerate() {
        let rep = &stay.representative_point;
        let key = CoordKey::from_point(rep);

        if let Some(indices) = waiting.get_mut(&key) {
            indices.push(i);
            continue;
        }

        let cached = if degraded {
            None
        } else {
            match cache.get(&key) {
                Ok(found) => found,
                Err(e) => {
                    warn!("geocode cache unavailable, continuing without it: {}", e);
                    degraded = true;
                    None
                }
            }
        };

        match cached {
            Some(place) => {
                stats.record_cache_hit();
                places[i] = Some(place);
            }
            None => {
                stats.record_cache_miss();
                coords.insert(key.clone(), (rep.latitude, rep.longitude));
                waiting.insert(key.clone(), vec![i]);
                pending.push(key);
            }
        }
    }

    if let Some(cb) = progress {
        let snap = stats.snapshot();
        cb(ProgressEvent::CacheChecked {
            hits: snap.cache_hits,
            misses: snap.cache_misses,
        });
    }

    let batch_size = config.batch_size.max(1);
    let total_batches = pending.len().div_ceil(batch_size);
    if total_batches > 0 {
        info!(
            "resolving {} unique coordinates in {} batches ({} workers)",
            pending.len(),
            total_batches,
            config.concurrency
        );
    }

    let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));

    for (batch_idx, chunk) in pending.chunks(batch_size).enumerate() {
        if cancel.is_cancelled() {
            info!("cancellation requested, skipping remaining geocode batches");
            break;
        }

        let mut handles = Vec::with_capacity(chunk.len());
        for key in chunk {
            let (lat, lon) = coords[key];
            let key = key.clone();
            let geocoder = Arc::clone(&geocoder);
            let semaphore = Arc::clone(&semaphore);
            let stats = Arc::clone(&stats);
            let cancel = cancel.clone();
            let config = config.clone();

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.expect("resolver pool closed");
                let place =
                    lookup_with_retry(geocoder.as_ref(), lat, lon, &config, &cancel, &stats).await;
                (key, place)
            }));
        }

        // Single-writer join point: only this task touches the cache.
        for handle in handles {
            let (key, place) = handle.await.map_err(|e| AnalyzerError::Internal {
                message: format!("resolver worker panicked: {}", e),
            })?;

            if let Some(place) = place {
                if !degraded {
                    if let Err(e) = cache.put(&key, &place) {
                        warn!("geocode cache write failed, continuing without it: {}", e);
                        degraded = true;
                    }
                }
                for &idx in waiting.get(&key).into_iter().flatten() {
                    places[idx] = Some(place.clone());
                }
            }
        }

        stats.record_batch_completed();
        if let Some(cb) = progress {
            cb(ProgressEvent::BatchCompleted {
                completed: batch_idx + 1,
                total: total_batches,
            });
        }
    }

    // Re-join in the stays' chronological order regardless of which
    // coordinates resolved first.
    let mut resolved = Vec::with_capacity(stays.len());
    let mut unresolved_count = 0usize;
    for (i, stay) in stays.iter().enumerate() {
        let place = match places[i].take() {
            Some(place) => place,
            None => {
                stats.record_unresolved();
                unresolved_count += 1;
                let rep = &stay.representative_point;
                Place::unresolved(rep.latitude, rep.longitude)
            }
        };
        resolved.push(ResolvedStay::new(stay.clone(), place));
    }

    if let Some(cb) = progress {
        cb(ProgressEvent::StaysResolved {
            resolved: resolved.len() - unresolved_count,
            unresolved: unresolved_count,
        });
    }

    Ok(resolved)
}

async fn lookup_with_retry(
    geocoder: &dyn Geocoder,
    latitude: f64,
    longitude: f64,
    config: &ResolveConfig,
    cancel: &CancelFlag,
    stats: &PipelineStats,
) -> Option<Place> {
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return None;
        }

        attempt += 1;
        stats.record_api_call();
        match geocoder.reverse(latitude, longitude).await {
            Ok(place) => return Some(place),
            Err(GeocodeFailure::NoResult) => {
                debug!("no result for ({:.4}, {:.4})", latitude, longitude);
                return None;
            }
            Err(failure) => {
                if attempt >= config.max_attempts {
                    warn!(
                        "giving up on ({:.4}, {:.4}) after {} attempts: {:?}",
                        latitude, longitude, attempt, failure
                    );
                    return None;
                }
                stats.record_retry();
                let backoff = StdDuration::from_millis(
                    config.backoff_base_ms * (1u64 << (attempt - 1).min(6)),
                );
                warn!(
                    "retrying ({:.4}, {:.4}) after {:?}: {:?}",
                    latitude, longitude, backoff, failure
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

// ============================================================================
// Geoapify client
// ============================================================================

const REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_BASE_URL: &str = "https://api.geoapify.com";

/// Reverse-geocoding client for the Geoapify API.
pub struct GeoapifyClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GeoapifyClient {
    pub fn new(api_key: &str) -> Result<Self> {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    /// Override the endpoint host (for testing against a local server).
    pub fn with_base_url(api_key: &str, base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| AnalyzerError::Internal {
                message: format!("failed to create HTTP client: {}", e),
            })?;
        Ok(Self {
            client,
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct GeoJsonResponse {
    #[serde(default)]
    features: Vec<GeoJsonFeature>,
}

#[derive(Debug, Deserialize)]
struct GeoJsonFeature {
    #[serde(default)]
    properties: GeoJsonProperties,
}

#[derive(Debug, Default, Deserialize)]
struct GeoJsonProperties {
    city: Option<String>,
    county: Option<String>,
    state: Option<String>,
    country: Option<String>,
    name: Option<String>,
    category: Option<String>,
    #[serde(rename = "class")]
    feature_class: Option<String>,
}

/// Words in a feature name that indicate open water.
const WATER_WORDS: [&str; 5] = ["waters", "sea", "ocean", "bay", "channel"];

fn place_from_properties(
    latitude: f64,
    longitude: f64,
    props: &GeoJsonProperties,
) -> Option<Place> {
    let name = props.name.clone().unwrap_or_default();
    let is_water = (props.category.as_deref() == Some("natural")
        && props.feature_class.as_deref() == Some("water"))
        || WATER_WORDS.iter().any(|w| name.to_lowercase().contains(w));

    // Water features rarely carry a city; use the water body's name so the
    // dwell tables still get a readable label.
    let city = props
        .city
        .clone()
        .or_else(|| props.county.clone())
        .or_else(|| if is_water && !name.is_empty() { Some(name) } else { None })?;

    Some(Place {
        city,
        region_or_state: props.state.clone().unwrap_or_default(),
        country: props.country.clone().unwrap_or_default(),
        latitude,
        longitude,
    })
}

#[async_trait]
impl Geocoder for GeoapifyClient {
    async fn reverse(
        &self,
        latitude: f64,
        longitude: f64,
    ) -> std::result::Result<Place, GeocodeFailure> {
        let url = format!("{}/v1/geocode/reverse", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("lat", latitude.to_string()),
                ("lon", longitude.to_string()),
                ("apiKey", self.api_key.clone()),
                ("format", "geojson".to_string()),
            ])
            .send()
            .await
            .map_err(|e| GeocodeFailure::Transient(e.to_string()))?;

        let status = response.status();
        match status.as_u16() {
            200 => {
                let body: GeoJsonResponse = response
                    .json()
                    .await
                    .map_err(|e| GeocodeFailure::Transient(format!("invalid body: {}", e)))?;
                match body.features.first() {
                    Some(feature) => {
                        place_from_properties(latitude, longitude, &feature.properties)
                            .ok_or(GeocodeFailure::NoResult)
                    }
                    None => Err(GeocodeFailure::NoResult),
                }
            }
            429 => Err(GeocodeFailure::RateLimited),
            // Bad request, bad key, forbidden, or nothing there: retrying
            // cannot help, the stay stays unresolved
            400 | 401 | 403 | 404 => {
                warn!("geocode request rejected with {}", status);
                Err(GeocodeFailure::NoResult)
            }
            500..=599 => Err(GeocodeFailure::Transient(format!("server error {}", status))),
            _ => Err(GeocodeFailure::Transient(format!(
                "unexpected status {}",
                status
            ))),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
