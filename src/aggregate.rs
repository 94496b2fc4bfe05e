//! Aggregation of resolved stays into the travel report: dwell tables by
//! city and region, per-day dwell with proportional midnight splitting, and
//! the chronological jump list with inferred travel modes.
//!
//! A single pass over the chronological stay sequence produces everything.
//! Consecutive stays at the same place merge silently so a jump only appears
//! when the place actually changes. Dwell is conserved: the city table, the
//! region table, and the per-day rows all sum to the same total stay time,
//! with unresolved stays counted under the Unknown bucket.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geo_utils::haversine_km;
use crate::{Jump, Place, ResolvedStay, TravelMode};

const SECS_PER_DAY: f64 = 86_400.0;

/// Speed and distance buckets for travel-mode inference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeConfig {
    /// Average speed at or below this is walking. Default: 7 km/h.
    pub walking_max_kmh: f64,
    /// Average speed at or below this is biking. Default: 20 km/h.
    pub biking_max_kmh: f64,
    /// Average speed at or below this is driving. Default: 140 km/h.
    pub driving_max_kmh: f64,
    /// Faster than driving needs at least this distance to count as a
    /// flight; shorter fast hops are Unknown (GPS glitches mostly).
    /// Default: 300 km.
    pub flight_min_km: f64,
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            walking_max_kmh: 7.0,
            biking_max_kmh: 20.0,
            driving_max_kmh: 140.0,
            flight_min_km: 300.0,
        }
    }
}

/// One row of a dwell table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DwellRow {
    pub label: String,
    pub duration_secs: i64,
    pub fractional_days: f64,
}

/// City dwell for a single UTC calendar day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DayDwellRow {
    pub date: NaiveDate,
    pub rows: Vec<DwellRow>,
}

/// The full aggregation output for one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TravelReport {
    /// Dwell per city, longest first.
    pub dwell_by_city: Vec<DwellRow>,
    /// Dwell per region (US state, otherwise country), longest first.
    pub dwell_by_region: Vec<DwellRow>,
    /// Per-day city dwell, chronological. Stays spanning midnight are split
    /// proportionally so each day's rows account for exactly that day.
    pub dwell_days: Vec<DayDwellRow>,
    /// Place-to-place movements in chronological order.
    pub jumps: Vec<Jump>,
    pub total_stay_secs: i64,
    pub total_distance_km: f64,
}

// ============================================================================
// Aggregation
// ============================================================================

/// Build the travel report from chronological resolved stays.
pub fn aggregate(stays: &[ResolvedStay], config: &ModeConfig) -> TravelReport {
    let mut city_totals: HashMap<String, i64> = HashMap::new();
    let mut region_totals: HashMap<String, i64> = HashMap::new();
    let mut day_totals: BTreeMap<NaiveDate, HashMap<String, i64>> = BTreeMap::new();
    let mut total_stay_secs = 0i64;

    for stay in stays {
        let secs = stay.dwell.num_seconds();
        total_stay_secs += secs;
        *city_totals.entry(stay.place.city.clone()).or_insert(0) += secs;
        *region_totals.entry(stay.place.region_label()).or_insert(0) += secs;

        for (date, day_secs) in split_by_day(stay.segment.start_time, stay.segment.end_time) {
            *day_totals
                .entry(date)
                .or_default()
                .entry(stay.place.city.clone())
                .or_insert(0) += day_secs;
        }
    }

    let jumps = build_jumps(stays, config);
    let total_distance_km = jumps.last().map(|j| j.cumulative_km).unwrap_or(0.0);

    TravelReport {
        dwell_by_city: sorted_rows(city_totals),
        dwell_by_region: sorted_rows(region_totals),
        dwell_days: day_totals
            .into_iter()
            .map(|(date, totals)| DayDwellRow {
                date,
                rows: sorted_rows(totals),
            })
            .collect(),
        jumps,
        total_stay_secs,
        total_distance_km,
    }
}

/// Bucket a movement by average speed, with the flight distance floor.
pub fn infer_mode(distance_km: f64, duration_secs: i64, config: &ModeConfig) -> TravelMode {
    if duration_secs <= 0 {
        return TravelMode::Unknown;
    }
    let speed_kmh = distance_km / (duration_secs as f64 / 3600.0);
    if speed_kmh <= config.walking_max_kmh {
        TravelMode::Walking
    } else if speed_kmh <= config.biking_max_kmh {
        TravelMode::Biking
    } else if speed_kmh <= config.driving_max_kmh {
        TravelMode::Driving
    } else if distance_km >= config.flight_min_km {
        TravelMode::Flight
    } else {
        TravelMode::Unknown
    }
}

// ============================================================================
// Internals
// ============================================================================

struct MergedStay {
    place: Place,
    end: DateTime<Utc>,
}

fn build_jumps(stays: &[ResolvedStay], config: &ModeConfig) -> Vec<Jump> {
    let mut current: Option<MergedStay> = None;
    let mut jumps = Vec::new();
    let mut cumulative_km = 0.0;

    for stay in stays {
        // Same place again: extend the previous visit, no jump.
        let same = current
            .as_ref()
            .is_some_and(|prev| prev.place.same_place(&stay.place));
        if same {
            if let Some(prev) = current.as_mut() {
                prev.end = stay.segment.end_time;
            }
            continue;
        }

        if let Some(prev) = current.take() {
            let distance_km = haversine_km(
                prev.place.latitude,
                prev.place.longitude,
                stay.place.latitude,
                stay.place.longitude,
            );
            let depart_time = prev.end;
            let arrive_time = stay.segment.start_time;
            let duration_secs = (arrive_time - depart_time).num_seconds();
            cumulative_km += distance_km;
            jumps.push(Jump {
                from_place: prev.place,
                to_place: stay.place.clone(),
                depart_time,
                arrive_time,
                distance_km,
                inferred_mode: infer_mode(distance_km, duration_secs, config),
                cumulative_km,
            });
        }
        current = Some(MergedStay {
            place: stay.place.clone(),
            end: stay.segment.end_time,
        });
    }

    jumps
}

/// Split a half-open span into per-UTC-day chunks at midnight boundaries.
fn split_by_day(start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<(NaiveDate, i64)> {
    let mut chunks = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let next_midnight = match cursor.date_naive().checked_add_days(Days::new(1)) {
            Some(next) => next.and_time(NaiveTime::MIN).and_utc(),
            None => break,
        };
        let chunk_end = end.min(next_midnight);
        chunks.push((cursor.date_naive(), (chunk_end - cursor).num_seconds()));
        cursor = chunk_end;
    }
    chunks
}

fn sorted_rows(totals: HashMap<String, i64>) -> Vec<DwellRow> {
    let mut rows: Vec<DwellRow> = totals
        .into_iter()
        .map(|(label, duration_secs)| DwellRow {
            label,
            duration_secs,
            fractional_days: duration_secs as f64 / SECS_PER_DAY,
        })
        .collect();
    rows.sort_by(|a, b| {
        b.duration_secs
            .cmp(&a.duration_secs)
            .then_with(|| a.label.cmp(&b.label))
    });
    rows
}

// ============================================================================
// Tests
// ============================================================================
