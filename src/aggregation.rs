//! Aggregation Engine
//!
//! Turns a complete batch of raw incidents into one [`AggregatedRecord`].
//! The record is built in a single pass and never merged incrementally: if the
//! source data changes it is recomputed wholesale.
//!
//! Every field of an upstream incident is optional and free text. Missing
//! values are tallied under [`UNKNOWN_LABEL`] instead of failing.
//!
//! [`aggregate_overall`] rolls the records of many entities for one period up
//! into a single cross-entity summary.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, NaiveDateTime, Timelike, Weekday};
use serde::{Deserialize, Deserializer, Serialize};

/// Label for absent categorical fields
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Label for `most_common_object` when there is nothing to rank
pub const NO_OBJECT_LABEL: &str = "None";

/// Entity id of the cross-entity summary
pub const OVERALL_ENTITY: &str = "overall";

/// Geo clusters are keyed by coordinates rounded to this many decimals (~110 m)
const GEO_SCALE: f64 = 1000.0;

/// Location attached to an incident
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IncidentLocation {
    #[serde(default, deserialize_with = "lenient_coordinate")]
    pub latitude: Option<f64>,
    #[serde(default, deserialize_with = "lenient_coordinate")]
    pub longitude: Option<f64>,
}

/// One upstream stop-and-search record; any field may be missing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawIncident {
    #[serde(default, deserialize_with = "lenient_text")]
    pub age_range: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub self_defined_ethnicity: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub officer_defined_ethnicity: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub gender: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub legislation: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub object_of_search: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub outcome: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub datetime: Option<String>,
    #[serde(default, deserialize_with = "lenient_location")]
    pub location: Option<IncidentLocation>,
    #[serde(rename = "type", default, deserialize_with = "lenient_text")]
    pub incident_type: Option<String>,
}

/// Coarse outcome bucket derived from the free-text outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeClass {
    Arrest,
    NoFurtherAction,
    Warning,
    Other,
}

/// Classify free-text outcome; first match wins in the order
/// arrest, no further action, warning
///
/// The upstream field is uncontrolled text, so this is a best-effort
/// substring match, not a parse.
#[must_use]
pub fn classify_outcome(outcome: Option<&str>) -> OutcomeClass {
    let Some(text) = outcome else {
        return OutcomeClass::Other;
    };
    let text = text.to_lowercase();
    if text.contains("arrest") {
        OutcomeClass::Arrest
    } else if text.contains("no further action") {
        OutcomeClass::NoFurtherAction
    } else if text.contains("warning") {
        OutcomeClass::Warning
    } else {
        OutcomeClass::Other
    }
}

/// Count of incidents around one rounded coordinate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoCluster {
    pub lat: f64,
    pub lng: f64,
    pub count: u64,
}

/// Statistical summary of one entity for one period
///
/// Immutable once built. Breakdown maps are ordered so that serialization is
/// byte-for-byte deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AggregatedRecord {
    pub entity_id: String,
    pub period: String,
    pub total: u64,
    pub arrests: u64,
    pub no_action: u64,
    pub warnings: u64,
    pub other: u64,
    pub arrests_percentage: f64,
    pub by_ethnicity: BTreeMap<String, u64>,
    pub by_gender: BTreeMap<String, u64>,
    pub by_age_range: BTreeMap<String, u64>,
    pub by_legislation: BTreeMap<String, u64>,
    pub by_object_of_search: BTreeMap<String, u64>,
    pub by_type: BTreeMap<String, u64>,
    /// Hour of day (0-23); only incidents with a parsable datetime
    pub by_hour: BTreeMap<u8, u64>,
    /// English weekday name; only incidents with a parsable datetime
    pub by_day_of_week: BTreeMap<String, u64>,
    pub locations: Vec<GeoCluster>,
    pub most_common_object: String,
    pub most_common_object_count: u64,
}

impl AggregatedRecord {
    /// Zeroed record for an entity/period with no incidents
    #[must_use]
    pub fn empty(entity_id: &str, period: &str) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            period: period.to_string(),
            most_common_object: NO_OBJECT_LABEL.to_string(),
            ..Self::default()
        }
    }

    /// Every categorical breakdown, paired with its name
    #[must_use]
    pub fn categorical_breakdowns(&self) -> [(&'static str, &BTreeMap<String, u64>); 6] {
        [
            ("byEthnicity", &self.by_ethnicity),
            ("byGender", &self.by_gender),
            ("byAgeRange", &self.by_age_range),
            ("byLegislation", &self.by_legislation),
            ("byObjectOfSearch", &self.by_object_of_search),
            ("byType", &self.by_type),
        ]
    }
}

/// Aggregate without entity/period identity
#[must_use]
pub fn aggregate(incidents: &[RawIncident]) -> AggregatedRecord {
    aggregate_for("", "", incidents)
}

/// Aggregate a complete incident batch for one entity and period
#[must_use]
pub fn aggregate_for(entity_id: &str, period: &str, incidents: &[RawIncident]) -> AggregatedRecord {
    let mut record = AggregatedRecord::empty(entity_id, period);
    let mut clusters: BTreeMap<(i64, i64), u64> = BTreeMap::new();

    for incident in incidents {
        record.total += 1;

        match classify_outcome(incident.outcome.as_deref()) {
            OutcomeClass::Arrest => record.arrests += 1,
            OutcomeClass::NoFurtherAction => record.no_action += 1,
            OutcomeClass::Warning => record.warnings += 1,
            OutcomeClass::Other => record.other += 1,
        }

        let ethnicity = incident
            .self_defined_ethnicity
            .as_deref()
            .or(incident.officer_defined_ethnicity.as_deref());
        tally(&mut record.by_ethnicity, ethnicity);
        tally(&mut record.by_gender, incident.gender.as_deref());
        tally(&mut record.by_age_range, incident.age_range.as_deref());
        tally(&mut record.by_legislation, incident.legislation.as_deref());
        tally(&mut record.by_object_of_search, incident.object_of_search.as_deref());
        tally(&mut record.by_type, incident.incident_type.as_deref());

        if let Some(when) = incident.datetime.as_deref().and_then(parse_local_datetime) {
            #[allow(clippy::cast_possible_truncation)]
            let hour = when.hour() as u8;
            *record.by_hour.entry(hour).or_insert(0) += 1;
            *record
                .by_day_of_week
                .entry(weekday_name(when.weekday()).to_string())
                .or_insert(0) += 1;
        }

        if let Some(key) = incident.location.as_ref().and_then(cluster_key) {
            *clusters.entry(key).or_insert(0) += 1;
        }
    }

    finish(&mut record, clusters);
    record
}

/// Cross-entity rollup of one period
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OverallRecord {
    pub period: String,
    /// Entities that contributed at least one incident
    pub forces_analyzed: usize,
    /// Contributing entity ids, sorted
    pub entities: Vec<String>,
    /// Summed counts and breakdowns, under [`OVERALL_ENTITY`]
    pub summary: AggregatedRecord,
}

/// Sum per-entity records of one period into an [`OverallRecord`]
///
/// Records with no incidents are skipped. Breakdowns and geo clusters are
/// merged by key; the arrest percentage and most common object are
/// recomputed from the sums.
#[must_use]
pub fn aggregate_overall<'a, I>(period: &str, records: I) -> OverallRecord
where
    I: IntoIterator<Item = &'a AggregatedRecord>,
{
    let mut summary = AggregatedRecord::empty(OVERALL_ENTITY, period);
    let mut clusters: BTreeMap<(i64, i64), u64> = BTreeMap::new();
    let mut entities = Vec::new();

    for record in records {
        if record.total == 0 {
            continue;
        }
        entities.push(record.entity_id.clone());

        summary.total += record.total;
        summary.arrests += record.arrests;
        summary.no_action += record.no_action;
        summary.warnings += record.warnings;
        summary.other += record.other;

        merge(&mut summary.by_ethnicity, &record.by_ethnicity);
        merge(&mut summary.by_gender, &record.by_gender);
        merge(&mut summary.by_age_range, &record.by_age_range);
        merge(&mut summary.by_legislation, &record.by_legislation);
        merge(&mut summary.by_object_of_search, &record.by_object_of_search);
        merge(&mut summary.by_type, &record.by_type);
        merge(&mut summary.by_hour, &record.by_hour);
        merge(&mut summary.by_day_of_week, &record.by_day_of_week);

        for cluster in &record.locations {
            let location = IncidentLocation {
                latitude: Some(cluster.lat),
                longitude: Some(cluster.lng),
            };
            if let Some(key) = cluster_key(&location) {
                *clusters.entry(key).or_insert(0) += cluster.count;
            }
        }
    }

    finish(&mut summary, clusters);
    entities.sort();
    entities.dedup();
    OverallRecord {
        period: period.to_string(),
        forces_analyzed: entities.len(),
        entities,
        summary,
    }
}

/// Derived fields: clusters, arrest percentage, most common object
fn finish(record: &mut AggregatedRecord, clusters: BTreeMap<(i64, i64), u64>) {
    #[allow(clippy::cast_precision_loss)]
    {
        record.locations = clusters
            .into_iter()
            .map(|((lat, lng), count)| GeoCluster {
                lat: lat as f64 / GEO_SCALE,
                lng: lng as f64 / GEO_SCALE,
                count,
            })
            .collect();

        if record.total > 0 {
            record.arrests_percentage = record.arrests as f64 / record.total as f64 * 100.0;
        }
    }

    // max_by_key keeps the last maximum; iterate in reverse so ties go to the
    // smallest label
    if let Some((label, count)) = record
        .by_object_of_search
        .iter()
        .rev()
        .max_by_key(|(_, count)| **count)
    {
        record.most_common_object.clone_from(label);
        record.most_common_object_count = *count;
    }
}

fn merge<K: Ord + Clone>(into: &mut BTreeMap<K, u64>, from: &BTreeMap<K, u64>) {
    for (key, count) in from {
        *into.entry(key.clone()).or_insert(0) += count;
    }
}

fn tally(map: &mut BTreeMap<String, u64>, value: Option<&str>) {
    let label = value.unwrap_or(UNKNOWN_LABEL);
    if let Some(count) = map.get_mut(label) {
        *count += 1;
    } else {
        map.insert(label.to_string(), 1);
    }
}

#[allow(clippy::cast_possible_truncation)]
fn cluster_key(location: &IncidentLocation) -> Option<(i64, i64)> {
    let lat = location.latitude?;
    let lng = location.longitude?;
    if !lat.is_finite() || !lng.is_finite() {
        return None;
    }
    Some(((lat * GEO_SCALE).round() as i64, (lng * GEO_SCALE).round() as i64))
}

/// Wall-clock time of an upstream timestamp
///
/// Offset-bearing timestamps are read in their own offset; naive ones as-is.
fn parse_local_datetime(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_local());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

// ===== Lenient field decoding =====

/// Strings pass through; blanks, nulls and non-strings become `None`
fn lenient_text<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(d)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => Some(s),
        _ => None,
    })
}

/// Upstream sends coordinates as strings; accept numbers as well
fn lenient_coordinate<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(d)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

fn lenient_location<'de, D: Deserializer<'de>>(d: D) -> Result<Option<IncidentLocation>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(d)?;
    Ok(value.and_then(|v| serde_json::from_value(v).ok()))
}
