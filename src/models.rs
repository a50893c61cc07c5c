// Data model shared by the static and live tiers.

use chrono::{NaiveTime, Timelike};
use serde::{Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;

use crate::error::{ArrivalsError, Result};

// ============================================================================
// Line identity
// ============================================================================

/// Canonical corridor a stop is served towards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum LineId {
    #[serde(rename = "Yellow Line")]
    Yellow,
    #[serde(rename = "Purple Line")]
    Purple,
    #[default]
    Unknown,
}

impl LineId {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineId::Yellow => "Yellow Line",
            LineId::Purple => "Purple Line",
            LineId::Unknown => "Unknown",
        }
    }

    pub fn is_known(&self) -> bool {
        *self != LineId::Unknown
    }
}

impl fmt::Display for LineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Stop identifier
// ============================================================================

/// Caller-supplied stop identifier.
///
/// Treated as an opaque string for file and URL lookups. Only ASCII
/// alphanumerics, `-` and `_` are accepted since the id is spliced into a
/// file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StopId(String);

impl StopId {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let valid = !trimmed.is_empty()
            && trimmed
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

        if valid {
            Ok(StopId(trimmed.to_string()))
        } else {
            Err(ArrivalsError::InvalidStopId(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Integer form used in the live-feed payload.
    pub fn station_id(&self) -> Result<i64> {
        self.0
            .parse::<i64>()
            .map_err(|_| ArrivalsError::InvalidStopId(self.0.clone()))
    }

    pub fn timetable_file_name(&self) -> String {
        format!("{}-timetable.csv", self.0)
    }
}

impl fmt::Display for StopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Trips and results
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Trip {
    pub route_name: String,
    #[serde(serialize_with = "serialize_clock")]
    pub time: NaiveTime,
    pub towards: LineId,
}

impl Trip {
    /// Builds a trip, dropping seconds from `time`.
    pub fn new(route_name: impl Into<String>, time: NaiveTime, towards: LineId) -> Self {
        let time = NaiveTime::from_hms_opt(time.hour(), time.minute(), 0).unwrap_or(time);
        Trip {
            route_name: route_name.into(),
            time,
            towards,
        }
    }

    /// Minutes since midnight, the ordering key for a timetable.
    pub fn minute_of_day(&self) -> u32 {
        self.time.hour() * 60 + self.time.minute()
    }

    pub fn clock(&self) -> String {
        self.time.format("%H:%M").to_string()
    }
}

fn serialize_clock<S: Serializer>(time: &NaiveTime, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(&time.format("%H:%M"))
}

/// Parses `HH:MM` or `HH:MM:SS`.
pub fn parse_clock(raw: &str) -> Option<NaiveTime> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .ok()
}

/// What the client receives, whichever tier produced it.
///
/// `routes` is always derived from `trips`, and `trips` is always ordered by
/// minute of day.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct TimetableResult {
    trips: Vec<Trip>,
    routes: BTreeSet<String>,
    towards: LineId,
}

impl TimetableResult {
    pub fn new(mut trips: Vec<Trip>, towards: LineId) -> Self {
        // stable: equal minutes keep input order
        trips.sort_by_key(Trip::minute_of_day);
        let routes = trips.iter().map(|t| t.route_name.clone()).collect();
        TimetableResult {
            trips,
            routes,
            towards,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn trips(&self) -> &[Trip] {
        &self.trips
    }

    pub fn routes(&self) -> &BTreeSet<String> {
        &self.routes
    }

    pub fn towards(&self) -> LineId {
        self.towards
    }

    pub fn is_empty(&self) -> bool {
        self.trips.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn routes_follow_trips() {
        let result = TimetableResult::new(
            vec![
                Trip::new("500-D", t(9, 0), LineId::Purple),
                Trip::new("500-D", t(8, 0), LineId::Purple),
                Trip::new("G-3", t(8, 30), LineId::Purple),
            ],
            LineId::Purple,
        );

        let routes: Vec<_> = result.routes().iter().cloned().collect();
        assert_eq!(routes, vec!["500-D".to_string(), "G-3".to_string()]);
        assert_eq!(result.trips()[0].clock(), "08:00");
        assert_eq!(result.trips()[2].clock(), "09:00");
    }

    #[test]
    fn sort_is_stable_for_equal_minutes() {
        let result = TimetableResult::new(
            vec![
                Trip::new("B", NaiveTime::from_hms_opt(7, 15, 40).unwrap(), LineId::Yellow),
                Trip::new("A", t(7, 15), LineId::Yellow),
                Trip::new("C", t(6, 5), LineId::Yellow),
            ],
            LineId::Yellow,
        );

        let order: Vec<_> = result.trips().iter().map(|t| t.route_name.as_str()).collect();
        assert_eq!(order, vec!["C", "B", "A"]);
    }

    #[test]
    fn serializes_to_wire_shape() {
        let result = TimetableResult::new(vec![Trip::new("335-E", t(18, 5), LineId::Yellow)], LineId::Yellow);
        let json = serde_json::to_value(&result).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "trips": [{ "route_name": "335-E", "time": "18:05", "towards": "Yellow Line" }],
                "routes": ["335-E"],
                "towards": "Yellow Line"
            })
        );
    }

    #[test]
    fn empty_result_is_unknown() {
        let json = serde_json::to_value(TimetableResult::empty()).unwrap();
        assert_eq!(json["towards"], "Unknown");
        assert_eq!(json["trips"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn stop_id_rejects_path_characters() {
        assert!(StopId::parse("20558").is_ok());
        assert!(StopId::parse(" 20558 ").is_ok());
        assert!(StopId::parse("../etc/passwd").is_err());
        assert!(StopId::parse("").is_err());
    }

    #[test]
    fn station_id_requires_integer() {
        assert_eq!(StopId::parse("20558").unwrap().station_id().unwrap(), 20558);
        assert!(StopId::parse("stop-a").unwrap().station_id().is_err());
    }

    #[test]
    fn parse_clock_accepts_seconds() {
        assert_eq!(parse_clock("06:45:00"), Some(t(6, 45)));
        assert_eq!(parse_clock(" 23:59 "), Some(t(23, 59)));
        assert_eq!(parse_clock("25:10:00"), None);
        assert_eq!(parse_clock("soon"), None);
    }
}
