// Timetable generation from the operator's GTFS feed.
//
// Inputs:  GTFS zip (routes, trips, stop_times, optional calendar and
//          calendar_dates) and the ORR stops GeoJSON.
// Outputs: `<stopId>-timetable.csv` per stop with trips on the service date,
//          plus `timetables-summary.csv`.

use chrono::{Datelike, NaiveDate, NaiveTime, Utc, Weekday};
use chrono_tz::Asia::Kolkata;
use csv::{ReaderBuilder, Trim};
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;
use tracing::{debug, info, warn};
use zip::ZipArchive;
use zip::result::ZipError;

use crate::config::GenerateArgs;
use crate::error::{ArrivalsError, Result};
use crate::models::StopId;

const GTFS_DATE_FORMAT: &str = "%Y%m%d";
const GTFS_TIME_FORMAT: &str = "%H:%M:%S";
pub const SUMMARY_FILE: &str = "timetables-summary.csv";

// ============================================================================
// ORR stops
// ============================================================================

#[derive(Debug, Deserialize)]
struct StopCollection {
    features: Vec<StopFeature>,
}

#[derive(Debug, Deserialize)]
struct StopFeature {
    properties: CorridorStop,
}

/// A stop from the ORR stops GeoJSON.
#[derive(Debug, Clone, Deserialize)]
pub struct CorridorStop {
    #[serde(deserialize_with = "id_as_text")]
    pub id: String,
    pub name: String,
    /// Published as a JSON-encoded string; a plain array is accepted too.
    #[serde(deserialize_with = "embedded_list")]
    pub route_list: Vec<String>,
    #[serde(default)]
    pub towards: String,
}

fn id_as_text<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!("unexpected stop id {other}"))),
    }
}

fn embedded_list<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<String>, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => serde_json::from_str(&s).map_err(de::Error::custom),
        list @ serde_json::Value::Array(_) => serde_json::from_value(list).map_err(de::Error::custom),
        serde_json::Value::Null => Ok(Vec::new()),
        other => Err(de::Error::custom(format!("unexpected route_list {other}"))),
    }
}

pub fn parse_corridor_stops(text: &str) -> Result<Vec<CorridorStop>> {
    let collection: StopCollection = serde_json::from_str(text)
        .map_err(|e| ArrivalsError::ParseError(format!("Failed to parse stops GeoJSON: {}", e)))?;
    Ok(collection.features.into_iter().map(|f| f.properties).collect())
}

/// Routes serving any stop whose name contains one of `target_names`
/// (case-insensitive).
pub fn corridor_routes<'a>(stops: &'a [CorridorStop], target_names: &[String]) -> HashSet<&'a str> {
    let targets: Vec<String> = target_names.iter().map(|t| t.to_lowercase()).collect();

    stops
        .iter()
        .filter(|stop| {
            let name = stop.name.to_lowercase();
            targets.iter().any(|t| name.contains(t.as_str()))
        })
        .inspect(|stop| debug!(stop = %stop.name, "Corridor stop"))
        .flat_map(|stop| stop.route_list.iter().map(String::as_str))
        .collect()
}

// ============================================================================
// GTFS tables
// ============================================================================

#[derive(Debug, Deserialize)]
struct RouteRow {
    route_id: String,
    #[serde(default)]
    route_short_name: String,
    #[serde(default)]
    route_long_name: String,
}

#[derive(Debug, Deserialize)]
struct TripRow {
    route_id: String,
    service_id: String,
    trip_id: String,
}

#[derive(Debug, Deserialize)]
struct StopTimeRow {
    trip_id: String,
    #[serde(default)]
    arrival_time: String,
    stop_id: String,
}

#[derive(Debug, Deserialize)]
struct CalendarRow {
    service_id: String,
    #[serde(default)]
    monday: String,
    #[serde(default)]
    tuesday: String,
    #[serde(default)]
    wednesday: String,
    #[serde(default)]
    thursday: String,
    #[serde(default)]
    friday: String,
    #[serde(default)]
    saturday: String,
    #[serde(default)]
    sunday: String,
    start_date: String,
    end_date: String,
}

impl CalendarRow {
    fn runs_on(&self, weekday: Weekday) -> bool {
        let flag = match weekday {
            Weekday::Mon => &self.monday,
            Weekday::Tue => &self.tuesday,
            Weekday::Wed => &self.wednesday,
            Weekday::Thu => &self.thursday,
            Weekday::Fri => &self.friday,
            Weekday::Sat => &self.saturday,
            Weekday::Sun => &self.sunday,
        };
        flag == "1"
    }
}

#[derive(Debug, Deserialize)]
struct CalendarDateRow {
    service_id: String,
    date: String,
    exception_type: String,
}

/// Reads one table from the archive. `None` when the file is absent.
/// Undecodable bytes are replaced and malformed rows are skipped.
fn read_table<R: Read + Seek, T: DeserializeOwned>(archive: &mut ZipArchive<R>, name: &str) -> Result<Option<Vec<T>>> {
    let mut file = match archive.by_name(name) {
        Ok(file) => file,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)
        .map_err(|e| ArrivalsError::FileError(format!("Failed to read {}: {}", name, e)))?;
    drop(file);

    let contents = String::from_utf8_lossy(&bytes);
    let contents = contents.trim_start_matches('\u{feff}');

    let mut reader = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .from_reader(contents.as_bytes());

    let mut rows = Vec::new();
    let mut skipped = 0usize;
    for result in reader.deserialize() {
        match result {
            Ok(row) => rows.push(row),
            Err(_) => skipped += 1,
        }
    }

    if skipped > 0 {
        warn!(table = name, skipped, "Skipped malformed GTFS rows");
    }
    Ok(Some(rows))
}

fn require_table<R: Read + Seek, T: DeserializeOwned>(archive: &mut ZipArchive<R>, name: &str) -> Result<Vec<T>> {
    read_table(archive, name)?.ok_or_else(|| ArrivalsError::FileError(format!("{} not found in GTFS archive", name)))
}

/// The parts of a GTFS feed needed to build stop timetables.
pub struct GtfsFeed {
    routes: Vec<RouteRow>,
    trips: HashMap<String, TripRow>,
    stop_times: HashMap<String, Vec<StopTimeRow>>,
    calendar: HashMap<String, CalendarRow>,
    calendar_dates: HashMap<String, Vec<CalendarDateRow>>,
}

impl GtfsFeed {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| ArrivalsError::FileError(format!("Failed to open {}: {}", path.display(), e)))?;
        Self::from_zip(file)
    }

    pub fn from_zip<R: Read + Seek>(reader: R) -> Result<Self> {
        let mut archive = ZipArchive::new(reader)?;

        let routes: Vec<RouteRow> = require_table(&mut archive, "routes.txt")?;
        let trips: Vec<TripRow> = require_table(&mut archive, "trips.txt")?;
        let stop_times: Vec<StopTimeRow> = require_table(&mut archive, "stop_times.txt")?;

        let calendar: Vec<CalendarRow> = read_table(&mut archive, "calendar.txt")?.unwrap_or_else(|| {
            info!("No calendar.txt in GTFS archive, relying on calendar_dates.txt");
            Vec::new()
        });
        let calendar_dates: Vec<CalendarDateRow> = read_table(&mut archive, "calendar_dates.txt")?.unwrap_or_default();

        let mut feed = GtfsFeed {
            routes,
            trips: trips.into_iter().map(|t| (t.trip_id.clone(), t)).collect(),
            stop_times: HashMap::new(),
            calendar: calendar.into_iter().map(|c| (c.service_id.clone(), c)).collect(),
            calendar_dates: HashMap::new(),
        };

        for stop_time in stop_times {
            feed.stop_times.entry(stop_time.stop_id.clone()).or_default().push(stop_time);
        }
        for exception in calendar_dates {
            feed.calendar_dates.entry(exception.service_id.clone()).or_default().push(exception);
        }

        info!(
            routes = feed.routes.len(),
            trips = feed.trips.len(),
            stops_with_times = feed.stop_times.len(),
            "Loaded GTFS feed"
        );
        Ok(feed)
    }

    /// A dated exception decides first (type 1 adds, anything else removes);
    /// otherwise the weekly calendar must run on that weekday and cover the date.
    pub fn is_service_active(&self, service_id: &str, date: NaiveDate) -> bool {
        let exception = self
            .calendar_dates
            .get(service_id)
            .into_iter()
            .flatten()
            .find(|e| NaiveDate::parse_from_str(&e.date, GTFS_DATE_FORMAT).ok() == Some(date));
        if let Some(exception) = exception {
            return exception.exception_type == "1";
        }

        let Some(cal) = self.calendar.get(service_id) else {
            return false;
        };
        if !cal.runs_on(date.weekday()) {
            return false;
        }

        match (
            NaiveDate::parse_from_str(&cal.start_date, GTFS_DATE_FORMAT),
            NaiveDate::parse_from_str(&cal.end_date, GTFS_DATE_FORMAT),
        ) {
            (Ok(start), Ok(end)) => start <= date && date <= end,
            _ => false,
        }
    }

    /// GTFS route ids matching a stop's published route names, limited to
    /// corridor routes. Each GTFS route is decided by the first name that
    /// matches it.
    fn matching_routes(&self, stop_routes: &[String], corridor: &HashSet<&str>) -> HashSet<&str> {
        self.routes
            .iter()
            .filter_map(|route| {
                let short = route.route_short_name.as_str();
                let hit = stop_routes.iter().filter(|name| !name.is_empty()).find(|name| {
                    name.as_str() == short
                        || route.route_long_name.contains(name.as_str())
                        || (!short.is_empty() && name.contains(short))
                })?;
                corridor.contains(hit.as_str()).then_some(route.route_id.as_str())
            })
            .collect()
    }

    /// `(route short name, arrival)` for every trip of `route_ids` calling at
    /// `stop_id` on `date`, sorted by arrival. Times past midnight (24:00+)
    /// are dropped.
    fn stop_arrivals(&self, stop_id: &str, route_ids: &HashSet<&str>, date: NaiveDate) -> Vec<(String, NaiveTime)> {
        let short_names: HashMap<&str, &str> = self
            .routes
            .iter()
            .map(|r| (r.route_id.as_str(), r.route_short_name.as_str()))
            .collect();

        let mut arrivals: Vec<(String, NaiveTime)> = self
            .stop_times
            .get(stop_id)
            .into_iter()
            .flatten()
            .filter_map(|stop_time| {
                let trip = self.trips.get(&stop_time.trip_id)?;
                if !route_ids.contains(trip.route_id.as_str()) || !self.is_service_active(&trip.service_id, date) {
                    return None;
                }
                let Ok(time) = NaiveTime::parse_from_str(&stop_time.arrival_time, GTFS_TIME_FORMAT) else {
                    debug!(trip_id = %trip.trip_id, time = %stop_time.arrival_time, "Skipping unreadable arrival time");
                    return None;
                };
                let route_name = short_names.get(trip.route_id.as_str()).copied().unwrap_or_default();
                Some((route_name.to_string(), time))
            })
            .collect();

        arrivals.sort_by_key(|(_, time)| *time);
        arrivals
    }
}

// ============================================================================
// Output
// ============================================================================

#[derive(Debug, Serialize)]
struct TimetableRow<'a> {
    stop_id: &'a str,
    route_name: &'a str,
    time: String,
    towards: &'a str,
}

#[derive(Debug, Serialize)]
struct SummaryRow<'a> {
    stop_id: &'a str,
    stop_name: &'a str,
    towards: &'a str,
    route_count: usize,
    trip_count: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GenerationReport {
    pub stops: usize,
    pub timetables_written: usize,
    pub trips_written: usize,
}

fn write_timetable(path: &Path, stop: &CorridorStop, arrivals: &[(String, NaiveTime)]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for (route_name, time) in arrivals {
        writer.serialize(TimetableRow {
            stop_id: &stop.id,
            route_name,
            time: time.format("%H:%M").to_string(),
            towards: &stop.towards,
        })?;
    }
    writer
        .flush()
        .map_err(|e| ArrivalsError::FileError(format!("Failed to write {}: {}", path.display(), e)))
}

/// Writes one timetable per stop that has trips on `date`, then the summary.
/// Stops without trips get no file. A stop whose file cannot be written is
/// logged and counted as empty.
pub fn generate(
    feed: &GtfsFeed,
    stops: &[CorridorStop],
    target_names: &[String],
    date: NaiveDate,
    output_dir: &Path,
) -> Result<GenerationReport> {
    std::fs::create_dir_all(output_dir)
        .map_err(|e| ArrivalsError::FileError(format!("Failed to create {}: {}", output_dir.display(), e)))?;

    let corridor = corridor_routes(stops, target_names);
    info!(routes = corridor.len(), %date, "Generating timetables");

    let mut report = GenerationReport {
        stops: stops.len(),
        ..Default::default()
    };
    let mut summary = Vec::with_capacity(stops.len());

    for stop in stops {
        let route_ids = feed.matching_routes(&stop.route_list, &corridor);
        let arrivals = if route_ids.is_empty() {
            Vec::new()
        } else {
            feed.stop_arrivals(&stop.id, &route_ids, date)
        };

        let mut written = 0;
        if arrivals.is_empty() {
            debug!(stop_id = %stop.id, stop = %stop.name, "No trips on service date");
        } else {
            let written_to = StopId::parse(&stop.id)
                .and_then(|stop_id| {
                    let path = output_dir.join(stop_id.timetable_file_name());
                    write_timetable(&path, stop, &arrivals)
                });
            match written_to {
                Ok(()) => {
                    written = arrivals.len();
                    report.timetables_written += 1;
                    report.trips_written += written;
                    info!(stop_id = %stop.id, trips = written, "Timetable written");
                }
                Err(e) => warn!(stop_id = %stop.id, error = %e, "Failed to write timetable"),
            }
        }

        let route_count = if written > 0 {
            arrivals.iter().map(|(route, _)| route.as_str()).collect::<BTreeSet<_>>().len()
        } else {
            0
        };
        summary.push(SummaryRow {
            stop_id: &stop.id,
            stop_name: &stop.name,
            towards: &stop.towards,
            route_count,
            trip_count: written,
        });
    }

    let summary_path = output_dir.join(SUMMARY_FILE);
    let mut writer = csv::Writer::from_path(&summary_path)?;
    for row in &summary {
        writer.serialize(row)?;
    }
    writer
        .flush()
        .map_err(|e| ArrivalsError::FileError(format!("Failed to write {}: {}", summary_path.display(), e)))?;

    Ok(report)
}

/// Entry point for the `generate-timetables` command.
pub fn run(args: &GenerateArgs) -> Result<GenerationReport> {
    let stops_text = std::fs::read_to_string(&args.stops)
        .map_err(|e| ArrivalsError::FileError(format!("Failed to read {}: {}", args.stops.display(), e)))?;
    let stops = parse_corridor_stops(&stops_text)?;
    info!(stops = stops.len(), "Loaded ORR stops");

    let feed = GtfsFeed::open(&args.gtfs)?;
    let date = args
        .date
        .unwrap_or_else(|| Utc::now().with_timezone(&Kolkata).date_naive());

    generate(&feed, &stops, &args.target_stops, date, &args.output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LineId;
    use crate::timetable_csv::parse_timetable;
    use std::io::{Cursor, Write};
    use zip::ZipWriter;
    use zip::write::FileOptions;

    const ROUTES: &str = "route_id,agency_id,route_short_name,route_long_name\n\
R1,BMTC,500-D,Hebbal - Central Silk Board\n\
R2,BMTC,G-3,Kadugodi - Electronic City\n\
R3,BMTC,201-R,Srinagar - Majestic\n";

    const TRIPS: &str = "route_id,service_id,trip_id\n\
R1,WK,T1\nR1,SUN,T2\nR2,WK,T3\nR3,WK,T4\nR1,EXTRA,T5\nR2,WK2,T6\nR1,WK,T7\n";

    const STOP_TIMES: &str = "trip_id,arrival_time,departure_time,stop_id,stop_sequence\n\
T1,08:10:00,08:10:00,20558,4\n\
T2,07:00:00,07:00:00,20558,4\n\
T3,06:05:00,06:05:00,20558,2\n\
T4,09:00:00,09:00:00,20558,7\n\
T5,07:30:00,07:30:00,20558,4\n\
T6,07:45:00,07:45:00,20558,2\n\
T7,24:30:00,24:30:00,20558,4\n\
T1,08:30:00,08:30:00,20559,5\n\
T4,09:05:00,09:05:00,20559,8\n";

    const CALENDAR: &str = "service_id,monday,tuesday,wednesday,thursday,friday,saturday,sunday,start_date,end_date\n\
WK,1,1,1,1,1,0,0,20260101,20261231\n\
WK2,1,1,1,1,1,0,0,20260101,20261231\n\
SUN,0,0,0,0,0,0,1,20260101,20261231\n";

    const CALENDAR_DATES: &str = "service_id,date,exception_type\n\
EXTRA,20261016,1\n\
WK2,20261016,2\n";

    const STOPS: &str = r#"{
        "type": "FeatureCollection",
        "features": [
            { "type": "Feature", "geometry": { "type": "Point", "coordinates": [77.7, 12.97] },
              "properties": { "id": "20558", "name": "Kalamandira", "route_list": "[\"500-D\", \"G-3\"]", "towards": "KR Pura" } },
            { "type": "Feature", "geometry": { "type": "Point", "coordinates": [77.69, 12.95] },
              "properties": { "id": 20559, "name": "Marathahalli Bridge", "route_list": ["500-D", "201-R"], "towards": "Silk Board" } },
            { "type": "Feature", "geometry": { "type": "Point", "coordinates": [77.6, 12.9] },
              "properties": { "id": "30000", "name": "Agara Lake", "route_list": "[]", "towards": "Silk Board" } }
        ]
    }"#;

    fn gtfs_zip(files: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, body) in files {
            writer.start_file(*name, FileOptions::default()).unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn feed() -> GtfsFeed {
        let bytes = gtfs_zip(&[
            ("routes.txt", ROUTES),
            ("trips.txt", TRIPS),
            ("stop_times.txt", STOP_TIMES),
            ("calendar.txt", CALENDAR),
            ("calendar_dates.txt", CALENDAR_DATES),
        ]);
        GtfsFeed::from_zip(Cursor::new(bytes)).unwrap()
    }

    fn targets() -> Vec<String> {
        vec!["kalamandira".to_string()]
    }

    // Friday
    fn service_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 16).unwrap()
    }

    fn scratch_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("orr-arrivals-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn stops_accept_string_or_numeric_ids_and_route_lists() {
        let stops = parse_corridor_stops(STOPS).unwrap();

        assert_eq!(stops.len(), 3);
        assert_eq!(stops[0].route_list, vec!["500-D", "G-3"]);
        assert_eq!(stops[1].id, "20559");
        assert_eq!(stops[1].route_list, vec!["500-D", "201-R"]);
        assert!(stops[2].route_list.is_empty());
    }

    #[test]
    fn corridor_routes_come_from_target_stops_only() {
        let stops = parse_corridor_stops(STOPS).unwrap();
        let routes = corridor_routes(&stops, &targets());

        assert_eq!(routes, HashSet::from(["500-D", "G-3"]));
    }

    #[test]
    fn service_calendar_and_exceptions() {
        let feed = feed();
        let friday = service_date();
        let sunday = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();

        assert!(feed.is_service_active("WK", friday));
        assert!(!feed.is_service_active("WK", sunday));
        assert!(feed.is_service_active("SUN", sunday));
        assert!(feed.is_service_active("EXTRA", friday));
        assert!(!feed.is_service_active("EXTRA", sunday));
        assert!(!feed.is_service_active("WK2", friday));
        assert!(!feed.is_service_active("WK", NaiveDate::from_ymd_opt(2027, 1, 4).unwrap()));
        assert!(!feed.is_service_active("NOPE", friday));
    }

    #[test]
    fn empty_short_name_does_not_match_everything() {
        let bytes = gtfs_zip(&[
            ("routes.txt", "route_id,route_short_name,route_long_name\nR9,,Depot shuttle\n"),
            ("trips.txt", "route_id,service_id,trip_id\n"),
            ("stop_times.txt", "trip_id,arrival_time,stop_id\n"),
        ]);
        let feed = GtfsFeed::from_zip(Cursor::new(bytes)).unwrap();
        let corridor = HashSet::from(["500-D"]);

        assert!(feed.matching_routes(&["500-D".to_string()], &corridor).is_empty());
    }

    #[test]
    fn missing_required_table_is_an_error() {
        let bytes = gtfs_zip(&[("routes.txt", ROUTES)]);
        assert!(matches!(
            GtfsFeed::from_zip(Cursor::new(bytes)),
            Err(ArrivalsError::FileError(_))
        ));
    }

    #[test]
    fn generates_timetables_readable_by_the_server() {
        let dir = scratch_dir("gen");
        let stops = parse_corridor_stops(STOPS).unwrap();

        let report = generate(&feed(), &stops, &targets(), service_date(), &dir).unwrap();
        assert_eq!(
            report,
            GenerationReport {
                stops: 3,
                timetables_written: 2,
                trips_written: 4,
            }
        );

        let kalamandira = parse_timetable(&std::fs::read_to_string(dir.join("20558-timetable.csv")).unwrap());
        let rows: Vec<_> = kalamandira
            .trips()
            .iter()
            .map(|t| (t.route_name.as_str(), t.clock()))
            .collect();
        assert_eq!(
            rows,
            vec![
                ("G-3", "06:05".to_string()),
                ("500-D", "07:30".to_string()),
                ("500-D", "08:10".to_string()),
            ]
        );
        assert_eq!(kalamandira.towards(), LineId::Purple);

        let marathahalli = parse_timetable(&std::fs::read_to_string(dir.join("20559-timetable.csv")).unwrap());
        assert_eq!(marathahalli.trips().len(), 1);
        assert_eq!(marathahalli.trips()[0].route_name, "500-D");
        assert_eq!(marathahalli.towards(), LineId::Yellow);

        assert!(!dir.join("30000-timetable.csv").exists());

        let summary = std::fs::read_to_string(dir.join(SUMMARY_FILE)).unwrap();
        let lines: Vec<_> = summary.lines().collect();
        assert_eq!(lines[0], "stop_id,stop_name,towards,route_count,trip_count");
        assert_eq!(lines[1], "20558,Kalamandira,KR Pura,2,3");
        assert_eq!(lines[2], "20559,Marathahalli Bridge,Silk Board,1,1");
        assert_eq!(lines[3], "30000,Agara Lake,Silk Board,0,0");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
