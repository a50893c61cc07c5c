// Parser for the per-stop static timetable files.
//
// Layout (header row first):
//   stop_id,route_name,time,towards
//   20558,500-D,06:10,KR Pura
//
// Column 0 is ignored. Time may carry seconds. Each line is one row: a `"`
// toggles quoting within that row only, a quoted comma is literal, and no
// quote characters survive into field text.

use csv::{ReaderBuilder, StringRecord, Trim};
use tracing::debug;

use crate::models::{LineId, TimetableResult, Trip, parse_clock};
use crate::normalize::normalize_destination;

const ROUTE_COL: usize = 1;
const TIME_COL: usize = 2;
const TOWARDS_COL: usize = 3;
const MIN_COLUMNS: usize = 4;

/// Splits one line into trimmed fields. `None` for blank or unreadable lines.
fn split_row(builder: &ReaderBuilder, line: &str) -> Option<Vec<String>> {
    let record: StringRecord = builder.from_reader(line.as_bytes()).records().next()?.ok()?;

    Some(
        record
            .iter()
            .map(|field| field.replace('"', "").trim().to_string())
            .collect(),
    )
}

/// Parses a static timetable.
///
/// The first accepted row decides `towards` for the whole file, and every trip
/// is stamped with it: one file describes one direction of travel. Rows with
/// fewer than four columns or an unreadable time are skipped.
pub fn parse_timetable(text: &str) -> TimetableResult {
    let mut builder = ReaderBuilder::new();
    builder.has_headers(false).flexible(true).trim(Trim::All);

    let mut towards: Option<LineId> = None;
    let mut rows: Vec<(String, chrono::NaiveTime)> = Vec::new();
    let mut skipped = 0usize;

    for line in text.lines().skip(1) {
        let Some(fields) = split_row(&builder, line) else {
            continue;
        };

        if fields.len() < MIN_COLUMNS {
            skipped += 1;
            continue;
        }

        let Some(time) = parse_clock(&fields[TIME_COL]) else {
            skipped += 1;
            continue;
        };

        if towards.is_none() {
            towards = Some(normalize_destination(Some(&fields[TOWARDS_COL])));
        }

        rows.push((fields[ROUTE_COL].clone(), time));
    }

    if skipped > 0 {
        debug!(skipped, kept = rows.len(), "Skipped unusable timetable rows");
    }

    let towards = towards.unwrap_or_default();
    let trips = rows
        .into_iter()
        .map(|(route, time)| Trip::new(route, time, towards))
        .collect();

    TimetableResult::new(trips, towards)
}
