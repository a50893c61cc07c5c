//! Nearest-stop arrivals for the ORR bus corridors.
//!
//! Serves one stop's upcoming arrivals, preferring the operator's live feed
//! and falling back to the published static timetable. The timetables
//! themselves are generated from the operator's GTFS feed.

pub mod config;
pub mod error;
pub mod live_feed;
pub mod models;
pub mod normalize;
pub mod reconcile;
pub mod server;
pub mod static_schedule;
pub mod timetable_csv;
pub mod timetable_gen;
