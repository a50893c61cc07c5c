use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ArrivalsError, Result};
use crate::live_feed::{HttpArrivalsFeed, LiveFeedAdapter};
use crate::reconcile::Reconciler;
use crate::static_schedule::{CachedTimetables, DirTimetableSource, HttpTimetableSource, TimetableSource};

/// Stops whose routes make up the ORR corridor.
pub const DEFAULT_TARGET_STOPS: [&str; 5] = [
    "B Narayanapura Ring Road",
    "Kalamandira",
    "Kadubisanahalli",
    "Eco Space",
    "14th Main HSR Layout",
];

#[derive(Debug, Parser)]
#[command(name = "orr-arrivals")]
#[command(about = "Live and scheduled bus arrivals for ORR stops", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub server: Config,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Build `<stopId>-timetable.csv` files from a GTFS feed and the ORR stops
    GenerateTimetables(GenerateArgs),
}

#[derive(Debug, Clone, Args)]
pub struct GenerateArgs {
    /// GTFS zip archive
    #[arg(long, default_value = "static/bmtc.zip")]
    pub gtfs: PathBuf,

    /// ORR stops GeoJSON (properties: id, name, route_list, towards)
    #[arg(long, default_value = "static/orr-stops.geojson")]
    pub stops: PathBuf,

    /// Directory the timetables and summary are written to
    #[arg(long, default_value = "static/timetables")]
    pub output: PathBuf,

    /// Service date (YYYY-MM-DD); defaults to today in Bengaluru
    #[arg(long)]
    pub date: Option<NaiveDate>,

    /// Stop name fragment marking a corridor stop; repeatable
    #[arg(long = "target-stop", value_name = "NAME", default_values = DEFAULT_TARGET_STOPS)]
    pub target_stops: Vec<String>,
}

#[derive(Debug, Clone, Args)]
pub struct Config {
    /// Address to listen on
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
    pub bind: String,

    /// Directory holding `<stopId>-timetable.csv` files, also served at /timetables
    #[arg(long, env = "TIMETABLE_DIR", default_value = "static/timetables")]
    pub timetable_dir: String,

    /// Fetch timetables from `<origin>/timetables/` instead of the local directory
    #[arg(long, env = "TIMETABLE_ORIGIN")]
    pub timetable_origin: Option<String>,

    /// How long a loaded timetable is reused
    #[arg(long, env = "TIMETABLE_TTL_SECS", default_value_t = 60)]
    pub timetable_ttl_secs: u64,

    /// Live arrivals endpoint; without it only static timetables are served
    #[arg(long, env = "LIVE_FEED_URL")]
    pub live_feed_url: Option<String>,

    /// Timeout for each upstream request
    #[arg(long, env = "LIVE_TIMEOUT_SECS", default_value_t = 8)]
    pub live_timeout_secs: u64,

    /// Extra attempts after a connect or timeout failure
    #[arg(long, env = "LIVE_RETRIES", default_value_t = 1)]
    pub live_retries: u32,

    /// Only live arrivals within this many minutes are shown
    #[arg(long, env = "LIVE_WINDOW_MINS", default_value_t = 90)]
    pub live_window_mins: i64,
}

impl Config {
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.live_timeout_secs)
    }

    pub fn live_window(&self) -> Result<chrono::Duration> {
        chrono::Duration::try_minutes(self.live_window_mins)
            .filter(|window| *window >= chrono::Duration::zero())
            .ok_or_else(|| {
                ArrivalsError::ConfigError(format!("live window of {} minutes is out of range", self.live_window_mins))
            })
    }

    pub fn timetable_source(&self) -> Result<Arc<dyn TimetableSource>> {
        let ttl = Duration::from_secs(self.timetable_ttl_secs);

        let source: Arc<dyn TimetableSource> = match &self.timetable_origin {
            Some(origin) => Arc::new(CachedTimetables::new(
                HttpTimetableSource::new(origin, self.upstream_timeout())?,
                ttl,
            )),
            None => Arc::new(CachedTimetables::new(DirTimetableSource::new(&self.timetable_dir), ttl)),
        };

        Ok(source)
    }

    pub fn live_adapter(&self) -> Result<Option<LiveFeedAdapter>> {
        let Some(url) = &self.live_feed_url else {
            return Ok(None);
        };

        let window = self.live_window()?;
        let feed = HttpArrivalsFeed::new(url, self.upstream_timeout(), self.live_retries)?;
        Ok(Some(LiveFeedAdapter::new(Box::new(feed), window)))
    }

    pub fn reconciler(&self) -> Result<Reconciler> {
        Ok(Reconciler::new(self.timetable_source()?, self.live_adapter()?))
    }
}
