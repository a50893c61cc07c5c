// Picks between the live feed and the static timetable for one request.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{Instrument, info, info_span, warn};

use crate::live_feed::LiveFeedAdapter;
use crate::models::{StopId, TimetableResult};
use crate::static_schedule::TimetableSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Live,
    Static,
}

#[derive(Debug, Clone)]
pub struct Reconciled {
    pub timetable: TimetableResult,
    pub source: Source,
}

pub struct Reconciler {
    timetables: Arc<dyn TimetableSource>,
    live: Option<LiveFeedAdapter>,
}

impl Reconciler {
    pub fn new(timetables: Arc<dyn TimetableSource>, live: Option<LiveFeedAdapter>) -> Self {
        Self { timetables, live }
    }

    pub async fn reconcile(&self, stop_id: &StopId) -> Reconciled {
        self.reconcile_at(stop_id, Utc::now()).await
    }

    /// Static first, since it supplies the route allowlist and direction; then
    /// live, which wins whenever it has at least one trip. Neither tier can
    /// fail the request.
    pub async fn reconcile_at(&self, stop_id: &StopId, now: DateTime<Utc>) -> Reconciled {
        let span = info_span!("reconcile", stop_id = %stop_id);

        async move {
            let static_result = match self.timetables.load(stop_id).await {
                Ok(timetable) => timetable,
                Err(e) => {
                    warn!(error = %e, "Static timetable unavailable, using empty schedule");
                    TimetableResult::empty()
                }
            };

            if let Some(live) = self.try_live(stop_id, &static_result, now).await {
                info!(trips = live.trips().len(), source = "live", "Serving live arrivals");
                return Reconciled {
                    timetable: live,
                    source: Source::Live,
                };
            }

            info!(trips = static_result.trips().len(), source = "static", "Serving static timetable");
            Reconciled {
                timetable: static_result,
                source: Source::Static,
            }
        }
        .instrument(span)
        .await
    }

    async fn try_live(&self, stop_id: &StopId, static_result: &TimetableResult, now: DateTime<Utc>) -> Option<TimetableResult> {
        let live = self.live.as_ref()?;
        let static_towards = Some(static_result.towards()).filter(|t| t.is_known());

        match live.fetch(stop_id, static_result.routes(), static_towards, now).await {
            Ok(Some(timetable)) if !timetable.is_empty() => Some(timetable),
            Ok(_) => {
                info!("Live feed had no usable arrivals");
                None
            }
            Err(e) => {
                warn!(error = %e, "Live feed failed, falling back to static");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ArrivalsError, Result};
    use crate::live_feed::{ArrivalRecord, ArrivalsFeed};
    use crate::models::LineId;
    use crate::timetable_csv::parse_timetable;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};

    struct FixedTimetable(Option<&'static str>);

    #[async_trait]
    impl TimetableSource for FixedTimetable {
        async fn load(&self, _stop_id: &StopId) -> Result<TimetableResult> {
            match self.0 {
                Some(text) => Ok(parse_timetable(text)),
                None => Err(ArrivalsError::UpstreamStatus {
                    status: 404,
                    url: "/timetables/1-timetable.csv".into(),
                }),
            }
        }
    }

    enum FakeFeed {
        Records(Vec<ArrivalRecord>),
        Down,
    }

    #[async_trait]
    impl ArrivalsFeed for FakeFeed {
        async fn arrivals(&self, _stop_id: &StopId) -> Result<Vec<ArrivalRecord>> {
            match self {
                FakeFeed::Records(records) => Ok(records.clone()),
                FakeFeed::Down => Err(ArrivalsError::NetworkError("connection refused".into())),
            }
        }
    }

    const PURPLE_CSV: &str = "stop_id,route_name,time,towards\n1,500-D,06:00,KR Pura\n1,G-3,06:30,KR Pura\n";

    fn now() -> DateTime<Utc> {
        // 08:00 IST
        Utc.with_ymd_and_hms(2026, 10, 16, 2, 30, 0).unwrap()
    }

    fn rec(route: &str, at: &str) -> ArrivalRecord {
        ArrivalRecord {
            routeno: Some(route.into()),
            tostationname: Some("Silk Board".into()),
            arrivaltime: Some(at.into()),
        }
    }

    fn reconciler(csv: Option<&'static str>, feed: Option<FakeFeed>) -> Reconciler {
        let live = feed.map(|f| LiveFeedAdapter::new(Box::new(f), Duration::minutes(90)));
        Reconciler::new(Arc::new(FixedTimetable(csv)), live)
    }

    fn stop() -> StopId {
        StopId::parse("1").unwrap()
    }

    #[tokio::test]
    async fn live_wins_when_non_empty() {
        let feed = FakeFeed::Records(vec![rec("201", "16-10-2026 08:05:00"), rec("500-D", "16-10-2026 08:10:00")]);
        let out = reconciler(Some(PURPLE_CSV), Some(feed)).reconcile_at(&stop(), now()).await;

        assert_eq!(out.source, Source::Live);
        assert_eq!(out.timetable.trips().len(), 1);
        assert_eq!(out.timetable.trips()[0].route_name, "500-D");
        // static direction is authoritative over the feed's destination text
        assert_eq!(out.timetable.towards(), LineId::Purple);
        assert_eq!(out.timetable.trips()[0].towards, LineId::Purple);
    }

    #[tokio::test]
    async fn feed_down_falls_back_to_static() {
        let out = reconciler(Some(PURPLE_CSV), Some(FakeFeed::Down)).reconcile_at(&stop(), now()).await;

        assert_eq!(out.source, Source::Static);
        assert_eq!(out.timetable.trips().len(), 2);
        assert_eq!(out.timetable.towards(), LineId::Purple);
    }

    #[tokio::test]
    async fn empty_feed_falls_back_to_static() {
        let out = reconciler(Some(PURPLE_CSV), Some(FakeFeed::Records(vec![])))
            .reconcile_at(&stop(), now())
            .await;

        assert_eq!(out.source, Source::Static);
        assert_eq!(out.timetable.trips().len(), 2);
    }

    #[tokio::test]
    async fn no_live_configured_serves_static() {
        let out = reconciler(Some(PURPLE_CSV), None).reconcile_at(&stop(), now()).await;
        assert_eq!(out.source, Source::Static);
    }

    #[tokio::test]
    async fn missing_static_yields_empty_result() {
        let feed = FakeFeed::Records(vec![rec("500-D", "16-10-2026 08:10:00")]);
        let out = reconciler(None, Some(feed)).reconcile_at(&stop(), now()).await;

        // empty allowlist filters every live record
        assert_eq!(out.source, Source::Static);
        assert!(out.timetable.is_empty());
        assert_eq!(out.timetable.towards(), LineId::Unknown);
    }
}
