//! End-to-end submission and prediction scenarios, run against both the
//! in-memory and the SQLite backend.

use chrono::{DateTime, Duration, TimeZone, Utc};
use eta_engine::{EngineConfig, EngineError, EtaEngine, ManualClock, RetryPolicy};
use eta_storage::{
    EtaStore, InMemoryEtaStore, InMemoryReference, QueryWindow, ReferenceStore, SqliteEtaStore,
};
use eta_types::{
    OutcomeStatus, PredictionQuery, RejectionReason, RideSubmission, SegmentBinStats, SegmentKey,
    SegmentObservation, SegmentReference, SubmissionResponse, TimeBin,
};
use std::sync::Arc;

const ROUTE: &str = "500D";
const STOPS: [&str; 4] = ["S1", "S2", "S3", "S4"];

/// Wednesday, 08:10 UTC.
fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 10, 22, 8, 10, 0).unwrap()
}

/// Bin of every observation made five minutes before `t0`.
fn morning_bin() -> TimeBin {
    TimeBin::new(32).unwrap()
}

fn segment(index: usize) -> SegmentKey {
    SegmentKey::new(ROUTE, 0, STOPS[index], STOPS[index + 1])
}

fn references() -> Vec<SegmentReference> {
    (0..3)
        .map(|i| SegmentReference {
            segment: segment(i),
            scheduled_duration_sec: 120.0,
        })
        .collect()
}

fn observation(index: usize, duration_sec: f64) -> SegmentObservation {
    SegmentObservation {
        from_stop_id: STOPS[index].into(),
        to_stop_id: STOPS[index + 1].into(),
        duration_sec,
        dwell_sec: Some(15.0),
        observed_at: t0() - Duration::minutes(5),
        mapmatch_confidence: 0.95,
        is_holiday: false,
    }
}

fn ride(observations: Vec<SegmentObservation>) -> RideSubmission {
    RideSubmission {
        route_id: ROUTE.into(),
        direction_id: 0,
        device_bucket: "ab".repeat(32),
        segments: observations,
    }
}

fn config() -> EngineConfig {
    EngineConfig::default()
}

struct Harness {
    engine: Arc<EtaEngine>,
    store: Arc<dyn EtaStore>,
    clock: Arc<ManualClock>,
}

impl Harness {
    async fn memory(config: EngineConfig) -> Self {
        let store: Arc<dyn EtaStore> = Arc::new(InMemoryEtaStore::new());
        let reference = Arc::new(InMemoryReference::with_segments(references()));
        Self::build(config, store, reference)
    }

    async fn sqlite(config: EngineConfig) -> Self {
        let sqlite = Arc::new(SqliteEtaStore::in_memory().await.unwrap());
        for reference in references() {
            sqlite.upsert_segment(reference).await.unwrap();
        }
        let store: Arc<dyn EtaStore> = sqlite.clone();
        Self::build(config, store, sqlite)
    }

    fn build(
        config: EngineConfig,
        store: Arc<dyn EtaStore>,
        reference: Arc<dyn ReferenceStore>,
    ) -> Self {
        let clock = Arc::new(ManualClock::new(t0()));
        let engine = EtaEngine::new(config, Arc::clone(&store), reference, clock.clone())
            .unwrap()
            .with_retry_policy(RetryPolicy::immediate(4));
        Self {
            engine: Arc::new(engine),
            store,
            clock,
        }
    }

    async fn submit(&self, key: &str, ride: &RideSubmission) -> SubmissionResponse {
        self.engine.submit(key, ride).await.unwrap().response
    }

    async fn row(&self, index: usize) -> Option<SegmentBinStats> {
        self.store.read_stats(&segment(index), morning_bin()).await.unwrap()
    }

    /// Ten admitted samples around 100 s on the middle segment.
    async fn establish_baseline(&self) {
        let durations = [98.0, 102.0, 99.0, 101.0, 100.0, 100.0, 97.0, 103.0, 100.0, 100.0];
        for (i, duration) in durations.into_iter().enumerate() {
            let response = self
                .submit(&format!("baseline-{i}"), &ride(vec![observation(1, duration)]))
                .await;
            assert_eq!(response.accepted_count, 1);
        }
        assert_eq!(self.row(1).await.unwrap().n, 10);
    }
}

macro_rules! on_both_backends {
    ($($scenario:ident),* $(,)?) => {
        $(
            mod $scenario {
                #[tokio::test]
                async fn memory() {
                    super::$scenario(super::Harness::memory(super::config()).await).await;
                }

                #[tokio::test]
                async fn sqlite() {
                    super::$scenario(super::Harness::sqlite(super::config()).await).await;
                }
            }
        )*
    };
}

on_both_backends!(
    outlier_segment_is_rejected_alone,
    identical_retry_replays_response,
    changed_body_conflicts_without_mutation,
    expired_key_is_processed_again,
    unknown_segment_is_rejected_per_segment,
    invalid_segments_are_counted_by_reason,
    prediction_moves_toward_learned_mean,
    concurrent_submissions_are_all_counted,
    concurrent_duplicates_apply_once,
);

async fn outlier_segment_is_rejected_alone(h: Harness) {
    h.establish_baseline().await;
    let before = h.row(1).await.unwrap();

    let response = h
        .submit(
            "ride-1",
            &ride(vec![
                observation(0, 120.0),
                observation(1, 5000.0),
                observation(2, 90.0),
            ]),
        )
        .await;

    assert_eq!(response.accepted_count, 2);
    assert_eq!(response.rejected_count, 1);
    assert_eq!(response.rejected_by_reason.get("outlier_sigma"), Some(&1));
    assert_eq!(response.outcomes[1].status, OutcomeStatus::Rejected);
    assert_eq!(response.outcomes[1].reason, Some(RejectionReason::OutlierSigma));
    assert!(response.outcomes[0].is_accepted());
    assert!(response.outcomes[2].is_accepted());

    assert_eq!(h.row(1).await.unwrap(), before);
    assert_eq!(h.row(0).await.unwrap().n, 1);
    assert_eq!(h.row(2).await.unwrap().n, 1);

    let rejections = h.store.list_rejections(QueryWindow::default()).await.unwrap();
    assert_eq!(rejections.len(), 1);
    assert_eq!(rejections[0].segment, segment(1));
    assert_eq!(rejections[0].reason, RejectionReason::OutlierSigma);
    assert_eq!(rejections[0].value, 5000.0);
}

async fn identical_retry_replays_response(h: Harness) {
    let body = ride(vec![observation(0, 110.0), observation(1, 95.0)]);
    let first = h.engine.submit("K1", &body).await.unwrap();
    assert!(!first.replayed);
    let n_after_first = h.row(0).await.unwrap().n;

    let second = h.engine.submit("K1", &body).await.unwrap();
    assert!(second.replayed);
    assert_eq!(second.response, first.response);
    assert_eq!(h.row(0).await.unwrap().n, n_after_first);
    assert_eq!(h.row(1).await.unwrap().n, 1);
}

async fn changed_body_conflicts_without_mutation(h: Harness) {
    h.submit("K1", &ride(vec![observation(0, 110.0)])).await;
    let before = h.row(0).await;

    let err = h
        .engine
        .submit("K1", &ride(vec![observation(0, 111.0)]))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict { ref key } if key == "K1"));
    assert_eq!(h.row(0).await, before);
    assert!(h
        .store
        .list_rejections(QueryWindow::default())
        .await
        .unwrap()
        .is_empty());
}

async fn expired_key_is_processed_again(h: Harness) {
    h.submit("K1", &ride(vec![observation(0, 110.0)])).await;
    h.clock.advance(Duration::hours(25));

    let outcome = h
        .engine
        .submit("K1", &ride(vec![observation(0, 112.0)]))
        .await
        .unwrap();
    assert!(!outcome.replayed);
    assert_eq!(outcome.response.accepted_count, 1);
    assert_eq!(h.row(0).await.unwrap().n, 2);

    // The new record now guards the key.
    let replay = h
        .engine
        .submit("K1", &ride(vec![observation(0, 112.0)]))
        .await
        .unwrap();
    assert!(replay.replayed);
}

async fn unknown_segment_is_rejected_per_segment(h: Harness) {
    let mut stray = observation(0, 100.0);
    stray.to_stop_id = "S9".into();
    let response = h.submit("ride-1", &ride(vec![observation(0, 100.0), stray])).await;

    assert_eq!(response.accepted_count, 1);
    assert_eq!(response.outcomes[1].reason, Some(RejectionReason::UnknownSegment));
    let rejections = h.store.list_rejections(QueryWindow::default()).await.unwrap();
    assert_eq!(rejections.len(), 1);
    assert_eq!(rejections[0].reason, RejectionReason::UnknownSegment);
}

async fn invalid_segments_are_counted_by_reason(h: Harness) {
    let mut future = observation(1, 100.0);
    future.observed_at = t0() + Duration::minutes(10);
    let mut stale = observation(1, 100.0);
    stale.observed_at = t0() - Duration::days(8);
    let mut fuzzy = observation(2, 100.0);
    fuzzy.mapmatch_confidence = 0.2;

    let response = h
        .submit(
            "ride-1",
            &ride(vec![
                observation(0, 0.0),
                observation(0, 9000.0),
                future,
                stale,
                fuzzy,
                observation(2, 100.0),
            ]),
        )
        .await;

    assert_eq!(response.accepted_count, 1);
    assert_eq!(response.rejected_count, 5);
    for reason in [
        "invalid_duration",
        "implausible_duration",
        "future_timestamp",
        "stale_timestamp",
        "low_mapmatch_conf",
    ] {
        assert_eq!(response.rejected_by_reason.get(reason), Some(&1), "{reason}");
    }
    assert!(h.row(0).await.is_none());
    assert!(h.row(1).await.is_none());
    assert_eq!(h.row(2).await.unwrap().n, 1);
    assert_eq!(
        h.store
            .list_rejections(QueryWindow::default())
            .await
            .unwrap()
            .len(),
        5
    );
}

async fn prediction_moves_toward_learned_mean(h: Harness) {
    let query = PredictionQuery::at(segment(1), t0() - Duration::minutes(5));
    let cold = h.engine.predict(&query).await.unwrap();
    assert_eq!(cold.predicted_duration_sec, 120.0);

    h.establish_baseline().await;
    let warm = h.engine.predict(&query).await.unwrap();
    assert_eq!(warm.sample_count, 10);
    assert_eq!(warm.bin, morning_bin());
    assert!(warm.predicted_duration_sec < 120.0);
    assert!(warm.predicted_duration_sec > 95.0);
    assert!((warm.blend_weight - 10.0 / 30.0).abs() < 1e-12);
    assert_eq!(warm.last_updated, Some(t0()));
    assert!(!warm.stale);
}

async fn concurrent_submissions_are_all_counted(h: Harness) {
    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = Arc::clone(&h.engine);
        handles.push(tokio::spawn(async move {
            let body = ride(vec![observation(0, 100.0 + i as f64 % 3.0)]);
            engine.submit(&format!("concurrent-{i}"), &body).await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap().response.accepted_count, 1);
    }
    assert_eq!(h.row(0).await.unwrap().n, 16);
}

async fn concurrent_duplicates_apply_once(h: Harness) {
    let body = ride(vec![observation(0, 104.0)]);
    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = Arc::clone(&h.engine);
        let body = body.clone();
        handles.push(tokio::spawn(
            async move { engine.submit("same-key", &body).await },
        ));
    }
    let mut responses = Vec::new();
    for handle in handles {
        responses.push(handle.await.unwrap().unwrap());
    }
    assert_eq!(responses.iter().filter(|o| !o.replayed).count(), 1);
    assert!(responses.windows(2).all(|w| w[0].response == w[1].response));
    assert_eq!(h.row(0).await.unwrap().n, 1);
}

#[tokio::test]
async fn rate_limited_submissions_touch_nothing() {
    let mut config = config();
    config.rate_limit.capacity = 2;
    config.rate_limit.refill_per_hour = 3600.0;
    let h = Harness::memory(config).await;

    h.submit("r1", &ride(vec![observation(0, 100.0)])).await;
    let second = h.engine.submit("r2", &ride(vec![observation(0, 101.0)])).await.unwrap();
    assert_eq!(second.rate.limit, 2);
    assert_eq!(second.rate.remaining, 0);

    let err = h
        .engine
        .submit("r3", &ride(vec![observation(0, 102.0)]))
        .await
        .unwrap_err();
    match err {
        EngineError::RateLimited {
            remaining,
            retry_after_secs,
            ..
        } => {
            assert_eq!(remaining, 0);
            assert_eq!(retry_after_secs, 1);
        }
        other => panic!("expected rate limit, got {other:?}"),
    }
    assert_eq!(h.row(0).await.unwrap().n, 2);

    h.clock.advance(Duration::seconds(1));
    h.submit("r3", &ride(vec![observation(0, 102.0)])).await;
    assert_eq!(h.row(0).await.unwrap().n, 3);
}

#[tokio::test]
async fn malformed_requests_fail_before_rate_limit() {
    let mut config = config();
    config.rate_limit.capacity = 1;
    let h = Harness::memory(config).await;

    let mut bad = ride(vec![observation(0, 100.0)]);
    bad.device_bucket = "not-a-digest".into();
    assert!(matches!(
        h.engine.submit("m1", &bad).await,
        Err(EngineError::Malformed(_))
    ));
    assert!(matches!(
        h.engine.submit("", &ride(vec![observation(0, 100.0)])).await,
        Err(EngineError::Malformed(_))
    ));

    // The single token is still available.
    h.submit("m2", &ride(vec![observation(0, 100.0)])).await;
}

#[tokio::test]
async fn persistent_contention_rolls_back_everything() {
    let mut config = config();
    config.rate_limit.enabled = false;
    let store = Arc::new(InMemoryEtaStore::new());
    let clock = Arc::new(ManualClock::new(t0()));
    let engine = EtaEngine::new(
        config,
        store.clone(),
        Arc::new(InMemoryReference::with_segments(references())),
        clock,
    )
    .unwrap()
    .with_retry_policy(RetryPolicy::immediate(3));

    let body = ride(vec![observation(0, 100.0), observation(1, 5000.0)]);
    store.inject_commit_failures(3);
    let err = engine.submit("K1", &body).await.unwrap_err();
    assert!(matches!(err, EngineError::TransientStorage { attempts: 3, .. }));
    assert!(err.is_retryable());
    assert_eq!(store.stats_row_count().await, 0);
    assert!(store.read_idempotency("K1").await.unwrap().is_none());
    assert!(store
        .list_rejections(QueryWindow::default())
        .await
        .unwrap()
        .is_empty());

    // Retrying with the same key once contention clears applies exactly once.
    let outcome = engine.submit("K1", &body).await.unwrap();
    assert!(!outcome.replayed);
    assert_eq!(outcome.response.accepted_count, 2);
    assert_eq!(store.stats_row_count().await, 2);
}

#[tokio::test]
async fn brief_contention_is_absorbed() {
    let mut config = config();
    config.rate_limit.enabled = false;
    let store = Arc::new(InMemoryEtaStore::new());
    let engine = EtaEngine::new(
        config,
        store.clone(),
        Arc::new(InMemoryReference::with_segments(references())),
        Arc::new(ManualClock::new(t0())),
    )
    .unwrap()
    .with_retry_policy(RetryPolicy::immediate(4));

    store.inject_commit_failures(2);
    let outcome = engine
        .submit("K1", &ride(vec![observation(0, 100.0)]))
        .await
        .unwrap();
    assert_eq!(outcome.response.accepted_count, 1);
    assert_eq!(store.stats_row_count().await, 1);
}

#[tokio::test]
async fn holiday_observations_land_in_weekend_bins() {
    let h = Harness::memory(config()).await;
    let mut holiday = observation(0, 100.0);
    holiday.is_holiday = true;
    let response = h.submit("hol-1", &ride(vec![holiday])).await;
    assert_eq!(response.outcomes[0].bin, TimeBin::new(96 + 32).unwrap());
    assert!(h.row(0).await.is_none());
}
