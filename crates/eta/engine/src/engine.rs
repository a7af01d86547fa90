//! Engine facade
//!
//! Wires the write path ([`SubmissionCoordinator`]) and the read path
//! ([`BlendPredictor`]) over one pair of stores and one clock.

use crate::coordinator::{SubmissionCoordinator, SubmissionOutcome};
use crate::predict::BlendPredictor;
use crate::retry::RetryPolicy;
use crate::time_bin::TimeBinResolver;
use crate::{Clock, EngineConfig, EngineError, EngineResult};
use eta_storage::{EtaStore, ReferenceStore};
use eta_types::{Prediction, PredictionQuery, RideSubmission};
use std::sync::Arc;
use tracing::debug;

pub struct EtaEngine {
    config: EngineConfig,
    store: Arc<dyn EtaStore>,
    reference: Arc<dyn ReferenceStore>,
    clock: Arc<dyn Clock>,
    resolver: TimeBinResolver,
    predictor: BlendPredictor,
    coordinator: SubmissionCoordinator,
}

impl EtaEngine {
    /// Validate `config` and build every component from it.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn EtaStore>,
        reference: Arc<dyn ReferenceStore>,
        clock: Arc<dyn Clock>,
    ) -> EngineResult<Self> {
        config.validate()?;
        let coordinator = SubmissionCoordinator::new(
            &config,
            Arc::clone(&store),
            Arc::clone(&reference),
            Arc::clone(&clock),
        )?;
        Ok(Self {
            resolver: TimeBinResolver::new(&config.time_bins)?,
            predictor: BlendPredictor::new(&config.learning),
            coordinator,
            config,
            store,
            reference,
            clock,
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.coordinator = self.coordinator.with_retry_policy(retry);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn submit(
        &self,
        idempotency_key: &str,
        submission: &RideSubmission,
    ) -> EngineResult<SubmissionOutcome> {
        self.coordinator.submit(idempotency_key, submission).await
    }

    /// Blended estimate for one segment at `query.at` (or now).
    ///
    /// Reads committed state only and never writes.
    pub async fn predict(&self, query: &PredictionQuery) -> EngineResult<Prediction> {
        let now = self.clock.now();
        let schedule = self
            .reference
            .scheduled_duration(&query.segment)
            .await?
            .ok_or_else(|| EngineError::SegmentNotFound(query.segment.clone()))?;

        let at = query.at.unwrap_or(now);
        let bin = self.resolver.resolve(at, query.is_holiday);
        let stats = self.store.read_stats(&query.segment, bin).await?;
        let estimate = self.predictor.estimate(stats.as_ref(), schedule, now);

        debug!(
            segment = %query.segment,
            bin = bin.id(),
            n = estimate.sample_count,
            weight = estimate.blend_weight,
            "prediction served"
        );

        Ok(Prediction {
            segment: query.segment.clone(),
            bin,
            query_time: at,
            predicted_duration_sec: estimate.predicted_duration_sec,
            confidence: estimate.confidence,
            sample_count: estimate.sample_count,
            blend_weight: estimate.blend_weight,
            schedule_duration_sec: schedule,
            learned_duration_sec: estimate.learned_duration_sec,
            p50_sec: estimate.p50_sec,
            p90_sec: estimate.p90_sec,
            low_n_warning: estimate.low_n_warning,
            last_updated: stats.and_then(|s| s.last_updated),
            stale: estimate.stale,
        })
    }

    /// Storage liveness.
    pub async fn ping(&self) -> EngineResult<()> {
        self.store.ping().await?;
        Ok(())
    }
}
