//! Submission Coordinator
//!
//! One submission end to end:
//! 1. structural validation (fails before anything else)
//! 2. rate limit, spending one token for the device bucket
//! 3. idempotency fast path on committed state
//! 4. per-segment bin resolution, plausibility checks and reference lookup
//! 5. one transaction: idempotency re-check, outlier gate and statistics
//!    update per admitted segment, rejection log entries, idempotency record
//!
//! Step 5 is all-or-nothing and is retried as a whole on storage contention.

use crate::idempotency::{IdempotencyCheck, IdempotencyGuard};
use crate::rate_limit::{bucket_prefix, RateDecision, RateLimiter};
use crate::retry::{with_retry, RetryPolicy};
use crate::stats::{OnlineStatsStore, StatsUpdate};
use crate::time_bin::TimeBinResolver;
use crate::validate::ObservationValidator;
use crate::{Clock, EngineConfig, EngineResult};
use chrono::{DateTime, Utc};
use eta_storage::{EtaStore, ReferenceStore, StoreTransaction};
use eta_types::{
    IdempotencyRecord, OutcomeStatus, RejectionReason, RejectionRecord, RideSubmission, SegmentKey,
    SegmentObservation, SegmentOutcome, SubmissionResponse, TimeBin,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of a submission that passed the request-level gates.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionOutcome {
    pub response: SubmissionResponse,
    pub rate: RateDecision,
    /// True when the response was replayed from an earlier identical request.
    pub replayed: bool,
}

/// One observation with everything that can be decided outside the
/// transaction already resolved.
struct PreparedSegment<'a> {
    index: usize,
    observation: &'a SegmentObservation,
    segment: SegmentKey,
    bin: TimeBin,
    precheck: Option<RejectionReason>,
}

enum Applied {
    Fresh(SubmissionResponse),
    Replay(SubmissionResponse),
}

pub struct SubmissionCoordinator {
    store: Arc<dyn EtaStore>,
    reference: Arc<dyn ReferenceStore>,
    clock: Arc<dyn Clock>,
    resolver: TimeBinResolver,
    validator: ObservationValidator,
    stats: OnlineStatsStore,
    guard: IdempotencyGuard,
    limiter: RateLimiter,
    retry: RetryPolicy,
    max_segments: usize,
}

impl SubmissionCoordinator {
    pub fn new(
        config: &EngineConfig,
        store: Arc<dyn EtaStore>,
        reference: Arc<dyn ReferenceStore>,
        clock: Arc<dyn Clock>,
    ) -> EngineResult<Self> {
        let retry = RetryPolicy::from_config(&config.retry);
        Ok(Self {
            resolver: TimeBinResolver::new(&config.time_bins)?,
            validator: ObservationValidator::new(&config.validation),
            stats: OnlineStatsStore::new(&config.learning),
            guard: IdempotencyGuard::new(&config.idempotency),
            limiter: RateLimiter::new(config.rate_limit.clone(), Arc::clone(&store), retry.clone()),
            max_segments: config.validation.max_segments_per_ride,
            store,
            reference,
            clock,
            retry,
        })
    }

    /// Override the retry policy, e.g. to avoid sleeping in tests.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.limiter = RateLimiter::new(
            self.limiter.config().clone(),
            Arc::clone(&self.store),
            retry.clone(),
        );
        self.retry = retry;
        self
    }

    pub async fn submit(
        &self,
        idempotency_key: &str,
        submission: &RideSubmission,
    ) -> EngineResult<SubmissionOutcome> {
        self.guard.validate_key(idempotency_key)?;
        submission.validate(self.max_segments)?;

        let now = self.clock.now();
        let rate = self.limiter.check(&submission.device_bucket, now).await?;

        let body_hash = self.guard.body_hash(submission)?;
        let committed = self.store.read_idempotency(idempotency_key).await?;
        if let IdempotencyCheck::Replay(response) =
            self.checked(idempotency_key, committed.as_ref(), &body_hash, now)?
        {
            info!(key = idempotency_key, "idempotent replay");
            return Ok(SubmissionOutcome {
                response,
                rate,
                replayed: true,
            });
        }

        let prepared = self.prepare(submission, now).await?;

        let applied = with_retry(&self.retry, "submission", || {
            self.apply_once(idempotency_key, &body_hash, &prepared, now)
        })
        .await?;

        let (response, replayed) = match applied {
            Applied::Fresh(response) => {
                info!(
                    route = %submission.route_id,
                    direction = submission.direction_id,
                    bucket = %bucket_prefix(&submission.device_bucket),
                    accepted = response.accepted_count,
                    rejected = response.rejected_count,
                    "ride submission processed"
                );
                (response, false)
            }
            Applied::Replay(response) => {
                info!(key = idempotency_key, "idempotent replay after concurrent first write");
                (response, true)
            }
        };

        Ok(SubmissionOutcome {
            response,
            rate,
            replayed,
        })
    }

    fn checked(
        &self,
        key: &str,
        existing: Option<&IdempotencyRecord>,
        body_hash: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<IdempotencyCheck> {
        self.guard
            .check(key, existing, body_hash, now)
            .inspect_err(|err| {
                if err.is_conflict() {
                    warn!(key, "idempotency key reused with a different body");
                }
            })
    }

    /// Resolve bins and run every check that needs no transaction.
    async fn prepare<'a>(
        &self,
        submission: &'a RideSubmission,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<PreparedSegment<'a>>> {
        let mut prepared = Vec::with_capacity(submission.segments.len());
        for (index, observation) in submission.segments.iter().enumerate() {
            let segment = submission.segment_key(observation);
            let bin = self
                .resolver
                .resolve(observation.observed_at, observation.is_holiday);

            let mut precheck = self.validator.check(observation, now).err();
            if precheck.is_none() && !self.reference.segment_exists(&segment).await? {
                precheck = Some(RejectionReason::UnknownSegment);
            }

            prepared.push(PreparedSegment {
                index,
                observation,
                segment,
                bin,
                precheck,
            });
        }
        Ok(prepared)
    }

    async fn apply_once(
        &self,
        key: &str,
        body_hash: &str,
        prepared: &[PreparedSegment<'_>],
        now: DateTime<Utc>,
    ) -> EngineResult<Applied> {
        let mut tx = self.store.begin().await?;
        match self.apply_in(tx.as_mut(), key, body_hash, prepared, now).await {
            Ok(Applied::Fresh(response)) => {
                tx.commit().await?;
                Ok(Applied::Fresh(response))
            }
            Ok(replay) => {
                tx.rollback().await?;
                Ok(replay)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback after failed submission also failed");
                }
                Err(err)
            }
        }
    }

    async fn apply_in(
        &self,
        tx: &mut dyn StoreTransaction,
        key: &str,
        body_hash: &str,
        prepared: &[PreparedSegment<'_>],
        now: DateTime<Utc>,
    ) -> EngineResult<Applied> {
        // A concurrent first write with the same key may have committed since
        // the fast-path read.
        let existing = tx.get_idempotency(key).await?;
        if let IdempotencyCheck::Replay(response) =
            self.checked(key, existing.as_ref(), body_hash, now)?
        {
            return Ok(Applied::Replay(response));
        }

        let mut outcomes = Vec::with_capacity(prepared.len());
        for item in prepared {
            let observation = item.observation;
            let reason = match item.precheck {
                Some(reason) => Some(reason),
                None => {
                    let update = self
                        .stats
                        .update(
                            tx,
                            &item.segment,
                            item.bin,
                            observation.duration_sec,
                            observation.observed_at,
                            now,
                        )
                        .await?;
                    match update {
                        StatsUpdate::Applied(_) => None,
                        StatsUpdate::Rejected { z, current } => {
                            debug!(
                                segment = %item.segment,
                                bin = item.bin.id(),
                                value = observation.duration_sec,
                                mean = current.mean,
                                n = current.n,
                                z,
                                "outlier rejected"
                            );
                            Some(RejectionReason::OutlierSigma)
                        }
                    }
                }
            };

            if let Some(reason) = reason {
                if !reason.is_statistical() {
                    debug!(segment = %item.segment, index = item.index, %reason, "segment rejected");
                }
                tx.append_rejection(&RejectionRecord {
                    segment: item.segment.clone(),
                    bin: item.bin,
                    value: observation.duration_sec,
                    mapmatch_confidence: observation.mapmatch_confidence,
                    reason,
                    recorded_at: now,
                })
                .await?;
            }

            outcomes.push(SegmentOutcome {
                index: item.index,
                from_stop_id: observation.from_stop_id.clone(),
                to_stop_id: observation.to_stop_id.clone(),
                bin: item.bin,
                status: if reason.is_some() {
                    OutcomeStatus::Rejected
                } else {
                    OutcomeStatus::Accepted
                },
                reason,
            });
        }

        let response = SubmissionResponse::from_outcomes(outcomes);
        let record = self
            .guard
            .record(key, body_hash.to_string(), &response, now)?;
        tx.put_idempotency(&record).await?;
        Ok(Applied::Fresh(response))
    }
}
