// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Retry utilities for calls to external collaborators.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::warn;

use crate::error::RotationError;
use crate::metrics::Metrics;

/// Configures a retry operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Retry {
    /// The initial backoff for the exponential backoff retries.
    pub initial_backoff: Duration,
    /// The backoff multiplier.
    pub multiplier: u32,
    /// Clamps the maximum backoff for the retry operation.
    pub clamp_backoff: Duration,
    /// The total number of attempts, including the first, before giving up.
    pub max_attempts: usize,
    /// A seed for the random jitter.
    pub seed: u64,
}

impl Default for Retry {
    fn default() -> Self {
        Retry::rotation_defaults(SystemTime::now())
    }
}

impl Retry {
    /// The retry policy for external collaborator calls.
    ///
    /// Uses the given SystemTime to initialize the seed for random jitter.
    pub fn rotation_defaults(now: SystemTime) -> Self {
        Retry {
            initial_backoff: Duration::from_millis(250),
            multiplier: 2,
            clamp_backoff: Duration::from_secs(8),
            max_attempts: 6,
            seed: now
                .duration_since(UNIX_EPOCH)
                .map_or(0, |x| u64::from(x.subsec_nanos())),
        }
    }

    /// A configuration that never sleeps, for tests.
    pub fn immediate(max_attempts: usize) -> Self {
        Retry {
            initial_backoff: Duration::ZERO,
            multiplier: 1,
            clamp_backoff: Duration::ZERO,
            max_attempts,
            seed: 0,
        }
    }

    /// Convert into [`RetryStream`]
    pub fn into_retry_stream(self) -> RetryStream {
        let rng = SmallRng::seed_from_u64(self.seed);
        let backoff = self.initial_backoff;
        RetryStream {
            cfg: self,
            rng,
            attempt: 0,
            backoff,
        }
    }
}

/// A series of exponential, jittered, clamped sleeps.
#[derive(Debug)]
pub struct RetryStream {
    cfg: Retry,
    rng: SmallRng,
    attempt: usize,
    backoff: Duration,
}

impl RetryStream {
    /// How many times [Self::sleep] has been called.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Whether another attempt is allowed after the current one failed.
    pub fn exhausted(&self) -> bool {
        self.attempt + 1 >= self.cfg.max_attempts
    }

    /// The next sleep (without jitter for easy printing in logs).
    pub fn next_sleep(&self) -> Duration {
        self.backoff
    }

    /// Executes the next sleep in the series.
    ///
    /// This isn't cancel-safe, so it consumes and returns self, to prevent
    /// accidental mis-use.
    pub async fn sleep(mut self) -> Self {
        let jitter = self.rng.gen_range(0.9..=1.1);
        let sleep = self.next_sleep().mul_f64(jitter);
        tokio::time::sleep(sleep).await;
        self.advance()
    }

    fn advance(mut self) -> Self {
        self.attempt += 1;
        self.backoff = std::cmp::min(self.backoff * self.cfg.multiplier, self.cfg.clamp_backoff);
        self
    }
}

/// Runs `work` until it succeeds or the retry budget is spent.
///
/// Failures are transient until the budget runs out, at which point they are
/// surfaced as [`RotationError::ExternalCallFailure`].
pub async fn retry_external<T, F, Fut>(
    op: &'static str,
    retry: &Retry,
    metrics: &Metrics,
    mut work: F,
) -> Result<T, RotationError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, anyhow::Error>>,
{
    let mut stream = retry.clone().into_retry_stream();
    loop {
        match work().await {
            Ok(x) => return Ok(x),
            Err(err) if stream.exhausted() => {
                metrics.external_failures.with_label_values(&[op]).inc();
                return Err(RotationError::ExternalCallFailure {
                    op,
                    attempts: stream.attempt() + 1,
                    cause: format!("{err:#}"),
                });
            }
            Err(err) => {
                metrics.external_retries.with_label_values(&[op]).inc();
                warn!(
                    "external operation {} failed, retrying in {:?}: {:#}",
                    op,
                    stream.next_sleep(),
                    err
                );
                stream = stream.sleep().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn backoff_schedule_is_clamped() {
        #[track_caller]
        fn testcase(r: Retry, expected_sleep_ms: Vec<u64>) {
            let mut r = r.into_retry_stream();
            for expected_sleep_ms in expected_sleep_ms {
                assert_eq!(r.next_sleep(), Duration::from_millis(expected_sleep_ms));
                r = r.advance();
            }
        }

        testcase(
            Retry {
                initial_backoff: Duration::from_millis(250),
                multiplier: 2,
                clamp_backoff: Duration::from_secs(2),
                max_attempts: 10,
                seed: 0,
            },
            vec![250, 500, 1_000, 2_000, 2_000],
        );
        testcase(Retry::immediate(3), vec![0, 0, 0]);
    }

    #[test]
    fn jitter_is_seeded_from_the_clock() {
        let at = |nanos| UNIX_EPOCH + Duration::new(1_700_000_000, nanos);
        let a = Retry::rotation_defaults(at(1_000));
        let b = Retry::rotation_defaults(at(2_000));
        assert_eq!(a.seed, 1_000);
        assert_eq!(b.seed, 2_000);
        assert_eq!(a.initial_backoff, b.initial_backoff);

        let sleeps = |r: Retry| {
            let mut stream = r.into_retry_stream();
            (0..8)
                .map(|_| stream.rng.gen_range(0.9..=1.1))
                .collect::<Vec<f64>>()
        };
        assert_ne!(sleeps(a), sleeps(b));
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let metrics = Metrics::unregistered();
        let calls = AtomicUsize::new(0);
        let res: Result<(), _> = retry_external("ping", &Retry::immediate(3), &metrics, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow::anyhow!("unreachable")) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match res {
            Err(RotationError::ExternalCallFailure { op, attempts, cause }) => {
                assert_eq!(op, "ping");
                assert_eq!(attempts, 3);
                assert_eq!(cause, "unreachable");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(
            metrics.external_retries.with_label_values(&["ping"]).get(),
            2
        );
    }

    #[tokio::test]
    async fn transient_failures_are_absorbed() {
        let metrics = Metrics::unregistered();
        let calls = AtomicUsize::new(0);
        let res = retry_external("ping", &Retry::immediate(5), &metrics, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(anyhow::anyhow!("flaky"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(res.expect("third attempt succeeds"), 2);
    }
}
