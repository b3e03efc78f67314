//! Structured fan-out with per-unit timeouts.
//!
//! Every unit runs as a task in one `JoinSet` and is joined before
//! [`fan_out`] returns. A unit that exceeds its timeout is dropped in place,
//! which cancels it at its next await point and drops any child process
//! spawned with `kill_on_drop`. Dropping the returned future aborts every
//! outstanding unit. Failures and panics are attached to the unit that
//! produced them and never cancel siblings.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Bounds for one fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanOutOptions {
    /// Maximum units running at once.
    pub concurrency: usize,
    /// Budget for each unit, measured from when it starts running.
    pub timeout: Duration,
}

impl Default for FanOutOptions {
    fn default() -> Self {
        Self {
            concurrency: 8,
            timeout: Duration::from_secs(30),
        }
    }
}

/// How one unit ended.
#[derive(Debug)]
pub enum UnitOutcome<T, E> {
    /// The unit returned a value.
    Ok(T),
    /// The unit returned an error.
    Failed(E),
    /// The unit was cancelled after exceeding its timeout.
    TimedOut(Duration),
    /// The unit panicked; the payload message is kept.
    Panicked(String),
}

impl<T, E> UnitOutcome<T, E> {
    /// Returns true if the unit returned a value.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Run keyed units concurrently and return their outcomes in input order.
pub async fn fan_out<K, T, E, F>(units: Vec<(K, F)>, options: FanOutOptions) -> Vec<(K, UnitOutcome<T, E>)>
where
    F: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let mut set = JoinSet::new();
    let mut keys = Vec::with_capacity(units.len());

    for (index, (key, unit)) in units.into_iter().enumerate() {
        keys.push(key);
        let semaphore = Arc::clone(&semaphore);
        let timeout = options.timeout;
        set.spawn(async move {
            // The semaphore is never closed.
            let _permit = semaphore.acquire_owned().await.ok();
            let outcome = match AssertUnwindSafe(tokio::time::timeout(timeout, unit))
                .catch_unwind()
                .await
            {
                Ok(Ok(Ok(value))) => UnitOutcome::Ok(value),
                Ok(Ok(Err(e))) => UnitOutcome::Failed(e),
                Ok(Err(_elapsed)) => UnitOutcome::TimedOut(timeout),
                Err(payload) => UnitOutcome::Panicked(panic_message(payload.as_ref())),
            };
            (index, outcome)
        });
    }

    let mut outcomes: Vec<Option<UnitOutcome<T, E>>> = keys.iter().map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, outcome)) => outcomes[index] = Some(outcome),
            Err(e) => tracing::error!(error = %e, "Fan-out task aborted"),
        }
    }

    keys.into_iter()
        .zip(outcomes)
        .map(|(key, outcome)| {
            (
                key,
                outcome.unwrap_or_else(|| UnitOutcome::Panicked("task aborted".to_string())),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    type Unit = std::pin::Pin<Box<dyn Future<Output = Result<u32, String>> + Send>>;

    fn options(timeout_ms: u64) -> FanOutOptions {
        FanOutOptions {
            concurrency: 4,
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[tokio::test]
    async fn outcomes_keep_input_order_and_identity() {
        let units: Vec<(&str, Unit)> = vec![
            ("slow", Box::pin(async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(1)
            })),
            ("failing", Box::pin(async { Err("boom".to_string()) })),
            ("fast", Box::pin(async { Ok(3) })),
        ];

        let results = fan_out(units, options(1_000)).await;
        let keys: Vec<_> = results.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, ["slow", "failing", "fast"]);
        assert!(matches!(results[0].1, UnitOutcome::Ok(1)));
        assert!(matches!(&results[1].1, UnitOutcome::Failed(e) if e == "boom"));
        assert!(matches!(results[2].1, UnitOutcome::Ok(3)));
    }

    #[tokio::test]
    async fn timed_out_unit_is_cancelled() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let units: Vec<(&str, Unit)> = vec![
            ("hang", Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(0)
            })),
            ("ok", Box::pin(async { Ok(1) })),
        ];

        let results = fan_out(units, options(20)).await;
        assert!(matches!(results[0].1, UnitOutcome::TimedOut(_)));
        assert!(results[1].1.is_ok());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    fn explode() -> Result<u32, String> {
        panic!("provider exploded")
    }

    #[tokio::test]
    async fn panic_is_captured_per_unit() {
        let units: Vec<(u8, Unit)> = vec![
            (0, Box::pin(async { explode() })),
            (1, Box::pin(async { Ok(7) })),
        ];
        let results = fan_out(units, options(1_000)).await;
        assert!(matches!(&results[0].1, UnitOutcome::Panicked(m) if m.contains("exploded")));
        assert!(matches!(results[1].1, UnitOutcome::Ok(7)));
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let units: Vec<(usize, Unit)> = (0..6)
            .map(|i| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                let unit: Unit = Box::pin(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(0)
                });
                (i, unit)
            })
            .collect();

        let opts = FanOutOptions {
            concurrency: 2,
            timeout: Duration::from_secs(1),
        };
        let results = fan_out(units, opts).await;
        assert_eq!(results.len(), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
