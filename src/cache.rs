use crate::types::SeriesKey;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// How a caller got through [`ComputationCache::get_or_compute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// True when another caller held the series and this one waited for it.
    pub waited: bool,
}

#[derive(Debug, Default)]
struct Flight {
    finished: Mutex<bool>,
    done: Condvar,
}

impl Flight {
    fn finish(&self) {
        *self.finished.lock() = true;
        self.done.notify_all();
    }

    fn wait(&self) {
        let mut finished = self.finished.lock();
        while !*finished {
            self.done.wait(&mut finished);
        }
    }
}

/// Single-flight gate over output series. At most one caller evaluates a
/// given [`SeriesKey`] at a time; other callers for the same series block on
/// that flight alone and then run against whatever it persisted. Completed
/// values are not kept here: the result store holds them.
#[derive(Debug, Default)]
pub struct ComputationCache {
    flights: Mutex<HashMap<SeriesKey, Arc<Flight>>>,
    executions: AtomicU64,
}

/// Removes the flight and wakes waiters however the owner leaves, unwinding included.
struct FlightGuard<'a> {
    cache: &'a ComputationCache,
    series: &'a SeriesKey,
    flight: Arc<Flight>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        {
            let mut flights = self.cache.flights.lock();
            if flights
                .get(self.series)
                .is_some_and(|current| Arc::ptr_eq(current, &self.flight))
            {
                flights.remove(self.series);
            }
        }
        self.flight.finish();
    }
}

impl ComputationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `compute` as the only in-flight computation of `series`. A caller
    /// that finds the series in flight waits for it to finish, then takes its
    /// own turn; `compute` is expected to skip keys already materialized.
    pub fn get_or_compute<F, T>(&self, series: &SeriesKey, compute: F) -> T
    where
        F: FnOnce(Admission) -> T,
    {
        let mut waited = false;
        loop {
            let in_flight = {
                let mut flights = self.flights.lock();
                match flights.get(series) {
                    Some(flight) => Arc::clone(flight),
                    None => {
                        let flight = Arc::new(Flight::default());
                        flights.insert(series.clone(), Arc::clone(&flight));
                        drop(flights);
                        let _guard = FlightGuard {
                            cache: self,
                            series,
                            flight,
                        };
                        return compute(Admission { waited });
                    }
                }
            };
            in_flight.wait();
            waited = true;
        }
    }

    /// Adds to the number of bars evaluated under this cache's flights.
    pub fn record_executions(&self, bars: u64) {
        self.executions.fetch_add(bars, Ordering::Relaxed);
    }

    /// Bars evaluated under this cache's flights since creation.
    pub fn execution_count(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    /// Series currently being computed.
    pub fn in_flight(&self) -> usize {
        self.flights.lock().len()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ParamHash, Timeframe};
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    fn series(indicator: &str) -> SeriesKey {
        SeriesKey {
            symbol: Arc::from("BTCUSDT"),
            timeframe: "1m".parse::<Timeframe>().expect("timeframe"),
            indicator: Arc::from(indicator),
            version: 1,
            params: ParamHash(7),
        }
    }

    #[test]
    fn owner_runs_without_waiting_and_leaves_nothing_behind() {
        let cache = ComputationCache::new();
        let admission = cache.get_or_compute(&series("sma5"), |admission| {
            assert_eq!(cache.in_flight(), 1);
            admission
        });
        assert!(!admission.waited);
        assert!(cache.is_idle());
    }

    #[test]
    fn concurrent_callers_take_turns_over_shared_results() {
        let cache = Arc::new(ComputationCache::new());
        let materialized = Arc::new(Mutex::new(HashSet::new()));
        let evaluated = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let materialized = Arc::clone(&materialized);
                let evaluated = Arc::clone(&evaluated);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cache.get_or_compute(&series("sma5"), |_| {
                        let missing: Vec<i64> = (0..10)
                            .filter(|ts| !materialized.lock().contains(ts))
                            .collect();
                        thread::sleep(Duration::from_millis(5));
                        evaluated.fetch_add(missing.len(), Ordering::SeqCst);
                        materialized.lock().extend(missing);
                    })
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread");
        }
        assert_eq!(evaluated.load(Ordering::SeqCst), 10);
        assert!(cache.is_idle());
    }

    #[test]
    fn distinct_series_do_not_block_each_other() {
        let cache = ComputationCache::new();
        let inner = cache.get_or_compute(&series("a"), |_| {
            cache.get_or_compute(&series("b"), |admission| admission.waited)
        });
        assert!(!inner);
    }

    #[test]
    fn panicking_owner_releases_waiters() {
        let cache = Arc::new(ComputationCache::new());
        let started = Arc::new(Barrier::new(2));
        let owner = {
            let cache = Arc::clone(&cache);
            let started = Arc::clone(&started);
            thread::spawn(move || {
                cache.get_or_compute(&series("sma5"), |_| {
                    started.wait();
                    thread::sleep(Duration::from_millis(20));
                    panic!("kernel blew up")
                })
            })
        };
        started.wait();
        let admission = cache.get_or_compute(&series("sma5"), |admission| admission);
        assert!(admission.waited);
        assert!(owner.join().is_err());
        assert!(cache.is_idle());
    }

    #[test]
    fn executions_accumulate() {
        let cache = ComputationCache::new();
        cache.record_executions(4);
        cache.record_executions(6);
        assert_eq!(cache.execution_count(), 10);
    }
}
