use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

/// Metrics collector, if active, it provides Counters and Timers
#[derive(Clone)]
pub struct Metrics {
    metrics: Option<Arc<ActiveMetrics>>,
}

/// Metrics that can be collected during execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    /// Counter of pages copied out of the store for reading
    PageReads,
    /// Counter of pages locked and copied for writing
    PageWrites,
    /// Counter of pages appended to files
    PageAllocations,
    /// Counter of committed atomic operations
    Commits,
    /// Counter of atomic operations dropped without a commit
    Rollbacks,
    /// Timer used to record average commit time
    CommitTime,
}

struct ActiveMetrics {
    page_reads: AtomicU64,
    page_writes: AtomicU64,
    page_allocations: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    commit_time: Timer,
}

impl Metrics {
    /// Returns the Metrics object, active or not based on the specified input
    pub fn new(active: bool) -> Self {
        Self {
            metrics: if active {
                Some(Arc::new(ActiveMetrics {
                    page_reads: AtomicU64::new(0),
                    page_writes: AtomicU64::new(0),
                    page_allocations: AtomicU64::new(0),
                    commits: AtomicU64::new(0),
                    rollbacks: AtomicU64::new(0),
                    commit_time: Timer::new(),
                }))
            } else {
                None
            },
        }
    }

    fn counter(metrics: &ActiveMetrics, metric: Metric) -> &AtomicU64 {
        match metric {
            Metric::PageReads => &metrics.page_reads,
            Metric::PageWrites => &metrics.page_writes,
            Metric::PageAllocations => &metrics.page_allocations,
            Metric::Commits => &metrics.commits,
            Metric::Rollbacks => &metrics.rollbacks,
            Metric::CommitTime => panic!("Specified metric is not a Counter"),
        }
    }

    /// Increase the Counter specified by the input
    ///
    /// panics if the specified [`Metric`] is not a Counter
    pub fn count(&self, metric: Metric) {
        if let Some(ref metrics) = self.metrics {
            Self::counter(metrics, metric).fetch_add(1, Ordering::Relaxed);
        }
    }

    /// The current value of a Counter, `None` if collection is not active.
    ///
    /// panics if the specified [`Metric`] is not a Counter
    pub fn get(&self, metric: Metric) -> Option<u64> {
        self.metrics
            .as_ref()
            .map(|metrics| Self::counter(metrics, metric).load(Ordering::Relaxed))
    }

    /// Returns a guard that, when dropped, will record the time passed since creation
    ///
    /// panics if the specified [`Metric`] is not a Timer
    pub fn record<'a>(&'a self, metric: Metric) -> Option<impl Drop + 'a> {
        self.metrics.as_ref().map(|metrics| {
            let timer = match metric {
                Metric::CommitTime => &metrics.commit_time,
                _ => panic!("Specified metric is not a Timer"),
            };

            timer.record()
        })
    }

    /// Print collected metrics to stdout
    pub fn print(&self) {
        if let Some(ref metrics) = self.metrics {
            println!("metrics");

            let page_reads = metrics.page_reads.load(Ordering::Relaxed);
            println!("  page reads            {}", page_reads);

            let page_writes = metrics.page_writes.load(Ordering::Relaxed);
            println!("  page writes           {}", page_writes);

            let page_allocations = metrics.page_allocations.load(Ordering::Relaxed);
            println!("  page allocations      {}", page_allocations);

            let commits = metrics.commits.load(Ordering::Relaxed);
            let rollbacks = metrics.rollbacks.load(Ordering::Relaxed);
            println!("  commits               {}", commits);

            if commits + rollbacks != 0 {
                let percentage_rollbacks =
                    (rollbacks as f64 / (commits + rollbacks) as f64) * 100.0;

                println!(
                    "  rollbacks             {} - {:.2}% of operations",
                    rollbacks, percentage_rollbacks
                );
            }

            if let Some(mean) = metrics.commit_time.mean() {
                println!("  commit mean           {}", pretty_display_ns(mean));
            }
        } else {
            println!("Metrics collection was not activated")
        }
    }
}

fn pretty_display_ns(ns: u64) -> String {
    // preserve 3 sig figs at minimum.
    let (val, unit) = if ns > 100 * 1_000_000_000 {
        (ns / 1_000_000_000, "s")
    } else if ns > 100 * 1_000_000 {
        (ns / 1_000_000, "ms")
    } else if ns > 100 * 1_000 {
        (ns / 1_000, "us")
    } else {
        (ns, "ns")
    };

    format!("{val} {unit}")
}

struct Timer {
    number_of_records: AtomicU64,
    sum: AtomicU64,
}

impl Timer {
    fn new() -> Self {
        Timer {
            number_of_records: AtomicU64::new(0),
            sum: AtomicU64::new(0),
        }
    }

    fn mean(&self) -> Option<u64> {
        let n = self.number_of_records.load(Ordering::Relaxed);
        let sum = self.sum.load(Ordering::Relaxed);
        sum.checked_div(n)
    }

    fn record<'a>(&'a self) -> impl Drop + 'a {
        struct TimerGuard<'a> {
            start: std::time::Instant,
            n: &'a AtomicU64,
            sum: &'a AtomicU64,
        }

        impl Drop for TimerGuard<'_> {
            fn drop(&mut self) {
                let elapsed = self.start.elapsed().as_nanos() as u64;
                self.n.fetch_add(1, Ordering::Relaxed);
                self.sum.fetch_add(elapsed, Ordering::Relaxed);
            }
        }

        TimerGuard {
            start: std::time::Instant::now(),
            n: &self.number_of_records,
            sum: &self.sum,
        }
    }
}
