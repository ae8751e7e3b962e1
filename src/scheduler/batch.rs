/// Batch gating policy: at most one batch job per scan, a minimum interval
/// between batch starts, and a load-average ceiling.
#[derive(Debug)]
pub struct BatchPolicy {
    interval: u32,
    load_threshold: f64,
    next_batch: Option<i64>,
}

impl BatchPolicy {
    pub fn new(interval: u32, load_threshold: f64) -> Self {
        Self {
            interval,
            load_threshold,
            next_batch: None,
        }
    }

    /// Decide whether the scan's batch candidate may start now.
    ///
    /// The throttle is consumed whenever it has elapsed and a candidate
    /// exists, even if the load then vetoes the start; the candidate is
    /// retried once the new interval elapses.
    pub fn try_start(&mut self, now: i64, sample: impl FnOnce() -> f64) -> bool {
        let next_batch = *self.next_batch.get_or_insert(now);
        if next_batch > now {
            return false;
        }
        self.next_batch = Some(now + i64::from(self.interval));
        let load = sample();
        if load < self.load_threshold {
            true
        } else {
            tracing::info!(
                load,
                threshold = self.load_threshold,
                "Deferring batch job, load too high"
            );
            false
        }
    }

    /// Earliest time the next batch job may start. `None` before the first
    /// scan has initialized the throttle.
    pub fn next_batch(&self) -> Option<i64> {
        self.next_batch
    }
}

/// Nice increment for a job's shell, derived from its queue letter:
/// `a` gets 2, `b` gets 4, and so on. Case-insensitive.
pub fn nice_increment(queue: char) -> libc::c_int {
    (queue.to_ascii_lowercase() as libc::c_int - 'a' as libc::c_int + 1) * 2
}

/// Sample the 1-minute load average. Fewer than one reported sample counts
/// as an idle machine.
pub fn sample_load() -> f64 {
    let mut avg = [0f64; 1];
    // SAFETY: avg points at one writable double.
    let samples = unsafe { libc::getloadavg(avg.as_mut_ptr(), 1) };
    if samples < 1 {
        0.0
    } else {
        avg[0]
    }
}
