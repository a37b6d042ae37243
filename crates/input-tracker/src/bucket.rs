use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Active seconds counted within one bucket (one wall-clock minute by default).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivitySample {
    pub start: DateTime<Utc>,
    pub active_seconds: u32,
}

/// Raw input counter plus the bucket currently being filled.
///
/// `notify` only touches the atomic. `sample`, `drain`, `roll` and
/// `take_partial` all run under the bucket lock, so a completed bucket is
/// handed off exactly once and never incremented afterwards.
///
/// A sampler tick fires on a boundary and drains the interval that just
/// ended, so its active second belongs to the bucket containing
/// `tick - sample_interval`, not the bucket containing `tick`.
#[derive(Debug)]
pub struct ActivityCounter {
    raw: AtomicU32,
    current: Mutex<Option<ActivitySample>>,
    /// Start of the newest bucket already handed off; never reopened.
    closed_through: AtomicI64,
    span_ms: i64,
    sample_ms: i64,
    capacity: u32,
}

impl ActivityCounter {
    pub fn new(bucket_span: Duration, sample_interval: Duration, capacity: u32) -> Self {
        Self {
            raw: AtomicU32::new(0),
            current: Mutex::new(None),
            closed_through: AtomicI64::new(i64::MIN),
            span_ms: millis(bucket_span),
            sample_ms: millis(sample_interval),
            capacity,
        }
    }

    pub fn notify(&self) {
        self.raw.fetch_add(1, Ordering::Relaxed);
    }

    /// Sampler tick on boundary `tick`. Returns true when the interval ending
    /// at `tick` counted as an active second. A bucket left over from an
    /// earlier span is handed off before the new one is opened.
    pub fn sample(&self, tick: DateTime<Utc>, handoff: impl FnOnce(ActivitySample)) -> bool {
        self.count(self.sampled_instant(tick), handoff)
    }

    /// Counts input seen since the last tick toward the bucket containing
    /// `now`. Used once at shutdown, after the sampler has stopped.
    pub fn drain(&self, now: DateTime<Utc>, handoff: impl FnOnce(ActivitySample)) -> bool {
        self.count(now, handoff)
    }

    /// Roller tick on `tick`. Closes the current bucket only once the sampler
    /// tick on the same boundary can no longer write to it.
    pub fn roll(&self, tick: DateTime<Utc>, handoff: impl FnOnce(ActivitySample)) -> bool {
        let mut current = self.lock();
        let open_from = self.bucket_start(self.sampled_instant(tick));
        let expired = current
            .as_ref()
            .map(|bucket| bucket.start < open_from)
            .unwrap_or(false);
        if !expired {
            return false;
        }

        match current.take() {
            Some(completed) if completed.active_seconds > 0 => {
                self.mark_closed(completed.start);
                handoff(completed);
                true
            }
            _ => false,
        }
    }

    /// Removes the in-progress bucket, if it saw any activity.
    pub fn take_partial(&self) -> Option<ActivitySample> {
        self.lock()
            .take()
            .filter(|bucket| bucket.active_seconds > 0)
    }

    pub fn current(&self) -> Option<ActivitySample> {
        *self.lock()
    }

    pub fn bucket_start(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let floored = at.timestamp_millis().div_euclid(self.span_ms) * self.span_ms;
        DateTime::from_timestamp_millis(floored).unwrap_or(at)
    }

    fn sampled_instant(&self, tick: DateTime<Utc>) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(tick.timestamp_millis().saturating_sub(self.sample_ms))
            .unwrap_or(tick)
    }

    fn count(&self, covered: DateTime<Utc>, handoff: impl FnOnce(ActivitySample)) -> bool {
        let mut current = self.lock();
        if self.raw.swap(0, Ordering::AcqRel) == 0 {
            return false;
        }

        let mut start = self.bucket_start(covered);
        let closed = self.closed_through.load(Ordering::Acquire);
        if start.timestamp_millis() <= closed {
            // A late tick for a bucket the roller already handed off.
            start = DateTime::from_timestamp_millis(closed.saturating_add(self.span_ms))
                .unwrap_or(start);
        }
        match current.as_mut() {
            Some(bucket) if bucket.start == start => {
                bucket.active_seconds = bucket.active_seconds.saturating_add(1).min(self.capacity);
            }
            _ => {
                let fresh = ActivitySample {
                    start,
                    active_seconds: 1u32.min(self.capacity),
                };
                if let Some(stale) = current.replace(fresh) {
                    if stale.active_seconds > 0 {
                        self.mark_closed(stale.start);
                        handoff(stale);
                    }
                }
            }
        }
        true
    }

    fn mark_closed(&self, start: DateTime<Utc>) {
        self.closed_through
            .fetch_max(start.timestamp_millis(), Ordering::AcqRel);
    }

    fn lock(&self) -> MutexGuard<'_, Option<ActivitySample>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, s).unwrap()
    }

    fn minute_counter() -> ActivityCounter {
        ActivityCounter::new(Duration::from_secs(60), Duration::from_secs(1), 60)
    }

    /// Replays the tracker's schedule over `[from, to)`: `active(t)` notifies
    /// during the second starting at `t`, the sampler ticks on the boundary
    /// `t + 1s` that ends it, and the roller ticks one second after each
    /// minute boundary.
    fn drive(
        counter: &ActivityCounter,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        active: impl Fn(DateTime<Utc>) -> u32,
        out: &mut Vec<ActivitySample>,
    ) {
        let mut t = from;
        while t < to {
            for _ in 0..active(t) {
                counter.notify();
            }
            let tick = t + chrono::Duration::seconds(1);
            counter.sample(tick, |bucket| out.push(bucket));
            if t.timestamp().rem_euclid(60) == 0 {
                counter.roll(tick, |bucket| out.push(bucket));
            }
            t = tick;
        }
    }

    #[test]
    fn multiple_notifies_in_one_second_count_once() {
        let counter = minute_counter();
        for _ in 0..25 {
            counter.notify();
        }
        assert!(counter.sample(at(9, 0, 1), |_| panic!("nothing to hand off")));
        assert_eq!(counter.current().map(|b| b.active_seconds), Some(1));
        assert!(!counter.sample(at(9, 0, 2), |_| panic!("nothing to hand off")));
        assert_eq!(counter.current().map(|b| b.active_seconds), Some(1));
    }

    #[test]
    fn idle_minute_produces_nothing() {
        let counter = minute_counter();
        let mut out = Vec::new();
        drive(&counter, at(12, 0, 0), at(12, 2, 0), |_| 0, &mut out);
        assert!(!counter.roll(at(12, 2, 1), |bucket| out.push(bucket)));
        assert!(out.is_empty());
        assert_eq!(counter.take_partial(), None);
    }

    #[test]
    fn partial_minute_with_two_active_seconds() {
        let counter = minute_counter();
        let mut out = Vec::new();
        let clicks = |t: DateTime<Utc>| {
            if t == at(12, 0, 5) {
                2
            } else if t == at(12, 0, 40) {
                1
            } else {
                0
            }
        };
        drive(&counter, at(12, 0, 0), at(12, 0, 50), clicks, &mut out);

        assert!(out.is_empty());
        let partial = counter.take_partial().unwrap();
        assert_eq!(partial.start, at(12, 0, 0));
        assert_eq!(partial.active_seconds, 2);
        assert_eq!(counter.take_partial(), None);
    }

    #[test]
    fn continuous_input_fills_both_minutes() {
        let counter = minute_counter();
        let mut out = Vec::new();
        drive(&counter, at(12, 0, 0), at(12, 2, 0), |_| 1, &mut out);
        assert!(counter.roll(at(12, 2, 1), |bucket| out.push(bucket)));

        assert_eq!(
            out,
            vec![
                ActivitySample {
                    start: at(12, 0, 0),
                    active_seconds: 60
                },
                ActivitySample {
                    start: at(12, 1, 0),
                    active_seconds: 60
                },
            ]
        );
    }

    #[test]
    fn count_is_capped_even_with_extra_ticks() {
        let counter = minute_counter();
        for i in 0..200 {
            counter.notify();
            counter.sample(at(8, 30, 1) + chrono::Duration::milliseconds(i * 100), |_| {});
        }
        assert_eq!(counter.current().map(|b| b.active_seconds), Some(60));
    }

    #[test]
    fn sampler_hands_off_stale_bucket_when_roll_is_late() {
        let counter = minute_counter();
        let mut out = Vec::new();
        counter.notify();
        counter.sample(at(10, 0, 59), |bucket| out.push(bucket));
        counter.notify();
        counter.sample(at(10, 1, 2), |bucket| out.push(bucket));

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].start, at(10, 0, 0));
        assert_eq!(out[0].active_seconds, 1);
        assert_eq!(counter.current().map(|b| b.start), Some(at(10, 1, 0)));
        assert!(!counter.roll(at(10, 1, 30), |bucket| out.push(bucket)));
    }

    #[test]
    fn last_second_of_a_minute_stays_in_that_minute() {
        let counter = minute_counter();
        let mut out = Vec::new();
        counter.notify();
        assert!(counter.sample(at(12, 1, 0), |bucket| out.push(bucket)));
        assert_eq!(counter.current().map(|b| b.start), Some(at(12, 0, 0)));

        // A roller tick on the same boundary must leave the bucket open.
        assert!(!counter.roll(at(12, 1, 0), |bucket| out.push(bucket)));
        assert!(out.is_empty());

        assert!(counter.roll(at(12, 1, 1), |bucket| out.push(bucket)));
        assert_eq!(
            out,
            vec![ActivitySample {
                start: at(12, 0, 0),
                active_seconds: 1
            }]
        );
    }

    #[test]
    fn drain_counts_toward_the_current_bucket() {
        let counter = minute_counter();
        counter.notify();
        assert!(counter.drain(at(12, 1, 0), |_| panic!("nothing to hand off")));
        assert_eq!(counter.current().map(|b| b.start), Some(at(12, 1, 0)));
        assert!(!counter.drain(at(12, 1, 0), |_| panic!("nothing to hand off")));
    }

    #[test]
    fn late_tick_never_reopens_a_closed_bucket() {
        let counter = minute_counter();
        let mut out = Vec::new();
        counter.notify();
        counter.sample(at(12, 0, 30), |bucket| out.push(bucket));
        assert!(counter.roll(at(12, 1, 1), |bucket| out.push(bucket)));

        // The tick on 12:01:00 runs after the roller closed 12:00.
        counter.notify();
        assert!(counter.sample(at(12, 1, 0), |bucket| out.push(bucket)));
        assert_eq!(counter.current().map(|b| b.start), Some(at(12, 1, 0)));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].start, at(12, 0, 0));
    }
}
