use std::time::Duration;

/// Deadline-ordered queue of deferred work, drained by the owner's tick.
#[derive(Debug)]
pub struct TimerQueue<T> {
    entries: Vec<(Duration, u64, T)>,
    sequence: u64,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            sequence: 0,
        }
    }
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, due: Duration, item: T) {
        self.sequence += 1;
        self.entries.push((due, self.sequence, item));
    }

    /// Removes and returns every item due at `now`, earliest first, ties in
    /// scheduling order.
    pub fn drain_due(&mut self, now: Duration) -> Vec<T> {
        let mut due = Vec::new();
        let mut pending = Vec::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if entry.0 <= now {
                due.push(entry);
            } else {
                pending.push(entry);
            }
        }
        self.entries = pending;
        due.sort_by_key(|(at, seq, _)| (*at, *seq));
        due.into_iter().map(|(_, _, item)| item).collect()
    }

    pub fn next_due(&self) -> Option<Duration> {
        self.entries.iter().map(|(at, _, _)| *at).min()
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) {
        self.entries.retain(|(_, _, item)| keep(item));
    }

    pub fn contains(&self, mut matches: impl FnMut(&T) -> bool) -> bool {
        self.entries.iter().any(|(_, _, item)| matches(item))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    FireNow,
    Deferred { due: Duration },
    AlreadyScheduled,
}

/// Leading-edge throttle with one trailing call. Whatever state exists when
/// the trailing call fires is what gets drawn.
#[derive(Debug, Clone)]
pub struct Throttle {
    interval: Duration,
    last_fired: Option<Duration>,
    trailing: Option<Duration>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_fired: None,
            trailing: None,
        }
    }

    pub fn request(&mut self, now: Duration) -> ThrottleDecision {
        if self.trailing.is_some() {
            return ThrottleDecision::AlreadyScheduled;
        }
        match self.last_fired {
            Some(last) if now < last + self.interval => {
                let due = last + self.interval;
                self.trailing = Some(due);
                ThrottleDecision::Deferred { due }
            }
            _ => {
                self.last_fired = Some(now);
                ThrottleDecision::FireNow
            }
        }
    }

    /// True once, when the trailing call is due.
    pub fn poll(&mut self, now: Duration) -> bool {
        match self.trailing {
            Some(due) if now >= due => {
                self.trailing = None;
                self.last_fired = Some(now);
                true
            }
            _ => false,
        }
    }

    pub fn next_due(&self) -> Option<Duration> {
        self.trailing
    }

    pub fn cancel(&mut self) {
        self.trailing = None;
    }
}
