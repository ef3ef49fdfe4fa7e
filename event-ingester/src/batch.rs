use std::time::Duration;

use tokio::time::Instant;

/// Processed items accepted since the last flush, in arrival order.
///
/// The accumulator only knows about counts and age; what an item is and
/// where it came from is the consumer's business.
#[derive(Debug)]
pub struct BatchAccumulator<T> {
    items: Vec<T>,
    opened_at: Option<Instant>,
}

impl<T> Default for BatchAccumulator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> BatchAccumulator<T> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            opened_at: None,
        }
    }

    pub fn add(&mut self, item: T, now: Instant) {
        if self.items.is_empty() {
            self.opened_at = Some(now);
        }
        self.items.push(item);
    }

    pub fn should_flush(&self, now: Instant, max_size: usize, max_time: Duration) -> bool {
        if self.items.len() >= max_size {
            return true;
        }
        match self.opened_at {
            Some(opened_at) if !self.items.is_empty() => {
                now.saturating_duration_since(opened_at) >= max_time
            }
            _ => false,
        }
    }

    /// Take everything buffered so far, leaving the accumulator empty.
    pub fn drain(&mut self) -> Vec<T> {
        self.opened_at = None;
        std::mem::take(&mut self.items)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn opened_at(&self) -> Option<Instant> {
        self.opened_at
    }
}
