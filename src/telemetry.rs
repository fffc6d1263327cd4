//! Bounded time-series of characteristic values fed by subscription listeners

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub value: Vec<u8>,
}

/// Keeps the last `capacity` samples; the oldest is evicted first.
#[derive(Debug, Clone)]
pub struct TelemetryBuffer {
    capacity: usize,
    samples: VecDeque<Sample>,
}

impl TelemetryBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, value: Vec<u8>) {
        self.push_at(Utc::now(), value);
    }

    pub fn push_at(&mut self, timestamp: DateTime<Utc>, value: Vec<u8>) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(Sample { timestamp, value });
    }

    pub fn latest(&self) -> Option<&Sample> {
        self.samples.back()
    }

    pub fn samples(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}
