//! Report queue collaborator.
//!
//! Reports that could not be delivered immediately (manifests, download
//! and installation reports) are handed to a queue that owns retry.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde_json::Value;

pub trait ReportQueue: Send + Sync {
    fn enqueue(&self, report: Value);
}

/// In-process queue. Holds at most `capacity` reports, dropping the oldest.
#[derive(Debug)]
pub struct MemoryReportQueue {
    reports: Mutex<VecDeque<Value>>,
    capacity: usize,
}

impl MemoryReportQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            reports: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.reports.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.lock().is_empty()
    }

    /// Take every queued report, oldest first.
    pub fn drain(&self) -> Vec<Value> {
        self.reports.lock().drain(..).collect()
    }
}

impl Default for MemoryReportQueue {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ReportQueue for MemoryReportQueue {
    fn enqueue(&self, report: Value) {
        let mut reports = self.reports.lock();
        if reports.len() >= self.capacity {
            reports.pop_front();
            log::warn!("REPORT_QUEUE_FULL capacity={} dropped=oldest", self.capacity);
        }
        reports.push_back(report);
    }
}
