//! Per-transfer progress records with a throttled update cadence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Snapshot of one running transfer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub task_id: String,
    pub filename: String,
    pub total_bytes: u64,
    pub bytes_transferred: u64,
    pub percent: f64,
    /// Bytes per second over the last update interval.
    pub speed_bps: f64,
    pub eta_secs: Option<f64>,
    pub started_at: DateTime<Utc>,
}

struct Tracked {
    record: ProgressRecord,
    last_update: Instant,
    last_bytes: u64,
}

pub struct ProgressTracker {
    throttle: Duration,
    active: Mutex<HashMap<String, Tracked>>,
}

impl ProgressTracker {
    pub fn new(throttle: Duration) -> Self {
        Self {
            throttle,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn begin(&self, task_id: &str, filename: &str, total_bytes: u64) {
        let record = ProgressRecord {
            task_id: task_id.to_string(),
            filename: filename.to_string(),
            total_bytes,
            bytes_transferred: 0,
            percent: 0.0,
            speed_bps: 0.0,
            eta_secs: None,
            started_at: Utc::now(),
        };
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                task_id.to_string(),
                Tracked {
                    record,
                    last_update: Instant::now(),
                    last_bytes: 0,
                },
            );
    }

    /// Apply a progress tick. Returns `false` when throttled away.
    ///
    /// The final tick (everything transferred) is never throttled.
    pub fn update(&self, task_id: &str, transferred: u64, total: Option<u64>) -> bool {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        let Some(t) = active.get_mut(task_id) else {
            return false;
        };
        if let Some(total) = total {
            t.record.total_bytes = total;
        }
        let complete = t.record.total_bytes > 0 && transferred >= t.record.total_bytes;
        let elapsed = t.last_update.elapsed();
        if elapsed < self.throttle && !complete {
            return false;
        }

        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            t.record.speed_bps = transferred.saturating_sub(t.last_bytes) as f64 / secs;
        }
        t.record.bytes_transferred = transferred;
        t.record.percent = if t.record.total_bytes > 0 {
            (transferred as f64 / t.record.total_bytes as f64 * 100.0).min(100.0)
        } else {
            0.0
        };
        let remaining = t.record.total_bytes.saturating_sub(transferred);
        t.record.eta_secs = if t.record.speed_bps > 0.0 {
            Some(remaining as f64 / t.record.speed_bps)
        } else {
            None
        };
        t.last_update = Instant::now();
        t.last_bytes = transferred;
        true
    }

    pub fn finish(&self, task_id: &str) -> Option<ProgressRecord> {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(task_id)
            .map(|t| t.record)
    }

    pub fn get(&self, task_id: &str) -> Option<ProgressRecord> {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_id)
            .map(|t| t.record.clone())
    }

    /// All running transfers, oldest first.
    pub fn snapshot(&self) -> Vec<ProgressRecord> {
        let mut out: Vec<ProgressRecord> = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|t| t.record.clone())
            .collect();
        out.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        out
    }

    pub fn clear(&self) {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn updates_are_throttled_but_completion_is_not() {
        let tracker = ProgressTracker::new(Duration::from_secs(60));
        tracker.begin("t1", "a.bin", 100);
        assert!(!tracker.update("t1", 10, Some(100)));
        assert_eq!(tracker.get("t1").unwrap().bytes_transferred, 0);

        assert!(tracker.update("t1", 100, Some(100)));
        let rec = tracker.get("t1").unwrap();
        assert_eq!(rec.bytes_transferred, 100);
        assert_eq!(rec.percent, 100.0);
    }

    #[test]
    fn unthrottled_tracker_reports_every_tick() {
        let tracker = ProgressTracker::new(Duration::ZERO);
        tracker.begin("t1", "a.bin", 0);
        assert!(tracker.update("t1", 50, Some(200)));
        let rec = tracker.get("t1").unwrap();
        assert_eq!(rec.total_bytes, 200);
        assert_eq!(rec.percent, 25.0);
    }

    #[test]
    fn finish_removes_the_record() {
        let tracker = ProgressTracker::new(Duration::ZERO);
        tracker.begin("t1", "a", 1);
        tracker.begin("t2", "b", 1);
        assert_eq!(tracker.snapshot().len(), 2);
        assert!(tracker.finish("t1").is_some());
        assert!(tracker.get("t1").is_none());
        assert!(!tracker.update("t1", 1, None));
        assert_eq!(tracker.snapshot().len(), 1);
    }
}
