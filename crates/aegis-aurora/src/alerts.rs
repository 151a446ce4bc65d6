//! Bounded history of published alerts.
//!
//! Every `ALERT` that leaves the monitor is kept here with an id so an
//! operator can acknowledge it later. The oldest records fall off once
//! `alert_history_size` is reached.

use aegis_core::Severity;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, info};
use uuid::Uuid;

use crate::detector::Alert;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: Uuid,
    #[serde(flatten)]
    pub alert: Alert,
    pub raised_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,
}

impl AlertRecord {
    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged_at.is_some()
    }
}

/// Counts over the retained history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertSummary {
    pub total: usize,
    pub unacknowledged: usize,
    pub last_24_hours: usize,
    pub by_severity: BTreeMap<String, usize>,
    pub by_metric: BTreeMap<String, usize>,
}

pub struct AlertLog {
    records: Mutex<VecDeque<AlertRecord>>,
    capacity: Mutex<usize>,
}

impl AlertLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            capacity: Mutex::new(capacity.max(1)),
        }
    }

    pub fn set_capacity(&self, capacity: usize) {
        let capacity = capacity.max(1);
        *self.capacity.lock() = capacity;
        let mut records = self.records.lock();
        while records.len() > capacity {
            records.pop_front();
        }
    }

    pub fn record(&self, alert: Alert) -> Uuid {
        self.record_at(alert, Utc::now())
    }

    pub fn record_at(&self, alert: Alert, now: DateTime<Utc>) -> Uuid {
        let id = Uuid::new_v4();
        let capacity = *self.capacity.lock();
        let mut records = self.records.lock();
        records.push_back(AlertRecord {
            id,
            alert,
            raised_at: now,
            acknowledged_at: None,
            acknowledged_by: None,
        });
        while records.len() > capacity {
            if let Some(dropped) = records.pop_front() {
                debug!(alert_id = %dropped.id, "alert history full, dropping oldest");
            }
        }
        id
    }

    /// Mark an alert as seen. False when it is unknown or already acknowledged.
    pub fn acknowledge(&self, id: Uuid, by: &str) -> bool {
        self.acknowledge_at(id, by, Utc::now())
    }

    pub fn acknowledge_at(&self, id: Uuid, by: &str, now: DateTime<Utc>) -> bool {
        let mut records = self.records.lock();
        let Some(record) = records.iter_mut().find(|r| r.id == id) else {
            return false;
        };
        if record.is_acknowledged() {
            return false;
        }
        record.acknowledged_at = Some(now);
        record.acknowledged_by = Some(by.to_string());
        info!(alert_id = %id, by, metric = %record.alert.metric, "alert acknowledged");
        true
    }

    /// Newest `limit` records at or above `min_severity`, oldest first.
    pub fn history(&self, limit: usize, min_severity: Option<Severity>) -> Vec<AlertRecord> {
        let records = self.records.lock();
        let matching: Vec<&AlertRecord> = records
            .iter()
            .filter(|r| min_severity.is_none_or(|min| r.alert.severity >= min))
            .collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).cloned().collect()
    }

    pub fn unacknowledged(&self) -> Vec<AlertRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| !r.is_acknowledged())
            .cloned()
            .collect()
    }

    pub fn summary(&self) -> AlertSummary {
        self.summary_at(Utc::now())
    }

    pub fn summary_at(&self, now: DateTime<Utc>) -> AlertSummary {
        let cutoff = now - Duration::hours(24);
        let records = self.records.lock();
        let mut summary = AlertSummary {
            total: records.len(),
            ..AlertSummary::default()
        };
        for record in records.iter() {
            if !record.is_acknowledged() {
                summary.unacknowledged += 1;
            }
            if record.raised_at >= cutoff {
                summary.last_24_hours += 1;
            }
            *summary
                .by_severity
                .entry(record.alert.severity.to_string())
                .or_default() += 1;
            *summary
                .by_metric
                .entry(record.alert.metric.clone())
                .or_default() += 1;
        }
        summary
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}
