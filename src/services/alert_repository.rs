//! Alert persistence boundary
//!
//! Enforces the uniqueness rule: at most one unresolved alert per
//! (trip, corridor, type). `insert_unique` is the atomic check-then-create.

use crate::domain::types::{Alert, AlertKey};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;

/// Resolved alerts kept for inspection; older ones are only counted
const RESOLVED_HISTORY: usize = 256;

/// Storage collaborator for alerts
pub trait AlertRepository: Send + Sync {
    /// Unresolved alert for the key, if any
    fn find_unresolved(&self, key: &AlertKey) -> Option<Alert>;

    /// Store `alert` unless an unresolved alert with the same key exists.
    /// Returns false when suppressed.
    fn insert_unique(&self, alert: Alert) -> bool;

    /// Mark an alert resolved; returns false if no unresolved alert has the id
    fn resolve(&self, alert_id: &str) -> bool;

    /// All unresolved alerts
    fn unresolved(&self) -> Vec<Alert>;
}

#[derive(Default)]
struct AlertTables {
    open: FxHashMap<AlertKey, Alert>,
    /// Most recent resolved alerts, oldest first
    resolved: VecDeque<Alert>,
    resolved_total: usize,
}

/// In-memory alert repository
pub struct MemoryAlertRepository {
    tables: Mutex<AlertTables>,
    history: usize,
}

impl Default for MemoryAlertRepository {
    fn default() -> Self {
        Self::with_history(RESOLVED_HISTORY)
    }
}

impl MemoryAlertRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `history` resolved alerts
    pub fn with_history(history: usize) -> Self {
        Self { tables: Mutex::new(AlertTables::default()), history }
    }

    /// Count of alerts ever stored, resolved or not
    pub fn total(&self) -> usize {
        let tables = self.tables.lock();
        tables.open.len() + tables.resolved_total
    }

    /// Recently resolved alerts, oldest first
    pub fn resolved(&self) -> Vec<Alert> {
        self.tables.lock().resolved.iter().cloned().collect()
    }
}

impl AlertRepository for MemoryAlertRepository {
    fn find_unresolved(&self, key: &AlertKey) -> Option<Alert> {
        self.tables.lock().open.get(key).cloned()
    }

    fn insert_unique(&self, alert: Alert) -> bool {
        let mut tables = self.tables.lock();
        let key = alert.key();
        if tables.open.contains_key(&key) {
            return false;
        }
        tables.open.insert(key, alert);
        true
    }

    fn resolve(&self, alert_id: &str) -> bool {
        let mut tables = self.tables.lock();
        let Some(key) = tables.open.iter().find(|(_, a)| a.id == alert_id).map(|(k, _)| k.clone())
        else {
            return false;
        };
        if let Some(mut alert) = tables.open.remove(&key) {
            alert.resolved = true;
            tables.resolved_total += 1;
            tables.resolved.push_back(alert);
            while tables.resolved.len() > self.history {
                tables.resolved.pop_front();
            }
        }
        true
    }

    fn unresolved(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.tables.lock().open.values().cloned().collect();
        alerts.sort_by(|a, b| a.time.cmp(&b.time).then_with(|| a.id.cmp(&b.id)));
        alerts
    }
}
