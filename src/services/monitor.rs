//! Suspicious activity monitor.
//!
//! The ledger and the order book push a [`TransactionDescriptor`] after every
//! balance-affecting transaction through a [`TransactionSink`]. Delivery is
//! fire-and-forget: a full or closed queue is logged and the transaction stands.
//!
//! The monitor task applies two independent rules:
//! - amount strictly above the configured ceiling
//! - location not among the user's recent locations (only once the user has a history)
//!
//! Location history is kept for at most `max_tracked_users` users; the one idle
//! the longest is forgotten to make room for a new one.
//!
//! Each match writes a [`SuspiciousActivityRecord`], an audit log line and an
//! [`AdminAlert`] on the administrator channel.

use crate::error::LedgerError;
use crate::services::sqlite_store::now_ms;
use crate::services::SqliteStore;
use crate::types::{ActivityStatus, AdminAlert, SuspiciousActivityRecord, TransactionDescriptor};
use dashmap::DashMap;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const REASON_AMOUNT_ABOVE_LIMIT: &str = "Transaction above limit";
pub const REASON_UNUSUAL_LOCATION: &str = "Unusual location detected";

/// Monitor rule configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Amounts strictly above this are flagged.
    pub amount_threshold: Decimal,
    /// How many distinct recent locations are remembered per user.
    pub recent_location_limit: usize,
    /// How many users have a location history at once.
    pub max_tracked_users: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            amount_threshold: dec!(10000),
            recent_location_limit: 5,
            max_tracked_users: 10_000,
        }
    }
}

/// Sending half handed to the ledger and the order book.
#[derive(Clone)]
pub struct TransactionSink {
    tx: mpsc::Sender<TransactionDescriptor>,
}

impl TransactionSink {
    /// Create a sink and the receiver the monitor task drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<TransactionDescriptor>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Hand a descriptor to the monitor without waiting.
    pub fn notify(&self, descriptor: TransactionDescriptor) {
        if let Err(e) = self.tx.try_send(descriptor) {
            warn!("Suspicious activity monitor did not accept transaction: {}", e);
        }
    }
}

/// Recent locations of one user.
#[derive(Debug, Default)]
struct LocationHistory {
    recent: VecDeque<String>,
    last_seen: u64,
}

/// Rule engine and review store for suspicious activity.
pub struct SuspiciousActivityMonitor {
    sqlite: Arc<SqliteStore>,
    config: MonitorConfig,
    recent_locations: DashMap<String, LocationHistory>,
    activity_clock: AtomicU64,
    alert_tx: broadcast::Sender<AdminAlert>,
}

impl SuspiciousActivityMonitor {
    pub fn new(sqlite: Arc<SqliteStore>, config: MonitorConfig) -> Arc<Self> {
        let (alert_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            sqlite,
            config,
            recent_locations: DashMap::new(),
            activity_clock: AtomicU64::new(0),
            alert_tx,
        })
    }

    /// Administrator channel.
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<AdminAlert> {
        self.alert_tx.subscribe()
    }

    /// Consume descriptors until every sink is dropped.
    pub fn spawn(self: &Arc<Self>, mut rx: mpsc::Receiver<TransactionDescriptor>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            info!("Suspicious activity monitor started");
            while let Some(descriptor) = rx.recv().await {
                if let Err(e) = monitor.evaluate(&descriptor) {
                    error!(
                        "Error evaluating transaction {} of user {}: {}",
                        descriptor.reference, descriptor.user_id, e
                    );
                }
            }
            info!("Suspicious activity monitor stopped");
        })
    }

    /// Apply both rules to one transaction and record every match.
    pub fn evaluate(
        &self,
        descriptor: &TransactionDescriptor,
    ) -> Result<Vec<SuspiciousActivityRecord>, LedgerError> {
        let mut reasons = Vec::new();

        if descriptor.amount > self.config.amount_threshold {
            reasons.push(REASON_AMOUNT_ABOVE_LIMIT);
        }

        if let Some(location) = descriptor.location.as_deref() {
            let unusual = self
                .recent_locations
                .get(&descriptor.user_id)
                .map(|seen| !seen.recent.is_empty() && !seen.recent.iter().any(|l| l == location))
                .unwrap_or(false);
            if unusual {
                reasons.push(REASON_UNUSUAL_LOCATION);
            }
            self.remember_location(&descriptor.user_id, location);
        }

        let mut records = Vec::with_capacity(reasons.len());
        for reason in reasons {
            let record = self.record(
                &descriptor.user_id,
                Some(descriptor.reference.clone()),
                reason,
            )?;
            self.alert_admin(&record);
            records.push(record);
        }
        Ok(records)
    }

    /// Add a location to the user's recent set, evicting the oldest.
    pub fn remember_location(&self, user_id: &str, location: &str) {
        if !self.recent_locations.contains_key(user_id) {
            self.evict_idle_users();
        }

        let tick = self.activity_clock.fetch_add(1, Ordering::Relaxed);
        let mut seen = self.recent_locations.entry(user_id.to_string()).or_default();
        seen.last_seen = tick;
        if seen.recent.iter().any(|l| l == location) {
            return;
        }
        seen.recent.push_back(location.to_string());
        while seen.recent.len() > self.config.recent_location_limit {
            seen.recent.pop_front();
        }
    }

    /// Number of users with a location history.
    pub fn tracked_users(&self) -> usize {
        self.recent_locations.len()
    }

    /// Forget the least recently active users until a new one fits.
    fn evict_idle_users(&self) {
        while !self.recent_locations.is_empty()
            && self.recent_locations.len() >= self.config.max_tracked_users
        {
            // The iterator holds shard locks; release it before removing.
            let idle = self
                .recent_locations
                .iter()
                .min_by_key(|entry| entry.last_seen)
                .map(|entry| entry.key().clone());
            match idle {
                Some(user_id) => {
                    debug!("Forgetting location history of idle user {}", user_id);
                    self.recent_locations.remove(&user_id);
                }
                None => break,
            }
        }
    }

    /// Manual report by a user.
    pub fn report(
        &self,
        user_id: &str,
        description: &str,
    ) -> Result<SuspiciousActivityRecord, LedgerError> {
        let description = description.trim();
        if description.is_empty() {
            return Err(LedgerError::Validation(
                "description of the suspicious activity is required".to_string(),
            ));
        }
        self.record(user_id, None, description)
    }

    /// All records, newest first.
    pub fn list(&self) -> Result<Vec<SuspiciousActivityRecord>, LedgerError> {
        Ok(self.sqlite.list_activities()?)
    }

    /// One record.
    pub fn get(&self, id: &str) -> Result<SuspiciousActivityRecord, LedgerError> {
        self.sqlite
            .get_activity(id)?
            .ok_or_else(|| LedgerError::NotFound(format!("suspicious activity {}", id)))
    }

    /// Move a record through review.
    pub fn update_status(
        &self,
        id: &str,
        status: ActivityStatus,
        comments: Option<&str>,
    ) -> Result<SuspiciousActivityRecord, LedgerError> {
        let record = self
            .sqlite
            .update_activity_status(id, status, comments, now_ms())?
            .ok_or_else(|| LedgerError::NotFound(format!("suspicious activity {}", id)))?;

        info!(
            target: "audit",
            record_id = %record.id,
            user_id = %record.user_id,
            status = %record.status,
            "suspicious activity status changed"
        );
        Ok(record)
    }

    fn record(
        &self,
        user_id: &str,
        transaction_ref: Option<String>,
        reason: &str,
    ) -> Result<SuspiciousActivityRecord, LedgerError> {
        let now = now_ms();
        let record = SuspiciousActivityRecord {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            transaction_ref,
            reason: reason.to_string(),
            status: ActivityStatus::Reported,
            comments: None,
            created_at: now,
            updated_at: now,
        };
        self.sqlite.insert_activity(&record)?;

        info!(
            target: "audit",
            record_id = %record.id,
            user_id = %record.user_id,
            reason = %record.reason,
            "suspicious activity recorded"
        );
        Ok(record)
    }

    fn alert_admin(&self, record: &SuspiciousActivityRecord) {
        warn!("Alert: user {} flagged for {}", record.user_id, record.reason);
        let _ = self.alert_tx.send(AdminAlert {
            record_id: record.id.clone(),
            user_id: record.user_id.clone(),
            reason: record.reason.clone(),
            raised_at: record.created_at,
        });
    }
}
