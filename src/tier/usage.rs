//! Daily usage counters per user and action type
//!
//! Counters are keyed by (user, action type, UTC day) and persisted as JSON.
//! Checks are read-only; increments check the ceiling and write under the
//! same exclusive borrow, so a counter never moves past its limit.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use super::action::ActionType;
use super::limits::{Limit, Tier};

/// Days of history kept on disk
const RETENTION_DAYS: i64 = 30;

#[derive(Error, Debug)]
pub enum UsageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Daily {action} limit reached ({used}/{limit})")]
    LimitReached {
        action: ActionType,
        used: u32,
        limit: u32,
    },
}

/// Snapshot of one user's quota for one action type on the current day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStatus {
    pub tier: Tier,
    pub limit: Limit,
    pub used: u32,
    pub remaining: Limit,
    pub limit_reached: bool,
    pub unlimited: bool,
}

impl UsageStatus {
    pub fn derive(tier: Tier, limit: Limit, used: u32) -> Self {
        Self {
            tier,
            limit,
            used,
            remaining: limit.remaining_after(used),
            limit_reached: limit.is_reached_by(used),
            unlimited: limit.is_unlimited(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UsageRecord {
    user_id: String,
    action_type: ActionType,
    date: NaiveDate,
    count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct UsageFile {
    records: Vec<UsageRecord>,
}

type UsageKey = (String, ActionType, NaiveDate);

/// Usage counters with file persistence
pub struct UsageStore {
    data_dir: PathBuf,
    counters: HashMap<UsageKey, u32>,
    last_pruned: NaiveDate,
}

impl UsageStore {
    const USAGE_FILE: &'static str = "usage_records.json";

    pub fn new(data_dir: PathBuf) -> Result<Self, UsageError> {
        let usage_dir = data_dir.join("usage");
        fs::create_dir_all(&usage_dir)?;

        let today = Utc::now().date_naive();
        let mut store = Self {
            data_dir: usage_dir,
            counters: HashMap::new(),
            last_pruned: today,
        };
        store.load()?;
        store.prune(today);
        store.save()?;

        Ok(store)
    }

    fn usage_file(&self) -> PathBuf {
        self.data_dir.join(Self::USAGE_FILE)
    }

    fn load(&mut self) -> Result<(), UsageError> {
        let path = self.usage_file();
        if path.exists() {
            let content = fs::read_to_string(&path)?;
            let file: UsageFile = serde_json::from_str(&content)?;
            self.counters = file
                .records
                .into_iter()
                .map(|r| ((r.user_id, r.action_type, r.date), r.count))
                .collect();
            tracing::debug!("Loaded {} usage records", self.counters.len());
        }
        Ok(())
    }

    fn save(&self) -> Result<(), UsageError> {
        let mut records: Vec<UsageRecord> = self
            .counters
            .iter()
            .map(|((user_id, action_type, date), count)| UsageRecord {
                user_id: user_id.clone(),
                action_type: *action_type,
                date: *date,
                count: *count,
            })
            .collect();
        records.sort_by(|a, b| {
            (a.date, &a.user_id, a.action_type).cmp(&(b.date, &b.user_id, b.action_type))
        });

        let content = serde_json::to_string_pretty(&UsageFile { records })?;
        fs::write(self.usage_file(), content)?;
        Ok(())
    }

    fn prune(&mut self, today: NaiveDate) {
        self.last_pruned = today;
        let cutoff = today - Duration::days(RETENTION_DAYS);
        let before = self.counters.len();
        self.counters.retain(|(_, _, date), _| *date > cutoff);
        let pruned = before - self.counters.len();
        if pruned > 0 {
            tracing::info!("Pruned {} usage records older than {}", pruned, cutoff);
        }
    }

    /// Next midnight UTC, when daily counters start over
    pub fn next_reset() -> DateTime<Utc> {
        let tomorrow = Utc::now().date_naive() + Duration::days(1);
        tomorrow.and_time(chrono::NaiveTime::MIN).and_utc()
    }

    fn used_on(&self, user_id: &str, action: ActionType, date: NaiveDate) -> u32 {
        self.counters
            .get(&(user_id.to_string(), action, date))
            .copied()
            .unwrap_or(0)
    }

    /// Current status without touching the counter
    pub fn check(&self, user_id: &str, tier: Tier, action: ActionType) -> UsageStatus {
        self.check_on(user_id, tier, action, Utc::now().date_naive())
    }

    fn check_on(
        &self,
        user_id: &str,
        tier: Tier,
        action: ActionType,
        date: NaiveDate,
    ) -> UsageStatus {
        let limit = tier.plan().limits.processes_per_day;
        UsageStatus::derive(tier, limit, self.used_on(user_id, action, date))
    }

    /// Consume one unit of quota, or refuse without changing the counter
    pub fn increment(
        &mut self,
        user_id: &str,
        tier: Tier,
        action: ActionType,
    ) -> Result<UsageStatus, UsageError> {
        self.increment_on(user_id, tier, action, Utc::now().date_naive())
    }

    fn increment_on(
        &mut self,
        user_id: &str,
        tier: Tier,
        action: ActionType,
        date: NaiveDate,
    ) -> Result<UsageStatus, UsageError> {
        let limit = tier.plan().limits.processes_per_day;
        let used = self.used_on(user_id, action, date);

        if let Limit::Bounded(ceiling) = limit {
            if used >= ceiling {
                tracing::info!(
                    user_id,
                    action = %action,
                    used,
                    limit = ceiling,
                    "Usage limit reached"
                );
                return Err(UsageError::LimitReached {
                    action,
                    used,
                    limit: ceiling,
                });
            }
        }

        // First write of a new day drops expired records
        if date > self.last_pruned {
            self.prune(date);
        }

        let used = used.saturating_add(1);
        let key = (user_id.to_string(), action, date);
        let previous = self.counters.insert(key.clone(), used);
        if let Err(err) = self.save() {
            match previous {
                Some(count) => self.counters.insert(key, count),
                None => self.counters.remove(&key),
            };
            tracing::error!(user_id, action = %action, "Failed to persist usage: {}", err);
            return Err(err);
        }

        tracing::debug!(user_id, action = %action, used, "Usage incremented");
        Ok(UsageStatus::derive(tier, limit, used))
    }

    /// Status of every action type for one user
    pub fn summary(&self, user_id: &str, tier: Tier) -> UsageSummary {
        let today = Utc::now().date_naive();
        UsageSummary {
            tier,
            date: today,
            actions: ActionType::ALL
                .into_iter()
                .map(|action| ActionUsage {
                    action_type: action,
                    status: self.check_on(user_id, tier, action, today),
                })
                .collect(),
            resets_at: Self::next_reset(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionUsage {
    pub action_type: ActionType,
    #[serde(flatten)]
    pub status: UsageStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub tier: Tier,
    pub date: NaiveDate,
    pub actions: Vec<ActionUsage>,
    pub resets_at: DateTime<Utc>,
}

/// Shared usage store type
pub type SharedUsageStore = Arc<RwLock<UsageStore>>;

/// Create a shared usage store
pub fn create_shared_store(data_dir: PathBuf) -> Result<SharedUsageStore, UsageError> {
    let store = UsageStore::new(data_dir)?;
    Ok(Arc::new(RwLock::new(store)))
}
