//! Per-provider request budget tracking.
//!
//! [`BudgetTracker`] keeps daily and monthly request counters per provider
//! and compares them against configurable caps.  Budgets are advisory:
//! [`check`](BudgetTracker::check) gates the proxy before it forwards a
//! request, while [`record`](BudgetTracker::record) increments counters and
//! persists best-effort in the background — a lost update after a crash is
//! acceptable, and persistence failures increment a visible counter instead
//! of failing the request that triggered them.
//!
//! A counter whose stored period has lapsed reads as zero; it is only
//! rewritten on the next [`record`](BudgetTracker::record).

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::error::{BudgetError, Result};

/// Per-provider request limits.  0 = unlimited.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub daily_limit: u64,
    pub monthly_limit: u64,
}

/// Which budget period a limit applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetScope {
    Daily,
    Monthly,
}

impl std::fmt::Display for BudgetScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Daily => "daily",
            Self::Monthly => "monthly",
        })
    }
}

/// Request counts for a single provider, tagged with the period they belong
/// to (`daily_date` = "YYYY-MM-DD", `monthly_date` = "YYYY-MM").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ProviderCounter {
    daily_count: u64,
    monthly_count: u64,
    #[serde(default)]
    daily_date: String,
    #[serde(default)]
    monthly_date: String,
}

/// On-disk shape of the budget file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct BudgetData {
    #[serde(default)]
    config: HashMap<String, BudgetConfig>,
    #[serde(default)]
    counters: HashMap<String, ProviderCounter>,
}

/// Usage figures for one provider, lapsed counters zeroed for display.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStats {
    pub provider: String,
    pub daily_count: u64,
    pub daily_limit: u64,
    pub monthly_count: u64,
    pub monthly_limit: u64,
}

fn current_periods() -> (String, String) {
    let now = Local::now();
    (
        now.format("%Y-%m-%d").to_string(),
        now.format("%Y-%m").to_string(),
    )
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

struct Shared {
    file: PathBuf,
    data: RwLock<BudgetData>,
    persist_failures: AtomicU64,
}

/// Per-provider budget tracker with its own persistence file.
///
/// Cheap to clone; all clones share one counter map.
#[derive(Clone)]
pub struct BudgetTracker {
    inner: Arc<Shared>,
}

impl BudgetTracker {
    /// Open the tracker persisting to `file`.  A missing file starts empty;
    /// an unparseable file is an error.
    pub fn open(file: impl Into<PathBuf>) -> Result<Self> {
        let file = file.into();

        let data = match std::fs::read(&file) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BudgetData::default(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            inner: Arc::new(Shared {
                file,
                data: RwLock::new(data),
                persist_failures: AtomicU64::new(0),
            }),
        })
    }

    /// Whether `provider` is within budget right now.
    ///
    /// Read-only: passes unconditionally when no config exists for the
    /// provider, and treats stale counters as zero without rewriting them.
    pub fn check(&self, provider: &str) -> Result<()> {
        let (today, month) = current_periods();
        self.check_at(provider, &today, &month)
    }

    fn check_at(&self, provider: &str, today: &str, month: &str) -> Result<()> {
        let data = self.inner.data.read().unwrap_or_else(PoisonError::into_inner);

        let Some(cfg) = data.config.get(provider) else {
            return Ok(());
        };

        let counter = data.counters.get(provider).cloned().unwrap_or_default();

        if cfg.daily_limit > 0
            && counter.daily_date == today
            && counter.daily_count >= cfg.daily_limit
        {
            return Err(BudgetError::Exceeded {
                provider: provider.to_string(),
                scope: BudgetScope::Daily,
                used: counter.daily_count,
                limit: cfg.daily_limit,
            });
        }
        if cfg.monthly_limit > 0
            && counter.monthly_date == month
            && counter.monthly_count >= cfg.monthly_limit
        {
            return Err(BudgetError::Exceeded {
                provider: provider.to_string(),
                scope: BudgetScope::Monthly,
                used: counter.monthly_count,
                limit: cfg.monthly_limit,
            });
        }
        Ok(())
    }

    /// Record one request for `provider`, rolling lapsed counters to zero,
    /// then persist best-effort off the request path.
    pub fn record(&self, provider: &str) {
        let (today, month) = current_periods();
        self.record_at(provider, &today, &month);
        self.persist_background();
    }

    fn record_at(&self, provider: &str, today: &str, month: &str) {
        let mut data = self
            .inner
            .data
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let counter = data.counters.entry(provider.to_string()).or_default();

        if counter.daily_date != today {
            counter.daily_count = 0;
            counter.daily_date = today.to_string();
        }
        if counter.monthly_date != month {
            counter.monthly_count = 0;
            counter.monthly_date = month.to_string();
        }

        counter.daily_count += 1;
        counter.monthly_count += 1;

        tracing::trace!(
            provider,
            daily = counter.daily_count,
            monthly = counter.monthly_count,
            "recorded request"
        );
    }

    /// Set budget limits for a provider.  Persists synchronously.
    pub fn set_config(&self, provider: &str, daily_limit: u64, monthly_limit: u64) -> Result<()> {
        {
            let mut data = self
                .inner
                .data
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            data.config.insert(
                provider.to_string(),
                BudgetConfig {
                    daily_limit,
                    monthly_limit,
                },
            );
        }
        self.persist()?;
        tracing::info!(provider, daily_limit, monthly_limit, "budget configured");
        Ok(())
    }

    /// Reset the counter for a provider.  Persists synchronously.
    pub fn reset_counter(&self, provider: &str) -> Result<()> {
        {
            let mut data = self
                .inner
                .data
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            data.counters.remove(provider);
        }
        self.persist()?;
        tracing::info!(provider, "budget counter reset");
        Ok(())
    }

    /// Usage stats for the union of configured and counted providers,
    /// in provider order, with lapsed counters shown as zero.
    pub fn all_stats(&self) -> Vec<ProviderStats> {
        let (today, month) = current_periods();
        let data = self.inner.data.read().unwrap_or_else(PoisonError::into_inner);

        let providers: BTreeSet<&String> =
            data.config.keys().chain(data.counters.keys()).collect();

        providers
            .into_iter()
            .map(|provider| {
                let cfg = data.config.get(provider).copied().unwrap_or_default();
                let counter = data.counters.get(provider);
                ProviderStats {
                    provider: provider.clone(),
                    daily_count: counter
                        .filter(|c| c.daily_date == today)
                        .map_or(0, |c| c.daily_count),
                    daily_limit: cfg.daily_limit,
                    monthly_count: counter
                        .filter(|c| c.monthly_date == month)
                        .map_or(0, |c| c.monthly_count),
                    monthly_limit: cfg.monthly_limit,
                }
            })
            .collect()
    }

    /// Cumulative count of background persistence failures.
    pub fn persist_failures(&self) -> u64 {
        self.inner.persist_failures.load(Ordering::Relaxed)
    }

    // -- Persistence ---------------------------------------------------------

    /// Serialize the current state and atomically replace the budget file.
    fn persist(&self) -> Result<()> {
        let bytes = {
            let data = self.inner.data.read().unwrap_or_else(PoisonError::into_inner);
            serde_json::to_vec_pretty(&*data)?
        };

        let temp = self.inner.file.with_extension("json.tmp");
        std::fs::write(&temp, &bytes).map_err(|e| BudgetError::Persistence {
            reason: format!("failed to write temp file: {e}"),
        })?;
        if let Err(e) = std::fs::rename(&temp, &self.inner.file) {
            let _ = std::fs::remove_file(&temp);
            return Err(BudgetError::Persistence {
                reason: format!("failed to rename temp file: {e}"),
            });
        }
        Ok(())
    }

    /// Persist off the request path.  Failures never propagate to the
    /// caller; they surface only through
    /// [`persist_failures`](Self::persist_failures).
    fn persist_background(&self) {
        let tracker = self.clone();
        let task = move || {
            if let Err(e) = tracker.persist() {
                let count = tracker
                    .inner
                    .persist_failures
                    .fetch_add(1, Ordering::Relaxed)
                    + 1;
                tracing::warn!(error = %e, cumulative_failures = count, "budget persist failed");
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(task);
            }
            // No runtime (synchronous caller): persist inline, still
            // best-effort.
            Err(_) => task(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_tracker() -> (tempfile::TempDir, BudgetTracker) {
        let dir = tempfile::tempdir().unwrap();
        let tracker = BudgetTracker::open(dir.path().join("budget.json")).unwrap();
        (dir, tracker)
    }

    #[test]
    fn unconfigured_provider_always_passes() {
        let (_dir, tracker) = test_tracker();
        for _ in 0..100 {
            tracker.record_at("openai", "2026-08-07", "2026-08");
        }
        assert!(tracker.check_at("openai", "2026-08-07", "2026-08").is_ok());
    }

    #[test]
    fn daily_limit_enforced_with_usage_figures() {
        let (_dir, tracker) = test_tracker();
        tracker.set_config("openai", 3, 0).unwrap();

        for _ in 0..3 {
            assert!(tracker.check_at("openai", "2026-08-07", "2026-08").is_ok());
            tracker.record_at("openai", "2026-08-07", "2026-08");
        }

        let err = tracker
            .check_at("openai", "2026-08-07", "2026-08")
            .unwrap_err();
        match err {
            BudgetError::Exceeded {
                provider,
                scope,
                used,
                limit,
            } => {
                assert_eq!(provider, "openai");
                assert_eq!(scope, BudgetScope::Daily);
                assert_eq!(used, 3);
                assert_eq!(limit, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn next_day_resets_daily_but_monthly_accumulates() {
        let (_dir, tracker) = test_tracker();
        tracker.set_config("openai", 2, 10).unwrap();

        tracker.record_at("openai", "2026-08-07", "2026-08");
        tracker.record_at("openai", "2026-08-07", "2026-08");
        assert!(tracker.check_at("openai", "2026-08-07", "2026-08").is_err());

        // Next calendar day: daily rolls to 1, monthly keeps counting.
        tracker.record_at("openai", "2026-08-08", "2026-08");
        assert!(tracker.check_at("openai", "2026-08-08", "2026-08").is_ok());

        let stats = tracker.all_stats();
        let openai = stats.iter().find(|s| s.provider == "openai").unwrap();
        assert_eq!(openai.monthly_count, 3);
    }

    #[test]
    fn monthly_limit_enforced_across_days() {
        let (_dir, tracker) = test_tracker();
        tracker.set_config("openai", 0, 3).unwrap();

        tracker.record_at("openai", "2026-08-06", "2026-08");
        tracker.record_at("openai", "2026-08-07", "2026-08");
        tracker.record_at("openai", "2026-08-08", "2026-08");

        let err = tracker
            .check_at("openai", "2026-08-09", "2026-08")
            .unwrap_err();
        assert!(matches!(
            err,
            BudgetError::Exceeded {
                scope: BudgetScope::Monthly,
                ..
            }
        ));

        // A new month passes again.
        assert!(tracker.check_at("openai", "2026-09-01", "2026-09").is_ok());
    }

    #[test]
    fn stale_counter_reads_as_zero_without_rewrite() {
        let (_dir, tracker) = test_tracker();
        tracker.set_config("openai", 1, 0).unwrap();

        tracker.record_at("openai", "2026-08-06", "2026-08");
        assert!(tracker.check_at("openai", "2026-08-06", "2026-08").is_err());

        // The next day the same stored counter no longer blocks...
        assert!(tracker.check_at("openai", "2026-08-07", "2026-08").is_ok());

        // ...and check did not mutate the stored period.
        let data = tracker.inner.data.read().unwrap();
        assert_eq!(data.counters["openai"].daily_date, "2026-08-06");
        assert_eq!(data.counters["openai"].daily_count, 1);
    }

    #[test]
    fn zero_limits_mean_unlimited() {
        let (_dir, tracker) = test_tracker();
        tracker.set_config("openai", 0, 0).unwrap();

        for _ in 0..50 {
            tracker.record_at("openai", "2026-08-07", "2026-08");
        }
        assert!(tracker.check_at("openai", "2026-08-07", "2026-08").is_ok());
    }

    #[test]
    fn config_and_counters_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("budget.json");

        {
            let tracker = BudgetTracker::open(&file).unwrap();
            tracker.set_config("anthropic", 100, 3000).unwrap();
            tracker.record_at("anthropic", "2026-08-07", "2026-08");
            // set_config persisted synchronously; force the counter out too.
            tracker.persist().unwrap();
        }

        let tracker = BudgetTracker::open(&file).unwrap();
        let stats = tracker.all_stats();
        let anthropic = stats.iter().find(|s| s.provider == "anthropic").unwrap();
        assert_eq!(anthropic.daily_limit, 100);
        assert_eq!(anthropic.monthly_limit, 3000);
    }

    #[test]
    fn reset_counter_clears_usage() {
        let (_dir, tracker) = test_tracker();
        tracker.set_config("openai", 1, 0).unwrap();
        tracker.record_at("openai", "2026-08-07", "2026-08");
        assert!(tracker.check_at("openai", "2026-08-07", "2026-08").is_err());

        tracker.reset_counter("openai").unwrap();
        assert!(tracker.check_at("openai", "2026-08-07", "2026-08").is_ok());
    }

    #[test]
    fn all_stats_unions_configured_and_counted() {
        let (_dir, tracker) = test_tracker();
        tracker.set_config("configured-only", 10, 0).unwrap();
        tracker.record_at("counted-only", "2026-08-07", "2026-08");

        let stats = tracker.all_stats();
        let providers: Vec<&str> = stats.iter().map(|s| s.provider.as_str()).collect();
        assert_eq!(providers, vec!["configured-only", "counted-only"]);
    }

    #[tokio::test]
    async fn record_persists_in_background() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("budget.json");
        let tracker = BudgetTracker::open(&file).unwrap();

        tracker.record("openai");

        // The write is fire-and-forget; poll briefly for it to land.
        for _ in 0..50 {
            if file.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(file.exists());
        assert_eq!(tracker.persist_failures(), 0);
    }

    #[tokio::test]
    async fn background_persist_failure_is_counted_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        // Parent directory of the budget file does not exist, so every
        // persist fails.
        let tracker = BudgetTracker::open(dir.path().join("missing/budget.json")).unwrap();

        tracker.record("openai");

        for _ in 0..50 {
            if tracker.persist_failures() > 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(tracker.persist_failures(), 1);

        // The in-memory counter still advanced.
        let stats = tracker.all_stats();
        assert_eq!(stats.len(), 1);
    }
}
