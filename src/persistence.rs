// =============================================================================
// Persisted state — position/plan/backtest archives, decision logs
// =============================================================================
//
// Generalizes `runtime_config.rs`'s atomic tmp+rename JSON save pattern into
// two small reusable stores: `JsonLogStore<T>` (append-only, full-file
// rewrite on every append — acceptable at this crate's log volumes) and
// `JsonMapStore<V>` (current-snapshot-per-key). Every archive below is a
// thin, named wrapper around one or both.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::info;

use crate::activation::{Regime, StrategyStatus};
use crate::backtest::BacktestResult;
use crate::execution::ExecutionPlan;
use crate::position::Position;

fn atomic_write(path: &Path, content: &str) -> Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, content).with_context(|| format!("failed to write tmp file {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path).with_context(|| format!("failed to rename tmp file to {}", path.display()))?;
    Ok(())
}

/// Append-only log, persisted as a single JSON array. Every `append` rewrites
/// the whole file atomically; fine at the batch sizes this crate's decision
/// and event logs produce.
pub struct JsonLogStore<T> {
    path: PathBuf,
    entries: RwLock<Vec<T>>,
}

impl<T: Serialize + DeserializeOwned + Clone> JsonLogStore<T> {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let content = std::fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            Vec::new()
        };
        Ok(Self { path, entries: RwLock::new(entries) })
    }

    pub fn append(&self, entry: T) -> Result<()> {
        let mut entries = self.entries.write();
        entries.push(entry);
        let content = serde_json::to_string_pretty(&*entries)?;
        atomic_write(&self.path, &content)?;
        info!(path = %self.path.display(), count = entries.len(), "log entry appended");
        Ok(())
    }

    pub fn entries(&self) -> Vec<T> {
        self.entries.read().clone()
    }
}

/// Current-snapshot-per-key store, persisted as a single JSON object.
pub struct JsonMapStore<V> {
    path: PathBuf,
    entries: RwLock<HashMap<String, V>>,
}

impl<V: Serialize + DeserializeOwned + Clone> JsonMapStore<V> {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let content = std::fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            HashMap::new()
        };
        Ok(Self { path, entries: RwLock::new(entries) })
    }

    pub fn put(&self, key: impl Into<String>, value: V) -> Result<()> {
        let mut entries = self.entries.write();
        entries.insert(key.into(), value);
        let content = serde_json::to_string_pretty(&*entries)?;
        atomic_write(&self.path, &content)?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.entries.read().get(key).cloned()
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write();
        entries.remove(key);
        let content = serde_json::to_string_pretty(&*entries)?;
        atomic_write(&self.path, &content)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionEvent {
    pub position_id: String,
    pub event: String,
    pub timestamp: DateTime<Utc>,
}

/// Append-only event log plus current snapshot per `position_id`.
pub struct PositionArchive {
    pub log: JsonLogStore<PositionEvent>,
    pub snapshots: JsonMapStore<Position>,
}

impl PositionArchive {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        Ok(Self {
            log: JsonLogStore::load(dir.join("position_events.json"))?,
            snapshots: JsonMapStore::load(dir.join("position_snapshots.json"))?,
        })
    }

    pub fn record(&self, position: &Position, event: &str) -> Result<()> {
        self.log.append(PositionEvent {
            position_id: position.position_id.clone(),
            event: event.to_string(),
            timestamp: Utc::now(),
        })?;
        self.snapshots.put(position.position_id.clone(), position.clone())
    }
}

/// Plan metadata plus slice ledger, current snapshot per `order_id`.
pub struct ExecutionPlanArchive {
    pub snapshots: JsonMapStore<ExecutionPlan>,
}

impl ExecutionPlanArchive {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Ok(Self { snapshots: JsonMapStore::load(dir.as_ref().join("execution_plans.json"))? })
    }

    pub fn record(&self, plan: &ExecutionPlan) -> Result<()> {
        self.snapshots.put(plan.order_id.clone(), plan.clone())
    }
}

/// Full metric bundle keyed by `{strategy_id}::{run_id}`.
pub struct BacktestResultArchive {
    pub snapshots: JsonMapStore<BacktestResult>,
}

impl BacktestResultArchive {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Ok(Self { snapshots: JsonMapStore::load(dir.as_ref().join("backtest_results.json"))? })
    }

    fn key(strategy_id: &str, run_id: &str) -> String {
        format!("{strategy_id}::{run_id}")
    }

    pub fn record(&self, strategy_id: &str, run_id: &str, result: &BacktestResult) -> Result<()> {
        self.snapshots.put(Self::key(strategy_id, run_id), result.clone())
    }

    pub fn get(&self, strategy_id: &str, run_id: &str) -> Option<BacktestResult> {
        self.snapshots.get(&Self::key(strategy_id, run_id))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationDecisionEvent {
    pub strategy_id: String,
    pub status: StrategyStatus,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

pub struct ActivationDecisionLog(pub JsonLogStore<ActivationDecisionEvent>);

impl ActivationDecisionLog {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Ok(Self(JsonLogStore::load(dir.as_ref().join("activation_decisions.json"))?))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeChangeEvent {
    pub previous: Option<Regime>,
    pub current: Regime,
    pub timestamp: DateTime<Utc>,
}

pub struct RegimeChangeLog(pub JsonLogStore<RegimeChangeEvent>);

impl RegimeChangeLog {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Ok(Self(JsonLogStore::load(dir.as_ref().join("regime_changes.json"))?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn log_store_persists_across_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.json");
        {
            let store: JsonLogStore<String> = JsonLogStore::load(&path).unwrap();
            store.append("first".to_string()).unwrap();
            store.append("second".to_string()).unwrap();
        }
        let reloaded: JsonLogStore<String> = JsonLogStore::load(&path).unwrap();
        assert_eq!(reloaded.entries(), vec!["first".to_string(), "second".to_string()]);
    }

    #[test]
    fn map_store_put_get_remove_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("map.json");
        let store: JsonMapStore<f64> = JsonMapStore::load(&path).unwrap();
        store.put("a", 1.5).unwrap();
        assert_eq!(store.get("a"), Some(1.5));
        store.remove("a").unwrap();
        assert_eq!(store.get("a"), None);
    }

    #[test]
    fn backtest_result_archive_keys_by_strategy_and_run() {
        let dir = tempdir().unwrap();
        let archive = BacktestResultArchive::open(dir.path()).unwrap();
        let result = BacktestResult::default();
        archive.record("strat-1", "run-1", &result).unwrap();
        assert!(archive.get("strat-1", "run-1").is_some());
        assert!(archive.get("strat-1", "run-2").is_none());
    }
}
