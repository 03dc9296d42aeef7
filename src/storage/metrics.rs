//! 指标存储：key → MetricRecord，整表原子落盘
//!
//! 每次修改后把全部记录写入 metrics.json（临时文件 + rename）。文件缺失或无法解析时从空表开始，
//! 它只是缓存，已生成的页面输出才是事实来源。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::StorageError;
use crate::storage::atomic;

const METRICS_VERSION: u32 = 1;

/// MetricRecord 的固定字段；custom 平铺序列化，不能与之重名
const RESERVED_KEYS: &[&str] = &["cost_usd", "time_seconds", "tokens", "updated_at"];

fn is_reserved_key(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

/// 单条指标记录；custom 字段在 JSON 中与固定字段平铺
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub time_seconds: f64,
    #[serde(default)]
    pub tokens: u64,
    #[serde(default)]
    pub updated_at: String,
    #[serde(flatten)]
    pub custom: Map<String, Value>,
}

/// record() 的输入
#[derive(Debug, Clone, Default)]
pub struct MetricUpdate {
    pub cost_usd: f64,
    pub time_seconds: f64,
    pub tokens: Option<u64>,
    pub custom: Option<Map<String, Value>>,
}

impl MetricUpdate {
    pub fn new(cost_usd: f64, time_seconds: f64) -> Self {
        Self {
            cost_usd: cost_usd.max(0.0),
            time_seconds: time_seconds.max(0.0),
            ..Self::default()
        }
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// 与固定字段同名的 key（cost_usd / time_seconds / tokens / updated_at）会被忽略
    pub fn with_custom(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if is_reserved_key(&key) {
            tracing::warn!(key = %key, "custom metric key collides with a fixed field, ignored");
            return self;
        }
        self.custom
            .get_or_insert_with(Map::new)
            .insert(key, value.into());
        self
    }
}

/// 一次加锁得到的全部汇总
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub count: usize,
    pub total_cost_usd: f64,
    pub total_time_seconds: f64,
    pub total_tokens: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct MetricsFile {
    version: u32,
    created_at: String,
    updated_at: String,
    metrics: BTreeMap<String, MetricRecord>,
}

impl MetricsFile {
    fn empty() -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            version: METRICS_VERSION,
            created_at: now.clone(),
            updated_at: now,
            metrics: BTreeMap::new(),
        }
    }
}

/// 指标存储：单实例单互斥锁，读写都加锁
#[derive(Debug)]
pub struct MetricsStore {
    path: PathBuf,
    state: Mutex<MetricsFile>,
}

impl MetricsStore {
    /// 打开（或新建）指标文件；损坏文件记 warn 后视为空表
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let state = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<MetricsFile>(&raw) {
                Ok(file) => file,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "metrics file unreadable, starting empty");
                    MetricsFile::empty()
                }
            },
            Err(_) => MetricsFile::empty(),
        };
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, MetricsFile> {
        // 持锁线程 panic 后数据仍是完整的旧值或新值，继续使用
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 插入或更新 key 的记录。accumulate=true 时数值字段与旧值相加（旧值缺失按 0），
    /// 非数值 custom 字段直接覆盖；accumulate=false 时整条替换。
    pub fn record(
        &self,
        key: &str,
        update: MetricUpdate,
        accumulate: bool,
    ) -> Result<MetricRecord, StorageError> {
        let mut update = update;
        if let Some(custom) = update.custom.as_mut() {
            custom.retain(|k, _| !is_reserved_key(k));
        }

        let mut state = self.lock();
        let now = Utc::now().to_rfc3339();

        let merged = match state.metrics.get(key) {
            Some(existing) if accumulate => accumulate_record(existing, update, &now),
            _ => MetricRecord {
                cost_usd: update.cost_usd,
                time_seconds: update.time_seconds,
                tokens: update.tokens.unwrap_or(0),
                updated_at: now.clone(),
                custom: update.custom.unwrap_or_default(),
            },
        };

        let previous = state.metrics.insert(key.to_string(), merged.clone());
        let previous_updated_at = std::mem::replace(&mut state.updated_at, now);
        if let Err(e) = self.persist(&state) {
            // 落盘失败时内存回到旧值，与磁盘保持一致
            match previous {
                Some(old) => state.metrics.insert(key.to_string(), old),
                None => state.metrics.remove(key),
            };
            state.updated_at = previous_updated_at;
            return Err(e);
        }
        Ok(merged)
    }

    pub fn get(&self, key: &str) -> Option<MetricRecord> {
        self.lock().metrics.get(key).cloned()
    }

    pub fn get_all(&self) -> BTreeMap<String, MetricRecord> {
        self.lock().metrics.clone()
    }

    pub fn get_by_prefix(&self, prefix: &str) -> BTreeMap<String, MetricRecord> {
        self.lock()
            .metrics
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn total_cost(&self) -> f64 {
        self.lock().metrics.values().map(|r| r.cost_usd).sum()
    }

    pub fn total_time(&self) -> f64 {
        self.lock().metrics.values().map(|r| r.time_seconds).sum()
    }

    pub fn total_tokens(&self) -> u64 {
        self.lock()
            .metrics
            .values()
            .fold(0u64, |acc, r| acc.saturating_add(r.tokens))
    }

    pub fn summary(&self) -> MetricsSummary {
        let state = self.lock();
        state
            .metrics
            .values()
            .fold(MetricsSummary::default(), |mut acc, r| {
                acc.count += 1;
                acc.total_cost_usd += r.cost_usd;
                acc.total_time_seconds += r.time_seconds;
                acc.total_tokens = acc.total_tokens.saturating_add(r.tokens);
                acc
            })
    }

    pub fn len(&self) -> usize {
        self.lock().metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().metrics.is_empty()
    }

    /// 清空全部记录（唯一的删除途径）
    pub fn reset(&self) -> Result<(), StorageError> {
        let mut state = self.lock();
        let fresh = MetricsFile::empty();
        self.persist(&fresh)?;
        *state = fresh;
        Ok(())
    }

    fn persist(&self, state: &MetricsFile) -> Result<(), StorageError> {
        atomic::write_json(&self.path, state)
    }
}

fn accumulate_record(existing: &MetricRecord, update: MetricUpdate, now: &str) -> MetricRecord {
    let mut custom = existing.custom.clone();
    for (k, v) in update.custom.unwrap_or_default() {
        let summed = match (custom.get(&k), &v) {
            (Some(Value::Number(a)), Value::Number(b)) => add_numbers(a, b),
            (None, Value::Number(_)) => Some(v.clone()),
            _ => None,
        };
        custom.insert(k, summed.unwrap_or(v));
    }
    MetricRecord {
        cost_usd: existing.cost_usd + update.cost_usd,
        time_seconds: existing.time_seconds + update.time_seconds,
        tokens: existing.tokens.saturating_add(update.tokens.unwrap_or(0)),
        updated_at: now.to_string(),
        custom,
    }
}

/// 整数相加保持整数，否则按浮点相加
fn add_numbers(a: &serde_json::Number, b: &serde_json::Number) -> Option<Value> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return Some(Value::from(x.saturating_add(y)));
    }
    let sum = a.as_f64()? + b.as_f64()?;
    serde_json::Number::from_f64(sum).map(Value::Number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn store() -> (tempfile::TempDir, MetricsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MetricsStore::open(dir.path().join("metrics.json"));
        (dir, store)
    }

    #[test]
    fn test_replace_overwrites_record() {
        let (_dir, store) = store();
        store
            .record("page_0001", MetricUpdate::new(0.5, 2.0).with_custom("model", "a"), false)
            .unwrap();
        store
            .record("page_0001", MetricUpdate::new(0.1, 1.0), false)
            .unwrap();
        let rec = store.get("page_0001").unwrap();
        assert_eq!(rec.cost_usd, 0.1);
        assert_eq!(rec.time_seconds, 1.0);
        assert!(rec.custom.is_empty());
    }

    #[test]
    fn test_accumulate_sums_numeric_and_overwrites_text() {
        let (_dir, store) = store();
        let first = MetricUpdate::new(0.25, 1.5)
            .with_tokens(100)
            .with_custom("iterations", 2)
            .with_custom("model", "small");
        store.record("agent", first, true).unwrap();
        let second = MetricUpdate::new(0.25, 0.5)
            .with_tokens(50)
            .with_custom("iterations", 3)
            .with_custom("model", "large");
        let rec = store.record("agent", second, true).unwrap();

        assert_eq!(rec.cost_usd, 0.5);
        assert_eq!(rec.time_seconds, 2.0);
        assert_eq!(rec.tokens, 150);
        assert_eq!(rec.custom["iterations"], 5);
        assert_eq!(rec.custom["model"], "large");
    }

    #[test]
    fn test_totals_and_prefix() {
        let (_dir, store) = store();
        store.record("page_0001", MetricUpdate::new(0.01, 1.0), false).unwrap();
        store.record("page_0002", MetricUpdate::new(0.02, 2.0), false).unwrap();
        store.record("toc", MetricUpdate::new(0.10, 4.0), false).unwrap();

        assert!((store.total_cost() - 0.13).abs() < 1e-9);
        assert!((store.total_time() - 7.0).abs() < 1e-9);
        let pages = store.get_by_prefix("page_");
        assert_eq!(pages.len(), 2);
        assert!(pages.contains_key("page_0002"));
        assert_eq!(store.summary().count, 3);
    }

    #[test]
    fn test_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        {
            let store = MetricsStore::open(&path);
            store
                .record("k", MetricUpdate::new(1.0, 1.0).with_custom("note", "x"), false)
                .unwrap();
        }
        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["version"], 1);
        assert_eq!(raw["metrics"]["k"]["note"], "x");

        let reopened = MetricsStore::open(&path);
        assert_eq!(reopened.get("k").unwrap().custom["note"], "x");
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = MetricsStore::open(&path);
        assert!(store.is_empty());
        store.record("k", MetricUpdate::new(0.1, 0.0), false).unwrap();
        assert_eq!(MetricsStore::open(&path).len(), 1);
    }

    #[test]
    fn test_reset_clears() {
        let (_dir, store) = store();
        store.record("k", MetricUpdate::new(0.1, 0.0), false).unwrap();
        store.reset().unwrap();
        assert!(store.get("k").is_none());
        assert_eq!(store.total_cost(), 0.0);
    }

    #[test]
    fn test_concurrent_accumulate_no_lost_updates() {
        let (_dir, store) = store();
        let store = Arc::new(store);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        store
                            .record("shared", MetricUpdate::new(0.0, 0.0).with_tokens(1), true)
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.get("shared").unwrap().tokens, 80);
    }

    #[test]
    fn test_reserved_custom_keys_dropped() {
        let (_dir, store) = store();
        let mut update = MetricUpdate::new(0.1, 1.0).with_tokens(7).with_custom("tokens", 999);
        assert!(update.custom.is_none());
        update.custom = Some(Map::from_iter([("updated_at".to_string(), Value::from("x"))]));
        let rec = store.record("k", update, false).unwrap();
        assert!(rec.custom.is_empty());

        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(raw.matches("\"tokens\"").count(), 1);
        assert_eq!(store.get("k").unwrap().tokens, 7);
    }

    #[test]
    fn test_token_accumulation_saturates() {
        let (_dir, store) = store();
        store
            .record("k", MetricUpdate::new(0.0, 0.0).with_tokens(u64::MAX - 1), false)
            .unwrap();
        let rec = store
            .record("k", MetricUpdate::new(0.0, 0.0).with_tokens(10), true)
            .unwrap();
        assert_eq!(rec.tokens, u64::MAX);
    }

    #[test]
    fn test_failed_write_leaves_memory_unchanged() {
        let (dir, store) = store();
        store.record("page_0001", MetricUpdate::new(0.5, 1.0), false).unwrap();
        std::fs::remove_file(store.path()).unwrap();
        // 目标路径被非空目录占据，rename 必然失败
        std::fs::create_dir_all(dir.path().join("metrics.json").join("blocker")).unwrap();

        assert!(store.record("page_0001", MetricUpdate::new(0.5, 1.0), true).is_err());
        assert!(store.record("page_0002", MetricUpdate::new(0.5, 1.0), false).is_err());
        assert!((store.total_cost() - 0.5).abs() < 1e-12);
        assert!(store.get("page_0002").is_none());
    }
}
