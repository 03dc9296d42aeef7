//! 阶段断点：逐单元完成状态、子阶段标记与只计一次的成本
//!
//! 状态机 not_started → in_progress → completed 单调推进，只有 reset() 能回退。
//! 每次修改都在持锁期间完成「读-改-写-落盘」，并发标记不同单元不会丢失成本累加。

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::{CheckpointError, StorageError};
use crate::storage::atomic;

/// 单元编号（页码），从 1 开始
pub type UnitId = u32;

/// 续跑时对「已完成」单元的二次校验：输出产物存在且可按预期结构解析才返回 true
pub type UnitValidator = Arc<dyn Fn(UnitId) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    #[default]
    NotStarted,
    InProgress,
    Completed,
}

/// get_status() 的进度部分
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    pub completed: usize,
    pub remaining: usize,
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageStatus {
    pub status: StageState,
    pub progress: Progress,
    pub metadata: Map<String, Value>,
}

/// 断点文件内容
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointFile {
    scan_id: String,
    stage: String,
    #[serde(default)]
    status: StageState,
    #[serde(default)]
    total_pages: u32,
    #[serde(default)]
    completed_pages: BTreeSet<UnitId>,
    #[serde(default)]
    substages: BTreeMap<UnitId, BTreeMap<String, Value>>,
    #[serde(default)]
    created_at: String,
    #[serde(default)]
    updated_at: String,
    #[serde(default)]
    metadata: Map<String, Value>,
}

impl CheckpointFile {
    fn empty(scan_id: &str, stage: &str) -> Self {
        let now = Utc::now().to_rfc3339();
        let mut metadata = Map::new();
        metadata.insert("cost_usd".into(), Value::from(0.0));
        Self {
            scan_id: scan_id.to_string(),
            stage: stage.to_string(),
            status: StageState::NotStarted,
            total_pages: 0,
            completed_pages: BTreeSet::new(),
            substages: BTreeMap::new(),
            created_at: now.clone(),
            updated_at: now,
            metadata,
        }
    }

    fn cost(&self) -> f64 {
        self.metadata
            .get("cost_usd")
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
    }

    fn add_cost(&mut self, cost_usd: f64) {
        let total = self.cost() + cost_usd.max(0.0);
        self.metadata.insert("cost_usd".into(), Value::from(total));
    }

    fn remaining(&self) -> Vec<UnitId> {
        (1..=self.total_pages)
            .filter(|u| !self.completed_pages.contains(u))
            .collect()
    }

    fn start(&mut self) {
        if self.status == StageState::NotStarted {
            self.status = StageState::InProgress;
        }
    }
}

/// 阶段断点跟踪器
pub struct CheckpointTracker {
    path: PathBuf,
    state: Mutex<CheckpointFile>,
    validator: Mutex<Option<UnitValidator>>,
}

impl std::fmt::Debug for CheckpointTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointTracker")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl CheckpointTracker {
    /// 打开 path 处的断点文件；不存在时新建空状态，无法解析时记 warn 后新建
    pub fn open(path: impl AsRef<Path>, scan_id: &str, stage: &str) -> Self {
        let path = path.as_ref().to_path_buf();
        let state = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<CheckpointFile>(&raw) {
                Ok(file) => file,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "checkpoint unreadable, starting empty");
                    CheckpointFile::empty(scan_id, stage)
                }
            },
            Err(_) => CheckpointFile::empty(scan_id, stage),
        };
        Self {
            path,
            state: Mutex::new(state),
            validator: Mutex::new(None),
        }
    }

    /// 安装续跑校验器（Stage 会安装「页面文件存在且可解析」的默认校验）
    pub fn set_validator(&self, validator: UnitValidator) {
        *self.validator.lock().unwrap_or_else(|e| e.into_inner()) = Some(validator);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, CheckpointFile> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 把修改后的副本落盘，成功后才替换内存状态；失败时内存保持与磁盘一致
    fn commit(
        &self,
        guard: &mut MutexGuard<'_, CheckpointFile>,
        mut next: CheckpointFile,
    ) -> Result<(), StorageError> {
        next.updated_at = Utc::now().to_rfc3339();
        atomic::write_json(&self.path, &next)?;
        **guard = next;
        Ok(())
    }

    /// 返回待处理单元。resume=false 时返回 1..=total；resume=true 时返回
    /// 全部单元减去「断点记录已完成且校验器确认产物仍在」的单元。
    pub fn get_remaining_units(
        &self,
        total_units: u32,
        resume: bool,
    ) -> Result<Vec<UnitId>, StorageError> {
        let validator = self
            .validator
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut guard = self.lock();
        let mut state = guard.clone();
        state.total_pages = total_units;

        if resume {
            if let Some(validate) = validator {
                let drifted: Vec<UnitId> = state
                    .completed_pages
                    .iter()
                    .copied()
                    .filter(|u| *u <= total_units && !validate(*u))
                    .collect();
                for unit in &drifted {
                    state.completed_pages.remove(unit);
                    state.substages.remove(unit);
                }
                if !drifted.is_empty() {
                    tracing::warn!(
                        stage = %state.stage,
                        units = ?drifted,
                        "checkpoint marked units complete but outputs are missing or invalid"
                    );
                    if state.status == StageState::Completed {
                        state.status = StageState::InProgress;
                    }
                }
            }
        }

        let remaining = if resume {
            state.remaining()
        } else {
            (1..=total_units).collect()
        };
        if !remaining.is_empty() {
            state.start();
        }
        self.commit(&mut guard, state)?;

        tracing::info!(
            stage = %guard.stage,
            total = total_units,
            remaining = remaining.len(),
            resume,
            "remaining units resolved"
        );
        Ok(remaining)
    }

    /// 标记单元完成。重复标记不会再次累加成本（崩溃续跑后重标不重复计费）。
    /// 返回 true 表示本次是首次标记。
    pub fn mark_completed(&self, unit: UnitId, cost_usd: f64) -> Result<bool, StorageError> {
        let mut guard = self.lock();
        if guard.completed_pages.contains(&unit) {
            tracing::debug!(stage = %guard.stage, unit, "unit already completed, cost not re-added");
            return Ok(false);
        }
        let mut state = guard.clone();
        state.completed_pages.insert(unit);
        state.add_cost(cost_usd);
        state.start();
        self.commit(&mut guard, state)?;
        Ok(true)
    }

    /// 标记 (unit, substage) 完成。值总会刷新，成本只在首次标记时累加。
    pub fn mark_substage_completed(
        &self,
        unit: UnitId,
        substage: &str,
        value: impl Into<Value>,
        cost_usd: f64,
    ) -> Result<bool, StorageError> {
        let mut guard = self.lock();
        let mut state = guard.clone();
        let first = !state
            .substages
            .get(&unit)
            .is_some_and(|m| m.contains_key(substage));
        state
            .substages
            .entry(unit)
            .or_default()
            .insert(substage.to_string(), value.into());
        if first {
            state.add_cost(cost_usd);
        }
        state.start();
        self.commit(&mut guard, state)?;
        Ok(first)
    }

    /// 阶段终态。仍有未完成单元时返回 UnitsOutstanding，除非 force。
    pub fn mark_stage_complete(
        &self,
        metadata: Map<String, Value>,
        force: bool,
    ) -> Result<(), CheckpointError> {
        let mut guard = self.lock();
        let mut state = guard.clone();
        let remaining = state.remaining();
        if !remaining.is_empty() && !force {
            return Err(CheckpointError::UnitsOutstanding { remaining });
        }
        for (k, v) in metadata {
            if k != "cost_usd" {
                state.metadata.insert(k, v);
            }
        }
        state
            .metadata
            .insert("completed_at".into(), Value::from(Utc::now().to_rfc3339()));
        state.status = StageState::Completed;
        self.commit(&mut guard, state)?;
        tracing::info!(stage = %guard.stage, cost_usd = guard.cost(), forced = force && !remaining.is_empty(), "stage complete");
        Ok(())
    }

    pub fn get_status(&self) -> StageStatus {
        let state = self.lock();
        let completed = state
            .completed_pages
            .iter()
            .filter(|u| **u <= state.total_pages)
            .count();
        let total = state.total_pages as usize;
        let percent = if total == 0 {
            0.0
        } else {
            (completed as f64 / total as f64) * 100.0
        };
        StageStatus {
            status: state.status,
            progress: Progress {
                completed,
                remaining: total.saturating_sub(completed),
                percent,
            },
            metadata: state.metadata.clone(),
        }
    }

    pub fn is_completed(&self, unit: UnitId) -> bool {
        self.lock().completed_pages.contains(&unit)
    }

    pub fn completed_units(&self) -> Vec<UnitId> {
        self.lock().completed_pages.iter().copied().collect()
    }

    pub fn is_substage_completed(&self, unit: UnitId, substage: &str) -> bool {
        self.substage_value(unit, substage).is_some()
    }

    pub fn substage_value(&self, unit: UnitId, substage: &str) -> Option<Value> {
        self.lock()
            .substages
            .get(&unit)
            .and_then(|m| m.get(substage))
            .cloned()
    }

    pub fn cumulative_cost(&self) -> f64 {
        self.lock().cost()
    }

    /// 清空断点（唯一允许的状态回退）
    pub fn reset(&self) -> Result<(), StorageError> {
        let mut guard = self.lock();
        let fresh = CheckpointFile::empty(&guard.scan_id, &guard.stage);
        self.commit(&mut guard, fresh)
    }
}
