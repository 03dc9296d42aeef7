//! 批处理：有界线程池逐单元处理一个 Stage
//!
//! 每个单元的顺序固定：计算 → 写页面文件 → 记录指标 → 标记检查点。
//! 崩溃发生在任一步之间时，未标记的单元会在下次 resume 时重做；已标记的单元都有完整输出。
//! 单元失败只记入报告，不影响其它单元；失败单元已花费的成本照样计入指标与报告。
//! 同一单元的指标记录跨次累加（重试、续跑的花费都算在该页上）。没有失败时把 Stage 标记为完成。

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use rayon::prelude::*;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use crate::config::WorkersSection;
use crate::core::StorageError;
use crate::storage::{page_file_name, MetricUpdate, Stage, UnitId};

/// 单元处理结果：要写入页面文件的输出 + 用量
#[derive(Debug, Clone)]
pub struct UnitOutput<T> {
    pub output: T,
    pub cost_usd: f64,
    pub tokens: u64,
    /// 额外写入该单元指标记录的字段
    pub custom: Map<String, Value>,
}

impl<T> UnitOutput<T> {
    pub fn new(output: T, cost_usd: f64) -> Self {
        Self {
            output,
            cost_usd,
            tokens: 0,
            custom: Map::new(),
        }
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_custom(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.custom.insert(key.into(), value.into());
        self
    }
}

/// 单元失败：原因 + 失败前已花掉的成本
#[derive(Debug, Clone, PartialEq)]
pub struct UnitFailure {
    pub reason: String,
    pub cost_usd: f64,
}

impl UnitFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            cost_usd: 0.0,
        }
    }

    pub fn with_cost(mut self, cost_usd: f64) -> Self {
        self.cost_usd = cost_usd;
        self
    }
}

impl From<String> for UnitFailure {
    fn from(reason: String) -> Self {
        Self::new(reason)
    }
}

impl From<&str> for UnitFailure {
    fn from(reason: &str) -> Self {
        Self::new(reason)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: Vec<(UnitId, String)>,
    /// resume 时已完成、未重做的单元数（含取消后未开始的单元）
    pub skipped: usize,
    /// 成功与失败单元的花费之和
    pub total_cost_usd: f64,
    pub elapsed: Duration,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

enum UnitResult {
    Done(f64),
    Failed(UnitId, String, f64),
    Skipped,
}

pub struct BatchRunner {
    threads: usize,
    resume: bool,
    cancel: CancellationToken,
}

impl BatchRunner {
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
            resume: true,
            cancel: CancellationToken::new(),
        }
    }

    pub fn from_config(cfg: &WorkersSection) -> Self {
        Self::new(cfg.threads)
    }

    /// resume=false 时重新处理全部单元（不清空检查点）
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// 取消后尚未开始的单元被跳过；进行中的单元照常完成
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn run<T, F>(&self, stage: &Stage, total_units: u32, processor: F) -> Result<BatchReport, StorageError>
    where
        T: Serialize + Send,
        F: Fn(UnitId) -> Result<UnitOutput<T>, UnitFailure> + Sync,
    {
        let started = Instant::now();
        let remaining = stage
            .checkpoint()
            .get_remaining_units(total_units, self.resume)?;
        let already_done = (total_units as usize).saturating_sub(remaining.len());
        tracing::info!(
            stage = stage.name(),
            total_units,
            remaining = remaining.len(),
            threads = self.threads,
            "batch started"
        );

        let work = |unit: UnitId| self.process_unit(stage, unit, &processor);
        let results: Vec<UnitResult> = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .build()
            .map(|pool| pool.install(|| remaining.par_iter().map(|u| work(*u)).collect()))
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "thread pool unavailable, processing sequentially");
                remaining.iter().map(|u| work(*u)).collect()
            });

        let mut report = BatchReport {
            skipped: already_done,
            ..BatchReport::default()
        };
        for r in results {
            match r {
                UnitResult::Done(cost) => {
                    report.attempted += 1;
                    report.succeeded += 1;
                    report.total_cost_usd += cost;
                }
                UnitResult::Failed(unit, reason, cost) => {
                    report.attempted += 1;
                    report.total_cost_usd += cost;
                    report.failed.push((unit, reason));
                }
                UnitResult::Skipped => report.skipped += 1,
            }
        }
        report.failed.sort_by_key(|(unit, _)| *unit);
        report.elapsed = started.elapsed();

        if report.failed.is_empty() && !self.cancel.is_cancelled() {
            let mut metadata = Map::new();
            metadata.insert("units_processed".into(), json!(report.succeeded));
            metadata.insert("batch_elapsed_seconds".into(), json!(report.elapsed.as_secs_f64()));
            if let Err(e) = stage.checkpoint().mark_stage_complete(metadata, false) {
                tracing::warn!(stage = stage.name(), error = %e, "stage not marked complete");
            }
        }

        tracing::info!(
            stage = stage.name(),
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed.len(),
            skipped = report.skipped,
            total_cost_usd = report.total_cost_usd,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "batch finished"
        );
        Ok(report)
    }

    fn process_unit<T, F>(&self, stage: &Stage, unit: UnitId, processor: &F) -> UnitResult
    where
        T: Serialize,
        F: Fn(UnitId) -> Result<UnitOutput<T>, UnitFailure>,
    {
        if self.cancel.is_cancelled() {
            return UnitResult::Skipped;
        }
        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| processor(unit)))
            .unwrap_or_else(|_| Err(UnitFailure::new("processor panicked")));
        let out = match outcome {
            Ok(out) => out,
            Err(failure) => {
                tracing::warn!(
                    stage = stage.name(),
                    unit,
                    reason = %failure.reason,
                    cost_usd = failure.cost_usd,
                    "unit failed"
                );
                record_failure(stage, unit, &failure, started.elapsed());
                return UnitResult::Failed(unit, failure.reason, failure.cost_usd);
            }
        };

        let cost = out.cost_usd;
        match persist_unit(stage, unit, out, started.elapsed()) {
            Ok(()) => UnitResult::Done(cost),
            Err(e) => {
                tracing::error!(stage = stage.name(), unit, error = %e, "unit output not persisted");
                UnitResult::Failed(unit, e.to_string(), cost)
            }
        }
    }
}

fn metric_key(unit: UnitId) -> String {
    page_file_name(unit).trim_end_matches(".json").to_string()
}

fn persist_unit<T: Serialize>(
    stage: &Stage,
    unit: UnitId,
    out: UnitOutput<T>,
    elapsed: Duration,
) -> Result<(), StorageError> {
    stage.save_page(unit, &out.output)?;

    let mut update = MetricUpdate::new(out.cost_usd, elapsed.as_secs_f64())
        .with_tokens(out.tokens)
        .with_custom("failed", false);
    for (k, v) in out.custom {
        update = update.with_custom(k, v);
    }
    stage.metrics().record(&metric_key(unit), update, true)?;

    stage.checkpoint().mark_completed(unit, out.cost_usd)?;
    Ok(())
}

/// 失败单元不写页面、不标记检查点，只把花费记入指标；记录失败不影响报告
fn record_failure(stage: &Stage, unit: UnitId, failure: &UnitFailure, elapsed: Duration) {
    let update = MetricUpdate::new(failure.cost_usd, elapsed.as_secs_f64())
        .with_custom("failed", true)
        .with_custom("error", failure.reason.clone());
    if let Err(e) = stage.metrics().record(&metric_key(unit), update, true) {
        tracing::warn!(stage = stage.name(), unit, error = %e, "failure metrics not recorded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Library, StageState};

    #[test]
    fn test_all_units_processed_and_stage_completed() {
        let dir = tempfile::tempdir().unwrap();
        let lib = Library::open(dir.path()).unwrap();
        let stage = lib.stage("book", "ocr").unwrap();

        let report = BatchRunner::new(3)
            .run(&stage, 6, |unit| Ok(UnitOutput::new(json!({"page": unit}), 0.01)))
            .unwrap();
        assert_eq!(report.succeeded, 6);
        assert!(report.is_success());
        assert!((report.total_cost_usd - 0.06).abs() < 1e-9);
        assert_eq!(stage.list_pages().unwrap(), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(stage.checkpoint().get_status().status, StageState::Completed);
        assert!(stage.metrics().get("page_0003").is_some());
    }

    #[test]
    fn test_failures_reported_and_stage_left_open() {
        let dir = tempfile::tempdir().unwrap();
        let lib = Library::open(dir.path()).unwrap();
        let stage = lib.stage("book", "ocr").unwrap();

        let report = BatchRunner::new(2)
            .run(&stage, 4, |unit| {
                if unit == 2 {
                    Err(UnitFailure::new("model refused").with_cost(0.04))
                } else if unit == 3 {
                    panic!("bad page")
                } else {
                    Ok(UnitOutput::new(json!({}), 0.0))
                }
            })
            .unwrap();
        assert_eq!(report.attempted, 4);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed[0], (2, "model refused".to_string()));
        assert_eq!(report.failed[1].0, 3);
        assert_eq!(stage.checkpoint().get_status().status, StageState::InProgress);
        assert!(!stage.checkpoint().is_completed(2));

        // 失败单元的花费进入报告与指标，但不计入检查点
        assert!((report.total_cost_usd - 0.04).abs() < 1e-12);
        let failed = stage.metrics().get("page_0002").unwrap();
        assert!((failed.cost_usd - 0.04).abs() < 1e-12);
        assert_eq!(failed.custom["failed"], true);
        assert_eq!(failed.custom["error"], "model refused");
        assert_eq!(stage.metrics().get("page_0003").unwrap().custom["error"], "processor panicked");
        assert_eq!(stage.checkpoint().cumulative_cost(), 0.0);

        // 重跑只处理失败的单元；该页指标累加两次的花费
        let report = BatchRunner::new(2)
            .run(&stage, 4, |_| Ok(UnitOutput::new(json!({}), 0.01)))
            .unwrap();
        assert_eq!(report.attempted, 2);
        assert_eq!(report.skipped, 2);
        assert_eq!(stage.checkpoint().get_status().status, StageState::Completed);
        let retried = stage.metrics().get("page_0002").unwrap();
        assert!((retried.cost_usd - 0.05).abs() < 1e-12);
        assert_eq!(retried.custom["failed"], false);
        assert!((stage.checkpoint().cumulative_cost() - 0.02).abs() < 1e-12);
    }

    #[test]
    fn test_string_errors_convert_to_failures() {
        let dir = tempfile::tempdir().unwrap();
        let lib = Library::open(dir.path()).unwrap();
        let stage = lib.stage("book", "ocr").unwrap();
        let lookup: Option<u32> = None;

        let report = BatchRunner::new(1)
            .run(&stage, 1, |_| {
                let n = lookup.ok_or("no source image")?;
                Ok(UnitOutput::new(json!({ "n": n }), 0.0))
            })
            .unwrap();
        assert_eq!(report.failed, vec![(1, "no source image".to_string())]);
        assert_eq!(report.total_cost_usd, 0.0);
    }

    #[test]
    fn test_cancelled_runner_skips_units() {
        let dir = tempfile::tempdir().unwrap();
        let lib = Library::open(dir.path()).unwrap();
        let stage = lib.stage("book", "ocr").unwrap();
        let runner = BatchRunner::new(2);
        runner.cancel_token().cancel();
        let report = runner
            .run(&stage, 3, |_| Ok(UnitOutput::new(json!({}), 0.0)))
            .unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(report.skipped, 3);
    }
}
