//! 运行日志：每轮结束后原子写入一次，崩溃时也能看到已完成的轮次
//!
//! 写盘前剥离图片 data URL（替换为 `[image: N bytes]`）与 reasoning_details（替换为大小标记）。

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};

use crate::core::StorageError;
use crate::llm::Message;
use crate::storage::atomic;

#[derive(Debug, Clone, Serialize)]
pub struct RunMetadata {
    pub model: String,
    pub temperature: f32,
    pub max_iterations: u32,
    pub start_time: String,
    pub end_time: Option<String>,
    pub success: Option<bool>,
    pub total_cost_usd: f64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolExecutionLog {
    pub tool_name: String,
    pub arguments: String,
    pub result: String,
    pub duration_seconds: f64,
    pub is_error: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct IterationLog {
    pub iteration: u32,
    pub llm_request: Value,
    pub llm_response: Value,
    pub tool_executions: Vec<ToolExecutionLog>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunLog {
    #[serde(skip)]
    path: PathBuf,
    pub metadata: RunMetadata,
    pub initial_messages: Vec<Value>,
    pub iterations: Vec<IterationLog>,
    pub final_messages: Vec<Value>,
}

impl RunLog {
    /// 在 dir 下创建 run_<时间戳>_<短 id>.json（首次 persist 时才落盘）
    pub fn new(
        dir: &Path,
        model: &str,
        temperature: f32,
        max_iterations: u32,
        initial_messages: &[Message],
    ) -> Self {
        let now = Utc::now();
        let id = uuid::Uuid::new_v4().simple().to_string();
        let file = format!("run_{}_{}.json", now.format("%Y%m%d_%H%M%S"), &id[..8]);
        Self {
            path: dir.join(file),
            metadata: RunMetadata {
                model: model.to_string(),
                temperature,
                max_iterations,
                start_time: now.to_rfc3339(),
                end_time: None,
                success: None,
                total_cost_usd: 0.0,
                error: None,
            },
            initial_messages: strip_messages(initial_messages),
            iterations: Vec::new(),
            final_messages: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn push_iteration(&mut self, iteration: IterationLog, total_cost_usd: f64) -> Result<(), StorageError> {
        self.iterations.push(iteration);
        self.metadata.total_cost_usd = total_cost_usd;
        self.persist()
    }

    pub fn finish(
        &mut self,
        success: bool,
        total_cost_usd: f64,
        error: Option<String>,
        final_messages: &[Message],
    ) -> Result<(), StorageError> {
        self.metadata.end_time = Some(Utc::now().to_rfc3339());
        self.metadata.success = Some(success);
        self.metadata.total_cost_usd = total_cost_usd;
        self.metadata.error = error;
        self.final_messages = strip_messages(final_messages);
        self.persist()
    }

    fn persist(&self) -> Result<(), StorageError> {
        atomic::write_json(&self.path, self)
    }
}

pub fn strip_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| strip_value(serde_json::to_value(m).unwrap_or(Value::Null)))
        .collect()
}

/// 递归剥离：data URL → `[image: N bytes]`，reasoning_details → `[reasoning: N bytes]`
pub fn strip_value(value: Value) -> Value {
    match value {
        Value::String(s) => match image_size(&s) {
            Some(n) => Value::String(format!("[image: {n} bytes]")),
            None => Value::String(s),
        },
        Value::Array(items) => Value::Array(items.into_iter().map(strip_value).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| {
                    if k == "reasoning_details" && !v.is_null() {
                        let n = v.to_string().len();
                        (k, json!(format!("[reasoning: {n} bytes]")))
                    } else {
                        (k, strip_value(v))
                    }
                })
                .collect(),
        ),
        other => other,
    }
}

/// base64 data URL 的解码后大小
fn image_size(s: &str) -> Option<usize> {
    if !s.starts_with("data:") {
        return None;
    }
    let (_, payload) = s.split_once(";base64,")?;
    let padding = payload.bytes().rev().take_while(|b| *b == b'=').count();
    Some((payload.len() * 3 / 4).saturating_sub(padding))
}
