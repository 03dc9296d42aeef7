//! 工具执行器
//!
//! 持有 ToolRegistry，execute(tool_name, raw_arguments) 解析参数并调用 registry.execute；
//! 未知工具、参数错误、工具失败、超时乃至 panic 都转成 `{"error": "..."}` 字符串交还给模型，从不向循环抛错。
//! 每次调用输出结构化审计日志（JSON）。

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use crate::core::ToolError;
use crate::tools::{ToolOutput, ToolRegistry};

/// 一次工具调用的结果（已转为可回传模型的文本）
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub content: String,
    pub images: Vec<String>,
    pub is_error: bool,
    pub duration: Duration,
}

pub struct ToolExecutor {
    registry: ToolRegistry,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    pub fn definitions(&self) -> Vec<Value> {
        self.registry.definitions()
    }

    /// 执行指定工具；raw_arguments 为模型给出的 JSON 字符串（可为空）
    pub fn execute(&self, tool_name: &str, raw_arguments: &str) -> ToolInvocation {
        let start = Instant::now();
        let preview = args_preview(raw_arguments);

        let result = parse_arguments(tool_name, raw_arguments).and_then(|args| {
            catch_unwind(AssertUnwindSafe(|| self.registry.execute(tool_name, args)))
                .unwrap_or_else(|payload| {
                    Err(ToolError::Panicked {
                        tool: tool_name.to_string(),
                        message: panic_message(payload.as_ref()),
                    })
                })
        });

        let duration = start.elapsed();
        let outcome = match &result {
            Ok(_) => "ok",
            Err(ToolError::TimedOut { .. }) => "timeout",
            Err(ToolError::Panicked { .. }) => "panic",
            Err(_) => "error",
        };
        let audit = json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": result.is_ok(),
            "outcome": outcome,
            "duration_ms": duration.as_millis() as u64,
            "args_preview": preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(ToolOutput { content, images }) => ToolInvocation {
                content,
                images,
                is_error: false,
                duration,
            },
            Err(e) => ToolInvocation {
                content: json!({ "error": e.to_string() }).to_string(),
                images: Vec::new(),
                is_error: true,
                duration,
            },
        }
    }
}

fn parse_arguments(tool_name: &str, raw: &str) -> Result<Value, ToolError> {
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(raw).map_err(|e| ToolError::InvalidArguments {
        tool: tool_name.to_string(),
        message: format!("arguments are not valid JSON: {e}"),
    })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "tool panicked".to_string()
    }
}

fn args_preview(args: &str) -> String {
    if args.chars().count() > 200 {
        format!("{}...", args.chars().take(200).collect::<String>())
    } else {
        args.to_string()
    }
}
