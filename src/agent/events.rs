//! 工具调用循环过程事件：用于进度展示与调试（可序列化为 JSON）

use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// 第几轮（从 1 开始）
    IterationStarted { iteration: u32, max_iterations: u32 },
    /// 模型返回；cost 为本次调用，total_cost 为累计
    LlmResponse {
        iteration: u32,
        cost_usd: f64,
        total_cost_usd: f64,
        tool_calls: usize,
    },
    ToolCall {
        tool: String,
        arguments: String,
    },
    /// 工具结果（预览，避免过长）
    ToolResult {
        tool: String,
        preview: String,
        is_error: bool,
        duration_ms: u64,
    },
    /// 模型未调用工具且尚未完成，追加了继续提示
    Nudge { iteration: u32 },
    Completed {
        success: bool,
        iterations: u32,
        total_cost_usd: f64,
    },
    Error { text: String },
}
