//! 工具调用主循环
//!
//! 调模型（完整历史 + 工具产出的附加图片）→ 追加 assistant 回复 →
//! 无工具调用：is_complete 为真则成功，否则追加「请继续」提示；
//! 有工具调用：逐个经执行器执行并写回 tool 消息，之后再检查 is_complete。
//! 达到 max_iterations 或传输层重试耗尽即失败。每轮结束后写运行日志。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use crate::agent::run_log::{IterationLog, RunLog, ToolExecutionLog};
use crate::agent::AgentEvent;
use crate::config::AppConfig;
use crate::core::{AgentError, TransportError};
use crate::llm::{ContentPart, Message, RetryPolicy, Transport, Usage};
use crate::storage::{MetricUpdate, MetricsStore};
use crate::tools::ToolExecutor;

/// 模型未调用工具、任务也未完成时追加的提示
pub const CONTINUE_NUDGE: &str =
    "Please continue. Use the available tools to finish the task; call the completion tool when you are done.";

/// 事件预览最大字符数
const RESULT_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub max_iterations: u32,
    /// 单次模型调用超时
    pub request_timeout: Duration,
    /// None 时不写运行日志
    pub run_log_dir: Option<PathBuf>,
    /// 累计花费达到该值后以失败结束（None 不设上限）
    pub max_cost_usd: Option<f64>,
}

impl AgentConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: 0.0,
            max_tokens: None,
            max_iterations: 15,
            request_timeout: Duration::from_secs(120),
            run_log_dir: None,
            max_cost_usd: None,
        }
    }

    pub fn from_app_config(cfg: &AppConfig) -> Self {
        Self {
            model: cfg.llm.model.clone(),
            temperature: cfg.agent.temperature,
            max_tokens: cfg.agent.max_tokens,
            max_iterations: cfg.agent.max_iterations,
            request_timeout: Duration::from_secs(cfg.llm.request_timeout_secs),
            run_log_dir: None,
            max_cost_usd: cfg.agent.max_cost_usd,
        }
    }

    pub fn with_max_iterations(mut self, n: u32) -> Self {
        self.max_iterations = n;
        self
    }

    pub fn with_run_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.run_log_dir = Some(dir.into());
        self
    }

    pub fn with_max_cost(mut self, usd: f64) -> Self {
        self.max_cost_usd = Some(usd);
        self
    }
}

#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub success: bool,
    pub iterations: u32,
    pub total_cost_usd: f64,
    pub final_messages: Vec<Message>,
    pub run_log_path: Option<PathBuf>,
    pub error: Option<String>,
}

/// 单次运行是单线程的；并发来自多个循环实例
pub struct AgentLoop {
    config: AgentConfig,
    policy: RetryPolicy,
    metrics: Option<(Arc<MetricsStore>, String)>,
}

impl AgentLoop {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            policy: RetryPolicy::default(),
            metrics: None,
        }
    }

    /// [agent] / [llm] 段决定循环参数，[retry] 段决定重试策略
    pub fn from_app_config(cfg: &AppConfig) -> Self {
        Self::new(AgentConfig::from_app_config(cfg)).with_retry_policy(RetryPolicy::from(&cfg.retry))
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// 运行结束后把 cost / time / tokens / iterations / success 写入 store[key]
    pub fn with_metrics(mut self, store: Arc<MetricsStore>, key: impl Into<String>) -> Self {
        self.metrics = Some((store, key.into()));
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn run<T: Transport + ?Sized>(
        &self,
        transport: &T,
        initial_messages: Vec<Message>,
        tools: &ToolExecutor,
        is_complete: &dyn Fn(&[Message]) -> bool,
        on_event: Option<&dyn Fn(&AgentEvent)>,
    ) -> AgentOutcome {
        let started = Instant::now();
        let emit = |ev: AgentEvent| {
            if let Some(f) = on_event {
                f(&ev);
            }
        };
        let mut run_log = self.config.run_log_dir.as_deref().map(|dir| {
            RunLog::new(
                dir,
                &self.config.model,
                self.config.temperature,
                self.config.max_iterations,
                &initial_messages,
            )
        });

        let definitions = tools.definitions();
        let mut messages = initial_messages;
        let mut aux_images: Vec<String> = Vec::new();
        let mut total_cost = 0.0;
        let mut total_tokens = 0u64;
        let mut iterations = 0u32;
        let mut success = false;
        let mut error: Option<String> = None;

        while iterations < self.config.max_iterations {
            iterations += 1;
            emit(AgentEvent::IterationStarted {
                iteration: iterations,
                max_iterations: self.config.max_iterations,
            });

            let mut payload = self.build_payload(&messages, &aux_images, &definitions);
            // 被拒收的响应（无法解析）同样计费
            let mut call_cost = 0.0;
            let mut call_tokens = 0u64;
            let response = self.policy.execute(&mut payload, |p| {
                let resp = transport.post(p, self.config.request_timeout)?;
                let usage = Usage::from_response(&resp);
                call_cost += usage.cost_usd;
                call_tokens = call_tokens.saturating_add(usage.total_tokens());
                let reply = parse_reply(&resp)?;
                Ok((resp, reply))
            });
            total_cost += call_cost;
            total_tokens = total_tokens.saturating_add(call_tokens);

            let (raw, reply) = match response.map_err(AgentError::from) {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!(iteration = iterations, error = %e, "agent iteration failed");
                    emit(AgentEvent::Error { text: e.to_string() });
                    error = Some(e.to_string());
                    break;
                }
            };
            emit(AgentEvent::LlmResponse {
                iteration: iterations,
                cost_usd: call_cost,
                total_cost_usd: total_cost,
                tool_calls: reply.tool_calls.len(),
            });
            tracing::debug!(
                iteration = iterations,
                cost_usd = call_cost,
                total_cost_usd = total_cost,
                tool_calls = reply.tool_calls.len(),
                "model replied"
            );

            let tool_calls = reply.tool_calls.clone();
            messages.push(reply);
            let mut executions = Vec::new();

            if tool_calls.is_empty() {
                if is_complete(&messages) {
                    success = true;
                } else {
                    emit(AgentEvent::Nudge { iteration: iterations });
                    messages.push(Message::user(CONTINUE_NUDGE));
                }
            } else {
                for call in &tool_calls {
                    let name = call.function.name.as_str();
                    emit(AgentEvent::ToolCall {
                        tool: name.to_string(),
                        arguments: call.function.arguments.clone(),
                    });
                    let result = tools.execute(name, &call.function.arguments);
                    emit(AgentEvent::ToolResult {
                        tool: name.to_string(),
                        preview: preview(&result.content),
                        is_error: result.is_error,
                        duration_ms: result.duration.as_millis() as u64,
                    });
                    executions.push(ToolExecutionLog {
                        tool_name: name.to_string(),
                        arguments: call.function.arguments.clone(),
                        result: result.content.clone(),
                        duration_seconds: result.duration.as_secs_f64(),
                        is_error: result.is_error,
                    });
                    aux_images.extend(result.images);
                    messages.push(Message::tool_result(call.id.clone(), result.content));
                }
                success = is_complete(&messages);
            }

            if let Some(log) = run_log.as_mut() {
                let entry = IterationLog {
                    iteration: iterations,
                    llm_request: json!({
                        "model": self.config.model,
                        "message_count": messages.len(),
                        "aux_images": aux_images.len(),
                    }),
                    llm_response: crate::agent::run_log::strip_value(raw),
                    tool_executions: executions,
                };
                if let Err(e) = log.push_iteration(entry, total_cost) {
                    tracing::warn!(error = %e, "failed to persist run log");
                }
            }

            if success {
                break;
            }
            if let Some(limit) = self.config.max_cost_usd {
                if total_cost >= limit {
                    let e = AgentError::CostCeiling {
                        spent: total_cost,
                        limit,
                    };
                    tracing::warn!(iteration = iterations, error = %e, "stopping agent run");
                    emit(AgentEvent::Error { text: e.to_string() });
                    error = Some(e.to_string());
                    break;
                }
            }
        }

        if !success && error.is_none() {
            let text = format!("max iterations ({}) reached without completion", self.config.max_iterations);
            tracing::warn!(iterations, "{}", text);
            error = Some(text);
        }

        let run_log_path = run_log.as_mut().map(|log| {
            if let Err(e) = log.finish(success, total_cost, error.clone(), &messages) {
                tracing::warn!(error = %e, "failed to persist run log");
            }
            log.path().to_path_buf()
        });

        if let Some((store, key)) = &self.metrics {
            let update = MetricUpdate::new(total_cost, started.elapsed().as_secs_f64())
                .with_tokens(total_tokens)
                .with_custom("iterations", iterations)
                .with_custom("success", success);
            if let Err(e) = store.record(key, update, false) {
                tracing::warn!(key = %key, error = %e, "failed to record agent metrics");
            }
        }

        emit(AgentEvent::Completed {
            success,
            iterations,
            total_cost_usd: total_cost,
        });
        tracing::info!(success, iterations, total_cost_usd = total_cost, "agent run finished");

        AgentOutcome {
            success,
            iterations,
            total_cost_usd: total_cost,
            final_messages: messages,
            run_log_path,
            error,
        }
    }

    fn build_payload(&self, messages: &[Message], aux_images: &[String], definitions: &[Value]) -> Value {
        let mut wire: Vec<Value> = messages
            .iter()
            .map(|m| serde_json::to_value(m).unwrap_or(Value::Null))
            .collect();
        if !aux_images.is_empty() {
            let mut parts = vec![ContentPart::text("Images produced by tool calls so far:")];
            parts.extend(aux_images.iter().map(|url| ContentPart::image(url.clone())));
            wire.push(serde_json::to_value(Message::user_parts(parts)).unwrap_or(Value::Null));
        }

        let mut payload = json!({
            "model": self.config.model,
            "messages": wire,
            "temperature": self.config.temperature,
        });
        if !definitions.is_empty() {
            payload["tools"] = Value::Array(definitions.to_vec());
        }
        if let Some(max_tokens) = self.config.max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }
        payload
    }
}

/// 缺少 choices[0].message 或无法解析时按 Malformed 处理，交给重试策略
fn parse_reply(response: &Value) -> Result<Message, TransportError> {
    let raw = response
        .pointer("/choices/0/message")
        .ok_or_else(|| TransportError::Malformed("response has no choices[0].message".into()))?;
    serde_json::from_value(raw.clone())
        .map_err(|e| TransportError::Malformed(format!("unparseable choices[0].message: {e}")))
}

fn preview(s: &str) -> String {
    if s.chars().count() > RESULT_PREVIEW_CHARS {
        format!("{}...", s.chars().take(RESULT_PREVIEW_CHARS).collect::<String>())
    } else {
        s.to_string()
    }
}
