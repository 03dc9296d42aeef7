//! 脚本化传输（用于测试，无需 API）
//!
//! 按顺序回放预设结果；队列耗尽后重复最后一条。记录每次收到的负载，便于断言重试次数与 nonce 改写。

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{json, Value};

use crate::core::TransportError;
use crate::llm::Transport;

#[derive(Debug, Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<Value, TransportError>>>,
    last: Mutex<Option<Result<Value, TransportError>>>,
    requests: Mutex<Vec<Value>>,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Result<Value, TransportError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    /// 永远返回同一个结果
    pub fn always(outcome: Result<Value, TransportError>) -> Self {
        Self::new(vec![outcome])
    }

    pub fn push(&self, outcome: Result<Value, TransportError>) {
        self.script.lock().unwrap_or_else(|e| e.into_inner()).push_back(outcome);
    }

    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Transport for ScriptedTransport {
    fn post(&self, payload: &Value, _timeout: Duration) -> Result<Value, TransportError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(payload.clone());
        let next = self.script.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        match next {
            Some(outcome) => {
                *last = Some(outcome.clone());
                outcome
            }
            None => last
                .clone()
                .unwrap_or_else(|| Err(TransportError::Malformed("script exhausted".into()))),
        }
    }
}

/// 构造一条 chat completion 响应（纯文本回复）
pub fn text_reply(text: &str, cost_usd: f64) -> Value {
    json!({
        "choices": [{"message": {"role": "assistant", "content": text}}],
        "usage": {"prompt_tokens": 10, "completion_tokens": 5, "cost": cost_usd}
    })
}

/// 构造一条只含单个工具调用的响应
pub fn tool_call_reply(call_id: &str, name: &str, arguments: Value, cost_usd: f64) -> Value {
    json!({
        "choices": [{"message": {
            "role": "assistant",
            "content": null,
            "tool_calls": [{
                "id": call_id,
                "type": "function",
                "function": {"name": name, "arguments": arguments.to_string()}
            }]
        }}],
        "usage": {"prompt_tokens": 10, "completion_tokens": 5, "cost": cost_usd}
    })
}
