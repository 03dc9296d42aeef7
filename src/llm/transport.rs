//! 传输层抽象
//!
//! 所有远端模型调用都经过 Transport::post：输入任意 JSON 负载，返回 JSON 或可分类的 TransportError。
//! 运行时本身不构造任何服务商专有的请求体。

use std::time::Duration;

use serde_json::Value;

use crate::core::TransportError;

/// 阻塞式传输：在调用线程上等待响应，超时由实现负责
pub trait Transport: Send + Sync {
    fn post(&self, payload: &Value, timeout: Duration) -> Result<Value, TransportError>;
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn post(&self, payload: &Value, timeout: Duration) -> Result<Value, TransportError> {
        (**self).post(payload, timeout)
    }
}

impl<T: Transport + ?Sized> Transport for &T {
    fn post(&self, payload: &Value, timeout: Duration) -> Result<Value, TransportError> {
        (**self).post(payload, timeout)
    }
}

/// 单次调用的用量（来自响应的 usage 字段；cost 缺失时记 0）
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
}

impl Usage {
    pub fn from_response(response: &Value) -> Self {
        let usage = &response["usage"];
        Self {
            prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
            completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
            cost_usd: usage["cost"].as_f64().unwrap_or(0.0).max(0.0),
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}
