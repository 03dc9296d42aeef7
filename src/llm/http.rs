//! OpenAI 兼容 HTTP 传输
//!
//! 通过 reqwest 阻塞客户端 POST {base_url}/chat/completions（OpenRouter、OpenAI、自建代理等），
//! 把超时 / HTTP 状态 / 响应解析失败映射为 TransportError。

use std::time::Duration;

use reqwest::blocking::Client;
use serde_json::Value;

use crate::config::LlmSection;
use crate::core::{ConfigError, TransportError};
use crate::llm::Transport;

/// 错误响应体截断长度
const ERROR_BODY_CHARS: usize = 500;

pub struct HttpTransport {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key: api_key.into(),
        }
    }

    /// 从 [llm] 配置构造；API Key 缺失为致命配置错误
    pub fn from_config(cfg: &LlmSection) -> Result<Self, ConfigError> {
        let api_key = crate::config::resolve_api_key(cfg)?;
        Ok(Self::new(&cfg.base_url, api_key))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Transport for HttpTransport {
    fn post(&self, payload: &Value, timeout: Duration) -> Result<Value, TransportError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .timeout(timeout)
            .json(payload)
            .send()
            .map_err(map_reqwest_error)?;

        let status = response.status();
        let body = response.text().map_err(map_reqwest_error)?;
        if !status.is_success() {
            return Err(TransportError::Http {
                status: status.as_u16(),
                message: body.chars().take(ERROR_BODY_CHARS).collect(),
            });
        }

        let value: Value = serde_json::from_str(&body)
            .map_err(|e| TransportError::Malformed(format!("invalid JSON body: {e}")))?;
        // 部分服务商在 200 响应里携带 error 对象
        if let Some(err) = value.get("error") {
            return Err(TransportError::Http {
                status: provider_error_status(err),
                message: err["message"].as_str().unwrap_or("provider error").to_string(),
            });
        }
        if value.get("choices").and_then(Value::as_array).map_or(true, |c| c.is_empty()) {
            return Err(TransportError::Malformed("response has no choices".into()));
        }
        Ok(value)
    }
}

/// 200 响应内 error.code 的 HTTP 状态；缺失或超出 u16 时按 500 处理
fn provider_error_status(err: &Value) -> u16 {
    err["code"]
        .as_u64()
        .and_then(|code| u16::try_from(code).ok())
        .unwrap_or(500)
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_decode() || e.is_body() {
        TransportError::Malformed(e.to_string())
    } else {
        TransportError::Connection(e.to_string())
    }
}
