//! 重试策略：错误分类 + 抖动退避 + 负载改写
//!
//! 最多尝试 max_retries 次，最后一次失败原样抛出；没有熔断，唯一上限就是次数。
//! 413 / 422 时给最后一条用户消息追加随机 nonce，绕开服务端对逐字节相同请求的去重缓存。

use std::time::Duration;

use rand::Rng;
use serde_json::Value;

use crate::config::RetrySection;
use crate::core::{ErrorClass, TransportError};
use crate::llm::Transport;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 总尝试次数（含第一次）
    pub max_retries: u32,
    pub base_delay: Duration,
    /// 退避在 base ± jitter 之间均匀分布
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            jitter: Duration::from_millis(1500),
        }
    }
}

impl From<&RetrySection> for RetryPolicy {
    fn from(cfg: &RetrySection) -> Self {
        Self {
            max_retries: cfg.max_retries,
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            jitter: Duration::from_millis(cfg.jitter_ms),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn with_backoff(mut self, base_delay: Duration, jitter: Duration) -> Self {
        self.base_delay = base_delay;
        self.jitter = jitter;
        self
    }

    /// 不等待（测试用）
    pub fn immediate(max_retries: u32) -> Self {
        Self::new(max_retries).with_backoff(Duration::ZERO, Duration::ZERO)
    }

    pub fn backoff(&self) -> Duration {
        let base = self.base_delay.as_secs_f64();
        let jitter = self.jitter.as_secs_f64();
        if jitter <= 0.0 {
            return self.base_delay;
        }
        let offset = rand::thread_rng().gen_range(-jitter..=jitter);
        Duration::from_secs_f64((base + offset).max(0.0))
    }

    /// 执行 call，按错误类别决定是否重试。call 每次都拿到（可能已被改写的）payload。
    pub fn execute<T, F>(&self, payload: &mut Value, mut call: F) -> Result<T, TransportError>
    where
        F: FnMut(&Value) -> Result<T, TransportError>,
    {
        let attempts = self.max_retries.max(1);
        let mut attempt = 1;
        loop {
            let err = match call(payload) {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };

            let class = err.class();
            if class == ErrorClass::Fatal {
                tracing::warn!(attempt, error = %err, "non-retryable transport error");
                return Err(err);
            }
            if attempt >= attempts {
                tracing::error!(attempt, error = %err, "retries exhausted");
                return Err(err);
            }

            let backoff = self.backoff();
            tracing::warn!(
                attempt,
                max = attempts,
                class = ?class,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "transport call failed, retrying"
            );
            if class == ErrorClass::TransientMutate {
                append_nonce(payload);
            }
            if !backoff.is_zero() {
                std::thread::sleep(backoff);
            }
            attempt += 1;
        }
    }
}

/// 给最后一条 user 消息的文本追加短随机串；content 为多段时改最后一个文本段，没有文本段则新增一段
pub fn append_nonce(payload: &mut Value) {
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    let suffix = format!("\n\n[ref:{}]", &nonce[..8]);

    let Some(messages) = payload.get_mut("messages").and_then(Value::as_array_mut) else {
        return;
    };
    let Some(last_user) = messages
        .iter_mut()
        .rev()
        .find(|m| m.get("role").and_then(Value::as_str) == Some("user"))
    else {
        return;
    };

    match last_user.get_mut("content") {
        Some(Value::String(text)) => text.push_str(&suffix),
        Some(Value::Array(parts)) => {
            let last_text = parts.iter().rposition(|p| {
                p.get("type").and_then(Value::as_str) == Some("text") && p["text"].is_string()
            });
            match last_text {
                Some(i) => {
                    if let Some(Value::String(text)) = parts[i].get_mut("text") {
                        text.push_str(&suffix);
                    }
                }
                None => parts.push(serde_json::json!({"type": "text", "text": suffix.trim_start()})),
            }
        }
        _ => {
            last_user["content"] = Value::String(suffix.trim_start().to_string());
        }
    }
}

/// Transport + RetryPolicy + 单次调用超时
pub struct RetryingTransport<T: Transport> {
    inner: T,
    policy: RetryPolicy,
    timeout: Duration,
}

impl<T: Transport> RetryingTransport<T> {
    pub fn new(inner: T, policy: RetryPolicy, timeout: Duration) -> Self {
        Self {
            inner,
            policy,
            timeout,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// 发送 payload；改写过的 payload 不会回写给调用方
    pub fn post(&self, payload: &Value) -> Result<Value, TransportError> {
        let mut payload = payload.clone();
        self.policy
            .execute(&mut payload, |p| self.inner.post(p, self.timeout))
    }
}
