//! 运行时错误类型与重试分类
//!
//! 与 RetryPolicy 配合：TransportError::class() 决定重试 / 改写负载后重试 / 立即抛出。

use std::path::PathBuf;

use thiserror::Error;

use crate::storage::UnitId;

/// 传输层错误：对应远端模型调用可能出现的失败（超时、HTTP 状态、响应无法解析）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Network timeout")]
    Timeout,

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Malformed response: {0}")]
    Malformed(String),
}

/// 重试策略看到的错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// 网络超时 / 连接失败 / 5xx / 429：退避后原样重试
    Transient,
    /// 413 / 422：退避后给最后一条用户消息追加随机 nonce 再重试
    TransientMutate,
    /// 响应无法解析：视为服务端抖动，重试
    Malformed,
    /// 其它 4xx：不重试
    Fatal,
}

impl TransportError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TransportError::Timeout | TransportError::Connection(_) => ErrorClass::Transient,
            TransportError::Malformed(_) => ErrorClass::Malformed,
            TransportError::Http { status, .. } => match *status {
                413 | 422 => ErrorClass::TransientMutate,
                429 => ErrorClass::Transient,
                s if s >= 500 => ErrorClass::Transient,
                _ => ErrorClass::Fatal,
            },
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() != ErrorClass::Fatal
    }
}

/// 文件存储错误（页面输出、元数据、指标、断点文件）
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Schema mismatch in {}: {message}", .path.display())]
    Schema { path: PathBuf, message: String },

    #[error("Invalid name {name:?}: must be a single path component")]
    InvalidName { name: String },
}

impl StorageError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}

/// 断点状态机错误
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Stage has {} outstanding unit(s): {remaining:?}", .remaining.len())]
    UnitsOutstanding { remaining: Vec<UnitId> },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// 工具调用错误；在 ToolExecutor 边界被转换为错误字符串，不会中断 Agent 循环
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },

    #[error("Tool {tool} failed: {message}")]
    Failed { tool: String, message: String },

    #[error("Tool {tool} timed out after {seconds:.1}s")]
    TimedOut { tool: String, seconds: f64 },

    #[error("Tool {tool} panicked: {message}")]
    Panicked { tool: String, message: String },
}

/// Agent 循环中的不可恢复错误
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Transport failed after retries: {0}")]
    Transport(#[from] TransportError),

    #[error("Cost ceiling reached: spent ${spent:.4} of ${limit:.4}")]
    CostCeiling { spent: f64, limit: f64 },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// 启动期配置错误：缺少凭据、存储根目录不可用等，不重试
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing API key: environment variable {0} is not set")]
    MissingApiKey(String),

    #[error("Storage root {} is unusable: {source}", .path.display())]
    StorageRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Config load failed: {0}")]
    Load(#[from] config::ConfigError),
}
