//! Scriptorium - 文档数字化流水线的编排运行时
//!
//! 模块划分：
//! - **agent**: 工具调用主循环、过程事件、运行日志
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型
//! - **llm**: 传输抽象、重试策略、消息模型、HTTP / Mock 实现
//! - **observability**: 日志初始化
//! - **pipeline**: 线程池批处理
//! - **storage**: Library → Book → Stage 分层存储、检查点、指标、原子写入
//! - **tools**: 工具注册表、执行器、沙箱

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod pipeline;
pub mod storage;
pub mod tools;

pub use agent::{AgentConfig, AgentEvent, AgentLoop, AgentOutcome};
pub use config::{load_config, AppConfig};
pub use llm::{HttpTransport, Message, RetryPolicy, RetryingTransport, Transport};
pub use pipeline::{BatchReport, BatchRunner, UnitFailure, UnitOutput};
pub use storage::{Book, CheckpointTracker, Library, MetricsStore, Stage};
