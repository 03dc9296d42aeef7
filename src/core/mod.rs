//! 核心层：错误类型与重试分类

pub mod error;

pub use error::{
    AgentError, CheckpointError, ConfigError, ErrorClass, StorageError, ToolError, TransportError,
};
