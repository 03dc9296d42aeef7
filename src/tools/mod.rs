//! 工具层：注册表、永不失败的执行器、带硬超时的沙箱执行

pub mod executor;
pub mod registry;
pub mod sandbox;

pub use executor::{ToolExecutor, ToolInvocation};
pub use registry::{schema_of, FnTool, Tool, ToolOutput, ToolRegistry};
pub use sandbox::{run_with_timeout, CommandTool, SandboxError};
