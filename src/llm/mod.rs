//! LLM 层：传输抽象、重试策略、消息模型与实现（HTTP / 脚本化 Mock）

pub mod http;
pub mod message;
pub mod mock;
pub mod retry;
pub mod transport;

pub use http::HttpTransport;
pub use message::{ContentPart, FunctionCall, ImageUrl, Message, MessageContent, Role, ToolCall};
pub use mock::ScriptedTransport;
pub use retry::{append_nonce, RetryPolicy, RetryingTransport};
pub use transport::{Transport, Usage};
