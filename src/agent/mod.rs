//! 工具调用 Agent：主循环、过程事件、运行日志

pub mod events;
pub mod loop_;
pub mod run_log;

pub use events::AgentEvent;
pub use loop_::{AgentConfig, AgentLoop, AgentOutcome, CONTINUE_NUDGE};
pub use run_log::RunLog;
