//! 沙箱执行：可取消计时器 + 子进程解释器工具
//!
//! run_with_timeout 在独立线程上运行任务，超过硬时限或上层令牌取消时取消子令牌并立即返回 TimedOut，
//! 任务应通过令牌感知取消（CommandTool 会据此 kill 子进程）。跨平台，不依赖信号。

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::config::ToolsSection;
use crate::core::ToolError;
use crate::tools::{Tool, ToolOutput};

/// 等待结果时检查上层令牌的间隔
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// 禁止出现在代码中的子串（即使解释器允许）
const FORBIDDEN_SUBSTR: &[&str] = &["rm -rf", "mkfs", "dd if=", ":(){ :|:& };:"];

/// 输出截断长度
const MAX_OUTPUT_CHARS: usize = 20_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxError {
    TimedOut,
    Cancelled,
    /// 任务线程 panic
    Crashed,
}

/// 在新线程上运行 task，最多等待 limit。task 收到的子令牌在超时或上层取消时被取消。
pub fn run_with_timeout<T, F>(
    limit: Duration,
    parent: &CancellationToken,
    task: F,
) -> Result<T, SandboxError>
where
    T: Send + 'static,
    F: FnOnce(CancellationToken) -> T + Send + 'static,
{
    let token = parent.child_token();
    let worker_token = token.clone();
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(task(worker_token));
    });

    let deadline = Instant::now() + limit;
    loop {
        if parent.is_cancelled() {
            token.cancel();
            return Err(SandboxError::Cancelled);
        }
        let now = Instant::now();
        if now >= deadline {
            token.cancel();
            return Err(SandboxError::TimedOut);
        }
        match rx.recv_timeout(POLL_INTERVAL.min(deadline - now)) {
            Ok(v) => return Ok(v),
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => return Err(SandboxError::Crashed),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CodeArgs {
    code: String,
}

/// 解释器工具：`program base_args... <code>`，带硬超时与取消
///
/// 例如 `CommandTool::new("run_python", "python3", ["-c"], 5s)`；模型传入 `{"code": "..."}`。
pub struct CommandTool {
    name: String,
    program: String,
    base_args: Vec<String>,
    timeout: Duration,
    cancel: CancellationToken,
}

impl CommandTool {
    pub fn new<I, S>(name: &str, program: &str, base_args: I, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.to_string(),
            program: program.to_string(),
            base_args: base_args.into_iter().map(Into::into).collect(),
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    /// 超时取自 [tools] 段
    pub fn from_config<I, S>(name: &str, program: &str, base_args: I, cfg: &ToolsSection) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(name, program, base_args, Duration::from_secs(cfg.sandbox_timeout_secs))
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 与外部（如批处理关闭）共享取消令牌
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    fn check_code(code: &str) -> Result<(), String> {
        if code.trim().is_empty() {
            return Err("Empty code".to_string());
        }
        let lower = code.to_lowercase();
        for forbidden in FORBIDDEN_SUBSTR {
            if lower.contains(forbidden) {
                return Err(format!("Forbidden pattern: {forbidden}"));
            }
        }
        Ok(())
    }
}

impl Tool for CommandTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Run a short program in a sandboxed interpreter with a hard time limit. Args: {\"code\": \"...\"}"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "code": {"type": "string", "description": "Program source to execute"}
            },
            "required": ["code"]
        })
    }

    fn execute(&self, args: Value) -> Result<ToolOutput, ToolError> {
        let args: CodeArgs = serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments {
            tool: self.name.clone(),
            message: e.to_string(),
        })?;
        Self::check_code(&args.code).map_err(|message| ToolError::Failed {
            tool: self.name.clone(),
            message,
        })?;

        tracing::info!(tool = %self.name, program = %self.program, "sandbox execute");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.base_args)
            .arg(&args.code)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let child = cmd.spawn().map_err(|e| ToolError::Failed {
            tool: self.name.clone(),
            message: format!("Execution failed: {e}"),
        })?;

        let outcome = run_with_timeout(self.timeout, &self.cancel, move |token| wait_child(child, &token));
        let failed = |message: String| ToolError::Failed {
            tool: self.name.clone(),
            message,
        };
        match outcome {
            Ok(Ok(output)) => Ok(ToolOutput::text(output)),
            Ok(Err(message)) => Err(failed(message)),
            Err(SandboxError::TimedOut) => Err(ToolError::TimedOut {
                tool: self.name.clone(),
                seconds: self.timeout.as_secs_f64(),
            }),
            Err(SandboxError::Cancelled) => Err(failed("Cancelled".to_string())),
            Err(SandboxError::Crashed) => Err(failed("Sandbox worker crashed".to_string())),
        }
    }
}

/// 轮询子进程直到退出或令牌取消（取消时 kill）；stdout / stderr 由独立线程读取，避免管道写满阻塞
fn wait_child(mut child: Child, token: &CancellationToken) -> Result<String, String> {
    let stdout = child.stdout.take().map(spawn_reader);
    let stderr = child.stderr.take().map(spawn_reader);

    let status = loop {
        if token.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            return Err("Killed".to_string());
        }
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => std::thread::sleep(POLL_INTERVAL),
            Err(e) => return Err(format!("Wait failed: {e}")),
        }
    };

    let collect = |h: Option<std::thread::JoinHandle<String>>| {
        h.and_then(|h| h.join().ok()).unwrap_or_default()
    };
    let out = truncate(collect(stdout));
    let err = truncate(collect(stderr));
    if !status.success() {
        return Err(format!("Exit {:?}\nstderr: {}", status.code(), err.trim()));
    }
    Ok(if err.trim().is_empty() {
        out
    } else {
        format!("{}\nstderr: {}", out.trim(), err.trim())
    })
}

fn spawn_reader<R: Read + Send + 'static>(mut r: R) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = r.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn truncate(s: String) -> String {
    if s.chars().count() > MAX_OUTPUT_CHARS {
        let head: String = s.chars().take(MAX_OUTPUT_CHARS).collect();
        format!("{head}\n...[truncated]")
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_with_timeout_returns_value() {
        let token = CancellationToken::new();
        let v = run_with_timeout(Duration::from_secs(1), &token, |_| 7).unwrap();
        assert_eq!(v, 7);
    }

    #[test]
    fn test_run_with_timeout_cancels_slow_task() {
        let token = CancellationToken::new();
        let (seen_tx, seen_rx) = mpsc::channel();
        let started = Instant::now();
        let res = run_with_timeout(Duration::from_millis(50), &token, move |t| {
            while !t.is_cancelled() {
                std::thread::sleep(Duration::from_millis(5));
            }
            let _ = seen_tx.send(true);
        });
        assert_eq!(res.unwrap_err(), SandboxError::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(seen_rx.recv_timeout(Duration::from_secs(1)).unwrap());
    }

    #[test]
    fn test_parent_cancel() {
        let token = CancellationToken::new();
        token.cancel();
        let res = run_with_timeout(Duration::from_secs(5), &token, |_| ());
        assert_eq!(res.unwrap_err(), SandboxError::Cancelled);
    }

    #[test]
    fn test_panicking_task_reports_crash() {
        let token = CancellationToken::new();
        let res: Result<(), _> =
            run_with_timeout(Duration::from_secs(1), &token, |_| panic!("boom"));
        assert_eq!(res.unwrap_err(), SandboxError::Crashed);
    }

    #[cfg(unix)]
    #[test]
    fn test_command_tool_runs_and_times_out() {
        let tool = CommandTool::new("sh", "sh", ["-c"], Duration::from_millis(300));
        let out = tool.execute(json!({"code": "echo hello"})).unwrap();
        assert_eq!(out.content.trim(), "hello");

        let err = tool.execute(json!({"code": "sleep 5"})).unwrap_err();
        assert!(matches!(err, ToolError::TimedOut { .. }));

        let err = tool.execute(json!({"code": "exit 3"})).unwrap_err();
        assert!(matches!(err, ToolError::Failed { ref message, .. } if message.contains("Exit")));
    }

    #[test]
    fn test_command_tool_rejects_forbidden() {
        let tool = CommandTool::new("sh", "sh", ["-c"], Duration::from_secs(1));
        let err = tool.execute(json!({"code": "rm -rf /"})).unwrap_err();
        assert!(matches!(err, ToolError::Failed { ref message, .. } if message.contains("Forbidden")));
    }
}
