//! Scriptorium 命令行入口
//!
//! 加载配置、初始化日志、校验 API Key，按配置构造运行时组件，然后输出生效参数与
//! Library 中每本书各 Stage 的进度与成本（JSON）。
//! 用法：`scriptorium [config.toml]`

use std::path::PathBuf;

use anyhow::Context;
use scriptorium::tools::CommandTool;
use scriptorium::{config, observability, storage::Library, AgentLoop, BatchRunner, HttpTransport};
use serde_json::{json, Map, Value};

fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = config::load_config(config_path).context("Failed to load configuration")?;

    // API Key 缺失是启动期致命错误
    let transport = HttpTransport::from_config(&cfg.llm).context("LLM transport unavailable")?;
    tracing::info!(endpoint = transport.endpoint(), model = %cfg.llm.model, "transport ready");

    let agent = AgentLoop::from_app_config(&cfg);
    let runner = BatchRunner::from_config(&cfg.workers);
    let sandbox = CommandTool::from_config("run_python", "python3", ["-c"], &cfg.tools);
    let policy = agent.retry_policy();
    let runtime = json!({
        "model": agent.config().model,
        "max_iterations": agent.config().max_iterations,
        "max_cost_usd": agent.config().max_cost_usd,
        "request_timeout_secs": agent.config().request_timeout.as_secs(),
        "max_retries": policy.max_retries,
        "retry_base_delay_ms": policy.base_delay.as_millis() as u64,
        "retry_jitter_ms": policy.jitter.as_millis() as u64,
        "threads": runner.threads(),
        "sandbox_timeout_secs": sandbox.timeout().as_secs(),
    });
    tracing::debug!(runtime = %runtime, "runtime settings");

    let library = Library::open(&cfg.storage.root)
        .with_context(|| format!("Failed to open library at {}", cfg.storage.root.display()))?;

    let mut books = Map::new();
    for book_id in library.list_books()? {
        let book = library.book(&book_id)?;
        let mut stages = Map::new();
        for stage_name in book.list_stages()? {
            let stage = book.stage(&stage_name)?;
            let status = stage.checkpoint().get_status();
            stages.insert(
                stage_name,
                json!({
                    "status": status,
                    "metrics": stage.metrics().summary(),
                }),
            );
        }
        books.insert(book_id, Value::Object(stages));
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "root": cfg.storage.root,
            "runtime": runtime,
            "books": books,
        }))?
    );
    Ok(())
}
