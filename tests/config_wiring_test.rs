//! 配置文件中的各段落实到运行时组件：Agent 循环、重试策略、批处理线程数、沙箱超时

use std::time::Duration;

use scriptorium::agent::AgentLoop;
use scriptorium::config::load_config;
use scriptorium::llm::mock::text_reply;
use scriptorium::llm::{Message, ScriptedTransport};
use scriptorium::pipeline::BatchRunner;
use scriptorium::tools::{CommandTool, ToolExecutor, ToolRegistry};

const CUSTOM: &str = r#"
[llm]
model = "vendor/ocr-model"
request_timeout_secs = 45

[retry]
max_retries = 5
base_delay_ms = 0
jitter_ms = 0

[agent]
max_iterations = 6
temperature = 0.2
max_cost_usd = 0.03

[workers]
threads = 4

[tools]
sandbox_timeout_secs = 9
"#;

#[test]
fn test_loaded_config_drives_components() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scriptorium.toml");
    std::fs::write(&path, CUSTOM).unwrap();
    let cfg = load_config(Some(path)).unwrap();

    let agent = AgentLoop::from_app_config(&cfg);
    assert_eq!(agent.config().model, "vendor/ocr-model");
    assert_eq!(agent.config().max_iterations, 6);
    assert_eq!(agent.config().request_timeout, Duration::from_secs(45));
    assert_eq!(agent.config().max_cost_usd, Some(0.03));
    assert_eq!(agent.retry_policy().max_retries, 5);
    assert_eq!(agent.retry_policy().base_delay, Duration::ZERO);

    assert_eq!(BatchRunner::from_config(&cfg.workers).threads(), 4);

    let sandbox = CommandTool::from_config("run_python", "python3", ["-c"], &cfg.tools);
    assert_eq!(sandbox.timeout(), Duration::from_secs(9));
}

#[test]
fn test_configured_limits_apply_to_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scriptorium.toml");
    std::fs::write(&path, CUSTOM).unwrap();
    let cfg = load_config(Some(path)).unwrap();

    // 前两次 503 后成功：5 次尝试的预算足够；每轮 0.02，第二轮触发 0.03 上限
    let transport = ScriptedTransport::new(vec![
        Err(scriptorium::core::TransportError::Http {
            status: 503,
            message: "busy".into(),
        }),
        Err(scriptorium::core::TransportError::Http {
            status: 503,
            message: "busy".into(),
        }),
        Ok(text_reply("working", 0.02)),
        Ok(text_reply("still working", 0.02)),
        Ok(text_reply("never reached", 0.02)),
    ]);
    let executor = ToolExecutor::new(ToolRegistry::new());
    let out = AgentLoop::from_app_config(&cfg).run(
        &transport,
        vec![Message::user("go")],
        &executor,
        &|_: &[Message]| false,
        None,
    );
    assert!(!out.success);
    assert_eq!(out.iterations, 2);
    assert_eq!(transport.call_count(), 4);
    assert!(out.error.unwrap().contains("Cost ceiling"));
}
