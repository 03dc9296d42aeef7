//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `SCRIPTORIUM__*` 覆盖（双下划线表示嵌套，如 `SCRIPTORIUM__WORKERS__THREADS=8`）。
//! API Key 不写入配置文件，只从 `llm.api_key_env` 指定的环境变量读取。

use std::path::PathBuf;

use serde::Deserialize;

use crate::core::ConfigError;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub storage: StorageSection,
    pub llm: LlmSection,
    pub retry: RetrySection,
    pub agent: AgentSection,
    pub workers: WorkersSection,
    pub tools: ToolsSection,
}

/// [storage] 段：Library 根目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub root: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            root: PathBuf::from("library"),
        }
    }
}

/// [llm] 段：端点、模型、API Key 所在环境变量、单次请求超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub base_url: String,
    pub model: String,
    pub api_key_env: String,
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            base_url: "https://openrouter.ai/api/v1".to_string(),
            model: "google/gemini-2.5-flash".to_string(),
            api_key_env: "OPENROUTER_API_KEY".to_string(),
            request_timeout_secs: 120,
        }
    }
}

/// [retry] 段：总尝试次数与退避（base ± jitter）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 2000,
            jitter_ms: 1500,
        }
    }
}

/// [agent] 段：工具调用循环上限与采样参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub max_iterations: u32,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// 单次运行的花费上限（美元）
    pub max_cost_usd: Option<f64>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_iterations: 15,
            temperature: 0.0,
            max_tokens: None,
            max_cost_usd: None,
        }
    }
}

/// [workers] 段：批处理线程数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkersSection {
    pub threads: usize,
}

impl Default for WorkersSection {
    fn default() -> Self {
        Self { threads: 10 }
    }
}

/// [tools] 段：沙箱执行的硬超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub sandbox_timeout_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            sandbox_timeout_secs: 5,
        }
    }
}

/// 从 config 目录加载配置，环境变量 SCRIPTORIUM__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 SCRIPTORIUM__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        if std::path::Path::new(&format!("{name}.toml")).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("SCRIPTORIUM")
            .separator("__")
            .try_parsing(true),
    );

    Ok(builder.build()?.try_deserialize()?)
}

/// 读取 API Key；缺失或为空是启动期致命错误，不参与重试
pub fn resolve_api_key(llm: &LlmSection) -> Result<String, ConfigError> {
    match std::env::var(&llm.api_key_env) {
        Ok(key) if !key.trim().is_empty() => Ok(key),
        _ => Err(ConfigError::MissingApiKey(llm.api_key_env.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.retry.max_retries, 3);
        assert_eq!(cfg.retry.base_delay_ms, 2000);
        assert_eq!(cfg.tools.sandbox_timeout_secs, 5);
        assert_eq!(cfg.llm.api_key_env, "OPENROUTER_API_KEY");
        assert!(cfg.agent.max_cost_usd.is_none());
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "[retry]\nmax_retries = 7\n\n[workers]\nthreads = 3\n\n[storage]\nroot = \"/tmp/books\"\n",
        )
        .unwrap();
        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.retry.max_retries, 7);
        assert_eq!(cfg.retry.jitter_ms, 1500);
        assert_eq!(cfg.workers.threads, 3);
        assert_eq!(cfg.storage.root, PathBuf::from("/tmp/books"));
    }

    #[test]
    fn test_missing_api_key() {
        let llm = LlmSection {
            api_key_env: "SCRIPTORIUM_UNSET_KEY_FOR_TEST".into(),
            ..LlmSection::default()
        };
        let err = resolve_api_key(&llm).unwrap_err();
        assert!(err.to_string().contains("SCRIPTORIUM_UNSET_KEY_FOR_TEST"));
    }
}
