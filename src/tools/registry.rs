//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），由 ToolRegistry 按名注册与查找。
//! FnTool 把「参数结构体 + 处理函数」注册为工具：参数 Schema 由 schemars 生成，调用时先反序列化为强类型参数，
//! 未注册的名字返回 ToolError::UnknownTool。

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::core::ToolError;

/// 工具执行结果：文本内容 + 可选图片（data URL），图片会作为附加上下文带入后续模型调用
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    pub content: String,
    pub images: Vec<String>,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            images: Vec::new(),
        }
    }

    pub fn with_image(mut self, data_url: impl Into<String>) -> Self {
        self.images.push(data_url.into());
        self
    }
}

impl From<String> for ToolOutput {
    fn from(content: String) -> Self {
        Self::text(content)
    }
}

impl From<&str> for ToolOutput {
    fn from(content: &str) -> Self {
        Self::text(content)
    }
}

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、同步执行（args 为 JSON）
pub trait Tool: Send + Sync {
    /// 工具名称（对应 tool_calls[].function.name）
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认空对象
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    fn execute(&self, args: Value) -> Result<ToolOutput, ToolError>;
}

/// 由闭包实现的强类型工具：A 为参数结构体
pub struct FnTool<A, F> {
    name: String,
    description: String,
    schema: Value,
    handler: F,
    _args: PhantomData<fn(A)>,
}

impl<A, F> FnTool<A, F>
where
    A: DeserializeOwned + JsonSchema,
    F: Fn(A) -> Result<ToolOutput, String> + Send + Sync,
{
    pub fn new(name: impl Into<String>, description: impl Into<String>, handler: F) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema: schema_of::<A>(),
            handler,
            _args: PhantomData,
        }
    }
}

impl<A, F> Tool for FnTool<A, F>
where
    A: DeserializeOwned,
    F: Fn(A) -> Result<ToolOutput, String> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    fn execute(&self, args: Value) -> Result<ToolOutput, ToolError> {
        let parsed: A = serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments {
            tool: self.name.clone(),
            message: e.to_string(),
        })?;
        (self.handler)(parsed).map_err(|message| ToolError::Failed {
            tool: self.name.clone(),
            message,
        })
    }
}

/// 生成参数 Schema，去掉 $schema / title 等对模型无用的顶层键
pub fn schema_of<A: JsonSchema>() -> Value {
    let schema = schemars::schema_for!(A);
    let mut value = serde_json::to_value(schema).unwrap_or_else(|_| json!({"type": "object"}));
    if let Some(obj) = value.as_object_mut() {
        obj.remove("$schema");
        obj.remove("title");
    }
    value
}

/// 工具注册表：按名称存储 Arc<dyn Tool>，保留注册顺序（决定发给模型的工具列表顺序）
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册工具；同名工具会被替换
    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), Arc::new(tool)).is_none() {
            self.order.push(name);
        }
    }

    /// 注册强类型闭包工具
    pub fn register_fn<A, F>(&mut self, name: &str, description: &str, handler: F)
    where
        A: DeserializeOwned + JsonSchema + 'static,
        F: Fn(A) -> Result<ToolOutput, String> + Send + Sync + 'static,
    {
        self.register(FnTool::new(name, description, handler));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn execute(&self, name: &str, args: Value) -> Result<ToolOutput, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        tool.execute(args)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// chat completions 的 tools 字段
    pub fn definitions(&self) -> Vec<Value> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name(),
                        "description": tool.description(),
                        "parameters": tool.parameters_schema()
                    }
                })
            })
            .collect()
    }
}
