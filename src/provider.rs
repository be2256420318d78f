use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::{Value, json};

use crate::BotResult;
use crate::conversation::Conversation;
use crate::message::MessageChain;
use crate::tool::ToolSet;

pub mod openai;

/// 响应角色
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResponseRole {
    /// 正常文本回复
    Assistant,
    /// 提供商返回的错误
    Err,
    /// 模型请求调用工具
    Tool,
}

/// 一次工具调用请求
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub name: String,
    pub args: Value,
    pub id: String,
}

/// 一轮工具调用的完整记录，下一轮请求时整体注入上下文
#[derive(Debug, Clone)]
pub struct ToolCallsResult {
    /// 模型发起调用的 assistant 消息
    pub assistant_message: Value,
    /// 按调用顺序排列的 tool 角色消息
    pub tool_results: Vec<Value>,
}

impl ToolCallsResult {
    pub fn to_openai_messages(&self) -> Vec<Value> {
        let mut messages = vec![self.assistant_message.clone()];
        messages.extend(self.tool_results.iter().cloned());
        messages
    }
}

/// LLM 响应
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub role: ResponseRole,
    pub completion_text: String,
    /// 提供商直接给出的消息链（存在时优先于 completion_text）
    pub result_chain: Option<MessageChain>,
    pub tool_calls: Vec<ToolCall>,
    /// 是否为流式分片
    pub is_chunk: bool,
}

impl LlmResponse {
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: ResponseRole::Assistant,
            completion_text: text.into(),
            result_chain: None,
            tool_calls: Vec::new(),
            is_chunk: false,
        }
    }

    pub fn err(text: impl Into<String>) -> Self {
        Self {
            role: ResponseRole::Err,
            completion_text: text.into(),
            result_chain: None,
            tool_calls: Vec::new(),
            is_chunk: false,
        }
    }

    pub fn tool(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: ResponseRole::Tool,
            completion_text: String::new(),
            result_chain: None,
            tool_calls,
            is_chunk: false,
        }
    }

    pub fn chunk(text: impl Into<String>) -> Self {
        Self {
            role: ResponseRole::Assistant,
            completion_text: text.into(),
            result_chain: None,
            tool_calls: Vec::new(),
            is_chunk: true,
        }
    }

    /// 发起工具调用的 assistant 消息（OpenAI 格式），供下一轮上下文使用
    pub fn to_assistant_message(&self) -> Value {
        let tool_calls: Vec<Value> = self
            .tool_calls
            .iter()
            .map(|call| {
                json!({
                    "id": call.id,
                    "type": "function",
                    "function": {
                        "name": call.name,
                        "arguments": call.args.to_string(),
                    },
                })
            })
            .collect();
        json!({
            "role": "assistant",
            "content": self.completion_text,
            "tool_calls": tool_calls,
        })
    }
}

/// LLM 请求
///
/// 工具调用循环中每一轮都基于上一轮重建：`tool_calls_result`
/// 只保存最近一轮的结果，不做累积。
pub struct ProviderRequest {
    pub prompt: String,
    pub image_urls: Vec<String>,
    pub session_id: String,
    pub conversation: Option<Conversation>,
    /// 历史上下文，OpenAI 消息格式的不透明 JSON 条目
    pub contexts: Vec<Value>,
    pub system_prompt: String,
    pub func_tool: Option<Arc<ToolSet>>,
    pub tool_calls_result: Option<ToolCallsResult>,
}

impl ProviderRequest {
    pub fn new(prompt: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            image_urls: Vec::new(),
            session_id: session_id.into(),
            conversation: None,
            contexts: Vec::new(),
            system_prompt: String::new(),
            func_tool: None,
            tool_calls_result: None,
        }
    }

    /// 本次用户输入对应的上下文条目
    pub fn assemble_user_turn(&self) -> Value {
        if self.image_urls.is_empty() {
            json!({ "role": "user", "content": self.prompt })
        } else {
            // 图片条目不写回历史
            json!({
                "role": "user",
                "content": self.prompt,
                "_image_urls": self.image_urls,
                "_no_save": true,
            })
        }
    }

    /// 截断历史上下文
    ///
    /// 超过 `max` 轮（每轮两条）时只保留尾部 `(max - dequeue) * 2` 条，
    /// `max == -1` 表示不限制。
    pub fn truncate_contexts(&mut self, max: i64, dequeue: i64) {
        if max == -1 {
            return;
        }
        if (self.contexts.len() / 2) as i64 > max {
            let keep = ((max - dequeue) * 2).max(0) as usize;
            let start = self.contexts.len().saturating_sub(keep);
            self.contexts.drain(..start);
        }
    }
}

/// 用户可见失败消息里的错误类别名
pub fn error_type_name(e: &crate::BotError) -> &'static str {
    if e.downcast_ref::<async_openai::error::OpenAIError>().is_some() {
        "OpenAIError"
    } else if e.downcast_ref::<reqwest::Error>().is_some() {
        "RequestError"
    } else if e.downcast_ref::<std::io::Error>().is_some() {
        "IoError"
    } else {
        "Error"
    }
}

/// LLM 提供商
#[async_trait]
pub trait Provider: Send + Sync {
    async fn text_chat(&self, req: &ProviderRequest) -> BotResult<LlmResponse>;

    /// 流式请求：分片以 `is_chunk` 响应产出，最后一项为完整响应
    async fn text_chat_stream(
        &self,
        req: &ProviderRequest,
    ) -> BotResult<BoxStream<'static, BotResult<LlmResponse>>>;

    fn model(&self) -> String;

    fn provider_type(&self) -> &str;
}
