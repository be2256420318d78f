use std::sync::Arc;

use crate::BotResult;
use crate::message::MessageChain;
use crate::platform::{MessageSink, SendTarget};
use crate::provider::ProviderRequest;

/// 发送者信息
#[derive(Debug, Clone, Default)]
pub struct Sender {
    pub id: String,
    pub name: String,
}

/// 事件结果的内容类型
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResultContentType {
    /// LLM 生成的结果
    LlmResult,
    /// 普通结果（指令回复等）
    GeneralResult,
    /// 流式响应的中间分片
    StreamingChunk,
    /// 流式响应结束标记（分片已经送达，不再重复发送）
    StreamingFinish,
}

/// 事件结果：待发送的消息链及其来源类型
#[derive(Debug, Clone)]
pub struct MessageEventResult {
    pub chain: MessageChain,
    pub content_type: ResultContentType,
}

impl MessageEventResult {
    pub fn llm(chain: MessageChain) -> Self {
        Self {
            chain,
            content_type: ResultContentType::LlmResult,
        }
    }

    pub fn general(chain: impl Into<MessageChain>) -> Self {
        Self {
            chain: chain.into(),
            content_type: ResultContentType::GeneralResult,
        }
    }

    pub fn streaming_chunk(chain: MessageChain) -> Self {
        Self {
            chain,
            content_type: ResultContentType::StreamingChunk,
        }
    }

    pub fn is_llm_result(&self) -> bool {
        matches!(
            self.content_type,
            ResultContentType::LlmResult | ResultContentType::StreamingFinish
        )
    }
}

/// 一次 LLM 交换中挂起的上下文
///
/// 取代松散的 extras 字典：字段都是强类型的，作用域仅限
/// LLM 请求阶段与工具调用循环之间的交接。
#[derive(Default)]
pub struct PendingExchange {
    /// 上游阶段预构建的请求（存在时 LLM 阶段直接复用）
    pub provider_request: Option<ProviderRequest>,
    /// 工具处理器暂存的结果，恢复执行时提升为事件结果
    pub tool_call_result: Option<MessageEventResult>,
}

/// 一条入站消息在流水线中的完整载体
pub struct MessageEvent {
    /// 平台 ID（如 "console"、"onebot"）
    pub platform_id: String,
    /// 会话 ID（群号或用户号）
    pub session_id: String,
    pub sender: Sender,
    pub message_id: String,
    /// 纯文本形式
    pub message_str: String,
    /// 解析后的组件链
    pub message: MessageChain,
    pub is_private: bool,
    /// 消息是否 @ 了机器人（适配器解析时标记）
    pub is_at_bot: bool,
    /// 是否已唤醒（私聊、@、唤醒前缀命中）
    pub is_wake: bool,
    pub target: SendTarget,
    pub pending: PendingExchange,

    sink: Arc<dyn MessageSink>,
    result: Option<MessageEventResult>,
    stopped: bool,
    has_send_oper: bool,
}

impl MessageEvent {
    pub fn new(
        platform_id: impl Into<String>,
        session_id: impl Into<String>,
        sender: Sender,
        message: MessageChain,
        is_private: bool,
        sink: Arc<dyn MessageSink>,
    ) -> Self {
        let message_str = message.plain_text();
        Self {
            platform_id: platform_id.into(),
            session_id: session_id.into(),
            sender,
            message_id: String::new(),
            message_str,
            message,
            is_private,
            is_at_bot: false,
            is_wake: false,
            target: SendTarget::default(),
            pending: PendingExchange::default(),
            sink,
            result: None,
            stopped: false,
            has_send_oper: false,
        }
    }

    /// 统一会话源标识，格式 `platform:kind:session`
    pub fn unified_origin(&self) -> String {
        let kind = if self.is_private { "private" } else { "group" };
        format!("{}:{}:{}", self.platform_id, kind, self.session_id)
    }

    // ================== 结果槽 ==================

    pub fn get_result(&self) -> Option<&MessageEventResult> {
        self.result.as_ref()
    }

    pub fn take_result(&mut self) -> Option<MessageEventResult> {
        self.result.take()
    }

    pub fn set_result(&mut self, result: MessageEventResult) {
        self.result = Some(result);
    }

    pub fn clear_result(&mut self) {
        self.result = None;
    }

    // ================== 传播控制 ==================

    pub fn stop_event(&mut self) {
        self.stopped = true;
    }

    pub fn continue_event(&mut self) {
        self.stopped = false;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    // ================== 发送 ==================

    /// 通过平台出口发送一条消息链
    pub async fn send(&mut self, chain: &MessageChain) -> BotResult<()> {
        self.has_send_oper = true;
        self.sink.send(&self.target, chain).await
    }

    /// 本事件是否执行过发送操作
    pub fn has_send_oper(&self) -> bool {
        self.has_send_oper
    }
}
