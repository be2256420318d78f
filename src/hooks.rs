use std::sync::Arc;

use async_trait::async_trait;

use crate::event::MessageEvent;
use crate::provider::{LlmResponse, ProviderRequest};
use crate::{BotResult, debug, error, info};

/// 钩子返回值：是否继续执行后续钩子
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HookFlow {
    Continue,
    /// 终止钩子链并停止事件传播
    Stop,
}

/// LLM 请求发出前
#[async_trait]
pub trait OnLlmRequestHook: Send + Sync {
    fn name(&self) -> &str;
    async fn on_llm_request(
        &self,
        event: &mut MessageEvent,
        req: &mut ProviderRequest,
    ) -> BotResult<HookFlow>;
}

/// LLM 响应返回后、处理前
#[async_trait]
pub trait OnLlmResponseHook: Send + Sync {
    fn name(&self) -> &str;
    async fn on_llm_response(
        &self,
        event: &mut MessageEvent,
        resp: &mut LlmResponse,
    ) -> BotResult<HookFlow>;
}

/// 消息发送完成后
#[async_trait]
pub trait OnAfterMessageSentHook: Send + Sync {
    fn name(&self) -> &str;
    async fn on_after_message_sent(&self, event: &mut MessageEvent) -> BotResult<HookFlow>;
}

/// 钩子注册表
///
/// 各钩子点按优先级降序依次调用。单个钩子报错只记录日志不中断；
/// 返回 [`HookFlow::Stop`]（或钩子内部停止了事件）会短路整条链。
#[derive(Default)]
pub struct HookRegistry {
    llm_request: Vec<(i32, Arc<dyn OnLlmRequestHook>)>,
    llm_response: Vec<(i32, Arc<dyn OnLlmResponseHook>)>,
    after_message_sent: Vec<(i32, Arc<dyn OnAfterMessageSentHook>)>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_llm_request(&mut self, priority: i32, hook: Arc<dyn OnLlmRequestHook>) {
        self.llm_request.push((priority, hook));
        self.llm_request.sort_by_key(|(p, _)| -*p);
    }

    pub fn register_llm_response(&mut self, priority: i32, hook: Arc<dyn OnLlmResponseHook>) {
        self.llm_response.push((priority, hook));
        self.llm_response.sort_by_key(|(p, _)| -*p);
    }

    pub fn register_after_message_sent(
        &mut self,
        priority: i32,
        hook: Arc<dyn OnAfterMessageSentHook>,
    ) {
        self.after_message_sent.push((priority, hook));
        self.after_message_sent.sort_by_key(|(p, _)| -*p);
    }

    /// 返回 false 表示链被终止，调用方应中止当前阶段
    pub async fn run_llm_request(
        &self,
        event: &mut MessageEvent,
        req: &mut ProviderRequest,
    ) -> bool {
        for (_, hook) in &self.llm_request {
            debug!(target: "Hook", "on_llm_request -> {}", hook.name());
            match hook.on_llm_request(event, req).await {
                Ok(HookFlow::Stop) => event.stop_event(),
                Ok(HookFlow::Continue) => {}
                Err(e) => error!(target: "Hook", "on_llm_request [{}] 执行失败: {}", hook.name(), e),
            }
            if event.is_stopped() {
                info!(target: "Hook", "{} 终止了事件传播", hook.name());
                return false;
            }
        }
        true
    }

    pub async fn run_llm_response(
        &self,
        event: &mut MessageEvent,
        resp: &mut LlmResponse,
    ) -> bool {
        for (_, hook) in &self.llm_response {
            debug!(target: "Hook", "on_llm_response -> {}", hook.name());
            match hook.on_llm_response(event, resp).await {
                Ok(HookFlow::Stop) => event.stop_event(),
                Ok(HookFlow::Continue) => {}
                Err(e) => error!(target: "Hook", "on_llm_response [{}] 执行失败: {}", hook.name(), e),
            }
            if event.is_stopped() {
                info!(target: "Hook", "{} 终止了事件传播", hook.name());
                return false;
            }
        }
        true
    }

    pub async fn run_after_message_sent(&self, event: &mut MessageEvent) -> bool {
        for (_, hook) in &self.after_message_sent {
            debug!(target: "Hook", "on_after_message_sent -> {}", hook.name());
            match hook.on_after_message_sent(event).await {
                Ok(HookFlow::Stop) => event.stop_event(),
                Ok(HookFlow::Continue) => {}
                Err(e) => {
                    error!(target: "Hook", "on_after_message_sent [{}] 执行失败: {}", hook.name(), e)
                }
            }
            if event.is_stopped() {
                info!(target: "Hook", "{} 终止了事件传播", hook.name());
                return false;
            }
        }
        true
    }
}
