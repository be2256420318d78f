use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{Value, json};

use crate::conversation::ConversationManager;
use crate::event::{MessageEvent, MessageEventResult, ResultContentType};
use crate::hooks::HookRegistry;
use crate::message::{Component, MessageChain, resolve_image_to_path};
use crate::metrics::Metric;
use crate::pipeline::{Downstream, PipelineContext, Stage};
use crate::provider::{
    LlmResponse, Provider, ProviderRequest, ResponseRole, ToolCallsResult, error_type_name,
};
use crate::tool::ToolOrigin;
use crate::{BotResult, debug, error, info, warn};

/// LLM 请求阶段
///
/// 把唤醒的消息变成一次 LLM 请求，驱动工具调用循环，并把最终
/// 回复写入事件结果。流式分片和工具的中间输出通过下游句柄在
/// 产生的当下就送过剩余阶段。
pub struct LlmRequestStage {
    provider: Option<Arc<dyn Provider>>,
    conversations: Option<Arc<ConversationManager>>,
    hooks: Arc<HookRegistry>,
    tools: Arc<crate::tool::ToolSet>,
    provider_wake_prefix: String,
    max_context_length: i64,
    dequeue_context_length: i64,
    streaming_response: bool,
    system_prompt: String,
}

impl LlmRequestStage {
    pub fn new() -> Self {
        Self {
            provider: None,
            conversations: None,
            hooks: Arc::new(HookRegistry::new()),
            tools: Arc::new(crate::tool::ToolSet::new()),
            provider_wake_prefix: String::new(),
            max_context_length: -1,
            dequeue_context_length: 3,
            streaming_response: false,
            system_prompt: String::new(),
        }
    }

    /// 构建一次全新的请求，返回 `None` 表示本条消息不请求 LLM
    async fn build_request(&self, event: &MessageEvent) -> BotResult<Option<ProviderRequest>> {
        let mut prompt = event.message_str.clone();
        if !self.provider_wake_prefix.is_empty() {
            match prompt.strip_prefix(&self.provider_wake_prefix) {
                Some(rest) => prompt = rest.to_string(),
                None => return Ok(None),
            }
        }

        let mut image_urls = Vec::new();
        for comp in &event.message.chain {
            if let Component::Image { file } = comp {
                match resolve_image_to_path(file).await {
                    Ok(path) => image_urls.push(path),
                    Err(e) => warn!(target: "LLM", "图片处理失败: {}", e),
                }
            }
        }

        if prompt.trim().is_empty() && image_urls.is_empty() {
            return Ok(None);
        }

        let conversations = self.conversations.as_ref().ok_or("对话管理器未初始化")?;
        let conversation = conversations.get_or_create(&event.unified_origin()).await?;

        let mut req = ProviderRequest::new(prompt, event.unified_origin());
        req.image_urls = image_urls;
        req.contexts = conversation.history.clone();
        req.conversation = Some(conversation);
        req.system_prompt = self.system_prompt.clone();
        if !self.tools.is_empty() {
            req.func_tool = Some(self.tools.clone());
        }
        Ok(Some(req))
    }

    /// 请求循环：一轮请求 + 工具调用为一次迭代，直到产出最终回复。
    /// 没有显式轮数上限：首轮工具调用后 `func_tool` 被清空，后续的
    /// Tool 响应不再产生结果条目，循环自然终止。
    async fn requesting(
        &self,
        provider: Arc<dyn Provider>,
        mut req: ProviderRequest,
        event: &mut MessageEvent,
        downstream: &Downstream<'_>,
    ) {
        loop {
            let outcome = if self.streaming_response {
                self.next_stream_response(&provider, &req, event, downstream)
                    .await
            } else {
                provider.text_chat(&req).await.map(|resp| (resp, false))
            };
            let (mut resp, chunks_delivered) = match outcome {
                Ok(v) => v,
                Err(e) => {
                    error!(target: "LLM", "请求失败: {}", e);
                    event.set_result(MessageEventResult::general(format!(
                        "请求失败。\n错误类型: {}\n错误信息: {}",
                        error_type_name(&e),
                        e
                    )));
                    break;
                }
            };
            if event.is_stopped() {
                break;
            }
            if !self.hooks.run_llm_response(event, &mut resp).await {
                break;
            }

            match resp.role {
                ResponseRole::Assistant => {
                    let chain = resp
                        .result_chain
                        .clone()
                        .unwrap_or_else(|| MessageChain::from(resp.completion_text.clone()));
                    let result = if chunks_delivered {
                        MessageEventResult {
                            chain,
                            content_type: ResultContentType::StreamingFinish,
                        }
                    } else {
                        MessageEventResult::llm(chain)
                    };
                    event.set_result(result);
                    if let Err(e) = self.save_to_history(&req, &resp).await {
                        warn!(target: "LLM", "保存对话历史失败: {}", e);
                    }
                    break;
                }
                ResponseRole::Err => {
                    event.set_result(MessageEventResult::general(format!(
                        "请求失败。\n错误信息: {}",
                        resp.completion_text
                    )));
                    break;
                }
                ResponseRole::Tool => {
                    match self
                        .handle_function_tools(event, &mut req, &resp, downstream)
                        .await
                    {
                        Ok(true) => continue,
                        Ok(false) => {
                            if !resp.completion_text.is_empty() {
                                event.set_result(MessageEventResult::llm(MessageChain::from(
                                    resp.completion_text.clone(),
                                )));
                            }
                            break;
                        }
                        Err(e) => {
                            error!(target: "LLM", "工具调用失败: {}", e);
                            event.set_result(MessageEventResult::general(format!(
                                "请求失败。\n错误类型: {}\n错误信息: {}",
                                error_type_name(&e),
                                e
                            )));
                            break;
                        }
                    }
                }
            }
        }
        Metric::upload_llm_tick(provider.model(), provider.provider_type().to_string());
    }

    /// 取一轮流式响应：分片即时下发，返回最终响应
    async fn next_stream_response(
        &self,
        provider: &Arc<dyn Provider>,
        req: &ProviderRequest,
        event: &mut MessageEvent,
        downstream: &Downstream<'_>,
    ) -> BotResult<(LlmResponse, bool)> {
        let mut stream = provider.text_chat_stream(req).await?;
        let mut final_resp: Option<LlmResponse> = None;
        let mut chunks_delivered = false;
        while let Some(item) = stream.next().await {
            let resp = item?;
            if resp.is_chunk {
                event.set_result(MessageEventResult::streaming_chunk(MessageChain::from(
                    resp.completion_text.clone(),
                )));
                downstream.deliver(event).await?;
                event.clear_result();
                chunks_delivered = true;
                if event.is_stopped() {
                    break;
                }
            } else {
                final_resp = Some(resp);
            }
        }
        if event.is_stopped() {
            return Ok((LlmResponse::assistant(String::new()), chunks_delivered));
        }
        match final_resp {
            Some(resp) => Ok((resp, chunks_delivered)),
            None => Err("流式响应未返回最终结果".into()),
        }
    }

    /// 按原始顺序逐个执行工具调用，返回 true 表示产生了工具结果、
    /// 需要继续下一轮请求
    async fn handle_function_tools(
        &self,
        event: &mut MessageEvent,
        req: &mut ProviderRequest,
        resp: &LlmResponse,
        downstream: &Downstream<'_>,
    ) -> BotResult<bool> {
        let Some(tool_set) = req.func_tool.clone() else {
            return Ok(false);
        };
        let mut tool_results: Vec<Value> = Vec::new();

        for call in &resp.tool_calls {
            debug!(target: "LLM", "工具调用: {} args={}", call.name, call.args);
            let Some(tool) = tool_set.get(&call.name) else {
                warn!(target: "LLM", "模型请求了未注册的工具: {}", call.name);
                tool_results.push(tool_message(
                    &call.id,
                    &format!("error: 未注册的工具 {}", call.name),
                ));
                continue;
            };

            match &tool.origin {
                ToolOrigin::Mcp { server_name } => match tool_set.mcp_session(server_name) {
                    Some(session) => match session.call_tool(&call.name, &call.args).await {
                        Ok(res) => {
                            let text = res
                                .content
                                .first()
                                .map(|c| c.text.clone())
                                .unwrap_or_default();
                            tool_results.push(tool_message(&call.id, &text));
                        }
                        Err(e) => {
                            error!(target: "LLM", "MCP 工具 {} 执行失败: {}", call.name, e);
                            tool_results.push(tool_message(&call.id, &format!("error: {}", e)));
                        }
                    },
                    None => {
                        error!(target: "LLM", "MCP 会话 {} 不存在", server_name);
                        tool_results.push(tool_message(
                            &call.id,
                            &format!("error: MCP 会话 {} 不存在", server_name),
                        ));
                    }
                },
                ToolOrigin::Local(handler) => {
                    // 在当前平台禁用的工具静默跳过，不产生结果条目
                    if !tool.enabled_for(&event.platform_id) {
                        debug!(target: "LLM", "工具 {} 在平台 {} 上被禁用，跳过", call.name, event.platform_id);
                        continue;
                    }
                    match handler.call(event, &call.args).await {
                        Ok(Some(text)) => tool_results.push(tool_message(&call.id, &text)),
                        Ok(None) => {}
                        Err(e) => {
                            error!(target: "LLM", "工具 {} 执行失败: {}", call.name, e);
                            tool_results.push(tool_message(&call.id, &format!("error: {}", e)));
                        }
                    }
                    // 处理器通过事件结果给出的中间输出立即送过剩余阶段
                    if let Some(result) = event.take_result() {
                        event.pending.tool_call_result = Some(result);
                    }
                    if let Some(buffered) = event.pending.tool_call_result.take() {
                        event.set_result(buffered);
                        downstream.deliver(event).await?;
                        event.clear_result();
                    }
                }
            }
        }

        if tool_results.is_empty() {
            return Ok(false);
        }

        // 工具结果整轮替换，不累积；后续轮次不再携带工具
        req.tool_calls_result = Some(ToolCallsResult {
            assistant_message: resp.to_assistant_message(),
            tool_results,
        });
        req.func_tool = None;
        Ok(true)
    }

    /// 仅 assistant 最终回复写入历史
    async fn save_to_history(&self, req: &ProviderRequest, resp: &LlmResponse) -> BotResult<()> {
        if resp.role != ResponseRole::Assistant {
            return Ok(());
        }
        let Some(conversations) = &self.conversations else {
            return Ok(());
        };
        let Some(conv) = &req.conversation else {
            return Ok(());
        };

        let mut history = req.contexts.clone();
        history.push(req.assemble_user_turn());
        if let Some(tcr) = &req.tool_calls_result {
            history.extend(tcr.to_openai_messages());
        }
        history.push(json!({ "role": "assistant", "content": resp.completion_text }));

        let history: Vec<Value> = history
            .into_iter()
            .filter(|entry| entry.get("_no_save").is_none())
            .collect();
        conversations.update_conversation(&conv.cid, &history).await
    }
}

impl Default for LlmRequestStage {
    fn default() -> Self {
        Self::new()
    }
}

fn tool_message(id: &str, content: &str) -> Value {
    json!({ "role": "tool", "tool_call_id": id, "content": content })
}

#[async_trait]
impl Stage for LlmRequestStage {
    fn name(&self) -> &'static str {
        "LlmRequestStage"
    }

    async fn initialize(&mut self, ctx: &PipelineContext) -> BotResult<()> {
        self.provider = ctx.provider.clone();
        self.conversations = Some(ctx.conversations.clone());
        self.hooks = ctx.hooks.clone();
        self.tools = ctx.tools.clone();

        let pcfg = &ctx.config.provider;
        self.system_prompt = pcfg.system_prompt.clone();
        self.streaming_response = pcfg.streaming_response;
        self.max_context_length = pcfg.max_context_length;

        // 提供商前缀若叠了一层机器人唤醒前缀，去掉重复部分
        let mut wake = pcfg.wake_prefix.clone();
        for prefix in &ctx.config.wake_prefix {
            if let Some(rest) = wake.strip_prefix(prefix.as_str()) {
                wake = rest.to_string();
                break;
            }
        }
        self.provider_wake_prefix = wake;

        // 丢弃轮数钳制在 [1, max - 1]
        let mut dequeue = pcfg.dequeue_context_length.max(1);
        if self.max_context_length != -1 && dequeue > self.max_context_length - 1 {
            warn!(target: "LLM", "dequeue_context_length 超出范围，已调整");
            dequeue = (self.max_context_length - 1).max(1);
        }
        self.dequeue_context_length = dequeue;

        info!(
            target: "LLM",
            "LLM 请求阶段就绪 (max_context={}, dequeue={}, streaming={})",
            self.max_context_length, self.dequeue_context_length, self.streaming_response
        );
        Ok(())
    }

    async fn process(
        &self,
        event: &mut MessageEvent,
        downstream: &Downstream<'_>,
    ) -> BotResult<()> {
        let Some(provider) = self.provider.clone() else {
            return Ok(());
        };

        let mut req = match event.pending.provider_request.take() {
            Some(mut req) => {
                // 复用预构建的请求，重新装载对话历史
                let cid = req.conversation.as_ref().map(|c| c.cid.clone());
                if let (Some(conversations), Some(cid)) = (self.conversations.as_ref(), cid)
                    && let Some(fresh) = conversations.get_conversation(&cid).await?
                {
                    req.contexts = fresh.history.clone();
                    req.conversation = Some(fresh);
                }
                req
            }
            None => match self.build_request(event).await? {
                Some(req) => req,
                None => return Ok(()),
            },
        };

        if !self.hooks.run_llm_request(event, &mut req).await {
            return Ok(());
        }

        let before = req.contexts.len();
        req.truncate_contexts(self.max_context_length, self.dequeue_context_length);
        if req.contexts.len() != before {
            info!(target: "LLM", "历史上下文过长，已截断至最近 {} 条", req.contexts.len());
        }

        event.pending.tool_call_result = None;
        self.requesting(provider, req, event, downstream).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Sender;
    use crate::platform::{MessageSink, SendTarget};
    use crate::provider::ToolCall;
    use crate::tool::{FunctionTool, ToolHandler, ToolSet};
    use sea_orm::Database;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::Mutex as AsyncMutex;

    struct RecordingSink {
        sent: AsyncMutex<Vec<MessageChain>>,
    }

    #[async_trait]
    impl MessageSink for RecordingSink {
        async fn send(&self, _target: &SendTarget, chain: &MessageChain) -> BotResult<()> {
            self.sent.lock().await.push(chain.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct CapturedRequest {
        had_tools: bool,
        tool_results: Option<Vec<Value>>,
        contexts_len: usize,
    }

    struct MockProvider {
        responses: Mutex<VecDeque<LlmResponse>>,
        requests: Mutex<Vec<CapturedRequest>>,
    }

    impl MockProvider {
        fn scripted(responses: Vec<LlmResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Provider for MockProvider {
        async fn text_chat(&self, req: &ProviderRequest) -> BotResult<LlmResponse> {
            self.requests.lock().unwrap().push(CapturedRequest {
                had_tools: req.func_tool.is_some(),
                tool_results: req
                    .tool_calls_result
                    .as_ref()
                    .map(|t| t.tool_results.clone()),
                contexts_len: req.contexts.len(),
            });
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| "脚本响应耗尽".into())
        }

        async fn text_chat_stream(
            &self,
            _req: &ProviderRequest,
        ) -> BotResult<futures_util::stream::BoxStream<'static, BotResult<LlmResponse>>> {
            Err("测试不使用流式".into())
        }

        fn model(&self) -> String {
            "mock-model".to_string()
        }

        fn provider_type(&self) -> &str {
            "mock"
        }
    }

    /// 只支持流式入口的提供商，按脚本顺序产出分片与最终响应
    struct StreamingProvider {
        script: Mutex<Vec<LlmResponse>>,
    }

    impl StreamingProvider {
        fn scripted(script: Vec<LlmResponse>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
            })
        }
    }

    #[async_trait]
    impl Provider for StreamingProvider {
        async fn text_chat(&self, _req: &ProviderRequest) -> BotResult<LlmResponse> {
            Err("仅支持流式".into())
        }

        async fn text_chat_stream(
            &self,
            _req: &ProviderRequest,
        ) -> BotResult<futures_util::stream::BoxStream<'static, BotResult<LlmResponse>>> {
            let items: Vec<BotResult<LlmResponse>> = self
                .script
                .lock()
                .unwrap()
                .drain(..)
                .map(Ok)
                .collect();
            Ok(futures_util::stream::iter(items).boxed())
        }

        fn model(&self) -> String {
            "mock-stream".to_string()
        }

        fn provider_type(&self) -> &str {
            "mock"
        }
    }

    async fn stage_with(provider: Arc<dyn Provider>, tools: ToolSet) -> LlmRequestStage {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let conversations = Arc::new(ConversationManager::new(db).await.unwrap());
        let tools = Arc::new(tools);
        LlmRequestStage {
            provider: Some(provider),
            conversations: Some(conversations),
            hooks: Arc::new(HookRegistry::new()),
            tools: tools.clone(),
            provider_wake_prefix: String::new(),
            max_context_length: -1,
            dequeue_context_length: 3,
            streaming_response: false,
            system_prompt: String::new(),
        }
    }

    fn wake_event() -> MessageEvent {
        let mut ev = MessageEvent::new(
            "console",
            "dev",
            Sender {
                id: "u1".to_string(),
                name: "Dev".to_string(),
            },
            MessageChain::new().text("今天天气如何"),
            true,
            Arc::new(RecordingSink {
                sent: AsyncMutex::new(Vec::new()),
            }),
        );
        ev.is_wake = true;
        ev
    }

    async fn run(stage: &LlmRequestStage, event: &mut MessageEvent) {
        let scheduler = crate::pipeline::PipelineScheduler::noop();
        let downstream = scheduler.tail_handle();
        stage.process(event, &downstream).await.unwrap();
    }

    fn simple_tool(name: &str, reply: &'static str) -> FunctionTool {
        struct Fixed(&'static str);
        #[async_trait]
        impl ToolHandler for Fixed {
            async fn call(
                &self,
                _event: &mut MessageEvent,
                _args: &Value,
            ) -> BotResult<Option<String>> {
                Ok(Some(self.0.to_string()))
            }
        }
        FunctionTool {
            name: name.to_string(),
            description: String::new(),
            parameters: json!({ "type": "object", "properties": {} }),
            origin: ToolOrigin::Local(Arc::new(Fixed(reply))),
            disabled_platforms: Vec::new(),
        }
    }

    fn failing_tool(name: &str) -> FunctionTool {
        struct Failing;
        #[async_trait]
        impl ToolHandler for Failing {
            async fn call(
                &self,
                _event: &mut MessageEvent,
                _args: &Value,
            ) -> BotResult<Option<String>> {
                Err("连接超时".into())
            }
        }
        FunctionTool {
            name: name.to_string(),
            description: String::new(),
            parameters: json!({ "type": "object", "properties": {} }),
            origin: ToolOrigin::Local(Arc::new(Failing)),
            disabled_platforms: Vec::new(),
        }
    }

    fn call(name: &str, id: &str) -> ToolCall {
        ToolCall {
            name: name.to_string(),
            args: json!({}),
            id: id.to_string(),
        }
    }

    #[tokio::test]
    async fn assistant_reply_end_to_end() {
        let provider = MockProvider::scripted(vec![LlmResponse::assistant("晴，25 度")]);
        let stage = stage_with(provider.clone(), ToolSet::new()).await;

        let mut ev = wake_event();
        run(&stage, &mut ev).await;

        let result = ev.get_result().expect("应有 LLM 结果");
        assert!(result.is_llm_result());
        assert_eq!(result.chain.plain_text(), "晴，25 度");

        // 历史已持久化：user + assistant 两条
        let conv = stage
            .conversations
            .as_ref()
            .unwrap()
            .get_or_create(&ev.unified_origin())
            .await
            .unwrap();
        assert_eq!(conv.history.len(), 2);
        assert_eq!(conv.history[0]["role"], "user");
        assert_eq!(conv.history[1]["content"], "晴，25 度");
    }

    #[tokio::test]
    async fn tool_loop_terminates_with_final_reply() {
        let mut tools = ToolSet::new();
        tools.add_tool(simple_tool("weather", "晴"));

        let provider = MockProvider::scripted(vec![
            LlmResponse::tool(vec![call("weather", "c1")]),
            LlmResponse::assistant("今天是晴天"),
        ]);
        let stage = stage_with(provider.clone(), tools).await;

        let mut ev = wake_event();
        run(&stage, &mut ev).await;

        assert_eq!(
            ev.get_result().unwrap().chain.plain_text(),
            "今天是晴天"
        );

        let requests = provider.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        // 第一轮携带工具，第二轮不再携带（禁止递归调用）
        assert!(requests[0].had_tools);
        assert!(!requests[1].had_tools);
        // 第二轮注入了上一轮的工具结果
        let results = requests[1].tool_results.as_ref().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["tool_call_id"], "c1");
        assert_eq!(results[0]["content"], "晴");
    }

    #[tokio::test]
    async fn failed_tool_is_isolated_and_order_kept() {
        let mut tools = ToolSet::new();
        tools.add_tool(failing_tool("broken"));
        tools.add_tool(simple_tool("weather", "晴"));

        let provider = MockProvider::scripted(vec![
            LlmResponse::tool(vec![call("broken", "c1"), call("weather", "c2")]),
            LlmResponse::assistant("收到"),
        ]);
        let stage = stage_with(provider.clone(), tools).await;

        let mut ev = wake_event();
        run(&stage, &mut ev).await;

        let requests = provider.requests.lock().unwrap();
        let results = requests[1].tool_results.as_ref().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["tool_call_id"], "c1");
        assert_eq!(results[0]["content"], "error: 连接超时");
        assert_eq!(results[1]["tool_call_id"], "c2");
        assert_eq!(results[1]["content"], "晴");
    }

    #[tokio::test]
    async fn platform_disabled_tool_is_silently_skipped() {
        let mut disabled = simple_tool("weather", "晴");
        disabled.disabled_platforms = vec!["console".to_string()];
        let mut tools = ToolSet::new();
        tools.add_tool(disabled);

        // 唯一的工具被跳过后没有结果条目，循环不再继续
        let provider = MockProvider::scripted(vec![LlmResponse::tool(vec![call(
            "weather", "c1",
        )])]);
        let stage = stage_with(provider.clone(), tools).await;

        let mut ev = wake_event();
        run(&stage, &mut ev).await;

        assert!(ev.get_result().is_none());
        assert_eq!(provider.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn provider_error_becomes_user_facing_message() {
        let provider = MockProvider::scripted(vec![]);
        let stage = stage_with(provider, ToolSet::new()).await;

        let mut ev = wake_event();
        run(&stage, &mut ev).await;

        let text = ev.get_result().unwrap().chain.plain_text();
        assert!(text.contains("请求失败"));
        assert!(text.contains("错误类型: Error"));
        assert!(text.contains("错误信息: 脚本响应耗尽"));
    }

    #[tokio::test]
    async fn streaming_final_is_marked_finish_and_saved() {
        let provider = StreamingProvider::scripted(vec![
            LlmResponse::chunk("今"),
            LlmResponse::chunk("天晴"),
            LlmResponse::assistant("今天晴"),
        ]);
        let mut stage = stage_with(provider, ToolSet::new()).await;
        stage.streaming_response = true;

        let mut ev = wake_event();
        run(&stage, &mut ev).await;

        // 分片已经下发过，最终结果只做收尾标记
        let result = ev.get_result().unwrap();
        assert_eq!(result.content_type, ResultContentType::StreamingFinish);
        assert_eq!(result.chain.plain_text(), "今天晴");

        let conv = stage
            .conversations
            .as_ref()
            .unwrap()
            .get_or_create(&ev.unified_origin())
            .await
            .unwrap();
        assert_eq!(conv.history.len(), 2);
        assert_eq!(conv.history[1]["content"], "今天晴");
    }

    #[tokio::test]
    async fn second_tool_round_without_toolset_ends_loop() {
        let mut tools = ToolSet::new();
        tools.add_tool(simple_tool("weather", "晴"));

        // 第二轮仍要求调用工具，但工具集已被清空，循环应就此结束
        let provider = MockProvider::scripted(vec![
            LlmResponse::tool(vec![call("weather", "c1")]),
            LlmResponse::tool(vec![call("weather", "c2")]),
        ]);
        let stage = stage_with(provider.clone(), tools).await;

        let mut ev = wake_event();
        run(&stage, &mut ev).await;

        assert_eq!(provider.requests.lock().unwrap().len(), 2);
        assert!(ev.get_result().is_none());
    }

    #[tokio::test]
    async fn err_role_response_becomes_user_facing_message() {
        let provider = MockProvider::scripted(vec![LlmResponse::err("配额不足")]);
        let stage = stage_with(provider, ToolSet::new()).await;

        let mut ev = wake_event();
        run(&stage, &mut ev).await;

        let text = ev.get_result().unwrap().chain.plain_text();
        assert!(text.contains("请求失败"));
        assert!(text.contains("配额不足"));
    }

    #[tokio::test]
    async fn contexts_are_truncated_before_request() {
        let provider = MockProvider::scripted(vec![LlmResponse::assistant("ok")]);
        let mut stage = stage_with(provider.clone(), ToolSet::new()).await;
        stage.max_context_length = 5;
        stage.dequeue_context_length = 2;

        let mut ev = wake_event();
        // 预先写入 6 轮历史
        let conversations = stage.conversations.as_ref().unwrap();
        let conv = conversations
            .get_or_create(&ev.unified_origin())
            .await
            .unwrap();
        let mut history = Vec::new();
        for i in 0..6 {
            history.push(json!({ "role": "user", "content": format!("q{}", i) }));
            history.push(json!({ "role": "assistant", "content": format!("a{}", i) }));
        }
        conversations
            .update_conversation(&conv.cid, &history)
            .await
            .unwrap();

        run(&stage, &mut ev).await;

        let requests = provider.requests.lock().unwrap();
        // (5 - 2) * 2 = 6 条
        assert_eq!(requests[0].contexts_len, 6);
    }
}
