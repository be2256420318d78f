//! 三阶段流水线的端到端测试：唤醒判定 -> LLM 请求 -> 发送。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use sea_orm::Database;
use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;

use yunque::BotResult;
use yunque::config::AppConfig;
use yunque::conversation::ConversationManager;
use yunque::event::{MessageEvent, Sender};
use yunque::hooks::HookRegistry;
use yunque::message::MessageChain;
use yunque::pipeline::llm_request::LlmRequestStage;
use yunque::pipeline::respond::RespondStage;
use yunque::pipeline::waking::WakingCheckStage;
use yunque::pipeline::{PipelineContext, PipelineScheduler, Stage};
use yunque::platform::{MessageSink, SendTarget};
use yunque::provider::{LlmResponse, Provider, ProviderRequest, ToolCall};
use yunque::tool::{FunctionTool, ToolHandler, ToolOrigin, ToolSet};

struct RecordingSink {
    sent: AsyncMutex<Vec<MessageChain>>,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: AsyncMutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl MessageSink for RecordingSink {
    async fn send(&self, _target: &SendTarget, chain: &MessageChain) -> BotResult<()> {
        self.sent.lock().await.push(chain.clone());
        Ok(())
    }
}

struct MockProvider {
    responses: Mutex<VecDeque<LlmResponse>>,
    request_count: Mutex<usize>,
}

impl MockProvider {
    fn scripted(responses: Vec<LlmResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            request_count: Mutex::new(0),
        })
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn text_chat(&self, _req: &ProviderRequest) -> BotResult<LlmResponse> {
        *self.request_count.lock().unwrap() += 1;
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| "脚本响应耗尽".into())
    }

    async fn text_chat_stream(
        &self,
        _req: &ProviderRequest,
    ) -> BotResult<BoxStream<'static, BotResult<LlmResponse>>> {
        Err("测试不使用流式".into())
    }

    fn model(&self) -> String {
        "mock-model".to_string()
    }

    fn provider_type(&self) -> &str {
        "mock"
    }
}

/// 只支持流式入口的提供商
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
    ) -> BotResult<BoxStream<'static, BotResult<LlmResponse>>> {
        let items: Vec<BotResult<LlmResponse>> =
            self.script.lock().unwrap().drain(..).map(Ok).collect();
        Ok(Box::pin(futures_util::stream::iter(items)))
    }

    fn model(&self) -> String {
        "mock-stream".to_string()
    }

    fn provider_type(&self) -> &str {
        "mock"
    }
}

async fn scheduler_with(provider: Arc<dyn Provider>, tools: ToolSet) -> PipelineScheduler {
    scheduler_with_config(provider, tools, AppConfig::default()).await
}

async fn scheduler_with_config(
    provider: Arc<dyn Provider>,
    tools: ToolSet,
    config: AppConfig,
) -> PipelineScheduler {
    let db = Database::connect("sqlite::memory:").await.unwrap();
    let conversations = Arc::new(ConversationManager::new(db).await.unwrap());
    let ctx = PipelineContext {
        config,
        provider: Some(provider),
        conversations,
        hooks: Arc::new(HookRegistry::new()),
        tools: Arc::new(tools),
    };
    let stages: Vec<Box<dyn Stage>> = vec![
        Box::new(WakingCheckStage::new()),
        Box::new(LlmRequestStage::new()),
        Box::new(RespondStage::new()),
    ];
    PipelineScheduler::new(stages, &ctx).await.unwrap()
}

fn event(text: &str, is_private: bool, sink: Arc<RecordingSink>) -> MessageEvent {
    MessageEvent::new(
        "onebot",
        "42",
        Sender {
            id: "1001".to_string(),
            name: "Dev".to_string(),
        },
        MessageChain::new().text(text),
        is_private,
        sink,
    )
}

#[tokio::test]
async fn private_message_gets_llm_reply_sent() {
    let provider = MockProvider::scripted(vec![LlmResponse::assistant("你好，我是云雀")]);
    let scheduler = scheduler_with(provider, ToolSet::new()).await;

    let sink = RecordingSink::new();
    let mut ev = event("你好", true, sink.clone());
    scheduler.execute(&mut ev).await;

    let sent = sink.sent.lock().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].plain_text(), "你好，我是云雀");
    // 发送后结果槽被清空
    assert!(ev.get_result().is_none());
}

#[tokio::test]
async fn tool_call_round_trip_reaches_platform() {
    struct WeatherTool;
    #[async_trait]
    impl ToolHandler for WeatherTool {
        async fn call(
            &self,
            _event: &mut MessageEvent,
            _args: &serde_json::Value,
        ) -> BotResult<Option<String>> {
            Ok(Some("晴".to_string()))
        }
    }
    let mut tools = ToolSet::new();
    tools.add_tool(FunctionTool {
        name: "weather".to_string(),
        description: "查询天气".to_string(),
        parameters: json!({ "type": "object", "properties": {} }),
        origin: ToolOrigin::Local(Arc::new(WeatherTool)),
        disabled_platforms: Vec::new(),
    });

    let provider = MockProvider::scripted(vec![
        LlmResponse::tool(vec![ToolCall {
            name: "weather".to_string(),
            args: json!({}),
            id: "c1".to_string(),
        }]),
        LlmResponse::assistant("今天是晴天"),
    ]);
    let scheduler = scheduler_with(provider.clone(), tools).await;

    let sink = RecordingSink::new();
    let mut ev = event("今天天气如何", true, sink.clone());
    scheduler.execute(&mut ev).await;

    assert_eq!(*provider.request_count.lock().unwrap(), 2);
    let sent = sink.sent.lock().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].plain_text(), "今天是晴天");
}

#[tokio::test]
async fn unwoken_group_message_produces_no_send() {
    let provider = MockProvider::scripted(vec![LlmResponse::assistant("不应出现")]);
    let scheduler = scheduler_with(provider.clone(), ToolSet::new()).await;

    let sink = RecordingSink::new();
    let mut ev = event("随便聊聊", false, sink.clone());
    scheduler.execute(&mut ev).await;

    assert_eq!(*provider.request_count.lock().unwrap(), 0);
    assert!(sink.sent.lock().await.is_empty());
}

#[tokio::test]
async fn streaming_chunks_sent_in_order_without_resend() {
    let provider = StreamingProvider::scripted(vec![
        LlmResponse::chunk("今"),
        LlmResponse::chunk("天晴"),
        LlmResponse::assistant("今天晴"),
    ]);
    let mut config = AppConfig::default();
    config.provider.streaming_response = true;
    let scheduler = scheduler_with_config(provider, ToolSet::new(), config).await;

    let sink = RecordingSink::new();
    let mut ev = event("今天天气如何", true, sink.clone());
    scheduler.execute(&mut ev).await;

    // 两个分片按序直达平台，收尾标记不再重发
    let sent = sink.sent.lock().await;
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].plain_text(), "今");
    assert_eq!(sent[1].plain_text(), "天晴");
    assert!(ev.get_result().is_none());
}

#[tokio::test]
async fn group_message_with_wake_prefix_is_answered() {
    let provider = MockProvider::scripted(vec![LlmResponse::assistant("在")]);
    let scheduler = scheduler_with(provider, ToolSet::new()).await;

    let sink = RecordingSink::new();
    // 默认唤醒前缀为 "/"
    let mut ev = event("/你好", false, sink.clone());
    scheduler.execute(&mut ev).await;

    let sent = sink.sent.lock().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].plain_text(), "在");
}
