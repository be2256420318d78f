use std::sync::Arc;

use sea_orm::Database;
use tokio::sync::mpsc;

use yunque::config::AppConfig;
use yunque::conversation::ConversationManager;
use yunque::hooks::HookRegistry;
use yunque::metrics::Metric;
use yunque::pipeline::llm_request::LlmRequestStage;
use yunque::pipeline::respond::RespondStage;
use yunque::pipeline::waking::WakingCheckStage;
use yunque::pipeline::{PipelineContext, PipelineScheduler, Stage};
use yunque::platform::console::ConsoleAdapter;
use yunque::platform::onebot::OneBotAdapter;
use yunque::platform::Adapter;
use yunque::provider::openai::OpenAiProvider;
use yunque::provider::Provider;
use yunque::tool::ToolSet;
use yunque::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load_or_create("yunque.toml")
        .await
        .map_err(|e| anyhow::anyhow!("读取配置失败: {}", e))?;

    let db = Database::connect(format!("sqlite://{}?mode=rwc", config.database_path)).await?;
    let conversations = Arc::new(
        ConversationManager::new(db)
            .await
            .map_err(|e| anyhow::anyhow!("初始化数据库失败: {}", e))?,
    );

    let provider: Option<Arc<dyn Provider>> =
        if config.provider.enabled && !config.provider.api_key.is_empty() {
            info!("LLM 提供商就绪: {}", config.provider.model);
            Some(Arc::new(OpenAiProvider::new(&config.provider)))
        } else {
            warn!("未配置 API Key，LLM 功能不可用");
            None
        };

    let ctx = PipelineContext {
        config: config.clone(),
        provider,
        conversations,
        hooks: Arc::new(HookRegistry::new()),
        tools: Arc::new(ToolSet::new()),
    };

    let stages: Vec<Box<dyn Stage>> = vec![
        Box::new(WakingCheckStage::new()),
        Box::new(LlmRequestStage::new()),
        Box::new(RespondStage::new()),
    ];
    let scheduler = Arc::new(
        PipelineScheduler::new(stages, &ctx)
            .await
            .map_err(|e| anyhow::anyhow!("流水线初始化失败: {}", e))?,
    );

    let (event_tx, mut event_rx) = mpsc::channel(128);

    for bot in &config.bots {
        if !bot.enabled {
            continue;
        }
        match bot.protocol.as_str() {
            "console" => {
                let tx = event_tx.clone();
                tokio::spawn(async move {
                    let adapter = ConsoleAdapter::new();
                    if let Err(e) = adapter.run(tx).await {
                        error!(target: "Console", "适配器退出: {}", e);
                    }
                });
            }
            "onebot" => {
                let Some(url) = bot.url.clone() else {
                    warn!(target: "OneBot", "缺少 url 配置，跳过");
                    continue;
                };
                let token = bot.access_token.clone();
                let tx = event_tx.clone();
                tokio::spawn(async move {
                    let adapter = OneBotAdapter::new(url, token);
                    if let Err(e) = adapter.run(tx).await {
                        error!(target: "OneBot", "适配器退出: {}", e);
                    }
                });
            }
            other => warn!("未知协议 {}，跳过", other),
        }
    }
    drop(event_tx);

    info!("云雀启动完成");

    while let Some(mut event) = event_rx.recv().await {
        Metric::message_tick();
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            scheduler.execute(&mut event).await;
        });
    }

    Ok(())
}
