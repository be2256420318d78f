use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::event::{MessageEvent, ResultContentType};
use crate::hooks::HookRegistry;
use crate::message::{Component, MessageChain};
use crate::pipeline::{Downstream, PipelineContext, Stage};
use crate::{BotResult, error, info};

/// 发送阶段
///
/// 把事件结果回传平台。开启分段回复时逐组件发送并模拟人类的
/// 打字间隔；装饰组件（@ 与引用）作为每段的前缀。
pub struct RespondStage {
    reply_with_mention: bool,
    reply_with_quote: bool,
    enable_seg: bool,
    only_llm_result: bool,
    interval_method: String,
    log_base: f64,
    interval: [f64; 2],
    hooks: Arc<HookRegistry>,
}

impl RespondStage {
    pub fn new() -> Self {
        Self {
            reply_with_mention: false,
            reply_with_quote: false,
            enable_seg: false,
            only_llm_result: true,
            interval_method: "random".to_string(),
            log_base: 2.6,
            interval: [1.5, 3.5],
            hooks: Arc::new(HookRegistry::new()),
        }
    }

    /// 计算该组件发送前的等待秒数
    fn calc_comp_interval(&self, comp: &Component) -> f64 {
        let mut rng = rand::rng();
        if self.interval_method == "log" {
            if let Component::Plain { text } = comp {
                let wc = word_cnt(text) as f64;
                let base = (wc + 1.0).ln() / self.log_base.ln();
                rng.random_range(base..base + 0.5)
            } else {
                rng.random_range(1.0..1.75)
            }
        } else {
            if self.interval[1] <= self.interval[0] {
                return self.interval[0];
            }
            rng.random_range(self.interval[0]..self.interval[1])
        }
    }
}

impl Default for RespondStage {
    fn default() -> Self {
        Self::new()
    }
}

/// 分段回复的字数统计：全 ASCII 按空白分词计数，否则数字母数字字符
fn word_cnt(text: &str) -> usize {
    if text.chars().all(|c| c.is_ascii()) {
        text.split_whitespace().count()
    } else {
        text.chars().filter(|c| c.is_alphanumeric()).count()
    }
}

/// 解析 "min,max" 格式的间隔配置，失败时退回 [1.5, 3.5]
fn parse_interval(raw: &str) -> [f64; 2] {
    let cleaned = raw.replace(' ', "");
    let parts: Vec<&str> = cleaned.split(',').collect();
    if parts.len() == 2
        && let (Ok(min), Ok(max)) = (parts[0].parse::<f64>(), parts[1].parse::<f64>())
    {
        return [min, max];
    }
    error!(target: "Respond", "解析分段回复的间隔时间失败: {:?}", raw);
    [1.5, 3.5]
}

#[async_trait]
impl Stage for RespondStage {
    fn name(&self) -> &'static str {
        "RespondStage"
    }

    async fn initialize(&mut self, ctx: &PipelineContext) -> BotResult<()> {
        let settings = &ctx.config.platform_settings;
        self.reply_with_mention = settings.reply_with_mention;
        self.reply_with_quote = settings.reply_with_quote;

        let seg = &settings.segmented_reply;
        self.enable_seg = seg.enable;
        self.only_llm_result = seg.only_llm_result;
        self.interval_method = seg.interval_method.clone();
        self.log_base = seg.log_base;
        self.interval = parse_interval(&seg.interval);
        self.hooks = ctx.hooks.clone();

        if self.enable_seg {
            info!(target: "Respond", "分段回复间隔时间: {:?}", self.interval);
        }
        Ok(())
    }

    async fn process(
        &self,
        event: &mut MessageEvent,
        _downstream: &Downstream<'_>,
    ) -> BotResult<()> {
        let Some(result) = event.get_result().cloned() else {
            return Ok(());
        };

        // 流式分片直接发送，不分段也不装饰
        if result.content_type == ResultContentType::StreamingChunk {
            if let Err(e) = event.send(&result.chain).await {
                error!(target: "Respond", "发送流式分片失败: {}", e);
            }
            event.clear_result();
            return Ok(());
        }

        let already_streamed = result.content_type == ResultContentType::StreamingFinish;

        if !result.chain.chain.is_empty() && !already_streamed {
            if result.chain.is_empty_chain() {
                info!(target: "Respond", "消息为空，跳过发送阶段");
                event.clear_result();
                event.stop_event();
                return Ok(());
            }

            if self.enable_seg && (!self.only_llm_result || result.is_llm_result()) {
                // 抽取装饰组件：第一个 @ 与第一个引用，过滤生成新链
                let mut decorations: Vec<Component> = Vec::new();
                let mut rest: Vec<Component> = Vec::new();
                let mut mention_taken = false;
                let mut quote_taken = false;
                for comp in result.chain.chain.iter().cloned() {
                    match &comp {
                        Component::At { .. } if self.reply_with_mention && !mention_taken => {
                            decorations.push(comp);
                            mention_taken = true;
                        }
                        Component::Reply { .. } if self.reply_with_quote && !quote_taken => {
                            decorations.push(comp);
                            quote_taken = true;
                        }
                        _ => rest.push(comp),
                    }
                }

                for comp in rest {
                    let wait = self.calc_comp_interval(&comp);
                    tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                    let mut chain = decorations.clone();
                    chain.push(comp);
                    let segment = MessageChain { chain };
                    if let Err(e) = event.send(&segment).await {
                        error!(target: "Respond", "发送消息失败: {}", e);
                        break;
                    }
                }
            } else if let Err(e) = event.send(&result.chain).await {
                error!(
                    target: "Respond",
                    "发送消息失败: {} chain: {}", e, result.chain.outline()
                );
            }

            info!(
                target: "Respond",
                "Yunque -> {}/{}: {}",
                event.sender.name, event.sender.id, result.chain.outline()
            );
        }

        if !self.hooks.run_after_message_sent(event).await {
            return Ok(());
        }
        event.clear_result();
        Ok(())
    }
}
