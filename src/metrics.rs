use std::sync::atomic::{AtomicU64, Ordering};

use crate::debug;

static LLM_TICKS: AtomicU64 = AtomicU64::new(0);
static MESSAGE_TICKS: AtomicU64 = AtomicU64::new(0);

/// 进程内指标，上报为即发即忘
pub struct Metric;

impl Metric {
    /// 记一次 LLM 调用
    pub fn upload_llm_tick(model_name: String, provider_type: String) {
        LLM_TICKS.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            debug!(target: "Metric", "llm_tick model={} provider={}", model_name, provider_type);
        });
    }

    /// 记一次消息处理
    pub fn message_tick() {
        MESSAGE_TICKS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn llm_ticks() -> u64 {
        LLM_TICKS.load(Ordering::Relaxed)
    }

    pub fn message_ticks() -> u64 {
        MESSAGE_TICKS.load(Ordering::Relaxed)
    }
}
