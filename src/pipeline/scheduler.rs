use futures_util::future::BoxFuture;

use crate::event::MessageEvent;
use crate::message::MessageChain;
use crate::pipeline::{PipelineContext, Stage};
use crate::{BotResult, debug, error};

/// 流水线调度器
///
/// 阶段列表在构造时按固定顺序给定，初始化后不再变化。
/// 每个挂起点前后都会检查事件的停止标志。
pub struct PipelineScheduler {
    stages: Vec<Box<dyn Stage>>,
}

impl PipelineScheduler {
    pub async fn new(
        mut stages: Vec<Box<dyn Stage>>,
        ctx: &PipelineContext,
    ) -> BotResult<Self> {
        for stage in &mut stages {
            stage.initialize(ctx).await?;
        }
        Ok(Self { stages })
    }

    /// 处理一条事件直至流水线结束
    ///
    /// 阶段报错只终止当前事件，不影响调度器本身。
    pub async fn execute(&self, event: &mut MessageEvent) {
        if let Err(e) = self.process_from(event, 0).await {
            error!(target: "Pipeline", "处理事件失败: {}", e);
        }

        // 交互式平台兜底：整条流水线没有产生任何发送操作时，
        // 回一条空消息解除客户端的等待。
        if !event.has_send_oper() && event.platform_id == "console" {
            if let Err(e) = event.send(&MessageChain::new()).await {
                debug!(target: "Pipeline", "空消息兜底发送失败: {}", e);
            }
        }
    }

    fn process_from<'a>(
        &'a self,
        event: &'a mut MessageEvent,
        from: usize,
    ) -> BoxFuture<'a, BotResult<()>> {
        Box::pin(async move {
            for i in from..self.stages.len() {
                if event.is_stopped() {
                    break;
                }
                let stage = &self.stages[i];
                debug!(target: "Pipeline", "-> {}", stage.name());
                let downstream = Downstream {
                    scheduler: self,
                    from: i + 1,
                };
                stage.process(event, &downstream).await?;
                if event.is_stopped() {
                    debug!(target: "Pipeline", "{} 之后事件停止传播", stage.name());
                    break;
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
impl PipelineScheduler {
    /// 空流水线，供单独测试某个阶段时充当下游
    pub(crate) fn noop() -> Self {
        Self { stages: Vec::new() }
    }

    /// 从头开始投递的下游句柄
    pub(crate) fn tail_handle(&self) -> Downstream<'_> {
        Downstream {
            scheduler: self,
            from: 0,
        }
    }
}

/// 阶段的下游句柄
///
/// `deliver` 对事件当前的结果完整执行一遍剩余阶段，返回后控制权
/// 回到发起的阶段，效果等同于阶段在中途让出了一次结果。
pub struct Downstream<'a> {
    scheduler: &'a PipelineScheduler,
    from: usize,
}

impl Downstream<'_> {
    pub async fn deliver(&self, event: &mut MessageEvent) -> BotResult<()> {
        if event.is_stopped() {
            return Ok(());
        }
        self.scheduler.process_from(event, self.from).await
    }
}
