//! Worker：每个 Worker 一个任务，在自己的消息队列、心跳队列
//! （以及可选的定时器）上循环。
//!
//! 队列接收端放在 `Arc<Mutex<_>>` 中，Worker 被重启时新实例接管同一队列。

mod comm;
mod device;
mod dmi;
mod membership;
mod twin;

pub use comm::CommWorker;
pub use device::DeviceWorker;
pub use dmi::DmiWorker;
pub use membership::MembershipWorker;
pub use twin::TwinWorker;

use crate::context::{DtMessage, TwinContext};
use crate::error::EngineError;
use async_trait::async_trait;
use domain::payload::build_error_result;
use domain::{BaseMessage, Message, PayloadError, ResultCode, WorkerKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[async_trait]
pub trait Worker: Send + Sync {
    fn kind(&self) -> WorkerKind;

    async fn handle(&self, message: DtMessage) -> Result<(), EngineError>;

    /// 定时任务周期；`None` 表示没有定时任务。
    fn tick_interval(&self) -> Option<Duration> {
        None
    }

    async fn on_tick(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Worker 主循环：取消、心跳 `Stop` 或队列关闭时退出。
pub async fn run_worker(ctx: Arc<TwinContext>, worker: Arc<dyn Worker>) {
    let kind = worker.kind();
    let receiver = ctx.receiver(kind);
    let heartbeat = ctx.heartbeat_receiver(kind);
    let mut receiver = receiver.lock().await;
    let mut heartbeat = heartbeat.lock().await;

    let period = worker.tick_interval();
    let has_tick = period.is_some();
    let period = period.unwrap_or(Duration::from_secs(3600));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    ctx.touch(kind);
    info!(target: "twin.worker", worker = %kind, "worker_started");
    loop {
        tokio::select! {
            _ = ctx.cancel_token().cancelled() => break,
            beat = heartbeat.recv() => {
                let Some(beat) = beat else { break };
                if ctx.heartbeat(kind, beat).is_err() {
                    break;
                }
            }
            message = receiver.recv() => {
                let Some(message) = message else { break };
                let action = message.action;
                let identity = message.identity.clone();
                if let Err(err) = worker.handle(message).await {
                    warn!(
                        target: "twin.worker",
                        worker = %kind,
                        action = %action,
                        identity = %identity,
                        error = %err,
                        "worker_handle_failed"
                    );
                }
            }
            _ = ticker.tick(), if has_tick => {
                if let Err(err) = worker.on_tick().await {
                    warn!(target: "twin.worker", worker = %kind, error = %err, "worker_tick_failed");
                }
            }
        }
    }
    info!(target: "twin.worker", worker = %kind, "worker_stopped");
}

fn unknown_action(kind: WorkerKind, message: &DtMessage) -> Result<(), EngineError> {
    warn!(
        target: "twin.worker",
        worker = %kind,
        action = %message.action,
        "worker_unknown_action"
    );
    Ok(())
}

/// 消息体字节：JSON 对象重新编码，字节原样返回。
fn payload_bytes(message: &Message) -> Result<Vec<u8>, EngineError> {
    message
        .content
        .to_bytes()
        .map_err(|err| EngineError::Payload(PayloadError::from(err)))
}

/// 尽力读取请求的 event_id，用于错误回执。
fn event_id_of(payload: &[u8]) -> String {
    serde_json::from_slice::<BaseMessage>(payload)
        .map(|base| base.event_id)
        .unwrap_or_default()
}

async fn reply_error(
    ctx: &TwinContext,
    topic: &str,
    event_id: &str,
    code: ResultCode,
    reason: &str,
) -> Result<(), EngineError> {
    debug!(target: "twin.worker", topic = %topic, code = code.as_u16(), reason = %reason, "error_result_sent");
    let payload = build_error_result(BaseMessage::reply_to(event_id), code, reason)?;
    ctx.send_to_edge(topic, payload).await
}
