use super::{Worker, unknown_action};
use crate::context::{DtMessage, TwinContext};
use crate::error::EngineError;
use async_trait::async_trait;
use domain::message::{
    CLOUD_CONNECTED, CLOUD_DISCONNECTED, EDGE_HUB_SOURCE, OP_GET, RESOURCE_GROUP,
};
use domain::payload::ConnectedInfo;
use domain::topic::CLOUD_MEMBERSHIP_DETAIL;
use domain::{Action, ConnectionState, Content, Message, WorkerKind, build_model_message};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use twin_bus::{ModuleSink, send_with_retry};

pub const DEFAULT_RESEND_INTERVAL: Duration = Duration::from_secs(60);

/// 出站通道：上云（edgehub）与本地总线；维护确认表并定时重发。
pub struct CommWorker {
    ctx: Arc<TwinContext>,
    hub: Arc<dyn ModuleSink>,
    bus: Arc<dyn ModuleSink>,
    resend_interval: Duration,
    send_retries: u64,
    send_backoff_ms: u64,
}

impl CommWorker {
    pub fn new(ctx: Arc<TwinContext>, hub: Arc<dyn ModuleSink>, bus: Arc<dyn ModuleSink>) -> Self {
        Self {
            ctx,
            hub,
            bus,
            resend_interval: DEFAULT_RESEND_INTERVAL,
            send_retries: 0,
            send_backoff_ms: 0,
        }
    }

    pub fn with_resend_interval(mut self, interval: Duration) -> Self {
        self.resend_interval = interval;
        self
    }

    pub fn with_send_retry(mut self, retries: u64, backoff_ms: u64) -> Self {
        self.send_retries = retries;
        self.send_backoff_ms = backoff_ms;
        self
    }

    async fn send_to_cloud(&self, message: DtMessage) -> Result<(), EngineError> {
        if self.ctx.state() == ConnectionState::Disconnected {
            twin_telemetry::record_cloud_dropped();
            debug!(
                target: "twin.comm",
                message_id = %message.msg.id(),
                resource = %message.msg.resource(),
                "cloud_message_dropped"
            );
            return Ok(());
        }
        send_with_retry(
            self.hub.clone(),
            &message.msg,
            self.send_retries,
            self.send_backoff_ms,
        )
        .await?;
        self.ctx.add_confirm(message);
        Ok(())
    }

    async fn send_to_edge(&self, message: &DtMessage) -> Result<(), EngineError> {
        send_with_retry(
            self.bus.clone(),
            &message.msg,
            self.send_retries,
            self.send_backoff_ms,
        )
        .await?;
        Ok(())
    }

    async fn life_cycle(&self, message: &DtMessage) -> Result<(), EngineError> {
        if message.msg.source() != EDGE_HUB_SOURCE {
            debug!(
                target: "twin.comm",
                resource = %message.msg.resource(),
                "bus_connection_event"
            );
            return Ok(());
        }
        match connection_event(&message.msg).as_deref() {
            Some(CLOUD_CONNECTED) => {
                if self.ctx.state() == ConnectionState::Connected {
                    return Ok(());
                }
                self.ctx.set_state(ConnectionState::Connected);
                info!(target: "twin.comm", "cloud_connected");
                let request = build_model_message(
                    RESOURCE_GROUP,
                    "",
                    CLOUD_MEMBERSHIP_DETAIL,
                    OP_GET,
                    Content::Text("Get membership detail".to_string()),
                );
                self.send_to_cloud(DtMessage::new(Action::SendToCloud, "", request))
                    .await
            }
            Some(CLOUD_DISCONNECTED) => {
                self.ctx.set_state(ConnectionState::Disconnected);
                info!(target: "twin.comm", "cloud_disconnected");
                Ok(())
            }
            other => {
                warn!(target: "twin.comm", event = ?other, "connection_event_unknown");
                Ok(())
            }
        }
    }

    fn confirm(&self, message: &DtMessage) {
        let parent_id = message.msg.parent_id();
        if self.ctx.remove_confirm(parent_id) {
            debug!(target: "twin.comm", message_id = %parent_id, "cloud_message_confirmed");
            self.ctx.notify_confirm(parent_id);
        }
    }
}

/// edgehub 连接事件：纯文本，或 `ConnectedInfo` JSON。
fn connection_event(message: &Message) -> Option<String> {
    if let Content::Json(value) = &message.content {
        if let Ok(info) = serde_json::from_value::<ConnectedInfo>(value.clone()) {
            return Some(info.event_type);
        }
    }
    let text = message.content.as_text()?;
    match serde_json::from_str::<ConnectedInfo>(&text) {
        Ok(info) => Some(info.event_type),
        Err(_) => Some(text.trim().to_string()),
    }
}

#[async_trait]
impl Worker for CommWorker {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Comm
    }

    async fn handle(&self, message: DtMessage) -> Result<(), EngineError> {
        match message.action {
            Action::SendToCloud => self.send_to_cloud(message).await,
            Action::SendToEdge => self.send_to_edge(&message).await,
            Action::LifeCycle => self.life_cycle(&message).await,
            Action::Confirm => {
                self.confirm(&message);
                Ok(())
            }
            _ => unknown_action(self.kind(), &message),
        }
    }

    fn tick_interval(&self) -> Option<Duration> {
        Some(self.resend_interval)
    }

    /// 重发确认表中的全部未确认消息。
    async fn on_tick(&self) -> Result<(), EngineError> {
        if self.ctx.state() == ConnectionState::Disconnected {
            return Ok(());
        }
        for pending in self.ctx.pending_confirms() {
            twin_telemetry::record_confirm_resend();
            if let Err(err) = send_with_retry(
                self.hub.clone(),
                &pending.msg,
                self.send_retries,
                self.send_backoff_ms,
            )
            .await
            {
                warn!(
                    target: "twin.comm",
                    message_id = %pending.msg.id(),
                    error = %err,
                    "cloud_message_resend_failed"
                );
            }
        }
        Ok(())
    }
}
