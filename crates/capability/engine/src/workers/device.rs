use super::{Worker, event_id_of, payload_bytes, reply_error, unknown_action};
use crate::context::{DtMessage, TwinContext};
use crate::error::EngineError;
use crate::reconcile::{get_device_state, update_attrs, update_device_state};
use async_trait::async_trait;
use domain::payload::DeviceUpdate;
use domain::topic::{STATE_GET_RESULT, STATE_UPDATE_RESULT, device_topic};
use domain::{Action, BaseMessage, DealType, ResultCode, WorkerKind};
use std::sync::Arc;
use tracing::warn;

/// 处理 `DeviceUpdated`（云端属性）、`DeviceStateUpdate`、`DeviceStateGet`。
pub struct DeviceWorker {
    ctx: Arc<TwinContext>,
}

impl DeviceWorker {
    pub fn new(ctx: Arc<TwinContext>) -> Self {
        Self { ctx }
    }

    async fn device_updated(&self, message: &DtMessage) -> Result<(), EngineError> {
        let device_id = message.identity.as_str();
        let payload = payload_bytes(&message.msg)?;
        let update: DeviceUpdate = match serde_json::from_slice(&payload) {
            Ok(update) => update,
            Err(err) => {
                warn!(target: "twin.worker", device_id = %device_id, error = %err, "device_update_malformed");
                return Ok(());
            }
        };
        update_attrs(
            &self.ctx,
            device_id,
            &update.base.event_id,
            &update.attributes,
            DealType::Sync,
        )
        .await
    }

    async fn state_update(&self, message: &DtMessage) -> Result<(), EngineError> {
        let device_id = message.identity.as_str();
        let topic = device_topic(device_id, STATE_UPDATE_RESULT);
        let payload = payload_bytes(&message.msg)?;
        let update: DeviceUpdate = match serde_json::from_slice(&payload) {
            Ok(update) => update,
            Err(err) => {
                return reply_error(
                    &self.ctx,
                    &topic,
                    &event_id_of(&payload),
                    ResultCode::BadRequest,
                    &format!("Unmarshal update request body failed: {err}"),
                )
                .await;
            }
        };
        let event_id = update.base.event_id.as_str();
        if let Err(err) = update_device_state(&self.ctx, device_id, event_id, &update.state).await {
            warn!(target: "twin.worker", device_id = %device_id, error = %err, "device_state_rejected");
            reply_error(&self.ctx, &topic, event_id, err.code(), &err.to_string()).await?;
        }
        Ok(())
    }

    async fn state_get(&self, message: &DtMessage) -> Result<(), EngineError> {
        let device_id = message.identity.as_str();
        let topic = device_topic(device_id, STATE_GET_RESULT);
        let payload = payload_bytes(&message.msg)?;
        let base: BaseMessage = match serde_json::from_slice(&payload) {
            Ok(base) => base,
            Err(err) => {
                return reply_error(
                    &self.ctx,
                    &topic,
                    "",
                    ResultCode::BadRequest,
                    &format!("Unmarshal get request body failed: {err}"),
                )
                .await;
            }
        };
        if let Err(err) = get_device_state(&self.ctx, device_id, &base.event_id).await {
            reply_error(&self.ctx, &topic, &base.event_id, err.code(), &err.to_string()).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Worker for DeviceWorker {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Device
    }

    async fn handle(&self, message: DtMessage) -> Result<(), EngineError> {
        match message.action {
            Action::DeviceUpdated => self.device_updated(&message).await,
            Action::DeviceStateUpdate => self.state_update(&message).await,
            Action::DeviceStateGet => self.state_get(&message).await,
            _ => unknown_action(self.kind(), &message),
        }
    }
}
