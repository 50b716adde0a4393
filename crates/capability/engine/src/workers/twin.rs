use super::{Worker, event_id_of, payload_bytes, reply_error, unknown_action};
use crate::context::{DtMessage, TwinContext};
use crate::error::EngineError;
use crate::reconcile::update_twin;
use async_trait::async_trait;
use domain::payload::{build_twin_result, decode_twin_sync, decode_twin_update};
use domain::topic::{TWIN_GET_RESULT, TWIN_UPDATE_RESULT, device_topic};
use domain::{Action, BaseMessage, DealType, ResultCode, WorkerKind};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// 处理 `TwinUpdate`、`TwinGet`、`TwinCloudSync`。
pub struct TwinWorker {
    ctx: Arc<TwinContext>,
}

impl TwinWorker {
    pub fn new(ctx: Arc<TwinContext>) -> Self {
        Self { ctx }
    }

    async fn twin_update(&self, message: &DtMessage) -> Result<(), EngineError> {
        let device_id = message.identity.as_str();
        let topic = device_topic(device_id, TWIN_UPDATE_RESULT);
        let payload = payload_bytes(&message.msg)?;
        let update = match decode_twin_update(&payload) {
            Ok(update) => update,
            Err(err) => {
                return reply_error(
                    &self.ctx,
                    &topic,
                    &event_id_of(&payload),
                    err.code(),
                    &err.to_string(),
                )
                .await;
            }
        };
        let event_id = update.base.event_id.clone();
        let twins = update.twin.unwrap_or_default();
        if let Err(err) = update_twin(&self.ctx, device_id, &event_id, &twins, DealType::Rest).await
        {
            warn!(
                target: "twin.worker",
                device_id = %device_id,
                error = %err,
                "twin_update_rejected"
            );
            reply_error(&self.ctx, &topic, &event_id, err.code(), &err.to_string()).await?;
        }
        Ok(())
    }

    async fn twin_cloud_sync(&self, message: &DtMessage) -> Result<(), EngineError> {
        let device_id = message.identity.as_str();
        let payload = payload_bytes(&message.msg)?;
        let update = match decode_twin_sync(&payload) {
            Ok(update) => update,
            Err(err) => {
                warn!(target: "twin.worker", device_id = %device_id, error = %err, "twin_sync_malformed");
                return Ok(());
            }
        };
        let twins = update.twin.unwrap_or_default();
        update_twin(
            &self.ctx,
            device_id,
            &update.base.event_id,
            &twins,
            DealType::Sync,
        )
        .await
    }

    async fn twin_get(&self, message: &DtMessage) -> Result<(), EngineError> {
        let device_id = message.identity.as_str();
        let topic = device_topic(device_id, TWIN_GET_RESULT);
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
        let Some(device) = self.ctx.read_device(device_id).await else {
            let err = EngineError::device_not_found(device_id);
            return reply_error(&self.ctx, &topic, &base.event_id, err.code(), &err.to_string())
                .await;
        };
        let twins: BTreeMap<_, _> = device
            .twin
            .iter()
            .map(|(name, twin)| (name.clone(), Some(twin.copy(false))))
            .collect();
        let result = build_twin_result(BaseMessage::reply_to(base.event_id), &twins, DealType::Rest)?;
        self.ctx.send_to_edge(&topic, result).await
    }
}

#[async_trait]
impl Worker for TwinWorker {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Twin
    }

    async fn handle(&self, message: DtMessage) -> Result<(), EngineError> {
        match message.action {
            Action::TwinUpdate => self.twin_update(&message).await,
            Action::TwinCloudSync => self.twin_cloud_sync(&message).await,
            Action::TwinGet => self.twin_get(&message).await,
            _ => unknown_action(self.kind(), &message),
        }
    }
}
