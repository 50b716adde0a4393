use super::{Worker, payload_bytes, unknown_action};
use crate::context::{DtMessage, TwinContext};
use crate::error::EngineError;
use crate::reconcile::{add_devices, full_refresh, get_membership, remove_devices};
use async_trait::async_trait;
use domain::payload::{MembershipDetail, MembershipUpdate};
use domain::{Action, BaseMessage, WorkerKind};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::warn;

/// 处理 `MemGet`、`MemUpdated`（增量）、`MemDetailResult`（全量）。
pub struct MembershipWorker {
    ctx: Arc<TwinContext>,
}

impl MembershipWorker {
    pub fn new(ctx: Arc<TwinContext>) -> Self {
        Self { ctx }
    }

    fn decode<T: DeserializeOwned>(&self, message: &DtMessage) -> Result<Option<T>, EngineError> {
        let payload = payload_bytes(&message.msg)?;
        match serde_json::from_slice(&payload) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                warn!(
                    target: "twin.worker",
                    action = %message.action,
                    error = %err,
                    "membership_payload_malformed"
                );
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl Worker for MembershipWorker {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Membership
    }

    async fn handle(&self, message: DtMessage) -> Result<(), EngineError> {
        match message.action {
            Action::MemGet => {
                let Some(base) = self.decode::<BaseMessage>(&message)? else {
                    return Ok(());
                };
                get_membership(&self.ctx, &base.event_id).await
            }
            Action::MemUpdated => {
                let Some(update) = self.decode::<MembershipUpdate>(&message)? else {
                    return Ok(());
                };
                let event_id = update.base.event_id.as_str();
                let added = add_devices(&self.ctx, &update.added_devices, false, event_id).await;
                let removed = remove_devices(&self.ctx, &update.removed_devices, event_id).await;
                added.and(removed)
            }
            Action::MemDetailResult => {
                let Some(detail) = self.decode::<MembershipDetail>(&message)? else {
                    return Ok(());
                };
                full_refresh(&self.ctx, &detail).await
            }
            _ => unknown_action(self.kind(), &message),
        }
    }
}
