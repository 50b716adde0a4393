//! 设备状态更新与查询。

use crate::context::TwinContext;
use crate::convert::sync_device_from_store;
use crate::error::EngineError;
use crate::retry::retry;
use domain::payload::{DeviceMsg, DeviceStateInfo, DeviceStateResult};
use domain::topic::{STATE_GET_RESULT, STATE_UPDATE_RESULT, cloud_state_update, device_topic};
use domain::{BaseMessage, Content, DeviceSnapshot, DeviceState, PayloadError};
use tracing::{info, warn};
use twin_storage::{ColumnSet, ColumnValue, DeviceColumn};

const LAST_ONLINE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn state_info(device: &DeviceSnapshot) -> DeviceStateInfo {
    DeviceStateInfo {
        name: device.name.clone(),
        state: device.state.clone(),
        last_online: device.last_online.clone(),
    }
}

/// 更新设备状态并刷新 `last_online`；发布本地结果与云端状态。
pub async fn update_device_state(
    ctx: &TwinContext,
    device_id: &str,
    event_id: &str,
    state: &str,
) -> Result<(), EngineError> {
    let guard = ctx
        .lock(device_id)
        .await
        .ok_or_else(|| EngineError::device_not_found(device_id))?;
    let mut device = ctx
        .get_device(device_id)
        .ok_or_else(|| EngineError::device_not_found(device_id))?;
    let state: DeviceState = state
        .parse()
        .map_err(|err: domain::action::InvalidDeviceState| EngineError::BadRequest(err.to_string()))?;
    let last_online = chrono::Local::now().format(LAST_ONLINE_FORMAT).to_string();

    let mut cols = ColumnSet::new();
    cols.insert(DeviceColumn::State, ColumnValue::text(state.as_str()));
    cols.insert(DeviceColumn::LastOnline, ColumnValue::text(&last_online));
    let store = ctx.store();
    let written = retry(ctx.retry_policy(), "update_device_fields", || {
        store.update_device_fields(device_id, &cols)
    })
    .await;
    if let Err(err) = written {
        if let Err(sync_err) = sync_device_from_store(ctx, device_id).await {
            warn!(
                target: "twin.engine",
                device_id = %device_id,
                error = %sync_err,
                "device_resync_failed"
            );
        }
        return Err(err.into());
    }

    device.state = state.as_str().to_string();
    device.last_online = last_online;
    ctx.put_device(device.clone());
    drop(guard);
    info!(target: "twin.engine", device_id = %device_id, state = %state, "device_state_updated");

    let result = DeviceStateResult {
        base: BaseMessage::reply_to(event_id),
        device: state_info(&device),
    };
    let payload = serde_json::to_vec(&result).map_err(PayloadError::from)?;
    ctx.send_to_edge(&device_topic(device_id, STATE_UPDATE_RESULT), payload)
        .await?;

    let report = DeviceMsg {
        base: BaseMessage::reply_to(event_id),
        name: device.name.clone(),
        state: device.state.clone(),
        last_online_time: device.last_online.clone(),
    };
    let content = Content::json(&report).map_err(PayloadError::from)?;
    ctx.send_to_cloud(&cloud_state_update(device_id), content)
        .await
}

/// 回复 `state/get/result`。
pub async fn get_device_state(
    ctx: &TwinContext,
    device_id: &str,
    event_id: &str,
) -> Result<(), EngineError> {
    let device = ctx
        .read_device(device_id)
        .await
        .ok_or_else(|| EngineError::device_not_found(device_id))?;
    let result = DeviceStateResult {
        base: BaseMessage::reply_to(event_id),
        device: state_info(&device),
    };
    let payload = serde_json::to_vec(&result).map_err(PayloadError::from)?;
    ctx.send_to_edge(&device_topic(device_id, STATE_GET_RESULT), payload)
        .await
}
