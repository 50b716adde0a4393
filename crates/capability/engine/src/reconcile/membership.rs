//! 成员关系：设备增删、全量刷新、查询。
//!
//! 全量刷新只在计算待删除集合时持有全局写锁，落库前释放。

use crate::context::TwinContext;
use crate::convert::{attr_from_row, attr_row, device_row, twin_from_row, twin_row};
use crate::error::EngineError;
use crate::reconcile::attr::{apply_attrs, publish_attrs};
use crate::reconcile::twin::{apply_twin, publish_twin};
use crate::retry::retry;
use domain::payload::{MembershipDetail, MembershipGetResult, build_membership_updated};
use domain::topic::{MEMBERSHIP_GET_RESULT, MEMBERSHIP_UPDATED, node_topic};
use domain::{BaseMessage, DealType, Device, DeviceSnapshot, PayloadError};
use std::collections::BTreeSet;
use tracing::{error, info};

/// 入站设备规范化为与库中一致的快照与行。
fn normalize(device: &Device) -> DeviceSnapshot {
    let mut snapshot = DeviceSnapshot::from_device(device);
    snapshot.attributes = snapshot
        .attributes
        .iter()
        .map(|(name, attr)| (name.clone(), attr_from_row(&attr_row(&device.id, name, attr))))
        .collect();
    snapshot.twin = snapshot
        .twin
        .iter()
        .map(|(name, twin)| (name.clone(), twin_from_row(&twin_row(&device.id, name, twin))))
        .collect();
    snapshot
}

/// 新增设备；`full` 为真时已存在的设备按 detail 合并属性与孪生。
pub async fn add_devices(
    ctx: &TwinContext,
    devices: &[Device],
    full: bool,
    event_id: &str,
) -> Result<(), EngineError> {
    let mut added = Vec::new();
    let mut failure: Option<EngineError> = None;

    for device in devices.iter().filter(|device| !device.id.is_empty()) {
        if ctx.is_device_exist(&device.id) {
            if full {
                if let Err(err) = merge_device(ctx, device, event_id).await {
                    error!(target: "twin.engine", device_id = %device.id, error = %err, "device_merge_failed");
                    failure = failure.or(Some(err));
                }
            }
            continue;
        }

        let snapshot = normalize(device);
        ctx.ensure_mutex(&snapshot.id);
        let Some(guard) = ctx.lock(&snapshot.id).await else {
            continue;
        };
        if ctx.is_device_exist(&snapshot.id) {
            continue;
        }
        let row = device_row(&snapshot);
        let attrs: Vec<_> = snapshot
            .attributes
            .iter()
            .map(|(name, attr)| attr_row(&snapshot.id, name, attr))
            .collect();
        let twins: Vec<_> = snapshot
            .twin
            .iter()
            .map(|(name, twin)| twin_row(&snapshot.id, name, twin))
            .collect();
        let store = ctx.store();
        let written = retry(ctx.retry_policy(), "add_device_trans", || {
            store.add_device_trans(std::slice::from_ref(&row), &attrs, &twins)
        })
        .await;
        match written {
            Ok(()) => {
                ctx.put_device(snapshot.clone());
                info!(target: "twin.engine", device_id = %snapshot.id, "device_added");
                added.push(snapshot);
            }
            Err(err) => {
                ctx.remove_device(&snapshot.id);
                failure = failure.or(Some(err.into()));
            }
        }
        drop(guard);
    }

    if !added.is_empty() {
        publish_membership(ctx, event_id, &added, &[]).await?;
    }
    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn merge_device(ctx: &TwinContext, incoming: &Device, event_id: &str) -> Result<(), EngineError> {
    let guard = ctx
        .lock(&incoming.id)
        .await
        .ok_or_else(|| EngineError::device_not_found(&incoming.id))?;
    let mut device = ctx
        .get_device(&incoming.id)
        .ok_or_else(|| EngineError::device_not_found(&incoming.id))?;
    let attrs = apply_attrs(ctx, &mut device, &incoming.attributes, DealType::Detail).await?;
    let twins = apply_twin(ctx, &mut device, &incoming.twin, DealType::Detail).await?;
    drop(guard);
    publish_attrs(ctx, &device.id, event_id, &attrs).await?;
    publish_twin(ctx, &device, event_id, &twins, DealType::Detail).await
}

/// 删除设备及其属性与孪生。
pub async fn remove_devices(
    ctx: &TwinContext,
    devices: &[Device],
    event_id: &str,
) -> Result<(), EngineError> {
    let mut removed = Vec::new();
    let mut failure: Option<EngineError> = None;

    for device in devices {
        let Some(guard) = ctx.lock(&device.id).await else {
            continue;
        };
        let ids = [device.id.clone()];
        let store = ctx.store();
        let written = retry(ctx.retry_policy(), "delete_device_trans", || {
            store.delete_device_trans(&ids)
        })
        .await;
        match written {
            Ok(()) => {
                if let Some(snapshot) = ctx.remove_device(&device.id) {
                    info!(target: "twin.engine", device_id = %device.id, "device_removed");
                    removed.push(snapshot);
                }
            }
            Err(err) => {
                failure = failure.or(Some(err.into()));
            }
        }
        drop(guard);
    }

    if !removed.is_empty() {
        publish_membership(ctx, event_id, &[], &removed).await?;
    }
    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// 全量刷新：删除本地多出的设备，新增或合并入站设备。
pub async fn full_refresh(ctx: &TwinContext, detail: &MembershipDetail) -> Result<(), EngineError> {
    let incoming: BTreeSet<&str> = detail.devices.iter().map(|device| device.id.as_str()).collect();
    let to_remove: Vec<Device> = {
        let _all = ctx.lock_all().await;
        ctx.device_ids()
            .into_iter()
            .filter(|id| !incoming.contains(id.as_str()))
            .map(|id| Device {
                id,
                ..Device::default()
            })
            .collect()
    };
    info!(
        target: "twin.engine",
        incoming = detail.devices.len(),
        removing = to_remove.len(),
        "membership_full_refresh"
    );
    let event_id = detail.base.event_id.as_str();
    let added = add_devices(ctx, &detail.devices, true, event_id).await;
    let removed = remove_devices(ctx, &to_remove, event_id).await;
    added.and(removed)
}

/// 回复 `membership/get/result`。
pub async fn get_membership(ctx: &TwinContext, event_id: &str) -> Result<(), EngineError> {
    let mut devices = ctx.devices();
    devices.sort_by(|left, right| left.id.cmp(&right.id));
    let result = MembershipGetResult {
        base: BaseMessage::reply_to(event_id),
        devices: devices
            .iter()
            .map(DeviceSnapshot::to_membership_device)
            .collect(),
    };
    let payload = serde_json::to_vec(&result).map_err(PayloadError::from)?;
    ctx.send_to_edge(&node_topic(ctx.node_name(), MEMBERSHIP_GET_RESULT), payload)
        .await
}

async fn publish_membership(
    ctx: &TwinContext,
    event_id: &str,
    added: &[DeviceSnapshot],
    removed: &[DeviceSnapshot],
) -> Result<(), EngineError> {
    let payload = build_membership_updated(BaseMessage::reply_to(event_id), added, removed)?;
    ctx.send_to_edge(&node_topic(ctx.node_name(), MEMBERSHIP_UPDATED), payload)
        .await
}
