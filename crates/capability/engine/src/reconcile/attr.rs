//! 属性调和。
//!
//! 更新模式下入站 `null` 删除可选属性；全量（detail）模式下本地多出的属性被删除。

use crate::context::TwinContext;
use crate::convert::{attr_columns, attr_from_row, attr_row, sync_device_from_store};
use crate::error::EngineError;
use crate::retry::retry;
use domain::payload::DeviceAttrUpdate;
use domain::topic::{DEVICE_UPDATED, device_topic};
use domain::{BaseMessage, DealType, DeviceSnapshot, MsgAttr, PayloadError};
use std::collections::BTreeMap;
use tracing::warn;
use twin_storage::{AttrUpdate, DeviceAttrRow, RowDelete};

#[derive(Debug, Default)]
pub struct AttrOutcome {
    pub result: BTreeMap<String, Option<MsgAttr>>,
    pub adds: Vec<DeviceAttrRow>,
    pub deletes: Vec<RowDelete>,
    pub updates: Vec<AttrUpdate>,
}

impl AttrOutcome {
    pub fn has_changes(&self) -> bool {
        !self.adds.is_empty() || !self.deletes.is_empty() || !self.updates.is_empty()
    }

    fn delete(&mut self, device: &mut DeviceSnapshot, name: &str) {
        device.attributes.remove(name);
        self.deletes.push(RowDelete {
            device_id: device.id.clone(),
            name: name.to_string(),
        });
        self.result.insert(name.to_string(), None);
    }
}

pub fn deal_msg_attr(
    device: &mut DeviceSnapshot,
    incoming: &BTreeMap<String, Option<MsgAttr>>,
    deal_type: DealType,
) -> AttrOutcome {
    let detail = deal_type == DealType::Detail;
    let mut outcome = AttrOutcome::default();

    for (name, attr) in incoming {
        match (device.attributes.get(name).cloned(), attr) {
            (None, Some(attr)) => {
                let row = attr_row(&device.id, name, attr);
                let added = attr_from_row(&row);
                outcome.adds.push(row);
                outcome.result.insert(name.clone(), Some(added.clone()));
                device.attributes.insert(name.clone(), added);
            }
            (None, None) => {}
            (Some(local), None) => {
                if !detail && local.is_optional() {
                    outcome.delete(device, name);
                }
            }
            (Some(local), Some(attr)) => {
                let mut next = local.clone();
                next.value = attr.value.clone();
                if attr.optional.is_some() {
                    next.optional = attr.optional;
                }
                if attr.metadata.is_some() {
                    next.metadata = attr.metadata.clone();
                }
                let cols = attr_columns(
                    &attr_row(&device.id, name, &local),
                    &attr_row(&device.id, name, &next),
                );
                if cols.is_empty() {
                    continue;
                }
                outcome.updates.push(AttrUpdate {
                    device_id: device.id.clone(),
                    name: name.clone(),
                    cols,
                });
                outcome.result.insert(name.clone(), Some(next.clone()));
                device.attributes.insert(name.clone(), next);
            }
        }
    }

    if detail {
        let missing: Vec<String> = device
            .attributes
            .keys()
            .filter(|name| !incoming.contains_key(*name))
            .cloned()
            .collect();
        for name in missing {
            outcome.delete(device, &name);
        }
    }
    outcome
}

/// 调和并落库；调用方持有设备锁。
pub async fn apply_attrs(
    ctx: &TwinContext,
    device: &mut DeviceSnapshot,
    incoming: &BTreeMap<String, Option<MsgAttr>>,
    deal_type: DealType,
) -> Result<AttrOutcome, EngineError> {
    let outcome = deal_msg_attr(device, incoming, deal_type);
    if outcome.has_changes() {
        let store = ctx.store();
        let written = retry(ctx.retry_policy(), "device_attr_trans", || {
            store.device_attr_trans(&outcome.adds, &outcome.deletes, &outcome.updates)
        })
        .await;
        if let Err(err) = written {
            if let Err(sync_err) = sync_device_from_store(ctx, &device.id).await {
                warn!(
                    target: "twin.engine",
                    device_id = %device.id,
                    error = %sync_err,
                    "device_resync_failed"
                );
            }
            return Err(err.into());
        }
    }
    ctx.put_device(device.clone());
    Ok(outcome)
}

/// 有变化时在 `$hw/events/device/<id>/updated` 发布属性变更。
pub async fn publish_attrs(
    ctx: &TwinContext,
    device_id: &str,
    event_id: &str,
    outcome: &AttrOutcome,
) -> Result<(), EngineError> {
    if !outcome.has_changes() {
        return Ok(());
    }
    let payload = serde_json::to_vec(&DeviceAttrUpdate {
        base: BaseMessage::reply_to(event_id),
        attributes: outcome.result.clone(),
    })
    .map_err(PayloadError::from)?;
    ctx.send_to_edge(&device_topic(device_id, DEVICE_UPDATED), payload)
        .await
}

pub async fn update_attrs(
    ctx: &TwinContext,
    device_id: &str,
    event_id: &str,
    incoming: &BTreeMap<String, Option<MsgAttr>>,
    deal_type: DealType,
) -> Result<(), EngineError> {
    let guard = ctx
        .lock(device_id)
        .await
        .ok_or_else(|| EngineError::device_not_found(device_id))?;
    let mut device = ctx
        .get_device(device_id)
        .ok_or_else(|| EngineError::device_not_found(device_id))?;
    let outcome = apply_attrs(ctx, &mut device, incoming, deal_type).await?;
    drop(guard);
    publish_attrs(ctx, device_id, event_id, &outcome).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attr(value: &str, optional: Option<bool>) -> MsgAttr {
        MsgAttr {
            value: value.to_string(),
            optional,
            metadata: None,
        }
    }

    fn device() -> DeviceSnapshot {
        let mut device = DeviceSnapshot {
            id: "d1".to_string(),
            ..DeviceSnapshot::default()
        };
        device.attributes.insert("kept".to_string(), attr("1", Some(false)));
        device.attributes.insert("loose".to_string(), attr("2", Some(true)));
        device
    }

    #[test]
    fn update_mode_deletes_only_optional_attributes() {
        let mut device = device();
        let incoming = BTreeMap::from([
            ("kept".to_string(), None),
            ("loose".to_string(), None),
            ("fresh".to_string(), Some(attr("3", None))),
        ]);
        let outcome = deal_msg_attr(&mut device, &incoming, DealType::Sync);
        assert_eq!(outcome.deletes.len(), 1);
        assert_eq!(outcome.deletes[0].name, "loose");
        assert_eq!(outcome.adds.len(), 1);
        assert!(device.attributes.contains_key("kept"));
        assert_eq!(device.attributes["fresh"].attr_type(), "string");
    }

    #[test]
    fn unchanged_attribute_produces_no_update() {
        let mut device = device();
        let incoming = BTreeMap::from([("kept".to_string(), Some(attr("1", None)))]);
        let outcome = deal_msg_attr(&mut device, &incoming, DealType::Sync);
        assert!(!outcome.has_changes());
        assert!(!device.attributes["kept"].is_optional());
    }

    #[test]
    fn detail_mode_removes_missing_attributes() {
        let mut device = device();
        let incoming = BTreeMap::from([("kept".to_string(), Some(attr("9", None)))]);
        let outcome = deal_msg_attr(&mut device, &incoming, DealType::Detail);
        assert_eq!(outcome.updates.len(), 1);
        assert_eq!(outcome.deletes.len(), 1);
        assert_eq!(outcome.deletes[0].name, "loose");
        assert_eq!(device.attributes.len(), 1);
    }
}
