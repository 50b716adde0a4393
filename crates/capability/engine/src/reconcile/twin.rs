//! 孪生调和（deal_msg_twin）。
//!
//! 对每个入站属性按三条分支之一处理：
//! - 删除：rest 下入站为 `null`，或入站类型为 `deleted`
//! - 新增：本地不存在该属性
//! - 比较：本地与入站都存在，逐半比较取值
//!
//! 期望值与实际值两半各自做版本检查。rest 只递增本地 edge 版本；
//! 云端同步要求入站版本两个分量都不小于本地，接受后直接采用入站版本。

use crate::context::TwinContext;
use crate::convert::{sync_device_from_store, twin_columns, twin_row};
use crate::error::EngineError;
use crate::retry::retry;
use domain::payload::{
    DeviceTwinResult, build_twin_delta, build_twin_document, build_twin_result,
};
use domain::topic::{TWIN_DELTA, TWIN_DOCUMENT, TWIN_UPDATE_RESULT, cloud_edge_updated, device_topic};
use domain::twin::{TYPE_DELETED, TYPE_STRING};
use domain::validation::validate_value;
use domain::{
    BaseMessage, Content, DealType, DeviceSnapshot, MsgTwin, PayloadError, TwinDoc, TwinValue,
    TwinVersion, TypeMetadata,
};
use std::collections::BTreeMap;
use tracing::{debug, warn};
use twin_storage::{DeviceTwinRow, TwinUpdate};

/// 一次调和的产出。
#[derive(Debug, Default)]
pub struct TwinOutcome {
    /// 回显给请求方的属性；墓碑为 `None`。
    pub result: BTreeMap<String, Option<MsgTwin>>,
    /// 需要云端对齐的属性（edge_updated）。
    pub sync_result: BTreeMap<String, Option<MsgTwin>>,
    pub document: BTreeMap<String, TwinDoc>,
    pub adds: Vec<DeviceTwinRow>,
    pub updates: Vec<TwinUpdate>,
}

impl TwinOutcome {
    pub fn has_changes(&self) -> bool {
        !self.adds.is_empty() || !self.updates.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
enum Half {
    Expected,
    Actual,
}

const HALVES: [Half; 2] = [Half::Expected, Half::Actual];

impl Half {
    fn value(self, twin: &MsgTwin) -> Option<&TwinValue> {
        match self {
            Half::Expected => twin.expected.as_ref(),
            Half::Actual => twin.actual.as_ref(),
        }
    }

    fn value_mut(self, twin: &mut MsgTwin) -> &mut Option<TwinValue> {
        match self {
            Half::Expected => &mut twin.expected,
            Half::Actual => &mut twin.actual,
        }
    }

    fn version(self, twin: &MsgTwin) -> Option<&TwinVersion> {
        match self {
            Half::Expected => twin.expected_version.as_ref(),
            Half::Actual => twin.actual_version.as_ref(),
        }
    }

    fn version_mut(self, twin: &mut MsgTwin) -> &mut Option<TwinVersion> {
        match self {
            Half::Expected => &mut twin.expected_version,
            Half::Actual => &mut twin.actual_version,
        }
    }
}

/// 版本检查；接受时就地更新 `version`。
pub fn deal_version(
    version: &mut TwinVersion,
    incoming: Option<&TwinVersion>,
    deal_type: DealType,
) -> Result<(), EngineError> {
    if deal_type.is_rest() {
        version.bump_edge();
        return Ok(());
    }
    let Some(incoming) = incoming else {
        if deal_type == DealType::SyncDelete {
            return Ok(());
        }
        return Err(EngineError::Conflict(
            "version not allowed be nil while syncing".to_string(),
        ));
    };
    if !version.compare_with_cloud(incoming) {
        return Err(EngineError::Conflict(
            "not allowed to sync due to version conflict".to_string(),
        ));
    }
    *version = *incoming;
    Ok(())
}

/// 调和入站孪生并就地修改快照；只在 rest 下因非法取值整体失败。
pub fn deal_msg_twin(
    device: &mut DeviceSnapshot,
    incoming: &BTreeMap<String, Option<MsgTwin>>,
    deal_type: DealType,
) -> Result<TwinOutcome, EngineError> {
    let mut outcome = TwinOutcome::default();
    for (key, msg_twin) in incoming {
        match device.twin.get(key).cloned() {
            Some(local) => {
                let deleting = match msg_twin {
                    None => deal_type.is_rest(),
                    Some(msg_twin) => msg_twin.is_tombstone(),
                };
                if deleting {
                    deal_twin_delete(device, key, &local, msg_twin.as_ref(), deal_type, &mut outcome);
                } else if let Some(msg_twin) = msg_twin {
                    deal_twin_compare(device, key, &local, msg_twin, deal_type, &mut outcome)?;
                }
            }
            None => {
                if let Some(msg_twin) = msg_twin {
                    deal_twin_add(device, key, msg_twin, deal_type, &mut outcome)?;
                }
            }
        }
    }
    Ok(outcome)
}

fn deal_twin_delete(
    device: &mut DeviceSnapshot,
    key: &str,
    local: &MsgTwin,
    incoming: Option<&MsgTwin>,
    deal_type: DealType,
    outcome: &mut TwinOutcome,
) {
    if local.is_tombstone() {
        return;
    }
    if deal_type.is_rest() && !local.optional.unwrap_or(true) {
        debug!(target: "twin.engine", device_id = %device.id, key = %key, "twin_not_deletable");
        return;
    }
    let deal_type = if deal_type.is_rest() {
        deal_type
    } else {
        DealType::SyncDelete
    };

    let mut next = local.clone();
    for half in HALVES {
        let incoming_version = incoming
            .filter(|_| !deal_type.is_rest())
            .and_then(|incoming| half.version(incoming));
        let Some(version) = half.version_mut(&mut next).as_mut() else {
            continue;
        };
        if let Err(err) = deal_version(version, incoming_version, deal_type) {
            debug!(
                target: "twin.engine",
                device_id = %device.id,
                key = %key,
                error = %err,
                "twin_delete_rejected"
            );
            outcome
                .sync_result
                .insert(key.to_string(), Some(local.copy(true)));
            return;
        }
    }
    *Half::Expected.value_mut(&mut next) = None;
    *Half::Actual.value_mut(&mut next) = None;
    next.metadata = Some(TypeMetadata::of_type(TYPE_DELETED));

    let cols = twin_columns(&twin_row(&device.id, key, local), &twin_row(&device.id, key, &next));
    outcome.updates.push(TwinUpdate {
        device_id: device.id.clone(),
        name: key.to_string(),
        cols,
    });
    outcome.result.insert(key.to_string(), None);
    outcome.document.insert(
        key.to_string(),
        TwinDoc {
            last_state: Some(local.copy(false)),
            current_state: None,
        },
    );
    if deal_type.is_rest() {
        outcome
            .sync_result
            .insert(key.to_string(), Some(next.copy(true)));
    }
    device.twin.insert(key.to_string(), next);
}

fn deal_twin_add(
    device: &mut DeviceSnapshot,
    key: &str,
    incoming: &MsgTwin,
    deal_type: DealType,
    outcome: &mut TwinOutcome,
) -> Result<(), EngineError> {
    let tombstone = incoming.is_tombstone();
    let deal_type = if tombstone && !deal_type.is_rest() {
        DealType::SyncDelete
    } else {
        deal_type
    };
    let mut metadata = incoming.metadata.clone().unwrap_or_default();
    if metadata.value_type.is_empty() {
        metadata.value_type = TYPE_STRING.to_string();
    }
    let mut next = MsgTwin {
        optional: Some(incoming.optional.unwrap_or(true)),
        ..MsgTwin::default()
    };

    for half in HALVES {
        let value = half.value(incoming);
        let incoming_version = half.version(incoming);
        if tombstone && incoming_version.is_none() {
            continue;
        }
        if !tombstone && value.is_none() {
            continue;
        }
        let mut version = TwinVersion::default();
        let checked = if deal_type.is_rest() {
            None
        } else {
            incoming_version
        };
        if let Err(err) = deal_version(&mut version, checked, deal_type) {
            debug!(
                target: "twin.engine",
                device_id = %device.id,
                key = %key,
                error = %err,
                "twin_add_rejected"
            );
            return Ok(());
        }
        if let Some(value) = value.filter(|_| !tombstone) {
            if let Some(text) = value.value.as_deref() {
                if let Err(err) = validate_value(&metadata.value_type, text) {
                    if deal_type.is_rest() {
                        return Err(EngineError::BadRequest(format!(
                            "the value of twin {key} is invalid: {err}"
                        )));
                    }
                    warn!(
                        target: "twin.engine",
                        device_id = %device.id,
                        key = %key,
                        error = %err,
                        "twin_value_dropped"
                    );
                    return Ok(());
                }
            }
            *half.value_mut(&mut next) = Some(value.clone());
        }
        *half.version_mut(&mut next) = Some(version);
    }
    next.metadata = Some(metadata);

    outcome.adds.push(twin_row(&device.id, key, &next));
    let current = if tombstone {
        None
    } else {
        Some(next.copy(false))
    };
    outcome.result.insert(key.to_string(), current.clone());
    outcome.document.insert(
        key.to_string(),
        TwinDoc {
            last_state: None,
            current_state: current,
        },
    );
    if deal_type.is_rest() {
        outcome
            .sync_result
            .insert(key.to_string(), Some(next.copy(true)));
    }
    device.twin.insert(key.to_string(), next);
    Ok(())
}

fn deal_twin_compare(
    device: &mut DeviceSnapshot,
    key: &str,
    local: &MsgTwin,
    incoming: &MsgTwin,
    deal_type: DealType,
    outcome: &mut TwinOutcome,
) -> Result<(), EngineError> {
    // 墓碑的类型让位于入站类型
    let effective_type = match incoming.value_type() {
        "" if local.is_tombstone() || local.value_type().is_empty() => TYPE_STRING,
        "" => local.value_type(),
        declared => declared,
    }
    .to_string();

    let mut next = local.clone();
    let mut value_changed = false;
    for half in HALVES {
        let Some(value) = half.value(incoming) else {
            continue;
        };
        let Some(text) = value.value.as_deref() else {
            continue;
        };
        let local_text = half.value(local).and_then(|local| local.value.as_deref());
        if local_text == Some(text) {
            continue;
        }
        if let Err(err) = validate_value(&effective_type, text) {
            if deal_type.is_rest() {
                return Err(EngineError::BadRequest(format!(
                    "the value of twin {key} is invalid: {err}"
                )));
            }
            warn!(
                target: "twin.engine",
                device_id = %device.id,
                key = %key,
                error = %err,
                "twin_value_dropped"
            );
            return Ok(());
        }
        let mut version = half.version(local).copied().unwrap_or_default();
        let checked = if deal_type.is_rest() {
            None
        } else {
            half.version(incoming)
        };
        if let Err(err) = deal_version(&mut version, checked, deal_type) {
            if deal_type.is_rest() {
                return Err(err);
            }
            debug!(
                target: "twin.engine",
                device_id = %device.id,
                key = %key,
                error = %err,
                "twin_sync_rejected"
            );
            outcome
                .sync_result
                .insert(key.to_string(), Some(local.copy(true)));
            return Ok(());
        }
        *half.value_mut(&mut next) = Some(value.clone());
        *half.version_mut(&mut next) = Some(version);
        value_changed = true;
    }

    if let Some(optional) = incoming.optional {
        next.optional = Some(optional);
    }
    match incoming
        .metadata
        .as_ref()
        .filter(|metadata| !metadata.value_type.is_empty())
    {
        Some(metadata) => next.metadata = Some(metadata.clone()),
        None if value_changed && local.is_tombstone() => {
            next.metadata = Some(TypeMetadata::of_type(effective_type));
        }
        None => {}
    }

    outcome
        .result
        .insert(key.to_string(), Some(next.copy(false)));
    let cols = twin_columns(&twin_row(&device.id, key, local), &twin_row(&device.id, key, &next));
    if cols.is_empty() {
        return Ok(());
    }
    outcome.updates.push(TwinUpdate {
        device_id: device.id.clone(),
        name: key.to_string(),
        cols,
    });
    outcome.document.insert(
        key.to_string(),
        TwinDoc {
            last_state: Some(local.copy(false)),
            current_state: Some(next.copy(false)),
        },
    );
    if deal_type.is_rest() {
        outcome
            .sync_result
            .insert(key.to_string(), Some(next.copy(true)));
    }
    device.twin.insert(key.to_string(), next);
    Ok(())
}

/// 调和并落库；调用方持有设备锁。落库失败时以库中数据恢复快照。
pub async fn apply_twin(
    ctx: &TwinContext,
    device: &mut DeviceSnapshot,
    incoming: &BTreeMap<String, Option<MsgTwin>>,
    deal_type: DealType,
) -> Result<TwinOutcome, EngineError> {
    let outcome = deal_msg_twin(device, incoming, deal_type)?;
    if outcome.has_changes() {
        let store = ctx.store();
        let written = retry(ctx.retry_policy(), "device_twin_trans", || {
            store.device_twin_trans(&outcome.adds, &[], &outcome.updates)
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

/// 发布调和结果：rest 回执、增量、文档、edge_updated。
pub async fn publish_twin(
    ctx: &TwinContext,
    device: &DeviceSnapshot,
    event_id: &str,
    outcome: &TwinOutcome,
    deal_type: DealType,
) -> Result<(), EngineError> {
    if deal_type.is_rest() {
        let payload = build_twin_result(BaseMessage::reply_to(event_id), &outcome.result, deal_type)?;
        ctx.send_to_edge(&device_topic(&device.id, TWIN_UPDATE_RESULT), payload)
            .await?;
    }
    if outcome.has_changes() {
        if let Some(delta) = build_twin_delta(BaseMessage::reply_to(event_id), &device.twin)? {
            ctx.send_to_edge(&device_topic(&device.id, TWIN_DELTA), delta)
                .await?;
        }
        let document = build_twin_document(BaseMessage::reply_to(event_id), outcome.document.clone())?;
        ctx.send_to_edge(&device_topic(&device.id, TWIN_DOCUMENT), document)
            .await?;
    }
    if !outcome.sync_result.is_empty() {
        let body = DeviceTwinResult {
            base: BaseMessage::reply_to(event_id),
            twin: outcome.sync_result.clone(),
        };
        let content = Content::json(&body).map_err(PayloadError::from)?;
        ctx.send_to_cloud(&cloud_edge_updated(&device.id), content)
            .await?;
    }
    Ok(())
}

/// 单设备孪生更新：加锁、调和、落库、发布。
pub async fn update_twin(
    ctx: &TwinContext,
    device_id: &str,
    event_id: &str,
    incoming: &BTreeMap<String, Option<MsgTwin>>,
    deal_type: DealType,
) -> Result<(), EngineError> {
    let guard = ctx
        .lock(device_id)
        .await
        .ok_or_else(|| EngineError::device_not_found(device_id))?;
    let mut device = ctx
        .get_device(device_id)
        .ok_or_else(|| EngineError::device_not_found(device_id))?;
    let outcome = apply_twin(ctx, &mut device, incoming, deal_type).await?;
    drop(guard);
    publish_twin(ctx, &device, event_id, &outcome, deal_type).await
}
