//! 路由：入站消息 → `(Action, identity)` → 所属 Worker 队列。
//!
//! 带父消息 ID 的入站消息先向 Comm 投递 `Confirm`，再投递分类后的动作。

use crate::context::{DtMessage, TwinContext};
use crate::error::EngineError;
use domain::message::{
    BUS_SOURCE, DEVICE_CONTROLLER_SOURCE, EDGE_HUB_SOURCE, EDGE_MANAGER_SOURCE,
    META_MANAGER_SOURCE,
};
use domain::topic::{
    CONNECTED_PREFIX, DEVICE_PREFIX, DEVICE_UPDATED, DISCONNECTED_PREFIX, MEMBERSHIP_DETAIL_RESULT,
    MEMBERSHIP_GET, MEMBERSHIP_UPDATED, NODE_CONNECTION, NODE_PREFIX, STATE_GET, STATE_UPDATE,
    TWIN_CLOUD_SYNC, TWIN_GET, TWIN_UPDATE, decode_resource,
};
use domain::{Action, Message, WorkerKind};
use tracing::{debug, warn};
use twin_dmi::{RESOURCE_TYPE_DEVICE, RESOURCE_TYPE_DEVICE_MODEL};

/// 总线事件表：`(前缀, 后缀) → 动作`。
const EVENT_ACTIONS: [(&str, &str, Action); 9] = [
    (NODE_PREFIX, MEMBERSHIP_GET, Action::MemGet),
    (NODE_PREFIX, MEMBERSHIP_UPDATED, Action::MemUpdated),
    (NODE_PREFIX, MEMBERSHIP_DETAIL_RESULT, Action::MemDetailResult),
    (DEVICE_PREFIX, STATE_GET, Action::DeviceStateGet),
    (DEVICE_PREFIX, STATE_UPDATE, Action::DeviceStateUpdate),
    (DEVICE_PREFIX, DEVICE_UPDATED, Action::DeviceUpdated),
    (DEVICE_PREFIX, TWIN_UPDATE, Action::TwinUpdate),
    (DEVICE_PREFIX, TWIN_CLOUD_SYNC, Action::TwinCloudSync),
    (DEVICE_PREFIX, TWIN_GET, Action::TwinGet),
];

/// 分类入站消息；无法识别时返回 `None`。
pub fn classify(message: &Message) -> Option<(Action, String)> {
    match message.source() {
        BUS_SOURCE => classify_bus(message.resource()),
        EDGE_MANAGER_SOURCE | DEVICE_CONTROLLER_SOURCE => classify_cloud(message),
        EDGE_HUB_SOURCE if message.resource() == NODE_CONNECTION => {
            Some((Action::LifeCycle, String::new()))
        }
        META_MANAGER_SOURCE => classify_meta(message.resource()),
        _ => None,
    }
}

/// identity 取前缀与最长匹配后缀之间的部分，可含 `/`（如 `<namespace>/<name>`）。
fn classify_bus(resource: &str) -> Option<(Action, String)> {
    let topic = decode_resource(resource)?;
    if topic.split('/').count() == 4 {
        if topic.starts_with(CONNECTED_PREFIX) || topic.starts_with(DISCONNECTED_PREFIX) {
            return Some((Action::LifeCycle, String::new()));
        }
        return None;
    }
    EVENT_ACTIONS
        .iter()
        .filter_map(|(prefix, suffix, action)| {
            let identity = topic.strip_prefix(*prefix)?.strip_suffix(*suffix)?;
            (!identity.is_empty()).then_some((suffix.len(), *action, identity))
        })
        .max_by_key(|(suffix_len, _, _)| *suffix_len)
        .map(|(_, action, identity)| (action, identity.to_string()))
}

fn classify_cloud(message: &Message) -> Option<(Action, String)> {
    let resource = message.resource();
    if resource.contains("membership/detail") {
        return Some((Action::MemDetailResult, String::new()));
    }
    if resource.contains("membership") {
        return Some((Action::MemUpdated, String::new()));
    }
    if resource.contains("twin/cloud_updated") {
        let identity = resource.split('/').nth(1)?;
        return Some((Action::TwinCloudSync, identity.to_string()));
    }
    if message.operation().contains("updated") {
        return match resource.split('/').collect::<Vec<_>>().as_slice() {
            ["device", identity] if !identity.is_empty() => {
                Some((Action::DeviceUpdated, identity.to_string()))
            }
            _ => None,
        };
    }
    None
}

fn classify_meta(resource: &str) -> Option<(Action, String)> {
    match resource.split('/').collect::<Vec<_>>().as_slice() {
        [_, resource_type, name]
            if !name.is_empty()
                && (*resource_type == RESOURCE_TYPE_DEVICE
                    || *resource_type == RESOURCE_TYPE_DEVICE_MODEL) =>
        {
            Some((Action::MetaDeviceOperation, resource.to_string()))
        }
        _ => None,
    }
}

/// 分类并投递；无法识别的消息计数后丢弃。
pub async fn route(ctx: &TwinContext, message: Message) -> Result<(), EngineError> {
    let parent_id = message.parent_id().to_string();
    if !parent_id.is_empty() {
        let confirm = Message::new().with_parent(parent_id);
        ctx.comm_to(WorkerKind::Comm, DtMessage::new(Action::Confirm, "", confirm))
            .await?;
    }
    let Some((action, identity)) = classify(&message) else {
        twin_telemetry::record_message_dropped();
        warn!(
            target: "twin.router",
            source = %message.source(),
            resource = %message.resource(),
            operation = %message.operation(),
            "message_unclassified"
        );
        return Ok(());
    };
    debug!(
        target: "twin.router",
        action = %action,
        identity = %identity,
        message_id = %message.id(),
        "message_routed"
    );
    twin_telemetry::record_message_routed();
    ctx.comm_to(action.worker(), DtMessage::new(action, identity, message))
        .await
}
