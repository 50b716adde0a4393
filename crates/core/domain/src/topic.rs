//! 本地总线主题与云端资源约定。

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;

pub const DEVICE_PREFIX: &str = "$hw/events/device/";
pub const NODE_PREFIX: &str = "$hw/events/node/";
pub const CONNECTED_PREFIX: &str = "$hw/events/connected/";
pub const DISCONNECTED_PREFIX: &str = "$hw/events/disconnected/";
/// 本地总线订阅过滤器：只含入站请求主题，不与本进程发布的任何主题重叠。
///
/// `+/+` 变体承载 `<namespace>/<name>` 形式的设备标识。
pub const SUBSCRIBE_FILTERS: [&str; 14] = [
    "$hw/events/device/+/twin/update",
    "$hw/events/device/+/twin/get",
    "$hw/events/device/+/twin/cloud_updated",
    "$hw/events/device/+/state/update",
    "$hw/events/device/+/state/get",
    "$hw/events/device/+/+/twin/update",
    "$hw/events/device/+/+/twin/get",
    "$hw/events/device/+/+/twin/cloud_updated",
    "$hw/events/device/+/+/state/update",
    "$hw/events/device/+/+/state/get",
    "$hw/events/node/+/membership/get",
    "$hw/events/node/+/membership/detail/result",
    "$hw/events/connected/+",
    "$hw/events/disconnected/+",
];

pub const TWIN_UPDATE: &str = "/twin/update";
pub const TWIN_UPDATE_RESULT: &str = "/twin/update/result";
pub const TWIN_DELTA: &str = "/twin/update/delta";
pub const TWIN_DOCUMENT: &str = "/twin/update/document";
pub const TWIN_GET: &str = "/twin/get";
pub const TWIN_GET_RESULT: &str = "/twin/get/result";
pub const TWIN_CLOUD_SYNC: &str = "/twin/cloud_updated";
pub const DEVICE_UPDATED: &str = "/updated";
pub const STATE_UPDATE: &str = "/state/update";
pub const STATE_UPDATE_RESULT: &str = "/state/update/result";
pub const STATE_GET: &str = "/state/get";
pub const STATE_GET_RESULT: &str = "/state/get/result";
pub const MEMBERSHIP_GET: &str = "/membership/get";
pub const MEMBERSHIP_GET_RESULT: &str = "/membership/get/result";
pub const MEMBERSHIP_UPDATED: &str = "/membership/updated";
pub const MEMBERSHIP_DETAIL_RESULT: &str = "/membership/detail/result";

/// 云端资源：成员关系全量请求。
pub const CLOUD_MEMBERSHIP_DETAIL: &str = "membership/detail";
/// edgehub 连接事件资源。
pub const NODE_CONNECTION: &str = "node/connection";

pub fn device_topic(device_id: &str, suffix: &str) -> String {
    format!("{DEVICE_PREFIX}{device_id}{suffix}")
}

pub fn node_topic(node_name: &str, suffix: &str) -> String {
    format!("{NODE_PREFIX}{node_name}{suffix}")
}

pub fn cloud_edge_updated(device_id: &str) -> String {
    format!("device/{device_id}/twin/edge_updated")
}

pub fn cloud_state_update(device_id: &str) -> String {
    format!("device/{device_id}/state/update")
}

/// MQTT 过滤器匹配：`+` 匹配单层，`#` 匹配其后全部层级。
pub fn filter_matches(filter: &str, topic: &str) -> bool {
    let mut levels = topic.split('/');
    for pattern in filter.split('/') {
        match (pattern, levels.next()) {
            ("#", _) => return true,
            (_, None) => return false,
            ("+", Some(_)) => {}
            (pattern, Some(level)) if pattern == level => {}
            _ => return false,
        }
    }
    levels.next().is_none()
}

/// 是否为桥接应接收的入站主题。
pub fn is_inbound_topic(topic: &str) -> bool {
    SUBSCRIBE_FILTERS
        .iter()
        .any(|filter| filter_matches(filter, topic))
}

/// 总线 resource 字段：topic 的 URL-safe base64。
pub fn encode_resource(topic: &str) -> String {
    URL_SAFE.encode(topic.as_bytes())
}

pub fn decode_resource(resource: &str) -> Option<String> {
    let bytes = URL_SAFE.decode(resource.as_bytes()).ok()?;
    String::from_utf8(bytes).ok()
}
