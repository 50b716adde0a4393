//! 本地 MQTT broker 桥接。
//!
//! 入站：只订阅入站请求主题（[`SUBSCRIBE_FILTERS`]），本进程发布的结果、增量、
//! 成员变更等主题不会回流。每条 publish 包装为
//! `Message{source: bus, group: twin, resource: base64url(topic), operation: publish}`
//! 投递到进程消息总线；入站队列满时丢弃并计数，事件循环不阻塞。
//! 出站：`SendToEdge` 消息的 resource 即 topic，内容按字节发布，失败按固定退避重试。

use crate::{BusError, ModuleSink};
use async_trait::async_trait;
use domain::message::{BUS_SOURCE, OP_PUBLISH, TWIN_GROUP};
use domain::topic::{SUBSCRIBE_FILTERS, encode_resource, is_inbound_topic};
use domain::{Content, Message};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, SubscribeFilter};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// MQTT 桥接配置。
#[derive(Debug, Clone)]
pub struct MqttBridgeConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub qos: u8,
    pub publish_max_retries: u64,
    pub publish_backoff_ms: u64,
}

/// 出站发布器。
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
    qos: QoS,
    max_retries: u64,
    backoff_ms: u64,
}

impl MqttPublisher {
    async fn publish_once(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.client
            .publish(topic, self.qos, false, payload)
            .await
            .map_err(|err| BusError::Publish(err.to_string()))
    }
}

#[async_trait]
impl ModuleSink for MqttPublisher {
    async fn send(&self, message: Message) -> Result<(), BusError> {
        let topic = message.resource().to_string();
        let payload = message
            .content
            .to_bytes()
            .map_err(|err| BusError::Payload(err.to_string()))?;
        debug!(
            target: "twin.bus",
            topic = %topic,
            payload_size = payload.len(),
            "bus_publish"
        );
        let mut attempt = 0u64;
        loop {
            match self.publish_once(&topic, payload.clone()).await {
                Ok(()) => {
                    twin_telemetry::record_publish_success();
                    return Ok(());
                }
                Err(err) => {
                    attempt += 1;
                    if attempt > self.max_retries {
                        twin_telemetry::record_publish_failure();
                        warn!(target: "twin.bus", topic = %topic, error = %err, "bus_publish_failed");
                        return Err(err);
                    }
                    if self.backoff_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(self.backoff_ms)).await;
                    }
                }
            }
        }
    }
}

/// 入站 publish 转为总线消息。
pub fn bus_message(topic: &str, payload: &[u8]) -> Message {
    Message::new()
        .build_router(BUS_SOURCE, TWIN_GROUP, encode_resource(topic), OP_PUBLISH)
        .fill_body(Content::Bytes(payload.to_vec()))
}

/// 只接受入站请求主题；其余主题（包括本进程发布的回显）返回 `None`。
pub fn inbound_message(topic: &str, payload: &[u8]) -> Option<Message> {
    is_inbound_topic(topic).then(|| bus_message(topic, payload))
}

/// 入站转发结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forward {
    Delivered,
    Dropped,
    Closed,
}

/// 非阻塞转发：队列满时丢弃，避免事件循环停止处理出站请求。
pub fn forward_inbound(inbound: &mpsc::Sender<Message>, message: Message) -> Forward {
    match inbound.try_send(message) {
        Ok(()) => Forward::Delivered,
        Err(TrySendError::Full(message)) => {
            twin_telemetry::record_bus_inbound_dropped();
            warn!(
                target: "twin.bus",
                message_id = %message.id(),
                "bus_inbound_full"
            );
            Forward::Dropped
        }
        Err(TrySendError::Closed(_)) => Forward::Closed,
    }
}

fn subscribe_filters(qos: QoS) -> Vec<SubscribeFilter> {
    SUBSCRIBE_FILTERS
        .iter()
        .map(|filter| SubscribeFilter::new(filter.to_string(), qos))
        .collect()
}

/// 建立 broker 连接：返回出站发布器与事件循环任务。
///
/// 事件循环在每次 ConnAck 后重新订阅，取消令牌触发时退出。
pub fn connect_bridge(
    config: MqttBridgeConfig,
    inbound: mpsc::Sender<Message>,
    cancel: CancellationToken,
) -> (MqttPublisher, tokio::task::JoinHandle<()>) {
    let client_id = format!("twin-edge-{}", uuid::Uuid::new_v4());
    let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
    options.set_keep_alive(Duration::from_secs(30));
    if let (Some(username), Some(password)) = (config.username.clone(), config.password.clone())
    {
        options.set_credentials(username, password);
    }
    let (client, mut eventloop) = AsyncClient::new(options, 10);
    let qos = qos_from_u8(config.qos);
    let subscriber = client.clone();

    let handle = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    info!(target: "twin.bus", "bus_bridge_stopped");
                    return;
                }
                event = eventloop.poll() => event,
            };
            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    if let Err(err) = subscriber.try_subscribe_many(subscribe_filters(qos)) {
                        warn!(target: "twin.bus", error = %err, "bus_subscribe_failed");
                    } else {
                        info!(target: "twin.bus", filters = SUBSCRIBE_FILTERS.len(), "bus_subscribed");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let Some(message) = inbound_message(&publish.topic, &publish.payload) else {
                        debug!(target: "twin.bus", topic = %publish.topic, "bus_topic_ignored");
                        continue;
                    };
                    if forward_inbound(&inbound, message) == Forward::Closed {
                        warn!(target: "twin.bus", "bus_inbound_closed");
                        return;
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(target: "twin.bus", error = %err, "bus_eventloop_error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    (
        MqttPublisher {
            client,
            qos,
            max_retries: config.publish_max_retries,
            backoff_ms: config.publish_backoff_ms,
        },
        handle,
    )
}

fn qos_from_u8(value: u8) -> QoS {
    match value {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}
