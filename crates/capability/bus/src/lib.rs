//! 模块消息出口与本地总线桥接。
//!
//! - [`ModuleSink`]：外部模块（edgehub 上云通道、本地事件总线）的统一出口
//! - [`ChannelSink`] / [`LogSink`]：进程内通道与仅记录日志的出口
//! - [`mqtt`]：本地 MQTT broker 桥接（入站请求订阅 + 出站发布）

pub mod mqtt;

use async_trait::async_trait;
use domain::Message;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

pub use mqtt::{
    Forward, MqttBridgeConfig, MqttPublisher, bus_message, connect_bridge, forward_inbound,
    inbound_message,
};

/// 总线错误。
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("channel closed: {0}")]
    Closed(String),
    #[error("publish error: {0}")]
    Publish(String),
    #[error("subscribe error: {0}")]
    Subscribe(String),
    #[error("payload error: {0}")]
    Payload(String),
}

/// 外部模块出口。
#[async_trait]
pub trait ModuleSink: Send + Sync {
    async fn send(&self, message: Message) -> Result<(), BusError>;
}

/// 写入进程内通道（测试与进程内模块）。
#[derive(Debug, Clone)]
pub struct ChannelSink {
    name: &'static str,
    tx: mpsc::Sender<Message>,
}

impl ChannelSink {
    pub fn new(name: &'static str, tx: mpsc::Sender<Message>) -> Self {
        Self { name, tx }
    }
}

#[async_trait]
impl ModuleSink for ChannelSink {
    async fn send(&self, message: Message) -> Result<(), BusError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| BusError::Closed(self.name.to_string()))
    }
}

/// 仅记录日志的出口（无对端模块时使用）。
#[derive(Debug, Clone)]
pub struct LogSink {
    name: &'static str,
}

impl LogSink {
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }
}

#[async_trait]
impl ModuleSink for LogSink {
    async fn send(&self, message: Message) -> Result<(), BusError> {
        let size = message.content.to_bytes().map(|bytes| bytes.len()).unwrap_or(0);
        info!(
            target: "twin.bus",
            sink = self.name,
            message_id = %message.id(),
            resource = %message.resource(),
            operation = %message.operation(),
            payload_size = size,
            "module_message_sent"
        );
        Ok(())
    }
}

/// 带固定退避的发送重试；`max_retries` 不含首次尝试。
pub async fn send_with_retry(
    sink: Arc<dyn ModuleSink>,
    message: &Message,
    max_retries: u64,
    backoff_ms: u64,
) -> Result<(), BusError> {
    let mut attempt = 0u64;
    loop {
        match sink.send(message.clone()).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                attempt += 1;
                if attempt > max_retries {
                    return Err(err);
                }
                if backoff_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                }
            }
        }
    }
}
