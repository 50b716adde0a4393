//! 孪生上下文：进程内共享状态。
//!
//! - 设备表、设备锁表、确认表、模块健康表（并发哈希表）
//! - 全局读写锁：单设备操作持读锁，成员全量刷新持写锁
//! - 各 Worker 的消息队列与心跳队列
//! - 云端连接状态
//!
//! 加锁顺序固定为「全局读锁 → 设备锁」，不会同时持有两把设备锁。

use crate::error::EngineError;
use crate::retry::RetryPolicy;
use dashmap::DashMap;
use domain::message::{BUS_GROUP, OP_PUBLISH, OP_UPDATE, RESOURCE_GROUP};
use domain::{
    Action, ConnectionState, Content, DeviceSnapshot, Message, WorkerKind, build_model_message,
    now_ms,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{
    Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use twin_storage::TwinStore;

pub const QUEUE_CAPACITY: usize = 128;
pub const HEARTBEAT_CAPACITY: usize = 128;
pub const CONFIRM_CAPACITY: usize = 1000;

/// 路由后投递给 Worker 的消息。
#[derive(Debug, Clone)]
pub struct DtMessage {
    pub action: Action,
    pub identity: String,
    pub msg: Message,
}

impl DtMessage {
    pub fn new(action: Action, identity: impl Into<String>, msg: Message) -> Self {
        Self {
            action,
            identity: identity.into(),
            msg,
        }
    }
}

/// 心跳信号。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heartbeat {
    Ping,
    Stop,
}

/// 单设备锁；先释放设备锁，再释放全局读锁。
pub struct DeviceGuard {
    _device: OwnedMutexGuard<()>,
    _global: OwnedRwLockReadGuard<()>,
}

type Shared<T> = Arc<Mutex<mpsc::Receiver<T>>>;

struct WorkerChannels {
    queue: mpsc::Sender<DtMessage>,
    queue_rx: Shared<DtMessage>,
    heartbeat: mpsc::Sender<Heartbeat>,
    heartbeat_rx: Shared<Heartbeat>,
}

impl WorkerChannels {
    fn new() -> Self {
        let (queue, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (heartbeat, heartbeat_rx) = mpsc::channel(HEARTBEAT_CAPACITY);
        Self {
            queue,
            queue_rx: Arc::new(Mutex::new(queue_rx)),
            heartbeat,
            heartbeat_rx: Arc::new(Mutex::new(heartbeat_rx)),
        }
    }
}

pub struct TwinContext {
    node_name: String,
    store: Arc<dyn TwinStore>,
    retry: RetryPolicy,
    cancel: CancellationToken,
    device_list: DashMap<String, DeviceSnapshot>,
    device_mutex: DashMap<String, Arc<Mutex<()>>>,
    global: Arc<RwLock<()>>,
    confirm_map: DashMap<String, DtMessage>,
    module_health: DashMap<WorkerKind, i64>,
    channels: HashMap<WorkerKind, WorkerChannels>,
    confirm_tx: mpsc::Sender<String>,
    confirm_rx: Shared<String>,
    connected: AtomicBool,
}

impl TwinContext {
    pub fn new(
        node_name: impl Into<String>,
        store: Arc<dyn TwinStore>,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        let channels = WorkerKind::ALL
            .into_iter()
            .map(|kind| (kind, WorkerChannels::new()))
            .collect();
        let (confirm_tx, confirm_rx) = mpsc::channel(CONFIRM_CAPACITY);
        Self {
            node_name: node_name.into(),
            store,
            retry,
            cancel,
            device_list: DashMap::new(),
            device_mutex: DashMap::new(),
            global: Arc::new(RwLock::new(())),
            confirm_map: DashMap::new(),
            module_health: DashMap::new(),
            channels,
            confirm_tx,
            confirm_rx: Arc::new(Mutex::new(confirm_rx)),
            connected: AtomicBool::new(false),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn store(&self) -> &Arc<dyn TwinStore> {
        &self.store
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn channels(&self, kind: WorkerKind) -> &WorkerChannels {
        // channels 覆盖 WorkerKind::ALL
        &self.channels[&kind]
    }

    /// 投递到 Worker 队列；队列满时等待。
    pub async fn comm_to(&self, kind: WorkerKind, message: DtMessage) -> Result<(), EngineError> {
        debug!(
            target: "twin.context",
            worker = %kind,
            action = %message.action,
            identity = %message.identity,
            "worker_message_queued"
        );
        self.channels(kind)
            .queue
            .send(message)
            .await
            .map_err(|_| EngineError::QueueClosed(kind))
    }

    pub fn receiver(&self, kind: WorkerKind) -> Shared<DtMessage> {
        self.channels(kind).queue_rx.clone()
    }

    pub fn heartbeat_receiver(&self, kind: WorkerKind) -> Shared<Heartbeat> {
        self.channels(kind).heartbeat_rx.clone()
    }

    /// 向 Worker 发送心跳；队列满时丢弃。
    pub fn send_heartbeat(&self, kind: WorkerKind, beat: Heartbeat) {
        if let Err(err) = self.channels(kind).heartbeat.try_send(beat) {
            warn!(target: "twin.context", worker = %kind, error = %err, "heartbeat_send_failed");
        }
    }

    /// Worker 处理心跳：`Ping` 刷新健康时间，`Stop` 返回错误以结束循环。
    pub fn heartbeat(&self, kind: WorkerKind, beat: Heartbeat) -> Result<(), EngineError> {
        match beat {
            Heartbeat::Ping => {
                self.touch(kind);
                Ok(())
            }
            Heartbeat::Stop => Err(EngineError::Stopped),
        }
    }

    pub fn touch(&self, kind: WorkerKind) {
        self.module_health.insert(kind, now_ms());
    }

    /// 最近一次心跳（毫秒时间戳）。
    pub fn last_heartbeat(&self, kind: WorkerKind) -> Option<i64> {
        self.module_health.get(&kind).map(|entry| *entry.value())
    }

    /// 单设备加锁；设备锁不存在时返回 `None`。
    pub async fn lock(&self, device_id: &str) -> Option<DeviceGuard> {
        let global = self.global.clone().read_owned().await;
        let mutex = self
            .device_mutex
            .get(device_id)
            .map(|entry| entry.value().clone())?;
        let device = mutex.lock_owned().await;
        Some(DeviceGuard {
            _device: device,
            _global: global,
        })
    }

    /// 全局写锁：阻塞所有单设备加锁。
    pub async fn lock_all(&self) -> OwnedRwLockWriteGuard<()> {
        self.global.clone().write_owned().await
    }

    pub fn ensure_mutex(&self, device_id: &str) {
        self.device_mutex
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())));
    }

    pub fn has_mutex(&self, device_id: &str) -> bool {
        self.device_mutex.contains_key(device_id)
    }

    pub fn is_device_exist(&self, device_id: &str) -> bool {
        self.device_list.contains_key(device_id)
    }

    pub fn get_device(&self, device_id: &str) -> Option<DeviceSnapshot> {
        self.device_list
            .get(device_id)
            .map(|entry| entry.value().clone())
    }

    /// 在设备锁内读取快照，不会读到尚未提交的设备。
    pub async fn read_device(&self, device_id: &str) -> Option<DeviceSnapshot> {
        let _guard = self.lock(device_id).await?;
        self.get_device(device_id)
    }

    pub fn put_device(&self, device: DeviceSnapshot) {
        self.ensure_mutex(&device.id);
        self.device_list.insert(device.id.clone(), device);
    }

    /// 移除设备及其设备锁。
    pub fn remove_device(&self, device_id: &str) -> Option<DeviceSnapshot> {
        self.device_mutex.remove(device_id);
        self.device_list
            .remove(device_id)
            .map(|(_, device)| device)
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.device_list
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn devices(&self) -> Vec<DeviceSnapshot> {
        self.device_list
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn state(&self) -> ConnectionState {
        if self.connected.load(Ordering::SeqCst) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.connected
            .store(state == ConnectionState::Connected, Ordering::SeqCst);
    }

    pub fn add_confirm(&self, message: DtMessage) {
        self.confirm_map.insert(message.msg.id().to_string(), message);
    }

    pub fn remove_confirm(&self, message_id: &str) -> bool {
        self.confirm_map.remove(message_id).is_some()
    }

    pub fn pending_confirms(&self) -> Vec<DtMessage> {
        self.confirm_map
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// 通知确认通道；满时丢弃。
    pub fn notify_confirm(&self, message_id: &str) {
        if self.confirm_tx.try_send(message_id.to_string()).is_err() {
            debug!(target: "twin.context", message_id = %message_id, "confirm_channel_full");
        }
    }

    pub fn confirm_receiver(&self) -> Shared<String> {
        self.confirm_rx.clone()
    }

    /// 经 Comm Worker 发布到本地总线。
    pub async fn send_to_edge(&self, topic: &str, payload: Vec<u8>) -> Result<(), EngineError> {
        let message = build_model_message(BUS_GROUP, "", topic, OP_PUBLISH, Content::Bytes(payload));
        self.comm_to(
            WorkerKind::Comm,
            DtMessage::new(Action::SendToEdge, "", message),
        )
        .await
    }

    /// 经 Comm Worker 发往云端。
    pub async fn send_to_cloud(
        &self,
        resource: &str,
        content: Content,
    ) -> Result<(), EngineError> {
        let message = build_model_message(RESOURCE_GROUP, "", resource, OP_UPDATE, content);
        self.comm_to(
            WorkerKind::Comm,
            DtMessage::new(Action::SendToCloud, "", message),
        )
        .await
    }
}
