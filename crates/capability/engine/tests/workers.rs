mod common;

use async_trait::async_trait;
use common::{NODE, context, device, drain, find, outbound, seed};
use domain::message::{
    BUS_SOURCE, CLOUD_CONNECTED, CLOUD_DISCONNECTED, EDGE_HUB_SOURCE, META_MANAGER_SOURCE,
    OP_DELETE, OP_INSERT, OP_PUBLISH, OP_UPDATE, RESOURCE_GROUP, TWIN_GROUP,
};
use domain::topic::{
    CLOUD_MEMBERSHIP_DETAIL, MEMBERSHIP_GET, MEMBERSHIP_GET_RESULT, NODE_CONNECTION, STATE_UPDATE_RESULT,
    TWIN_GET_RESULT, TWIN_UPDATE, TWIN_UPDATE_RESULT, device_topic, encode_resource, node_topic,
};
use domain::{Action, ConnectionState, Content, Message, WorkerKind, build_model_message};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use twin_bus::ChannelSink;
use twin_dmi::proto::{Device as DmiDevice, DeviceModel};
use twin_dmi::{DeviceMapper, DmiCache, DmiError};
use twin_engine::{
    CommWorker, DeviceWorker, DmiWorker, DtMessage, EngineError, MembershipWorker, Supervisor,
    SupervisorConfig, TwinContext, TwinWorker, Worker,
};
use twin_storage::{MetaColumn, MetaStore};

fn bus_request(topic: &str, body: serde_json::Value) -> Message {
    Message::new()
        .build_router(BUS_SOURCE, TWIN_GROUP, encode_resource(topic), OP_PUBLISH)
        .fill_body(Content::Json(body))
}

fn hub_event(event: &str) -> DtMessage {
    let message = Message::new()
        .build_router(EDGE_HUB_SOURCE, RESOURCE_GROUP, NODE_CONNECTION, "connect")
        .fill_body(Content::Text(event.to_string()));
    DtMessage::new(Action::LifeCycle, "", message)
}

fn cloud_report() -> DtMessage {
    let message = build_model_message(
        RESOURCE_GROUP,
        "",
        "device/d1/state/update",
        OP_UPDATE,
        Content::Text("{}".to_string()),
    );
    DtMessage::new(Action::SendToCloud, "", message)
}

struct CommHarness {
    ctx: Arc<TwinContext>,
    worker: CommWorker,
    hub_rx: mpsc::Receiver<Message>,
    bus_rx: mpsc::Receiver<Message>,
}

async fn comm() -> CommHarness {
    let (ctx, _store) = context().await;
    let (hub_tx, hub_rx) = mpsc::channel(16);
    let (bus_tx, bus_rx) = mpsc::channel(16);
    let worker = CommWorker::new(
        ctx.clone(),
        Arc::new(ChannelSink::new("edgehub", hub_tx)),
        Arc::new(ChannelSink::new("bus", bus_tx)),
    );
    CommHarness {
        ctx,
        worker,
        hub_rx,
        bus_rx,
    }
}

#[tokio::test]
async fn cloud_messages_are_dropped_while_disconnected() {
    let mut harness = comm().await;
    assert_eq!(harness.ctx.state(), ConnectionState::Disconnected);

    harness.worker.handle(cloud_report()).await.expect("handle");

    assert!(harness.hub_rx.try_recv().is_err());
    assert!(harness.ctx.pending_confirms().is_empty());
}

#[tokio::test]
async fn cloud_connect_requests_membership_detail_and_tracks_confirm() {
    let mut harness = comm().await;
    harness
        .worker
        .handle(hub_event(CLOUD_CONNECTED))
        .await
        .expect("connect");
    assert_eq!(harness.ctx.state(), ConnectionState::Connected);

    let request = harness.hub_rx.try_recv().expect("detail request");
    assert_eq!(request.resource(), CLOUD_MEMBERSHIP_DETAIL);
    assert_eq!(harness.ctx.pending_confirms().len(), 1);

    // 重复的 connected 事件不再请求
    harness
        .worker
        .handle(hub_event(CLOUD_CONNECTED))
        .await
        .expect("connect again");
    assert!(harness.hub_rx.try_recv().is_err());

    let ack = Message::new().with_parent(request.id());
    harness
        .worker
        .handle(DtMessage::new(Action::Confirm, "", ack))
        .await
        .expect("confirm");
    assert!(harness.ctx.pending_confirms().is_empty());
    let confirmed = harness.ctx.confirm_receiver();
    assert_eq!(
        confirmed.lock().await.try_recv().expect("confirm notified"),
        request.id()
    );

    harness
        .worker
        .handle(hub_event(CLOUD_DISCONNECTED))
        .await
        .expect("disconnect");
    assert_eq!(harness.ctx.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn unconfirmed_messages_are_resent_on_tick() {
    let mut harness = comm().await;
    harness.ctx.set_state(ConnectionState::Connected);
    harness.worker.handle(cloud_report()).await.expect("send");
    let first = harness.hub_rx.try_recv().expect("sent");

    harness.worker.on_tick().await.expect("tick");
    let resent = harness.hub_rx.try_recv().expect("resent");
    assert_eq!(resent.id(), first.id());

    harness.ctx.set_state(ConnectionState::Disconnected);
    harness.worker.on_tick().await.expect("tick");
    assert!(harness.hub_rx.try_recv().is_err());
}

#[tokio::test]
async fn edge_messages_go_to_bus_sink() {
    let mut harness = comm().await;
    harness
        .ctx
        .send_to_edge("$hw/events/device/d1/twin/delta", b"{}".to_vec())
        .await
        .expect("queue");
    let queued = drain(&harness.ctx, WorkerKind::Comm).await;
    for message in queued {
        harness.worker.handle(message).await.expect("handle");
    }
    let published = harness.bus_rx.try_recv().expect("published");
    assert_eq!(published.resource(), "$hw/events/device/d1/twin/delta");
    assert!(harness.hub_rx.try_recv().is_err());
}

#[tokio::test]
async fn twin_worker_answers_bad_requests() {
    let (ctx, _store) = context().await;
    seed(&ctx, &[device("d1", &[])]).await;
    let worker = TwinWorker::new(ctx.clone());

    let empty = bus_request(
        &device_topic("d1", TWIN_UPDATE),
        serde_json::json!({"event_id": "e1", "twin": {}}),
    );
    worker
        .handle(DtMessage::new(Action::TwinUpdate, "d1", empty))
        .await
        .expect("handled");

    let get = bus_request("unused", serde_json::json!({"event_id": "e2"}));
    worker
        .handle(DtMessage::new(Action::TwinGet, "ghost", get))
        .await
        .expect("handled");

    let sent = outbound(&drain(&ctx, WorkerKind::Comm).await);
    let rejected = find(&sent, &device_topic("d1", TWIN_UPDATE_RESULT)).expect("result");
    assert_eq!(rejected["code"], 400);
    assert_eq!(rejected["event_id"], "e1");
    let missing = find(&sent, &device_topic("ghost", TWIN_GET_RESULT)).expect("get result");
    assert_eq!(missing["code"], 404);
    assert_eq!(missing["event_id"], "e2");
}

#[tokio::test]
async fn device_and_membership_workers_reply_on_result_topics() {
    let (ctx, _store) = context().await;
    seed(&ctx, &[device("d2", &[]), device("d1", &[])]).await;

    let device_worker = DeviceWorker::new(ctx.clone());
    let malformed = Message::new()
        .build_router(BUS_SOURCE, TWIN_GROUP, "r", OP_PUBLISH)
        .fill_body(Content::Bytes(b"not-json".to_vec()));
    device_worker
        .handle(DtMessage::new(Action::DeviceStateUpdate, "d1", malformed))
        .await
        .expect("handled");

    let membership_worker = MembershipWorker::new(ctx.clone());
    let get = bus_request("unused", serde_json::json!({"event_id": "e3"}));
    membership_worker
        .handle(DtMessage::new(Action::MemGet, NODE, get))
        .await
        .expect("handled");

    let sent = outbound(&drain(&ctx, WorkerKind::Comm).await);
    let state = find(&sent, &device_topic("d1", STATE_UPDATE_RESULT)).expect("state result");
    assert_eq!(state["code"], 400);
    let members = find(&sent, &node_topic(NODE, MEMBERSHIP_GET_RESULT)).expect("membership");
    assert_eq!(members["event_id"], "e3");
    assert_eq!(members["devices"][0]["id"], "d1");
    assert_eq!(members["devices"][1]["id"], "d2");
}

/// 记录调用顺序的映射器。
#[derive(Default)]
struct RecordingMapper {
    calls: Mutex<Vec<String>>,
}

impl RecordingMapper {
    async fn record(&self, call: String) -> Result<(), DmiError> {
        self.calls.lock().await.push(call);
        Ok(())
    }
}

#[async_trait]
impl DeviceMapper for RecordingMapper {
    async fn register_device(&self, device: &DmiDevice) -> Result<(), DmiError> {
        self.record(format!("register_device:{}", device.name)).await
    }

    async fn remove_device(&self, device: &DmiDevice) -> Result<(), DmiError> {
        self.record(format!("remove_device:{}", device.name)).await
    }

    async fn update_device(&self, device: &DmiDevice) -> Result<(), DmiError> {
        self.record(format!("update_device:{}", device.name)).await
    }

    async fn create_device_model(&self, model: &DeviceModel) -> Result<(), DmiError> {
        self.record(format!("create_device_model:{}", model.name)).await
    }

    async fn remove_device_model(&self, model: &DeviceModel) -> Result<(), DmiError> {
        self.record(format!("remove_device_model:{}", model.name)).await
    }

    async fn update_device_model(&self, model: &DeviceModel) -> Result<(), DmiError> {
        self.record(format!("update_device_model:{}", model.name)).await
    }
}

fn meta(resource: &str, operation: &str, body: serde_json::Value) -> DtMessage {
    let message = Message::new()
        .build_router(META_MANAGER_SOURCE, "meta", resource, operation)
        .fill_body(Content::Json(body));
    DtMessage::new(Action::MetaDeviceOperation, resource, message)
}

#[tokio::test]
async fn dmi_worker_maintains_cache_meta_and_mapper() {
    let (ctx, store) = context().await;
    let cache = Arc::new(DmiCache::new());
    let mapper = Arc::new(RecordingMapper::default());
    let worker = DmiWorker::new(ctx.clone(), cache.clone(), mapper.clone());

    let orphan = meta(
        "default/device/sensor-1",
        OP_INSERT,
        serde_json::json!({"spec": {"device_model_reference": "thermo"}}),
    );
    worker.handle(orphan).await.expect_err("model not cached");

    worker
        .handle(meta(
            "default/devicemodel/thermo",
            OP_INSERT,
            serde_json::json!({"spec": {"protocol": "modbus"}}),
        ))
        .await
        .expect("model insert");
    worker
        .handle(meta(
            "default/device/sensor-1",
            OP_INSERT,
            serde_json::json!({
                "spec": {
                    "device_model_reference": "thermo",
                    "protocol": {"protocol_name": "modbus"}
                }
            }),
        ))
        .await
        .expect("device insert");

    let cached = cache.device("default/sensor-1").expect("cached device");
    assert_eq!(cached.namespace, "default");
    let rows = store
        .query_meta(MetaColumn::Type, "device")
        .await
        .expect("meta rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].key, format!("node/{NODE}/default/device/sensor-1"));

    worker
        .handle(meta("default/device/sensor-1", OP_DELETE, serde_json::json!({})))
        .await
        .expect("device delete");
    assert!(cache.device("default/sensor-1").is_none());
    assert!(
        store
            .query_meta(MetaColumn::Type, "device")
            .await
            .expect("meta rows")
            .is_empty()
    );

    let err = worker
        .handle(meta("default/pod/p1", OP_INSERT, serde_json::json!({})))
        .await
        .expect_err("unsupported type");
    assert!(matches!(err, EngineError::Dmi(DmiError::InvalidResource(_))));

    assert_eq!(
        *mapper.calls.lock().await,
        vec![
            "create_device_model:thermo".to_string(),
            "register_device:sensor-1".to_string(),
            "remove_device:sensor-1".to_string(),
        ]
    );
}

#[tokio::test]
async fn dmi_worker_tolerates_repeated_insert() {
    let (ctx, store) = context().await;
    let cache = Arc::new(DmiCache::new());
    let mapper = Arc::new(RecordingMapper::default());
    let worker = DmiWorker::new(ctx.clone(), cache.clone(), mapper.clone());
    let insert = || {
        meta(
            "default/devicemodel/thermo",
            OP_INSERT,
            serde_json::json!({"spec": {"protocol": "modbus"}}),
        )
    };

    worker.handle(insert()).await.expect("first insert");
    worker.handle(insert()).await.expect("repeated insert");

    let rows = store
        .query_meta(MetaColumn::Type, "devicemodel")
        .await
        .expect("meta rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].key, format!("node/{NODE}/default/devicemodel/thermo"));
    assert_eq!(mapper.calls.lock().await.len(), 2);

    worker
        .handle(meta(
            "default/devicemodel/thermo",
            OP_UPDATE,
            serde_json::json!({"spec": {"protocol": "opcua"}}),
        ))
        .await
        .expect("update");
    let rows = store
        .query_meta(MetaColumn::Type, "devicemodel")
        .await
        .expect("meta rows");
    assert_eq!(rows.len(), 1);
    assert!(rows[0].value.contains("opcua"));
}

/// 处理消息时卡住直到关停的 Worker。
struct StuckWorker {
    ctx: Arc<TwinContext>,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Worker for StuckWorker {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Twin
    }

    async fn handle(&self, _message: DtMessage) -> Result<(), EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.ctx.cancel_token().cancelled().await;
        Ok(())
    }
}

async fn wait_for_calls(calls: &AtomicUsize, expected: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while calls.load(Ordering::SeqCst) < expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("worker calls");
}

#[tokio::test]
async fn supervisor_restarts_silent_worker() {
    let (ctx, _store) = context().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let supervisor = Supervisor::new(
        ctx.clone(),
        SupervisorConfig {
            health_check_interval: Duration::from_millis(50),
            worker_timeout: Duration::from_millis(120),
        },
    )
    .with_worker(Arc::new(StuckWorker {
        ctx: ctx.clone(),
        calls: calls.clone(),
    }));

    let (inbound_tx, inbound_rx) = mpsc::channel(8);
    let running = tokio::spawn(supervisor.run(inbound_rx));
    let restarts_before = twin_telemetry::metrics().snapshot().worker_restarts;

    let request = || {
        bus_request(
            &device_topic("d1", TWIN_UPDATE),
            serde_json::json!({"event_id": "e1"}),
        )
    };
    inbound_tx.send(request()).await.expect("inbound");
    wait_for_calls(&calls, 1).await;

    // 第二条消息只能由重启后的实例取走
    inbound_tx.send(request()).await.expect("inbound");
    wait_for_calls(&calls, 2).await;
    assert!(twin_telemetry::metrics().snapshot().worker_restarts > restarts_before);

    ctx.cancel_token().cancel();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("supervisor stops")
        .expect("join")
        .expect("run");
}

/// 删除设备行后、更新内存前卡住的 Worker。
struct HalfDoneWorker {
    ctx: Arc<TwinContext>,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Worker for HalfDoneWorker {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Membership
    }

    async fn handle(&self, _message: DtMessage) -> Result<(), EngineError> {
        self.ctx
            .store()
            .delete_device_trans(&["A".to_string()])
            .await?;
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.ctx.cancel_token().cancelled().await;
        Ok(())
    }
}

#[tokio::test]
async fn supervisor_restart_resyncs_devices_from_store() {
    let (ctx, _store) = context().await;
    seed(&ctx, &[device("A", &[]), device("B", &[])]).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let supervisor = Supervisor::new(
        ctx.clone(),
        SupervisorConfig {
            health_check_interval: Duration::from_millis(50),
            worker_timeout: Duration::from_millis(120),
        },
    )
    .with_worker(Arc::new(HalfDoneWorker {
        ctx: ctx.clone(),
        calls: calls.clone(),
    }));

    let (inbound_tx, inbound_rx) = mpsc::channel(8);
    let running = tokio::spawn(supervisor.run(inbound_rx));
    inbound_tx
        .send(bus_request(
            &node_topic(NODE, MEMBERSHIP_GET),
            serde_json::json!({"event_id": "e1"}),
        ))
        .await
        .expect("inbound");
    wait_for_calls(&calls, 1).await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while ctx.is_device_exist("A") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("device map follows store");
    assert!(!ctx.has_mutex("A"));
    assert!(ctx.is_device_exist("B"));
    assert!(ctx.has_mutex("B"));

    ctx.cancel_token().cancel();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("supervisor stops")
        .expect("join")
        .expect("run");
}
