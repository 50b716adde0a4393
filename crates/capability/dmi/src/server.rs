//! DMI 服务端：映射器注册、设备孪生上报、设备状态上报。
//!
//! - 监听 UDS；启动前删除残留的套接字文件
//! - 全部接口共享一个令牌桶，超额请求直接拒绝
//! - 上报转换为总线消息后写入进程消息总线，由路由器分发

use crate::cache::{DmiCache, RESOURCE_TYPE_DEVICE_MAPPER, meta_key, resource_id};
use crate::client::DmiClients;
use crate::error::DmiError;
use crate::proto::device_manager_service_server::{
    DeviceManagerService, DeviceManagerServiceServer,
};
use crate::proto::{
    MapperRegisterRequest, MapperRegisterResponse, ReportDeviceStatesRequest,
    ReportDeviceStatesResponse, ReportDeviceStatusRequest, ReportDeviceStatusResponse, Twin,
};
use domain::message::{BUS_SOURCE, OP_RESPONSE, USER_GROUP};
use domain::payload::{BaseMessage, DeviceStateReport, DeviceTwinUpdate};
use domain::topic::{STATE_UPDATE, TWIN_UPDATE, device_topic, encode_resource};
use domain::{Content, Message, MsgTwin, TwinValue, TypeMetadata, now_ms};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, warn};
use twin_storage::{MetaRow, MetaStore};

/// 上报中携带属性类型的元数据键。
pub const PROPERTY_TYPE: &str = "type";

/// 令牌桶：`capacity` 个令牌，每 `refill` 补充一个。
pub fn rate_limiter(capacity: u32, refill: Duration) -> DefaultDirectRateLimiter {
    let burst = NonZeroU32::new(capacity).unwrap_or(NonZeroU32::MIN);
    let quota = Quota::with_period(refill)
        .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
        .allow_burst(burst);
    RateLimiter::direct(quota)
}

pub struct DeviceManager {
    node_name: String,
    cache: Arc<DmiCache>,
    clients: Arc<DmiClients>,
    store: Arc<dyn MetaStore>,
    inbound: mpsc::Sender<Message>,
    limiter: DefaultDirectRateLimiter,
}

impl DeviceManager {
    pub fn new(
        node_name: impl Into<String>,
        cache: Arc<DmiCache>,
        clients: Arc<DmiClients>,
        store: Arc<dyn MetaStore>,
        inbound: mpsc::Sender<Message>,
        limiter: DefaultDirectRateLimiter,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            cache,
            clients,
            store,
            inbound,
            limiter,
        }
    }

    fn check_rate(&self, call: &str, name: &str) -> Result<(), Status> {
        if self.limiter.check().is_ok() {
            return Ok(());
        }
        twin_telemetry::record_dmi_rate_limited();
        warn!(target: "twin.dmi", call = %call, name = %name, "dmi_rate_limited");
        Err(Status::resource_exhausted(format!(
            "fail to {call} because of too many request: {name}"
        )))
    }

    async fn publish(&self, topic: &str, body: String) -> Result<(), Status> {
        let message = Message::new()
            .build_router(BUS_SOURCE, USER_GROUP, encode_resource(topic), OP_RESPONSE)
            .fill_body(Content::Text(body));
        self.inbound
            .send(message)
            .await
            .map_err(|_| Status::unavailable("message bus closed"))
    }
}

/// 单个属性上报 → 孪生更新载荷。
fn twin_update_body(twin: &Twin, timestamp: i64) -> Result<String, serde_json::Error> {
    let mut msg_twin = MsgTwin::default();
    if let Some(reported) = twin.reported.as_ref() {
        msg_twin.actual = Some(TwinValue::new(reported.value.clone(), timestamp));
        if let Some(value_type) = reported.metadata.get(PROPERTY_TYPE) {
            msg_twin.metadata = Some(TypeMetadata::of_type(value_type.clone()));
        }
    }
    if let Some(desired) = twin
        .observed_desired
        .as_ref()
        .filter(|desired| !desired.value.is_empty())
    {
        msg_twin.expected = Some(TwinValue::new(desired.value.clone(), timestamp));
    }
    let mut twins = BTreeMap::new();
    twins.insert(twin.property_name.clone(), Some(msg_twin));
    serde_json::to_string(&DeviceTwinUpdate {
        base: BaseMessage {
            event_id: String::new(),
            timestamp,
        },
        twin: Some(twins),
    })
}

#[tonic::async_trait]
impl DeviceManagerService for DeviceManager {
    async fn mapper_register(
        &self,
        request: Request<MapperRegisterRequest>,
    ) -> Result<Response<MapperRegisterResponse>, Status> {
        let request = request.into_inner();
        let name = request
            .mapper
            .as_ref()
            .map(|mapper| mapper.name.as_str())
            .unwrap_or_default();
        self.check_rate("register mapper", name)?;
        let mapper = request.mapper.ok_or_else(|| {
            Status::invalid_argument("fail to register mapper because the mapper info is nil")
        })?;
        if mapper.protocol.is_empty() {
            error!(target: "twin.dmi", mapper = %mapper.name, "mapper_protocol_missing");
            return Err(Status::invalid_argument(format!(
                "fail to register mapper {} because the protocol is nil",
                mapper.name
            )));
        }

        let value = serde_json::to_string(&mapper)
            .map_err(|err| Status::internal(format!("marshal mapper info failed: {err}")))?;
        let row = MetaRow {
            key: meta_key(&self.node_name, "", RESOURCE_TYPE_DEVICE_MAPPER, &mapper.name),
            meta_type: RESOURCE_TYPE_DEVICE_MAPPER.to_string(),
            value,
        };
        if let Err(err) = self.store.insert_or_update_meta(&row).await {
            error!(target: "twin.dmi", mapper = %mapper.name, error = %err, "mapper_save_failed");
            return Err(Status::internal(format!(
                "fail to save mapper {} to db: {err}",
                mapper.name
            )));
        }

        let protocol = mapper.protocol.clone();
        let sock_path = String::from_utf8_lossy(&mapper.address).into_owned();
        self.cache.upsert_mapper(mapper.clone());
        self.clients.create_client(&protocol, &sock_path);
        info!(target: "twin.dmi", mapper = %mapper.name, protocol = %protocol, "mapper_registered");

        if !request.with_data {
            return Ok(Response::new(MapperRegisterResponse::default()));
        }
        let (device_list, model_list) = self.cache.protocol_data(&protocol);
        Ok(Response::new(MapperRegisterResponse {
            model_list,
            device_list,
        }))
    }

    async fn report_device_status(
        &self,
        request: Request<ReportDeviceStatusRequest>,
    ) -> Result<Response<ReportDeviceStatusResponse>, Status> {
        let request = request.into_inner();
        self.check_rate("report device status", &request.device_name)?;
        let twins = request
            .reported_device
            .map(|status| status.twins)
            .unwrap_or_default();
        if twins.is_empty() {
            return Err(Status::invalid_argument(format!(
                "fail to report device status of {} because twins are missing",
                request.device_name
            )));
        }

        let device_id = resource_id(&request.device_namespace, &request.device_name);
        let topic = device_topic(&device_id, TWIN_UPDATE);
        let timestamp = now_ms();
        for twin in &twins {
            let body = twin_update_body(twin, timestamp).map_err(|err| {
                Status::internal(format!(
                    "fail to create message data for property {}: {err}",
                    twin.property_name
                ))
            })?;
            self.publish(&topic, body).await?;
        }
        debug!(target: "twin.dmi", device_id = %device_id, twins = twins.len(), "device_status_reported");
        Ok(Response::new(ReportDeviceStatusResponse::default()))
    }

    async fn report_device_states(
        &self,
        request: Request<ReportDeviceStatesRequest>,
    ) -> Result<Response<ReportDeviceStatesResponse>, Status> {
        let request = request.into_inner();
        self.check_rate("report device states", &request.device_name)?;
        if request.device_name.is_empty() || request.state.is_empty() {
            return Err(Status::invalid_argument(
                "fail to report device states because device name or state is empty",
            ));
        }

        let device_id = resource_id(&request.device_namespace, &request.device_name);
        let body = serde_json::to_string(&DeviceStateReport {
            timestamp: now_ms(),
            state: request.state.clone(),
        })
        .map_err(|err| Status::internal(err.to_string()))?;
        self.publish(&device_topic(&device_id, STATE_UPDATE), body)
            .await?;
        debug!(target: "twin.dmi", device_id = %device_id, state = %request.state, "device_state_reported");
        Ok(Response::new(ReportDeviceStatesResponse::default()))
    }
}

/// 删除残留套接字；路径无法检查时返回错误。
pub fn init_sock(path: &Path) -> Result<(), DmiError> {
    match std::fs::metadata(path) {
        Ok(_) => {
            std::fs::remove_file(path)?;
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// 在 UDS 上提供 DeviceManagerService，取消令牌触发后优雅退出。
pub async fn serve(
    sock_path: &Path,
    manager: DeviceManager,
    cancel: CancellationToken,
) -> Result<(), DmiError> {
    init_sock(sock_path)?;
    let listener = UnixListener::bind(sock_path)?;
    info!(target: "twin.dmi", sock_path = %sock_path.display(), "dmi_server_started");
    Server::builder()
        .add_service(DeviceManagerServiceServer::new(manager))
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), cancel.cancelled())
        .await?;
    info!(target: "twin.dmi", "dmi_server_stopped");
    Ok(())
}
