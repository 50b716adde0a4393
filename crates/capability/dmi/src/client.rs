//! 出站 DMI 客户端：按协议找到映射器的 UDS 路径，每次调用临时拨号。

use crate::cache::{device_protocol, model_protocol};
use crate::error::DmiError;
use crate::proto::device_mapper_service_client::DeviceMapperServiceClient;
use crate::proto::{
    CreateDeviceModelRequest, Device, DeviceModel, RegisterDeviceRequest, RemoveDeviceModelRequest,
    RemoveDeviceRequest, UpdateDeviceModelRequest, UpdateDeviceRequest,
};
use async_trait::async_trait;
use dashmap::DashMap;
use hyper_util::rt::TokioIo;
use std::time::Duration;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::{debug, info};

/// 单次调用（含拨号）超时。
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// 映射器侧设备 / 模型操作。
#[async_trait]
pub trait DeviceMapper: Send + Sync {
    async fn register_device(&self, device: &Device) -> Result<(), DmiError>;
    async fn remove_device(&self, device: &Device) -> Result<(), DmiError>;
    async fn update_device(&self, device: &Device) -> Result<(), DmiError>;
    async fn create_device_model(&self, model: &DeviceModel) -> Result<(), DmiError>;
    async fn remove_device_model(&self, model: &DeviceModel) -> Result<(), DmiError>;
    async fn update_device_model(&self, model: &DeviceModel) -> Result<(), DmiError>;
}

/// 协议 → 映射器 UDS 路径。
#[derive(Debug)]
pub struct DmiClients {
    sock_paths: DashMap<String, String>,
    timeout: Duration,
}

impl Default for DmiClients {
    fn default() -> Self {
        Self::new()
    }
}

impl DmiClients {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_CALL_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            sock_paths: DashMap::new(),
            timeout,
        }
    }

    /// 新建或改写协议对应的套接字路径。
    pub fn create_client(&self, protocol: &str, sock_path: &str) {
        info!(target: "twin.dmi", protocol = %protocol, sock_path = %sock_path, "dmi_client_upserted");
        self.sock_paths
            .insert(protocol.to_string(), sock_path.to_string());
    }

    pub fn sock_path(&self, protocol: &str) -> Option<String> {
        self.sock_paths
            .get(protocol)
            .map(|entry| entry.value().clone())
    }

    async fn connect(
        &self,
        protocol: Option<&str>,
    ) -> Result<DeviceMapperServiceClient<Channel>, DmiError> {
        let protocol = protocol.unwrap_or_default();
        let path = self
            .sock_path(protocol)
            .ok_or_else(|| DmiError::NoClient(protocol.to_string()))?;
        debug!(target: "twin.dmi", protocol = %protocol, sock_path = %path, "dmi_client_dial");
        let channel = uds_channel(path, self.timeout).await?;
        Ok(DeviceMapperServiceClient::new(channel))
    }
}

/// 拨号 UDS，返回 gRPC 通道；authority 仅占位。
pub async fn uds_channel(path: String, timeout: Duration) -> Result<Channel, DmiError> {
    let channel = Endpoint::from_static("http://[::]:50051")
        .connect_timeout(timeout)
        .timeout(timeout)
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = path.clone();
            async move {
                let stream = UnixStream::connect(path).await?;
                Ok::<_, std::io::Error>(TokioIo::new(stream))
            }
        }))
        .await?;
    Ok(channel)
}

#[async_trait]
impl DeviceMapper for DmiClients {
    async fn register_device(&self, device: &Device) -> Result<(), DmiError> {
        let mut client = self.connect(device_protocol(device)).await?;
        client
            .register_device(RegisterDeviceRequest {
                device: Some(device.clone()),
            })
            .await?;
        Ok(())
    }

    async fn remove_device(&self, device: &Device) -> Result<(), DmiError> {
        let mut client = self.connect(device_protocol(device)).await?;
        client
            .remove_device(RemoveDeviceRequest {
                device_name: device.name.clone(),
                device_namespace: device.namespace.clone(),
            })
            .await?;
        Ok(())
    }

    async fn update_device(&self, device: &Device) -> Result<(), DmiError> {
        let mut client = self.connect(device_protocol(device)).await?;
        client
            .update_device(UpdateDeviceRequest {
                device: Some(device.clone()),
            })
            .await?;
        Ok(())
    }

    async fn create_device_model(&self, model: &DeviceModel) -> Result<(), DmiError> {
        let mut client = self.connect(model_protocol(model)).await?;
        client
            .create_device_model(CreateDeviceModelRequest {
                model: Some(model.clone()),
            })
            .await?;
        Ok(())
    }

    async fn remove_device_model(&self, model: &DeviceModel) -> Result<(), DmiError> {
        let mut client = self.connect(model_protocol(model)).await?;
        client
            .remove_device_model(RemoveDeviceModelRequest {
                model_name: model.name.clone(),
                model_namespace: model.namespace.clone(),
            })
            .await?;
        Ok(())
    }

    async fn update_device_model(&self, model: &DeviceModel) -> Result<(), DmiError> {
        let mut client = self.connect(model_protocol(model)).await?;
        client
            .update_device_model(UpdateDeviceModelRequest {
                model: Some(model.clone()),
            })
            .await?;
        Ok(())
    }
}
