use super::{Worker, payload_bytes, unknown_action};
use crate::context::{DtMessage, TwinContext};
use crate::error::EngineError;
use async_trait::async_trait;
use domain::message::{OP_DELETE, OP_INSERT, OP_UPDATE};
use domain::{Action, WorkerKind};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, info, warn};
use twin_dmi::proto::{Device, DeviceModel};
use twin_dmi::{
    DeviceMapper, DmiCache, DmiError, RESOURCE_TYPE_DEVICE, RESOURCE_TYPE_DEVICE_MODEL, meta_key,
    resource_id,
};
use twin_storage::MetaRow;

/// metamanager 下发的设备 / 设备模型变更：维护 DMI 缓存与 meta 表，并通知映射器。
pub struct DmiWorker {
    ctx: Arc<TwinContext>,
    cache: Arc<DmiCache>,
    mapper: Arc<dyn DeviceMapper>,
}

/// `<namespace>/<type>/<name>`。
struct MetaResource {
    namespace: String,
    resource_type: String,
    name: String,
}

fn parse_resource(resource: &str) -> Result<MetaResource, DmiError> {
    let parts: Vec<&str> = resource.split('/').collect();
    match parts.as_slice() {
        [namespace, resource_type, name] if !name.is_empty() => Ok(MetaResource {
            namespace: namespace.to_string(),
            resource_type: resource_type.to_string(),
            name: name.to_string(),
        }),
        _ => Err(DmiError::InvalidResource(resource.to_string())),
    }
}

impl DmiWorker {
    pub fn new(ctx: Arc<TwinContext>, cache: Arc<DmiCache>, mapper: Arc<dyn DeviceMapper>) -> Self {
        Self { ctx, cache, mapper }
    }

    fn decode<T: DeserializeOwned>(&self, message: &DtMessage) -> Result<T, EngineError> {
        let payload = payload_bytes(&message.msg)?;
        serde_json::from_slice(&payload).map_err(|err| DmiError::from(err).into())
    }

    /// insert 走普通插入，唯一约束冲突视为已存在；update 走 upsert。
    async fn save_meta<T: serde::Serialize>(
        &self,
        operation: &str,
        resource: &MetaResource,
        value: &T,
    ) -> Result<(), EngineError> {
        let row = MetaRow {
            key: meta_key(
                self.ctx.node_name(),
                &resource.namespace,
                &resource.resource_type,
                &resource.name,
            ),
            meta_type: resource.resource_type.clone(),
            value: serde_json::to_string(value).map_err(DmiError::from)?,
        };
        if operation != OP_INSERT {
            self.ctx.store().insert_or_update_meta(&row).await?;
            return Ok(());
        }
        match self.ctx.store().save_meta(&row).await {
            Err(err) if err.is_unique_violation() => {
                debug!(target: "twin.dmi", key = %row.key, "dmi_meta_exists");
                Ok(())
            }
            written => written.map_err(EngineError::from),
        }
    }

    async fn delete_meta(&self, resource: &MetaResource) -> Result<(), EngineError> {
        let key = meta_key(
            self.ctx.node_name(),
            &resource.namespace,
            &resource.resource_type,
            &resource.name,
        );
        self.ctx.store().delete_meta_by_key(&key).await?;
        Ok(())
    }

    async fn device_operation(
        &self,
        operation: &str,
        resource: &MetaResource,
        message: &DtMessage,
    ) -> Result<(), EngineError> {
        let id = resource_id(&resource.namespace, &resource.name);
        match operation {
            OP_INSERT | OP_UPDATE => {
                let mut device: Device = self.decode(message)?;
                fill_identity(&mut device.namespace, &mut device.name, resource);
                let device = self.cache.resolve_device(device)?;
                self.cache.upsert_device(device.clone());
                self.save_meta(operation, resource, &device).await?;
                if operation == OP_INSERT {
                    self.mapper.register_device(&device).await?;
                } else {
                    self.mapper.update_device(&device).await?;
                }
                info!(target: "twin.dmi", device = %id, operation = %operation, "dmi_device_applied");
            }
            OP_DELETE => {
                let device = match self.cache.device(&id) {
                    Some(device) => device,
                    None => {
                        let mut device: Device = self.decode(message).unwrap_or_default();
                        fill_identity(&mut device.namespace, &mut device.name, resource);
                        device
                    }
                };
                self.mapper.remove_device(&device).await?;
                self.cache.remove_device(&id);
                self.delete_meta(resource).await?;
                info!(target: "twin.dmi", device = %id, "dmi_device_removed");
            }
            other => {
                warn!(target: "twin.dmi", device = %id, operation = %other, "dmi_operation_unknown");
            }
        }
        Ok(())
    }

    async fn model_operation(
        &self,
        operation: &str,
        resource: &MetaResource,
        message: &DtMessage,
    ) -> Result<(), EngineError> {
        let id = resource_id(&resource.namespace, &resource.name);
        match operation {
            OP_INSERT | OP_UPDATE => {
                let mut model: DeviceModel = self.decode(message)?;
                fill_identity(&mut model.namespace, &mut model.name, resource);
                self.cache.upsert_model(model.clone());
                self.save_meta(operation, resource, &model).await?;
                if operation == OP_INSERT {
                    self.mapper.create_device_model(&model).await?;
                } else {
                    self.mapper.update_device_model(&model).await?;
                }
                info!(target: "twin.dmi", model = %id, operation = %operation, "dmi_model_applied");
            }
            OP_DELETE => {
                let model = match self.cache.model(&id) {
                    Some(model) => model,
                    None => {
                        let mut model: DeviceModel = self.decode(message).unwrap_or_default();
                        fill_identity(&mut model.namespace, &mut model.name, resource);
                        model
                    }
                };
                self.mapper.remove_device_model(&model).await?;
                self.cache.remove_model(&id);
                self.delete_meta(resource).await?;
                info!(target: "twin.dmi", model = %id, "dmi_model_removed");
            }
            other => {
                warn!(target: "twin.dmi", model = %id, operation = %other, "dmi_operation_unknown");
            }
        }
        Ok(())
    }
}

/// 消息体缺少命名空间或名称时取资源路径中的值。
fn fill_identity(namespace: &mut String, name: &mut String, resource: &MetaResource) {
    if namespace.is_empty() {
        *namespace = resource.namespace.clone();
    }
    if name.is_empty() {
        *name = resource.name.clone();
    }
}

#[async_trait]
impl Worker for DmiWorker {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Dmi
    }

    async fn handle(&self, message: DtMessage) -> Result<(), EngineError> {
        if message.action != Action::MetaDeviceOperation {
            return unknown_action(self.kind(), &message);
        }
        let resource = parse_resource(message.msg.resource())?;
        let operation = message.msg.operation().to_string();
        debug!(
            target: "twin.dmi",
            resource = %message.msg.resource(),
            operation = %operation,
            "dmi_meta_operation"
        );
        match resource.resource_type.as_str() {
            RESOURCE_TYPE_DEVICE => self.device_operation(&operation, &resource, &message).await,
            RESOURCE_TYPE_DEVICE_MODEL => {
                self.model_operation(&operation, &resource, &message).await
            }
            _ => Err(DmiError::InvalidResource(message.msg.resource().to_string()).into()),
        }
    }
}
