//! DMI 缓存：映射器、设备、设备模型。
//!
//! 设备与模型以 `<namespace>/<name>` 为键；映射器以名称为键。
//! 启动时由 meta 表恢复，之后由 DMI 服务端与 DMI Worker 维护。

use crate::client::DmiClients;
use crate::error::DmiError;
use crate::proto::{Device, DeviceModel, MapperInfo, ProtocolConfig};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;
use tracing::{info, warn};
use twin_storage::{MetaColumn, MetaStore};

pub const RESOURCE_TYPE_DEVICE: &str = "device";
pub const RESOURCE_TYPE_DEVICE_MODEL: &str = "devicemodel";
pub const RESOURCE_TYPE_DEVICE_MAPPER: &str = "devicemapper";
pub const DEFAULT_NAMESPACE: &str = "default";

/// `<namespace>/<name>`；命名空间为空时使用 `default`。
pub fn resource_id(namespace: &str, name: &str) -> String {
    let namespace = if namespace.is_empty() {
        DEFAULT_NAMESPACE
    } else {
        namespace
    };
    format!("{namespace}/{name}")
}

/// meta 表键：`node/<node>/<namespace>/<type>/<name>`。
pub fn meta_key(node_name: &str, namespace: &str, resource_type: &str, name: &str) -> String {
    let namespace = if namespace.is_empty() {
        DEFAULT_NAMESPACE
    } else {
        namespace
    };
    format!("node/{node_name}/{namespace}/{resource_type}/{name}")
}

pub fn device_protocol(device: &Device) -> Option<&str> {
    device
        .spec
        .as_ref()
        .and_then(|spec| spec.protocol.as_ref())
        .map(|protocol| protocol.protocol_name.as_str())
        .filter(|name| !name.is_empty())
}

pub fn model_protocol(model: &DeviceModel) -> Option<&str> {
    model
        .spec
        .as_ref()
        .map(|spec| spec.protocol.as_str())
        .filter(|name| !name.is_empty())
}

fn model_reference(device: &Device) -> Option<&str> {
    device
        .spec
        .as_ref()
        .map(|spec| spec.device_model_reference.as_str())
        .filter(|name| !name.is_empty())
}

/// 以模型默认值补全设备实例配置；实例上已有的键优先。
pub fn merge_model_defaults(device: &mut Device, model: &DeviceModel) {
    let Some(model_spec) = model.spec.as_ref() else {
        return;
    };
    let spec = device.spec.get_or_insert_with(Default::default);

    for property in spec.properties.iter_mut() {
        let Some(model_property) = model_spec
            .properties
            .iter()
            .find(|candidate| candidate.name == property.name)
        else {
            continue;
        };
        let mut visitors = model_property.visitors.clone();
        visitors.extend(std::mem::take(&mut property.visitors));
        property.visitors = visitors;
    }

    let protocol = spec.protocol.get_or_insert_with(ProtocolConfig::default);
    let mut config = model_spec.protocol_config_data.clone();
    config.extend(std::mem::take(&mut protocol.config_data));
    protocol.config_data = config;
}

#[derive(Debug, Default)]
pub struct DmiCache {
    mappers: DashMap<String, MapperInfo>,
    devices: DashMap<String, Device>,
    models: DashMap<String, DeviceModel>,
}

impl DmiCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_mapper(&self, mapper: MapperInfo) {
        self.mappers.insert(mapper.name.clone(), mapper);
    }

    pub fn mapper(&self, name: &str) -> Option<MapperInfo> {
        self.mappers.get(name).map(|entry| entry.value().clone())
    }

    pub fn mappers(&self) -> Vec<MapperInfo> {
        self.mappers
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn upsert_device(&self, device: Device) {
        self.devices
            .insert(resource_id(&device.namespace, &device.name), device);
    }

    pub fn remove_device(&self, id: &str) -> Option<Device> {
        self.devices.remove(id).map(|(_, device)| device)
    }

    pub fn device(&self, id: &str) -> Option<Device> {
        self.devices.get(id).map(|entry| entry.value().clone())
    }

    pub fn upsert_model(&self, model: DeviceModel) {
        self.models
            .insert(resource_id(&model.namespace, &model.name), model);
    }

    pub fn remove_model(&self, id: &str) -> Option<DeviceModel> {
        self.models.remove(id).map(|(_, model)| model)
    }

    pub fn model(&self, id: &str) -> Option<DeviceModel> {
        self.models.get(id).map(|entry| entry.value().clone())
    }

    /// 设备实例补全模型默认值；找不到模型时报错。
    pub fn resolve_device(&self, mut device: Device) -> Result<Device, DmiError> {
        let reference = model_reference(&device)
            .ok_or_else(|| DmiError::NoModelReference(device.name.clone()))?
            .to_string();
        let model_id = resource_id(&device.namespace, &reference);
        let model = self
            .model(&model_id)
            .ok_or_else(|| DmiError::MissingModel(model_id.clone()))?;
        merge_model_defaults(&mut device, &model);
        Ok(device)
    }

    /// 指定协议下的设备及其（去重后的）模型；缺模型的设备跳过。
    pub fn protocol_data(&self, protocol: &str) -> (Vec<Device>, Vec<DeviceModel>) {
        let mut devices = Vec::new();
        let mut models = Vec::new();
        let mut seen_models = BTreeSet::new();
        for entry in self.devices.iter() {
            let device = entry.value();
            if device_protocol(device) != Some(protocol) {
                continue;
            }
            let Some(reference) = model_reference(device) else {
                warn!(target: "twin.dmi", device = %device.name, "device_model_reference_missing");
                continue;
            };
            let model_id = resource_id(&device.namespace, reference);
            let Some(model) = self.model(&model_id) else {
                warn!(target: "twin.dmi", device = %device.name, model = %model_id, "device_model_not_cached");
                continue;
            };
            devices.push(device.clone());
            if seen_models.insert(model_id) {
                models.push(model);
            }
        }
        (devices, models)
    }

    /// 由 meta 表恢复缓存，并为每个映射器重建出站客户端。
    pub async fn hydrate(
        &self,
        store: &dyn MetaStore,
        clients: &DmiClients,
    ) -> Result<(), DmiError> {
        for model in load_meta::<DeviceModel>(store, RESOURCE_TYPE_DEVICE_MODEL).await? {
            self.upsert_model(model);
        }
        for device in load_meta::<Device>(store, RESOURCE_TYPE_DEVICE).await? {
            self.upsert_device(device);
        }
        for mapper in load_meta::<MapperInfo>(store, RESOURCE_TYPE_DEVICE_MAPPER).await? {
            clients.create_client(
                &mapper.protocol,
                &String::from_utf8_lossy(&mapper.address),
            );
            self.upsert_mapper(mapper);
        }
        info!(
            target: "twin.dmi",
            mappers = self.mappers.len(),
            devices = self.devices.len(),
            models = self.models.len(),
            "dmi_cache_hydrated"
        );
        Ok(())
    }
}

async fn load_meta<T: DeserializeOwned>(
    store: &dyn MetaStore,
    meta_type: &str,
) -> Result<Vec<T>, DmiError> {
    let rows = store.query_meta(MetaColumn::Type, meta_type).await?;
    let mut items = Vec::with_capacity(rows.len());
    for row in rows {
        match serde_json::from_str(&row.value) {
            Ok(item) => items.push(item),
            Err(err) => {
                warn!(target: "twin.dmi", key = %row.key, error = %err, "meta_row_decode_failed");
            }
        }
    }
    Ok(items)
}
