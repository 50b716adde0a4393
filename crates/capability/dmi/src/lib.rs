//! # Twin DMI 模块
//!
//! 设备映射接口（Device Mapper Interface），gRPC over UDS。
//!
//! - [`server`]：`DeviceManagerService`（映射器注册、孪生上报、状态上报），令牌桶限流
//! - [`client`]：`DeviceMapperService` 出站调用，按协议路由到映射器套接字
//! - [`cache`]：映射器 / 设备 / 设备模型缓存，模型默认值合并
//! - [`proto`]：由 `proto/dmi.proto` 生成的消息与服务桩

pub mod cache;
pub mod client;
pub mod error;
pub mod server;

pub mod proto {
    tonic::include_proto!("dmi.v1alpha1");
}

pub use cache::{
    DmiCache, RESOURCE_TYPE_DEVICE, RESOURCE_TYPE_DEVICE_MAPPER, RESOURCE_TYPE_DEVICE_MODEL,
    merge_model_defaults, meta_key, resource_id,
};
pub use client::{DeviceMapper, DmiClients, uds_channel};
pub use error::DmiError;
pub use server::{DeviceManager, init_sock, rate_limiter, serve};
