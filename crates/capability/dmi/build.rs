use std::io::Result;

fn main() -> Result<()> {
    // DMI 协议：服务端（DeviceManagerService）与客户端（DeviceMapperService）桩代码
    // 消息类型额外派生 serde，用于 meta 表缓存
    tonic_build::configure()
        .type_attribute(".", "#[derive(serde::Serialize, serde::Deserialize)]")
        .type_attribute(".", "#[serde(default)]")
        .compile_protos(&["proto/dmi.proto"], &["proto/"])?;
    Ok(())
}
