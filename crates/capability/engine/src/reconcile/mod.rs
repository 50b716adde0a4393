//! 调和引擎。
//!
//! 四个入口（属性、孪生、设备状态、成员关系）都在目标设备的锁内运行；
//! 批事务失败时按重试策略重试，最终失败则以库中数据恢复内存快照。

pub mod attr;
pub mod membership;
pub mod state;
pub mod twin;

pub use attr::{AttrOutcome, apply_attrs, deal_msg_attr, update_attrs};
pub use membership::{add_devices, full_refresh, get_membership, remove_devices};
pub use state::{get_device_state, update_device_state};
pub use twin::{TwinOutcome, apply_twin, deal_msg_twin, deal_version, update_twin};
