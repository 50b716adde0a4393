//! # Twin Engine 模块
//!
//! 边缘设备孪生引擎：上下文、调和、Worker、路由与监督者。
//!
//! ## 数据流
//!
//! ```text
//! 入站 Message ─► dispatcher ─► router::route ─► Worker 队列
//!                                                  │
//!                    ┌─────────────────────────────┤
//!                    ▼                             ▼
//!       Twin / Device / Membership         DMI（meta 变更）
//!          │  reconcile::*                        │ DeviceMapper
//!          ▼                                      ▼
//!     SQLite（批事务 + 重试）                 映射器 UDS
//!          │
//!          ▼
//!     Comm Worker ─► edgehub（上云，确认表 + 定时重发）
//!                 └► 本地总线（MQTT）
//! ```
//!
//! ## 模块说明
//!
//! - [`context`]：`TwinContext`，设备表、锁、队列、确认表、连接状态
//! - [`convert`]：快照与表行的互转、列级差异、由库恢复快照
//! - [`reconcile`]：属性 / 孪生 / 状态 / 成员关系调和
//! - [`workers`]：五个 Worker 与通用主循环
//! - [`router`]：入站消息分类
//! - [`supervisor`]：启动、健康巡检、重启与停止
//! - [`retry`]：数据库写入重试策略

pub mod context;
pub mod convert;
pub mod error;
pub mod reconcile;
pub mod retry;
pub mod router;
pub mod supervisor;
pub mod workers;

pub use context::{DeviceGuard, DtMessage, Heartbeat, TwinContext};
pub use error::EngineError;
pub use retry::{RetryPolicy, retry};
pub use router::{classify, route};
pub use supervisor::{Supervisor, SupervisorConfig};
pub use workers::{
    CommWorker, DeviceWorker, DmiWorker, MembershipWorker, TwinWorker, Worker, run_worker,
};
