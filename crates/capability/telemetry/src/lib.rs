//! 追踪初始化与运行指标。

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{EnvFilter, fmt};

/// 运行指标快照。
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    pub messages_routed: u64,
    pub messages_dropped: u64,
    pub db_retries: u64,
    pub db_failures: u64,
    pub db_latency_ms_total: u64,
    pub db_latency_ms_count: u64,
    pub worker_restarts: u64,
    pub cloud_dropped: u64,
    pub confirm_resends: u64,
    pub dmi_rate_limited: u64,
    pub publish_success: u64,
    pub publish_failure: u64,
    pub bus_inbound_dropped: u64,
}

/// 运行指标。
pub struct TelemetryMetrics {
    messages_routed: AtomicU64,
    messages_dropped: AtomicU64,
    db_retries: AtomicU64,
    db_failures: AtomicU64,
    db_latency_ms_total: AtomicU64,
    db_latency_ms_count: AtomicU64,
    worker_restarts: AtomicU64,
    cloud_dropped: AtomicU64,
    confirm_resends: AtomicU64,
    dmi_rate_limited: AtomicU64,
    publish_success: AtomicU64,
    publish_failure: AtomicU64,
    bus_inbound_dropped: AtomicU64,
}

impl Default for TelemetryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryMetrics {
    pub fn new() -> Self {
        Self {
            messages_routed: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            db_retries: AtomicU64::new(0),
            db_failures: AtomicU64::new(0),
            db_latency_ms_total: AtomicU64::new(0),
            db_latency_ms_count: AtomicU64::new(0),
            worker_restarts: AtomicU64::new(0),
            cloud_dropped: AtomicU64::new(0),
            confirm_resends: AtomicU64::new(0),
            dmi_rate_limited: AtomicU64::new(0),
            publish_success: AtomicU64::new(0),
            publish_failure: AtomicU64::new(0),
            bus_inbound_dropped: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_routed: self.messages_routed.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            db_retries: self.db_retries.load(Ordering::Relaxed),
            db_failures: self.db_failures.load(Ordering::Relaxed),
            db_latency_ms_total: self.db_latency_ms_total.load(Ordering::Relaxed),
            db_latency_ms_count: self.db_latency_ms_count.load(Ordering::Relaxed),
            worker_restarts: self.worker_restarts.load(Ordering::Relaxed),
            cloud_dropped: self.cloud_dropped.load(Ordering::Relaxed),
            confirm_resends: self.confirm_resends.load(Ordering::Relaxed),
            dmi_rate_limited: self.dmi_rate_limited.load(Ordering::Relaxed),
            publish_success: self.publish_success.load(Ordering::Relaxed),
            publish_failure: self.publish_failure.load(Ordering::Relaxed),
            bus_inbound_dropped: self.bus_inbound_dropped.load(Ordering::Relaxed),
        }
    }
}

static METRICS: OnceLock<TelemetryMetrics> = OnceLock::new();

/// 获取全局指标实例。
pub fn metrics() -> &'static TelemetryMetrics {
    METRICS.get_or_init(TelemetryMetrics::new)
}

/// 初始化 tracing（默认 info）。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// 记录路由成功投递次数。
pub fn record_message_routed() {
    metrics().messages_routed.fetch_add(1, Ordering::Relaxed);
}

/// 记录无法分类而丢弃的消息。
pub fn record_message_dropped() {
    metrics().messages_dropped.fetch_add(1, Ordering::Relaxed);
}

/// 记录数据库重试次数（不含首次尝试）。
pub fn record_db_retry() {
    metrics().db_retries.fetch_add(1, Ordering::Relaxed);
}

/// 记录重试耗尽后的数据库失败。
pub fn record_db_failure() {
    metrics().db_failures.fetch_add(1, Ordering::Relaxed);
}

/// 记录事务提交耗时（毫秒）。
pub fn record_db_latency_ms(latency_ms: u64) {
    let metrics = metrics();
    metrics
        .db_latency_ms_total
        .fetch_add(latency_ms, Ordering::Relaxed);
    metrics.db_latency_ms_count.fetch_add(1, Ordering::Relaxed);
}

/// 记录 Worker 重启次数。
pub fn record_worker_restart() {
    metrics().worker_restarts.fetch_add(1, Ordering::Relaxed);
}

/// 记录断连期间丢弃的上云消息。
pub fn record_cloud_dropped() {
    metrics().cloud_dropped.fetch_add(1, Ordering::Relaxed);
}

/// 记录确认超时后的重发。
pub fn record_confirm_resend() {
    metrics().confirm_resends.fetch_add(1, Ordering::Relaxed);
}

/// 记录被限流拒绝的 DMI 调用。
pub fn record_dmi_rate_limited() {
    metrics().dmi_rate_limited.fetch_add(1, Ordering::Relaxed);
}

/// 记录总线发布成功次数。
pub fn record_publish_success() {
    metrics().publish_success.fetch_add(1, Ordering::Relaxed);
}

/// 记录总线发布失败次数（重试耗尽）。
pub fn record_publish_failure() {
    metrics().publish_failure.fetch_add(1, Ordering::Relaxed);
}

/// 记录入站队列满时丢弃的总线消息。
pub fn record_bus_inbound_dropped() {
    metrics().bus_inbound_dropped.fetch_add(1, Ordering::Relaxed);
}
