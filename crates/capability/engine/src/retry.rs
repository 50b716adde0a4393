//! 数据库写入重试。
//!
//! 可重试的操作：全部批事务（`add_device_trans`、`delete_device_trans`、
//! `device_attr_trans`、`device_twin_trans`）与设备状态列更新。

use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{error, warn};

pub const DEFAULT_RETRY_TIMES: u32 = 5;
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// 重试策略：最多 `times` 次尝试，两次尝试之间等待 `interval`。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub times: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            times: DEFAULT_RETRY_TIMES,
            interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

impl RetryPolicy {
    pub fn new(times: u32, interval: Duration) -> Self {
        Self { times, interval }
    }
}

/// 按策略重试异步操作，返回最后一次的结果。
pub async fn retry<T, E, F, Fut>(policy: RetryPolicy, operation: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let times = policy.times.max(1);
    let mut attempt = 1;
    loop {
        let started = Instant::now();
        let result = op().await;
        twin_telemetry::record_db_latency_ms(started.elapsed().as_millis() as u64);
        match result {
            Ok(value) => return Ok(value),
            Err(err) if attempt < times => {
                twin_telemetry::record_db_retry();
                warn!(
                    target: "twin.engine",
                    operation = %operation,
                    attempt,
                    error = %err,
                    "db_write_retry"
                );
                tokio::time::sleep(policy.interval).await;
                attempt += 1;
            }
            Err(err) => {
                twin_telemetry::record_db_failure();
                error!(
                    target: "twin.engine",
                    operation = %operation,
                    attempts = attempt,
                    error = %err,
                    "db_write_failed"
                );
                return Err(err);
            }
        }
    }
}
