//! 监督者：恢复设备、启动 Worker 与分发任务，定期巡检 Worker 健康。

use crate::context::{Heartbeat, TwinContext};
use crate::convert::{resync_all_from_store, sync_all_from_store};
use crate::error::EngineError;
use crate::router::route;
use crate::workers::{Worker, run_worker};
use domain::{Message, WorkerKind, now_ms};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    /// 巡检周期。
    pub health_check_interval: Duration,
    /// 超过该时长没有心跳的 Worker 会被重启。
    pub worker_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(60),
            worker_timeout: Duration::from_secs(120),
        }
    }
}

pub struct Supervisor {
    ctx: Arc<TwinContext>,
    config: SupervisorConfig,
    workers: Vec<Arc<dyn Worker>>,
}

impl Supervisor {
    pub fn new(ctx: Arc<TwinContext>, config: SupervisorConfig) -> Self {
        Self {
            ctx,
            config,
            workers: Vec::new(),
        }
    }

    pub fn with_worker(mut self, worker: Arc<dyn Worker>) -> Self {
        self.workers.push(worker);
        self
    }

    /// 运行到取消令牌触发；返回前向全部 Worker 发送 `Stop` 并等待其退出。
    pub async fn run(self, inbound: mpsc::Receiver<Message>) -> Result<(), EngineError> {
        sync_all_from_store(&self.ctx).await?;

        let mut handles: HashMap<WorkerKind, (Arc<dyn Worker>, JoinHandle<()>)> = HashMap::new();
        for worker in &self.workers {
            let handle = tokio::spawn(run_worker(self.ctx.clone(), worker.clone()));
            handles.insert(worker.kind(), (worker.clone(), handle));
        }
        let dispatcher = tokio::spawn(dispatch(self.ctx.clone(), inbound));
        info!(target: "twin.supervisor", workers = handles.len(), "supervisor_started");

        let period = self.config.health_check_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.ctx.cancel_token().cancelled() => break,
                _ = ticker.tick() => self.check_health(&mut handles).await,
            }
        }

        for kind in handles.keys() {
            self.ctx.send_heartbeat(*kind, Heartbeat::Stop);
        }
        for (kind, (_, handle)) in handles {
            if let Err(err) = handle.await {
                warn!(target: "twin.supervisor", worker = %kind, error = %err, "worker_join_failed");
            }
        }
        if let Err(err) = dispatcher.await {
            warn!(target: "twin.supervisor", error = %err, "dispatcher_join_failed");
        }
        info!(target: "twin.supervisor", "supervisor_stopped");
        Ok(())
    }

    /// 重启超时或已退出的 Worker，然后向全部 Worker 发送 `Ping`。
    ///
    /// 旧实例可能在提交与更新内存之间被中断：等待其退出后启动新实例，再以库为准重建设备表。
    async fn check_health(
        &self,
        handles: &mut HashMap<WorkerKind, (Arc<dyn Worker>, JoinHandle<()>)>,
    ) {
        let timeout_ms = self.config.worker_timeout.as_millis() as i64;
        let now = now_ms();
        for (kind, (worker, handle)) in handles.iter_mut() {
            let last = self.ctx.last_heartbeat(*kind).unwrap_or(0);
            let stale = now - last > timeout_ms;
            let finished = handle.is_finished();
            if !stale && !finished {
                continue;
            }
            warn!(
                target: "twin.supervisor",
                worker = %kind,
                silent_ms = now - last,
                finished,
                "worker_restarted"
            );
            twin_telemetry::record_worker_restart();
            handle.abort();
            match (&mut *handle).await {
                Err(err) if !err.is_cancelled() => {
                    warn!(target: "twin.supervisor", worker = %kind, error = %err, "worker_join_failed");
                }
                _ => {}
            }
            *handle = tokio::spawn(run_worker(self.ctx.clone(), worker.clone()));
            // 新实例须先于重建启动：其他 Worker 可能持读锁等待该队列
            if let Err(err) = resync_all_from_store(&self.ctx).await {
                warn!(target: "twin.supervisor", worker = %kind, error = %err, "device_resync_failed");
            }
        }
        for kind in handles.keys() {
            self.ctx.send_heartbeat(*kind, Heartbeat::Ping);
        }
    }
}

/// 分发任务：入站消息逐条交给路由。
async fn dispatch(ctx: Arc<TwinContext>, mut inbound: mpsc::Receiver<Message>) {
    loop {
        let message = tokio::select! {
            _ = ctx.cancel_token().cancelled() => break,
            message = inbound.recv() => message,
        };
        let Some(message) = message else {
            info!(target: "twin.supervisor", "inbound_closed");
            break;
        };
        if let Err(err) = route(&ctx, message).await {
            warn!(target: "twin.supervisor", error = %err, "message_route_failed");
        }
    }
}
