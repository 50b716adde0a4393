//! 边缘节点运行时：配置、日志、本地库、DMI 服务、MQTT 桥接与孪生引擎。

use domain::Message;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use twin_bus::{LogSink, ModuleSink, MqttBridgeConfig, connect_bridge};
use twin_config::AppConfig;
use twin_dmi::{DeviceManager, DmiCache, DmiClients, rate_limiter, serve};
use twin_engine::{
    CommWorker, DeviceWorker, DmiWorker, MembershipWorker, RetryPolicy, Supervisor,
    SupervisorConfig, TwinContext, TwinWorker,
};
use twin_storage::{MetaStore, SqliteStore, TwinStore};
use twin_telemetry::init_tracing;

/// 入站总线容量。
const INBOUND_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 加载本地 .env（如存在）
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env()?;
    init_tracing();
    info!(
        target: "twin.app",
        node_name = %config.node_name,
        db_source = %config.db_source,
        dmi_sock_path = %config.dmi_sock_path,
        mqtt_enabled = config.mqtt_enabled,
        "twin_edge_starting"
    );

    let sqlite = Arc::new(SqliteStore::connect(&config.db_source).await?);
    let store: Arc<dyn TwinStore> = sqlite.clone();
    let meta_store: Arc<dyn MetaStore> = sqlite;

    let cancel = CancellationToken::new();
    let (inbound_tx, inbound_rx) = mpsc::channel::<Message>(INBOUND_CAPACITY);

    // 本地总线：启用 MQTT 时桥接 broker，否则只记录日志
    let mut bridge = None;
    let bus: Arc<dyn ModuleSink> = if config.mqtt_enabled {
        let (publisher, handle) = connect_bridge(
            MqttBridgeConfig {
                host: config.mqtt_host.clone(),
                port: config.mqtt_port,
                username: config.mqtt_username.clone(),
                password: config.mqtt_password.clone(),
                qos: config.mqtt_qos,
                publish_max_retries: config.mqtt_publish_max_retries,
                publish_backoff_ms: config.mqtt_publish_backoff_ms,
            },
            inbound_tx.clone(),
            cancel.clone(),
        );
        bridge = Some(handle);
        Arc::new(publisher)
    } else {
        Arc::new(LogSink::new("bus"))
    };
    let hub: Arc<dyn ModuleSink> = Arc::new(LogSink::new("edgehub"));

    // DMI：缓存恢复后再对外提供服务
    let cache = Arc::new(DmiCache::new());
    let clients = Arc::new(DmiClients::new());
    cache.hydrate(meta_store.as_ref(), &clients).await?;
    let manager = DeviceManager::new(
        config.node_name.clone(),
        cache.clone(),
        clients.clone(),
        meta_store,
        inbound_tx.clone(),
        rate_limiter(config.rate_limit_capacity, config.rate_limit_refill()),
    );
    let sock_path = PathBuf::from(&config.dmi_sock_path);
    let dmi_cancel = cancel.clone();
    let dmi_server = tokio::spawn(async move {
        if let Err(err) = serve(&sock_path, manager, dmi_cancel).await {
            error!(target: "twin.app", error = %err, "dmi_server_failed");
        }
    });

    let ctx = Arc::new(TwinContext::new(
        config.node_name.clone(),
        store,
        RetryPolicy::new(config.db_retry_times, config.db_retry_interval()),
        cancel.clone(),
    ));
    let supervisor = Supervisor::new(
        ctx.clone(),
        SupervisorConfig {
            health_check_interval: config.health_check_interval(),
            worker_timeout: config.worker_timeout(),
        },
    )
    .with_worker(Arc::new(TwinWorker::new(ctx.clone())))
    .with_worker(Arc::new(DeviceWorker::new(ctx.clone())))
    .with_worker(Arc::new(MembershipWorker::new(ctx.clone())))
    .with_worker(Arc::new(CommWorker::new(ctx.clone(), hub, bus)))
    .with_worker(Arc::new(DmiWorker::new(ctx.clone(), cache, clients)));

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!(target: "twin.app", "shutdown_signal_received"),
            Err(err) => warn!(target: "twin.app", error = %err, "shutdown_signal_failed"),
        }
        shutdown.cancel();
    });

    // 只保留桥接与 DMI 服务持有的发送端
    drop(inbound_tx);
    let result = supervisor.run(inbound_rx).await;
    cancel.cancel();
    if let Err(err) = dmi_server.await {
        warn!(target: "twin.app", error = %err, "dmi_server_join_failed");
    }
    if let Some(bridge) = bridge {
        if let Err(err) = bridge.await {
            warn!(target: "twin.app", error = %err, "bus_bridge_join_failed");
        }
    }
    info!(
        target: "twin.app",
        metrics = ?twin_telemetry::metrics().snapshot(),
        "twin_edge_stopped"
    );
    result?;
    Ok(())
}
