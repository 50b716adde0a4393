mod common;

use common::{
    FlakyStore, context, context_with, device, drain, find, memory_store, outbound, seed,
    string_twin, twins,
};
use domain::payload::MembershipDetail;
use domain::topic::{
    MEMBERSHIP_UPDATED, STATE_GET_RESULT, STATE_UPDATE_RESULT, TWIN_DELTA, TWIN_DOCUMENT,
    TWIN_UPDATE_RESULT, cloud_edge_updated, cloud_state_update, device_topic, node_topic,
};
use domain::{
    Action, BaseMessage, DealType, MsgTwin, TwinValue, TwinVersion, TypeMetadata, WorkerKind,
};
use std::sync::Arc;
use std::time::Duration;
use twin_engine::TwinContext;
use twin_engine::reconcile::{
    add_devices, full_refresh, get_device_state, remove_devices, update_device_state, update_twin,
};
use twin_storage::{DeviceColumn, DeviceStore, DeviceTwinStore, SqliteStore};

fn expected_only(value: &str, version: Option<TwinVersion>) -> MsgTwin {
    MsgTwin {
        expected: Some(TwinValue::new(value, 2)),
        expected_version: version,
        ..MsgTwin::default()
    }
}

fn version_of(json: Option<&str>) -> TwinVersion {
    serde_json::from_str(json.expect("version column")).expect("version json")
}

#[tokio::test]
async fn cloud_sync_with_newer_version_publishes_delta_and_document() {
    let (ctx, store) = context().await;
    seed(
        &ctx,
        &[device("d1", &[("t", string_twin(Some("20"), Some("20"), TwinVersion::new(1, 1)))])],
    )
    .await;

    let incoming = twins(&[("t", Some(expected_only("25", Some(TwinVersion::new(2, 1)))))]);
    update_twin(&ctx, "d1", "e1", &incoming, DealType::Sync)
        .await
        .expect("sync");

    let sent = outbound(&drain(&ctx, WorkerKind::Comm).await);
    let delta = find(&sent, &device_topic("d1", TWIN_DELTA)).expect("delta");
    assert_eq!(delta["delta"], serde_json::json!({"t": "25"}));
    assert_eq!(delta["event_id"], "e1");
    let document = find(&sent, &device_topic("d1", TWIN_DOCUMENT)).expect("document");
    assert_eq!(document["twin"]["t"]["current"]["expected"]["value"], "25");
    assert_eq!(document["twin"]["t"]["last"]["expected"]["value"], "20");
    assert!(find(&sent, &device_topic("d1", TWIN_UPDATE_RESULT)).is_none());
    assert!(sent.iter().all(|(action, _, _)| *action == Action::SendToEdge));

    let rows = store.query_device_twin("d1").await.expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].expected.as_deref(), Some("25"));
    assert_eq!(rows[0].actual.as_deref(), Some("20"));
    assert_eq!(version_of(rows[0].expected_version.as_deref()), TwinVersion::new(2, 1));
    assert_eq!(version_of(rows[0].actual_version.as_deref()), TwinVersion::new(1, 1));
}

#[tokio::test]
async fn rest_add_replies_and_bumps_edge_version() {
    let (ctx, store) = context().await;
    seed(&ctx, &[device("d1", &[])]).await;

    let incoming = twins(&[("k", Some(expected_only("on", None)))]);
    update_twin(&ctx, "d1", "e2", &incoming, DealType::Rest)
        .await
        .expect("rest add");

    let sent = outbound(&drain(&ctx, WorkerKind::Comm).await);
    let result = find(&sent, &device_topic("d1", TWIN_UPDATE_RESULT)).expect("result");
    assert_eq!(result["event_id"], "e2");
    assert_eq!(result["twin"]["k"]["expected"]["value"], "on");
    let delta = find(&sent, &device_topic("d1", TWIN_DELTA)).expect("delta");
    assert_eq!(delta["delta"], serde_json::json!({"k": "on"}));
    assert!(find(&sent, &device_topic("d1", TWIN_DOCUMENT)).is_some());
    let edge_updated = find(&sent, &cloud_edge_updated("d1")).expect("edge updated");
    assert_eq!(edge_updated["twin"]["k"]["expected_version"]["edge"], 1);

    let rows = store.query_device_twin("d1").await.expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].name, "k");
    assert_eq!(version_of(rows[0].expected_version.as_deref()), TwinVersion::new(0, 1));
    assert_eq!(rows[0].attr_type, "string");
}

#[tokio::test]
async fn repeated_rest_update_writes_nothing() {
    let (ctx, store) = context().await;
    seed(&ctx, &[device("d1", &[])]).await;
    let incoming = twins(&[("k", Some(expected_only("on", None)))]);
    update_twin(&ctx, "d1", "e1", &incoming, DealType::Rest)
        .await
        .expect("first");
    drain(&ctx, WorkerKind::Comm).await;

    update_twin(&ctx, "d1", "e2", &incoming, DealType::Rest)
        .await
        .expect("second");

    let sent = outbound(&drain(&ctx, WorkerKind::Comm).await);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1, device_topic("d1", TWIN_UPDATE_RESULT));
    let rows = store.query_device_twin("d1").await.expect("rows");
    assert_eq!(version_of(rows[0].expected_version.as_deref()), TwinVersion::new(0, 1));
}

#[tokio::test]
async fn stale_cloud_version_is_answered_with_edge_copy() {
    let (ctx, store) = context().await;
    seed(
        &ctx,
        &[device("d1", &[("t", string_twin(Some("20"), Some("20"), TwinVersion::new(1, 1)))])],
    )
    .await;

    let incoming = twins(&[("t", Some(expected_only("30", Some(TwinVersion::new(0, 5)))))]);
    update_twin(&ctx, "d1", "e3", &incoming, DealType::Sync)
        .await
        .expect("conflict handled");

    let sent = outbound(&drain(&ctx, WorkerKind::Comm).await);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, Action::SendToCloud);
    assert_eq!(sent[0].1, cloud_edge_updated("d1"));
    assert_eq!(sent[0].2["twin"]["t"]["expected"]["value"], "20");
    assert_eq!(sent[0].2["twin"]["t"]["expected_version"]["cloud"], 1);

    let rows = store.query_device_twin("d1").await.expect("rows");
    assert_eq!(rows[0].expected.as_deref(), Some("20"));
    assert_eq!(version_of(rows[0].expected_version.as_deref()), TwinVersion::new(1, 1));
}

#[tokio::test]
async fn rest_update_with_invalid_value_is_rejected() {
    let (ctx, store) = context().await;
    let mut twin = string_twin(Some("20"), None, TwinVersion::new(1, 1));
    twin.metadata = Some(TypeMetadata::of_type("int"));
    seed(&ctx, &[device("d1", &[("t", twin)])]).await;

    let incoming = twins(&[("t", Some(expected_only("hot", None)))]);
    let err = update_twin(&ctx, "d1", "e4", &incoming, DealType::Rest)
        .await
        .expect_err("invalid int");
    assert_eq!(err.code().as_u16(), 400);
    assert!(drain(&ctx, WorkerKind::Comm).await.is_empty());
    let rows = store.query_device_twin("d1").await.expect("rows");
    assert_eq!(rows[0].expected.as_deref(), Some("20"));
}

#[tokio::test]
async fn unknown_device_is_not_found() {
    let (ctx, _store) = context().await;
    let incoming = twins(&[("k", Some(expected_only("on", None)))]);
    let err = update_twin(&ctx, "ghost", "e5", &incoming, DealType::Rest)
        .await
        .expect_err("missing device");
    assert_eq!(err.code().as_u16(), 404);
    let err = get_device_state(&ctx, "ghost", "e6")
        .await
        .expect_err("missing device");
    assert_eq!(err.code().as_u16(), 404);
}

#[tokio::test]
async fn failed_write_restores_snapshot_from_store() {
    let inner = memory_store().await;
    let flaky = Arc::new(FlakyStore::new(inner.clone()));
    let ctx = context_with(flaky.clone());
    seed(
        &ctx,
        &[device("d1", &[("t", string_twin(Some("20"), Some("20"), TwinVersion::new(1, 1)))])],
    )
    .await;

    flaky.set_failing(true);
    let incoming = twins(&[("t", Some(expected_only("21", None)))]);
    let err = update_twin(&ctx, "d1", "e7", &incoming, DealType::Rest)
        .await
        .expect_err("store failure");
    assert_eq!(err.code().as_u16(), 500);

    let snapshot = ctx.get_device("d1").expect("snapshot");
    assert_eq!(snapshot.twin["t"].expected_value(), Some("20"));
    assert_eq!(snapshot.twin["t"].expected_version, Some(TwinVersion::new(1, 1)));
    assert!(drain(&ctx, WorkerKind::Comm).await.is_empty());

    flaky.set_failing(false);
    update_twin(&ctx, "d1", "e8", &incoming, DealType::Rest)
        .await
        .expect("recovered");
    let rows = inner.query_device_twin("d1").await.expect("rows");
    assert_eq!(rows[0].expected.as_deref(), Some("21"));
}

#[tokio::test]
async fn state_update_persists_and_reports() {
    let (ctx, store) = context().await;
    seed(&ctx, &[device("d1", &[])]).await;

    update_device_state(&ctx, "d1", "e9", "Online")
        .await
        .expect("state");

    let rows = store
        .query_device(DeviceColumn::Id, "d1")
        .await
        .expect("device");
    assert_eq!(rows[0].state, "online");
    assert!(!rows[0].last_online.is_empty());

    let sent = outbound(&drain(&ctx, WorkerKind::Comm).await);
    let result = find(&sent, &device_topic("d1", STATE_UPDATE_RESULT)).expect("result");
    assert_eq!(result["device"]["state"], "online");
    assert_eq!(result["event_id"], "e9");
    let report = find(&sent, &cloud_state_update("d1")).expect("cloud report");
    assert_eq!(report["state"], "online");
    assert_eq!(report["name"], "d1-name");

    let err = update_device_state(&ctx, "d1", "e10", "sleeping")
        .await
        .expect_err("bad state");
    assert_eq!(err.code().as_u16(), 400);
}

/// 设备表、设备行与设备锁三者一致。
async fn assert_membership_consistent(ctx: &TwinContext, store: &SqliteStore, ids: &[&str]) {
    for id in ids {
        let persisted = !store
            .query_device(DeviceColumn::Id, id)
            .await
            .expect("query")
            .is_empty();
        assert_eq!(ctx.is_device_exist(id), persisted, "{id} map vs rows");
        assert_eq!(ctx.has_mutex(id), persisted, "{id} mutex vs rows");
    }
}

#[tokio::test]
async fn full_refresh_replaces_membership() {
    let (ctx, store) = context().await;
    seed(
        &ctx,
        &[
            device("A", &[("t", string_twin(Some("1"), None, TwinVersion::new(1, 0)))]),
            device("B", &[]),
        ],
    )
    .await;

    let detail = MembershipDetail {
        base: BaseMessage::reply_to("e11"),
        devices: vec![
            device("B", &[("t", string_twin(Some("5"), None, TwinVersion::new(1, 0)))]),
            device("C", &[]),
        ],
    };
    full_refresh(&ctx, &detail).await.expect("refresh");

    let mut ids = ctx.device_ids();
    ids.sort();
    assert_eq!(ids, vec!["B".to_string(), "C".to_string()]);
    assert!(!ctx.has_mutex("A"));

    let sent = outbound(&drain(&ctx, WorkerKind::Comm).await);
    let topic = node_topic(common::NODE, MEMBERSHIP_UPDATED);
    let events: Vec<_> = sent
        .iter()
        .filter(|(_, resource, _)| *resource == topic)
        .map(|(_, _, value)| value)
        .collect();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["added_devices"][0]["id"], "C");
    assert_eq!(events[1]["removed_devices"][0]["id"], "A");

    // B 按 detail 合并
    let merged = ctx.get_device("B").expect("B");
    assert_eq!(merged.twin["t"].expected_value(), Some("5"));
    let rows = store.query_device_twin("B").await.expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].expected.as_deref(), Some("5"));

    assert!(store.query_device_twin("A").await.expect("query").is_empty());
    assert_membership_consistent(&ctx, &store, &["A", "B", "C"]).await;
}

#[tokio::test]
async fn add_and_remove_keep_map_rows_and_mutexes_aligned() {
    let (ctx, store) = context().await;
    let ids = ["A", "B", "C"];

    add_devices(&ctx, &[device("A", &[]), device("B", &[])], false, "e1")
        .await
        .expect("add");
    assert_membership_consistent(&ctx, &store, &ids).await;

    remove_devices(&ctx, &[device("A", &[]), device("C", &[])], "e2")
        .await
        .expect("remove");
    assert_membership_consistent(&ctx, &store, &ids).await;
    assert!(ctx.is_device_exist("B"));
    assert!(!ctx.is_device_exist("A"));

    add_devices(&ctx, &[device("A", &[]), device("C", &[])], false, "e3")
        .await
        .expect("re-add");
    assert_membership_consistent(&ctx, &store, &ids).await;
}

#[tokio::test]
async fn failed_add_leaves_no_trace() {
    let inner = memory_store().await;
    let flaky = Arc::new(FlakyStore::new(inner.clone()));
    let ctx = context_with(flaky.clone());
    flaky.set_failing(true);

    add_devices(&ctx, &[device("N", &[])], false, "e1")
        .await
        .expect_err("store failure");

    assert!(!ctx.is_device_exist("N"));
    assert!(!ctx.has_mutex("N"));
    assert!(drain(&ctx, WorkerKind::Comm).await.is_empty());
    assert_membership_consistent(&ctx, &inner, &["N"]).await;
}

#[tokio::test]
async fn state_get_waits_for_device_lock() {
    let (ctx, _store) = context().await;
    seed(&ctx, &[device("d1", &[])]).await;

    let guard = ctx.lock("d1").await.expect("lock");
    let reader = {
        let ctx = ctx.clone();
        tokio::spawn(async move { get_device_state(&ctx, "d1", "e1").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!reader.is_finished());
    assert!(drain(&ctx, WorkerKind::Comm).await.is_empty());

    drop(guard);
    reader.await.expect("join").expect("state get");
    let sent = outbound(&drain(&ctx, WorkerKind::Comm).await);
    let result = find(&sent, &device_topic("d1", STATE_GET_RESULT)).expect("result");
    assert_eq!(result["event_id"], "e1");
}

#[tokio::test]
async fn sync_applies_valid_twins_and_drops_invalid_ones() {
    let (ctx, store) = context().await;
    let mut number = string_twin(Some("1"), None, TwinVersion::new(1, 0));
    number.metadata = Some(TypeMetadata::of_type("int"));
    seed(
        &ctx,
        &[device(
            "d1",
            &[
                ("n", number),
                ("s", string_twin(Some("a"), None, TwinVersion::new(1, 0))),
            ],
        )],
    )
    .await;

    let incoming = twins(&[
        ("n", Some(expected_only("hot", Some(TwinVersion::new(2, 0))))),
        ("s", Some(expected_only("b", Some(TwinVersion::new(2, 0))))),
    ]);
    update_twin(&ctx, "d1", "e1", &incoming, DealType::Sync)
        .await
        .expect("partial sync");

    let snapshot = ctx.get_device("d1").expect("snapshot");
    assert_eq!(snapshot.twin["n"].expected_value(), Some("1"));
    assert_eq!(snapshot.twin["s"].expected_value(), Some("b"));

    let rows = store.query_device_twin("d1").await.expect("rows");
    let row = |name: &str| rows.iter().find(|row| row.name == name).expect("row");
    assert_eq!(row("n").expected.as_deref(), Some("1"));
    assert_eq!(version_of(row("n").expected_version.as_deref()), TwinVersion::new(1, 0));
    assert_eq!(row("s").expected.as_deref(), Some("b"));
    assert_eq!(version_of(row("s").expected_version.as_deref()), TwinVersion::new(2, 0));

    let sent = outbound(&drain(&ctx, WorkerKind::Comm).await);
    let delta = find(&sent, &device_topic("d1", TWIN_DELTA)).expect("delta");
    assert_eq!(delta["delta"]["s"], "b");
    assert_eq!(delta["delta"]["n"], "1");
}

fn tombstone(version: TwinVersion) -> MsgTwin {
    MsgTwin {
        optional: Some(true),
        metadata: Some(TypeMetadata::of_type("deleted")),
        expected_version: Some(version),
        ..MsgTwin::default()
    }
}

#[tokio::test]
async fn revived_tombstone_takes_incoming_or_string_type() {
    let (ctx, store) = context().await;
    seed(
        &ctx,
        &[device(
            "d1",
            &[
                ("plain", tombstone(TwinVersion::new(1, 0))),
                ("typed", tombstone(TwinVersion::new(1, 0))),
            ],
        )],
    )
    .await;

    let mut typed = expected_only("8", Some(TwinVersion::new(2, 0)));
    typed.metadata = Some(TypeMetadata::of_type("int"));
    let incoming = twins(&[
        ("plain", Some(expected_only("7", Some(TwinVersion::new(2, 0))))),
        ("typed", Some(typed)),
    ]);
    update_twin(&ctx, "d1", "e1", &incoming, DealType::Sync)
        .await
        .expect("revive");

    let snapshot = ctx.get_device("d1").expect("snapshot");
    assert_eq!(snapshot.twin["plain"].value_type(), "string");
    assert_eq!(snapshot.twin["plain"].expected_value(), Some("7"));
    assert_eq!(snapshot.twin["typed"].value_type(), "int");
    assert_eq!(snapshot.twin["typed"].expected_value(), Some("8"));

    let rows = store.query_device_twin("d1").await.expect("rows");
    let row = |name: &str| rows.iter().find(|row| row.name == name).expect("row");
    assert_eq!(row("plain").attr_type, "string");
    assert_eq!(row("typed").attr_type, "int");
    assert_eq!(row("typed").expected.as_deref(), Some("8"));
}
