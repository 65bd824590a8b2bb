use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use rustgtm::network::client::{BeginItem, GtmClient};
use rustgtm::network::protocol::{self, Message, Payload};
use rustgtm::storage::ControlFile;
use rustgtm::txn::{TransactionTable, TxnStatus};
use rustgtm::{Server, ServerOptions};

struct TestServer {
    addr: String,
    table: Arc<TransactionTable>,
    // Held so the data dir outlives the server.
    _data_dir: tempfile::TempDir,
}

async fn spawn_server(mut options: ServerOptions) -> TestServer {
    let data_dir = tempfile::tempdir().expect("tempdir failed");
    options.data_dir = data_dir.path().to_string_lossy().to_string();

    let server = Server::new(options).expect("server construction failed");
    let table = server.table();

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("local_addr failed").to_string();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    TestServer {
        addr,
        table,
        _data_dir: data_dir,
    }
}

async fn wait_until<F: Fn() -> bool>(cond: F, what: &str) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

#[tokio::test]
async fn test_begin_commit_happy_path() {
    let server = spawn_server(ServerOptions::default()).await;
    let mut client = GtmClient::connect(&server.addr).await.expect("connect failed");

    let (gxid, _timestamp) = client
        .begin_getgxid(2, false, "S1")
        .await
        .expect("begin failed");
    assert_eq!(client.get_next_gxid().await.expect("next failed"), gxid + 1);

    let snapshot = client.gxid_list().await.expect("list failed");
    assert_eq!(snapshot.open.len(), 1);
    assert_eq!(snapshot.open[0].gxid, gxid);

    let (echoed, status) = client.commit(gxid, &[]).await.expect("commit failed");
    assert_eq!(echoed, gxid);
    assert_eq!(status, TxnStatus::Ok);

    let snapshot = client.gxid_list().await.expect("list failed");
    assert!(snapshot.open.is_empty());
    assert_eq!(snapshot.latest_completed_gxid, gxid);
}

#[tokio::test]
async fn test_session_reuse() {
    let server = spawn_server(ServerOptions::default()).await;
    let mut client = GtmClient::connect(&server.addr).await.expect("connect failed");

    let (h1, _) = client.begin(2, false, "S1").await.expect("begin failed");
    let (h2, _) = client.begin(2, false, "S1").await.expect("begin failed");
    assert_eq!(h1, h2);

    // Bind a GXID to the session's transaction and finish it.
    let (gxid, _) = client
        .begin_getgxid(2, false, "S1")
        .await
        .expect("begin failed");
    let (_, status) = client.commit(gxid, &[]).await.expect("commit failed");
    assert_eq!(status, TxnStatus::Ok);

    let (h3, _) = client.begin(2, false, "S1").await.expect("begin failed");
    assert_ne!(h3, h1);
}

#[tokio::test]
async fn test_prepared_transaction_survives_disconnect() {
    let server = spawn_server(ServerOptions::default()).await;

    let (prepared_gxid, doomed_gxid) = {
        let mut client = GtmClient::connect(&server.addr).await.expect("connect failed");
        let (prepared_gxid, _) = client
            .begin_getgxid(2, false, "S1")
            .await
            .expect("begin failed");
        client
            .start_prepared(prepared_gxid, "GID-1", "dn1,dn2")
            .await
            .expect("start_prepared failed");
        client.prepare(prepared_gxid).await.expect("prepare failed");

        // A second, unprepared transaction on the same connection.
        let (doomed_gxid, _) = client
            .begin_getgxid(2, false, "S2")
            .await
            .expect("begin failed");
        (prepared_gxid, doomed_gxid)
        // Client drops here; the server reaps on disconnect.
    };

    let table = Arc::clone(&server.table);
    wait_until(
        || !table.is_gxid_in_progress(doomed_gxid),
        "disconnect reap to remove the unprepared transaction",
    )
    .await;
    assert!(table.is_gxid_in_progress(prepared_gxid));

    // A different client finishes the prepared transaction by GID.
    let mut other = GtmClient::connect(&server.addr).await.expect("connect failed");
    let (new_gxid, found_gxid, nodes) = other
        .get_gid_data(2, false, "GID-1")
        .await
        .expect("get_gid_data failed");
    assert_eq!(found_gxid, prepared_gxid);
    assert_eq!(nodes, "dn1,dn2");

    let (_, status) = other
        .commit_prepared(prepared_gxid, new_gxid, &[])
        .await
        .expect("commit_prepared failed");
    assert_eq!(status, TxnStatus::Ok);

    let snapshot = other.gxid_list().await.expect("list failed");
    assert!(snapshot.open.is_empty());
}

#[tokio::test]
async fn test_dependent_commit_delayed() {
    let server = spawn_server(ServerOptions::default()).await;
    let mut client = GtmClient::connect(&server.addr).await.expect("connect failed");

    let (g1, _) = client
        .begin_getgxid(2, false, "S1")
        .await
        .expect("begin failed");
    let (g2, _) = client
        .begin_getgxid(2, false, "S2")
        .await
        .expect("begin failed");

    let (_, status) = client.commit(g2, &[g1]).await.expect("commit failed");
    assert_eq!(status, TxnStatus::Delayed);
    assert_eq!(client.gxid_list().await.expect("list failed").open.len(), 2);

    let (_, status) = client.commit(g1, &[]).await.expect("commit failed");
    assert_eq!(status, TxnStatus::Ok);

    let (_, status) = client.commit(g2, &[g1]).await.expect("commit failed");
    assert_eq!(status, TxnStatus::Ok);
    assert!(client.gxid_list().await.expect("list failed").open.is_empty());
}

#[tokio::test]
async fn test_capacity_limit_and_recovery() {
    let server = spawn_server(ServerOptions {
        max_open: 4,
        ..ServerOptions::default()
    })
    .await;
    let mut client = GtmClient::connect(&server.addr).await.expect("connect failed");

    let mut gxids = Vec::new();
    for ii in 0..4 {
        let (gxid, _) = client
            .begin_getgxid(2, false, &format!("S{ii}"))
            .await
            .expect("begin failed");
        gxids.push(gxid);
    }

    let overflow = client.begin_getgxid(2, false, "S-overflow").await;
    assert!(overflow.is_err());

    let (_, status) = client.commit(gxids[0], &[]).await.expect("commit failed");
    assert_eq!(status, TxnStatus::Ok);

    let (gxid, _) = client
        .begin_getgxid(2, false, "S-overflow")
        .await
        .expect("begin after commit failed");
    assert!(gxid > gxids[3]);
    assert_eq!(client.gxid_list().await.expect("list failed").open.len(), 4);
}

#[tokio::test]
async fn test_control_record_checkpoint_cadence() {
    let data_dir = tempfile::tempdir().expect("tempdir failed");
    let dir_path = data_dir.path().to_string_lossy().to_string();

    let server = Server::new(ServerOptions {
        data_dir: dir_path.clone(),
        control_interval: 8,
        ..ServerOptions::default()
    })
    .expect("server construction failed");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("local_addr failed").to_string();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });

    let mut client = GtmClient::connect(&addr).await.expect("connect failed");
    let control = ControlFile::new(&dir_path).expect("control open failed");

    let mut observed = Vec::new();
    for ii in 0..20 {
        let (gxid, _) = client
            .begin_getgxid(2, false, &format!("S{ii}"))
            .await
            .expect("begin failed");
        client.commit(gxid, &[]).await.expect("commit failed");

        if let Some(value) = control.load().expect("control load failed") {
            if observed.last() != Some(&value) {
                observed.push(value);
            }
        }
    }

    // 20 advances with an interval of 8 must have checkpointed at least
    // twice, and the stored value never decreases.
    assert!(observed.len() >= 2, "control record updates: {observed:?}");
    assert!(observed.windows(2).all(|pair| pair[0] < pair[1]));
}

#[tokio::test]
async fn test_batched_begin_and_commit() {
    let server = spawn_server(ServerOptions::default()).await;
    let mut client = GtmClient::connect(&server.addr).await.expect("connect failed");

    let items: Vec<BeginItem> = (0..3)
        .map(|ii| BeginItem {
            isolation: 2,
            read_only: false,
            session_id: format!("S{ii}"),
            proxy_conn_id: ii,
        })
        .collect();
    let (gxids, _timestamp) = client
        .begin_getgxid_multi(&items)
        .await
        .expect("multi begin failed");
    assert_eq!(gxids.len(), 3);
    assert_eq!(client.gxid_list().await.expect("list failed").open.len(), 3);

    let statuses = client
        .commit_multi(&gxids)
        .await
        .expect("multi commit failed");
    assert_eq!(statuses, vec![TxnStatus::Ok; 3]);
    assert!(client.gxid_list().await.expect("list failed").open.is_empty());
}

#[tokio::test]
async fn test_rollback_and_autovacuum() {
    let server = spawn_server(ServerOptions::default()).await;
    let mut client = GtmClient::connect(&server.addr).await.expect("connect failed");

    let vacuum_gxid = client
        .begin_getgxid_autovacuum(2, false)
        .await
        .expect("autovacuum begin failed");
    let snapshot = client.gxid_list().await.expect("list failed");
    assert!(snapshot.open.iter().any(|t| t.gxid == vacuum_gxid && t.do_vacuum));

    let (_, status) = client.rollback(vacuum_gxid).await.expect("rollback failed");
    assert_eq!(status, TxnStatus::Ok);
    assert!(client.gxid_list().await.expect("list failed").open.is_empty());

    // Rolling back an unknown GXID is an error status, not a dropped
    // connection.
    let (_, status) = client.rollback(vacuum_gxid).await.expect("rollback failed");
    assert_eq!(status, TxnStatus::Error);
}

#[tokio::test]
async fn test_report_xmin_over_the_wire() {
    let server = spawn_server(ServerOptions::default()).await;
    let mut client = GtmClient::connect(&server.addr).await.expect("connect failed");

    let (gxid, _) = client
        .begin_getgxid(2, false, "S1")
        .await
        .expect("begin failed");

    let (latest, global, errcode) = client
        .report_xmin(gxid + 50, 1, "dn1")
        .await
        .expect("report failed");
    assert_eq!(errcode, 0);
    assert_eq!(global, gxid);
    assert!(latest < gxid);

    client.commit(gxid, &[]).await.expect("commit failed");
}

#[tokio::test]
async fn test_proxy_replies_carry_connection_header() {
    let server = spawn_server(ServerOptions::default()).await;

    let stream = tokio::net::TcpStream::connect(&server.addr)
        .await
        .expect("connect failed");
    let (mut reader, mut writer) = stream.into_split();

    // Register as a proxy with connection id 7.
    let mut hello = Message::new();
    let len_pos = hello.start(protocol::request::MSG_CLIENT_HELLO);
    hello.put_u8(protocol::peer::PROXY);
    hello.put_i32(7);
    hello.finish(len_pos);
    hello.send(&mut writer).await.expect("hello failed");

    let mut req = Message::new();
    let len_pos = req.start(protocol::request::TXN_GET_NEXT_GXID);
    req.finish(len_pos);
    req.send(&mut writer).await.expect("request failed");

    let (tag, payload) = protocol::read_message(&mut reader)
        .await
        .expect("read failed");
    assert_eq!(tag, protocol::result::TXN_GET_NEXT_GXID_RESULT);

    let mut cursor = Payload::new(&payload);
    assert_eq!(cursor.get_i32().expect("header missing"), 7);
    let next = cursor.get_u32().expect("gxid missing");
    assert!(next > 0);
}

#[tokio::test]
async fn test_standby_mirrors_primary_decisions() {
    let standby = spawn_server(ServerOptions {
        standby: true,
        ..ServerOptions::default()
    })
    .await;

    let primary = spawn_server(ServerOptions {
        standby_addr: Some(standby.addr.clone()),
        ..ServerOptions::default()
    })
    .await;

    let mut client = GtmClient::connect(&primary.addr).await.expect("connect failed");

    let (gxid, _) = client
        .begin_getgxid(2, false, "S1")
        .await
        .expect("begin failed");

    let standby_table = Arc::clone(&standby.table);
    wait_until(
        || standby_table.is_gxid_in_progress(gxid),
        "begin to reach the standby",
    )
    .await;

    // The standby's counter follows the received GXIDs.
    wait_until(
        || standby_table.read_next_gxid() == gxid + 1,
        "standby counter to advance",
    )
    .await;

    client
        .start_prepared(gxid, "GID-1", "dn1")
        .await
        .expect("start_prepared failed");
    client.prepare(gxid).await.expect("prepare failed");

    wait_until(
        || standby_table.handle_by_gid("GID-1").is_some(),
        "prepare to reach the standby",
    )
    .await;

    let (new_gxid, _, _) = client
        .get_gid_data(2, false, "GID-1")
        .await
        .expect("get_gid_data failed");
    let (_, status) = client
        .commit_prepared(gxid, new_gxid, &[])
        .await
        .expect("commit_prepared failed");
    assert_eq!(status, TxnStatus::Ok);

    wait_until(
        || standby_table.open_count() == 0,
        "commit to reach the standby",
    )
    .await;
}

#[tokio::test]
async fn test_standby_bootstrap_copies_primary_state() {
    let primary = spawn_server(ServerOptions::default()).await;
    let mut client = GtmClient::connect(&primary.addr).await.expect("connect failed");

    let (g1, _) = client
        .begin_getgxid(2, false, "S1")
        .await
        .expect("begin failed");
    let (g2, _) = client
        .begin_getgxid(2, false, "S2")
        .await
        .expect("begin failed");
    client
        .start_prepared(g1, "GID-1", "dn1")
        .await
        .expect("start_prepared failed");
    client.prepare(g1).await.expect("prepare failed");

    let standby_table = rustgtm::txn::TransactionTable::new(rustgtm::txn::TableOptions {
        standby: true,
        ..rustgtm::txn::TableOptions::default()
    });
    rustgtm::standby::bootstrap_from_primary(&standby_table, &primary.addr)
        .await
        .expect("bootstrap failed");

    let mut expected = vec![g1, g2];
    let mut actual = standby_table.open_gxids();
    expected.sort_unstable();
    actual.sort_unstable();
    assert_eq!(actual, expected);
    assert_eq!(
        standby_table.read_next_gxid(),
        client.get_next_gxid().await.expect("next failed")
    );
    assert!(standby_table.handle_by_gid("GID-1").is_some());
}

#[tokio::test]
async fn test_standby_refuses_to_mint_gxids() {
    let standby = spawn_server(ServerOptions {
        standby: true,
        ..ServerOptions::default()
    })
    .await;

    let mut client = GtmClient::connect(&standby.addr).await.expect("connect failed");
    let err = client.begin_getgxid(2, false, "S1").await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("standby"), "unexpected error: {message}");

    let err = client.gxid_list().await.unwrap_err();
    assert!(err.to_string().contains("standby"));
}
