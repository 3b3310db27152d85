//! End-to-end scenarios against the in-process mock server: standalone
//! GET/SET, cluster MOVED handoff, multi-slot fan-out, atomic batches, and
//! the admission/backpressure boundary behaviours.

mod support;

use std::sync::Arc;
use std::time::Duration;

use resp_cluster_client::{
    Batch, BatchMode, Client, ClientConfig, Command, CommandKind, MultiKeyPattern,
    ProtocolVersion, RedisCoreError, SlotRange, Value,
};

use support::mock_server::{array, bulk, ok, queued, MockServer, Reply};

fn standalone_config(addr: std::net::SocketAddr) -> ClientConfig {
    ClientConfig {
        addresses: vec![addr],
        cluster_mode: false,
        protocol: ProtocolVersion::Resp2,
        ..ClientConfig::default()
    }
}

#[tokio::test]
async fn standalone_get_set_round_trips() {
    let server = MockServer::start(Arc::new(|_conn_id, args| match args[0].as_slice() {
        b"SET" => Reply::Send(ok()),
        b"GET" => Reply::Send(bulk("bar")),
        _ => Reply::Send(ok()),
    }))
    .await;

    let client = Client::new(standalone_config(server.addr)).await.unwrap();

    let set = Command::new(CommandKind::SingleKey).arg("SET").arg("foo").arg("bar");
    let reply = client.execute(set, None).await.unwrap();
    assert_eq!(reply, Value::Ok);

    let get = Command::new(CommandKind::SingleKey).arg("GET").arg("foo");
    let reply = client.execute(get, None).await.unwrap();
    assert_eq!(reply, Value::Bulk(b"bar".to_vec()));
}

#[tokio::test]
async fn cluster_moved_handoff_follows_redirect() {
    let moved_to = Arc::new(tokio::sync::OnceCell::<std::net::SocketAddr>::new());
    let moved_to_a = moved_to.clone();
    let server_a = MockServer::start(Arc::new(move |_conn_id, args| match args[0].as_slice() {
        b"GET" => {
            let target = moved_to_a.get().expect("node B address set before use");
            Reply::Send(support::mock_server::error("MOVED", &format!("12182 {target}")))
        }
        _ => Reply::Send(ok()),
    }))
    .await;

    let server_b = MockServer::start(Arc::new(|_conn_id, args| match args[0].as_slice() {
        b"GET" => Reply::Send(bulk("v1")),
        _ => Reply::Send(ok()),
    }))
    .await;
    moved_to.set(server_b.addr).unwrap();

    let mut config = ClientConfig {
        addresses: vec![server_a.addr],
        cluster_mode: true,
        protocol: ProtocolVersion::Resp2,
        ..ClientConfig::default()
    };
    config.lazy_connect = true;

    let client = Client::new(config).await.unwrap();
    client
        .slot_map()
        .publish(vec![SlotRange {
            start: 0,
            end: 16383,
            primary: server_a.addr,
            replicas: vec![],
        }])
        .unwrap();

    let get = Command::new(CommandKind::SingleKey).arg("GET").arg("user:1");
    let reply = client.execute(get, None).await.unwrap();
    assert_eq!(reply, Value::Bulk(b"v1".to_vec()));
    assert_eq!(client.get_stats().redirects, 1);
}

#[tokio::test]
async fn multi_slot_mget_combines_all_keys() {
    let key_a = b"{grp1}a".to_vec();
    let key_b = b"{grp1}b".to_vec();
    let key_c = b"{grp2}c".to_vec();

    let slot_ab = resp_cluster_client::key_slot(&key_a);
    let slot_c = resp_cluster_client::key_slot(&key_c);
    assert_ne!(slot_ab, slot_c, "fixture keys must land in different slots");

    let server_x = MockServer::start(Arc::new(|_conn_id, args| mget_echo(args))).await;
    let server_y = MockServer::start(Arc::new(|_conn_id, args| mget_echo(args))).await;

    let mut config = ClientConfig {
        addresses: vec![server_x.addr],
        cluster_mode: true,
        protocol: ProtocolVersion::Resp2,
        ..ClientConfig::default()
    };
    config.lazy_connect = true;
    let client = Client::new(config).await.unwrap();

    let (low, high) = if slot_ab < slot_c {
        (
            SlotRange { start: 0, end: slot_ab, primary: server_x.addr, replicas: vec![] },
            SlotRange { start: slot_ab + 1, end: 16383, primary: server_y.addr, replicas: vec![] },
        )
    } else {
        (
            SlotRange { start: 0, end: slot_c, primary: server_y.addr, replicas: vec![] },
            SlotRange { start: slot_c + 1, end: 16383, primary: server_x.addr, replicas: vec![] },
        )
    };
    client.slot_map().publish(vec![low, high]).unwrap();

    let mget = Command::new(CommandKind::MultiSlotPattern(MultiKeyPattern::KeysOnly))
        .arg("MGET")
        .arg(key_a.clone())
        .arg(key_b.clone())
        .arg(key_c.clone());

    let reply = client.execute(mget, None).await.unwrap();
    let items = match reply {
        Value::Array(items) => items,
        other => panic!("expected array, got {other:?}"),
    };
    let mut got: Vec<Vec<u8>> = items
        .into_iter()
        .map(|v| match v {
            Value::Bulk(b) => b,
            other => panic!("expected bulk, got {other:?}"),
        })
        .collect();
    got.sort();
    let mut want = vec![key_a, key_b, key_c];
    want.sort();
    assert_eq!(got, want);
}

fn mget_echo(args: &[Vec<u8>]) -> Reply {
    match args[0].as_slice() {
        b"MGET" => {
            let parts: Vec<Vec<u8>> = args[1..]
                .iter()
                .map(|key| bulk(&String::from_utf8_lossy(key)))
                .collect();
            Reply::Send(array(&parts))
        }
        _ => Reply::Send(ok()),
    }
}

#[tokio::test]
async fn atomic_batch_runs_multi_exec_on_one_node() {
    let server = MockServer::start(Arc::new(|_conn_id, args| match args[0].as_slice() {
        b"MULTI" => Reply::Send(ok()),
        b"SET" | b"GET" => Reply::Send(queued()),
        b"EXEC" => Reply::Send(array(&[ok(), bulk("1")])),
        _ => Reply::Send(ok()),
    }))
    .await;

    let mut config = standalone_config(server.addr);
    config.lazy_connect = false;
    let client = Client::new(config).await.unwrap();

    let batch = Batch::new(BatchMode::Atomic)
        .add(Command::new(CommandKind::SingleKey).arg("SET").arg("k").arg("1"))
        .add(Command::new(CommandKind::SingleKey).arg("GET").arg("k"));

    let results = client.execute_batch(&batch, true).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].as_ref().unwrap(), &Value::Ok);
    assert_eq!(results[1].as_ref().unwrap(), &Value::Bulk(b"1".to_vec()));
}

#[tokio::test]
async fn atomic_batch_rejects_cross_slot_keys_without_sending_anything() {
    let mut config = ClientConfig {
        addresses: vec!["127.0.0.1:1".parse().unwrap()],
        cluster_mode: true,
        protocol: ProtocolVersion::Resp2,
        ..ClientConfig::default()
    };
    config.lazy_connect = true;
    let client = Client::new(config).await.unwrap();

    let key1 = b"{s1}k".to_vec();
    let key2 = b"{s2}k".to_vec();
    assert_ne!(resp_cluster_client::key_slot(&key1), resp_cluster_client::key_slot(&key2));

    let batch = Batch::new(BatchMode::Atomic)
        .add(Command::new(CommandKind::SingleKey).arg("SET").arg(key1).arg("v1"))
        .add(Command::new(CommandKind::SingleKey).arg("SET").arg(key2).arg("v2"));

    let result = client.execute_batch(&batch, false).await;
    assert!(matches!(result, Err(RedisCoreError::CrossSlot)));
}

#[tokio::test]
async fn per_client_inflight_cap_rejects_excess_registrations() {
    let server = MockServer::start(Arc::new(|_conn_id, args| match args[0].as_slice() {
        b"BLPOP" => Reply::Silent,
        _ => Reply::Send(ok()),
    }))
    .await;

    let mut config = standalone_config(server.addr);
    config.max_inflight_per_client = 2;
    let client = Client::new(config).await.unwrap();

    let blpop = Command::new(CommandKind::SingleKey)
        .arg("BLPOP")
        .arg("list")
        .arg("0")
        .blocking(true);

    let c1 = client.clone();
    let b1 = blpop.clone();
    let h1 = tokio::spawn(async move { c1.execute(b1, None).await });
    let c2 = client.clone();
    let b2 = blpop.clone();
    let h2 = tokio::spawn(async move { c2.execute(b2, None).await });

    tokio::time::sleep(Duration::from_millis(100)).await;

    let third = client.execute(blpop, None).await;
    assert!(matches!(third, Err(RedisCoreError::ClientInflightExceeded { .. })));

    h1.abort();
    h2.abort();
}
