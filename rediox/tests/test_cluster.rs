mod support;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use rediox::cluster::routing::key_slot;
use rediox::cluster::{ClusterConnection, ClusterOptions};
use rediox::{cmd, ErrorKind, Value};
use rediox_test::{MockServer, ServerAction};

fn node_entry(addr: &SocketAddr) -> Value {
    Value::Array(vec![
        Value::BulkString(addr.ip().to_string().into_bytes()),
        Value::Int(addr.port() as i64),
        Value::BulkString(b"0123456789012345678901234567890123456789".to_vec()),
    ])
}

/// A `CLUSTER SLOTS` reply assigning the whole key space to one node.
fn slots_all(addr: &SocketAddr) -> Value {
    Value::Array(vec![Value::Array(vec![
        Value::Int(0),
        Value::Int(16383),
        node_entry(addr),
    ])])
}

/// A shared, swappable topology answer for the mock handlers.
type SharedSlots = Arc<Mutex<Value>>;

fn cluster_handler(
    slots: SharedSlots,
    on_get: impl Fn(usize, &[Vec<u8>]) -> ServerAction + Send + Sync + 'static,
) -> impl Fn(usize, &[Vec<u8>]) -> ServerAction + Send + Sync + 'static {
    move |conn, args| match args[0].to_ascii_uppercase().as_slice() {
        b"CLUSTER" => ServerAction::Reply(slots.lock().unwrap().clone()),
        b"ASKING" => ServerAction::Reply(Value::Okay),
        _ => on_get(conn, args),
    }
}

async fn two_node_setup(
    a_get: impl Fn(usize, &[Vec<u8>]) -> ServerAction + Send + Sync + 'static,
    b_get: impl Fn(usize, &[Vec<u8>]) -> ServerAction + Send + Sync + 'static,
) -> (MockServer, MockServer, SharedSlots) {
    let slots: SharedSlots = Arc::new(Mutex::new(Value::Nil));
    let a = MockServer::start(cluster_handler(slots.clone(), a_get)).await;
    let b = MockServer::start(cluster_handler(slots.clone(), b_get)).await;
    // initial topology: node A owns everything
    *slots.lock().unwrap() = slots_all(&a.addr());
    (a, b, slots)
}

#[tokio::test]
async fn cross_slot_commands_are_rejected_before_send() {
    let (a, b, _slots) = two_node_setup(
        |_c, _a| ServerAction::Reply(Value::Okay),
        |_c, _a| ServerAction::Reply(Value::Okay),
    )
    .await;
    let cluster = ClusterConnection::connect(ClusterOptions::new(vec![a.url()]).unwrap())
        .await
        .unwrap();

    // "foo" and "bar" live in different slots
    let err = cluster
        .call(cmd("MGET").arg("foo").arg("bar"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CrossSlot);

    // zero bytes reached either node
    assert!(!a.received_names().iter().any(|n| n == "MGET"));
    assert!(!b.received_names().iter().any(|n| n == "MGET"));
}

#[tokio::test]
async fn moved_repoints_exactly_one_slot() {
    let slot = key_slot(b"foo");
    let moved_line: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
    let line = moved_line.clone();
    let (a, b, _slots) = two_node_setup(
        move |_c, args| match args[0].as_slice() {
            b"GET" => ServerAction::RawReply(line.lock().unwrap().clone().into_bytes()),
            _ => ServerAction::Reply(Value::Okay),
        },
        |_c, args| match args[0].as_slice() {
            b"GET" => ServerAction::Reply(Value::BulkString(b"v".to_vec())),
            _ => ServerAction::Reply(Value::Okay),
        },
    )
    .await;
    *moved_line.lock().unwrap() = format!("-MOVED {slot} 127.0.0.1:{}\r\n", b.addr().port());

    let cluster = ClusterConnection::connect(ClusterOptions::new(vec![a.url()]).unwrap())
        .await
        .unwrap();
    let value = cluster.call(cmd("GET").arg("foo")).await.unwrap();
    assert_eq!(value, Value::BulkString(b"v".to_vec()));

    // only the redirected slot changed owner
    let table = cluster.slot_table();
    assert_eq!(&*table.lookup(slot).unwrap().master, b.host_port().as_str());
    let other_slot = key_slot(b"bar");
    assert_eq!(
        &*table.lookup(other_slot).unwrap().master,
        a.host_port().as_str()
    );
}

#[tokio::test]
async fn ask_is_followed_but_not_persisted() {
    let slot = key_slot(b"foo");
    let ask_line: Arc<Mutex<String>> = Arc::new(Mutex::new(String::new()));
    let line = ask_line.clone();
    let (a, b, _slots) = two_node_setup(
        move |_c, args| match args[0].as_slice() {
            b"GET" => ServerAction::RawReply(line.lock().unwrap().clone().into_bytes()),
            _ => ServerAction::Reply(Value::Okay),
        },
        |_c, args| match args[0].as_slice() {
            b"GET" => ServerAction::Reply(Value::BulkString(b"v".to_vec())),
            _ => ServerAction::Reply(Value::Okay),
        },
    )
    .await;
    *ask_line.lock().unwrap() = format!("-ASK {slot} 127.0.0.1:{}\r\n", b.addr().port());

    let cluster = ClusterConnection::connect(ClusterOptions::new(vec![a.url()]).unwrap())
        .await
        .unwrap();
    let value = cluster.call(cmd("GET").arg("foo")).await.unwrap();
    assert_eq!(value, Value::BulkString(b"v".to_vec()));

    // the one-shot asking marker preceded the command on the target node
    let b_names = b.received_names();
    let asking_pos = b_names.iter().position(|n| n == "ASKING").unwrap();
    let get_pos = b_names.iter().position(|n| n == "GET").unwrap();
    assert!(asking_pos < get_pos);

    // advisory only: the table still points at the original owner
    let table = cluster.slot_table();
    assert_eq!(&*table.lookup(slot).unwrap().master, a.host_port().as_str());
}

#[tokio::test]
async fn redirect_following_is_bounded() {
    let ceiling = 5u32;
    let lines: Arc<Mutex<(String, String)>> =
        Arc::new(Mutex::new((String::new(), String::new())));
    let a_line = lines.clone();
    let b_line = lines.clone();
    let (a, b, _slots) = two_node_setup(
        move |_c, args| match args[0].as_slice() {
            b"GET" => ServerAction::RawReply(a_line.lock().unwrap().0.clone().into_bytes()),
            _ => ServerAction::Reply(Value::Okay),
        },
        move |_c, args| match args[0].as_slice() {
            b"GET" => ServerAction::RawReply(b_line.lock().unwrap().1.clone().into_bytes()),
            _ => ServerAction::Reply(Value::Okay),
        },
    )
    .await;
    let slot = key_slot(b"foo");
    // a pathological cluster that bounces the slot back and forth forever
    *lines.lock().unwrap() = (
        format!("-MOVED {slot} 127.0.0.1:{}\r\n", b.addr().port()),
        format!("-MOVED {slot} 127.0.0.1:{}\r\n", a.addr().port()),
    );

    let mut options = ClusterOptions::new(vec![a.url()]).unwrap();
    options.max_redirections = ceiling;
    let cluster = ClusterConnection::connect(options).await.unwrap();

    let err = cluster.call(cmd("GET").arg("foo")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ClusterDown);

    let transmissions = a.received_names().iter().filter(|n| *n == "GET").count()
        + b.received_names().iter().filter(|n| *n == "GET").count();
    assert_eq!(transmissions as u32, ceiling);
}

#[tokio::test]
async fn refresh_replaces_the_table_wholesale() {
    let (a, b, slots) = two_node_setup(
        |_c, _a| ServerAction::Reply(Value::BulkString(b"from-a".to_vec())),
        |_c, _a| ServerAction::Reply(Value::BulkString(b"from-b".to_vec())),
    )
    .await;
    let cluster = ClusterConnection::connect(ClusterOptions::new(vec![a.url()]).unwrap())
        .await
        .unwrap();

    // every slot resolves inside the initial table
    let table = cluster.slot_table();
    for slot in [0u16, 1, 8191, 8192, 16383] {
        assert_eq!(&*table.lookup(slot).unwrap().master, a.host_port().as_str());
    }

    // the topology moves wholesale to node B
    *slots.lock().unwrap() = slots_all(&b.addr());
    cluster.refresh_slots().await.unwrap();

    let table = cluster.slot_table();
    for slot in 0..16384u16 {
        assert_eq!(
            &*table.lookup(slot).unwrap().master,
            b.host_port().as_str(),
            "slot {slot} still points at the old topology"
        );
    }

    let value = cluster.call(cmd("GET").arg("foo")).await.unwrap();
    assert_eq!(value, Value::BulkString(b"from-b".to_vec()));
}

#[tokio::test]
async fn keyless_commands_route_to_some_node() {
    let (a, _b, _slots) = two_node_setup(
        |_c, _a| ServerAction::Reply(Value::Okay),
        |_c, _a| ServerAction::Reply(Value::Okay),
    )
    .await;
    let cluster = ClusterConnection::connect(ClusterOptions::new(vec![a.url()]).unwrap())
        .await
        .unwrap();
    let value = cluster.call(cmd("PING")).await.unwrap();
    assert_eq!(value, Value::SimpleString("PONG".into()));
}

#[tokio::test]
async fn pipelines_route_by_their_shared_slot() {
    let (a, _b, _slots) = two_node_setup(
        |_c, args| match args[0].as_slice() {
            b"GET" => ServerAction::Reply(Value::BulkString(b"v".to_vec())),
            _ => ServerAction::Reply(Value::Okay),
        },
        |_c, _a| ServerAction::Reply(Value::Okay),
    )
    .await;
    let cluster = ClusterConnection::connect(ClusterOptions::new(vec![a.url()]).unwrap())
        .await
        .unwrap();

    let results = cluster
        .execute_pipeline(
            &rediox::pipe()
                .add(cmd("SET").arg("{t}x").arg("1"))
                .add(cmd("GET").arg("{t}x")),
        )
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.is_ok()));

    let err = cluster
        .execute_pipeline(
            &rediox::pipe()
                .add(cmd("SET").arg("foo").arg("1"))
                .add(cmd("GET").arg("bar")),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CrossSlot);
}
