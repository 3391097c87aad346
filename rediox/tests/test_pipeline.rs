mod support;

use rediox::{
    cmd, parse_addr, pipe, Connection, ConnectionConfig, ErrorKind, ExecOutcome, Value,
};
use rediox_test::{MockServer, ServerAction};

async fn connected(server: &MockServer, config: ConnectionConfig) -> Connection {
    let info = parse_addr(&server.url()).unwrap();
    let conn = Connection::connect(info, config);
    conn.wait_ready().await.unwrap();
    conn
}

#[tokio::test]
async fn batch_results_come_back_in_submission_order() {
    let server = MockServer::start(|_conn, args| match args[0].as_slice() {
        b"ECHO" => ServerAction::Reply(Value::BulkString(args[1].clone())),
        _ => ServerAction::Reply(Value::Okay),
    })
    .await;
    let conn = connected(&server, ConnectionConfig::default()).await;

    let pipeline = pipe()
        .add(cmd("ECHO").arg("one"))
        .add(cmd("ECHO").arg("two"))
        .add(cmd("ECHO").arg("three"));
    let results = pipeline.query(&conn).await.unwrap();
    let values: Vec<Value> = results.into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(
        values,
        vec![
            Value::BulkString(b"one".to_vec()),
            Value::BulkString(b"two".to_vec()),
            Value::BulkString(b"three".to_vec()),
        ]
    );
}

#[tokio::test]
async fn one_failing_member_does_not_abort_the_batch() {
    let server = MockServer::start(|_conn, args| match args[0].as_slice() {
        b"BAD" => ServerAction::RawReply(b"-ERR who is BAD\r\n".to_vec()),
        _ => ServerAction::Reply(Value::Okay),
    })
    .await;
    let conn = connected(&server, ConnectionConfig::default()).await;

    let results = pipe()
        .add(cmd("SET").arg("a").arg("1"))
        .add(cmd("BAD"))
        .add(cmd("SET").arg("b").arg("2"))
        .query(&conn)
        .await
        .unwrap();
    assert!(results[0].is_ok());
    assert_eq!(results[1].as_ref().unwrap_err().kind(), ErrorKind::ResponseError);
    assert!(results[2].is_ok());
}

#[tokio::test]
async fn transaction_executes_indivisibly() {
    let server = MockServer::start(|_conn, args| match args[0].as_slice() {
        b"MULTI" => ServerAction::Reply(Value::Okay),
        b"EXEC" => ServerAction::Reply(Value::Array(vec![
            Value::Okay,
            Value::BulkString(b"v".to_vec()),
        ])),
        _ => ServerAction::Reply(Value::SimpleString("QUEUED".into())),
    })
    .await;
    let conn = connected(&server, ConnectionConfig::default()).await;

    let outcome = pipe()
        .add(cmd("SET").arg("k").arg("v"))
        .add(cmd("GET").arg("k"))
        .atomic()
        .query_atomic(&conn)
        .await
        .unwrap();
    match outcome {
        ExecOutcome::Completed(results) => {
            assert_eq!(results.len(), 2);
            assert_eq!(results[0].as_ref().unwrap(), &Value::Okay);
            assert_eq!(
                results[1].as_ref().unwrap(),
                &Value::BulkString(b"v".to_vec())
            );
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(server.received_names(), vec!["MULTI", "SET", "GET", "EXEC"]);
}

#[tokio::test]
async fn server_side_abort_is_distinguished() {
    let server = MockServer::start(|_conn, args| match args[0].as_slice() {
        b"MULTI" => ServerAction::Reply(Value::Okay),
        // a watched key changed: EXEC replies nil and nothing ran
        b"EXEC" => ServerAction::Reply(Value::Nil),
        _ => ServerAction::Reply(Value::SimpleString("QUEUED".into())),
    })
    .await;
    let conn = connected(&server, ConnectionConfig::default()).await;

    let outcome = pipe()
        .add(cmd("SET").arg("k").arg("v"))
        .atomic()
        .query_atomic(&conn)
        .await
        .unwrap();
    assert!(matches!(outcome, ExecOutcome::Aborted));
}

#[tokio::test]
async fn interrupted_batch_fails_as_a_unit() {
    // the first connection answers one member then drops the link
    let server = MockServer::start(|conn, args| match (conn, args[0].as_slice()) {
        (0, b"SET") => ServerAction::ReplyThenHangup(Value::Okay),
        _ => ServerAction::Reply(Value::Okay),
    })
    .await;
    let conn = connected(&server, ConnectionConfig::default()).await;

    let err = pipe()
        .add(cmd("SET").arg("a").arg("1"))
        .add(cmd("SET").arg("b").arg("2"))
        .query(&conn)
        .await
        .unwrap_err();
    // no partial results: the whole batch reports the disconnect
    assert_eq!(err.kind(), ErrorKind::ConnectionClosed);
}

#[tokio::test]
async fn interrupted_batch_is_resubmitted_whole_when_opted_in() {
    let server = MockServer::start(|conn, args| match (conn, args[0].as_slice()) {
        (0, b"SET") => ServerAction::ReplyThenHangup(Value::Okay),
        _ => ServerAction::Reply(Value::Okay),
    })
    .await;
    let config = ConnectionConfig {
        resend_unacked: true,
        ..ConnectionConfig::default()
    };
    let conn = connected(&server, config).await;

    let results = pipe()
        .add(cmd("SET").arg("a").arg("1"))
        .add(cmd("SET").arg("b").arg("2"))
        .query(&conn)
        .await
        .unwrap();
    assert!(results.iter().all(|r| r.is_ok()));
    // the batch ran once truncated, then once whole
    let sets = server
        .received_names()
        .iter()
        .filter(|n| *n == "SET")
        .count();
    assert_eq!(sets, 3);
}
