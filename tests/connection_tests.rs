//! Connection lifecycle and reply correlation against a scripted server

mod common;

use common::{BrokenConnector, MockConnector};
use redis_relay::{cmd, Connection, ConnectionConfig, ConnectionState, RedisError, RespValue};
use std::time::Duration;

fn connection(config: ConnectionConfig) -> (Connection, std::sync::Arc<MockConnector>, common::Accepts) {
    let (connector, accepts) = MockConnector::new();
    (Connection::with_connector(config, connector.clone()), connector, accepts)
}

#[tokio::test]
async fn test_concurrent_callers_get_their_own_replies() {
    let (conn, connector, accepts) = connection(ConnectionConfig::default());

    let mut tasks = Vec::new();
    for i in 0..50 {
        let conn = conn.clone();
        tasks.push(tokio::spawn(async move {
            let reply = conn.send(&cmd!("ECHO", i)).await.unwrap();
            assert_eq!(reply.as_string().unwrap(), i.to_string());
        }));
    }

    let mut server = accepts.next().await;
    for _ in 0..50 {
        let command = server.read_command().await.unwrap();
        assert_eq!(command[0], "ECHO");
        let payload = &command[1];
        server
            .reply(format!("${}\r\n{}\r\n", payload.len(), payload).as_bytes())
            .await;
    }

    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(connector.connects(), 1);
    assert_eq!(conn.pending_replies(), 0);
}

#[tokio::test]
async fn test_handshake_precedes_commands() {
    let config = ConnectionConfig::default()
        .with_password("secret")
        .with_database(3);
    let (conn, _connector, accepts) = connection(config);

    let caller = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.send(&cmd!("GET", "k")).await })
    };

    let mut server = accepts.next().await;
    server.expect(&["AUTH", "secret"]).await;
    server.expect(&["SELECT", "3"]).await;
    // the caller's command waits for the handshake replies
    assert!(server.silent_for(Duration::from_millis(100)).await);
    assert_eq!(conn.state(), ConnectionState::Handshaking);

    server.ok().await;
    server.ok().await;
    server.expect(&["GET", "k"]).await;
    server.reply(b"$1\r\nv\r\n").await;

    assert_eq!(caller.await.unwrap().unwrap(), RespValue::from("v"));
    assert!(conn.is_connected());
}

#[tokio::test]
async fn test_auth_with_username() {
    let config = ConnectionConfig::default()
        .with_username("app")
        .with_password("pw");
    let (conn, _connector, accepts) = connection(config);

    let connect = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.connect().await })
    };
    let mut server = accepts.next().await;
    server.expect(&["AUTH", "app", "pw"]).await;
    server.ok().await;
    connect.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_rejected_auth_fails_connect() {
    let (conn, _connector, accepts) = connection(ConnectionConfig::default().with_password("wrong"));

    let caller = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.send(&cmd!("PING")).await })
    };
    let mut server = accepts.next().await;
    server.expect(&["AUTH", "wrong"]).await;
    server.reply(b"-WRONGPASS invalid username-password pair\r\n").await;

    match caller.await.unwrap() {
        Err(RedisError::Auth(msg)) => assert!(msg.starts_with("WRONGPASS")),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert!(server.hung_up().await);
}

#[tokio::test]
async fn test_error_reply_keeps_connection() {
    let (conn, connector, accepts) = connection(ConnectionConfig::default());

    let first = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.send(&cmd!("NOPE")).await })
    };
    let mut server = accepts.next().await;
    server.expect(&["NOPE"]).await;
    server.reply(b"-ERR unknown command 'NOPE'\r\n").await;

    match first.await.unwrap() {
        Err(RedisError::Server(msg)) => assert_eq!(msg, "ERR unknown command 'NOPE'"),
        other => panic!("unexpected {other:?}"),
    }
    assert!(conn.is_connected());

    let second = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.send(&cmd!("PING")).await })
    };
    server.expect(&["PING"]).await;
    server.reply(b"+PONG\r\n").await;
    assert_eq!(second.await.unwrap().unwrap(), RespValue::from("PONG"));
    assert_eq!(connector.connects(), 1);
}

#[tokio::test]
async fn test_malformed_reply_rejects_every_pending_request() {
    let (conn, _connector, accepts) = connection(ConnectionConfig::default());

    // connect first so the three writes land on one socket
    let connect = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.connect().await })
    };
    let mut server = accepts.next().await;
    connect.await.unwrap().unwrap();

    let a = conn.send_pipelined(&cmd!("A")).await.unwrap();
    let b = conn.send_pipelined(&cmd!("B")).await.unwrap();
    let c = conn.send_pipelined(&cmd!("C")).await.unwrap();
    assert_eq!(conn.pending_replies(), 3);

    server.expect(&["A"]).await;
    server.expect(&["B"]).await;
    server.expect(&["C"]).await;
    server.reply(b"+OK\r\n?garbage\r\n").await;

    assert!(a.await.unwrap().is_ok());
    assert!(matches!(b.await, Err(RedisError::Protocol(_))));
    assert!(matches!(c.await, Err(RedisError::Protocol(_))));
    assert!(server.hung_up().await);
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_reconnects_after_server_hangs_up() {
    let (conn, connector, accepts) = connection(ConnectionConfig::default());

    let pending = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.send(&cmd!("BLPOP", "q", 0)).await })
    };
    let mut server = accepts.next().await;
    server.expect(&["BLPOP", "q", "0"]).await;
    drop(server);

    assert!(matches!(
        pending.await.unwrap(),
        Err(RedisError::Closed { .. }) | Err(RedisError::Io(_))
    ));

    let retry = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.send(&cmd!("PING")).await })
    };
    let mut server = accepts.next().await;
    server.expect(&["PING"]).await;
    server.reply(b"+PONG\r\n").await;
    assert!(retry.await.unwrap().is_ok());
    assert_eq!(connector.connects(), 2);
}

#[tokio::test]
async fn test_close_rejects_pending_and_reconnects_lazily() {
    let (conn, connector, accepts) = connection(ConnectionConfig::default());

    let pending = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.send(&cmd!("BLPOP", "q", 0)).await })
    };
    let mut server = accepts.next().await;
    server.expect(&["BLPOP", "q", "0"]).await;

    conn.close(None).await;
    conn.close(None).await;
    assert!(matches!(
        pending.await.unwrap(),
        Err(RedisError::Closed { .. })
    ));
    assert!(server.hung_up().await);
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert!(accepts.none_within(Duration::from_millis(50)).await);
    assert_eq!(connector.connects(), 1);
}

#[tokio::test]
async fn test_send_once_closes_after_reply() {
    let (conn, _connector, accepts) = connection(ConnectionConfig::default());

    let caller = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.send_once(&cmd!("PING")).await })
    };
    let mut server = accepts.next().await;
    server.expect(&["PING"]).await;
    server.reply(b"+PONG\r\n").await;

    assert_eq!(caller.await.unwrap().unwrap(), RespValue::from("PONG"));
    assert!(server.hung_up().await);
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_concurrent_callers_share_one_connect_attempt() {
    let (conn, connector, accepts) = connection(ConnectionConfig::default().with_password("pw"));

    let a = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.send(&cmd!("PING")).await })
    };
    let b = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.send(&cmd!("PING")).await })
    };

    let mut server = accepts.next().await;
    server.expect(&["AUTH", "pw"]).await;
    server.ok().await;
    server.expect(&["PING"]).await;
    server.expect(&["PING"]).await;
    server.reply(b"+PONG\r\n+PONG\r\n").await;

    assert!(a.await.unwrap().is_ok());
    assert!(b.await.unwrap().is_ok());
    assert_eq!(connector.connects(), 1);
}

#[tokio::test]
async fn test_connect_failure_is_reported_and_retryable() {
    let (conn, connector, accepts) = connection(ConnectionConfig::default());
    connector.refuse(true);

    assert!(matches!(
        conn.send(&cmd!("PING")).await,
        Err(RedisError::Connection(_))
    ));
    assert_eq!(conn.state(), ConnectionState::Disconnected);

    connector.refuse(false);
    let retry = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.send(&cmd!("PING")).await })
    };
    let mut server = accepts.next().await;
    server.expect(&["PING"]).await;
    server.reply(b"+PONG\r\n").await;
    assert!(retry.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_fragmented_replies_are_reassembled() {
    let (conn, _connector, accepts) = connection(ConnectionConfig::default());

    let caller = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.send(&cmd!("LRANGE", "l", 0, -1)).await })
    };
    let mut server = accepts.next().await;
    server.expect(&["LRANGE", "l", "0", "-1"]).await;
    for piece in [&b"*2\r\n$3"[..], b"\r\nfo", b"o\r\n:4", b"2\r\n"] {
        server.reply(piece).await;
        tokio::task::yield_now().await;
    }

    assert_eq!(
        caller.await.unwrap().unwrap(),
        RespValue::Array(vec![RespValue::from("foo"), RespValue::Integer(42)])
    );
}

#[tokio::test]
async fn test_abandoned_send_keeps_replies_aligned() {
    let (connector, accepts) = MockConnector::with_capacity(64);
    let conn = Connection::with_connector(ConnectionConfig::default(), connector);

    let connect = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.connect().await })
    };
    let mut server = accepts.next().await;
    connect.await.unwrap().unwrap();

    // fills the pipe, so the next command sits behind it
    let payload = "x".repeat(4096);
    let echo = {
        let conn = conn.clone();
        let payload = payload.clone();
        tokio::spawn(async move { conn.send(&cmd!("ECHO", payload)).await })
    };
    while conn.pending_replies() == 0 {
        tokio::task::yield_now().await;
    }
    assert!(tokio::time::timeout(Duration::from_millis(50), conn.send(&cmd!("GET", "a")))
        .await
        .is_err());

    let ping = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.send(&cmd!("PING")).await })
    };

    server.expect(&["ECHO", payload.as_str()]).await;
    server.expect(&["GET", "a"]).await;
    server.expect(&["PING"]).await;
    server
        .reply(format!("${}\r\n{}\r\n", payload.len(), payload).as_bytes())
        .await;
    server.reply(b"$1\r\n1\r\n+PONG\r\n").await;

    assert_eq!(echo.await.unwrap().unwrap(), RespValue::from(payload.as_str()));
    assert_eq!(ping.await.unwrap().unwrap(), RespValue::from("PONG"));
    assert_eq!(conn.pending_replies(), 0);
}

#[tokio::test]
async fn test_close_does_not_wait_for_blocked_write() {
    let (connector, accepts) = MockConnector::with_capacity(64);
    let conn = Connection::with_connector(ConnectionConfig::default(), connector);

    let pending = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.send(&cmd!("SET", "k", "v".repeat(500))).await })
    };
    let mut server = accepts.next().await;
    // the server never reads, so the write stays blocked
    tokio::time::sleep(Duration::from_millis(20)).await;

    tokio::time::timeout(Duration::from_secs(1), conn.close(None))
        .await
        .expect("close waited for the blocked write");
    assert!(matches!(
        pending.await.unwrap(),
        Err(RedisError::Closed { .. })
    ));
    assert!(server.hung_up().await);
    assert_eq!(conn.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_write_failure_rejects_the_batch_and_disconnects() {
    let conn = Connection::with_connector(ConnectionConfig::default(), std::sync::Arc::new(BrokenConnector));

    match conn.send(&cmd!("PING")).await {
        Err(RedisError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::BrokenPipe),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(conn.state(), ConnectionState::Disconnected);

    let results = conn
        .send_batch(&[cmd!("SET", "a", 1), cmd!("SET", "b", 2), cmd!("GET", "a")])
        .await
        .unwrap();
    assert_eq!(results.len(), 3);
    for result in results {
        assert!(matches!(result, Err(RedisError::Io(_))));
    }
    assert_eq!(conn.pending_replies(), 0);
}

#[tokio::test]
async fn test_dropped_reply_future_keeps_later_replies_aligned() {
    let (conn, _connector, accepts) = connection(ConnectionConfig::default());

    let connect = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.connect().await })
    };
    let mut server = accepts.next().await;
    connect.await.unwrap().unwrap();

    let a = conn.send_pipelined(&cmd!("GET", "a")).await.unwrap();
    let b = conn.send_pipelined(&cmd!("GET", "b")).await.unwrap();
    let c = conn.send_pipelined(&cmd!("GET", "c")).await.unwrap();
    drop(b);

    server.expect(&["GET", "a"]).await;
    server.expect(&["GET", "b"]).await;
    server.expect(&["GET", "c"]).await;
    server.reply(b"$1\r\nA\r\n$1\r\nB\r\n$1\r\nC\r\n").await;

    assert_eq!(a.await.unwrap(), RespValue::from("A"));
    assert_eq!(c.await.unwrap(), RespValue::from("C"));
    assert!(conn.is_connected());
}
