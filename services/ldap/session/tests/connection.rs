//! Connection lifecycle, multiplexing and dispatch against a scripted server.

mod common;

use bytes::Bytes;
use common::*;
use ldap_session::{
    BindInitializer, Connection, ConnectionState, Intermediate, LdapError,
};
use ldap_wire::{
    Attribute, BindRequest, ExtendedResponse, Filter, LdapResult, Message, Request, Response,
    ResultCode, SearchEntry, SearchRequest, SearchScope, NOTICE_OF_DISCONNECTION_OID,
};
use std::time::Duration;

fn search(base: &str) -> Request {
    Request::Search(SearchRequest::new(
        base,
        SearchScope::Subtree,
        Filter::present("objectClass"),
    ))
}

fn entry_for(id: i32) -> SearchEntry {
    SearchEntry {
        dn: format!("cn={},dc=example,dc=com", id),
        attributes: vec![Attribute::new("cn", [id.to_string()])],
    }
}

/// Answers searches with one entry named after the message ID
fn directory(request: &ldap_wire::RequestMessage) -> Reply {
    match &request.op {
        Request::Search(_) => Reply::Respond(vec![
            Message::new(
                request.message_id,
                Response::SearchEntry(entry_for(request.message_id)),
            ),
            Message::new(
                request.message_id,
                Response::SearchDone(LdapResult::success()),
            ),
        ]),
        _ => echo(request),
    }
}

#[tokio::test]
async fn test_open_search_close() {
    init_tracing();
    let server = MockServer::start(directory).await;
    let conn = Connection::new(config_for(server.address()));

    conn.open().await.unwrap();
    assert!(conn.is_open());
    assert!(conn.stats().opened_at.is_some());

    let result = conn
        .operation(search("dc=example,dc=com"))
        .execute()
        .await
        .unwrap();
    assert!(result.is_success());
    assert_eq!(result.message_id, 1);
    assert_eq!(result.entries, vec![entry_for(1)]);

    conn.close().await;
    assert_eq!(conn.state(), ConnectionState::Closed);
    server.wait_for_requests(2).await;
    assert!(matches!(server.requests().last().unwrap().op, Request::Unbind));
}

#[tokio::test]
async fn test_open_twice_is_illegal() {
    let server = MockServer::start(echo).await;
    let conn = Connection::new(config_for(server.address()));
    conn.open().await.unwrap();
    assert!(matches!(conn.open().await, Err(LdapError::IllegalState(_))));
    conn.close().await;
}

#[tokio::test]
async fn test_open_refused() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let conn = Connection::new(config_for(ldap_session::ServerAddress::ldap(
        "127.0.0.1",
        port,
    )));
    assert!(matches!(conn.open().await, Err(LdapError::Connect(_))));
    assert_eq!(conn.state(), ConnectionState::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_operations_route_by_message_id() {
    let server = MockServer::start(directory).await;
    let conn = Connection::new(config_for(server.address()));
    conn.open().await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..25 {
        let conn = conn.clone();
        tasks.push(tokio::spawn(async move {
            conn.operation(search("dc=example,dc=com")).execute().await
        }));
    }

    let mut ids = Vec::new();
    for task in tasks {
        let result = task.await.unwrap().unwrap();
        assert_eq!(result.entries, vec![entry_for(result.message_id)]);
        ids.push(result.message_id);
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 25);

    // IDs reach the wire in increasing order
    let seen: Vec<_> = server.requests().iter().map(|r| r.message_id).collect();
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(conn.pending_count(), 0);
    conn.close().await;
}

#[tokio::test]
async fn test_subscriber_streams_entries() {
    let server = MockServer::start(directory).await;
    let conn = Connection::new(config_for(server.address()));
    conn.open().await.unwrap();

    let handle = conn.operation(search("dc=example,dc=com"));
    let mut stream = handle.subscribe();
    let result = handle.execute().await.unwrap();

    assert!(result.entries.is_empty());
    assert_eq!(stream.recv().await, Some(Intermediate::Entry(entry_for(1))));
    assert_eq!(stream.recv().await, None);
    conn.close().await;
}

#[tokio::test]
async fn test_response_timeout_abandons() {
    let server = MockServer::start(|request: &ldap_wire::RequestMessage| match &request.op {
        Request::Search(_) => Reply::Silent,
        _ => echo(request),
    })
    .await;
    let conn = Connection::new(config_for(server.address()));
    conn.open().await.unwrap();

    let handle = conn
        .operation(search("dc=example,dc=com"))
        .with_response_timeout(Some(Duration::from_millis(50)));
    handle.send().await.unwrap();
    let id = handle.message_id().unwrap();
    assert!(matches!(handle.wait().await, Err(LdapError::Timeout(_))));

    server.wait_for_requests(2).await;
    assert_eq!(server.requests()[1].op, Request::Abandon(id));
    assert_eq!(conn.pending_count(), 0);
    conn.close().await;
}

#[tokio::test]
async fn test_abandon_in_flight() {
    let server = MockServer::start(|request: &ldap_wire::RequestMessage| match &request.op {
        Request::Search(_) => Reply::Silent,
        _ => echo(request),
    })
    .await;
    let conn = Connection::new(config_for(server.address()));
    conn.open().await.unwrap();

    let unsent = conn.operation(search("dc=example,dc=com"));
    assert!(!unsent.abandon());

    let handle = conn.operation(search("dc=example,dc=com"));
    handle.send().await.unwrap();
    let id = handle.message_id().unwrap();
    assert!(handle.abandon());
    assert!(!handle.abandon());
    assert!(matches!(handle.wait().await, Err(LdapError::Abandoned)));

    server.wait_for_requests(2).await;
    assert_eq!(server.requests()[1].op, Request::Abandon(id));

    // A late result for the abandoned ID is dropped
    server.push(Push::Message(Message::new(
        id,
        Response::SearchDone(LdapResult::success()),
    )));
    let result = conn
        .operation(Request::Delete("cn=x".into()))
        .execute()
        .await
        .unwrap();
    assert!(result.is_success());
    conn.close().await;
}

#[tokio::test]
async fn test_bind_does_not_wait_for_unanswered_operations() {
    let server = MockServer::start(|request: &ldap_wire::RequestMessage| match &request.op {
        Request::Bind(_) | Request::Search(_) => Reply::Silent,
        _ => echo(request),
    })
    .await;
    let conn = Connection::new(config_for(server.address()));
    conn.open().await.unwrap();

    // A search the server sits on, e.g. a persistent search
    let in_flight = conn.operation(search("dc=example,dc=com"));
    in_flight.send().await.unwrap();
    let search_id = in_flight.message_id().unwrap();
    server.wait_for_requests(1).await;

    let bind_conn = conn.clone();
    let bind = tokio::spawn(async move {
        bind_conn
            .bind(BindRequest::simple("cn=admin,dc=example,dc=com", "secret"))
            .await
    });
    server.wait_for_requests(2).await;
    let bind_id = server.requests()[1].message_id;
    assert!(server.requests()[1].op.is_bind());
    assert!(bind_id > search_id);

    // While the bind is pending other writes and binds fail fast
    let blocked = conn.operation(Request::Delete("cn=x".into())).execute().await;
    assert!(matches!(blocked, Err(LdapError::BindInProgress)));
    assert!(matches!(
        conn.bind(BindRequest::anonymous()).await,
        Err(LdapError::BindInProgress)
    ));

    server.push(Push::Message(bind_response(bind_id, ResultCode::Success, None)));
    assert!(bind.await.unwrap().unwrap().is_success());

    let after = conn
        .operation(Request::Delete("cn=x".into()))
        .execute()
        .await
        .unwrap();
    assert!(after.is_success());

    // The earlier search was never disturbed
    assert!(!in_flight.is_complete());
    server.push(Push::Message(Message::new(
        search_id,
        Response::SearchDone(LdapResult::success()),
    )));
    assert!(in_flight.wait().await.unwrap().is_success());
    conn.close().await;
}

#[tokio::test]
async fn test_bind_must_use_execute() {
    let server = MockServer::start(echo).await;
    let conn = Connection::new(config_for(server.address()));
    conn.open().await.unwrap();

    let handle = conn.operation(Request::Bind(BindRequest::anonymous()));
    assert!(matches!(handle.send().await, Err(LdapError::IllegalState(_))));
    conn.close().await;
}

#[tokio::test]
async fn test_transport_loss_fails_pending() {
    let server = MockServer::start(|request: &ldap_wire::RequestMessage| match &request.op {
        Request::Search(_) => Reply::Silent,
        _ => echo(request),
    })
    .await;
    let conn = Connection::new(config_for(server.address()));
    conn.open().await.unwrap();

    let a = conn.operation(search("ou=a"));
    let b = conn.operation(search("ou=b"));
    a.send().await.unwrap();
    b.send().await.unwrap();
    server.wait_for_requests(2).await;

    server.push(Push::Disconnect);
    assert!(matches!(a.wait().await, Err(LdapError::Closed(_))));
    assert!(matches!(b.wait().await, Err(LdapError::Closed(_))));
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert!(conn.stats().last_error.is_some());
}

#[tokio::test]
async fn test_immediate_disconnect_fails_handle() {
    let server = MockServer::start(|request: &ldap_wire::RequestMessage| match &request.op {
        Request::Delete(_) => Reply::Disconnect,
        _ => echo(request),
    })
    .await;
    let conn = Connection::new(config_for(server.address()));
    conn.open().await.unwrap();

    let outcome = conn
        .operation(Request::Delete("cn=x".into()))
        .execute()
        .await;
    assert!(matches!(outcome, Err(LdapError::Closed(_))));
}

#[tokio::test]
async fn test_close_abandons_in_flight() {
    let server = MockServer::start(|request: &ldap_wire::RequestMessage| match &request.op {
        Request::Search(_) => Reply::Silent,
        _ => echo(request),
    })
    .await;
    let conn = Connection::new(config_for(server.address()));
    conn.open().await.unwrap();

    let handle = conn.operation(search("dc=example,dc=com"));
    handle.send().await.unwrap();
    let id = handle.message_id().unwrap();

    conn.close().await;
    conn.close().await;
    assert!(matches!(handle.wait().await, Err(LdapError::Abandoned)));

    server.wait_for_requests(3).await;
    let ops: Vec<_> = server.requests().into_iter().map(|r| r.op).collect();
    assert_eq!(ops[1], Request::Abandon(id));
    assert_eq!(ops[2], Request::Unbind);

    let late = conn.operation(Request::Delete("cn=x".into()));
    assert!(matches!(late.send().await, Err(LdapError::Closed(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_close_tears_down_once() {
    let server = MockServer::start(|request: &ldap_wire::RequestMessage| match &request.op {
        Request::Search(_) => Reply::Silent,
        _ => echo(request),
    })
    .await;
    let conn = Connection::new(config_for(server.address()));
    conn.open().await.unwrap();

    let mut handles = Vec::new();
    for i in 0..5 {
        let handle = conn.operation(search(&format!("ou={}", i)));
        handle.send().await.unwrap();
        handles.push(handle);
    }
    server.wait_for_requests(5).await;

    let (first, second) = (conn.clone(), conn.clone());
    tokio::join!(first.close(), second.close());
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert_eq!(conn.pending_count(), 0);

    for handle in handles {
        assert!(handle.is_complete());
        assert!(!handle.abandon());
        assert!(matches!(handle.wait().await, Err(LdapError::Abandoned)));
    }

    // Five searches, five abandons and a single unbind
    server.wait_for_requests(11).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let requests = server.requests();
    let unbinds = requests
        .iter()
        .filter(|r| matches!(r.op, Request::Unbind))
        .count();
    let abandons = requests
        .iter()
        .filter(|r| matches!(r.op, Request::Abandon(_)))
        .count();
    assert_eq!(unbinds, 1);
    assert_eq!(abandons, 5);
    assert_eq!(requests.len(), 11);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_racing_transport_loss() {
    let server = MockServer::start(|request: &ldap_wire::RequestMessage| match &request.op {
        Request::Search(_) => Reply::Silent,
        _ => echo(request),
    })
    .await;
    let conn = Connection::new(config_for(server.address()));
    conn.open().await.unwrap();

    let mut handles = Vec::new();
    for i in 0..5 {
        let handle = conn.operation(search(&format!("ou={}", i)));
        handle.send().await.unwrap();
        handles.push(handle);
    }
    server.wait_for_requests(5).await;

    server.push(Push::Disconnect);
    conn.close().await;
    assert_eq!(conn.state(), ConnectionState::Closed);

    // Whichever side won, every handle is resolved with a failure
    for handle in handles {
        let outcome = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            Err(LdapError::Abandoned) | Err(LdapError::Closed(_))
        ));
    }
    assert_eq!(conn.pending_count(), 0);
    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn test_unsolicited_notification_reaches_in_flight() {
    let server = MockServer::start(|request: &ldap_wire::RequestMessage| match &request.op {
        Request::Search(_) => Reply::Silent,
        _ => echo(request),
    })
    .await;
    let conn = Connection::new(config_for(server.address()));
    conn.open().await.unwrap();

    let handle = conn.operation(search("dc=example,dc=com"));
    let mut stream = handle.subscribe();
    handle.send().await.unwrap();
    let id = handle.message_id().unwrap();

    let notice = ExtendedResponse {
        result: LdapResult::new(ResultCode::Unavailable).with_message("shutting down"),
        name: Some(NOTICE_OF_DISCONNECTION_OID.into()),
        value: None,
    };
    server.push(Push::Message(Message::new(0, Response::Extended(notice.clone()))));
    assert_eq!(
        stream.recv().await,
        Some(Intermediate::Notification(notice))
    );

    server.push(Push::Message(Message::new(
        id,
        Response::SearchDone(LdapResult::success()),
    )));
    assert!(handle.wait().await.unwrap().is_success());
    conn.close().await;
}

#[tokio::test]
async fn test_illegal_frame_drops_connection() {
    let server = MockServer::start(|request: &ldap_wire::RequestMessage| match &request.op {
        Request::Search(_) => Reply::Silent,
        _ => echo(request),
    })
    .await;
    let conn = Connection::new(config_for(server.address()));
    conn.open().await.unwrap();

    let handle = conn.operation(search("dc=example,dc=com"));
    handle.send().await.unwrap();
    server.wait_for_requests(1).await;

    server.push(Push::Raw(Bytes::from_static(&[0x04, 0x01, 0x00])));
    match handle.wait().await {
        Err(LdapError::Closed(reason)) => assert!(reason.contains("Illegal frame")),
        other => panic!("expected closed, got {:?}", other),
    }
    assert_eq!(conn.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_undecodable_length_waits_for_read_timeout() {
    let server = MockServer::start(|request: &ldap_wire::RequestMessage| match &request.op {
        Request::Search(_) => Reply::Silent,
        _ => echo(request),
    })
    .await;
    let mut config = config_for(server.address());
    config.read_timeout = Some(Duration::from_millis(300));
    let conn = Connection::new(config);
    conn.open().await.unwrap();

    let handle = conn.operation(search("dc=example,dc=com"));
    handle.send().await.unwrap();
    server.wait_for_requests(1).await;

    // Indefinite length: not a frame yet, not fatal either
    server.push(Push::Raw(Bytes::from_static(&[0x30, 0x80, 0x02])));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(conn.is_open());
    assert!(!handle.is_complete());

    match handle.wait().await {
        Err(LdapError::Closed(reason)) => assert!(reason.contains("Read timed out")),
        other => panic!("expected closed, got {:?}", other),
    }
    assert_eq!(conn.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_undecodable_response_fails_only_its_handle() {
    let server = MockServer::start(|request: &ldap_wire::RequestMessage| match &request.op {
        Request::Search(_) => Reply::Silent,
        _ => echo(request),
    })
    .await;
    let conn = Connection::new(config_for(server.address()));
    conn.open().await.unwrap();

    let handle = conn.operation(search("dc=example,dc=com"));
    handle.send().await.unwrap();
    let id = handle.message_id().unwrap() as u8;
    server.wait_for_requests(1).await;

    // SearchResultDone whose body is garbage
    server.push(Push::Raw(Bytes::from(vec![
        0x30, 0x06, 0x02, 0x01, id, 0x65, 0x01, 0xFF,
    ])));
    assert!(matches!(handle.wait().await, Err(LdapError::Protocol(_))));

    let next = conn
        .operation(Request::Delete("cn=x".into()))
        .execute()
        .await
        .unwrap();
    assert!(next.is_success());
    conn.close().await;
}

#[tokio::test]
async fn test_mismatched_response_type_is_protocol_error() {
    let server = MockServer::start(|request: &ldap_wire::RequestMessage| {
        Reply::Respond(vec![Message::new(
            request.message_id,
            Response::SearchDone(LdapResult::success()),
        )])
    })
    .await;
    let conn = Connection::new(config_for(server.address()));
    conn.open().await.unwrap();

    let outcome = conn
        .operation(Request::Delete("cn=x".into()))
        .execute()
        .await;
    assert!(matches!(outcome, Err(LdapError::Protocol(_))));
    conn.close().await;
}

#[tokio::test]
async fn test_bind_initializer_runs_on_open() {
    let server = MockServer::start(echo).await;
    let conn = Connection::builder(config_for(server.address()))
        .initializer(BindInitializer::simple("cn=admin,dc=example,dc=com", "secret"))
        .build();

    conn.open().await.unwrap();
    let first = &server.requests()[0];
    assert_eq!(first.message_id, 1);
    assert!(first.op.is_bind());
    conn.close().await;
}

#[tokio::test]
async fn test_failed_initializer_closes_connection() {
    let server = MockServer::start(|request: &ldap_wire::RequestMessage| match &request.op {
        Request::Bind(_) => Reply::Respond(vec![bind_response(
            request.message_id,
            ResultCode::InvalidCredentials,
            None,
        )]),
        _ => echo(request),
    })
    .await;
    let conn = Connection::builder(config_for(server.address()))
        .initializer(BindInitializer::simple("cn=admin,dc=example,dc=com", "wrong"))
        .build();

    assert!(matches!(conn.open().await, Err(LdapError::Connect(_))));
    assert_eq!(conn.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_who_am_i() {
    let server = MockServer::start(|request: &ldap_wire::RequestMessage| match &request.op {
        Request::Extended(_) => Reply::Respond(vec![Message::new(
            request.message_id,
            Response::Extended(ExtendedResponse {
                result: LdapResult::success(),
                name: None,
                value: Some(Bytes::from_static(b"dn:cn=admin,dc=example,dc=com")),
            }),
        )]),
        _ => echo(request),
    })
    .await;
    let conn = Connection::new(config_for(server.address()));
    conn.open().await.unwrap();
    assert_eq!(
        conn.who_am_i().await.unwrap(),
        "dn:cn=admin,dc=example,dc=com"
    );
    conn.close().await;
}
