//! StartTLS, ldaps:// and SASL security layers.

mod common;

use bytes::Bytes;
use common::*;
use ldap_session::{
    make_client_config, Connection, ConnectionConfig, ConnectionState, LdapError, Plain,
    SaslInitializer, SaslMechanism, ServerAddress, TlsSettings,
};
use ldap_wire::{
    BindAuthentication, ExtendedResponse, LdapResult, Message, Request, RequestMessage, Response,
    ResultCode, STARTTLS_OID, WHOAMI_OID,
};

fn extended(id: i32, value: Option<&'static [u8]>) -> Message<Response> {
    Message::new(
        id,
        Response::Extended(ExtendedResponse {
            result: LdapResult::success(),
            name: None,
            value: value.map(Bytes::from_static),
        }),
    )
}

/// Directory answering StartTLS, "Who am I?" and the X-TEST mechanism
fn secure_directory(request: &RequestMessage) -> Reply {
    match &request.op {
        Request::Extended(ext) if ext.oid == STARTTLS_OID => {
            Reply::StartTls(extended(request.message_id, None))
        }
        Request::Extended(ext) if ext.oid == WHOAMI_OID => Reply::Respond(vec![extended(
            request.message_id,
            Some(b"dn:cn=admin,dc=example,dc=com"),
        )]),
        Request::Bind(bind) => match &bind.authentication {
            BindAuthentication::Sasl { mechanism, credentials } if mechanism == "X-TEST" => {
                match credentials.as_deref() {
                    Some(b"hello") => Reply::Respond(vec![bind_response(
                        request.message_id,
                        ResultCode::SaslBindInProgress,
                        Some(b"challenge"),
                    )]),
                    Some(b"response") => Reply::InstallLayer(
                        bind_response(request.message_id, ResultCode::Success, None),
                        Box::new(ChaChaLayer::server()),
                    ),
                    _ => Reply::Respond(vec![bind_response(
                        request.message_id,
                        ResultCode::InvalidCredentials,
                        None,
                    )]),
                }
            }
            _ => echo(request),
        },
        _ => echo(request),
    }
}

fn tls_config(address: ServerAddress, pki: &TestPki, server_name: &str) -> ConnectionConfig {
    let mut config = config_for(address);
    let client = make_client_config(&pki.ca_pem).unwrap();
    config.tls = Some(TlsSettings::new(client).with_server_name(server_name));
    config
}

#[tokio::test]
async fn test_start_tls_on_open() {
    init_tracing();
    let pki = test_pki();
    let server = MockServer::start_with_tls(secure_directory, pki.server_config.clone()).await;

    let mut config = tls_config(server.address(), &pki, "localhost");
    config.use_start_tls = true;
    let conn = Connection::new(config);

    conn.open().await.unwrap();
    assert!(conn.is_tls());

    let who = conn.who_am_i().await.unwrap();
    assert_eq!(who, "dn:cn=admin,dc=example,dc=com");

    let ops: Vec<_> = server.requests().into_iter().map(|r| r.message_id).collect();
    assert_eq!(ops, vec![1, 2]);
    conn.close().await;
}

#[tokio::test]
async fn test_start_tls_on_demand() {
    let pki = test_pki();
    let server = MockServer::start_with_tls(secure_directory, pki.server_config.clone()).await;
    let conn = Connection::new(tls_config(server.address(), &pki, "localhost"));

    conn.open().await.unwrap();
    assert!(!conn.is_tls());
    conn.start_tls().await.unwrap();
    assert!(conn.is_tls());
    // A second TLS wrapper is refused; the connection stays usable
    assert!(matches!(conn.start_tls().await, Err(LdapError::Connect(_))));
    assert!(conn.is_open());

    let result = conn
        .operation(Request::Delete("cn=x".into()))
        .execute()
        .await
        .unwrap();
    assert!(result.is_success());
    conn.close().await;
}

#[tokio::test]
async fn test_start_tls_refused() {
    let pki = test_pki();
    let server = MockServer::start(|request: &RequestMessage| match &request.op {
        Request::Extended(_) => Reply::Respond(vec![Message::new(
            request.message_id,
            Response::Extended(ExtendedResponse {
                result: LdapResult::new(ResultCode::UnwillingToPerform),
                name: None,
                value: None,
            }),
        )]),
        _ => echo(request),
    })
    .await;

    let mut config = tls_config(server.address(), &pki, "localhost");
    config.use_start_tls = true;
    let conn = Connection::new(config);
    assert!(matches!(conn.open().await, Err(LdapError::Tls(_))));
    assert_eq!(conn.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_ldaps() {
    let pki = test_pki();
    let server = MockServer::start_ldaps(secure_directory, pki.server_config.clone()).await;
    let conn = Connection::new(tls_config(server.ldaps_address(), &pki, "localhost"));

    conn.open().await.unwrap();
    assert!(conn.is_tls());
    let result = conn
        .operation(Request::Delete("cn=x".into()))
        .execute()
        .await
        .unwrap();
    assert!(result.is_success());
    assert_eq!(result.message_id, 1);
    conn.close().await;
}

#[tokio::test]
async fn test_ldaps_hostname_mismatch() {
    let pki = test_pki();
    let server = MockServer::start_ldaps(secure_directory, pki.server_config.clone()).await;
    let conn = Connection::new(tls_config(
        server.ldaps_address(),
        &pki,
        "ldap.example.com",
    ));

    assert!(matches!(conn.open().await, Err(LdapError::Tls(_))));
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert_eq!(server.connections(), 1);
    assert!(server.requests().is_empty());
}

#[tokio::test]
async fn test_ldaps_requires_tls_settings() {
    let conn = Connection::new(config_for(ServerAddress::ldaps("127.0.0.1", 1)));
    assert!(matches!(conn.open().await, Err(LdapError::Tls(_))));
}

#[tokio::test]
async fn test_sasl_security_layer() {
    init_tracing();
    let server = MockServer::start(secure_directory).await;
    let conn = Connection::new(config_for(server.address()));
    conn.open().await.unwrap();

    let mut mechanism = TestMechanism { challenges: 0 };
    let result = conn.sasl_bind(&mut mechanism).await.unwrap();
    assert!(result.is_success());
    assert_eq!(mechanism.challenges, 1);
    assert!(conn.has_security_layer());

    // Traffic now flows through the layer in both directions
    let who = conn.who_am_i().await.unwrap();
    assert_eq!(who, "dn:cn=admin,dc=example,dc=com");

    let requests = server.requests();
    let inbound = server.inbound_bytes();
    assert!(contains(&inbound, &requests[0].encode()));
    let who_am_i = requests
        .iter()
        .find(|r| matches!(&r.op, Request::Extended(ext) if ext.oid == WHOAMI_OID))
        .unwrap();
    assert!(!contains(&inbound, &who_am_i.encode()));
    let result = conn
        .operation(Request::Delete("cn=x".into()))
        .execute()
        .await
        .unwrap();
    assert!(result.is_success());

    let mut again = TestMechanism { challenges: 0 };
    assert!(matches!(
        conn.sasl_bind(&mut again).await,
        Err(LdapError::IllegalState(_))
    ));
    conn.close().await;
}

#[tokio::test]
async fn test_sasl_layer_over_start_tls() {
    let pki = test_pki();
    let server = MockServer::start_with_tls(secure_directory, pki.server_config.clone()).await;
    let mut config = tls_config(server.address(), &pki, "localhost");
    config.use_start_tls = true;
    let conn = Connection::new(config);

    conn.open().await.unwrap();
    assert!(conn.is_tls());
    let mut mechanism = TestMechanism { challenges: 0 };
    assert!(conn.sasl_bind(&mut mechanism).await.unwrap().is_success());
    assert!(conn.is_tls());
    assert!(conn.has_security_layer());

    let who = conn.who_am_i().await.unwrap();
    assert_eq!(who, "dn:cn=admin,dc=example,dc=com");

    // StartTLS, two bind rounds, then "Who am I?" decrypted by the server
    let requests = server.requests();
    assert_eq!(requests.len(), 4);
    assert!(matches!(&requests[3].op, Request::Extended(ext) if ext.oid == WHOAMI_OID));

    // Under TLS the binds travel in the clear, the request after them does not
    let inbound = server.inbound_bytes();
    assert!(contains(&inbound, &requests[2].encode()));
    assert!(!contains(&inbound, &requests[3].encode()));
    conn.close().await;
}

#[tokio::test]
async fn test_sasl_plain_without_layer() {
    let server = MockServer::start(echo).await;
    let conn = Connection::new(config_for(server.address()));
    conn.open().await.unwrap();

    let mut plain = Plain::new("admin", "secret");
    assert!(conn.sasl_bind(&mut plain).await.unwrap().is_success());
    assert!(!conn.has_security_layer());

    match &server.requests()[0].op {
        Request::Bind(bind) => assert_eq!(
            bind.authentication,
            BindAuthentication::Sasl {
                mechanism: "PLAIN".into(),
                credentials: Some(Bytes::from_static(b"\0admin\0secret")),
            }
        ),
        other => panic!("expected bind, got {:?}", other),
    }
    conn.close().await;
}

#[tokio::test]
async fn test_sasl_initializer() {
    let server = MockServer::start(secure_directory).await;
    let conn = Connection::builder(config_for(server.address()))
        .initializer(SaslInitializer::new(|| {
            Box::new(TestMechanism { challenges: 0 }) as Box<dyn SaslMechanism>
        }))
        .build();

    conn.open().await.unwrap();
    assert!(conn.has_security_layer());
    assert_eq!(server.requests().len(), 2);
    conn.close().await;
}
