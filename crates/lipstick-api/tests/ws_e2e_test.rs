//! End-to-end tests for the agent WebSocket endpoints
//!
//! Runs the API router and a raw TCP ingress listener on loopback, and plays
//! the agent with tokio-tungstenite.

use futures::{SinkExt, StreamExt};
use lipstick_api::{ApiServer, ApiServerConfig};
use lipstick_control::{ManagerConfig, ManagerHandle, TunnelConnectionManager};
use lipstick_proto::{proxy_stream_path, ControlMessage};
use lipstick_store::{DomainStore, NewDomain, SeaOrmDomainStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type AgentSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Broker {
    api_addr: SocketAddr,
    ingress_addr: SocketAddr,
    manager: ManagerHandle,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("lipstick_api=debug,lipstick_control=debug")
        .with_test_writer()
        .try_init();
}

fn client_hello(hostname: &str) -> Vec<u8> {
    let mut entry = vec![0x00];
    entry.extend_from_slice(&(hostname.len() as u16).to_be_bytes());
    entry.extend_from_slice(hostname.as_bytes());
    let mut ext = vec![0x00, 0x00];
    ext.extend_from_slice(&((entry.len() + 2) as u16).to_be_bytes());
    ext.extend_from_slice(&(entry.len() as u16).to_be_bytes());
    ext.extend_from_slice(&entry);

    let mut body = vec![0x03, 0x03];
    body.extend_from_slice(&[0x11; 32]);
    body.extend_from_slice(&[0x00, 0x00, 0x02, 0x13, 0x01, 0x01, 0x00]);
    body.extend_from_slice(&(ext.len() as u16).to_be_bytes());
    body.extend_from_slice(&ext);

    let mut handshake = vec![0x01, 0x00];
    handshake.extend_from_slice(&(body.len() as u16).to_be_bytes());
    handshake.extend_from_slice(&body);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

/// Start a store with `domains` authorized, a manager, the API router and an
/// ingress listener, all on loopback
async fn start_broker(domains: &[&str]) -> Broker {
    let db = lipstick_store::connect("sqlite::memory:").await.unwrap();
    lipstick_store::migrate(&db).await.unwrap();
    let store = Arc::new(SeaOrmDomainStore::new(db));
    for domain in domains {
        store.add_domain(NewDomain::new(*domain)).await.unwrap();
    }

    let manager = TunnelConnectionManager::new(ManagerConfig::default()).start();

    let api_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let api_addr = api_listener.local_addr().unwrap();
    let server = ApiServer::new(
        ApiServerConfig { bind_addr: api_addr },
        manager.clone(),
        store,
        "test-admin-key",
    );
    let router = server.build_router();
    tokio::spawn(async move {
        axum::serve(api_listener, router).await.unwrap();
    });

    let ingress = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ingress_addr = ingress.local_addr().unwrap();
    let submit = manager.clone();
    tokio::spawn(async move {
        while let Ok((socket, peer)) = ingress.accept().await {
            if submit.submit(socket, Some(peer)).await.is_err() {
                break;
            }
        }
    });

    Broker {
        api_addr,
        ingress_addr,
        manager,
    }
}

/// Open a control link claiming `host`
async fn connect_agent(api_addr: SocketAddr, host: &str) -> AgentSocket {
    let mut request = format!("ws://{}/ws", api_addr)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("host", HeaderValue::from_str(host).unwrap());

    let (socket, _) = timeout(Duration::from_secs(5), connect_async(request))
        .await
        .expect("control link connect timed out")
        .expect("control link upgrade failed");
    socket
}

async fn next_control(socket: &mut AgentSocket) -> ControlMessage {
    loop {
        let frame = timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for a control message");
        match frame {
            Some(Ok(Message::Binary(data))) => return ControlMessage::decode(&data).unwrap(),
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            other => panic!("expected a control message, got {:?}", other),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_agent_serves_tls_connection() {
    init_tracing();
    let broker = start_broker(&["api.example.com"]).await;

    let mut agent = connect_agent(broker.api_addr, "api.example.com").await;
    match next_control(&mut agent).await {
        ControlMessage::Registered { domain } => assert_eq!(domain, "api.example.com"),
        other => panic!("expected Registered, got {:?}", other),
    }
    assert!(broker.manager.lookup("api.example.com").is_some());

    let hello = client_hello("api.example.com");
    let mut client = TcpStream::connect(broker.ingress_addr).await.unwrap();
    client.write_all(&hello).await.unwrap();

    let token = match next_control(&mut agent).await {
        ControlMessage::OpenStream { token } => token,
        other => panic!("expected OpenStream, got {:?}", other),
    };

    let url = format!("ws://{}{}", broker.api_addr, proxy_stream_path(&token));
    let (mut proxy, _) = connect_async(url).await.unwrap();

    let mut received = Vec::new();
    while received.len() < hello.len() {
        match timeout(Duration::from_secs(5), proxy.next()).await.unwrap() {
            Some(Ok(Message::Binary(data))) => received.extend_from_slice(&data),
            Some(Ok(_)) => {}
            other => panic!("proxy stream ended early: {:?}", other),
        }
    }
    assert_eq!(received, hello);

    proxy
        .send(Message::Binary(b"server hello".to_vec()))
        .await
        .unwrap();

    let mut reply = [0u8; 12];
    timeout(Duration::from_secs(5), client.read_exact(&mut reply))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply, b"server hello");
}

#[tokio::test]
async fn test_control_link_answers_ping() {
    init_tracing();
    let broker = start_broker(&["api.example.com"]).await;

    let mut agent = connect_agent(broker.api_addr, "API.example.com:8081").await;
    match next_control(&mut agent).await {
        ControlMessage::Registered { domain } => assert_eq!(domain, "api.example.com"),
        other => panic!("expected Registered, got {:?}", other),
    }

    let ping = ControlMessage::Ping { timestamp: 42 }.encode().unwrap();
    agent.send(Message::Binary(ping)).await.unwrap();

    match next_control(&mut agent).await {
        ControlMessage::Pong { timestamp } => assert_eq!(timestamp, 42),
        other => panic!("expected Pong, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unauthorized_domain_is_rejected() {
    init_tracing();
    let broker = start_broker(&["api.example.com"]).await;

    let mut agent = connect_agent(broker.api_addr, "unknown.test").await;
    match next_control(&mut agent).await {
        ControlMessage::Rejected { reason } => assert!(reason.contains("unknown.test")),
        other => panic!("expected Rejected, got {:?}", other),
    }
    assert_eq!(broker.manager.active_tunnels(), 0);
}

#[tokio::test]
async fn test_second_link_for_owned_domain_is_rejected() {
    init_tracing();
    let broker = start_broker(&["api.example.com"]).await;

    let mut first = connect_agent(broker.api_addr, "api.example.com").await;
    assert!(matches!(
        next_control(&mut first).await,
        ControlMessage::Registered { .. }
    ));

    let mut second = connect_agent(broker.api_addr, "api.example.com").await;
    assert!(matches!(
        next_control(&mut second).await,
        ControlMessage::Rejected { .. }
    ));
    assert_eq!(broker.manager.active_tunnels(), 1);
}

#[tokio::test]
async fn test_agent_disconnect_unregisters_domain() {
    init_tracing();
    let broker = start_broker(&["api.example.com"]).await;

    let mut agent = connect_agent(broker.api_addr, "api.example.com").await;
    assert!(matches!(
        next_control(&mut agent).await,
        ControlMessage::Registered { .. }
    ));
    agent.close(None).await.unwrap();

    let unregistered = timeout(Duration::from_secs(5), async {
        while broker.manager.lookup("api.example.com").is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(unregistered.is_ok());
}

#[tokio::test]
async fn test_malformed_token_is_refused() {
    init_tracing();
    let broker = start_broker(&[]).await;

    let url = format!("ws://{}/ws/not-a-token", broker.api_addr);
    match connect_async(url).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 400),
        other => panic!("expected HTTP 400, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_unknown_token_is_closed_without_payload() {
    init_tracing();
    let broker = start_broker(&[]).await;

    let url = format!(
        "ws://{}{}",
        broker.api_addr,
        proxy_stream_path(&uuid::Uuid::new_v4())
    );
    let (mut proxy, _) = connect_async(url).await.unwrap();

    loop {
        match timeout(Duration::from_secs(5), proxy.next()).await.unwrap() {
            Some(Ok(Message::Binary(data))) => panic!("unexpected payload: {:?}", data),
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
            Some(Ok(_)) => {}
        }
    }
}
