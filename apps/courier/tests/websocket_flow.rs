use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use courier::protocol::{ClientFrame, ServerFrame};
use courier::store::{MemoryStore, Table};
use courier::transport::SocketHub;
use courier::websocket::{router, AppState};
use courier::{Courier, DeliverySettings};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

struct Server {
    url: String,
    store: Arc<MemoryStore>,
}

async fn start_server() -> Server {
    let store = MemoryStore::new();
    let hub = SocketHub::new();
    let settings = DeliverySettings {
        ack_timeout: Duration::from_secs(2),
        flush_batch_size: 10,
        flush_ack_timeout: Duration::from_secs(2),
    };
    let courier = Courier::new(hub.clone(), store.clone(), settings);
    let app = router(AppState {
        courier,
        hub,
        metrics: None,
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Server {
        url: format!("ws://{addr}/ws"),
        store,
    }
}

/// Server event as seen by a test client.
#[derive(Debug)]
struct Event {
    name: String,
    payload: Option<Value>,
    ack_id: Option<u64>,
}

struct Client {
    ws: WsStream,
    next_ack: u64,
    inbox: VecDeque<Event>,
}

impl Client {
    async fn connect(server: &Server) -> Self {
        let (ws, _) = connect_async(server.url.as_str()).await.unwrap();
        Self {
            ws,
            next_ack: 0,
            inbox: VecDeque::new(),
        }
    }

    async fn send(&mut self, frame: ClientFrame) {
        let text = serde_json::to_string(&frame).unwrap();
        self.ws.send(Message::Text(text.into())).await.unwrap();
    }

    async fn read_frame(&mut self) -> ServerFrame {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("connection ended: {other:?}"),
            }
        }
    }

    /// Invokes `event` and returns the reply, queueing server events that
    /// arrive in the meantime.
    async fn request(&mut self, event: &str, payload: Value) -> Result<Value, String> {
        self.next_ack += 1;
        let ack_id = self.next_ack;
        self.send(ClientFrame::Request {
            event: event.to_string(),
            payload,
            ack_id: Some(ack_id),
        })
        .await;
        loop {
            match self.read_frame().await {
                ServerFrame::Ack {
                    ack_id: id,
                    error,
                    result,
                } if id == ack_id => {
                    return match error {
                        Some(error) => Err(error),
                        None => Ok(result.unwrap_or(Value::Null)),
                    }
                }
                ServerFrame::Event {
                    event,
                    payload,
                    ack_id,
                } => self.inbox.push_back(Event {
                    name: event,
                    payload,
                    ack_id,
                }),
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    async fn expect_event(&mut self, name: &str) -> Event {
        if let Some(index) = self.inbox.iter().position(|event| event.name == name) {
            if let Some(event) = self.inbox.remove(index) {
                return event;
            }
        }
        loop {
            match self.read_frame().await {
                ServerFrame::Event {
                    event,
                    payload,
                    ack_id,
                } => {
                    let received = Event {
                        name: event,
                        payload,
                        ack_id,
                    };
                    if received.name == name {
                        return received;
                    }
                    self.inbox.push_back(received);
                }
                other => panic!("unexpected frame while waiting for {name}: {other:?}"),
            }
        }
    }

    async fn ack(&mut self, event: &Event, result: Value) {
        let ack_id = event.ack_id.expect("event did not ask for an acknowledgement");
        self.send(ClientFrame::Ack {
            ack_id,
            error: None,
            result: Some(result),
        })
        .await;
    }

    async fn create_user(&mut self, username: &str) -> String {
        let profile = self
            .request("createUser", json!({ "username": username }))
            .await
            .unwrap();
        assert_eq!(profile["username"], username);
        profile["UID"].as_str().unwrap().to_string()
    }

    /// Binds the connection and consumes the terminal pending-events marker
    /// of an empty outbox.
    async fn sign_in(&mut self, uid: &str) {
        self.request("connectUser", json!({ "uid": uid })).await.unwrap();
        let done = self.expect_event("receivedPendingEvents").await;
        assert!(done.payload.is_none());
        assert!(done.ack_id.is_none());
    }
}

async fn wait_for_count(store: &MemoryStore, table: Table, expected: usize) {
    for _ in 0..100 {
        if store.count(table).await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{table} never reached {expected} records");
}

#[test_timeout::tokio_timeout_test(30)]
async fn contact_request_reaches_online_recipient() {
    let server = start_server().await;
    let mut alice = Client::connect(&server).await;
    let mut bob = Client::connect(&server).await;

    let alice_uid = alice.create_user("alice").await;
    let bob_uid = bob.create_user("bob").await;
    let taken = bob.request("checkUsernameAvailable", json!({ "username": "alice" })).await;
    assert_eq!(taken, Ok(json!(false)));

    alice.sign_in(&alice_uid).await;
    bob.sign_in(&bob_uid).await;

    let request = alice
        .request(
            "sendContactRequest",
            json!({
                "requestID": "cr-1",
                "recipientUID": bob_uid,
                "date": 1_700_000_000_000i64,
                "isOrigin": true,
            }),
        )
        .await
        .unwrap();
    assert_eq!(request["requestID"], "cr-1");

    let received = bob.expect_event("receivedCR").await;
    let payload = received.payload.clone().unwrap();
    assert_eq!(payload["requestID"], "cr-1");
    assert_eq!(payload["isOrigin"], false);
    assert_eq!(payload["user"]["UID"], alice_uid.as_str());
    bob.ack(&received, json!(true)).await;

    assert_eq!(server.store.count(Table::ContactRequests).await, 1);
    assert_eq!(server.store.count(Table::Events).await, 0);
}

#[test_timeout::tokio_timeout_test(30)]
async fn offline_recipient_gets_request_from_outbox_on_connect() {
    let server = start_server().await;
    let mut alice = Client::connect(&server).await;
    let alice_uid = alice.create_user("alice").await;
    let carol_uid = alice.create_user("carol").await;
    alice.sign_in(&alice_uid).await;

    alice
        .request(
            "sendContactRequest",
            json!({
                "requestID": "cr-2",
                "recipientUID": carol_uid,
                "date": 5,
                "isOrigin": true,
            }),
        )
        .await
        .unwrap();
    wait_for_count(&server.store, Table::Events, 1).await;

    let mut carol = Client::connect(&server).await;
    carol
        .request("connectUser", json!({ "uid": carol_uid }))
        .await
        .unwrap();

    let batch = carol.expect_event("receivedPendingEvents").await;
    let entries = batch.payload.clone().unwrap();
    let entries = entries.as_object().unwrap();
    assert_eq!(entries.len(), 1);
    let (event_id, stored) = entries.iter().next().unwrap();
    assert_eq!(stored["eventName"], "receivedCR");
    assert_eq!(stored["originUID"], alice_uid.as_str());
    assert_eq!(stored["payload"]["requestID"], "cr-2");
    let mut accepted = serde_json::Map::new();
    accepted.insert(event_id.clone(), Value::Bool(true));
    carol.ack(&batch, Value::Object(accepted)).await;

    let done = carol.expect_event("receivedPendingEvents").await;
    assert!(done.payload.is_none());
    wait_for_count(&server.store, Table::Events, 0).await;
    assert_eq!(server.store.count(Table::ContactRequests).await, 1);
}

#[test_timeout::tokio_timeout_test(30)]
async fn operations_need_a_bound_user_and_bad_frames_are_reported() {
    let server = start_server().await;
    let mut client = Client::connect(&server).await;

    let unbound = client.request("fetchRelatedUsers", json!({})).await;
    assert!(unbound.is_err());
    let unknown = client.request("teleport", json!({})).await;
    assert!(unknown.unwrap_err().contains("teleport"));

    client
        .ws
        .send(Message::Text("not json".to_string().into()))
        .await
        .unwrap();
    match client.read_frame().await {
        ServerFrame::Error { message } => assert!(message.contains("Invalid message format")),
        other => panic!("expected an error frame, got {other:?}"),
    }
}
