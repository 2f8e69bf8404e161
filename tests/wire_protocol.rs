use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use reserva::engine::Engine;
use reserva::events::EventHub;
use reserva::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join("reserva_int_test");
    std::fs::create_dir_all(&dir).unwrap();
    let wal_path = dir.join(format!("{}.wal", Ulid::new()));
    let hub = Arc::new(EventHub::new());
    let engine = Arc::new(Engine::new(&wal_path, hub).await.unwrap());

    let eng = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = eng.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine).await;
            });
        }
    });

    (addr, engine)
}

struct Client {
    framed: Framed<TcpStream, LinesCodec>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let socket = TcpStream::connect(addr).await.unwrap();
        Self {
            framed: Framed::new(socket, LinesCodec::new()),
        }
    }

    async fn send(&mut self, cmd: Value) -> Value {
        self.framed.send(cmd.to_string()).await.unwrap();
        let line = self.framed.next().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    /// Read the next raw line (for subscription streams).
    async fn next_line(&mut self, timeout: Duration) -> Option<Value> {
        let line = tokio::time::timeout(timeout, self.framed.next())
            .await
            .ok()??
            .ok()?;
        serde_json::from_str(&line).ok()
    }

    async fn hello(&mut self, name: &str, caps: Value) {
        let reply = self
            .send(json!({ "cmd": "hello", "actor": { "name": name, "caps": caps } }))
            .await;
        assert_eq!(reply["ok"], json!(true));
    }
}

fn all_caps() -> Value {
    json!({ "reviewer": true, "elevated": true, "device_manager": true })
}

fn booking_request(start: u64, end: u64, client: &str) -> Value {
    json!({
        "client_name": client,
        "contact_person": "J. Doe",
        "email": "j@acme.example",
        "phone": "555-0100",
        "span": { "start": start, "end": end },
        "num_learners": 10,
        "num_facilitators": 2,
        "tenant": "TECH"
    })
}

// Spans in 2030, so lazy completion stays out of the picture.
const T0: u64 = 1_900_000_000_000;
const H: u64 = 3_600_000;

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn hello_is_required_first() {
    let (addr, _) = start_test_server().await;
    let mut client = Client::connect(addr).await;

    let reply = client.send(json!({ "cmd": "list_rooms" })).await;
    assert_eq!(reply["ok"], json!(false));
    assert_eq!(reply["error"]["kind"], json!("validation"));

    // The connection survives; hello unlocks it.
    client.hello("frontdesk", json!({})).await;
    let reply = client.send(json!({ "cmd": "list_rooms" })).await;
    assert_eq!(reply["ok"], json!(true));
    assert_eq!(reply["data"], json!([]));
}

#[tokio::test]
async fn malformed_line_gets_error_reply() {
    let (addr, _) = start_test_server().await;
    let mut client = Client::connect(addr).await;
    client.hello("frontdesk", json!({})).await;

    client.framed.send("{not json").await.unwrap();
    let line = client.framed.next().await.unwrap().unwrap();
    let reply: Value = serde_json::from_str(&line).unwrap();
    assert_eq!(reply["ok"], json!(false));
    assert_eq!(reply["error"]["kind"], json!("validation"));

    // Still usable afterwards.
    let reply = client.send(json!({ "cmd": "list_pending" })).await;
    assert_eq!(reply["ok"], json!(true));
}

#[tokio::test]
async fn booking_flow_over_the_wire() {
    let (addr, _) = start_test_server().await;
    let mut client = Client::connect(addr).await;
    client.hello("boss", all_caps()).await;

    let reply = client
        .send(json!({ "cmd": "register_room", "name": "Room 1", "capacity": 20 }))
        .await;
    assert_eq!(reply["ok"], json!(true));
    let room_id = reply["data"]["id"].as_str().unwrap().to_string();

    let mut request = booking_request(T0, T0 + 2 * H, "Acme");
    request["room_id"] = json!(room_id);
    let reply = client
        .send(json!({ "cmd": "create_booking", "request": request }))
        .await;
    assert_eq!(reply["ok"], json!(true));
    // Elevated caps with a named room bind it atomically in Confirmed.
    assert_eq!(reply["data"]["status"], json!("confirmed"));
    let booking_id = reply["data"]["id"].as_str().unwrap().to_string();

    let reply = client
        .send(json!({ "cmd": "get_booking", "booking_id": booking_id }))
        .await;
    assert_eq!(reply["ok"], json!(true));
    assert_eq!(reply["data"]["has_room_conflict"], json!(false));

    let reply = client
        .send(json!({
            "cmd": "room_occupancy",
            "room_id": room_id,
            "window": { "start": T0, "end": T0 + 4 * H }
        }))
        .await;
    assert_eq!(reply["ok"], json!(true));
    let occupants = reply["data"].as_array().unwrap();
    assert_eq!(occupants.len(), 1);
    assert_eq!(occupants[0]["client_name"], json!("Acme"));
}

#[tokio::test]
async fn conflict_reply_carries_opponents() {
    let (addr, _) = start_test_server().await;
    let mut reviewer = Client::connect(addr).await;
    reviewer.hello("boss", all_caps()).await;

    let reply = reviewer
        .send(json!({ "cmd": "register_room", "name": "Room 1", "capacity": 20 }))
        .await;
    let room_id = reply["data"]["id"].as_str().unwrap().to_string();

    let mut frontdesk = Client::connect(addr).await;
    frontdesk.hello("frontdesk", json!({})).await;

    let reply = frontdesk
        .send(json!({
            "cmd": "create_booking",
            "request": booking_request(T0, T0 + 2 * H, "Acme")
        }))
        .await;
    let first = reply["data"]["id"].as_str().unwrap().to_string();
    let reply = frontdesk
        .send(json!({
            "cmd": "create_booking",
            "request": booking_request(T0 + H, T0 + 3 * H, "Globex")
        }))
        .await;
    let second = reply["data"]["id"].as_str().unwrap().to_string();

    let reply = reviewer
        .send(json!({ "cmd": "assign_room", "booking_id": first, "room_id": room_id }))
        .await;
    assert_eq!(reply["ok"], json!(true));

    let reply = reviewer
        .send(json!({ "cmd": "assign_room", "booking_id": second, "room_id": room_id }))
        .await;
    assert_eq!(reply["ok"], json!(false));
    assert_eq!(reply["error"]["kind"], json!("conflict"));
    assert_eq!(reply["error"]["retryable"], json!(false));
    let conflicts = reply["error"]["conflicts"].as_array().unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0]["booking_id"].as_str().unwrap(), first);
    assert_eq!(conflicts[0]["client_name"], json!("Acme"));

    // Capability failures report as forbidden, not conflict.
    let reply = frontdesk
        .send(json!({ "cmd": "assign_room", "booking_id": second, "room_id": room_id }))
        .await;
    assert_eq!(reply["error"]["kind"], json!("forbidden"));
}

#[tokio::test]
async fn subscribe_streams_domain_events() {
    let (addr, _) = start_test_server().await;

    let mut watcher = Client::connect(addr).await;
    watcher.hello("dashboard", json!({})).await;
    let reply = watcher.send(json!({ "cmd": "subscribe" })).await;
    assert_eq!(reply["ok"], json!(true));

    let mut frontdesk = Client::connect(addr).await;
    frontdesk.hello("frontdesk", json!({})).await;
    let reply = frontdesk
        .send(json!({
            "cmd": "create_booking",
            "request": booking_request(T0, T0 + 2 * H, "Acme")
        }))
        .await;
    assert_eq!(reply["ok"], json!(true));
    let booking_id = reply["data"]["id"].as_str().unwrap().to_string();

    let event = watcher
        .next_line(Duration::from_secs(5))
        .await
        .expect("expected a booking_pending event");
    assert_eq!(event["event"], json!("booking_pending"));
    assert_eq!(event["booking_id"].as_str().unwrap(), booking_id);
    assert_eq!(event["client_name"], json!("Acme"));
}

#[tokio::test]
async fn tenant_tag_is_validated_at_the_edge() {
    let (addr, _) = start_test_server().await;
    let mut client = Client::connect(addr).await;
    client.hello("frontdesk", json!({})).await;

    let reply = client
        .send(json!({ "cmd": "tenant_summary", "tenant": "bad tag!" }))
        .await;
    assert_eq!(reply["ok"], json!(false));
    assert_eq!(reply["error"]["kind"], json!("validation"));

    // Lowercase input normalizes to the canonical uppercase tag.
    let reply = client
        .send(json!({ "cmd": "tenant_summary", "tenant": "tech" }))
        .await;
    assert_eq!(reply["ok"], json!(true));
    assert_eq!(reply["data"]["tenant"], json!("TECH"));
    assert_eq!(reply["data"]["bookings_total"], json!(0));
}
