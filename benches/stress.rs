use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};

const HOUR: i64 = 3_600_000; // 1 hour in ms

/// Bookings start here (year 2030) so the completion sweep never races the
/// benchmark.
const T0: i64 = 1_900_000_000_000;

struct Client {
    framed: Framed<TcpStream, LinesCodec>,
}

impl Client {
    async fn connect(host: &str, port: u16, name: &str) -> Client {
        let socket = TcpStream::connect((host, port))
            .await
            .expect("connect failed");
        let mut client = Client {
            framed: Framed::new(socket, LinesCodec::new_with_max_length(64 * 1024)),
        };
        let reply = client
            .send(json!({
                "cmd": "hello",
                "actor": {
                    "name": name,
                    "caps": { "reviewer": true, "elevated": true, "device_manager": true }
                }
            }))
            .await;
        assert_eq!(reply["ok"], json!(true), "hello failed: {reply}");
        client
    }

    async fn send(&mut self, cmd: Value) -> Value {
        self.framed.send(cmd.to_string()).await.expect("send failed");
        let line = self
            .framed
            .next()
            .await
            .expect("server closed connection")
            .expect("recv failed");
        serde_json::from_str(&line).expect("bad reply json")
    }

    async fn must(&mut self, cmd: Value) -> Value {
        let reply = self.send(cmd).await;
        assert_eq!(reply["ok"], json!(true), "command failed: {reply}");
        reply["data"].clone()
    }
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

fn booking_request(start: i64, end: i64, client: &str, room_id: Option<&str>) -> Value {
    let mut req = json!({
        "client_name": client,
        "contact_person": "Bench Driver",
        "email": "bench@example.com",
        "phone": "555-0199",
        "span": { "start": start, "end": end },
        "num_learners": 10,
        "num_facilitators": 1,
        "tenant": "TECH"
    });
    if let Some(room_id) = room_id {
        req["room_id"] = json!(room_id);
    }
    json!({ "cmd": "create_booking", "request": req })
}

async fn setup(client: &mut Client) -> Vec<String> {
    let capacities = [10, 10, 10, 20, 20, 20, 30, 30, 50, 50];
    let mut rooms = Vec::new();
    for (i, &cap) in capacities.iter().enumerate() {
        let data = client
            .must(json!({
                "cmd": "register_room",
                "name": format!("Bench Room {i}"),
                "capacity": cap
            }))
            .await;
        rooms.push(data["id"].as_str().unwrap().to_string());
    }
    println!("  created {} rooms", rooms.len());
    rooms
}

/// Sequential confirmed creates on one room: pure journal write latency.
async fn phase1_sequential(host: &str, port: u16, room_id: &str) {
    let mut client = Client::connect(host, port, "bench-seq").await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let s = T0 + (i as i64) * HOUR;
        let t = Instant::now();
        client
            .must(booking_request(s, s + HOUR, "Seq Client", Some(room_id)))
            .await;
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!(
        "  {n} bookings in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
    print_latency("write latency", &mut latencies);
}

/// Concurrent creates, one room per task: group commit should batch these.
async fn phase2_concurrent(host: &str, port: u16, rooms: &[String]) {
    let n_tasks = 10;
    let n_per_task = 200;

    let start = Instant::now();
    let mut handles = Vec::new();

    for i in 0..n_tasks {
        let host = host.to_string();
        let room_id = rooms[i % rooms.len()].clone();
        handles.push(tokio::spawn(async move {
            let mut client = Client::connect(&host, port, &format!("bench-conc-{i}")).await;
            // Disjoint span lane per task so every create succeeds.
            let lane = T0 + (10_000 + (i as i64) * 1_000) * HOUR;
            for j in 0..n_per_task {
                let s = lane + (j as i64) * HOUR;
                client
                    .must(booking_request(s, s + HOUR, "Conc Client", Some(&room_id)))
                    .await;
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} bookings = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

/// Availability queries while writers keep appending.
async fn phase3_read_under_load(host: &str, port: u16, rooms: &[String]) {
    let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5 {
        let host = host.to_string();
        let room_id = rooms[w % rooms.len()].clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let mut client = Client::connect(&host, port, &format!("bench-writer-{w}")).await;
            let lane = T0 + (100_000 + (w as i64) * 10_000) * HOUR;
            let mut i = 0i64;
            while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                let s = lane + i * HOUR;
                let reply = client
                    .send(booking_request(s, s + HOUR, "Load Writer", Some(&room_id)))
                    .await;
                assert_eq!(reply["ok"], json!(true));
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();

    for r in 0..n_readers {
        let host = host.to_string();
        let room_id = rooms[r % rooms.len()].clone();
        reader_handles.push(tokio::spawn(async move {
            let mut client = Client::connect(&host, port, &format!("bench-reader-{r}")).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader {
                let s = T0 + (i as i64) * HOUR;
                let t = Instant::now();
                client
                    .must(json!({
                        "cmd": "room_occupancy",
                        "room_id": room_id,
                        "window": { "start": s, "end": s + 24 * HOUR }
                    }))
                    .await;
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, std::sync::atomic::Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("occupancy query", &mut all_latencies);
}

/// All tasks fight over one slot in one room: exactly one create may win.
async fn phase4_conflict_contention(host: &str, port: u16, room_id: &str) {
    let n_tasks = 50;
    let s = T0 + 200_000 * HOUR;

    let start = Instant::now();
    let won = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let mut handles = Vec::new();

    for i in 0..n_tasks {
        let host = host.to_string();
        let room_id = room_id.to_string();
        let won = won.clone();
        handles.push(tokio::spawn(async move {
            let mut client = Client::connect(&host, port, &format!("bench-fight-{i}")).await;
            let reply = client
                .send(booking_request(s, s + HOUR, "Contender", Some(&room_id)))
                .await;
            if reply["ok"] == json!(true) {
                won.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            } else {
                assert_eq!(reply["error"]["kind"], json!("conflict"), "{reply}");
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let winners = won.load(std::sync::atomic::Ordering::Relaxed);
    assert_eq!(winners, 1, "expected exactly one winner");
    println!(
        "  {n_tasks} contenders, 1 winner, {} conflicts in {:.2}s",
        n_tasks - 1,
        elapsed.as_secs_f64()
    );
}

/// Connection storm: many short-lived connections doing a little work each.
async fn phase5_connection_storm(host: &str, port: u16, rooms: &[String]) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let success = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let mut handles = Vec::new();

    for c in 0..n_conns {
        let host = host.to_string();
        let room_id = rooms[c % rooms.len()].clone();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let mut client = Client::connect(&host, port, &format!("bench-storm-{c}")).await;
            let lane = T0 + (300_000 + (c as i64) * 100) * HOUR;
            for i in 0..ops_per_conn {
                let s = lane + (i as i64) * HOUR;
                client
                    .must(booking_request(s, s + HOUR, "Storm Client", Some(&room_id)))
                    .await;
            }
            success.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(std::sync::atomic::Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("RESERVA_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("RESERVA_PORT")
        .unwrap_or_else(|_| "7433".into())
        .parse()
        .expect("invalid RESERVA_PORT");

    println!("=== reserva stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[setup]");
    let mut setup_client = Client::connect(&host, port, "bench-setup").await;
    let rooms = setup(&mut setup_client).await;
    drop(setup_client);

    println!("\n[phase 1] sequential write throughput");
    phase1_sequential(&host, port, &rooms[8]).await;

    println!("\n[phase 2] concurrent write throughput");
    phase2_concurrent(&host, port, &rooms).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&host, port, &rooms).await;

    println!("\n[phase 4] conflict contention");
    phase4_conflict_contention(&host, port, &rooms[9]).await;

    println!("\n[phase 5] connection storm");
    phase5_connection_storm(&host, port, &rooms).await;

    println!("\n=== benchmark complete ===");
}
