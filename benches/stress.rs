use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate};
use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

/// One-night stays fit back to back inside the two-year window.
const NIGHTS_AHEAD: u64 = 700;

async fn connect(host: &str, port: u16) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname("bench")
        .user("vacancy")
        .password("vacancy");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
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
        latencies.last().map_or(0.0, |d| d.as_secs_f64() * 1000.0),
    );
}

fn night(offset: u64) -> (NaiveDate, NaiveDate) {
    let start = chrono::Local::now().date_naive() + Days::new(1 + offset);
    (start, start + Days::new(1))
}

async fn new_property(client: &tokio_postgres::Client) -> Ulid {
    let pid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO properties (id, name, kind) VALUES ('{pid}', 'bench {pid}', 'cabin')"
        ))
        .await
        .unwrap();
    pid
}

async fn new_guest(client: &tokio_postgres::Client) -> Ulid {
    let gid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO guests (id, name, email) VALUES ('{gid}', 'bench', 'bench@example.com')"
        ))
        .await
        .unwrap();
    gid
}

async fn book_night(
    client: &tokio_postgres::Client,
    pid: Ulid,
    gid: Ulid,
    offset: u64,
) -> Result<(), tokio_postgres::Error> {
    let bid = Ulid::new();
    let (s, e) = night(offset);
    client
        .batch_execute(&format!(
            r#"INSERT INTO bookings (id, property_id, guest_id, start, "end") VALUES ('{bid}', '{pid}', '{gid}', '{s}', '{e}')"#
        ))
        .await
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port).await;
    let pid = new_property(&client).await;
    let gid = new_guest(&client).await;

    let n = NIGHTS_AHEAD;
    let mut latencies = Vec::with_capacity(n as usize);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        book_night(&client, pid, gid, i).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

/// Many clients race for the same nights on a handful of properties.
async fn phase2_contention(host: &str, port: u16) {
    let n_properties = 4;
    let n_tasks = 20;

    let setup = connect(host, port).await;
    let gid = new_guest(&setup).await;
    let mut properties = Vec::new();
    for _ in 0..n_properties {
        properties.push(new_property(&setup).await);
    }
    drop(setup);

    let won = Arc::new(AtomicUsize::new(0));
    let lost = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();

    for i in 0..n_tasks {
        let host = host.to_string();
        let pid = properties[i % properties.len()];
        let won = won.clone();
        let lost = lost.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            for night in 0..NIGHTS_AHEAD {
                match book_night(&client, pid, gid, night).await {
                    Ok(()) => won.fetch_add(1, Ordering::Relaxed),
                    Err(_) => lost.fetch_add(1, Ordering::Relaxed),
                };
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let won = won.load(Ordering::Relaxed);
    let lost = lost.load(Ordering::Relaxed);
    let total = won + lost;
    println!(
        "  {n_tasks} tasks on {n_properties} properties: {total} attempts in {:.2}s = {:.0} ops/sec",
        elapsed.as_secs_f64(),
        total as f64 / elapsed.as_secs_f64()
    );
    println!(
        "  {won} booked, {lost} rejected (expected {} booked)",
        n_properties as u64 * NIGHTS_AHEAD
    );
}

async fn phase3_read_under_load(host: &str, port: u16) {
    let setup = connect(host, port).await;
    let pid = new_property(&setup).await;
    let gid = new_guest(&setup).await;
    for i in 0..200 {
        book_night(&setup, pid, gid, i).await.unwrap();
    }
    drop(setup);

    // Writers keep the same property's lock busy.
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5u64 {
        let host = host.to_string();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let mut i = 200 + w;
            while !stop.load(Ordering::Relaxed) && i < NIGHTS_AHEAD {
                let _ = book_night(&client, pid, gid, i).await;
                i += 5;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();

    for _ in 0..n_readers {
        let host = host.to_string();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .simple_query(&format!("SELECT * FROM bookings WHERE property_id = '{pid}'"))
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("booking list query", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for _ in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port).await;
            let pid = new_property(&client).await;
            let gid = new_guest(&client).await;
            for i in 0..ops_per_conn {
                book_night(&client, pid, gid, i).await.unwrap();
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("VACANCY_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("VACANCY_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid VACANCY_PORT");

    println!("=== vacancy stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential write throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] contended bookings");
    phase2_contention(&host, port).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
