//! Multi-session stress runs against the full engine stack over the
//! in-memory transport.

use futures::future::BoxFuture;
use iolite_dispatch::{EventCtx, HandlerRegistry, HandlerResult};
use iolite_engine::{memory_pair, Client, Engine, EngineConfig};
use iolite_state::{FieldKind, NodeSchema, Value};
use std::time::{Duration, Instant};

/// Statistics collected during a stress run.
#[derive(Clone, Debug)]
pub struct StressStats {
    pub sessions: usize,
    pub events_per_session: usize,
    pub deltas_applied: usize,
    pub total_time: Duration,
    pub events_per_second: f64,
}

impl StressStats {
    pub fn print(&self) {
        println!("\n╔════════════════════════════════════════════════════════════╗");
        println!("║              Stress Run Statistics                          ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║  Sessions:                  {:>30} ║", self.sessions);
        println!("║  Events per Session:        {:>30} ║", self.events_per_session);
        println!("║  Deltas Applied:            {:>30} ║", self.deltas_applied);
        println!(
            "║  Total Time:                {:>29}s ║",
            format!("{:.3}", self.total_time.as_secs_f64())
        );
        println!("║  Events/Second:             {:>30.0} ║", self.events_per_second);
        println!("╚════════════════════════════════════════════════════════════╝");
    }
}

fn counter_schema() -> NodeSchema {
    NodeSchema::builder()
        .field("count", FieldKind::Int, Value::Int(0))
        .computed("double", ["count"], |s| Value::Int(s.int("count") * 2))
        .build()
        .expect("static schema")
}

fn increment<'a>(ctx: &'a mut EventCtx, _args: Vec<Value>) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        let count = ctx.get_local("count")?.as_int().unwrap_or(0);
        ctx.set_local("count", Value::Int(count + 1))?;
        Ok(())
    })
}

/// Run `sessions` concurrent clients, each firing `events` increments and
/// applying every resulting delta.
pub async fn stress_test_sessions(sessions: usize, events: usize) -> StressStats {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Engine Stress (concurrent sessions)                 ║");
    println!(
        "║  Sessions: {:<5} | Events/Session: {:<21} ║",
        sessions, events
    );
    println!("╚════════════════════════════════════════════════════════════╝");

    let registry = HandlerRegistry::new().on("root.increment", increment);
    let engine =
        Engine::new(counter_schema(), registry, EngineConfig::default()).expect("engine setup");

    let start = Instant::now();
    let mut handles = Vec::with_capacity(sessions);
    for _ in 0..sessions {
        let (server_end, client_end) = memory_pair(256);
        engine.accept(server_end);

        handles.push(tokio::spawn(async move {
            let mut client = Client::new(client_end);
            client.connect().await.expect("connect");

            for _ in 0..events {
                client.emit("root.increment", vec![]).await.expect("emit");
            }

            let target = events as i64;
            client
                .process_until(|store| {
                    store.get("root", "count").and_then(|v| v.as_int()) == Some(target)
                })
                .await
                .expect("sync");
            client.store().last_seq() as usize
        }));
    }

    let mut deltas_applied = 0usize;
    for handle in handles {
        deltas_applied += handle.await.expect("session task");
    }

    let total_time = start.elapsed();
    let total_events = sessions * events;
    StressStats {
        sessions,
        events_per_session: events,
        deltas_applied,
        total_time,
        events_per_second: total_events as f64 / total_time.as_secs_f64(),
    }
}

/// Compare throughput across session counts.
pub async fn stress_test_scaling(max_sessions: usize, step: usize) {
    let mut current = step;
    while current <= max_sessions {
        let stats = stress_test_sessions(current, 50).await;
        stats.print();
        current += step;
    }
}
