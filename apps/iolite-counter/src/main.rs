//! # Iolite Counter
//!
//! A standalone CLI demo built on the Iolite engine. A server-side counter
//! state tree is mirrored to clients over the in-memory transport; every
//! interaction goes through the real event → handler → delta loop.
//!
//! ## State model
//!
//! ```text
//! root.count    →  Int      (the counter)
//! root.double   →  Int      (computed: count * 2)
//! root.log      →  List     (streamed progress entries)
//! ```

use clap::{Parser, Subcommand};
use colored::*;
use futures::future::BoxFuture;
use iolite_dispatch::{EventCtx, HandlerRegistry, HandlerResult, TaskCtx};
use iolite_engine::{memory_pair, Client, Engine, EngineConfig};
use iolite_state::{FieldKind, NodeSchema, Value};
use std::io::{self, Write};

// ─── CLI ───────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "iolite-counter")]
#[command(about = "Reactive counter demo over the Iolite sync engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Basic demo: three rapid increments, deltas applied in order
    Demo,
    /// Streaming demo: a background handler emits progressive deltas
    Stream,
    /// Reconnect demo: session survives a dropped connection
    Reconnect,
    /// Interactive REPL for manual experimentation
    Interactive,
}

// ─── Engine setup ──────────────────────────────────────────────────────────

fn schema() -> NodeSchema {
    NodeSchema::builder()
        .field("count", FieldKind::Int, Value::Int(0))
        .field("log", FieldKind::List, Value::List(Vec::new()))
        .computed("double", ["count"], |s| Value::Int(s.int("count") * 2))
        .build()
        .expect("static schema")
}

fn increment<'a>(ctx: &'a mut EventCtx, args: Vec<Value>) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        let by = args.first().and_then(|v| v.as_int()).unwrap_or(1);
        let count = ctx.get_local("count")?.as_int().unwrap_or(0);
        ctx.set_local("count", Value::Int(count + by))?;
        Ok(())
    })
}

fn reset<'a>(ctx: &'a mut EventCtx, _args: Vec<Value>) -> BoxFuture<'a, HandlerResult> {
    Box::pin(async move {
        ctx.set_local("count", Value::Int(0))?;
        ctx.set_local("log", Value::List(Vec::new()))?;
        Ok(())
    })
}

/// Background: append `n` entries to `log`, one delta per entry.
fn stream(ctx: TaskCtx, args: Vec<Value>) -> BoxFuture<'static, HandlerResult> {
    Box::pin(async move {
        let n = args.first().and_then(|v| v.as_int()).unwrap_or(3);
        for i in 1..=n {
            let node = ctx.node_path().clone();
            ctx.update(move |tree| {
                let mut list = tree.get(&node, "log")?.as_list().unwrap_or(&[]).to_vec();
                list.push(Value::Str(format!("step {}", i)));
                tree.set(&node, "log", Value::List(list))?;
                Ok(())
            })
            .await?;
            tokio::time::sleep(std::time::Duration::from_millis(150)).await;
            ctx.checkpoint().await?;
        }
        Ok(())
    })
}

fn engine() -> Engine {
    let registry = HandlerRegistry::new()
        .on("root.increment", increment)
        .on("root.reset", reset)
        .on_background("root.stream", stream);
    Engine::new(schema(), registry, EngineConfig::default()).expect("engine setup")
}

async fn connect(engine: &Engine) -> Client {
    let (server_end, client_end) = memory_pair(64);
    engine.accept(server_end);
    let mut client = Client::new(client_end);
    client.connect().await.expect("connect");
    client
}

fn show(client: &Client) {
    let count = client
        .store()
        .get("root", "count")
        .and_then(|v| v.as_int())
        .unwrap_or(0);
    let double = client
        .store()
        .get("root", "double")
        .and_then(|v| v.as_int())
        .unwrap_or(0);
    println!(
        "  seq {:>3} │ count = {} │ double = {}",
        client.store().last_seq().to_string().dimmed(),
        count.to_string().green().bold(),
        double.to_string().cyan()
    );
}

// ─── Demos ─────────────────────────────────────────────────────────────────

async fn demo() {
    println!("{}", "── three rapid increments ──".bold());
    let engine = engine();
    let mut client = connect(&engine).await;
    show(&client);

    for _ in 0..3 {
        client.emit("root.increment", vec![]).await.expect("emit");
    }
    for _ in 0..3 {
        client.process_next().await.expect("delta");
        show(&client);
    }
    println!("{}", "✓ mirror converged".green());
}

async fn stream_demo() {
    println!("{}", "── background streaming ──".bold());
    let engine = engine();
    let mut client = connect(&engine).await;

    client
        .emit("root.stream", vec![Value::Int(4)])
        .await
        .expect("emit");

    client
        .process_until(|store| {
            store
                .get("root", "log")
                .and_then(|v| v.as_list())
                .map(|l| l.len() == 4)
                .unwrap_or(false)
        })
        .await
        .expect("stream");

    if let Some(entries) = client.store().get("root", "log").and_then(|v| v.as_list()) {
        for entry in entries {
            println!("  {} {}", "→".dimmed(), entry.as_str().unwrap_or("?"));
        }
    }
    println!("{}", "✓ progressive deltas applied".green());
}

async fn reconnect_demo() {
    println!("{}", "── session survives reconnect ──".bold());
    let engine = engine();
    let mut client = connect(&engine).await;
    let token = client.session_token().expect("token").to_string();

    client.emit("root.increment", vec![]).await.expect("emit");
    client.emit("root.increment", vec![]).await.expect("emit");
    println!("  emitted 2 increments, dropping the connection...");
    drop(client);
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let (server_end, client_end) = memory_pair(64);
    engine.accept(server_end);
    let mut client = Client::new(client_end);
    let outcome = client.reconnect(token, 0).await.expect("reconnect");
    println!("  reconnect outcome: {:?}", outcome);

    client
        .process_until(|store| store.get("root", "count") == Some(&Value::Int(2)))
        .await
        .expect("replay");
    show(&client);
    println!("{}", "✓ retained deltas replayed".green());
}

async fn interactive() {
    println!("{}", "Iolite counter REPL".bold());
    println!("commands: inc [n] | stream [n] | reset | show | quit\n");

    let engine = engine();
    let mut client = connect(&engine).await;
    show(&client);

    let stdin = io::stdin();
    loop {
        print!("{} ", ">".cyan());
        io::stdout().flush().expect("flush");
        let mut line = String::new();
        if stdin.read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("inc") => {
                let n = parts.next().and_then(|s| s.parse::<i64>().ok()).unwrap_or(1);
                client
                    .emit("root.increment", vec![Value::Int(n)])
                    .await
                    .expect("emit");
                client.process_next().await.expect("delta");
                show(&client);
            }
            Some("stream") => {
                let n = parts.next().and_then(|s| s.parse::<i64>().ok()).unwrap_or(3);
                client
                    .emit("root.stream", vec![Value::Int(n)])
                    .await
                    .expect("emit");
                let target = client
                    .store()
                    .get("root", "log")
                    .and_then(|v| v.as_list())
                    .map(|l| l.len())
                    .unwrap_or(0)
                    + n as usize;
                client
                    .process_until(|store| {
                        store
                            .get("root", "log")
                            .and_then(|v| v.as_list())
                            .map(|l| l.len() >= target)
                            .unwrap_or(false)
                    })
                    .await
                    .expect("stream");
                println!("  log has {} entries", target.to_string().green());
            }
            Some("reset") => {
                client.emit("root.reset", vec![]).await.expect("emit");
                client.process_next().await.expect("delta");
                show(&client);
            }
            Some("show") => show(&client),
            Some("quit") | Some("exit") => break,
            Some(other) => println!("  {} unknown command: {}", "!".red(), other),
            None => {}
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match cli.command {
        Commands::Demo => demo().await,
        Commands::Stream => stream_demo().await,
        Commands::Reconnect => reconnect_demo().await,
        Commands::Interactive => interactive().await,
    }
}
