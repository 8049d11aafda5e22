//! portico-probe: check a configured backend from the command line.
//!
//! ```text
//! portico-probe --config portico.toml [--query <table>] [--watch]
//! portico-probe --memory
//! ```
//!
//! Prints one JSON document per result on stdout; logs go to stderr.

use portico_client::{init_tracing, AppContext, ClientError};
use portico_core::{GatewayConfig, QueryDescriptor, QueryOptions};
use serde_json::json;
use tokio::sync::mpsc;

#[derive(Debug, Default)]
struct ProbeArgs {
    memory: bool,
    watch: bool,
    query: Option<String>,
}

impl ProbeArgs {
    fn parse() -> Self {
        let mut parsed = Self::default();
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--memory" => parsed.memory = true,
                "--watch" => parsed.watch = true,
                "--query" => parsed.query = args.next(),
                _ => {}
            }
        }
        parsed
    }
}

#[tokio::main]
async fn main() -> Result<(), ClientError> {
    let args = ProbeArgs::parse();
    let config = if args.memory {
        GatewayConfig::memory()
    } else {
        GatewayConfig::load()?
    };
    init_tracing(&config.telemetry)?;

    let context = AppContext::from_config(config).await?;

    let status = context.health().check_backend_health().await;
    print_json(&json!({ "health": status }));

    if let Some(table) = &args.query {
        match QueryDescriptor::new(table.as_str(), QueryOptions::new()) {
            Ok(query) => {
                let outcome = context.queries().query(&query).await;
                print_json(&json!({ "table": table, "result": outcome }));
            }
            Err(err) => print_json(&json!({ "table": table, "error": err.to_string() })),
        }
    }

    if args.watch {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = context.health().on_health_change(move |status| {
            let _ = tx.send(status.clone());
        });
        context.start_health_monitor()?;
        loop {
            tokio::select! {
                Some(status) = rx.recv() => print_json(&json!({ "health": status })),
                _ = tokio::signal::ctrl_c() => break,
            }
        }
        subscription.unsubscribe();
        context.shutdown();
    }

    Ok(())
}

fn print_json(value: &serde_json::Value) {
    println!("{}", value);
}
