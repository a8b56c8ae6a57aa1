//! View Runtime - live aggregated view over a SQLite record store
//!
//! This binary:
//! - Opens (or creates) the SQLite record store
//! - Publishes "group by AGGVIEW_GROUP_FIELD, count" as an incremental view
//! - Reads records as JSON lines from stdin (`{"_id": "k", ...}` upserts,
//!   `{"_id": "k", "_deleted": true}` removes)
//! - Logs every view event as a JSON line
//!
//! Usage:
//!   cargo run --release --bin view_runtime < records.jsonl
//!
//! Environment variables:
//!   AGGVIEW_DB_PATH - SQLite database path (default: aggview.db)
//!   AGGVIEW_GROUP_FIELD - Grouping field (default: category)
//!   AGGVIEW_WINDOW_MILLIS - Trailing window width (default: none)
//!   AGGVIEW_ENABLED - Master switch (default: true)

use aggview::store::SqliteStore;
use aggview::view::config::RuntimeConfig;
use aggview::view::pipeline::{Accumulator, GroupKeySpec, GroupStage, Pipeline};
use aggview::view::{ChannelSink, Record, ViewOptions, ViewPublication};
use dotenv::dotenv;
use log::{error, info, warn};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize environment and logging
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("🚀 View Runtime");

    let config = RuntimeConfig::from_env();

    if !config.enabled {
        info!("⚠️  View runtime is DISABLED (set AGGVIEW_ENABLED=true to activate)");
        return Ok(());
    }

    info!("✅ View runtime ENABLED");
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ View: {}", config.view_name);
    info!("   ├─ Group field: {}", config.group_field);
    match config.window_millis {
        Some(width) => info!("   ├─ Window: {} > now - {}ms", config.window_field, width),
        None => info!("   ├─ Window: none"),
    }
    info!("   └─ Min recompute interval: {}ms", config.min_recompute_ms);

    let store = Arc::new(SqliteStore::open(&config.db_path, &config.view_name)?);
    info!("✅ Store opened ({} records)", store.count()?);

    let group_field = config.group_field.clone();
    let builder = move || {
        Some(Pipeline::new().group(
            GroupStage::by(GroupKeySpec::Field(group_field.clone())).output("count", Accumulator::Count),
        ))
    };

    let mut options = ViewOptions::default()
        .view_name(&config.view_name)
        .min_recompute_interval_millis(config.min_recompute_ms);
    if let Some(width) = config.window_millis {
        options = options.window(&config.window_field, width);
    }

    let (sink, mut events) = ChannelSink::new();
    let handle = ViewPublication::new(store.clone(), builder)
        .options(options)
        .start(sink)
        .await?;

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => info!("{}", line),
                Err(e) => error!("❌ Failed to serialize event: {}", e),
            }
        }
    });

    let ingest_store = store.clone();
    let ingestion = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Err(e) = ingest_line(&ingest_store, &line) {
                        warn!("⚠️  Skipping input line: {}", e);
                    }
                }
                Ok(None) => {
                    info!("📊 Input closed, view stays live");
                    break;
                }
                Err(e) => {
                    error!("❌ Failed to read input: {}", e);
                    break;
                }
            }
        }
    });

    info!("🔄 Press CTRL+C to shutdown gracefully");

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("");
            info!("⚠️  Received CTRL+C, shutting down...");
        }
        Err(err) => {
            error!("❌ Failed to listen for CTRL+C: {}", err);
        }
    }

    ingestion.abort();
    handle.stop().await?;
    // Sink is dropped with the publication, which ends the printer
    if let Err(e) = printer.await {
        error!("❌ Event printer failed: {}", e);
    }

    info!("✅ View runtime stopped");
    Ok(())
}

fn ingest_line(store: &SqliteStore, line: &str) -> Result<(), Box<dyn std::error::Error>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(());
    }
    let Value::Object(mut doc) = serde_json::from_str::<Value>(line)? else {
        return Err("expected a JSON object".into());
    };
    let key = match doc.remove("_id") {
        Some(Value::String(key)) => key,
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err("missing _id".into()),
    };

    if doc.get("_deleted").and_then(Value::as_bool) == Some(true) {
        store.remove(&key)?;
    } else {
        store.insert(Record::new(key, doc))?;
    }
    Ok(())
}
