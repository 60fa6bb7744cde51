use std::sync::Arc;

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer};
use uuid::Uuid;

use crate::net::frame::Frame;
use crate::net::registry::Registry;

/// Target used when replaying records received from a peer or a worker.
/// The forwarding layer skips it so records never loop between peers.
const REPLAY_TARGET: &str = "jobherd::replay";

/// Initialise the diagnostic subscriber: stderr output filtered by
/// `RUST_LOG` (default "info"), with the network forwarding layer stacked
/// on top when running as a network peer.
pub fn init(forward: Option<ForwardLayer>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match forward {
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        Some(layer) => tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(filter),
            )
            .with(layer)
            .init(),
    }
}

/// A `tracing` layer that serialises events at or above a severity to JSON
/// and enqueues one log frame per live peer connection.
pub struct ForwardLayer {
    registry: Arc<Registry>,
    level: Level,
}

impl ForwardLayer {
    pub fn new(registry: Arc<Registry>, level: Level) -> Self {
        Self { registry, level }
    }
}

impl<S: Subscriber> Layer<S> for ForwardLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if *metadata.level() > self.level || metadata.target() == REPLAY_TARGET {
            return;
        }
        let record = render_record(event);
        self.registry.broadcast(|| Frame::LogMessage {
            record: record.clone(),
        });
    }
}

fn render_record(event: &Event<'_>) -> String {
    let metadata = event.metadata();
    let mut fields = serde_json::Map::new();
    event.record(&mut JsonVisitor {
        fields: &mut fields,
    });
    let message = fields
        .remove("message")
        .unwrap_or_else(|| serde_json::Value::String(String::new()));
    serde_json::json!({
        "when": chrono::Utc::now().to_rfc3339(),
        "level": metadata.level().to_string(),
        "module": metadata.target(),
        "message": message,
        "fields": fields,
    })
    .to_string()
}

struct JsonVisitor<'a> {
    fields: &'a mut serde_json::Map<String, serde_json::Value>,
}

impl Visit for JsonVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.fields
            .insert(field.name().to_string(), format!("{value:?}").into());
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.fields.insert(field.name().to_string(), value.into());
    }
}

/// Re-log a record received over the wire, tagged with the connection it
/// came from. A record that does not parse is reported, not fatal.
pub fn replay_peer_record(connection: Uuid, record: &str) {
    match serde_json::from_str::<serde_json::Value>(record) {
        Ok(value) => replay(format!("peer/{connection}"), &value),
        Err(err) => tracing::warn!(
            connection = %connection,
            error = %err,
            "Unparseable log record from peer"
        ),
    }
}

/// Re-log a structured record raised by a local worker.
pub fn replay_worker_record(worker: usize, value: &serde_json::Value) {
    replay(format!("worker/{worker}"), value);
}

fn replay(source: String, value: &serde_json::Value) {
    let level = value.get("level").and_then(|v| v.as_str()).unwrap_or("info");
    let message = value
        .get("message")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    if level.eq_ignore_ascii_case("error") {
        tracing::error!(target: "jobherd::replay", %source, record = %value, "{message}");
    } else if level.eq_ignore_ascii_case("warn") || level.eq_ignore_ascii_case("warning") {
        tracing::warn!(target: "jobherd::replay", %source, record = %value, "{message}");
    } else if level.eq_ignore_ascii_case("debug") {
        tracing::debug!(target: "jobherd::replay", %source, record = %value, "{message}");
    } else if level.eq_ignore_ascii_case("trace") {
        tracing::trace!(target: "jobherd::replay", %source, record = %value, "{message}");
    } else {
        tracing::info!(target: "jobherd::replay", %source, record = %value, "{message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn forward_layer_broadcasts_matching_events_once() {
        let registry = Arc::new(Registry::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.insert(Uuid::new_v4(), tx);

        let subscriber = tracing_subscriber::registry()
            .with(ForwardLayer::new(registry.clone(), Level::WARN));
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(job = "a", "something happened");
            tracing::info!("below the forwarding severity");
            tracing::warn!(target: "jobherd::replay", "already forwarded once");
        });

        let frame = rx.try_recv().expect("one frame broadcast");
        let Frame::LogMessage { record } = frame else {
            panic!("expected a log frame");
        };
        let value: serde_json::Value = serde_json::from_str(&record).expect("record is JSON");
        assert_eq!(value["level"], "WARN");
        assert_eq!(value["message"], "something happened");
        assert_eq!(value["fields"]["job"], "a");
        assert!(value["when"].is_string());

        assert!(rx.try_recv().is_err(), "info and replayed events stay local");
    }
}
