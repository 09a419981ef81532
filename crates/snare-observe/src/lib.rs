use std::collections::BTreeMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    ConnectReceived,
    ConnectDecision,
    MitmStarted,
    TlsHandshakeFailed,
    RequestRead,
    ResponseWritten,
    TunnelOpened,
    TunnelClosed,
    StreamClosed,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectReceived => "connect_received",
            Self::ConnectDecision => "connect_decision",
            Self::MitmStarted => "mitm_started",
            Self::TlsHandshakeFailed => "tls_handshake_failed",
            Self::RequestRead => "request_read",
            Self::ResponseWritten => "response_written",
            Self::TunnelOpened => "tunnel_opened",
            Self::TunnelClosed => "tunnel_closed",
            Self::StreamClosed => "stream_closed",
        }
    }
}

/// Request id carried on every event of a flow.
///
/// Seeded from the embedder-configured request-id header when the client sent
/// one, otherwise freshly generated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub id: String,
}

impl TraceContext {
    pub fn derive(header_value: Option<&str>) -> Self {
        match header_value {
            Some(value) if !value.trim().is_empty() => Self {
                id: value.trim().to_string(),
            },
            _ => Self {
                id: uuid::Uuid::new_v4().to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowContext {
    pub trace_id: String,
    pub client_addr: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventType,
    pub context: FlowContext,
    pub occurred_at_unix_ms: u128,
    pub attributes: BTreeMap<String, String>,
}

impl Event {
    pub fn new(kind: EventType, context: FlowContext) -> Self {
        Self {
            kind,
            context,
            occurred_at_unix_ms: now_unix_ms(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    fn emit(&self, event: Event) {
        (**self).emit(event);
    }
}

#[derive(Debug, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: Event) {}
}

#[derive(Debug, Default, Clone)]
pub struct VecEventSink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl VecEventSink {
    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().expect("lock poisoned").clone()
    }
}

impl EventSink for VecEventSink {
    fn emit(&self, event: Event) {
        self.events.lock().expect("lock poisoned").push(event);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct EventRecord<'a> {
    kind: &'static str,
    trace_id: &'a str,
    client_addr: &'a str,
    host: &'a str,
    port: u16,
    occurred_at_unix_ms: u128,
    attributes: &'a BTreeMap<String, String>,
}

/// Writes one JSON object per event, newline-delimited.
#[derive(Debug)]
pub struct JsonLinesEventSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesEventSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner().expect("lock poisoned")
    }

    fn write_event(&self, event: &Event) -> std::io::Result<()> {
        let record = EventRecord {
            kind: event.kind.as_str(),
            trace_id: &event.context.trace_id,
            client_addr: &event.context.client_addr,
            host: &event.context.host,
            port: event.context.port,
            occurred_at_unix_ms: event.occurred_at_unix_ms,
            attributes: &event.attributes,
        };
        let mut line = serde_json::to_vec(&record)
            .map_err(|error| std::io::Error::other(format!("serialize event record: {error}")))?;
        line.push(b'\n');

        let mut writer = self.writer.lock().expect("lock poisoned");
        writer.write_all(&line)?;
        writer.flush()
    }
}

impl<W: Write + Send> EventSink for JsonLinesEventSink<W> {
    fn emit(&self, event: Event) {
        if let Err(error) = self.write_event(&event) {
            eprintln!("event sink write failed: {error}");
        }
    }
}

fn now_unix_ms() -> u128 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis(),
        Err(_) => 0,
    }
}
