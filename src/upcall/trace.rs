//! Tracing decorator for the upcall surface
//!
//! A pure observer around the façade: before and after each operation it
//! records the call depth and a short argument synopsis. Semantics are
//! never altered; sink writes are serialized and append-only, and a
//! failing sink is the sink's problem, never the call's.

use crate::heap::Value;
use parking_lot::Mutex;
use std::cell::Cell;
use std::sync::Arc;

const PREVIEW_LIMIT: usize = 30;

/// Serialized, append-only destination for trace lines
pub trait TraceSink: Send + Sync {
    fn append(&self, line: &str);
}

/// In-memory sink (tests, interactive inspection)
#[derive(Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

impl TraceSink for MemorySink {
    fn append(&self, line: &str) {
        self.lines.lock().push(line.to_string());
    }
}

/// Sink forwarding into the structured log
pub struct LogSink;

impl TraceSink for LogSink {
    fn append(&self, line: &str) {
        crate::logging::trace!(event = "upcall_trace", line = line);
    }
}

/// The decorator state: an injected sink and an immutable enabled flag
///
/// Depth counts nested upcalls on this thread only; the surface is
/// single-threaded per execution context.
pub struct Tracer {
    sink: Arc<dyn TraceSink>,
    depth: Cell<usize>,
}

impl Tracer {
    pub fn new(sink: Arc<dyn TraceSink>) -> Self {
        Self {
            sink,
            depth: Cell::new(0),
        }
    }

    /// Record entry into an upcall; returns the depth used for the exit line
    pub fn enter(&self, name: &str, args: &[&Value]) {
        let depth = self.depth.get();
        self.depth.set(depth + 1);
        let mut line = format!("{:width$}> {}(", "", name, width = depth * 2);
        for (i, arg) in args.iter().enumerate() {
            if i > 0 {
                line.push_str(", ");
            }
            line.push_str(&synopsis(arg));
        }
        line.push(')');
        self.sink.append(&line);
    }

    /// Record return from an upcall
    pub fn exit(&self, name: &str, outcome: &str) {
        let depth = self.depth.get().saturating_sub(1);
        self.depth.set(depth);
        let line = format!("{:width$}< {} -> {}", "", name, outcome, width = depth * 2);
        self.sink.append(&line);
    }
}

/// Short argument synopsis: type name, identity hash, content preview,
/// and the pointer address for external pointers
pub fn synopsis(value: &Value) -> String {
    let preview = preview(value);
    match value {
        Value::ExternalPtr(ptr) => format!(
            "externalptr#{:x}@{:#x}",
            value.identity() & 0xffff,
            ptr.addr.get()
        ),
        _ if preview.is_empty() => {
            format!("{}#{:x}", value.type_name(), value.identity() & 0xffff)
        }
        _ => format!(
            "{}#{:x}[{}]",
            value.type_name(),
            value.identity() & 0xffff,
            preview
        ),
    }
}

/// Content preview truncated to 30 characters
fn preview(value: &Value) -> String {
    let full = match value {
        Value::Null | Value::Unbound | Value::Missing => String::new(),
        Value::Symbol(s) => s.name().to_string(),
        Value::Char(c) => c.to_string(),
        Value::Env(e) => format!("frame:{}", e.frame_size()),
        Value::Vector(v) => {
            let mut parts = Vec::new();
            for i in 0..v.len().min(4) {
                parts.push(match v.get(i) {
                    crate::heap::Scalar::Int(x) => x.to_string(),
                    crate::heap::Scalar::Real(x) => x.to_string(),
                    crate::heap::Scalar::Logical(x) => x.to_string(),
                    crate::heap::Scalar::Raw(x) => x.to_string(),
                    crate::heap::Scalar::Str(s) => s.to_string(),
                    crate::heap::Scalar::Complex(x) => format!("{}+{}i", x.re, x.im),
                    crate::heap::Scalar::Value(_) => "..".to_string(),
                });
            }
            parts.join(" ")
        }
        Value::Altrep(a) => a.class().name().to_string(),
        Value::Pairlist(_) => format!("n:{}", value.length()),
        Value::Promise(_) => "promise".to_string(),
        Value::ExternalPtr(_) | Value::WeakRef(_) => String::new(),
    };
    let mut out: String = full.chars().take(PREVIEW_LIMIT).collect();
    if full.chars().count() > PREVIEW_LIMIT {
        out.push('~');
    }
    out
}
