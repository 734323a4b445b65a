//! I/O, parsing, RNG, graphics, and delegated numeric operations
//!
//! Collaborator seams consumed by the upcall surface: the connections
//! layer, the expression parser, the graphics device, and the numeric
//! library all live outside this crate and are injected behind traits.
//! Connection transfers are bulk byte copies through the memory adapter.

use super::error::{push_warning, RuntimeError, UpcallResult};
use crate::heap::{Cells, ElemKind, Value, Vector};
use crate::interop::{memory, NativeAddress};
use crate::logging::{debug, trace};
use crate::scratch::{ScratchArena, ScratchPool};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::cell::RefCell;

// ============================================================================
// Collaborator traits
// ============================================================================

/// Byte-stream connections (files, sockets, pipes) owned by the I/O layer
pub trait Connections {
    fn read(&self, id: i32, buf: &mut [u8]) -> UpcallResult<usize>;
    fn write(&self, id: i32, buf: &[u8]) -> UpcallResult<usize>;
}

/// Text-to-expression parsing owned by the parser/evaluator
pub trait ExpressionParser {
    fn parse(&self, text: &str) -> UpcallResult<Value>;
}

/// Legacy documentation-format parser, an external non-reentrant tool
pub trait DocTool {
    fn parse_docs(&self, text: &str) -> UpcallResult<Value>;
}

/// Graphics-device callback target
pub trait GraphicsDelegate {
    fn forward(&self, event: &str, payload: &Value) -> UpcallResult<()>;
}

/// Delegated numeric primitives from the external math library
///
/// Implementations get a scoped scratch arena for working storage and
/// may report precision loss through the warning channel.
pub trait NumericDelegate {
    fn apply(&self, op: &str, input: &[f64], scratch: &mut ScratchArena)
        -> UpcallResult<Vec<f64>>;
}

// ============================================================================
// Default collaborators
// ============================================================================

/// Placeholder connections layer: every channel is unavailable
#[derive(Default)]
pub struct NoConnections;

impl Connections for NoConnections {
    fn read(&self, id: i32, _buf: &mut [u8]) -> UpcallResult<usize> {
        Err(RuntimeError::Io(format!("connection {} is not open", id)))
    }

    fn write(&self, id: i32, _buf: &[u8]) -> UpcallResult<usize> {
        Err(RuntimeError::Io(format!("connection {} is not open", id)))
    }
}

/// Placeholder parser until the evaluator is attached
#[derive(Default)]
pub struct NoParser;

impl ExpressionParser for NoParser {
    fn parse(&self, _text: &str) -> UpcallResult<Value> {
        Err(RuntimeError::Unimplemented("parse"))
    }
}

/// Placeholder documentation tool
#[derive(Default)]
pub struct NoDocTool;

impl DocTool for NoDocTool {
    fn parse_docs(&self, _text: &str) -> UpcallResult<Value> {
        Err(RuntimeError::Unimplemented("parse_docs"))
    }
}

/// Graphics delegate that records events into the structured log
#[derive(Default)]
pub struct LogGraphics;

impl GraphicsDelegate for LogGraphics {
    fn forward(&self, event: &str, _payload: &Value) -> UpcallResult<()> {
        debug!(event = "graphics_forward", callback = event);
        Ok(())
    }
}

/// Built-in numeric delegation for the handful of primitives the
/// boundary itself exercises; everything else belongs to the math library
#[derive(Default)]
pub struct BasicNumeric;

impl NumericDelegate for BasicNumeric {
    fn apply(
        &self,
        op: &str,
        input: &[f64],
        scratch: &mut ScratchArena,
    ) -> UpcallResult<Vec<f64>> {
        match op {
            "sum" => {
                let mut acc = 0.0f64;
                for &x in input {
                    acc += x;
                }
                if acc.abs() > 2f64.powi(53) {
                    push_warning("sum exceeds exact double precision");
                }
                Ok(vec![acc])
            }
            "cumsum" => {
                let buf = scratch.alloc(input.len());
                let mut acc = 0.0f64;
                for (slot, &x) in buf.iter_mut().zip(input) {
                    acc += x;
                    *slot = acc;
                }
                Ok(buf.to_vec())
            }
            _ => Err(RuntimeError::Unimplemented("numeric primitive")),
        }
    }
}

// ============================================================================
// Operation tables
// ============================================================================

// The external documentation tool is not reentrant; every invocation in
// the process takes this lock.
static DOC_TOOL_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Connection, parse, and graphics operations
pub struct IoOps {
    connections: Box<dyn Connections>,
    parser: Box<dyn ExpressionParser>,
    doc_tool: Box<dyn DocTool>,
    graphics: Box<dyn GraphicsDelegate>,
}

impl IoOps {
    pub fn new(
        connections: Box<dyn Connections>,
        parser: Box<dyn ExpressionParser>,
        doc_tool: Box<dyn DocTool>,
        graphics: Box<dyn GraphicsDelegate>,
    ) -> Self {
        Self {
            connections,
            parser,
            doc_tool,
            graphics,
        }
    }

    /// Read up to `count` bytes from a connection into native memory
    ///
    /// Staged through a managed raw vector and bulk-copied out by the
    /// memory adapter; no per-byte boxing.
    pub fn read_bytes(&self, id: i32, dst: NativeAddress, count: usize) -> UpcallResult<usize> {
        let staging = Vector::alloc(ElemKind::Raw, count);
        let got = {
            let mut cells = staging.cells_mut();
            match &mut *cells {
                Cells::Raw(buf) => self.connections.read(id, buf)?,
                _ => crate::defect!("raw staging vector changed kind"),
            }
        };
        unsafe { memory::copy_from_managed(&staging, dst, got) }
            .map_err(|e| RuntimeError::Io(e.to_string()))?;
        trace!(event = "connection_read", connection = id, bytes = got);
        Ok(got)
    }

    /// Write `count` bytes from native memory to a connection
    pub fn write_bytes(&self, id: i32, src: NativeAddress, count: usize) -> UpcallResult<usize> {
        let staging = Vector::alloc(ElemKind::Raw, count);
        unsafe { memory::copy_to_managed(src, &staging, count) }
            .map_err(|e| RuntimeError::Io(e.to_string()))?;
        let cells = staging.cells();
        let put = match &*cells {
            Cells::Raw(buf) => self.connections.write(id, buf)?,
            _ => crate::defect!("raw staging vector changed kind"),
        };
        trace!(event = "connection_write", connection = id, bytes = put);
        Ok(put)
    }

    /// Parse source text into an expression value
    pub fn parse(&self, text: &str) -> UpcallResult<Value> {
        self.parser.parse(text)
    }

    /// Invoke the non-reentrant documentation parser under the
    /// process-wide lock
    pub fn parse_docs(&self, text: &str) -> UpcallResult<Value> {
        let _guard = DOC_TOOL_LOCK.lock();
        self.doc_tool.parse_docs(text)
    }

    /// Forward a graphics-device callback
    pub fn forward_graphics(&self, event: &str, payload: &Value) -> UpcallResult<()> {
        self.graphics.forward(event, payload)
    }
}

impl Default for IoOps {
    fn default() -> Self {
        Self::new(
            Box::new(NoConnections),
            Box::new(NoParser),
            Box::new(NoDocTool),
            Box::new(LogGraphics),
        )
    }
}

/// RNG seed-state access
///
/// The generator itself belongs to the math library; this surface only
/// stores and hands back the seed array.
pub struct RngOps {
    state: RefCell<Vec<u32>>,
}

impl Default for RngOps {
    fn default() -> Self {
        Self {
            state: RefCell::new(vec![0; 6]),
        }
    }
}

impl RngOps {
    /// Snapshot the seed state as an integer vector
    pub fn get_state(&self) -> Value {
        let state = self.state.borrow();
        Value::Vector(Vector::from_cells(Cells::Int(
            state.iter().map(|&x| x as i32).collect(),
        )))
    }

    /// Replace the seed state from an integer vector
    pub fn put_state(&self, value: &Value) -> UpcallResult<()> {
        match value {
            Value::Vector(v) if v.kind() == ElemKind::Int => {
                let cells = v.cells();
                if let Cells::Int(ints) = &*cells {
                    *self.state.borrow_mut() = ints.iter().map(|&x| x as u32).collect();
                }
                Ok(())
            }
            other => Err(RuntimeError::Type {
                expected: "integer vector",
                actual: other.type_name(),
            }),
        }
    }
}

/// Delegated numeric primitives with per-call scratch arenas
pub struct NumOps {
    delegate: Box<dyn NumericDelegate>,
    pool: RefCell<ScratchPool>,
}

impl NumOps {
    pub fn new(delegate: Box<dyn NumericDelegate>) -> Self {
        Self {
            delegate,
            pool: RefCell::new(ScratchPool::new()),
        }
    }

    /// Run one delegated primitive; scratch is acquired for this call
    /// and released by scope, never shared across calls
    pub fn apply(&self, op: &str, input: &[f64]) -> UpcallResult<Vec<f64>> {
        let mut arena = self.pool.borrow_mut().acquire(input.len());
        let result = self.delegate.apply(op, input, &mut arena);
        self.pool.borrow_mut().release(arena);
        result
    }

    /// Arenas currently outstanding (test instrumentation)
    pub fn outstanding_scratch(&self) -> usize {
        self.pool.borrow().outstanding()
    }
}

impl Default for NumOps {
    fn default() -> Self {
        Self::new(Box::new(BasicNumeric))
    }
}
