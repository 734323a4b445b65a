//! Rhea Runtime - native interoperability core for the Rhea language
//!
//! This crate provides the boundary between the managed Rhea heap and
//! compiled native extensions built against the `rhea_*` embedding API:
//! symbol/library registration, the two-backend call bridge, the ALTREP
//! alternative-representation mechanism, the upcall surface, and call
//! context reflection.

#![allow(dead_code)]

pub mod logging;
pub mod heap;
pub mod scratch;
pub mod interop;
pub mod altrep;
pub mod context;
pub mod upcall;

// Re-export core types
pub use heap::Value;
pub use interop::{CallBridge, NativeBackend};

/// Runtime initialization
#[no_mangle]
pub extern "C" fn rhea_runtime_init() {
    logging::init();
    interop::init();
    upcall::init();
}

/// Runtime cleanup
#[no_mangle]
pub extern "C" fn rhea_runtime_cleanup() {
    upcall::cleanup();
}
