//! Dart Debug Adapter Protocol implementation.
//!
//! This crate provides:
//! - A DAP server that speaks the VS Code Debug Adapter Protocol over stdio.
//! - A debug session controller that translates DAP requests into Dart VM
//!   Service RPCs and VM Service events back into DAP events, while tracking
//!   isolates, breakpoints, pause state, and object references.

pub mod coverage;
pub mod dap;
pub mod error;
pub mod package_map;
pub mod registry;
pub mod server;
pub mod session;
pub mod threads;
pub mod variables;

/// Re-export the VM Service client so consumers can depend only on
/// `dart-dap` for debugger-adjacent functionality.
pub mod vmservice {
    pub use dart_vmservice::*;
}

pub use crate::error::{DebugError, DebugResult};
pub use crate::session::DebugSession;
