//! Shared infrastructure utilities for mcode.
//!
//! - **`atomic_write`**: Crash-safe file persistence (temp + rename)
//! - **`diff`**: Line-level edit scripts and the windowed diff renderer used by edit tools

pub mod atomic_write;
pub mod diff;

pub use atomic_write::{PersistMode, atomic_write, atomic_write_with_mode};
pub use diff::{
    CONTEXT_LINES, DiffOpcode, DiffTag, NO_CHANGES, compute_opcodes, render_diff,
    render_focused_diff,
};
