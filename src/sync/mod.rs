//! Client side of board sync.
//!
//! ARCHITECTURE
//! ============
//! `engine` owns the optimistic working copy and all reconciliation rules and
//! is driven purely by method calls. `scheduler` is the debounce buffer it
//! flushes through. `driver` connects an engine to a live server over a
//! websocket and is the only part that does I/O.

pub mod driver;
pub mod engine;
pub mod scheduler;
