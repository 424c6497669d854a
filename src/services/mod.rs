//! Server-side services used by websocket and HTTP routes.
//!
//! ARCHITECTURE
//! ============
//! `mutation` owns every write to board documents and triggers `broadcast`
//! after each successful write. Route handlers stay focused on protocol
//! translation.

pub mod broadcast;
pub mod mutation;
