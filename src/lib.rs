//! Collaborative board sync: an atomic mutation service with change
//! broadcast on the server, and an optimistic reconciliation engine for
//! clients.

pub mod config;
pub mod db;
pub mod doc;
pub mod frame;
pub mod protocol;
pub mod routes;
pub mod services;
pub mod state;
pub mod sync;
