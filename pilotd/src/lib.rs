//! Pilot host agent library.
//!
//! Registers a device with the pilot control plane, then keeps it under
//! management: a ping loop fetches commands, a crash-safe filesystem
//! queue executes them exactly once across restarts, and spooled
//! telemetry is forwarded channel by channel with backoff.

pub mod activation;
pub mod config;
pub mod control;
pub mod crypto;
pub mod cve;
pub mod event_spool;
pub mod job_queue;
pub mod keystore;
pub mod pilot;
pub mod telemetry;
pub mod worker;
