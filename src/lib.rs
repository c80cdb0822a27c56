//! Concurrent inference dispatch for benchmark runs.
//!
//! A run takes the pending test cases of a catalogue, sends each one to an
//! inference provider on a bounded worker pool, and streams every result to a
//! durable sink as soon as it exists. Transient provider failures retry with a
//! delay that shrinks as the run drains; a watchdog cuts those waits short
//! when the tail of a run goes quiet.

pub mod anthropic;
pub mod cli;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod job;
pub mod retry;
pub mod sink;
pub mod source;
pub mod state;
pub mod ui;
pub mod watchdog;
