//! Session history stores for Nimbot.
//!
//! - [`InMemorySessionStore`]: process-local, for tests and one-shot CLI runs
//! - [`JsonlSessionStore`]: one JSON-lines file per session key

pub mod in_memory;
pub mod jsonl;

pub use in_memory::InMemorySessionStore;
pub use jsonl::JsonlSessionStore;
