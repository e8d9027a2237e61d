//! # palaver-backend
//!
//! Interfaces to the hosted backend the messaging core runs against: the
//! identity/profile service, the managed relational store, and the
//! publish/subscribe transport.  [`MemoryBackend`] is a complete in-memory
//! implementation of all three, used by tests and local development.

pub mod memory;
pub mod profiles;
pub mod realtime;
pub mod store;

pub use memory::MemoryBackend;
pub use profiles::ProfileService;
pub use realtime::Realtime;
pub use store::ConversationStore;
