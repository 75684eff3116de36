//! Document access: host collaborator traits and the shared handle cache.

pub mod context;
pub mod host;

pub use context::{DocumentContext, run_sweeper};
pub use host::{DocumentHandle, DocumentHost};
