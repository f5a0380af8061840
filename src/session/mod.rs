/// Session bookkeeping: durable manifest and in-memory registry

// SQLite record of sessions and the namespaces they created
pub mod manifest;

// Hot-swappable map of live storage managers
pub mod registry;

pub use manifest::{NamespaceRecord, SessionManifest, SessionRecord};
pub use registry::SessionRegistry;
