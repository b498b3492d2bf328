//! Session protocol: control messages, frame routing and the catalog.

pub mod catalog;
pub mod messages;
pub mod router;

pub use catalog::{Adoption, Catalog};
pub use messages::{ControlMessage, FileMetadata};
pub use router::{Inbound, MessageRouter};
