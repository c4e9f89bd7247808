//! Backend and client registries.

pub mod backends;
pub mod clients;

pub use backends::{BackendEntry, BackendRegistry, Registration};
pub use clients::{ClientEntry, ClientRegistry};
