//! Provider registry.
//!
//! Maps aliases to provider descriptors and persists them in one JSON
//! document under the broker home.

mod descriptor;
mod store;

pub use descriptor::{
    BuildState, Environment, Language, LaunchSpec, ManagedSource, ProviderDescriptor,
    ProviderView, Registration, TransportKind, validate_alias,
};
pub use store::{RegistryDocument, RegistryStore};
