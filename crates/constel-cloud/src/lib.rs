// constel-cloud: Uniform instance/peer lookup over Azure, GCP, and QEMU
// Depends on constel-core (Instance, Role, error taxonomy)

pub mod azure;
pub mod ccm;
pub mod fake;
pub mod gcp;
pub mod http;
pub mod provider;
pub mod qemu;

pub use provider::{MetadataEndpoints, Provider, ProviderKind};
