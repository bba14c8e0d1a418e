// constel-coordinator: node core, peer store, VPN datapath, KMS, and the coordinator daemon
// Depends on constel-core (types, node state) and constel-cloud (metadata port)

pub mod activation;
pub mod activationapi;
pub mod cluster;
pub mod config;
pub mod core;
pub mod etcdstore;
pub mod kms;
pub mod reinit;
pub mod server;
pub mod shell;
pub mod store;
pub mod storewrapper;
pub mod tpm;
pub mod vpn;
pub mod vpnapi;

pub use crate::core::Core;
