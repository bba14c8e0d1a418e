//! # constel: in-guest control plane for confidential Kubernetes nodes
//!
//! Facade crate that re-exports the constel workspace crates so consumers
//! can depend on a single `constel` library.
//!
//! ## Crate breakdown
//!
//! | Module | Crate | Purpose |
//! |--------|-------|---------|
//! | [`core`] | constel-core | Types, lifecycle states, node state, filesystem port, errors |
//! | [`access`] | constel-access | Host users, SSH key reconciliation, etcd I/O priority |
//! | [`cloud`] | constel-cloud | Cloud metadata for Azure, GCP, and QEMU |
//! | [`coordinator`] | constel-coordinator | Node core, peer store, VPN, KMS, coordinator daemon |
//! | [`cli`] | constel-cli | Command tree and logging |

pub use constel_access as access;
pub use constel_cli as cli;
pub use constel_cloud as cloud;
pub use constel_coordinator as coordinator;
pub use constel_core as core;
