// constel-core: Pure types, node state, filesystem port, utilities
// No internal constel dependencies. This is the foundation crate.

pub mod constants;
pub mod error;
pub mod fs;
pub mod instance;
pub mod naming;
pub mod nodestate;
pub mod retry;
pub mod role;
pub mod serviceaccount;
pub mod state;

pub use error::Error;
