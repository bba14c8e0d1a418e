// constel-access: passwd parsing, user management, SSH key reconciliation
// Depends on constel-core (filesystem port, constants)

pub mod manager;
pub mod passwd;
pub mod ssh;
pub mod user;

// Only available on Linux; callers must gate their use of it the same way.
#[cfg(target_os = "linux")]
pub mod ioprio;
