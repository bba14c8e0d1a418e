use thiserror::Error;

/// Error kinds shared across the node control plane.
///
/// Most call sites return `anyhow::Result`; these variants stay reachable
/// through `anyhow::Error::downcast_ref` (see [`find`]) so callers can branch
/// on the kind instead of the message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Malformed provider ID, service-account URI, or missing required tag. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Cloud or KMS RPC failure. Retried only by the reinitialization loop.
    #[error("remote call failed: {0}")]
    TransientRemote(String),
    /// Split-brain between TPM and node state, exhausted IP pool, store transfer conflict.
    #[error("state invariant violated: {0}")]
    StateInvariant(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unsupported by platform: {0}")]
    PlatformUnsupported(String),
    #[error("trying to request data key before KMS is set up")]
    KmsUninitialized,
}

/// Find the first [`Error`] in an error chain.
pub fn find(err: &anyhow::Error) -> Option<&Error> {
    err.chain().find_map(|e| e.downcast_ref::<Error>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_find_through_context() {
        let err: anyhow::Result<()> = Err(Error::NotFound("instance x".to_string()))
            .context("retrieving instance");
        let err = err.unwrap_err();
        assert_eq!(find(&err), Some(&Error::NotFound("instance x".to_string())));
        assert!(format!("{:#}", err).contains("not found: instance x"));
    }

    #[test]
    fn test_find_absent() {
        let err = anyhow::anyhow!("plain failure");
        assert!(find(&err).is_none());
    }
}
