use thiserror::Error;

/// Errors produced by the protocol and query layers.
///
/// Fallible operations return `anyhow::Result`; this type rides inside the
/// chain so callers can tell kernel semantics, decode failures and lookup
/// cardinality apart with `downcast_ref`.
#[derive(Debug, Error)]
pub enum Error {
    /// The kernel acknowledged a request with a nonzero status code.
    /// The message is the kernel's own error text for that code.
    #[error("{message} ({errno})")]
    Kernel { errno: i32, message: String },

    /// A reply buffer was shorter than the fixed kernel header it must
    /// start with. Fatal for the affected record.
    #[error("truncated message: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// The buffer parsed, but violates a protocol invariant.
    #[error("decode error: {0}")]
    Decode(String),

    /// A lookup that must yield exactly one record yielded none.
    #[error("not found: {0}")]
    NotFound(String),

    /// A lookup that must yield exactly one record yielded several.
    #[error("not unique: {0}")]
    NotUnique(String),
}

impl Error {
    /// Build a `Kernel` error from the raw (negative) status code of an
    /// error frame, attaching the kernel's errno string.
    pub fn from_ack_code(code: i32) -> Self {
        let errno = -code;
        let message = std::io::Error::from_raw_os_error(errno).to_string();
        Self::Kernel { errno, message }
    }
}

/// True when the error is the kernel's "already exists" answer to a create.
pub fn is_exists(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<Error>(),
        Some(Error::Kernel { errno, .. }) if *errno == libc::EEXIST
    )
}

/// True when the error means the target object does not exist: the
/// kernel's "no such device"/"no such file" answer to a delete (ESRCH is
/// what route deletion reports), or a zero-match lookup.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<Error>() {
        Some(Error::Kernel { errno, .. }) => {
            *errno == libc::ENODEV || *errno == libc::ENOENT || *errno == libc::ESRCH
        }
        Some(Error::NotFound(_)) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_code_errno() {
        let err = Error::from_ack_code(-libc::EEXIST);
        match &err {
            Error::Kernel { errno, message } => {
                assert_eq!(*errno, libc::EEXIST);
                assert!(!message.is_empty());
            }
            _ => panic!("wrong variant"),
        }

        let any: anyhow::Error = err.into();
        assert!(is_exists(&any));
        assert!(!is_not_found(&any));
    }

    #[test]
    fn test_not_found_classes() {
        let enodev: anyhow::Error = Error::from_ack_code(-libc::ENODEV).into();
        let enoent: anyhow::Error = Error::from_ack_code(-libc::ENOENT).into();
        let esrch: anyhow::Error = Error::from_ack_code(-libc::ESRCH).into();
        let lookup: anyhow::Error = Error::NotFound("vethA".to_string()).into();
        let other: anyhow::Error = Error::from_ack_code(-libc::EINVAL).into();

        assert!(is_not_found(&enodev));
        assert!(is_not_found(&enoent));
        assert!(is_not_found(&esrch));
        assert!(is_not_found(&lookup));
        assert!(!is_not_found(&other));
        assert!(!is_exists(&other));
    }

    #[test]
    fn test_context_wrapped_errors_still_downcast() {
        let err: anyhow::Error = Error::from_ack_code(-libc::EEXIST).into();
        let wrapped = err.context("adding link foo");
        assert!(is_exists(&wrapped));
    }
}
