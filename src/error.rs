use thiserror::Error;

/// Result alias used throughout the crate.
pub type ShmResult<T> = Result<T, ShmError>;

/// Errors produced by the shared-memory transports.
///
/// Fast-path failures (`NotInitialized`, `SizeExceeded`) indicate caller
/// bugs and are returned without any side effects or logging. Everything
/// else can only surface during `init`/`destroy`, where all partially
/// acquired resources are rolled back before the error is returned.
#[derive(Debug, Error)]
pub enum ShmError {
    /// Operation called before `init()` succeeded or after `destroy()`.
    #[error("channel not initialized")]
    NotInitialized,

    /// Channel name failed POSIX shared-memory naming rules.
    #[error("invalid channel name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// Region creation raced another creator holding the same name.
    #[error("shared memory name already in use: '{0}'")]
    NameInUse(String),

    /// No region with this name exists (the writer has not created it yet).
    #[error("shared memory object not found: '{0}'")]
    NotFound(String),

    /// The opened region's magic or static header fields did not match.
    #[error("corrupt or incompatible region '{name}': {reason}")]
    Corrupt { name: String, reason: &'static str },

    /// Payload length exceeds the per-slot capacity. The publish is refused.
    #[error("payload of {len} bytes exceeds slot capacity {capacity}")]
    SizeExceeded { len: usize, capacity: usize },

    /// The kernel refused the allocation (region size, huge-page pool, or
    /// descriptor table exhausted).
    #[error("resource exhausted while acquiring '{0}'")]
    ResourceExhausted(String),

    /// The OS refused the named-object open or create.
    #[error("permission denied for '{0}'")]
    PermissionDenied(String),

    /// All consumer slots in the broadcast registry are taken.
    #[error("consumer registry full ({0} slots)")]
    RegistryFull(usize),

    /// Any other OS-level failure, with errno context.
    #[error("OS error on '{name}': {source}")]
    Os {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

impl ShmError {
    /// Classifies `errno` from a failed named-object or mapping call.
    pub(crate) fn from_os(name: &str, err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => Self::NotFound(name.to_string()),
            ErrorKind::AlreadyExists => Self::NameInUse(name.to_string()),
            ErrorKind::PermissionDenied => Self::PermissionDenied(name.to_string()),
            ErrorKind::OutOfMemory => Self::ResourceExhausted(name.to_string()),
            _ => match err.raw_os_error() {
                Some(libc::ENOSPC) | Some(libc::EMFILE) | Some(libc::ENFILE)
                | Some(libc::EFBIG) => Self::ResourceExhausted(name.to_string()),
                _ => Self::Os {
                    name: name.to_string(),
                    source: err,
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_maps_to_taxonomy() {
        let e = ShmError::from_os("/ch", std::io::Error::from_raw_os_error(libc::ENOENT));
        assert!(matches!(e, ShmError::NotFound(_)));

        let e = ShmError::from_os("/ch", std::io::Error::from_raw_os_error(libc::EEXIST));
        assert!(matches!(e, ShmError::NameInUse(_)));

        let e = ShmError::from_os("/ch", std::io::Error::from_raw_os_error(libc::EACCES));
        assert!(matches!(e, ShmError::PermissionDenied(_)));

        let e = ShmError::from_os("/ch", std::io::Error::from_raw_os_error(libc::ENOMEM));
        assert!(matches!(e, ShmError::ResourceExhausted(_)));

        let e = ShmError::from_os("/ch", std::io::Error::from_raw_os_error(libc::EMFILE));
        assert!(matches!(e, ShmError::ResourceExhausted(_)));
    }

    #[test]
    fn unclassified_errno_keeps_source() {
        let e = ShmError::from_os("/ch", std::io::Error::from_raw_os_error(libc::EINVAL));
        match e {
            ShmError::Os { name, source } => {
                assert_eq!(name, "/ch");
                assert_eq!(source.raw_os_error(), Some(libc::EINVAL));
            }
            other => panic!("expected Os variant, got {other:?}"),
        }
    }
}
