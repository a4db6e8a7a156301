//! Error types for the steering tree.

use flowsteer_cmd::CmdError;
use thiserror::Error;

/// Error type for flow-steering tree operations.
#[derive(Debug, Clone, Error)]
pub enum FsError {
    /// No free index, group range or table slot.
    #[error("No space left: {resource}")]
    NoSpace { resource: String },

    /// Unknown priority, bad range, or similar caller mistake.
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// The operation is not allowed on this object in its current state.
    #[error("Operation not permitted: {message}")]
    PermissionDenied { message: String },

    /// The object still has children.
    #[error("Object busy: {object}")]
    Busy { object: String },

    /// The object was already torn down.
    #[error("Not found: {item}")]
    NotFound { item: String },

    /// An entry with the same match is already installed but its group has
    /// no free index to rewrite it with the extra destination.
    #[error("Entry {entry} of group {group} can't be rewritten: no free index")]
    EntryFull { group: String, entry: String },

    /// A rule was added to a table that has neither a matching group nor
    /// autogroup mode.
    #[error("Table {table} needs an explicit group for this match criteria")]
    ExplicitGroupRequired { table: String },

    /// The device rejected a command.
    #[error("Device command failed: {0}")]
    Device(#[from] CmdError),

    /// A notifier callback refused an event.
    #[error("Notifier error: {message}")]
    Notifier { message: String },

    /// Invalid configuration or template.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Internal invariant violation.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl FsError {
    pub fn no_space(resource: impl Into<String>) -> Self {
        FsError::NoSpace {
            resource: resource.into(),
        }
    }

    pub fn entry_full(group: impl Into<String>, entry: impl Into<String>) -> Self {
        FsError::EntryFull {
            group: group.into(),
            entry: entry.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        FsError::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        FsError::PermissionDenied {
            message: message.into(),
        }
    }

    pub fn busy(object: impl Into<String>) -> Self {
        FsError::Busy {
            object: object.into(),
        }
    }

    pub fn not_found(item: impl Into<String>) -> Self {
        FsError::NotFound { item: item.into() }
    }

    pub fn notifier(message: impl Into<String>) -> Self {
        FsError::Notifier {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        FsError::Config {
            message: message.into(),
        }
    }

    /// Creates an internal error and logs it.
    pub fn internal(message: impl Into<String>) -> Self {
        let message = message.into();
        log::error!("flow steering invariant violated: {}", message);
        FsError::Internal { message }
    }

    /// Kernel-style errno for this error.
    pub fn errno(&self) -> i32 {
        const EPERM: i32 = 1;
        const ENOENT: i32 = 2;
        const EIO: i32 = 5;
        const EBUSY: i32 = 16;
        const EINVAL: i32 = 22;
        const ENOSPC: i32 = 28;

        match self {
            FsError::NoSpace { .. } | FsError::EntryFull { .. } => ENOSPC,
            FsError::InvalidArgument { .. } | FsError::Config { .. } => EINVAL,
            FsError::ExplicitGroupRequired { .. } => EINVAL,
            FsError::PermissionDenied { .. } => EPERM,
            FsError::Busy { .. } => EBUSY,
            FsError::NotFound { .. } => ENOENT,
            FsError::Device(_) | FsError::Notifier { .. } | FsError::Internal { .. } => EIO,
        }
    }

    /// Returns true for capacity errors, which let rule insertion move on
    /// to the next candidate group.
    pub fn is_no_space(&self) -> bool {
        matches!(self, FsError::NoSpace { .. })
    }
}

/// Result type alias for the steering tree.
pub type FsResult<T> = Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;
    use flowsteer_cmd::{CmdOp, CmdStatus};

    #[test]
    fn test_errno_mapping() {
        assert_eq!(FsError::no_space("group").errno(), 28);
        assert_eq!(FsError::permission_denied("not last").errno(), 1);
        assert_eq!(FsError::busy("table").errno(), 16);
        // same errno as a full group, but never a reason to try another one
        let full = FsError::entry_full("group_3", "fte_0");
        assert_eq!(full.errno(), 28);
        assert!(!full.is_no_space());
        let dev: FsError =
            CmdError::status(CmdOp::SetFlowTableEntry, CmdStatus::BadParameter).into();
        assert_eq!(dev.errno(), 5);
    }

    #[test]
    fn test_device_error_display() {
        let err = FsError::from(CmdError::status(
            CmdOp::CreateFlowTable,
            CmdStatus::NoResources,
        ));
        assert_eq!(
            err.to_string(),
            "Device command failed: CREATE_FLOW_TABLE failed: CMD_STAT_NO_RES_ERR"
        );
        assert!(!err.is_no_space());
    }
}
