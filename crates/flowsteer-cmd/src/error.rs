//! Device command status codes and errors.
//!
//! Every flow-steering command returns a one-byte status in its output
//! mailbox. This module turns those codes into Rust `Result`s so the tree
//! engine can propagate device failures with `?`.

use std::fmt;
use thiserror::Error;

/// Command completion status as reported by the device.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmdStatus {
    Ok = 0x00,
    InternalError = 0x01,
    BadOperation = 0x02,
    BadParameter = 0x03,
    BadSystemState = 0x04,
    BadResource = 0x05,
    ResourceBusy = 0x06,
    ExceedLimit = 0x08,
    BadResourceState = 0x09,
    BadIndex = 0x0a,
    NoResources = 0x0f,
    BadInputLength = 0x50,
    BadOutputLength = 0x51,
}

impl CmdStatus {
    /// Creates a CmdStatus from the raw status byte.
    ///
    /// Unknown codes are folded into `InternalError`.
    pub fn from_raw(status: u8) -> Self {
        match status {
            0x00 => CmdStatus::Ok,
            0x01 => CmdStatus::InternalError,
            0x02 => CmdStatus::BadOperation,
            0x03 => CmdStatus::BadParameter,
            0x04 => CmdStatus::BadSystemState,
            0x05 => CmdStatus::BadResource,
            0x06 => CmdStatus::ResourceBusy,
            0x08 => CmdStatus::ExceedLimit,
            0x09 => CmdStatus::BadResourceState,
            0x0a => CmdStatus::BadIndex,
            0x0f => CmdStatus::NoResources,
            0x50 => CmdStatus::BadInputLength,
            0x51 => CmdStatus::BadOutputLength,
            _ => CmdStatus::InternalError,
        }
    }

    /// Returns the raw status byte.
    pub fn as_raw(&self) -> u8 {
        *self as u8
    }

    /// Returns true if the status indicates success.
    pub fn is_ok(&self) -> bool {
        *self == CmdStatus::Ok
    }

    /// Converts to a Result for the named operation.
    pub fn into_result(self, op: CmdOp) -> CmdResult<()> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(CmdError::Status { op, status: self })
        }
    }
}

impl fmt::Display for CmdStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmdStatus::Ok => "CMD_STAT_OK",
            CmdStatus::InternalError => "CMD_STAT_INT_ERR",
            CmdStatus::BadOperation => "CMD_STAT_BAD_OP_ERR",
            CmdStatus::BadParameter => "CMD_STAT_BAD_PARAM_ERR",
            CmdStatus::BadSystemState => "CMD_STAT_BAD_SYS_STATE_ERR",
            CmdStatus::BadResource => "CMD_STAT_BAD_RES_ERR",
            CmdStatus::ResourceBusy => "CMD_STAT_RES_BUSY",
            CmdStatus::ExceedLimit => "CMD_STAT_LIM_ERR",
            CmdStatus::BadResourceState => "CMD_STAT_BAD_RES_STATE_ERR",
            CmdStatus::BadIndex => "CMD_STAT_IX_ERR",
            CmdStatus::NoResources => "CMD_STAT_NO_RES_ERR",
            CmdStatus::BadInputLength => "CMD_STAT_BAD_INP_LEN_ERR",
            CmdStatus::BadOutputLength => "CMD_STAT_BAD_OUTP_LEN_ERR",
        };
        write!(f, "{}", s)
    }
}

/// Flow-steering command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmdOp {
    SetFlowTableRoot,
    CreateFlowTable,
    DestroyFlowTable,
    CreateFlowGroup,
    DestroyFlowGroup,
    SetFlowTableEntry,
    DeleteFlowTableEntry,
}

impl CmdOp {
    /// Returns the device opcode.
    pub fn opcode(&self) -> u16 {
        match self {
            CmdOp::SetFlowTableRoot => 0x92f,
            CmdOp::CreateFlowTable => 0x930,
            CmdOp::DestroyFlowTable => 0x931,
            CmdOp::CreateFlowGroup => 0x933,
            CmdOp::DestroyFlowGroup => 0x934,
            CmdOp::SetFlowTableEntry => 0x936,
            CmdOp::DeleteFlowTableEntry => 0x938,
        }
    }
}

impl fmt::Display for CmdOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmdOp::SetFlowTableRoot => "SET_FLOW_TABLE_ROOT",
            CmdOp::CreateFlowTable => "CREATE_FLOW_TABLE",
            CmdOp::DestroyFlowTable => "DESTROY_FLOW_TABLE",
            CmdOp::CreateFlowGroup => "CREATE_FLOW_GROUP",
            CmdOp::DestroyFlowGroup => "DESTROY_FLOW_GROUP",
            CmdOp::SetFlowTableEntry => "SET_FLOW_TABLE_ENTRY",
            CmdOp::DeleteFlowTableEntry => "DELETE_FLOW_TABLE_ENTRY",
        };
        write!(f, "{}", s)
    }
}

/// Error type for device commands.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CmdError {
    /// The device completed the command with a failure status.
    #[error("{op} failed: {status}")]
    Status { op: CmdOp, status: CmdStatus },

    /// The request was rejected before it was posted.
    #[error("Invalid parameter: {message}")]
    InvalidParameter { message: String },

    /// The command referenced an object the device does not know.
    #[error("Object not found: {object}")]
    NotFound { object: String },

    /// Internal error.
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl CmdError {
    /// Creates a status error for an operation.
    pub fn status(op: CmdOp, status: CmdStatus) -> Self {
        CmdError::Status { op, status }
    }

    /// Creates an invalid parameter error.
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        CmdError::InvalidParameter {
            message: message.into(),
        }
    }

    /// Creates a not found error.
    pub fn not_found(object: impl Into<String>) -> Self {
        CmdError::NotFound {
            object: object.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        CmdError::Internal {
            message: message.into(),
        }
    }

    /// Returns the device status, if the device produced one.
    pub fn device_status(&self) -> Option<CmdStatus> {
        match self {
            CmdError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Result type for device commands.
pub type CmdResult<T> = Result<T, CmdError>;

/// Extension trait for converting raw status bytes to Results.
pub trait CmdStatusExt {
    /// Converts the raw status to a Result for the given operation.
    fn to_cmd_result(self, op: CmdOp) -> CmdResult<()>;
}

impl CmdStatusExt for u8 {
    fn to_cmd_result(self, op: CmdOp) -> CmdResult<()> {
        CmdStatus::from_raw(self).into_result(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_raw() {
        assert_eq!(CmdStatus::from_raw(0x00), CmdStatus::Ok);
        assert_eq!(CmdStatus::from_raw(0x06), CmdStatus::ResourceBusy);
        assert_eq!(CmdStatus::from_raw(0x0f), CmdStatus::NoResources);
        assert_eq!(CmdStatus::from_raw(0x7e), CmdStatus::InternalError);
    }

    #[test]
    fn test_status_into_result() {
        assert!(CmdStatus::Ok.into_result(CmdOp::CreateFlowTable).is_ok());

        let err = CmdStatus::NoResources
            .into_result(CmdOp::CreateFlowGroup)
            .unwrap_err();
        assert_eq!(err.device_status(), Some(CmdStatus::NoResources));
        assert_eq!(
            err.to_string(),
            "CREATE_FLOW_GROUP failed: CMD_STAT_NO_RES_ERR"
        );
    }

    #[test]
    fn test_status_ext() {
        assert!(0u8.to_cmd_result(CmdOp::SetFlowTableEntry).is_ok());
        assert!(3u8.to_cmd_result(CmdOp::SetFlowTableEntry).is_err());
    }

    #[test]
    fn test_opcodes() {
        assert_eq!(CmdOp::CreateFlowTable.opcode(), 0x930);
        assert_eq!(CmdOp::DeleteFlowTableEntry.opcode(), 0x938);
    }

    #[test]
    fn test_error_helpers() {
        let err = CmdError::invalid_parameter("log_size 40 out of range");
        assert!(err.to_string().contains("log_size 40"));
        assert_eq!(err.device_status(), None);
    }
}
