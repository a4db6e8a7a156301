//! Typed command channel for NIC flow steering.
//!
//! This crate defines the seven device commands the steering tree issues
//! (create/destroy table, create/destroy group, set/delete entry and set
//! root), the records they carry, and the status codes they return.
//!
//! # Architecture
//!
//! - [`types`]: Type-safe device ids and table types
//! - [`error`]: Command status codes and errors
//! - [`match_param`]: 256-byte match masks and values
//! - [`api`]: The [`FlowCommands`] trait and its request records
//! - [`mock`]: An in-memory device used by tests and the `fsctl` tool
//!
//! # Example
//!
//! ```
//! use flowsteer_cmd::{CreateFlowTable, FlowCommands, FlowTableType, MockDevice};
//!
//! let device = MockDevice::new();
//! let table = device
//!     .create_flow_table(&CreateFlowTable {
//!         table_type: FlowTableType::NicRx,
//!         level: 0,
//!         log_size: 4,
//!     })
//!     .unwrap();
//! assert_eq!(device.table_size(table), Some(16));
//! ```

pub mod api;
pub mod error;
pub mod match_param;
pub mod mock;
pub mod types;

// Re-export commonly used types
pub use api::{
    CreateFlowGroup, CreateFlowTable, FlowAction, FlowCommands, FlowDestination, SetFlowEntry,
    DEFAULT_FLOW_TAG, MAX_LOG_TABLE_SIZE,
};
pub use error::{CmdError, CmdOp, CmdResult, CmdStatus, CmdStatusExt};
pub use match_param::{
    Headers, HeadersMut, MatchCriteria, MatchCriteriaEnable, MatchParam, MatchSection,
    MATCH_PARAM_SIZE, MATCH_SET_SIZE,
};
pub use mock::{CommandKind, DeviceCommand, MockDevice, MockEntry};
pub use types::{
    DeviceId, DeviceObjectKind, FlowGroupId, FlowGroupKind, FlowTableId, FlowTableKind,
    FlowTableType, RawDeviceId,
};
