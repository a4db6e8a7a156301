//! The command channel between the steering tree and the device.
//!
//! The tree engine never touches hardware directly. Every mutation is one
//! of the seven commands on [`FlowCommands`], each of which either succeeds
//! or returns a [`CmdError`](crate::CmdError) that is propagated unchanged.
//!
//! # Available API Modules
//!
//! - [`flow`]: Command records for tables, groups and entries

pub mod flow;

pub use flow::{
    CreateFlowGroup, CreateFlowTable, FlowAction, FlowDestination, SetFlowEntry,
    DEFAULT_FLOW_TAG, MAX_LOG_TABLE_SIZE,
};

use crate::error::CmdResult;
use crate::types::{FlowGroupId, FlowTableId, FlowTableType};

/// Flow-steering device commands.
///
/// Implementations must be callable from several threads at once; the tree
/// serializes commands that touch the same object itself.
pub trait FlowCommands: Send + Sync {
    /// Creates a flow table and returns its device id.
    fn create_flow_table(&self, req: &CreateFlowTable) -> CmdResult<FlowTableId>;

    /// Destroys an empty flow table.
    fn destroy_flow_table(&self, table_type: FlowTableType, table: FlowTableId) -> CmdResult<()>;

    /// Creates a flow group covering a contiguous index range.
    fn create_flow_group(&self, req: &CreateFlowGroup) -> CmdResult<FlowGroupId>;

    /// Destroys a flow group that has no entries.
    fn destroy_flow_group(
        &self,
        table_type: FlowTableType,
        table: FlowTableId,
        group: FlowGroupId,
    ) -> CmdResult<()>;

    /// Writes a flow entry at an unused index.
    fn set_flow_entry(&self, req: &SetFlowEntry) -> CmdResult<()>;

    /// Deletes the flow entry at an index.
    fn delete_flow_entry(
        &self,
        table_type: FlowTableType,
        table: FlowTableId,
        index: u32,
    ) -> CmdResult<()>;

    /// Makes a table the root of its table type.
    fn update_root_flow_table(&self, table_type: FlowTableType, table: FlowTableId)
        -> CmdResult<()>;
}
