//! Flow table, flow group and flow entry command records.

use crate::error::{CmdError, CmdResult};
use crate::match_param::{MatchCriteria, MatchParam};
use crate::types::{FlowGroupId, FlowTableId, FlowTableType};
use bitflags::bitflags;
use serde::Serialize;
use std::fmt;

/// Flow tag written into entries that do not ask for one.
pub const DEFAULT_FLOW_TAG: u32 = 0x00ff_ffff;

/// Largest table size exponent the device accepts.
pub const MAX_LOG_TABLE_SIZE: u8 = 24;

bitflags! {
    /// Actions applied to packets hitting a flow entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FlowAction: u32 {
        const ALLOW = 1 << 0;
        const DROP = 1 << 1;
        const FWD_DEST = 1 << 2;
        const COUNT = 1 << 3;
    }
}

impl Default for FlowAction {
    fn default() -> Self {
        FlowAction::FWD_DEST
    }
}

/// Where a flow entry forwards matching packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "id")]
pub enum FlowDestination {
    /// E-switch virtual port.
    Vport(u16),
    /// Another flow table.
    FlowTable(FlowTableId),
    /// Transport interface receive queue set.
    Tir(u32),
}

impl FlowDestination {
    /// Short kind name used in object names.
    pub fn kind_name(&self) -> &'static str {
        match self {
            FlowDestination::Vport(_) => "vport",
            FlowDestination::FlowTable(_) => "flow_table",
            FlowDestination::Tir(_) => "tir",
        }
    }

    /// Raw destination id.
    pub fn raw_id(&self) -> u32 {
        match self {
            FlowDestination::Vport(v) => u32::from(*v),
            FlowDestination::FlowTable(t) => t.as_raw(),
            FlowDestination::Tir(t) => *t,
        }
    }
}

impl fmt::Display for FlowDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind_name(), self.raw_id())
    }
}

/// CREATE_FLOW_TABLE input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateFlowTable {
    pub table_type: FlowTableType,
    pub level: u32,
    /// Table holds `1 << log_size` entries.
    pub log_size: u8,
}

impl CreateFlowTable {
    pub fn validate(&self) -> CmdResult<()> {
        if self.log_size > MAX_LOG_TABLE_SIZE {
            return Err(CmdError::invalid_parameter(format!(
                "log_size {} exceeds {}",
                self.log_size, MAX_LOG_TABLE_SIZE
            )));
        }
        Ok(())
    }

    /// Number of entries in the table.
    pub fn size(&self) -> u32 {
        1u32 << self.log_size
    }
}

/// CREATE_FLOW_GROUP input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateFlowGroup {
    pub table_type: FlowTableType,
    pub table_id: FlowTableId,
    /// First index owned by the group.
    pub start_index: u32,
    /// Last index owned by the group, inclusive.
    pub end_index: u32,
    pub criteria: MatchCriteria,
}

impl CreateFlowGroup {
    pub fn validate(&self) -> CmdResult<()> {
        if self.end_index < self.start_index {
            return Err(CmdError::invalid_parameter(format!(
                "group range [{}, {}] is empty",
                self.start_index, self.end_index
            )));
        }
        Ok(())
    }
}

/// SET_FLOW_TABLE_ENTRY input.
///
/// The entry at `index` is written whole: match value, action, flow tag
/// and the complete destination list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetFlowEntry {
    pub table_type: FlowTableType,
    pub table_id: FlowTableId,
    pub group_id: FlowGroupId,
    pub index: u32,
    pub match_value: MatchParam,
    pub action: FlowAction,
    pub flow_tag: u32,
    pub destinations: Vec<FlowDestination>,
}

impl SetFlowEntry {
    pub fn validate(&self) -> CmdResult<()> {
        if self.flow_tag > DEFAULT_FLOW_TAG {
            return Err(CmdError::invalid_parameter(format!(
                "flow tag 0x{:x} wider than 24 bits",
                self.flow_tag
            )));
        }
        if self.action.contains(FlowAction::FWD_DEST) && self.destinations.is_empty() {
            return Err(CmdError::invalid_parameter(
                "forward action requires at least one destination",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> SetFlowEntry {
        SetFlowEntry {
            table_type: FlowTableType::NicRx,
            table_id: FlowTableId::new(1),
            group_id: FlowGroupId::new(1),
            index: 0,
            match_value: MatchParam::zeroed(),
            action: FlowAction::FWD_DEST,
            flow_tag: DEFAULT_FLOW_TAG,
            destinations: vec![FlowDestination::Tir(9)],
        }
    }

    #[test]
    fn test_destination_names() {
        assert_eq!(FlowDestination::Vport(3).to_string(), "vport:3");
        assert_eq!(
            FlowDestination::FlowTable(FlowTableId::new(7)).kind_name(),
            "flow_table"
        );
    }

    #[test]
    fn test_table_size() {
        let req = CreateFlowTable {
            table_type: FlowTableType::NicRx,
            level: 0,
            log_size: 4,
        };
        assert_eq!(req.size(), 16);
        assert!(req.validate().is_ok());

        let too_big = CreateFlowTable {
            log_size: 30,
            ..req
        };
        assert!(too_big.validate().is_err());
    }

    #[test]
    fn test_group_range_validation() {
        let req = CreateFlowGroup {
            table_type: FlowTableType::Fdb,
            table_id: FlowTableId::new(1),
            start_index: 4,
            end_index: 3,
            criteria: MatchCriteria::match_all(),
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_entry_validation() {
        assert!(entry().validate().is_ok());

        let mut no_dest = entry();
        no_dest.destinations.clear();
        assert!(no_dest.validate().is_err());

        let mut drop = entry();
        drop.destinations.clear();
        drop.action = FlowAction::DROP;
        assert!(drop.validate().is_ok());

        let mut wide_tag = entry();
        wide_tag.flow_tag = 0x0100_0000;
        assert!(wide_tag.validate().is_err());
    }
}
