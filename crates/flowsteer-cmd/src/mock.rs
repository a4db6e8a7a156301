//! In-memory device model.
//!
//! [`MockDevice`] implements [`FlowCommands`] against a small model of the
//! device's steering state. It enforces the same structural rules the
//! firmware does, so tests catch ordering mistakes that a permissive stub
//! would hide:
//!
//! - group ranges stay inside the table and never overlap
//! - an entry index must be free before it is written
//! - tables with groups and groups with entries cannot be destroyed
//! - a table that some entry still forwards to cannot be destroyed
//!
//! Every successful command is appended to an ordered log. Failures can be
//! injected per command kind to exercise unwind paths.

use crate::api::{
    CreateFlowGroup, CreateFlowTable, FlowAction, FlowCommands, FlowDestination, SetFlowEntry,
};
use crate::error::{CmdError, CmdOp, CmdResult, CmdStatus};
use crate::match_param::{MatchCriteria, MatchParam};
use crate::types::{FlowGroupId, FlowTableId, FlowTableType};
use log::debug;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

/// Command kinds, used to target injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    CreateTable,
    DestroyTable,
    CreateGroup,
    DestroyGroup,
    SetEntry,
    DeleteEntry,
    UpdateRoot,
}

impl CommandKind {
    fn op(&self) -> CmdOp {
        match self {
            CommandKind::CreateTable => CmdOp::CreateFlowTable,
            CommandKind::DestroyTable => CmdOp::DestroyFlowTable,
            CommandKind::CreateGroup => CmdOp::CreateFlowGroup,
            CommandKind::DestroyGroup => CmdOp::DestroyFlowGroup,
            CommandKind::SetEntry => CmdOp::SetFlowTableEntry,
            CommandKind::DeleteEntry => CmdOp::DeleteFlowTableEntry,
            CommandKind::UpdateRoot => CmdOp::SetFlowTableRoot,
        }
    }
}

/// A command the device accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    CreateTable {
        table_type: FlowTableType,
        table: FlowTableId,
        level: u32,
        log_size: u8,
    },
    DestroyTable {
        table: FlowTableId,
    },
    CreateGroup {
        table: FlowTableId,
        group: FlowGroupId,
        start_index: u32,
        end_index: u32,
    },
    DestroyGroup {
        table: FlowTableId,
        group: FlowGroupId,
    },
    SetEntry {
        table: FlowTableId,
        group: FlowGroupId,
        index: u32,
        destinations: Vec<FlowDestination>,
    },
    DeleteEntry {
        table: FlowTableId,
        index: u32,
    },
    UpdateRoot {
        table_type: FlowTableType,
        table: FlowTableId,
    },
}

impl DeviceCommand {
    pub fn kind(&self) -> CommandKind {
        match self {
            DeviceCommand::CreateTable { .. } => CommandKind::CreateTable,
            DeviceCommand::DestroyTable { .. } => CommandKind::DestroyTable,
            DeviceCommand::CreateGroup { .. } => CommandKind::CreateGroup,
            DeviceCommand::DestroyGroup { .. } => CommandKind::DestroyGroup,
            DeviceCommand::SetEntry { .. } => CommandKind::SetEntry,
            DeviceCommand::DeleteEntry { .. } => CommandKind::DeleteEntry,
            DeviceCommand::UpdateRoot { .. } => CommandKind::UpdateRoot,
        }
    }
}

/// A flow entry as the device holds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockEntry {
    pub group: FlowGroupId,
    pub match_value: MatchParam,
    pub action: FlowAction,
    pub flow_tag: u32,
    pub destinations: Vec<FlowDestination>,
}

#[derive(Debug)]
struct MockGroup {
    start_index: u32,
    end_index: u32,
    #[allow(dead_code)]
    criteria: MatchCriteria,
}

#[derive(Debug)]
struct MockTable {
    table_type: FlowTableType,
    level: u32,
    size: u32,
    groups: BTreeMap<FlowGroupId, MockGroup>,
    entries: BTreeMap<u32, MockEntry>,
}

#[derive(Debug)]
struct InjectedFailure {
    kind: CommandKind,
    /// Matching commands to let through before failing.
    skip: usize,
    status: CmdStatus,
}

#[derive(Debug, Default)]
struct MockState {
    next_id: u32,
    tables: HashMap<FlowTableId, MockTable>,
    roots: HashMap<FlowTableType, FlowTableId>,
    log: Vec<DeviceCommand>,
    failures: Vec<InjectedFailure>,
}

impl MockState {
    fn alloc_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn check_injected(&mut self, kind: CommandKind) -> CmdResult<()> {
        let mut fired = None;
        for (i, failure) in self.failures.iter_mut().enumerate() {
            if failure.kind != kind {
                continue;
            }
            if failure.skip == 0 {
                fired = Some(i);
                break;
            }
            failure.skip -= 1;
        }
        match fired {
            Some(i) => {
                let failure = self.failures.remove(i);
                debug!("mock: injected {} for {:?}", failure.status, kind);
                Err(CmdError::status(kind.op(), failure.status))
            }
            None => Ok(()),
        }
    }

    fn table(&self, id: FlowTableId, op: CmdOp) -> CmdResult<&MockTable> {
        self.tables
            .get(&id)
            .ok_or_else(|| CmdError::status(op, CmdStatus::BadResource))
    }

    fn table_mut(&mut self, id: FlowTableId, op: CmdOp) -> CmdResult<&mut MockTable> {
        self.tables
            .get_mut(&id)
            .ok_or_else(|| CmdError::status(op, CmdStatus::BadResource))
    }

    fn is_forward_target(&self, id: FlowTableId) -> bool {
        self.tables.values().any(|t| {
            t.entries
                .values()
                .any(|e| e.destinations.contains(&FlowDestination::FlowTable(id)))
        })
    }
}

/// In-memory [`FlowCommands`] implementation.
#[derive(Debug, Default)]
pub struct MockDevice {
    state: Mutex<MockState>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `kind` command with `status`.
    pub fn fail_next(&self, kind: CommandKind, status: CmdStatus) {
        self.fail_nth(kind, 0, status);
    }

    /// Lets `skip` matching commands succeed, then fails the following one.
    pub fn fail_nth(&self, kind: CommandKind, skip: usize, status: CmdStatus) {
        self.state
            .lock()
            .failures
            .push(InjectedFailure { kind, skip, status });
    }

    /// Drops all pending injected failures.
    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    /// Returns the accepted commands in order.
    pub fn commands(&self) -> Vec<DeviceCommand> {
        self.state.lock().log.clone()
    }

    /// Clears the command log.
    pub fn clear_commands(&self) {
        self.state.lock().log.clear();
    }

    pub fn entry(&self, table: FlowTableId, index: u32) -> Option<MockEntry> {
        let state = self.state.lock();
        state.tables.get(&table)?.entries.get(&index).cloned()
    }

    /// All entries of a table, ordered by index.
    pub fn entries(&self, table: FlowTableId) -> Vec<(u32, MockEntry)> {
        let state = self.state.lock();
        state
            .tables
            .get(&table)
            .map(|t| t.entries.iter().map(|(i, e)| (*i, e.clone())).collect())
            .unwrap_or_default()
    }

    pub fn root_table(&self, table_type: FlowTableType) -> Option<FlowTableId> {
        self.state.lock().roots.get(&table_type).copied()
    }

    pub fn table_level(&self, table: FlowTableId) -> Option<u32> {
        self.state.lock().tables.get(&table).map(|t| t.level)
    }

    pub fn table_size(&self, table: FlowTableId) -> Option<u32> {
        self.state.lock().tables.get(&table).map(|t| t.size)
    }

    pub fn table_count(&self) -> usize {
        self.state.lock().tables.len()
    }

    pub fn group_count(&self, table: FlowTableId) -> usize {
        self.state
            .lock()
            .tables
            .get(&table)
            .map(|t| t.groups.len())
            .unwrap_or(0)
    }

    /// Index range of a group, inclusive.
    pub fn group_range(&self, table: FlowTableId, group: FlowGroupId) -> Option<(u32, u32)> {
        let state = self.state.lock();
        let g = state.tables.get(&table)?.groups.get(&group)?;
        Some((g.start_index, g.end_index))
    }

    /// Total number of entries across all tables.
    pub fn entry_count(&self) -> usize {
        self.state
            .lock()
            .tables
            .values()
            .map(|t| t.entries.len())
            .sum()
    }
}

impl FlowCommands for MockDevice {
    fn create_flow_table(&self, req: &CreateFlowTable) -> CmdResult<FlowTableId> {
        req.validate()?;
        let mut state = self.state.lock();
        state.check_injected(CommandKind::CreateTable)?;

        let table = FlowTableId::new(state.alloc_id());
        state.tables.insert(
            table,
            MockTable {
                table_type: req.table_type,
                level: req.level,
                size: req.size(),
                groups: BTreeMap::new(),
                entries: BTreeMap::new(),
            },
        );
        state.log.push(DeviceCommand::CreateTable {
            table_type: req.table_type,
            table,
            level: req.level,
            log_size: req.log_size,
        });
        debug!(
            "mock: created {} table {} level {} size {}",
            req.table_type,
            table,
            req.level,
            req.size()
        );
        Ok(table)
    }

    fn destroy_flow_table(&self, table_type: FlowTableType, table: FlowTableId) -> CmdResult<()> {
        let op = CmdOp::DestroyFlowTable;
        let mut state = self.state.lock();
        state.check_injected(CommandKind::DestroyTable)?;

        let t = state.table(table, op)?;
        if t.table_type != table_type {
            return Err(CmdError::status(op, CmdStatus::BadParameter));
        }
        if !t.groups.is_empty() {
            return Err(CmdError::status(op, CmdStatus::ResourceBusy));
        }
        if state.is_forward_target(table) {
            return Err(CmdError::status(op, CmdStatus::ResourceBusy));
        }

        state.tables.remove(&table);
        if state.roots.get(&table_type) == Some(&table) {
            state.roots.remove(&table_type);
        }
        state.log.push(DeviceCommand::DestroyTable { table });
        debug!("mock: destroyed table {}", table);
        Ok(())
    }

    fn create_flow_group(&self, req: &CreateFlowGroup) -> CmdResult<FlowGroupId> {
        let op = CmdOp::CreateFlowGroup;
        req.validate()?;
        let mut state = self.state.lock();
        state.check_injected(CommandKind::CreateGroup)?;

        let t = state.table(req.table_id, op)?;
        if req.end_index >= t.size {
            return Err(CmdError::status(op, CmdStatus::BadParameter));
        }
        let overlaps = t
            .groups
            .values()
            .any(|g| req.start_index <= g.end_index && g.start_index <= req.end_index);
        if overlaps {
            return Err(CmdError::status(op, CmdStatus::BadParameter));
        }

        let group = FlowGroupId::new(state.alloc_id());
        let t = state.table_mut(req.table_id, op)?;
        t.groups.insert(
            group,
            MockGroup {
                start_index: req.start_index,
                end_index: req.end_index,
                criteria: req.criteria.clone(),
            },
        );
        state.log.push(DeviceCommand::CreateGroup {
            table: req.table_id,
            group,
            start_index: req.start_index,
            end_index: req.end_index,
        });
        Ok(group)
    }

    fn destroy_flow_group(
        &self,
        _table_type: FlowTableType,
        table: FlowTableId,
        group: FlowGroupId,
    ) -> CmdResult<()> {
        let op = CmdOp::DestroyFlowGroup;
        let mut state = self.state.lock();
        state.check_injected(CommandKind::DestroyGroup)?;

        let t = state.table_mut(table, op)?;
        if !t.groups.contains_key(&group) {
            return Err(CmdError::status(op, CmdStatus::BadResource));
        }
        if t.entries.values().any(|e| e.group == group) {
            return Err(CmdError::status(op, CmdStatus::ResourceBusy));
        }
        t.groups.remove(&group);
        state.log.push(DeviceCommand::DestroyGroup { table, group });
        Ok(())
    }

    fn set_flow_entry(&self, req: &SetFlowEntry) -> CmdResult<()> {
        let op = CmdOp::SetFlowTableEntry;
        req.validate()?;
        let mut state = self.state.lock();
        state.check_injected(CommandKind::SetEntry)?;

        for dest in &req.destinations {
            if let FlowDestination::FlowTable(target) = dest {
                if !state.tables.contains_key(target) {
                    return Err(CmdError::status(op, CmdStatus::BadParameter));
                }
            }
        }

        let t = state.table_mut(req.table_id, op)?;
        let g = t
            .groups
            .get(&req.group_id)
            .ok_or_else(|| CmdError::status(op, CmdStatus::BadResource))?;
        if req.index < g.start_index || req.index > g.end_index {
            return Err(CmdError::status(op, CmdStatus::BadIndex));
        }
        if t.entries.contains_key(&req.index) {
            return Err(CmdError::status(op, CmdStatus::BadResourceState));
        }
        t.entries.insert(
            req.index,
            MockEntry {
                group: req.group_id,
                match_value: req.match_value.clone(),
                action: req.action,
                flow_tag: req.flow_tag,
                destinations: req.destinations.clone(),
            },
        );
        state.log.push(DeviceCommand::SetEntry {
            table: req.table_id,
            group: req.group_id,
            index: req.index,
            destinations: req.destinations.clone(),
        });
        Ok(())
    }

    fn delete_flow_entry(
        &self,
        _table_type: FlowTableType,
        table: FlowTableId,
        index: u32,
    ) -> CmdResult<()> {
        let op = CmdOp::DeleteFlowTableEntry;
        let mut state = self.state.lock();
        state.check_injected(CommandKind::DeleteEntry)?;

        let t = state.table_mut(table, op)?;
        if t.entries.remove(&index).is_none() {
            return Err(CmdError::status(op, CmdStatus::BadIndex));
        }
        state.log.push(DeviceCommand::DeleteEntry { table, index });
        Ok(())
    }

    fn update_root_flow_table(
        &self,
        table_type: FlowTableType,
        table: FlowTableId,
    ) -> CmdResult<()> {
        let op = CmdOp::SetFlowTableRoot;
        let mut state = self.state.lock();
        state.check_injected(CommandKind::UpdateRoot)?;

        if state.table(table, op)?.table_type != table_type {
            return Err(CmdError::status(op, CmdStatus::BadParameter));
        }
        state.roots.insert(table_type, table);
        state.log.push(DeviceCommand::UpdateRoot { table_type, table });
        debug!("mock: {} root is now table {}", table_type, table);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn create_table(dev: &MockDevice, log_size: u8) -> FlowTableId {
        dev.create_flow_table(&CreateFlowTable {
            table_type: FlowTableType::NicRx,
            level: 0,
            log_size,
        })
        .unwrap()
    }

    fn create_group(
        dev: &MockDevice,
        table: FlowTableId,
        start: u32,
        end: u32,
    ) -> CmdResult<FlowGroupId> {
        dev.create_flow_group(&CreateFlowGroup {
            table_type: FlowTableType::NicRx,
            table_id: table,
            start_index: start,
            end_index: end,
            criteria: MatchCriteria::match_all(),
        })
    }

    fn set_entry(
        dev: &MockDevice,
        table: FlowTableId,
        group: FlowGroupId,
        index: u32,
        dest: FlowDestination,
    ) -> CmdResult<()> {
        dev.set_flow_entry(&SetFlowEntry {
            table_type: FlowTableType::NicRx,
            table_id: table,
            group_id: group,
            index,
            match_value: MatchParam::zeroed(),
            action: FlowAction::FWD_DEST,
            flow_tag: 0,
            destinations: vec![dest],
        })
    }

    #[test]
    fn test_group_overlap_rejected() {
        let dev = MockDevice::new();
        let table = create_table(&dev, 3);
        create_group(&dev, table, 0, 3).unwrap();

        let err = create_group(&dev, table, 3, 5).unwrap_err();
        assert_eq!(err.device_status(), Some(CmdStatus::BadParameter));
        assert!(create_group(&dev, table, 4, 7).is_ok());
        assert!(create_group(&dev, table, 8, 8).is_err());
    }

    #[test]
    fn test_entry_index_must_be_free() {
        let dev = MockDevice::new();
        let table = create_table(&dev, 2);
        let group = create_group(&dev, table, 0, 1).unwrap();

        set_entry(&dev, table, group, 0, FlowDestination::Tir(1)).unwrap();
        let err = set_entry(&dev, table, group, 0, FlowDestination::Tir(2)).unwrap_err();
        assert_eq!(err.device_status(), Some(CmdStatus::BadResourceState));

        let err = set_entry(&dev, table, group, 2, FlowDestination::Tir(2)).unwrap_err();
        assert_eq!(err.device_status(), Some(CmdStatus::BadIndex));
    }

    #[test]
    fn test_busy_objects_not_destroyed() {
        let dev = MockDevice::new();
        let target = create_table(&dev, 1);
        let table = create_table(&dev, 1);
        let group = create_group(&dev, table, 0, 1).unwrap();
        set_entry(&dev, table, group, 0, FlowDestination::FlowTable(target)).unwrap();

        let group_busy = dev
            .destroy_flow_group(FlowTableType::NicRx, table, group)
            .unwrap_err();
        assert_eq!(group_busy.device_status(), Some(CmdStatus::ResourceBusy));

        let target_busy = dev
            .destroy_flow_table(FlowTableType::NicRx, target)
            .unwrap_err();
        assert_eq!(target_busy.device_status(), Some(CmdStatus::ResourceBusy));

        dev.delete_flow_entry(FlowTableType::NicRx, table, 0).unwrap();
        dev.destroy_flow_table(FlowTableType::NicRx, target).unwrap();
        assert_eq!(dev.table_count(), 1);
    }

    #[test]
    fn test_injected_failure_fires_once() {
        let dev = MockDevice::new();
        dev.fail_nth(CommandKind::CreateTable, 1, CmdStatus::NoResources);

        let _first = create_table(&dev, 1);
        let err = dev
            .create_flow_table(&CreateFlowTable {
                table_type: FlowTableType::NicRx,
                level: 0,
                log_size: 1,
            })
            .unwrap_err();
        assert_eq!(err.device_status(), Some(CmdStatus::NoResources));
        assert_eq!(err.to_string(), "CREATE_FLOW_TABLE failed: CMD_STAT_NO_RES_ERR");

        let _third = create_table(&dev, 1);
        assert_eq!(dev.table_count(), 2);
    }

    #[test]
    fn test_command_log_order() {
        let dev = MockDevice::new();
        let table = create_table(&dev, 1);
        dev.update_root_flow_table(FlowTableType::NicRx, table).unwrap();
        assert_eq!(dev.root_table(FlowTableType::NicRx), Some(table));

        let kinds: Vec<CommandKind> = dev.commands().iter().map(|c| c.kind()).collect();
        assert_eq!(kinds, vec![CommandKind::CreateTable, CommandKind::UpdateRoot]);

        dev.clear_commands();
        assert!(dev.commands().is_empty());
    }
}
