//! Flow groups: contiguous index ranges of a table sharing one match mask.

use crate::config::TeardownLog;
use crate::error::{FsError, FsResult};
use crate::node::{GroupObj, Node, NodeBody, NodeData, NodeObject};
use crate::root::FlowRoot;
use crate::table::FlowTable;
use flowsteer_cmd::{CreateFlowGroup, FlowGroupId, MatchCriteria};
use log::debug;
use std::fmt;
use std::sync::Arc;

/// Range and mask of an explicitly created group. `end_index` is inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowGroupConfig {
    pub start_index: u32,
    pub end_index: u32,
    pub criteria: MatchCriteria,
}

impl FlowGroupConfig {
    pub fn new(start_index: u32, end_index: u32, criteria: MatchCriteria) -> Self {
        Self {
            start_index,
            end_index,
            criteria,
        }
    }
}

/// Handle to a flow group.
#[derive(Clone)]
pub struct FlowGroup {
    pub(crate) root: Arc<FlowRoot>,
    pub(crate) node: Arc<Node>,
    id: FlowGroupId,
    start_index: u32,
    max_ftes: u32,
}

impl fmt::Debug for FlowGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowGroup")
            .field("name", &self.node.name())
            .field("start_index", &self.start_index)
            .field("max_ftes", &self.max_ftes)
            .finish()
    }
}

impl FlowGroup {
    pub(crate) fn from_node(root: Arc<FlowRoot>, node: Arc<Node>) -> FsResult<Self> {
        let obj = node.as_group()?;
        let (id, start_index, max_ftes) = (obj.id, obj.start_index, obj.max_ftes);
        Ok(Self {
            root,
            node,
            id,
            start_index,
            max_ftes,
        })
    }

    pub fn id(&self) -> FlowGroupId {
        self.id
    }

    pub fn name(&self) -> String {
        self.node.name()
    }

    pub fn start_index(&self) -> u32 {
        self.start_index
    }

    /// Last index of the group, inclusive.
    pub fn end_index(&self) -> u32 {
        self.start_index + self.max_ftes - 1
    }

    pub fn max_entries(&self) -> u32 {
        self.max_ftes
    }

    pub fn criteria(&self) -> FsResult<MatchCriteria> {
        Ok(self.node.as_group()?.criteria.clone())
    }

    /// Entries currently programmed in the group.
    pub fn num_entries(&self) -> FsResult<u32> {
        self.node.body.lock().num_ftes()
    }

    pub fn is_live(&self) -> bool {
        self.node.is_live()
    }

    /// Destroys an explicitly created group. Fails Busy while it still
    /// holds entries.
    pub fn destroy(&self) -> FsResult<()> {
        let root = &self.root;
        let table = root.parent_required(&self.node)?;
        {
            let table_body = table.body.lock();
            let body = self.node.body.lock();
            self.node.ensure_live()?;
            if !table_body.children.contains(&self.node.id) {
                return Err(self.node.gone());
            }
            if table_body.table_state()?.autogroup.active {
                return Err(FsError::permission_denied(format!(
                    "group {} is managed by its table",
                    self.node.name()
                )));
            }
            if !body.children.is_empty() {
                return Err(FsError::busy(format!(
                    "group {} still holds {} entries",
                    self.node.name(),
                    body.children.len()
                )));
            }
            self.node.mark_detaching();
        }

        let mut log = TeardownLog::new();
        root.remove_node(&self.node, &mut log)?;
        debug!("destroyed flow group {} of {}", self.id, table.name());
        log.finish(root.config.teardown)
    }
}

impl FlowTable {
    /// Creates a group covering `[start_index, end_index]` on a table with
    /// caller-managed groups.
    pub fn create_group(&self, config: &FlowGroupConfig) -> FsResult<FlowGroup> {
        let root = &self.root;
        if config.end_index < config.start_index {
            return Err(FsError::invalid_argument(format!(
                "group range [{}, {}] is reversed",
                config.start_index, config.end_index
            )));
        }
        if config.end_index >= self.max_entries() {
            return Err(FsError::invalid_argument(format!(
                "group range [{}, {}] leaves the {} usable entries of {}",
                config.start_index,
                config.end_index,
                self.max_entries(),
                self.name()
            )));
        }

        let mut body = self.node.body.lock();
        self.node.ensure_live()?;
        if body.table_state()?.autogroup.active {
            return Err(FsError::permission_denied(format!(
                "table {} allocates its own groups",
                self.name()
            )));
        }
        for group in root.nodes(&body.children)? {
            let g = group.as_group()?;
            if config.start_index <= g.end_index() && g.start_index <= config.end_index {
                return Err(FsError::invalid_argument(format!(
                    "group range [{}, {}] overlaps {}",
                    config.start_index,
                    config.end_index,
                    group.name()
                )));
            }
        }

        let node = create_group_locked(
            root,
            &self.node,
            &mut body,
            config.start_index,
            config.end_index - config.start_index + 1,
            &config.criteria,
            1,
            None,
        )?;
        drop(body);
        FlowGroup::from_node(Arc::clone(root), node)
    }

    /// Groups of the table in list order.
    pub fn groups(&self) -> FsResult<Vec<FlowGroup>> {
        self.root
            .children_of(&self.node)?
            .into_iter()
            .map(|node| FlowGroup::from_node(Arc::clone(&self.root), node))
            .collect()
    }
}

/// Creates the device group and links its node. The caller holds the table
/// lock and has checked the range.
#[allow(clippy::too_many_arguments)]
pub(crate) fn create_group_locked(
    root: &FlowRoot,
    table: &Arc<Node>,
    table_body: &mut NodeBody,
    start_index: u32,
    max_ftes: u32,
    criteria: &MatchCriteria,
    users: u32,
    position: Option<usize>,
) -> FsResult<Arc<Node>> {
    let table_id = table.as_table()?.id;
    let id = root.device.create_flow_group(&CreateFlowGroup {
        table_type: root.table_type,
        table_id,
        start_index,
        end_index: start_index + max_ftes - 1,
        criteria: criteria.clone(),
    })?;

    let state = table_body.table_state_mut()?;
    if state.autogroup.active {
        state.autogroup.num_types += 1;
    }

    let node = root.new_node(
        table,
        format!("group_{}", id),
        users,
        NodeObject::Group(GroupObj {
            id,
            start_index,
            max_ftes,
            criteria: criteria.clone(),
        }),
        NodeData::Group { num_ftes: 0 },
    );
    root.attach(table, table_body, &node, position);
    debug!(
        "created flow group {} [{}, {}] in {}",
        node.name(),
        start_index,
        start_index + max_ftes - 1,
        table.name()
    );
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autogroup;
    use crate::config::SteeringConfig;
    use crate::steering::{FlowSteering, NamespaceType};
    use flowsteer_cmd::MockDevice;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_pinned_autogroup_is_not_destroyable() {
        let device = Arc::new(MockDevice::new());
        let steering = FlowSteering::init(device.clone(), SteeringConfig::default()).unwrap();
        let kernel = steering.get_namespace(NamespaceType::Kernel).unwrap();
        let table = kernel.create_auto_grouped_table(0, "auto", 6, 2).unwrap();

        // an adder holds the fresh autogroup before its first entry lands
        let node = {
            let mut body = table.node.body.lock();
            let node = autogroup::create_autogroup(
                &table.root,
                &table.node,
                &mut body,
                &MatchCriteria::match_all(),
            )
            .unwrap();
            node.acquire();
            node
        };
        let group = FlowGroup::from_node(Arc::clone(&table.root), Arc::clone(&node)).unwrap();

        let err = group.destroy().unwrap_err();
        assert!(matches!(err, FsError::PermissionDenied { .. }));
        assert!(group.is_live());
        assert_eq!(node.users(), 1);

        let mut log = TeardownLog::new();
        table.root.release(&node, &mut log).unwrap();
        assert!(log.is_empty());
        assert!(!group.is_live());
        assert!(table.groups().unwrap().is_empty());
        assert_eq!(device.group_count(table.id()), 1);
        table.destroy().unwrap();
    }
}
