//! Flow table creation and destruction.
//!
//! A table is created at the tail of a priority, gets its star group in the
//! last two entries, and is spliced into the chain under the chain lock in
//! the same critical section that makes it visible. Destruction runs the
//! same steps backwards.

use crate::autogroup::AutogroupState;
use crate::config::TeardownLog;
use crate::error::{FsError, FsResult};
use crate::namespace::Namespace;
use crate::node::{Node, NodeData, NodeObject, NodeType, PrioFlags, TableObj, TableState};
use crate::root::FlowRoot;
use crate::star::{self, ChainState, StarRules};
use flowsteer_cmd::{
    CreateFlowGroup, CreateFlowTable, FlowDestination, FlowTableId, FlowTableType,
    MatchCriteria, MAX_LOG_TABLE_SIZE,
};
use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;

/// Handle to a flow table.
#[derive(Clone)]
pub struct FlowTable {
    pub(crate) root: Arc<FlowRoot>,
    pub(crate) node: Arc<Node>,
    id: FlowTableId,
    level: u32,
    max_fte: u32,
}

impl fmt::Debug for FlowTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowTable")
            .field("name", &self.node.name())
            .field("id", &self.id)
            .field("level", &self.level)
            .finish()
    }
}

impl FlowTable {
    pub(crate) fn from_node(root: Arc<FlowRoot>, node: Arc<Node>) -> FsResult<Self> {
        let obj = node.as_table()?;
        let (id, level, max_fte) = (obj.id, obj.level, obj.max_fte);
        Ok(Self {
            root,
            node,
            id,
            level,
            max_fte,
        })
    }

    pub fn id(&self) -> FlowTableId {
        self.id
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    /// Usable entries, not counting the two star entries.
    pub fn max_entries(&self) -> u32 {
        self.max_fte
    }

    pub fn name(&self) -> String {
        self.node.name()
    }

    pub fn table_type(&self) -> FlowTableType {
        self.root.table_type
    }

    pub fn is_live(&self) -> bool {
        self.node.is_live()
    }

    /// Destination forwarding into this table.
    pub fn as_destination(&self) -> FlowDestination {
        FlowDestination::FlowTable(self.id())
    }

    pub fn is_auto_grouped(&self) -> FsResult<bool> {
        Ok(self.node.body.lock().table_state()?.autogroup.active)
    }

    /// Owners of a shared auto-grouped table; zero for private tables.
    pub fn shared_refcount(&self) -> FsResult<u32> {
        Ok(self.node.body.lock().table_state()?.shared_refcount)
    }

    /// Table the star rule currently forwards to.
    pub fn next_table_id(&self) -> FsResult<Option<FlowTableId>> {
        let body = self.node.body.lock();
        match body.table_state()?.star.target() {
            Some(next) => Ok(Some(next.as_table()?.id)),
            None => Ok(None),
        }
    }

    /// Destroys the table.
    ///
    /// Fails PermissionDenied unless the table is the last one in its
    /// priority, and Busy while it still holds groups. Dropping one owner of
    /// a shared table only decrements its owner count.
    pub fn destroy(&self) -> FsResult<()> {
        destroy_table(&self.root, &self.node)
    }
}

// ============================================================================
// Creation
// ============================================================================

/// Table size for `max_entries` rules plus the two star entries.
fn table_capacity(max_entries: u32) -> FsResult<(u8, u32)> {
    let size = max_entries
        .checked_add(2)
        .and_then(u32::checked_next_power_of_two)
        .ok_or_else(|| FsError::invalid_argument(format!("{} entries is too many", max_entries)))?;
    let log_size = size.trailing_zeros() as u8;
    if log_size > MAX_LOG_TABLE_SIZE {
        return Err(FsError::invalid_argument(format!(
            "table of 2^{} entries exceeds the device limit",
            log_size
        )));
    }
    Ok((log_size, size - 2))
}

fn budget_sum(root: &FlowRoot, ns: &Node) -> FsResult<u32> {
    let mut sum = 0;
    for prio in root.children_of(ns)? {
        sum += prio.body.lock().max_ft()?;
    }
    Ok(sum)
}

/// Level of a table appended to `prio`, or of the first table after
/// `stop` when climbing.
fn level_in_prio(root: &FlowRoot, prio: &Node, stop: Option<&Node>) -> FsResult<u32> {
    let mut children = root.children_of(prio)?;
    if let Some(stop) = stop {
        let pos = children
            .iter()
            .position(|c| c.id == stop.id)
            .ok_or_else(|| FsError::internal(format!("{} not in {}", stop.name(), prio.name())))?;
        children.truncate(pos);
    }

    let mut level = 0;
    for child in children.iter().rev() {
        match child.kind() {
            NodeType::Table => return Ok(level + child.as_table()?.level + 1),
            NodeType::Namespace => level += budget_sum(root, child)?,
            other => {
                return Err(FsError::internal(format!(
                    "priority {} holds a {}",
                    prio.name(),
                    other
                )))
            }
        }
    }

    let ns = root.parent_required(prio)?;
    let mut earlier = 0;
    for sibling in root.children_of(&ns)? {
        if sibling.id == prio.id {
            break;
        }
        earlier += sibling.body.lock().max_ft()?;
    }

    match root.parent_of(&ns)? {
        Some(outer) => Ok(level + earlier + level_in_prio(root, &outer, Some(&ns))?),
        None => Ok(level + earlier),
    }
}

pub(crate) fn table_level(root: &FlowRoot, prio: &Node) -> FsResult<u32> {
    level_in_prio(root, prio, None)
}

pub(crate) fn create_table(
    ns: &Namespace,
    prio: u32,
    name: &str,
    max_entries: u32,
    autogroup: Option<u32>,
) -> FsResult<FlowTable> {
    let root = &ns.root;
    ns.node.ensure_live()?;
    let prio_node = ns.find_priority(prio)?.ok_or_else(|| {
        FsError::invalid_argument(format!("priority {} not found in {}", prio, ns.name()))
    })?;
    let prio_obj = prio_node.as_priority()?;

    let shared = autogroup.is_some() && prio_obj.flags.contains(PrioFlags::SHARED);
    let _shared_guard = shared.then(|| prio_obj.shared.lock());
    if shared {
        let existing = root
            .children_of(&prio_node)?
            .into_iter()
            .find(|child| child.kind() == NodeType::Table);
        if let Some(existing) = existing {
            let count = {
                let mut body = existing.body.lock();
                let state = body.table_state_mut()?;
                state.shared_refcount += 1;
                state.shared_refcount
            };
            debug!("shared table {} now has {} owners", existing.name(), count);
            return FlowTable::from_node(Arc::clone(root), existing);
        }
    }

    let mut chain = root.lock_chain();
    let node = create_table_locked(
        root,
        &mut chain,
        &prio_node,
        name,
        max_entries,
        autogroup,
        shared,
    )?;
    FlowTable::from_node(Arc::clone(root), node)
}

fn create_table_locked(
    root: &FlowRoot,
    chain: &mut ChainState,
    prio: &Arc<Node>,
    name: &str,
    max_entries: u32,
    autogroup: Option<u32>,
    shared: bool,
) -> FsResult<Arc<Node>> {
    let (log_size, max_fte) = table_capacity(max_entries)?;

    let (siblings, max_ft) = {
        let body = prio.body.lock();
        (root.nodes(&body.children)?, body.max_ft()?)
    };
    if siblings.iter().any(|s| s.kind() == NodeType::Namespace) {
        return Err(FsError::invalid_argument(format!(
            "priority {} holds namespaces",
            prio.name()
        )));
    }
    if siblings.len() as u32 >= max_ft {
        return Err(FsError::no_space(format!(
            "priority {} already holds {} of {} tables",
            prio.name(),
            siblings.len(),
            max_ft
        )));
    }
    let prio_was_empty = siblings.is_empty();
    let level = table_level(root, prio)?;

    let id = root.device.create_flow_table(&CreateFlowTable {
        table_type: root.table_type,
        level,
        log_size,
    })?;

    let star_group = match root.device.create_flow_group(&CreateFlowGroup {
        table_type: root.table_type,
        table_id: id,
        start_index: max_fte,
        end_index: max_fte + 1,
        criteria: MatchCriteria::match_all(),
    }) {
        Ok(group) => group,
        Err(e) => {
            destroy_device_table(root, id);
            return Err(e.into());
        }
    };

    let name = if name.is_empty() {
        format!("flow_table_{}", id)
    } else {
        name.to_string()
    };
    let node = root.new_node(
        prio,
        name,
        1,
        NodeObject::Table(TableObj { id, level, max_fte }),
        NodeData::Table(TableState {
            autogroup: autogroup.map(AutogroupState::enabled).unwrap_or_default(),
            shared_refcount: u32::from(shared),
            star: StarRules::new(star_group, max_fte),
        }),
    );

    let unwind = |root: &FlowRoot| {
        if let Err(e) = root
            .device
            .destroy_flow_group(root.table_type, id, star_group)
        {
            warn!("flow steering can't destroy star group of table {}: {}", id, e);
        }
        destroy_device_table(root, id);
    };

    let splice = match star::splice_table(root, chain, prio, &node, prio_was_empty) {
        Ok(splice) => splice,
        Err(e) => {
            unwind(root);
            return Err(e);
        }
    };

    if root.config.caps.modify_root {
        let below_root = match &chain.root_table {
            Some(current) => level < current.as_table()?.level,
            None => true,
        };
        if below_root {
            if let Err(e) = root.device.update_root_flow_table(root.table_type, id) {
                warn!("flow steering can't make table {} the root: {}", id, e);
                star::undo_splice(root, chain, &node, splice);
                unwind(root);
                return Err(e.into());
            }
            chain.root_table = Some(Arc::clone(&node));
            debug!("table {} is now the root of {}", node.name(), root.table_type);
        }
    }

    {
        let mut body = prio.body.lock();
        root.attach(prio, &mut body, &node, None);
    }
    info!(
        "created flow table {} (id {}, level {}, {} entries) in {}",
        node.name(),
        id,
        level,
        max_fte,
        prio.name()
    );
    Ok(node)
}

fn destroy_device_table(root: &FlowRoot, id: FlowTableId) {
    if let Err(e) = root.device.destroy_flow_table(root.table_type, id) {
        warn!("flow steering can't destroy flow table {}: {}", id, e);
    }
}

// ============================================================================
// Destruction
// ============================================================================

pub(crate) fn destroy_table(root: &FlowRoot, node: &Arc<Node>) -> FsResult<()> {
    node.ensure_live()?;
    let prio = root.parent_required(node)?;
    let prio_obj = prio.as_priority()?;

    let shared = prio_obj.flags.contains(PrioFlags::SHARED);
    let _shared_guard = shared.then(|| prio_obj.shared.lock());
    if shared {
        let mut body = node.body.lock();
        let state = body.table_state_mut()?;
        if state.shared_refcount > 1 {
            state.shared_refcount -= 1;
            debug!(
                "shared table {} keeps {} owners",
                node.name(),
                state.shared_refcount
            );
            return Ok(());
        }
    }

    let mut chain = root.lock_chain();
    let star_group = {
        let prio_body = prio.body.lock();
        node.ensure_live()?;
        if prio_body.children.last() != Some(&node.id) {
            warn!(
                "flow steering tried to delete flow table {} which isn't last in {}",
                node.name(),
                prio.name()
            );
            return Err(FsError::permission_denied(format!(
                "table {} is not the last in {}",
                node.name(),
                prio.name()
            )));
        }
        let body = node.body.lock();
        if !body.children.is_empty() {
            return Err(FsError::busy(format!(
                "table {} still holds {} groups",
                node.name(),
                body.children.len()
            )));
        }
        body.table_state()?.star.group
    };

    star::update_root_on_destroy(root, &mut chain, &prio, node)?;
    node.mark_detaching();

    let mut log = TeardownLog::new();
    star::unsplice_table(root, &mut chain, &prio, node, &mut log);
    let table_id = node.as_table()?.id;
    if let Err(e) = root
        .device
        .destroy_flow_group(root.table_type, table_id, star_group)
    {
        log.record(&format!("destroy star group of {}", node.name()), e);
    }
    root.remove_node(node, &mut log)?;
    drop(chain);

    info!("destroyed flow table {} (id {})", node.name(), table_id);
    log.finish(root.config.teardown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_table_capacity() {
        assert_eq!(table_capacity(4).unwrap(), (3, 6));
        assert_eq!(table_capacity(6).unwrap(), (3, 6));
        assert_eq!(table_capacity(7).unwrap(), (4, 14));
        assert_eq!(table_capacity(0).unwrap(), (1, 0));
        assert_eq!(table_capacity(1).unwrap(), (2, 2));
    }

    #[test]
    fn test_table_capacity_limits() {
        assert!(table_capacity(u32::MAX).is_err());
        assert!(table_capacity(1 << 24).is_err());
        assert_eq!(table_capacity((1 << 24) - 2).unwrap(), (24, (1 << 24) - 2));
    }
}
