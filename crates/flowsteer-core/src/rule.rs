//! Rule insertion and removal.
//!
//! A rule is one destination of a flow entry. Adding a rule whose match
//! value, action and flow tag equal an existing entry in the group merges
//! it into that entry; otherwise a new entry is written at the first free
//! index. Because the device only creates entries, changing the destination
//! list of a live entry writes a new entry at a free index first and then
//! deletes the old one.

use crate::autogroup;
use crate::config::TeardownLog;
use crate::error::{FsError, FsResult};
use crate::group::FlowGroup;
use crate::node::{EntryObj, GroupObj, Node, NodeBody, NodeData, NodeObject, RuleObj};
use crate::notifier::{self, ClientData, HandlerId, RuleNotifier};
use crate::root::{FlowRoot, Parent};
use crate::table::FlowTable;
use flowsteer_cmd::{
    FlowAction, FlowDestination, FlowGroupId, FlowTableId, FlowTableType, MatchCriteria,
    MatchCriteriaEnable, MatchParam, SetFlowEntry, DEFAULT_FLOW_TAG,
};
use log::{debug, warn};
use parking_lot::{Mutex, RwLockReadGuard};
use std::fmt;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

/// Match value and action of a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSpec {
    pub value: MatchParam,
    pub action: FlowAction,
    pub flow_tag: u32,
}

impl FlowSpec {
    /// Forwarding rule with the default flow tag.
    pub fn new(value: MatchParam) -> Self {
        Self {
            value,
            action: FlowAction::FWD_DEST,
            flow_tag: DEFAULT_FLOW_TAG,
        }
    }

    pub fn with_action(mut self, action: FlowAction) -> Self {
        self.action = action;
        self
    }

    pub fn with_flow_tag(mut self, flow_tag: u32) -> Self {
        self.flow_tag = flow_tag;
        self
    }
}

impl Default for FlowSpec {
    fn default() -> Self {
        Self::new(MatchParam::zeroed())
    }
}

/// Handle to a rule.
#[derive(Clone)]
pub struct FlowRule {
    pub(crate) root: Arc<FlowRoot>,
    pub(crate) node: Arc<Node>,
}

impl fmt::Debug for FlowRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowRule")
            .field("name", &self.node.name())
            .field("destination", &self.destination())
            .finish()
    }
}

impl FlowRule {
    pub(crate) fn from_node(root: Arc<FlowRoot>, node: Arc<Node>) -> Self {
        Self { root, node }
    }

    pub(crate) fn node(&self) -> &Node {
        &self.node
    }

    fn obj(&self) -> Option<&RuleObj> {
        self.node.as_rule().ok()
    }

    fn entry(&self) -> FsResult<Arc<Node>> {
        self.node
            .parent
            .and_then(|id| self.root.lookup(id))
            .ok_or_else(|| self.node.gone())
    }

    fn group(&self) -> FsResult<Arc<Node>> {
        let entry = self.entry()?;
        entry
            .parent
            .and_then(|id| self.root.lookup(id))
            .ok_or_else(|| entry.gone())
    }

    pub fn name(&self) -> String {
        self.node.name()
    }

    pub fn is_live(&self) -> bool {
        self.node.is_live()
    }

    pub fn destination(&self) -> Option<FlowDestination> {
        self.obj().map(|rule| rule.dest)
    }

    pub fn match_criteria_enable(&self) -> FsResult<MatchCriteriaEnable> {
        Ok(self.group()?.as_group()?.criteria.enable)
    }

    pub fn match_criteria(&self) -> FsResult<MatchCriteria> {
        Ok(self.group()?.as_group()?.criteria.clone())
    }

    pub fn match_value(&self) -> FsResult<MatchParam> {
        Ok(self.entry()?.as_entry()?.match_value.clone())
    }

    pub fn action(&self) -> FsResult<FlowAction> {
        Ok(self.entry()?.as_entry()?.action)
    }

    pub fn flow_tag(&self) -> FsResult<u32> {
        Ok(self.entry()?.as_entry()?.flow_tag)
    }

    /// Current device index of the rule's entry.
    pub fn index(&self) -> FsResult<u32> {
        Ok(self.entry()?.as_entry()?.index())
    }

    pub fn group_id(&self) -> FsResult<FlowGroupId> {
        Ok(self.group()?.as_group()?.id)
    }

    pub fn table_id(&self) -> FsResult<FlowTableId> {
        let group = self.group()?;
        let table = group
            .parent
            .and_then(|id| self.root.lookup(id))
            .ok_or_else(|| group.gone())?;
        Ok(table.as_table()?.id)
    }

    pub fn table_type(&self) -> FlowTableType {
        self.root.table_type
    }

    /// Attaches `data` for `notifier`'s handler, replacing older data.
    pub fn set_private_data(&self, notifier: &RuleNotifier, data: ClientData) -> FsResult<()> {
        let rule = self.node.as_rule()?;
        let mut clients = rule.clients.lock();
        match clients.iter_mut().find(|(owner, _)| *owner == notifier.id()) {
            Some((_, existing)) => *existing = data,
            None => clients.push((notifier.id(), data)),
        }
        Ok(())
    }

    /// Data attached for `notifier`'s handler.
    pub fn private_data(&self, notifier: &RuleNotifier) -> Option<ClientData> {
        self.client_data(notifier.id())
    }

    pub(crate) fn client_data(&self, handler: HandlerId) -> Option<ClientData> {
        let rule = self.obj()?;
        let clients = rule.clients.lock();
        clients
            .iter()
            .find(|(owner, _)| *owner == handler)
            .map(|(_, data)| Arc::clone(data))
    }

    /// Removes the destination. The entry goes with its last destination
    /// and an autogroup with its last entry.
    pub fn delete(&self) -> FsResult<()> {
        let root = &self.root;
        let path = root.namespace_path(&self.node)?;
        let _dests = lock_dests(&path)?;
        self.node.ensure_live()?;

        let mut log = TeardownLog::new();
        root.remove_node(&self.node, &mut log)?;
        log.finish(root.config.teardown)
    }
}

fn lock_dests(path: &[Arc<Node>]) -> FsResult<Vec<RwLockReadGuard<'_, ()>>> {
    path.iter()
        .map(|ns| ns.as_namespace().map(|obj| obj.dests.read()))
        .collect()
}

fn dest_name(dest: &FlowDestination) -> String {
    format!("dest_{}_{}", dest.kind_name(), dest.raw_id())
}

fn has_free_entry(table_type: FlowTableType, group: &GroupObj, num_ftes: u32) -> bool {
    // FDB groups keep one entry in reserve for relocation.
    let limit = if table_type == FlowTableType::Fdb {
        group.max_ftes.saturating_sub(1)
    } else {
        group.max_ftes
    };
    num_ftes < limit
}

/// First index of the group not taken by an entry. Entries are kept sorted
/// by index.
fn first_free_index(root: &FlowRoot, group: &GroupObj, group_body: &NodeBody) -> FsResult<u32> {
    let mut candidate = group.start_index;
    for entry in root.nodes(&group_body.children)? {
        if entry.as_entry()?.index() != candidate {
            break;
        }
        candidate += 1;
    }
    Ok(candidate)
}

/// Moves `entry` to keep the group's entry list sorted after its index
/// changed.
fn resort_entry(root: &FlowRoot, group_body: &mut NodeBody, entry: &Node, index: u32) -> FsResult<()> {
    group_body.children.retain(|id| *id != entry.id);
    let others = root.nodes(&group_body.children)?;
    let mut position = others.len();
    for (pos, other) in others.iter().enumerate() {
        if other.as_entry()?.index() > index {
            position = pos;
            break;
        }
    }
    group_body.children.insert(position, entry.id);
    entry.rename(format!("fte_{}", index));
    Ok(())
}

fn entry_destinations(root: &FlowRoot, entry_body: &NodeBody) -> FsResult<Vec<FlowDestination>> {
    root.nodes(&entry_body.children)?
        .iter()
        .map(|rule| rule.as_rule().map(|r| r.dest))
        .collect()
}

fn rewrite_entry(
    root: &FlowRoot,
    table_id: FlowTableId,
    group: &GroupObj,
    entry: &EntryObj,
    index: u32,
    destinations: Vec<FlowDestination>,
) -> FsResult<()> {
    root.device.set_flow_entry(&SetFlowEntry {
        table_type: root.table_type,
        table_id,
        group_id: group.id,
        index,
        match_value: entry.match_value.clone(),
        action: entry.action,
        flow_tag: entry.flow_tag,
        destinations,
    })?;
    Ok(())
}

// ============================================================================
// Insertion
// ============================================================================

impl FlowTable {
    /// Adds a rule, choosing or creating a group for `criteria`.
    ///
    /// Every group whose mask equals `criteria` is tried in order. If all of
    /// them are full, an auto-grouped table allocates a new group; other
    /// tables fail NoSpace, or ExplicitGroupRequired when no group had the
    /// mask at all. A rule whose entry already exists in a group that can't
    /// take the rewrite fails EntryFull without trying further groups.
    pub fn add_rule(
        &self,
        criteria: &MatchCriteria,
        spec: &FlowSpec,
        dest: FlowDestination,
    ) -> FsResult<FlowRule> {
        let root = &self.root;
        let path = root.namespace_path(&self.node)?;
        let _dests = lock_dests(&path)?;
        self.node.ensure_live()?;

        let candidates = {
            let body = self.node.body.lock();
            let mut candidates = Vec::new();
            for group in root.nodes(&body.children)? {
                if group.is_live() && group.as_group()?.criteria == *criteria {
                    group.acquire();
                    candidates.push(group);
                }
            }
            candidates
        };

        let mut log = TeardownLog::new();
        let mut outcome = None;
        for group in &candidates {
            if outcome.is_none() {
                match add_to_group(root, group, spec, dest) {
                    Err(e) if e.is_no_space() || matches!(e, FsError::NotFound { .. }) => {}
                    result => outcome = Some(result),
                }
            }
            if let Err(e) = root.release(group, &mut log) {
                log.record("release candidate group", e);
            }
        }
        if let Some(result) = outcome {
            return result;
        }

        let group = {
            let mut body = self.node.body.lock();
            if !body.table_state()?.autogroup.active {
                return Err(if candidates.is_empty() {
                    FsError::ExplicitGroupRequired { table: self.name() }
                } else {
                    FsError::no_space(format!("all matching groups of {} are full", self.name()))
                });
            }
            let group = autogroup::create_autogroup(root, &self.node, &mut body, criteria)?;
            group.acquire();
            group
        };

        let result = add_to_group(root, &group, spec, dest);
        if let Err(e) = root.release(&group, &mut log) {
            log.record("release autogroup", e);
        }
        result
    }
}

impl FlowGroup {
    /// Adds a rule to this group.
    pub fn add_rule(&self, spec: &FlowSpec, dest: FlowDestination) -> FsResult<FlowRule> {
        let root = &self.root;
        let path = root.namespace_path(&self.node)?;
        let _dests = lock_dests(&path)?;
        add_to_group(root, &self.node, spec, dest)
    }
}

/// Adds `dest` to the matching entry of `group`, or to a new entry. The
/// caller holds the destination locks of every enclosing namespace.
fn add_to_group(
    root: &Arc<FlowRoot>,
    group: &Arc<Node>,
    spec: &FlowSpec,
    dest: FlowDestination,
) -> FsResult<FlowRule> {
    let g = group.as_group()?;
    let table_id = root.parent_required(group)?.as_table()?.id;

    let mut group_body = group.body.lock();
    group.ensure_live()?;

    for entry in root.nodes(&group_body.children)? {
        let e = entry.as_entry()?;
        if g.criteria.matches(&spec.value, &e.match_value)
            && spec.action == e.action
            && spec.flow_tag == e.flow_tag
        {
            return merge_into_entry(root, table_id, group, &mut group_body, &entry, dest);
        }
    }

    let num_ftes = group_body.num_ftes()?;
    if !has_free_entry(root.table_type, g, num_ftes) {
        return Err(FsError::no_space(format!(
            "group {} holds {} of {} entries",
            group.name(),
            num_ftes,
            g.max_ftes
        )));
    }
    let index = first_free_index(root, g, &group_body)?;
    let obj = EntryObj {
        match_value: spec.value.clone(),
        action: spec.action,
        flow_tag: spec.flow_tag,
        index: AtomicU32::new(index),
    };
    rewrite_entry(root, table_id, g, &obj, index, vec![dest])?;
    *group_body.num_ftes_mut()? += 1;

    let entry = root.new_node(
        group,
        format!("fte_{}", index),
        0,
        NodeObject::Entry(obj),
        NodeData::Entry,
    );
    let position = {
        let mut position = group_body.children.len();
        for (pos, other) in root.nodes(&group_body.children)?.iter().enumerate() {
            if other.as_entry()?.index() > index {
                position = pos;
                break;
            }
        }
        position
    };
    root.attach(group, &mut group_body, &entry, Some(position));

    let mut entry_body = entry.body.lock();
    let rule = attach_rule(root, &entry, &mut entry_body, dest);
    debug!(
        "added {} to new {} in {}",
        rule.name(),
        entry.name(),
        group.name()
    );
    notifier::notify_add(root, &rule, true);
    Ok(rule)
}

fn attach_rule(
    root: &Arc<FlowRoot>,
    entry: &Arc<Node>,
    entry_body: &mut NodeBody,
    dest: FlowDestination,
) -> FlowRule {
    let node = root.new_node(
        entry,
        dest_name(&dest),
        1,
        NodeObject::Rule(RuleObj {
            dest,
            clients: Mutex::new(Vec::new()),
        }),
        NodeData::Rule,
    );
    root.attach(entry, entry_body, &node, None);
    FlowRule::from_node(Arc::clone(root), node)
}

/// Rewrites `entry` with `dest` appended to its destinations.
fn merge_into_entry(
    root: &Arc<FlowRoot>,
    table_id: FlowTableId,
    group: &Arc<Node>,
    group_body: &mut NodeBody,
    entry: &Arc<Node>,
    dest: FlowDestination,
) -> FsResult<FlowRule> {
    let g = group.as_group()?;
    let e = entry.as_entry()?;
    let mut entry_body = entry.body.lock();

    let old_index = e.index();
    let new_index = first_free_index(root, g, group_body)?;
    if !g.contains(new_index) {
        return Err(FsError::entry_full(group.name(), entry.name()));
    }

    let mut destinations = entry_destinations(root, &entry_body)?;
    destinations.push(dest);
    rewrite_entry(root, table_id, g, e, new_index, destinations)?;
    if let Err(err) = root
        .device
        .delete_flow_entry(root.table_type, table_id, old_index)
    {
        warn!(
            "flow steering can't delete fte {} of table {}: {}",
            old_index, table_id, err
        );
    }
    e.set_index(new_index);
    resort_entry(root, group_body, entry, new_index)?;

    let rule = attach_rule(root, entry, &mut entry_body, dest);
    debug!(
        "merged {} into {} (moved from index {})",
        rule.name(),
        entry.name(),
        old_index
    );
    notifier::notify_add(root, &rule, false);
    Ok(rule)
}

// ============================================================================
// Removal
// ============================================================================

/// Tears down a destination that has already been unlinked from `entry`.
/// Both the group and the entry lock are held.
pub(crate) fn teardown_rule(
    root: &FlowRoot,
    rule: &Arc<Node>,
    entry: Parent<'_>,
    mut group: Parent<'_>,
    log: &mut TeardownLog,
) {
    let handle = match root.handle() {
        Ok(handle) => FlowRule::from_node(handle, Arc::clone(rule)),
        Err(e) => return log.record("notify destination removal", e),
    };

    if !entry.body.children.is_empty() {
        if let Err(e) = relocate_entry(root, entry.node, entry.body, group.node, group.body) {
            return log.record(&format!("delete dst {} of {}", rule.name(), entry.node.name()), e);
        }
    }
    debug!("removed {} from {}", rule.name(), entry.node.name());
    notifier::notify_del(root, &handle, entry.body.children.is_empty());
}

/// Rewrites an entry at a fresh index with its remaining destinations.
fn relocate_entry(
    root: &FlowRoot,
    entry: &Arc<Node>,
    entry_body: &NodeBody,
    group: &Arc<Node>,
    group_body: &mut NodeBody,
) -> FsResult<()> {
    let g = group.as_group()?;
    let e = entry.as_entry()?;
    let table_id = root.parent_required(group)?.as_table()?.id;

    let old_index = e.index();
    let new_index = first_free_index(root, g, group_body)?;
    if !g.contains(new_index) {
        return Err(FsError::entry_full(group.name(), entry.name()));
    }

    rewrite_entry(
        root,
        table_id,
        g,
        e,
        new_index,
        entry_destinations(root, entry_body)?,
    )?;
    if let Err(err) = root
        .device
        .delete_flow_entry(root.table_type, table_id, old_index)
    {
        warn!(
            "flow steering can't delete fte {} of table {}: {}",
            old_index, table_id, err
        );
    }
    e.set_index(new_index);
    resort_entry(root, group_body, entry, new_index)
}
