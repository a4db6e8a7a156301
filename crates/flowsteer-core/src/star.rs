//! Star-rule chaining between flow tables.
//!
//! Every table reserves its last two entries for a match-all "star" rule
//! that forwards missed packets to the next table in chain order. Only one
//! of the two is live at a time. Retargeting writes the spare slot first,
//! deletes the old one second and then flips, so traffic always has a valid
//! fall-through path.
//!
//! All functions here take the [`ChainState`] guard as proof that the chain
//! lock is held.

use crate::config::TeardownLog;
use crate::error::{FsError, FsResult};
use crate::node::{Node, NodeType};
use crate::root::FlowRoot;
use flowsteer_cmd::{
    FlowAction, FlowDestination, FlowGroupId, MatchParam, SetFlowEntry, DEFAULT_FLOW_TAG,
};
use log::{debug, warn};
use std::sync::Arc;

/// State guarded by the chain lock.
#[derive(Debug, Default)]
pub(crate) struct ChainState {
    /// Table the device starts lookups from.
    pub(crate) root_table: Option<Arc<Node>>,
}

#[derive(Debug)]
pub(crate) struct StarEntry {
    pub(crate) index: u32,
    pub(crate) target: Option<Arc<Node>>,
    /// The device still holds an entry at `index` that the tree no longer
    /// tracks; it is deleted before the slot is written again.
    pub(crate) stale: bool,
}

/// The two star slots of a table.
#[derive(Debug)]
pub(crate) struct StarRules {
    pub(crate) group: FlowGroupId,
    pub(crate) entries: [StarEntry; 2],
    pub(crate) used: usize,
}

impl StarRules {
    pub(crate) fn new(group: FlowGroupId, max_fte: u32) -> Self {
        Self {
            group,
            entries: [
                StarEntry {
                    index: max_fte,
                    target: None,
                    stale: false,
                },
                StarEntry {
                    index: max_fte + 1,
                    target: None,
                    stale: false,
                },
            ],
            used: 0,
        }
    }

    fn unused(&self) -> usize {
        (self.used + 1) % 2
    }

    /// Table the live star rule forwards to.
    pub(crate) fn target(&self) -> Option<&Arc<Node>> {
        self.entries[self.used].target.as_ref()
    }
}

/// Points the star rule of `src` at `dst`, or removes it.
pub(crate) fn set_star_rule(
    root: &FlowRoot,
    _chain: &mut ChainState,
    src: &Arc<Node>,
    dst: Option<&Arc<Node>>,
) -> FsResult<()> {
    let src_id = src.as_table()?.id;
    let (group, spare_index, spare_stale, old_index, had_target) = {
        let body = src.body.lock();
        let star = &body.table_state()?.star;
        let used = &star.entries[star.used];
        (
            star.group,
            star.entries[star.unused()].index,
            star.entries[star.unused()].stale,
            used.index,
            used.target.is_some() || used.stale,
        )
    };

    if let Some(dst) = dst {
        let dst_id = dst.as_table()?.id;
        if spare_stale {
            root.device
                .delete_flow_entry(root.table_type, src_id, spare_index)?;
            clear_stale(src, spare_index)?;
        }
        root.device.set_flow_entry(&SetFlowEntry {
            table_type: root.table_type,
            table_id: src_id,
            group_id: group,
            index: spare_index,
            match_value: MatchParam::zeroed(),
            action: FlowAction::FWD_DEST,
            flow_tag: DEFAULT_FLOW_TAG,
            destinations: vec![FlowDestination::FlowTable(dst_id)],
        })?;
        dst.acquire();
    }

    let mut old_stale = false;
    if had_target {
        if let Err(e) = root
            .device
            .delete_flow_entry(root.table_type, src_id, old_index)
        {
            warn!(
                "flow steering can't delete star rule {} of table {}: {}",
                old_index,
                src.name(),
                e
            );
            old_stale = true;
        }
    }

    let old_target = {
        let mut body = src.body.lock();
        let star = &mut body.table_state_mut()?.star;
        let spare = star.unused();
        let used = star.used;
        star.entries[spare].target = dst.cloned();
        if dst.is_some() {
            star.entries[spare].stale = false;
        }
        star.used = spare;
        star.entries[used].stale = old_stale;
        star.entries[used].target.take()
    };

    debug!(
        "star rule of {} now points to {}",
        src.name(),
        dst.map(|d| d.name()).unwrap_or_else(|| "nothing".to_string())
    );

    if let Some(old) = old_target {
        let mut log = TeardownLog::new();
        root.release(&old, &mut log)?;
    }
    Ok(())
}

fn clear_stale(table: &Node, index: u32) -> FsResult<()> {
    let mut body = table.body.lock();
    let star = &mut body.table_state_mut()?.star;
    for entry in star.entries.iter_mut().filter(|e| e.index == index) {
        entry.stale = false;
    }
    Ok(())
}

/// Drops the star target of `table` if it is `doomed`, after the device
/// refused to retarget it. The device entry is deleted when possible and
/// otherwise left marked stale.
fn forget_star_target(
    root: &FlowRoot,
    table: &Arc<Node>,
    doomed: &Arc<Node>,
    log: &mut TeardownLog,
) -> FsResult<()> {
    let table_id = table.as_table()?.id;
    let (index, old) = {
        let mut body = table.body.lock();
        let star = &mut body.table_state_mut()?.star;
        let used = star.used;
        let slot = &mut star.entries[used];
        if !slot.target.as_ref().map_or(false, |t| Arc::ptr_eq(t, doomed)) {
            return Ok(());
        }
        slot.stale = true;
        (slot.index, slot.target.take())
    };

    match root.device.delete_flow_entry(root.table_type, table_id, index) {
        Ok(()) => clear_stale(table, index)?,
        Err(e) => log.record(
            &format!("delete star rule {} of {} to {}", index, table.name(), doomed.name()),
            e,
        ),
    }
    if let Some(old) = old {
        root.release(&old, log)?;
    }
    Ok(())
}

/// Makes sure no table of `prio` still points at `doomed` in the tree.
fn forget_prev_targets(root: &FlowRoot, prio: &Node, doomed: &Arc<Node>, log: &mut TeardownLog) {
    let tables = match root.children_of(prio) {
        Ok(children) => children,
        Err(e) => return log.record(&format!("walk {}", prio.name()), e),
    };
    for table in tables.iter().filter(|t| t.kind() == NodeType::Table) {
        if let Err(e) = forget_star_target(root, table, doomed, log) {
            log.record(&format!("drop star target of {}", table.name()), e);
        }
    }
}

// ============================================================================
// Chain order search
// ============================================================================

fn after(children: Vec<Arc<Node>>, start: Option<&Node>) -> FsResult<Vec<Arc<Node>>> {
    match start {
        None => Ok(children),
        Some(start) => {
            let pos = children
                .iter()
                .position(|c| c.id == start.id)
                .ok_or_else(|| FsError::internal(format!("{} not in its parent", start.name())))?;
            Ok(children.into_iter().skip(pos + 1).collect())
        }
    }
}

fn before(children: Vec<Arc<Node>>, end: Option<&Node>) -> FsResult<Vec<Arc<Node>>> {
    match end {
        None => Ok(children),
        Some(end) => {
            let pos = children
                .iter()
                .position(|c| c.id == end.id)
                .ok_or_else(|| FsError::internal(format!("{} not in its parent", end.name())))?;
            let mut children = children;
            children.truncate(pos);
            Ok(children)
        }
    }
}

fn first_table_in_prio(
    root: &FlowRoot,
    prio: &Node,
    start: Option<&Node>,
) -> FsResult<Option<Arc<Node>>> {
    for child in after(root.children_of(prio)?, start)? {
        match child.kind() {
            NodeType::Table => return Ok(Some(child)),
            NodeType::Namespace => {
                if let Some(table) = first_table_in_ns(root, &child, None)? {
                    return Ok(Some(table));
                }
            }
            other => {
                return Err(FsError::internal(format!(
                    "priority {} holds a {}",
                    prio.name(),
                    other
                )))
            }
        }
    }
    Ok(None)
}

fn first_table_in_ns(
    root: &FlowRoot,
    ns: &Node,
    start: Option<&Node>,
) -> FsResult<Option<Arc<Node>>> {
    for prio in after(root.children_of(ns)?, start)? {
        if let Some(table) = first_table_in_prio(root, &prio, None)? {
            return Ok(Some(table));
        }
    }
    Ok(None)
}

fn last_table_in_prio(
    root: &FlowRoot,
    prio: &Node,
    end: Option<&Node>,
) -> FsResult<Option<Arc<Node>>> {
    for child in before(root.children_of(prio)?, end)?.into_iter().rev() {
        match child.kind() {
            NodeType::Table => return Ok(Some(child)),
            NodeType::Namespace => {
                if let Some(table) = last_table_in_ns(root, &child, None)? {
                    return Ok(Some(table));
                }
            }
            other => {
                return Err(FsError::internal(format!(
                    "priority {} holds a {}",
                    prio.name(),
                    other
                )))
            }
        }
    }
    Ok(None)
}

fn last_table_in_ns(
    root: &FlowRoot,
    ns: &Node,
    end: Option<&Node>,
) -> FsResult<Option<Arc<Node>>> {
    for prio in before(root.children_of(ns)?, end)?.into_iter().rev() {
        if let Some(table) = last_table_in_prio(root, &prio, None)? {
            return Ok(Some(table));
        }
    }
    Ok(None)
}

/// First table of the first non-empty priority after `prio` in chain
/// order, climbing out through enclosing namespaces.
pub(crate) fn find_next_table(root: &FlowRoot, prio: &Arc<Node>) -> FsResult<Option<Arc<Node>>> {
    let mut prio = Arc::clone(prio);
    loop {
        let ns = root.parent_required(&prio)?;
        if let Some(table) = first_table_in_ns(root, &ns, Some(&prio))? {
            return Ok(Some(table));
        }
        let Some(outer) = root.parent_of(&ns)? else {
            return Ok(None);
        };
        if let Some(table) = first_table_in_prio(root, &outer, Some(&ns))? {
            return Ok(Some(table));
        }
        prio = outer;
    }
}

/// Last table of the nearest non-empty priority before `prio`.
pub(crate) fn find_prev_table(root: &FlowRoot, prio: &Arc<Node>) -> FsResult<Option<Arc<Node>>> {
    let mut prio = Arc::clone(prio);
    loop {
        let ns = root.parent_required(&prio)?;
        if let Some(table) = last_table_in_ns(root, &ns, Some(&prio))? {
            return Ok(Some(table));
        }
        let Some(outer) = root.parent_of(&ns)? else {
            return Ok(None);
        };
        if let Some(table) = last_table_in_prio(root, &outer, Some(&ns))? {
            return Ok(Some(table));
        }
        prio = outer;
    }
}

fn current_target(table: &Node) -> FsResult<Option<Arc<Node>>> {
    let body = table.body.lock();
    Ok(body.table_state()?.star.target().cloned())
}

fn same_table(a: Option<&Arc<Node>>, b: Option<&Arc<Node>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

/// Retargets every table of `prio` whose star rule does not already point
/// to `next`.
pub(crate) fn connect_prev_tables(
    root: &FlowRoot,
    chain: &mut ChainState,
    prio: &Node,
    next: Option<&Arc<Node>>,
) -> FsResult<()> {
    for table in root.children_of(prio)? {
        if table.kind() != NodeType::Table {
            continue;
        }
        if same_table(current_target(&table)?.as_ref(), next) {
            continue;
        }
        set_star_rule(root, chain, &table, next)?;
    }
    Ok(())
}

// ============================================================================
// Splicing tables in and out
// ============================================================================

/// Chain neighbours captured when a table is spliced in, used to undo it.
#[derive(Debug)]
pub(crate) struct Splice {
    next: Option<Arc<Node>>,
    prev_prio: Option<Arc<Node>>,
}

/// Points a new, not yet attached `table` at its successor and, when it is
/// the first table of `prio`, points the previous priority's tables at it.
pub(crate) fn splice_table(
    root: &FlowRoot,
    chain: &mut ChainState,
    prio: &Arc<Node>,
    table: &Arc<Node>,
    prio_was_empty: bool,
) -> FsResult<Splice> {
    let next = find_next_table(root, prio)?;
    set_star_rule(root, chain, table, next.as_ref())?;

    let mut splice = Splice {
        next,
        prev_prio: None,
    };
    if !prio_was_empty {
        return Ok(splice);
    }

    let Some(prev) = find_prev_table(root, prio)? else {
        return Ok(splice);
    };
    let prev_prio = root.parent_required(&prev)?;
    if let Err(e) = connect_prev_tables(root, chain, &prev_prio, Some(table)) {
        splice.prev_prio = Some(prev_prio);
        undo_splice(root, chain, table, splice);
        return Err(e);
    }
    splice.prev_prio = Some(prev_prio);
    Ok(splice)
}

/// Reverts [`splice_table`] for a table that never got attached.
pub(crate) fn undo_splice(root: &FlowRoot, chain: &mut ChainState, table: &Arc<Node>, splice: Splice) {
    if let Some(prev_prio) = &splice.prev_prio {
        if let Err(e) = connect_prev_tables(root, chain, prev_prio, splice.next.as_ref()) {
            warn!(
                "flow steering can't reconnect tables of {}: {}",
                prev_prio.name(),
                e
            );
            forget_prev_targets(root, prev_prio, table, &mut TeardownLog::new());
        }
    }
    if let Err(e) = set_star_rule(root, chain, table, None) {
        warn!(
            "flow steering can't remove star rule of {}: {}",
            table.name(),
            e
        );
    }
}

/// Takes `table` out of the chain before it is destroyed. Failures are
/// recorded and the removal carries on.
pub(crate) fn unsplice_table(
    root: &FlowRoot,
    chain: &mut ChainState,
    prio: &Arc<Node>,
    table: &Arc<Node>,
    log: &mut TeardownLog,
) {
    let is_first = prio.body.lock().children.first() == Some(&table.id);
    if is_first {
        match find_next_table(root, prio).and_then(|next| {
            find_prev_table(root, prio).map(|prev| (prev, next))
        }) {
            Ok((Some(prev), next)) => match root.parent_required(&prev) {
                Ok(prev_prio) => {
                    if let Err(e) = connect_prev_tables(root, chain, &prev_prio, next.as_ref()) {
                        log.record(&format!("connect tables before {}", table.name()), e);
                        forget_prev_targets(root, &prev_prio, table, log);
                    }
                }
                Err(e) => log.record(&format!("find priority of {}", prev.name()), e),
            },
            Ok((None, _)) => {}
            Err(e) => log.record(&format!("find neighbours of {}", table.name()), e),
        }
    }

    if let Err(e) = set_star_rule(root, chain, table, None) {
        log.record(&format!("remove star rule of {}", table.name()), e);
    }
}

/// Moves the root pointer off a table that is about to be destroyed.
pub(crate) fn update_root_on_destroy(
    root: &FlowRoot,
    chain: &mut ChainState,
    prio: &Arc<Node>,
    table: &Arc<Node>,
) -> FsResult<()> {
    let is_root = chain
        .root_table
        .as_ref()
        .map_or(false, |current| Arc::ptr_eq(current, table));
    if !is_root {
        return Ok(());
    }

    let next = find_next_table(root, prio)?;
    if let Some(next) = &next {
        let next_id = next.as_table()?.id;
        if let Err(e) = root.device.update_root_flow_table(root.table_type, next_id) {
            warn!(
                "flow steering can't make table {} the root of {}: {}",
                next.name(),
                root.table_type,
                e
            );
            return Err(e.into());
        }
    }
    debug!(
        "root of {} moves from {} to {}",
        root.table_type,
        table.name(),
        next.as_ref().map(|n| n.name()).unwrap_or_else(|| "nothing".to_string())
    );
    chain.root_table = next;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_star_rules_layout() {
        let star = StarRules::new(FlowGroupId::new(9), 6);
        assert_eq!(star.entries[0].index, 6);
        assert_eq!(star.entries[1].index, 7);
        assert_eq!(star.used, 0);
        assert_eq!(star.unused(), 1);
        assert!(star.target().is_none());
    }
}
