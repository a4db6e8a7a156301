//! Automatic group allocation for auto-grouped tables.
//!
//! An auto-grouped table carves its usable entry space into groups on
//! demand. The first `max_types` groups get `max_fte / (max_types + 1)`
//! entries each; once that many exist, further groups get a single entry.
//! Groups are kept sorted by start index and a new group goes into the
//! first gap that fits.

use crate::error::{FsError, FsResult};
use crate::group::create_group_locked;
use crate::node::{Node, NodeBody};
use crate::root::FlowRoot;
use flowsteer_cmd::MatchCriteria;
use log::debug;
use std::sync::Arc;

/// Autogroup bookkeeping, kept in the table state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct AutogroupState {
    pub(crate) active: bool,
    pub(crate) max_types: u32,
    pub(crate) num_types: u32,
}

impl AutogroupState {
    pub(crate) fn enabled(max_types: u32) -> Self {
        Self {
            active: true,
            max_types,
            num_types: 0,
        }
    }

    /// Size of the next group.
    pub(crate) fn group_size(&self, max_fte: u32) -> u32 {
        if self.num_types < self.max_types {
            max_fte / (self.max_types + 1)
        } else {
            1
        }
    }
}

/// Finds the first gap of `size` entries among `groups`, given as
/// `(start_index, max_ftes)` sorted by start index.
///
/// Returns the start index and the position the new group takes in the
/// list.
pub(crate) fn find_gap(groups: &[(u32, u32)], size: u32, max_fte: u32) -> FsResult<(u32, usize)> {
    if size == 0 {
        return Err(FsError::invalid_argument("autogroup size is zero"));
    }

    let mut candidate = 0u32;
    let mut position = 0usize;
    for &(start, max_ftes) in groups {
        if candidate + size > start {
            candidate = start + max_ftes;
            position += 1;
        } else {
            break;
        }
    }

    if candidate + size > max_fte {
        return Err(FsError::no_space(format!(
            "no gap of {} entries below index {}",
            size, max_fte
        )));
    }
    Ok((candidate, position))
}

/// Creates an autogroup for `criteria`. The caller holds the table lock.
pub(crate) fn create_autogroup(
    root: &FlowRoot,
    table: &Arc<Node>,
    table_body: &mut NodeBody,
    criteria: &MatchCriteria,
) -> FsResult<Arc<Node>> {
    let max_fte = table.as_table()?.max_fte;
    let state = table_body.table_state()?.autogroup;
    if !state.active {
        return Err(FsError::internal(format!(
            "table {} is not auto-grouped",
            table.name()
        )));
    }

    let size = state.group_size(max_fte);
    let mut groups = Vec::with_capacity(table_body.children.len());
    for group in root.nodes(&table_body.children)? {
        let g = group.as_group()?;
        groups.push((g.start_index, g.max_ftes));
    }
    let (start_index, position) = find_gap(&groups, size, max_fte)?;

    let group = create_group_locked(
        root,
        table,
        table_body,
        start_index,
        size,
        criteria,
        0,
        Some(position),
    )?;
    debug!(
        "autogroup {} in {} covers [{}, {}]",
        group.name(),
        table.name(),
        start_index,
        start_index + size - 1
    );
    Ok(group)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_group_size() {
        let mut state = AutogroupState::enabled(3);
        assert_eq!(state.group_size(30), 7);
        state.num_types = 3;
        assert_eq!(state.group_size(30), 1);
    }

    #[test]
    fn test_find_gap_empty_table() {
        assert_eq!(find_gap(&[], 7, 30).unwrap(), (0, 0));
    }

    #[test]
    fn test_find_gap_appends_after_packed_groups() {
        let groups = [(0, 7), (7, 7), (14, 7)];
        assert_eq!(find_gap(&groups, 7, 30).unwrap(), (21, 3));
    }

    #[test]
    fn test_find_gap_reuses_hole() {
        let groups = [(0, 7), (14, 7)];
        assert_eq!(find_gap(&groups, 7, 30).unwrap(), (7, 1));
    }

    #[test]
    fn test_find_gap_hole_too_small() {
        let groups = [(0, 7), (9, 7)];
        assert_eq!(find_gap(&groups, 7, 30).unwrap(), (16, 2));
    }

    #[test]
    fn test_find_gap_errors() {
        assert!(matches!(
            find_gap(&[], 0, 30),
            Err(FsError::InvalidArgument { .. })
        ));
        assert!(find_gap(&[(0, 28)], 7, 30).unwrap_err().is_no_space());
    }
}
