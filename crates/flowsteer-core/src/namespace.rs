//! Namespaces and their priorities.

use crate::error::{FsError, FsResult};
use crate::node::{Node, NodeData, NodeObject, NodeType, PrioFlags, PriorityObj};
use crate::root::FlowRoot;
use crate::table::{self, FlowTable};
use flowsteer_cmd::FlowTableType;
use log::debug;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Handle to a flow namespace.
#[derive(Clone)]
pub struct Namespace {
    pub(crate) root: Arc<FlowRoot>,
    pub(crate) node: Arc<Node>,
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Namespace")
            .field("name", &self.node.name())
            .field("table_type", &self.root.table_type)
            .finish()
    }
}

impl Namespace {
    pub(crate) fn from_node(root: Arc<FlowRoot>, node: Arc<Node>) -> Self {
        Self { root, node }
    }

    pub fn name(&self) -> String {
        self.node.name()
    }

    pub fn table_type(&self) -> FlowTableType {
        self.root.table_type
    }

    /// Priority numbers of this namespace, in chain order.
    pub fn priorities(&self) -> FsResult<Vec<u32>> {
        self.root
            .children_of(&self.node)?
            .iter()
            .map(|prio| prio.as_priority().map(|p| p.prio))
            .collect()
    }

    /// Creates a table with caller-managed groups at the tail of `prio`.
    ///
    /// The table gets room for at least `max_entries` rules; an empty
    /// `name` becomes `flow_table_{id}`.
    pub fn create_table(&self, prio: u32, name: &str, max_entries: u32) -> FsResult<FlowTable> {
        table::create_table(self, prio, name, max_entries, None)
    }

    /// Creates a table whose groups are allocated on demand, at most
    /// `max_groups` of them sized evenly.
    pub fn create_auto_grouped_table(
        &self,
        prio: u32,
        name: &str,
        max_entries: u32,
        max_groups: u32,
    ) -> FsResult<FlowTable> {
        table::create_table(self, prio, name, max_entries, Some(max_groups))
    }

    /// First namespace nested under priority `prio`.
    pub fn find_namespace(&self, prio: u32) -> FsResult<Option<Namespace>> {
        let Some(prio_node) = self.find_priority(prio)? else {
            return Ok(None);
        };
        Ok(self
            .root
            .children_of(&prio_node)?
            .into_iter()
            .find(|child| child.kind() == NodeType::Namespace)
            .map(|ns| Namespace::from_node(Arc::clone(&self.root), ns)))
    }

    pub(crate) fn find_priority(&self, prio: u32) -> FsResult<Option<Arc<Node>>> {
        for node in self.root.children_of(&self.node)? {
            if node.as_priority()?.prio == prio {
                return Ok(Some(node));
            }
        }
        Ok(None)
    }

    /// Appends a priority with room for `max_ft` tables.
    pub(crate) fn create_priority(
        &self,
        prio: u32,
        max_ft: u32,
        name: &str,
        flags: PrioFlags,
    ) -> FsResult<Arc<Node>> {
        let mut body = self.node.body.lock();
        self.node.ensure_live()?;
        for existing in self.root.nodes(&body.children)? {
            if existing.as_priority()?.prio == prio {
                return Err(FsError::invalid_argument(format!(
                    "priority {} already exists in {}",
                    prio,
                    self.node.name()
                )));
            }
        }

        let node = self.root.new_node(
            &self.node,
            name,
            1,
            NodeObject::Priority(PriorityObj {
                prio,
                flags,
                shared: Mutex::new(()),
            }),
            NodeData::Priority { max_ft },
        );
        self.root.attach(&self.node, &mut body, &node, None);
        debug!(
            "created priority {} ({}) in {} with max_ft {}",
            name,
            prio,
            self.node.name(),
            max_ft
        );
        Ok(node)
    }

    /// Appends a namespace under `prio_node`.
    pub(crate) fn create_namespace(&self, prio_node: &Arc<Node>, name: &str) -> FsResult<Namespace> {
        let mut body = prio_node.body.lock();
        prio_node.ensure_live()?;
        for child in self.root.nodes(&body.children)? {
            if child.kind() == NodeType::Table {
                return Err(FsError::invalid_argument(format!(
                    "priority {} already holds tables",
                    prio_node.name()
                )));
            }
        }

        let node = self.root.new_node(
            prio_node,
            name,
            1,
            NodeObject::namespace(),
            NodeData::Namespace,
        );
        self.root.attach(prio_node, &mut body, &node, None);
        debug!("created namespace {} in {}", name, prio_node.name());
        Ok(Namespace::from_node(Arc::clone(&self.root), node))
    }
}
