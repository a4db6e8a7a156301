//! Per-root-namespace state: the node arena, the device handle, the chain
//! lock and the cascading release that tears nodes down.
//!
//! # Lock order
//!
//! 1. priority shared lock
//! 2. chain lock ([`FlowRoot::lock_chain`])
//! 3. namespace destination locks, root first
//! 4. node bodies, parent before child
//! 5. namespace notifier lists
//! 6. rule client lists
//! 7. node names, lifecycles and the arena (leaf locks)
//!
//! Callbacks run with entry and group bodies held, so code reachable from a
//! callback never locks a body.

use crate::config::{SteeringConfig, TeardownLog};
use crate::error::{FsError, FsResult};
use crate::node::{Node, NodeBody, NodeData, NodeId, NodeObject, NodeType};
use crate::rule;
use crate::star::ChainState;
use flowsteer_cmd::{FlowCommands, FlowTableType};
use log::debug;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// A locked parent passed down to teardown.
pub(crate) struct Parent<'a> {
    pub(crate) node: &'a Arc<Node>,
    pub(crate) body: &'a mut NodeBody,
}

pub(crate) struct FlowRoot {
    pub(crate) table_type: FlowTableType,
    pub(crate) device: Arc<dyn FlowCommands>,
    pub(crate) config: SteeringConfig,
    chain: Mutex<ChainState>,
    arena: RwLock<HashMap<NodeId, Arc<Node>>>,
    next_id: AtomicU64,
    pub(crate) root_ns: Arc<Node>,
    this: Weak<FlowRoot>,
}

impl FlowRoot {
    pub(crate) fn new(
        table_type: FlowTableType,
        name: &str,
        device: Arc<dyn FlowCommands>,
        config: SteeringConfig,
    ) -> Arc<Self> {
        let root_ns = Node::new(
            NodeId(1),
            None,
            name,
            1,
            NodeObject::namespace(),
            NodeData::Namespace,
        );
        let mut arena = HashMap::new();
        arena.insert(root_ns.id, Arc::clone(&root_ns));

        debug!("created {} root namespace {}", table_type, name);
        Arc::new_cyclic(|this| Self {
            table_type,
            device,
            config,
            chain: Mutex::new(ChainState::default()),
            arena: RwLock::new(arena),
            next_id: AtomicU64::new(2),
            root_ns,
            this: this.clone(),
        })
    }

    /// Owning handle, for building caller-facing handles during teardown.
    pub(crate) fn handle(&self) -> FsResult<Arc<FlowRoot>> {
        self.this
            .upgrade()
            .ok_or_else(|| FsError::internal("flow root dropped during teardown"))
    }

    pub(crate) fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn lock_chain(&self) -> MutexGuard<'_, ChainState> {
        self.chain.lock()
    }

    // ========================================================================
    // Arena lookups
    // ========================================================================

    pub(crate) fn lookup(&self, id: NodeId) -> Option<Arc<Node>> {
        self.arena.read().get(&id).cloned()
    }

    pub(crate) fn node(&self, id: NodeId) -> FsResult<Arc<Node>> {
        self.lookup(id)
            .ok_or_else(|| FsError::internal(format!("node {:?} missing from arena", id)))
    }

    pub(crate) fn nodes(&self, ids: &[NodeId]) -> FsResult<Vec<Arc<Node>>> {
        let arena = self.arena.read();
        ids.iter()
            .map(|id| {
                arena.get(id).cloned().ok_or_else(|| {
                    FsError::internal(format!("child {:?} missing from arena", id))
                })
            })
            .collect()
    }

    /// Snapshot of a node's children.
    pub(crate) fn children_of(&self, node: &Node) -> FsResult<Vec<Arc<Node>>> {
        let ids = node.body.lock().children.clone();
        self.nodes(&ids)
    }

    pub(crate) fn parent_of(&self, node: &Node) -> FsResult<Option<Arc<Node>>> {
        node.parent.map(|id| self.node(id)).transpose()
    }

    pub(crate) fn parent_required(&self, node: &Node) -> FsResult<Arc<Node>> {
        self.parent_of(node)?.ok_or_else(|| {
            FsError::internal(format!("{} {} has no parent", node.kind(), node.name()))
        })
    }

    /// Namespaces on the path from the root down to `node`.
    pub(crate) fn namespace_path(&self, node: &Node) -> FsResult<Vec<Arc<Node>>> {
        let mut path = Vec::new();
        let mut parent = self.parent_of(node)?;
        while let Some(current) = parent {
            parent = self.parent_of(&current)?;
            if current.kind() == NodeType::Namespace {
                path.push(current);
            }
        }
        path.reverse();
        Ok(path)
    }

    // ========================================================================
    // Attach / release
    // ========================================================================

    pub(crate) fn new_node(
        &self,
        parent: &Node,
        name: impl Into<String>,
        users: u32,
        obj: NodeObject,
        data: NodeData,
    ) -> Arc<Node> {
        Node::new(
            NodeId(self.alloc_id()),
            Some(parent.id),
            name,
            users,
            obj,
            data,
        )
    }

    /// Links `node` under `parent`, at `position` or at the tail.
    pub(crate) fn attach(
        &self,
        parent: &Node,
        parent_body: &mut NodeBody,
        node: &Arc<Node>,
        position: Option<usize>,
    ) {
        self.arena.write().insert(node.id, Arc::clone(node));
        match position {
            Some(pos) if pos <= parent_body.children.len() => {
                parent_body.children.insert(pos, node.id)
            }
            _ => parent_body.children.push(node.id),
        }
        parent.acquire();
    }

    fn detach(&self, node: &Node, parent_body: &mut NodeBody) {
        node.mark_detaching();
        parent_body.children.retain(|id| *id != node.id);
    }

    fn finish(&self, node: &Node) {
        self.arena.write().remove(&node.id);
        node.complete();
        debug!("removed {} {}", node.kind(), node.name());
    }

    /// Drops one user of `node`. Every node whose count reaches zero is
    /// detached and torn down, and the release continues with its parent.
    pub(crate) fn release(&self, node: &Arc<Node>, log: &mut TeardownLog) -> FsResult<()> {
        let mut current = Arc::clone(node);
        loop {
            let parent = match self.parent_of(&current)? {
                Some(parent) => parent,
                None => {
                    if current.put()? {
                        current.mark_detaching();
                        self.finish(&current);
                    }
                    return Ok(());
                }
            };

            let next = if current.kind() == NodeType::Rule {
                self.release_rule(&current, parent, log)?
            } else {
                let mut body = parent.body.lock();
                if !current.put()? {
                    return Ok(());
                }
                self.detach(&current, &mut body);
                self.teardown(
                    &current,
                    Parent {
                        node: &parent,
                        body: &mut *body,
                    },
                    None,
                    log,
                );
                drop(body);
                self.finish(&current);
                Some(parent)
            };

            match next {
                Some(parent) => current = parent,
                None => return Ok(()),
            }
        }
    }

    /// Rules are released under both the group and the entry lock, so the
    /// entry can go in the same critical section as its last rule.
    fn release_rule(
        &self,
        rule: &Arc<Node>,
        entry: Arc<Node>,
        log: &mut TeardownLog,
    ) -> FsResult<Option<Arc<Node>>> {
        let group = self.parent_required(&entry)?;
        let mut group_body = group.body.lock();
        let mut entry_body = entry.body.lock();
        if !entry_body.children.contains(&rule.id) {
            return Err(rule.gone());
        }
        if !rule.put()? {
            return Ok(None);
        }
        self.detach(rule, &mut entry_body);
        self.teardown(
            rule,
            Parent {
                node: &entry,
                body: &mut *entry_body,
            },
            Some(Parent {
                node: &group,
                body: &mut *group_body,
            }),
            log,
        );
        drop(entry_body);
        self.finish(rule);

        if !entry.put()? {
            return Ok(None);
        }
        self.detach(&entry, &mut group_body);
        self.teardown(
            &entry,
            Parent {
                node: &group,
                body: &mut *group_body,
            },
            None,
            log,
        );
        drop(group_body);
        self.finish(&entry);
        Ok(Some(group))
    }

    /// Releases `node` and waits until its teardown has finished, possibly
    /// on another thread that still held a user.
    pub(crate) fn remove_node(&self, node: &Arc<Node>, log: &mut TeardownLog) -> FsResult<()> {
        self.release(node, log)?;
        node.wait_freed();
        Ok(())
    }

    fn teardown(
        &self,
        node: &Arc<Node>,
        mut parent: Parent<'_>,
        grandparent: Option<Parent<'_>>,
        log: &mut TeardownLog,
    ) {
        match &node.obj {
            NodeObject::Namespace(_) | NodeObject::Priority(_) => {}
            NodeObject::Table(table) => {
                if let Err(e) = self.device.destroy_flow_table(self.table_type, table.id) {
                    log.record(&format!("destroy flow table {}", table.id), e);
                }
            }
            NodeObject::Group(group) => {
                let table_id = match parent.node.as_table() {
                    Ok(table) => table.id,
                    Err(e) => return log.record("find group table", e),
                };
                if let Ok(state) = parent.body.table_state_mut() {
                    if state.autogroup.active {
                        state.autogroup.num_types = state.autogroup.num_types.saturating_sub(1);
                    }
                }
                if let Err(e) = self
                    .device
                    .destroy_flow_group(self.table_type, table_id, group.id)
                {
                    log.record(&format!("destroy flow group {}", group.id), e);
                }
            }
            NodeObject::Entry(entry) => {
                let table_id = match self
                    .parent_required(parent.node)
                    .and_then(|table| table.as_table().map(|t| t.id))
                {
                    Ok(id) => id,
                    Err(e) => return log.record("find entry table", e),
                };
                let index = entry.index();
                if let Err(e) = self
                    .device
                    .delete_flow_entry(self.table_type, table_id, index)
                {
                    log.record(&format!("delete fte {} of table {}", index, table_id), e);
                }
                match parent.body.num_ftes_mut() {
                    Ok(num_ftes) => *num_ftes = num_ftes.saturating_sub(1),
                    Err(e) => log.record("update group entry count", e),
                }
            }
            NodeObject::Rule(_) => match grandparent {
                Some(group) => rule::teardown_rule(self, node, parent, group, log),
                None => log.record(
                    "tear down destination",
                    FsError::internal(format!("rule {} released without its group", node.name())),
                ),
            },
        }
    }
}

impl fmt::Debug for FlowRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowRoot")
            .field("table_type", &self.table_type)
            .field("root_ns", &self.root_ns.name())
            .field("nodes", &self.arena.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{PrioFlags, PriorityObj};
    use flowsteer_cmd::MockDevice;
    use pretty_assertions::assert_eq;

    fn test_root() -> Arc<FlowRoot> {
        FlowRoot::new(
            FlowTableType::NicRx,
            "root",
            Arc::new(MockDevice::new()),
            SteeringConfig::default(),
        )
    }

    fn add_prio(root: &FlowRoot, parent: &Arc<Node>, prio: u32) -> Arc<Node> {
        let node = root.new_node(
            parent,
            format!("prio{}", prio),
            1,
            NodeObject::Priority(PriorityObj {
                prio,
                flags: PrioFlags::empty(),
                shared: Mutex::new(()),
            }),
            NodeData::Priority { max_ft: 1 },
        );
        let mut body = parent.body.lock();
        root.attach(parent, &mut body, &node, None);
        node
    }

    #[test]
    fn test_attach_acquires_parent() {
        let root = test_root();
        let prio = add_prio(&root, &root.root_ns, 0);
        assert_eq!(root.root_ns.users(), 2);
        assert_eq!(prio.users(), 1);
        assert_eq!(root.children_of(&root.root_ns).unwrap().len(), 1);
        assert!(root.lookup(prio.id).is_some());
    }

    #[test]
    fn test_release_cascades_to_parent() {
        let root = test_root();
        let prio = add_prio(&root, &root.root_ns, 0);
        let mut log = TeardownLog::new();

        root.remove_node(&prio, &mut log).unwrap();
        assert!(root.lookup(prio.id).is_none());
        assert!(root.root_ns.body.lock().children.is_empty());
        assert_eq!(root.root_ns.users(), 1);

        root.release(&Arc::clone(&root.root_ns), &mut log).unwrap();
        assert!(!root.root_ns.is_live());
        assert!(log.is_empty());
    }

    #[test]
    fn test_release_keeps_node_with_other_users() {
        let root = test_root();
        let prio = add_prio(&root, &root.root_ns, 0);
        prio.acquire();
        let mut log = TeardownLog::new();
        root.release(&prio, &mut log).unwrap();
        assert!(prio.is_live());
        assert_eq!(root.children_of(&root.root_ns).unwrap().len(), 1);
    }

    #[test]
    fn test_namespace_path_is_top_down() {
        let root = test_root();
        let prio = add_prio(&root, &root.root_ns, 0);
        let nested = root.new_node(
            &prio,
            "nested",
            1,
            NodeObject::namespace(),
            NodeData::Namespace,
        );
        {
            let mut body = prio.body.lock();
            root.attach(&prio, &mut body, &nested, None);
        }
        let inner = add_prio(&root, &nested, 0);

        let names: Vec<String> = root
            .namespace_path(&inner)
            .unwrap()
            .iter()
            .map(|n| n.name())
            .collect();
        assert_eq!(names, vec!["root".to_string(), "nested".to_string()]);
    }
}
