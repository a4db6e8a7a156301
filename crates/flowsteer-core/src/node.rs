//! Tree node substrate shared by every steering object.
//!
//! # Architecture
//!
//! Nodes live in a per-root arena (see [`crate::root`]) and refer to each
//! other by [`NodeId`]. Each node carries:
//!
//! - an immutable kind-specific object ([`NodeObject`]) holding the fields
//!   fixed at creation: device ids, levels, masks, match values
//! - a body behind the node lock ([`NodeBody`]) holding the ordered child
//!   list and the mutable kind-specific state
//! - a user count: children attached to the node, plus explicit lookups
//! - a lifecycle state with a condition variable so a destroyer can wait
//!   until another thread has finished the teardown
//!
//! Memory lifetime is the `Arc` strong count. Reaching zero users detaches
//! the node from its parent and tears down the device object, even while
//! other threads still hold `Arc`s to it.

use crate::autogroup::AutogroupState;
use crate::error::{FsError, FsResult};
use crate::notifier::{ClientData, HandlerId, NotifierHandler};
use crate::star::StarRules;
use bitflags::bitflags;
use flowsteer_cmd::{
    FlowAction, FlowDestination, FlowGroupId, FlowTableId, MatchCriteria, MatchParam,
};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Arena key of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct NodeId(pub(crate) u64);

/// Kind of a tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Namespace,
    Priority,
    Table,
    Group,
    Entry,
    Rule,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeType::Namespace => "namespace",
            NodeType::Priority => "priority",
            NodeType::Table => "table",
            NodeType::Group => "group",
            NodeType::Entry => "entry",
            NodeType::Rule => "rule",
        };
        write!(f, "{}", s)
    }
}

bitflags! {
    /// Priority behaviour flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PrioFlags: u8 {
        /// Auto-grouped tables in this priority are shared between callers.
        const SHARED = 1 << 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Live,
    Detaching,
    Freed,
}

// ============================================================================
// Immutable per-kind objects
// ============================================================================

pub(crate) struct NamespaceObj {
    /// Registered rule notifiers.
    pub(crate) notifiers: RwLock<Vec<Arc<NotifierHandler>>>,
    /// Read by rule mutation, written by whole-namespace rule walks.
    pub(crate) dests: RwLock<()>,
}

pub(crate) struct PriorityObj {
    pub(crate) prio: u32,
    pub(crate) flags: PrioFlags,
    /// Serializes shared auto-grouped table creation and destruction.
    pub(crate) shared: Mutex<()>,
}

#[derive(Debug)]
pub(crate) struct TableObj {
    pub(crate) id: FlowTableId,
    pub(crate) level: u32,
    /// Usable entries; the two star entries sit right after them.
    pub(crate) max_fte: u32,
}

#[derive(Debug)]
pub(crate) struct GroupObj {
    pub(crate) id: FlowGroupId,
    pub(crate) start_index: u32,
    pub(crate) max_ftes: u32,
    pub(crate) criteria: MatchCriteria,
}

impl GroupObj {
    pub(crate) fn end_index(&self) -> u32 {
        self.start_index + self.max_ftes - 1
    }

    pub(crate) fn contains(&self, index: u32) -> bool {
        index >= self.start_index && index < self.start_index + self.max_ftes
    }
}

pub(crate) struct EntryObj {
    pub(crate) match_value: MatchParam,
    pub(crate) action: FlowAction,
    pub(crate) flow_tag: u32,
    /// Only written with the owning group's lock held.
    pub(crate) index: AtomicU32,
}

impl EntryObj {
    pub(crate) fn index(&self) -> u32 {
        self.index.load(Ordering::Acquire)
    }

    pub(crate) fn set_index(&self, index: u32) {
        self.index.store(index, Ordering::Release);
    }
}

pub(crate) struct RuleObj {
    pub(crate) dest: FlowDestination,
    /// Per-handler private data.
    pub(crate) clients: Mutex<Vec<(HandlerId, ClientData)>>,
}

pub(crate) enum NodeObject {
    Namespace(NamespaceObj),
    Priority(PriorityObj),
    Table(TableObj),
    Group(GroupObj),
    Entry(EntryObj),
    Rule(RuleObj),
}

impl NodeObject {
    pub(crate) fn namespace() -> Self {
        NodeObject::Namespace(NamespaceObj {
            notifiers: RwLock::new(Vec::new()),
            dests: RwLock::new(()),
        })
    }

    pub(crate) fn kind(&self) -> NodeType {
        match self {
            NodeObject::Namespace(_) => NodeType::Namespace,
            NodeObject::Priority(_) => NodeType::Priority,
            NodeObject::Table(_) => NodeType::Table,
            NodeObject::Group(_) => NodeType::Group,
            NodeObject::Entry(_) => NodeType::Entry,
            NodeObject::Rule(_) => NodeType::Rule,
        }
    }
}

// ============================================================================
// Mutable per-kind state
// ============================================================================

/// Table state guarded by the table lock.
#[derive(Debug)]
pub(crate) struct TableState {
    pub(crate) autogroup: AutogroupState,
    /// Owners of a shared auto-grouped table.
    pub(crate) shared_refcount: u32,
    pub(crate) star: StarRules,
}

#[derive(Debug)]
pub(crate) enum NodeData {
    Namespace,
    Priority { max_ft: u32 },
    Table(TableState),
    Group { num_ftes: u32 },
    Entry,
    Rule,
}

/// Everything behind the node lock.
#[derive(Debug)]
pub(crate) struct NodeBody {
    pub(crate) children: Vec<NodeId>,
    pub(crate) data: NodeData,
}

impl NodeBody {
    pub(crate) fn table_state(&self) -> FsResult<&TableState> {
        match &self.data {
            NodeData::Table(state) => Ok(state),
            other => Err(FsError::internal(format!("expected table state, got {:?}", other))),
        }
    }

    pub(crate) fn table_state_mut(&mut self) -> FsResult<&mut TableState> {
        match &mut self.data {
            NodeData::Table(state) => Ok(state),
            other => Err(FsError::internal(format!("expected table state, got {:?}", other))),
        }
    }

    pub(crate) fn max_ft(&self) -> FsResult<u32> {
        match &self.data {
            NodeData::Priority { max_ft } => Ok(*max_ft),
            other => Err(FsError::internal(format!("expected priority state, got {:?}", other))),
        }
    }

    pub(crate) fn set_max_ft(&mut self, value: u32) -> FsResult<()> {
        match &mut self.data {
            NodeData::Priority { max_ft } => {
                *max_ft = value;
                Ok(())
            }
            other => Err(FsError::internal(format!("expected priority state, got {:?}", other))),
        }
    }

    pub(crate) fn num_ftes(&self) -> FsResult<u32> {
        match &self.data {
            NodeData::Group { num_ftes } => Ok(*num_ftes),
            other => Err(FsError::internal(format!("expected group state, got {:?}", other))),
        }
    }

    pub(crate) fn num_ftes_mut(&mut self) -> FsResult<&mut u32> {
        match &mut self.data {
            NodeData::Group { num_ftes } => Ok(num_ftes),
            other => Err(FsError::internal(format!("expected group state, got {:?}", other))),
        }
    }
}

// ============================================================================
// Node
// ============================================================================

pub(crate) struct Node {
    pub(crate) id: NodeId,
    pub(crate) parent: Option<NodeId>,
    users: AtomicU32,
    name: Mutex<String>,
    pub(crate) body: Mutex<NodeBody>,
    pub(crate) obj: NodeObject,
    lifecycle: Mutex<Lifecycle>,
    freed: Condvar,
}

impl Node {
    pub(crate) fn new(
        id: NodeId,
        parent: Option<NodeId>,
        name: impl Into<String>,
        users: u32,
        obj: NodeObject,
        data: NodeData,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            parent,
            users: AtomicU32::new(users),
            name: Mutex::new(name.into()),
            body: Mutex::new(NodeBody {
                children: Vec::new(),
                data,
            }),
            obj,
            lifecycle: Mutex::new(Lifecycle::Live),
            freed: Condvar::new(),
        })
    }

    pub(crate) fn kind(&self) -> NodeType {
        self.obj.kind()
    }

    pub(crate) fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub(crate) fn rename(&self, name: impl Into<String>) {
        *self.name.lock() = name.into();
    }

    pub(crate) fn users(&self) -> u32 {
        self.users.load(Ordering::Acquire)
    }

    pub(crate) fn acquire(&self) {
        self.users.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one user. Returns true when this was the last one.
    pub(crate) fn put(&self) -> FsResult<bool> {
        match self
            .users
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |u| u.checked_sub(1))
        {
            Ok(1) => Ok(true),
            Ok(_) => Ok(false),
            Err(_) => Err(FsError::internal(format!(
                "user refcount underflow on {} {}",
                self.kind(),
                self.name()
            ))),
        }
    }

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock()
    }

    pub(crate) fn is_live(&self) -> bool {
        self.lifecycle() == Lifecycle::Live
    }

    /// Stops new lookups from finding the node.
    pub(crate) fn mark_detaching(&self) {
        let mut state = self.lifecycle.lock();
        if *state == Lifecycle::Live {
            *state = Lifecycle::Detaching;
        }
    }

    /// Marks teardown finished and wakes any waiting destroyer.
    pub(crate) fn complete(&self) {
        *self.lifecycle.lock() = Lifecycle::Freed;
        self.freed.notify_all();
    }

    /// Blocks until the node has been torn down.
    pub(crate) fn wait_freed(&self) {
        let mut state = self.lifecycle.lock();
        while *state != Lifecycle::Freed {
            self.freed.wait(&mut state);
        }
    }

    /// Error for operations on a torn-down node.
    pub(crate) fn gone(&self) -> FsError {
        FsError::not_found(format!("{} {}", self.kind(), self.name()))
    }

    pub(crate) fn ensure_live(&self) -> FsResult<()> {
        if self.is_live() {
            Ok(())
        } else {
            Err(self.gone())
        }
    }

    // Typed views of the immutable object.

    pub(crate) fn as_namespace(&self) -> FsResult<&NamespaceObj> {
        match &self.obj {
            NodeObject::Namespace(ns) => Ok(ns),
            _ => Err(self.wrong_kind(NodeType::Namespace)),
        }
    }

    pub(crate) fn as_priority(&self) -> FsResult<&PriorityObj> {
        match &self.obj {
            NodeObject::Priority(prio) => Ok(prio),
            _ => Err(self.wrong_kind(NodeType::Priority)),
        }
    }

    pub(crate) fn as_table(&self) -> FsResult<&TableObj> {
        match &self.obj {
            NodeObject::Table(table) => Ok(table),
            _ => Err(self.wrong_kind(NodeType::Table)),
        }
    }

    pub(crate) fn as_group(&self) -> FsResult<&GroupObj> {
        match &self.obj {
            NodeObject::Group(group) => Ok(group),
            _ => Err(self.wrong_kind(NodeType::Group)),
        }
    }

    pub(crate) fn as_entry(&self) -> FsResult<&EntryObj> {
        match &self.obj {
            NodeObject::Entry(entry) => Ok(entry),
            _ => Err(self.wrong_kind(NodeType::Entry)),
        }
    }

    pub(crate) fn as_rule(&self) -> FsResult<&RuleObj> {
        match &self.obj {
            NodeObject::Rule(rule) => Ok(rule),
            _ => Err(self.wrong_kind(NodeType::Rule)),
        }
    }

    fn wrong_kind(&self, expected: NodeType) -> FsError {
        FsError::internal(format!(
            "{} is a {}, expected a {}",
            self.name(),
            self.kind(),
            expected
        ))
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("name", &self.name())
            .field("users", &self.users())
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}
