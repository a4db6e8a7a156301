//! Serializable snapshot of the steering trees.

use crate::error::FsResult;
use crate::node::{Node, NodeObject, NodeType, PrioFlags};
use crate::root::FlowRoot;
use flowsteer_cmd::{FlowDestination, FlowGroupId, FlowTableId, FlowTableType, MatchParam};
use serde::Serialize;

/// Kind-specific fields of a dumped node.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeDetails {
    Namespace {
        notifiers: usize,
    },
    Priority {
        prio: u32,
        max_ft: u32,
        shared: bool,
    },
    Table {
        id: FlowTableId,
        level: u32,
        max_fte: u32,
        autogroup: bool,
        shared_refcount: u32,
        star_target: Option<String>,
    },
    Group {
        id: FlowGroupId,
        start_index: u32,
        end_index: u32,
        num_ftes: u32,
    },
    Entry {
        index: u32,
        action: u32,
        flow_tag: u32,
        match_value: MatchParam,
    },
    Rule {
        destination: FlowDestination,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeDump {
    pub name: String,
    pub kind: NodeType,
    pub users: u32,
    #[serde(flatten)]
    pub details: NodeDetails,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeDump>,
}

impl NodeDump {
    /// Depth-first search by name.
    pub fn find(&self, name: &str) -> Option<&NodeDump> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(name))
    }

    /// Number of nodes of `kind` in this subtree.
    pub fn count(&self, kind: NodeType) -> usize {
        let own = usize::from(self.kind == kind);
        own + self.children.iter().map(|c| c.count(kind)).sum::<usize>()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RootDump {
    pub table_type: FlowTableType,
    pub root_table: Option<String>,
    pub tree: NodeDump,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SteeringDump {
    pub roots: Vec<RootDump>,
}

impl SteeringDump {
    pub fn root(&self, table_type: FlowTableType) -> Option<&RootDump> {
        self.roots.iter().find(|r| r.table_type == table_type)
    }
}

pub(crate) fn dump_root(root: &FlowRoot) -> FsResult<RootDump> {
    let root_table = root.lock_chain().root_table.as_ref().map(|t| t.name());
    Ok(RootDump {
        table_type: root.table_type,
        root_table,
        tree: dump_node(root, &root.root_ns)?,
    })
}

fn dump_node(root: &FlowRoot, node: &Node) -> FsResult<NodeDump> {
    let details = {
        let body = node.body.lock();
        match &node.obj {
            NodeObject::Namespace(ns) => NodeDetails::Namespace {
                notifiers: ns.notifiers.read().len(),
            },
            NodeObject::Priority(prio) => NodeDetails::Priority {
                prio: prio.prio,
                max_ft: body.max_ft()?,
                shared: prio.flags.contains(PrioFlags::SHARED),
            },
            NodeObject::Table(table) => {
                let state = body.table_state()?;
                NodeDetails::Table {
                    id: table.id,
                    level: table.level,
                    max_fte: table.max_fte,
                    autogroup: state.autogroup.active,
                    shared_refcount: state.shared_refcount,
                    star_target: state.star.target().map(|t| t.name()),
                }
            }
            NodeObject::Group(group) => NodeDetails::Group {
                id: group.id,
                start_index: group.start_index,
                end_index: group.end_index(),
                num_ftes: body.num_ftes()?,
            },
            NodeObject::Entry(entry) => NodeDetails::Entry {
                index: entry.index(),
                action: entry.action.bits(),
                flow_tag: entry.flow_tag,
                match_value: entry.match_value.clone(),
            },
            NodeObject::Rule(rule) => NodeDetails::Rule {
                destination: rule.dest,
            },
        }
    };

    let children = root
        .children_of(node)?
        .iter()
        .map(|child| dump_node(root, child))
        .collect::<FsResult<Vec<_>>>()?;

    Ok(NodeDump {
        name: node.name(),
        kind: node.kind(),
        users: node.users(),
        details,
        children,
    })
}
