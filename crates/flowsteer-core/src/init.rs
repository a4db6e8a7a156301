//! Static skeleton of the NIC receive steering tree.
//!
//! The skeleton is data: a tree of priorities and namespaces with
//! per-priority table budgets and minimum device levels. Budgets left at
//! zero are filled in bottom-up once the tree is built.

use crate::error::{FsError, FsResult};
use crate::namespace::Namespace;
use crate::node::{Node, NodeType, PrioFlags};
use crate::root::FlowRoot;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Number of bypass priorities in the default skeleton.
pub const NUM_BYPASS_FTS: u32 = 5;

const BYPASS_PRIO_MAX_FT: u32 = 1;
const KERNEL_MAX_FT: u32 = 2;
const LEFTOVER_MAX_FT: u32 = 1;
const KERNEL_MIN_LEVEL: u32 = 3;
const LEFTOVER_MIN_LEVEL: u32 = KERNEL_MIN_LEVEL + 1;
const BYPASS_MIN_LEVEL: u32 = NUM_BYPASS_FTS + LEFTOVER_MIN_LEVEL;

/// A node of the skeleton.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InitNode {
    Priority {
        name: String,
        #[serde(default)]
        shared: bool,
        /// Skipped when the device cannot reach this level.
        #[serde(default)]
        min_level: u32,
        /// Table budget; zero means the sum of the children's budgets.
        #[serde(default)]
        max_ft: u32,
        #[serde(default)]
        children: Vec<InitNode>,
    },
    Namespace {
        name: String,
        #[serde(default)]
        children: Vec<InitNode>,
    },
}

impl InitNode {
    pub fn priority(name: &str, min_level: u32, children: Vec<InitNode>) -> Self {
        InitNode::Priority {
            name: name.to_string(),
            shared: false,
            min_level,
            max_ft: 0,
            children,
        }
    }

    /// Leaf priority that holds up to `max_ft` tables.
    pub fn table_priority(name: &str, max_ft: u32) -> Self {
        InitNode::Priority {
            name: name.to_string(),
            shared: false,
            min_level: 0,
            max_ft,
            children: Vec::new(),
        }
    }

    pub fn namespace(name: &str, children: Vec<InitNode>) -> Self {
        InitNode::Namespace {
            name: name.to_string(),
            children,
        }
    }

    pub fn shared(mut self) -> Self {
        if let InitNode::Priority { shared, .. } = &mut self {
            *shared = true;
        }
        self
    }

    pub fn name(&self) -> &str {
        match self {
            InitNode::Priority { name, .. } | InitNode::Namespace { name, .. } => name,
        }
    }
}

/// Children of the NIC receive root namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootTemplate {
    pub children: Vec<InitNode>,
}

impl Default for RootTemplate {
    fn default() -> Self {
        let bypass = (0..NUM_BYPASS_FTS - 1)
            .map(|i| InitNode::table_priority(&format!("prio{}", i), BYPASS_PRIO_MAX_FT))
            .chain(std::iter::once(InitNode::table_priority(
                "prio-mcast",
                BYPASS_PRIO_MAX_FT,
            )))
            .collect();

        Self {
            children: vec![
                InitNode::priority(
                    "by_pass_prio",
                    BYPASS_MIN_LEVEL,
                    vec![InitNode::namespace("by_pass_ns", bypass)],
                ),
                InitNode::priority(
                    "kernel_prio",
                    KERNEL_MIN_LEVEL,
                    vec![InitNode::namespace(
                        "kernel_ns",
                        vec![InitNode::table_priority("prio_kernel-0", KERNEL_MAX_FT)],
                    )],
                ),
                InitNode::priority(
                    "leftovers_prio",
                    LEFTOVER_MIN_LEVEL,
                    vec![InitNode::namespace(
                        "leftover_ns",
                        vec![InitNode::table_priority("leftovers_prio-0", LEFTOVER_MAX_FT)],
                    )],
                )
                .shared(),
            ],
        }
    }
}

impl RootTemplate {
    pub fn from_yaml_str(text: &str) -> FsResult<Self> {
        serde_yaml::from_str(text)
            .map_err(|e| FsError::config(format!("Failed to parse root template: {}", e)))
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> FsResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            FsError::config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }
}

/// Builds the template under `root`'s namespace. Top-level priority numbers
/// are the template positions plus `prio_offset`; priorities whose min level
/// the device cannot reach are skipped but keep their number.
pub(crate) fn init_root_tree(
    root: &Arc<FlowRoot>,
    template: &RootTemplate,
    max_ft_level: u32,
    prio_offset: u32,
) -> FsResult<()> {
    let ns = Namespace::from_node(Arc::clone(root), Arc::clone(&root.root_ns));
    for (index, child) in template.children.iter().enumerate() {
        init_child(&ns, child, index as u32 + prio_offset, max_ft_level)?;
    }
    info!(
        "initialized {} root tree with {} top-level priorities",
        root.table_type,
        template.children.len()
    );
    Ok(())
}

fn init_child(ns: &Namespace, node: &InitNode, prio: u32, max_ft_level: u32) -> FsResult<()> {
    match node {
        InitNode::Priority {
            name,
            shared,
            min_level,
            max_ft,
            children,
        } => {
            if *min_level > max_ft_level {
                debug!(
                    "skipping priority {}: needs level {} of {}",
                    name, min_level, max_ft_level
                );
                return Ok(());
            }
            let flags = if *shared {
                PrioFlags::SHARED
            } else {
                PrioFlags::empty()
            };
            let prio_node = ns.create_priority(prio, *max_ft, name, flags)?;
            for child in children {
                match child {
                    InitNode::Namespace { name, children } => {
                        let nested = ns.create_namespace(&prio_node, name)?;
                        for (index, grandchild) in children.iter().enumerate() {
                            init_child(&nested, grandchild, index as u32, max_ft_level)?;
                        }
                    }
                    InitNode::Priority { name, .. } => {
                        return Err(FsError::config(format!(
                            "priority {} must sit inside a namespace",
                            name
                        )))
                    }
                }
            }
            Ok(())
        }
        InitNode::Namespace { name, .. } => Err(FsError::config(format!(
            "namespace {} must sit inside a priority",
            name
        ))),
    }
}

/// Fills zero budgets with the sum of the nested budgets, bottom-up.
pub(crate) fn set_max_ft(root: &FlowRoot, ns: &Node) -> FsResult<u32> {
    let mut total = 0;
    for prio in root.children_of(ns)? {
        let mut sum = 0;
        for child in root.children_of(&prio)? {
            if child.kind() == NodeType::Namespace {
                sum += set_max_ft(root, &child)?;
            }
        }
        let mut body = prio.body.lock();
        if body.max_ft()? == 0 {
            body.set_max_ft(sum)?;
        }
        total += body.max_ft()?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_template_shape() {
        let template = RootTemplate::default();
        let names: Vec<&str> = template.children.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["by_pass_prio", "kernel_prio", "leftovers_prio"]);

        match &template.children[0] {
            InitNode::Priority {
                min_level,
                children,
                ..
            } => {
                assert_eq!(*min_level, 9);
                match &children[0] {
                    InitNode::Namespace { name, children } => {
                        assert_eq!(name, "by_pass_ns");
                        let prios: Vec<&str> = children.iter().map(|c| c.name()).collect();
                        assert_eq!(prios, vec!["prio0", "prio1", "prio2", "prio3", "prio-mcast"]);
                    }
                    other => panic!("unexpected {:?}", other),
                }
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            &template.children[2],
            InitNode::Priority { shared: true, min_level: 4, .. }
        ));
    }

    #[test]
    fn test_template_from_yaml() {
        let yaml = "children:\n  - type: priority\n    name: p0\n    children:\n      - type: namespace\n        name: ns0\n        children:\n          - type: priority\n            name: leaf\n            max_ft: 3\n";
        let template = RootTemplate::from_yaml_str(yaml).unwrap();
        assert_eq!(
            template,
            RootTemplate {
                children: vec![InitNode::priority(
                    "p0",
                    0,
                    vec![InitNode::namespace(
                        "ns0",
                        vec![InitNode::table_priority("leaf", 3)]
                    )]
                )]
            }
        );
    }

    #[test]
    fn test_template_yaml_errors() {
        assert!(RootTemplate::from_yaml_str("children:\n  - type: table\n").is_err());
        assert!(RootTemplate::from_yaml_file("/nonexistent/template.yaml").is_err());
    }
}
