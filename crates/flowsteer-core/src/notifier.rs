//! Rule notifier registry.
//!
//! Consumers such as a sniffer register add/delete callbacks on a
//! namespace and are told about every destination added to or removed from
//! a rule below it. Events go to the nearest ancestor namespace that has
//! handlers. Each handler can attach private data to individual rules and
//! gets it back in the delete callback.

use crate::error::FsResult;
use crate::namespace::Namespace;
use crate::node::{Node, NodeType};
use crate::root::FlowRoot;
use crate::rule::FlowRule;
use log::{debug, warn};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Per-rule private data owned by one handler.
pub type ClientData = Arc<dyn Any + Send + Sync>;

/// Callback for rule events.
///
/// For adds the flag is `is_new`: true only for the first destination of a
/// new entry. For deletes it is `ctx_changed`: true once no destinations
/// remain. Delete callbacks also receive the handler's private data.
pub type RuleEventFn = Arc<dyn Fn(&FlowRule, bool, Option<&ClientData>) -> FsResult<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct HandlerId(pub(crate) u64);

pub(crate) struct NotifierHandler {
    pub(crate) id: HandlerId,
    add: Option<RuleEventFn>,
    del: Option<RuleEventFn>,
}

impl fmt::Debug for NotifierHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifierHandler")
            .field("id", &self.id)
            .field("add", &self.add.is_some())
            .field("del", &self.del.is_some())
            .finish()
    }
}

/// Registration returned by [`Namespace::register_rule_notifier`].
pub struct RuleNotifier {
    root: Arc<FlowRoot>,
    ns: Arc<Node>,
    id: HandlerId,
}

impl fmt::Debug for RuleNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleNotifier")
            .field("namespace", &self.ns.name())
            .field("id", &self.id)
            .finish()
    }
}

impl RuleNotifier {
    pub(crate) fn id(&self) -> HandlerId {
        self.id
    }

    /// Namespace the handler is registered on.
    pub fn namespace(&self) -> Namespace {
        Namespace::from_node(Arc::clone(&self.root), Arc::clone(&self.ns))
    }

    /// Removes the handler and drops its private data from every rule.
    pub fn unregister(self) -> FsResult<()> {
        let ns_obj = self.ns.as_namespace()?;
        let _dests = ns_obj.dests.write();
        let mut handlers = ns_obj.notifiers.write();

        let id = self.id;
        walk_namespace(&self.root, &self.ns, &mut |rule, _| {
            rule.as_rule()?.clients.lock().retain(|(owner, _)| *owner != id);
            Ok(())
        })?;
        handlers.retain(|h| h.id != id);
        debug!("unregistered rule notifier {:?} from {}", id, self.ns.name());
        Ok(())
    }
}

impl Namespace {
    /// Registers add and delete callbacks for rules below this namespace.
    pub fn register_rule_notifier(
        &self,
        add: Option<RuleEventFn>,
        del: Option<RuleEventFn>,
    ) -> FsResult<RuleNotifier> {
        self.node.ensure_live()?;
        let id = HandlerId(self.root.alloc_id());
        let handler = Arc::new(NotifierHandler { id, add, del });
        self.node.as_namespace()?.notifiers.write().push(handler);
        debug!("registered rule notifier {:?} on {}", id, self.node.name());
        Ok(RuleNotifier {
            root: Arc::clone(&self.root),
            ns: Arc::clone(&self.node),
            id,
        })
    }

    /// Calls `callback` for every destination below this namespace, with
    /// `is_new` set for the first destination of each entry. Stops at the
    /// first error and returns it.
    ///
    /// Rule insertion and removal below the namespace wait until the walk
    /// is done.
    pub fn iterate_existing_rules<F>(&self, mut callback: F) -> FsResult<()>
    where
        F: FnMut(&FlowRule, bool) -> FsResult<()>,
    {
        let ns_obj = self.node.as_namespace()?;
        let _dests = ns_obj.dests.write();
        let _handlers = ns_obj.notifiers.read();

        let root = &self.root;
        walk_namespace(root, &self.node, &mut |rule, is_new| {
            let handle = FlowRule::from_node(Arc::clone(root), Arc::clone(rule));
            callback(&handle, is_new)
        })
    }
}

// ============================================================================
// Rule walk
// ============================================================================

type Visit<'a> = dyn FnMut(&Arc<Node>, bool) -> FsResult<()> + 'a;

fn walk_namespace(root: &FlowRoot, ns: &Node, visit: &mut Visit<'_>) -> FsResult<()> {
    for prio in root.children_of(ns)? {
        for child in root.children_of(&prio)? {
            match child.kind() {
                NodeType::Namespace => walk_namespace(root, &child, visit)?,
                _ => walk_table(root, &child, visit)?,
            }
        }
    }
    Ok(())
}

fn walk_table(root: &FlowRoot, table: &Node, visit: &mut Visit<'_>) -> FsResult<()> {
    for group in root.children_of(table)? {
        let group_body = group.body.lock();
        for entry in root.nodes(&group_body.children)? {
            let entry_body = entry.body.lock();
            let mut is_new = true;
            for rule in root.nodes(&entry_body.children)? {
                visit(&rule, is_new)?;
                is_new = false;
            }
        }
    }
    Ok(())
}

// ============================================================================
// Event delivery
// ============================================================================

fn notified_namespace(root: &FlowRoot, node: &Node) -> FsResult<Option<Arc<Node>>> {
    for ns in root.namespace_path(node)?.into_iter().rev() {
        if !ns.as_namespace()?.notifiers.read().is_empty() {
            return Ok(Some(ns));
        }
    }
    Ok(None)
}

/// Tells handlers about a new destination. An add callback error stops
/// delivery to the remaining handlers.
pub(crate) fn notify_add(root: &FlowRoot, rule: &FlowRule, is_new: bool) {
    let ns = match notified_namespace(root, rule.node()) {
        Ok(Some(ns)) => ns,
        Ok(None) => return,
        Err(e) => {
            warn!("flow steering can't find rule notifiers: {}", e);
            return;
        }
    };
    let Ok(ns_obj) = ns.as_namespace() else {
        return;
    };

    for handler in ns_obj.notifiers.read().iter() {
        let Some(add) = &handler.add else {
            continue;
        };
        if let Err(e) = add(rule, is_new, None) {
            warn!(
                "rule notifier {:?} on {} failed on add: {}",
                handler.id,
                ns.name(),
                e
            );
            break;
        }
    }
}

/// Tells handlers a destination went away.
pub(crate) fn notify_del(root: &FlowRoot, rule: &FlowRule, ctx_changed: bool) {
    let ns = match notified_namespace(root, rule.node()) {
        Ok(Some(ns)) => ns,
        Ok(None) => return,
        Err(e) => {
            warn!("flow steering can't find rule notifiers: {}", e);
            return;
        }
    };
    let Ok(ns_obj) = ns.as_namespace() else {
        return;
    };

    for handler in ns_obj.notifiers.read().iter() {
        let Some(del) = &handler.del else {
            continue;
        };
        let data = rule.client_data(handler.id);
        if let Err(e) = del(rule, ctx_changed, data.as_ref()) {
            warn!(
                "rule notifier {:?} on {} failed on delete: {}",
                handler.id,
                ns.name(),
                e
            );
        }
    }
}
