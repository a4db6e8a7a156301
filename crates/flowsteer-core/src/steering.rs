//! Device-wide steering state: bring-up, namespace lookup and cleanup.

use crate::config::{SteeringConfig, TeardownLog};
use crate::dump::{self, SteeringDump};
use crate::error::{FsError, FsResult};
use crate::init::{self, RootTemplate};
use crate::namespace::Namespace;
use crate::node::{Node, NodeType, PrioFlags};
use crate::notifier::{RuleEventFn, RuleNotifier};
use crate::root::FlowRoot;
use crate::table::FlowTable;
use flowsteer_cmd::{FlowCommands, FlowTableType};
use log::{info, warn};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Namespaces callers can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NamespaceType {
    Bypass,
    Kernel,
    Leftovers,
    Fdb,
    SnifferRx,
    SnifferTx,
}

impl NamespaceType {
    pub const ALL: [NamespaceType; 6] = [
        NamespaceType::Bypass,
        NamespaceType::Kernel,
        NamespaceType::Leftovers,
        NamespaceType::Fdb,
        NamespaceType::SnifferRx,
        NamespaceType::SnifferTx,
    ];
}

impl fmt::Display for NamespaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NamespaceType::Bypass => "bypass",
            NamespaceType::Kernel => "kernel",
            NamespaceType::Leftovers => "leftovers",
            NamespaceType::Fdb => "fdb",
            NamespaceType::SnifferRx => "sniffer_rx",
            NamespaceType::SnifferTx => "sniffer_tx",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for NamespaceType {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NamespaceType::ALL
            .iter()
            .copied()
            .find(|t| t.to_string() == s)
            .ok_or_else(|| FsError::invalid_argument(format!("unknown namespace type: {}", s)))
    }
}

const ROOT_NS_NAME: &str = "root";
const FDB_ROOT_NS_NAME: &str = "fdb_root";
const SNIFFER_RX_ROOT_NS_NAME: &str = "sniffer_rx_root";
const SNIFFER_TX_ROOT_NS_NAME: &str = "sniffer_tx_root";

/// Flow steering for one device.
pub struct FlowSteering {
    device: Arc<dyn FlowCommands>,
    config: SteeringConfig,
    nic_rx: Option<Arc<FlowRoot>>,
    fdb: Option<Arc<FlowRoot>>,
    sniffer_rx: Option<Arc<FlowRoot>>,
    sniffer_tx: Option<Arc<FlowRoot>>,
    dummy: Option<FlowTable>,
}

impl fmt::Debug for FlowSteering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowSteering")
            .field("config", &self.config)
            .field("nic_rx", &self.nic_rx.is_some())
            .field("fdb", &self.fdb.is_some())
            .field("sniffer_rx", &self.sniffer_rx.is_some())
            .field("sniffer_tx", &self.sniffer_tx.is_some())
            .finish()
    }
}

impl FlowSteering {
    /// Brings up every steering tree with the default NIC receive skeleton.
    pub fn init(device: Arc<dyn FlowCommands>, config: SteeringConfig) -> FsResult<Self> {
        Self::init_with_template(device, config, &RootTemplate::default())
    }

    /// Brings up every steering tree; the NIC receive root gets `template`.
    /// On failure everything built so far is torn down again.
    pub fn init_with_template(
        device: Arc<dyn FlowCommands>,
        config: SteeringConfig,
        template: &RootTemplate,
    ) -> FsResult<Self> {
        let mut steering = Self {
            device,
            config,
            nic_rx: None,
            fdb: None,
            sniffer_rx: None,
            sniffer_tx: None,
            dummy: None,
        };
        if let Err(e) = steering.build(template) {
            warn!("flow steering bring-up failed: {}", e);
            if let Err(cleanup) = steering.cleanup() {
                warn!("flow steering cleanup after failed bring-up: {}", cleanup);
            }
            return Err(e);
        }
        info!("flow steering initialized");
        Ok(steering)
    }

    fn new_root(&self, table_type: FlowTableType, name: &str) -> Arc<FlowRoot> {
        FlowRoot::new(
            table_type,
            name,
            Arc::clone(&self.device),
            self.config.clone(),
        )
    }

    fn build(&mut self, template: &RootTemplate) -> FsResult<()> {
        let caps = self.config.caps.clone();
        if caps.nic_flow_table {
            let root = self.new_root(FlowTableType::NicRx, ROOT_NS_NAME);
            self.nic_rx = Some(Arc::clone(&root));

            if !caps.modify_root {
                let ns = Namespace::from_node(Arc::clone(&root), Arc::clone(&root.root_ns));
                ns.create_priority(0, 1, "dummy_prio", PrioFlags::empty())?;
                let dummy = ns.create_auto_grouped_table(0, "ft_dummy", 1, 1).map_err(|e| {
                    warn!("couldn't create level 0 table: {}", e);
                    e
                })?;
                self.dummy = Some(dummy);
            }

            let offset = u32::from(!caps.modify_root);
            init::init_root_tree(&root, template, caps.max_ft_level, offset)?;
            init::set_max_ft(&root, &root.root_ns)?;
        }

        self.fdb = Some(self.single_prio_root(FlowTableType::Fdb, FDB_ROOT_NS_NAME, "fdb_prio")?);
        self.sniffer_tx = Some(self.single_prio_root(
            FlowTableType::SnifferTx,
            SNIFFER_TX_ROOT_NS_NAME,
            "sniffer_prio",
        )?);
        self.sniffer_rx = Some(self.single_prio_root(
            FlowTableType::SnifferRx,
            SNIFFER_RX_ROOT_NS_NAME,
            "sniffer_prio",
        )?);
        Ok(())
    }

    fn single_prio_root(
        &self,
        table_type: FlowTableType,
        name: &str,
        prio_name: &str,
    ) -> FsResult<Arc<FlowRoot>> {
        let root = self.new_root(table_type, name);
        let ns = Namespace::from_node(Arc::clone(&root), Arc::clone(&root.root_ns));
        ns.create_priority(0, 1, prio_name, PrioFlags::empty())?;
        Ok(root)
    }

    pub fn config(&self) -> &SteeringConfig {
        &self.config
    }

    pub fn device(&self) -> &Arc<dyn FlowCommands> {
        &self.device
    }

    fn root_for(&self, table_type: FlowTableType) -> Option<&Arc<FlowRoot>> {
        match table_type {
            FlowTableType::NicRx => self.nic_rx.as_ref(),
            FlowTableType::Fdb => self.fdb.as_ref(),
            FlowTableType::SnifferRx => self.sniffer_rx.as_ref(),
            FlowTableType::SnifferTx => self.sniffer_tx.as_ref(),
        }
    }

    /// Looks up a namespace. NIC receive namespaces are the first namespace
    /// under their root priority; the other types are whole roots.
    pub fn get_namespace(&self, ns_type: NamespaceType) -> Option<Namespace> {
        let prio = match ns_type {
            NamespaceType::Bypass => 0,
            NamespaceType::Kernel => 1,
            NamespaceType::Leftovers => 2,
            NamespaceType::Fdb => return self.root_namespace(FlowTableType::Fdb),
            NamespaceType::SnifferRx => return self.root_namespace(FlowTableType::SnifferRx),
            NamespaceType::SnifferTx => return self.root_namespace(FlowTableType::SnifferTx),
        };
        let offset = u32::from(!self.config.caps.modify_root);
        let root = self.root_namespace(FlowTableType::NicRx)?;
        root.find_namespace(prio + offset).ok().flatten()
    }

    /// Root namespace of a steering domain.
    pub fn root_namespace(&self, table_type: FlowTableType) -> Option<Namespace> {
        let root = self.root_for(table_type)?;
        Some(Namespace::from_node(
            Arc::clone(root),
            Arc::clone(&root.root_ns),
        ))
    }

    /// Registers rule callbacks on a namespace looked up by type.
    pub fn register_rule_notifier(
        &self,
        ns_type: NamespaceType,
        add: Option<RuleEventFn>,
        del: Option<RuleEventFn>,
    ) -> FsResult<RuleNotifier> {
        let ns = self.get_namespace(ns_type).ok_or_else(|| {
            FsError::invalid_argument(format!("namespace {} is not available", ns_type))
        })?;
        ns.register_rule_notifier(add, del)
    }

    /// Snapshot of every steering tree.
    pub fn dump(&self) -> FsResult<SteeringDump> {
        let mut out = SteeringDump::default();
        for root in [&self.nic_rx, &self.fdb, &self.sniffer_rx, &self.sniffer_tx]
            .into_iter()
            .flatten()
        {
            out.roots.push(dump::dump_root(root)?);
        }
        Ok(out)
    }

    /// Tears the skeletons down. Tables still owned by callers stay alive
    /// until their handles destroy them.
    pub fn cleanup(&mut self) -> FsResult<()> {
        let mut log = TeardownLog::new();

        if let Some(dummy) = self.dummy.take() {
            if let Err(e) = dummy.destroy() {
                log.record("destroy the dummy table", e);
            }
        }
        let roots = [
            self.nic_rx.take(),
            self.sniffer_rx.take(),
            self.sniffer_tx.take(),
            self.fdb.take(),
        ];
        for root in roots.into_iter().flatten() {
            release_skeleton(&root, &root.root_ns, &mut log);
            info!("cleaned up {} steering root", root.table_type);
        }
        log.finish(self.config.teardown)
    }
}

/// Releases the namespaces and priorities below `node`, children first.
fn release_skeleton(root: &FlowRoot, node: &Arc<Node>, log: &mut TeardownLog) {
    match root.children_of(node) {
        Ok(children) => {
            for child in children {
                match child.kind() {
                    NodeType::Namespace | NodeType::Priority => {
                        release_skeleton(root, &child, log)
                    }
                    kind => warn!(
                        "flow steering {} {} is still in use under {}",
                        kind,
                        child.name(),
                        node.name()
                    ),
                }
            }
        }
        Err(e) => log.record(&format!("walk {}", node.name()), e),
    }

    if let Err(e) = root.release(node, log) {
        log.record(&format!("release {}", node.name()), e);
    }
    if node.is_live() {
        warn!(
            "flow steering {} {} is still referenced, leaving it to its owners",
            node.kind(),
            node.name()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowsteer_cmd::MockDevice;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_namespace_type_names() {
        for ns_type in NamespaceType::ALL {
            assert_eq!(ns_type.to_string().parse::<NamespaceType>().unwrap(), ns_type);
        }
        assert_eq!("sniffer_rx".parse::<NamespaceType>().unwrap(), NamespaceType::SnifferRx);
        assert!("egress".parse::<NamespaceType>().is_err());
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let device = Arc::new(MockDevice::new());
        let mut steering = FlowSteering::init(device.clone(), SteeringConfig::default()).unwrap();
        assert!(steering.root_namespace(FlowTableType::SnifferTx).is_some());

        steering.cleanup().unwrap();
        assert!(steering.root_namespace(FlowTableType::NicRx).is_none());
        assert!(steering.dump().unwrap().roots.is_empty());
        steering.cleanup().unwrap();
        assert_eq!(device.table_count(), 0);
    }

    #[test]
    fn test_dummy_table_is_root() {
        let device = Arc::new(MockDevice::new());
        let config = SteeringConfig::new().with_modify_root(false);
        let mut steering = FlowSteering::init(device.clone(), config).unwrap();
        assert_eq!(device.table_count(), 1);

        let kernel = steering.get_namespace(NamespaceType::Kernel).unwrap();
        assert_eq!(kernel.name(), "kernel_ns");

        steering.cleanup().unwrap();
        assert_eq!(device.table_count(), 0);
    }
}
