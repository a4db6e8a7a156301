//! NIC flow-steering tree engine.
//!
//! This crate keeps the software model of a device's packet steering
//! tables and drives the device through the [`flowsteer_cmd::FlowCommands`]
//! channel:
//!
//! - [`FlowSteering`]: brings the steering roots up and tears them down
//! - [`Namespace`]: ordered priorities holding tables or nested namespaces
//! - [`FlowTable`]: a device table with its groups and chaining rules
//! - [`FlowGroup`]: an index range sharing one match mask
//! - [`FlowRule`]: one destination of a flow entry
//! - [`RuleNotifier`]: add/delete callbacks on a namespace
//!
//! # Architecture
//!
//! Every root holds a tree:
//!
//! ```text
//! namespace -> priority -> table -> group -> entry -> rule
//!                       \-> namespace -> ...
//! ```
//!
//! Tables are chained in priority order: the two reserved entries at the
//! end of each table forward unmatched packets to the first table of the
//! next non-empty priority. Creating or destroying a table re-points the
//! chain make-before-break, so no packet ever hits a missing table.
//!
//! # Example
//!
//! ```
//! use flowsteer_cmd::{FlowDestination, MatchCriteria, MatchParam, MockDevice};
//! use flowsteer_core::{FlowSpec, FlowSteering, NamespaceType, SteeringConfig};
//! use std::sync::Arc;
//!
//! let device = Arc::new(MockDevice::new());
//! let steering = FlowSteering::init(device.clone(), SteeringConfig::default()).unwrap();
//!
//! let kernel = steering.get_namespace(NamespaceType::Kernel).unwrap();
//! let table = kernel.create_auto_grouped_table(0, "vlan", 16, 2).unwrap();
//!
//! let rule = table
//!     .add_rule(
//!         &MatchCriteria::match_all(),
//!         &FlowSpec::new(MatchParam::zeroed()),
//!         FlowDestination::Tir(7),
//!     )
//!     .unwrap();
//! assert_eq!(rule.index().unwrap(), 0);
//!
//! rule.delete().unwrap();
//! table.destroy().unwrap();
//! ```

mod autogroup;
pub mod config;
pub mod dump;
pub mod error;
mod group;
pub mod init;
mod namespace;
mod node;
mod notifier;
pub mod roce;
mod root;
mod rule;
mod star;
mod steering;
mod table;

pub use config::{DeviceCaps, SteeringConfig, TeardownPolicy};
pub use dump::{NodeDetails, NodeDump, RootDump, SteeringDump};
pub use error::{FsError, FsResult};
pub use group::{FlowGroup, FlowGroupConfig};
pub use init::{InitNode, RootTemplate, NUM_BYPASS_FTS};
pub use namespace::Namespace;
pub use node::{NodeType, PrioFlags};
pub use notifier::{ClientData, RuleEventFn, RuleNotifier};
pub use roce::{add_roce_rules, roce_flow_rules, RoceModes};
pub use rule::{FlowRule, FlowSpec};
pub use steering::{FlowSteering, NamespaceType};
pub use table::FlowTable;
