//! Integration tests for the steering tree against the in-memory device.
//!
//! Every test brings flow steering up on a fresh `MockDevice` and checks
//! both the handles' view and the commands the device accepted.

use flowsteer_cmd::{
    CmdStatus, CommandKind, DeviceCommand, FlowAction, FlowDestination, FlowTableId,
    FlowTableType, MatchCriteria, MatchCriteriaEnable, MatchParam, MatchSection, MockDevice,
};
use flowsteer_core::{
    ClientData, FlowGroupConfig, FlowRule, FlowSpec, FlowSteering, FlowTable, FsError, FsResult,
    InitNode, NamespaceType, NodeDetails, NodeType, RootTemplate, RuleEventFn, SteeringConfig,
    TeardownPolicy,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::collections::HashSet;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

// ============================================================================
// Helpers
// ============================================================================

const HANG_TIMEOUT: Duration = Duration::from_secs(5);

fn setup_with(config: SteeringConfig) -> (Arc<MockDevice>, FlowSteering) {
    let device = Arc::new(MockDevice::new());
    let steering = FlowSteering::init(device.clone(), config).unwrap();
    (device, steering)
}

fn setup() -> (Arc<MockDevice>, FlowSteering) {
    setup_with(SteeringConfig::default())
}

fn dmac_criteria() -> MatchCriteria {
    let mut mask = MatchParam::zeroed();
    mask.outer_mut().dmac([0xff; 6]);
    MatchCriteria::new(MatchCriteriaEnable::OUTER_HEADERS, mask)
}

fn dmac(last: u8) -> MatchParam {
    let mut value = MatchParam::zeroed();
    value.outer_mut().dmac([0x02, 0, 0, 0, 0, last]);
    value
}

/// Criteria masking a single outer header byte; distinct bytes give
/// distinct masks.
fn byte_criteria(byte: usize) -> MatchCriteria {
    let mut mask = MatchParam::zeroed();
    mask.section_mut(MatchSection::OuterHeaders)[byte] = 0xff;
    MatchCriteria::new(MatchCriteriaEnable::OUTER_HEADERS, mask)
}

/// Entries of `table` below the star entries.
fn rule_entries(device: &MockDevice, table: &FlowTable) -> Vec<(u32, Vec<FlowDestination>)> {
    device
        .entries(table.id())
        .into_iter()
        .filter(|(index, _)| *index < table.max_entries())
        .map(|(index, entry)| (index, entry.destinations))
        .collect()
}

/// Destroys `table` on another thread and fails the test if it never
/// returns.
fn destroy_or_hang(table: &FlowTable) -> FsResult<()> {
    let table = table.clone();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(table.destroy());
    });
    rx.recv_timeout(HANG_TIMEOUT)
        .expect("table destroy did not return")
}

/// Three bypass tables in priorities 0, 1 and 2, chained in that order.
fn bypass_chain(steering: &FlowSteering) -> (FlowTable, FlowTable, FlowTable) {
    let bypass = steering.get_namespace(NamespaceType::Bypass).unwrap();
    let t0 = bypass.create_table(0, "t0", 4).unwrap();
    let t1 = bypass.create_table(1, "t1", 4).unwrap();
    let t2 = bypass.create_table(2, "t2", 4).unwrap();
    assert_eq!(t0.next_table_id().unwrap(), Some(t1.id()));
    assert_eq!(t1.next_table_id().unwrap(), Some(t2.id()));
    (t0, t1, t2)
}

/// Follows the star rules on the device from the root table.
fn device_chain(device: &MockDevice, table_type: FlowTableType) -> Vec<FlowTableId> {
    let mut chain = Vec::new();
    let mut current = device.root_table(table_type);
    while let Some(table) = current {
        chain.push(table);
        current = device.entries(table).into_iter().find_map(|(_, entry)| {
            entry.destinations.iter().find_map(|dest| match dest {
                FlowDestination::FlowTable(next) => Some(*next),
                _ => None,
            })
        });
    }
    chain
}

fn recorder() -> (Arc<Mutex<Vec<(String, bool)>>>, RuleEventFn) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let callback: RuleEventFn = Arc::new(
        move |rule: &FlowRule, flag: bool, _: Option<&ClientData>| -> FsResult<()> {
            sink.lock().push((rule.name(), flag));
            Ok(())
        },
    );
    (events, callback)
}

// ============================================================================
// Bring-up
// ============================================================================

#[test]
fn test_default_namespaces() {
    let (device, steering) = setup();

    let names: Vec<Option<String>> = NamespaceType::ALL
        .iter()
        .map(|t| steering.get_namespace(*t).map(|ns| ns.name()))
        .collect();
    assert_eq!(
        names,
        vec![
            Some("by_pass_ns".to_string()),
            Some("kernel_ns".to_string()),
            Some("leftover_ns".to_string()),
            Some("fdb_root".to_string()),
            Some("sniffer_rx_root".to_string()),
            Some("sniffer_tx_root".to_string()),
        ]
    );

    let bypass = steering.get_namespace(NamespaceType::Bypass).unwrap();
    assert_eq!(bypass.priorities().unwrap(), vec![0, 1, 2, 3, 4]);

    // priorities alone never touch the device
    assert!(device.commands().is_empty());
}

#[test]
fn test_priority_budgets_filled_bottom_up() {
    let (_device, steering) = setup();
    let dump = steering.dump().unwrap();
    let tree = &dump.root(FlowTableType::NicRx).unwrap().tree;

    let budget = |name: &str| match &tree.find(name).unwrap().details {
        NodeDetails::Priority { max_ft, .. } => *max_ft,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(budget("by_pass_prio"), 5);
    assert_eq!(budget("kernel_prio"), 2);
    assert_eq!(budget("leftovers_prio"), 1);
    assert_eq!(budget("prio-mcast"), 1);
}

#[test]
fn test_low_max_ft_level_skips_bypass() {
    let (_device, steering) = setup_with(SteeringConfig::new().with_max_ft_level(8));
    assert!(steering.get_namespace(NamespaceType::Bypass).is_none());

    let kernel = steering.get_namespace(NamespaceType::Kernel).unwrap();
    let table = kernel.create_table(0, "", 4).unwrap();
    assert_eq!(table.level(), 0);
    assert_eq!(table.name(), format!("flow_table_{}", table.id()));
    table.destroy().unwrap();
}

#[test]
fn test_no_nic_flow_table() {
    let (_device, steering) = setup_with(SteeringConfig::new().with_nic_flow_table(false));
    assert!(steering.get_namespace(NamespaceType::Kernel).is_none());
    assert!(steering.get_namespace(NamespaceType::Fdb).is_some());

    let (_, add) = recorder();
    let err = steering
        .register_rule_notifier(NamespaceType::Kernel, Some(add), None)
        .unwrap_err();
    assert!(matches!(err, FsError::InvalidArgument { .. }));
}

#[test]
fn test_dummy_root_without_modify_root() {
    let (device, mut steering) = setup_with(SteeringConfig::new().with_modify_root(false));

    let bypass = steering.get_namespace(NamespaceType::Bypass).unwrap();
    let table = bypass.create_table(0, "b0", 4).unwrap();
    // the dummy priority takes level 0
    assert_eq!(table.level(), 1);

    let dump = steering.dump().unwrap();
    let tree = &dump.root(FlowTableType::NicRx).unwrap().tree;
    match &tree.find("ft_dummy").unwrap().details {
        NodeDetails::Table {
            level, star_target, ..
        } => {
            assert_eq!(*level, 0);
            assert_eq!(star_target.as_deref(), Some("b0"));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(device
        .commands()
        .iter()
        .all(|c| c.kind() != CommandKind::UpdateRoot));

    table.destroy().unwrap();
    steering.cleanup().unwrap();
    assert_eq!(device.table_count(), 0);
}

#[test]
fn test_failed_bring_up_cleans_up() {
    let device = Arc::new(MockDevice::new());
    device.fail_next(CommandKind::CreateTable, CmdStatus::NoResources);
    let err = FlowSteering::init(device.clone(), SteeringConfig::new().with_modify_root(false))
        .unwrap_err();
    assert!(matches!(err, FsError::Device(_)));
    assert_eq!(device.table_count(), 0);
}

#[test]
fn test_custom_template() {
    let template = RootTemplate::from_yaml_str(
        "children:\n  - type: priority\n    name: p0\n    children:\n      - type: namespace\n        name: only_ns\n        children:\n          - type: priority\n            name: leaf\n            max_ft: 3\n",
    )
    .unwrap();
    let device = Arc::new(MockDevice::new());
    let steering =
        FlowSteering::init_with_template(device.clone(), SteeringConfig::default(), &template)
            .unwrap();

    let ns = steering.get_namespace(NamespaceType::Bypass).unwrap();
    assert_eq!(ns.name(), "only_ns");
    assert!(steering.get_namespace(NamespaceType::Kernel).is_none());

    let tables: Vec<FlowTable> = (0..3)
        .map(|i| ns.create_table(0, &format!("t{}", i), 1).unwrap())
        .collect();
    let levels: Vec<u32> = tables.iter().map(|t| t.level()).collect();
    assert_eq!(levels, vec![0, 1, 2]);

    let err = ns.create_table(0, "t3", 1).unwrap_err();
    assert!(matches!(err, FsError::NoSpace { .. }));

    for table in tables.iter().rev() {
        table.destroy().unwrap();
    }
}

// ============================================================================
// Chain
// ============================================================================

#[test]
fn test_chain_follows_levels() {
    let (device, steering) = setup();
    let bypass = steering.get_namespace(NamespaceType::Bypass).unwrap();
    let kernel = steering.get_namespace(NamespaceType::Kernel).unwrap();
    let leftovers = steering.get_namespace(NamespaceType::Leftovers).unwrap();

    let k1 = kernel.create_table(0, "k1", 4).unwrap();
    let left = leftovers.create_table(0, "left", 4).unwrap();
    let b2 = bypass.create_table(2, "b2", 4).unwrap();
    let b0 = bypass.create_table(0, "b0", 4).unwrap();

    let levels: Vec<u32> = [&b0, &b2, &k1, &left].iter().map(|t| t.level()).collect();
    assert_eq!(levels, vec![0, 2, 5, 7]);

    assert_eq!(device.root_table(FlowTableType::NicRx), Some(b0.id()));
    assert_eq!(
        device_chain(&device, FlowTableType::NicRx),
        vec![b0.id(), b2.id(), k1.id(), left.id()]
    );
    assert_eq!(b0.next_table_id().unwrap(), Some(b2.id()));
    assert_eq!(left.next_table_id().unwrap(), None);

    // a second kernel table falls through to the same place as the first
    let k2 = kernel.create_table(0, "k2", 4).unwrap();
    assert_eq!(k2.level(), 6);
    assert_eq!(k2.next_table_id().unwrap(), Some(left.id()));
    assert_eq!(k1.next_table_id().unwrap(), Some(left.id()));

    // LIFO within the kernel priority
    k2.destroy().unwrap();
    k1.destroy().unwrap();
    assert_eq!(b2.next_table_id().unwrap(), Some(left.id()));
    assert_eq!(
        device_chain(&device, FlowTableType::NicRx),
        vec![b0.id(), b2.id(), left.id()]
    );

    b0.destroy().unwrap();
    assert_eq!(device.root_table(FlowTableType::NicRx), Some(b2.id()));
    assert_eq!(
        device_chain(&device, FlowTableType::NicRx),
        vec![b2.id(), left.id()]
    );

    left.destroy().unwrap();
    b2.destroy().unwrap();
    assert!(!b2.is_live());
    assert_eq!(device.table_count(), 0);
}

#[test]
fn test_star_rule_make_before_break() {
    let (device, steering) = setup();
    let bypass = steering.get_namespace(NamespaceType::Bypass).unwrap();
    let kernel = steering.get_namespace(NamespaceType::Kernel).unwrap();
    let leftovers = steering.get_namespace(NamespaceType::Leftovers).unwrap();

    let b2 = bypass.create_table(2, "b2", 4).unwrap();
    let left = leftovers.create_table(0, "left", 4).unwrap();
    assert_eq!(b2.next_table_id().unwrap(), Some(left.id()));

    device.clear_commands();
    let k1 = kernel.create_table(0, "k1", 4).unwrap();

    let b2_commands: Vec<DeviceCommand> = device
        .commands()
        .into_iter()
        .filter(|cmd| match cmd {
            DeviceCommand::SetEntry { table, .. } | DeviceCommand::DeleteEntry { table, .. } => {
                *table == b2.id()
            }
            _ => false,
        })
        .collect();
    match b2_commands.as_slice() {
        [DeviceCommand::SetEntry {
            index: new_index,
            destinations,
            ..
        }, DeviceCommand::DeleteEntry {
            index: old_index, ..
        }] => {
            assert_eq!(destinations, &vec![FlowDestination::FlowTable(k1.id())]);
            assert_ne!(new_index, old_index);
        }
        other => panic!("unexpected star rule commands {:?}", other),
    }
    assert_eq!(b2.next_table_id().unwrap(), Some(k1.id()));
    assert_eq!(k1.next_table_id().unwrap(), Some(left.id()));

    k1.destroy().unwrap();
    left.destroy().unwrap();
    b2.destroy().unwrap();
}

#[test]
fn test_destroy_not_last_is_denied() {
    let (device, steering) = setup();
    let kernel = steering.get_namespace(NamespaceType::Kernel).unwrap();
    let leftovers = steering.get_namespace(NamespaceType::Leftovers).unwrap();

    let k1 = kernel.create_table(0, "k1", 4).unwrap();
    let k2 = kernel.create_table(0, "k2", 4).unwrap();
    let left = leftovers.create_table(0, "left", 4).unwrap();
    let group = k1
        .create_group(&FlowGroupConfig::new(0, 1, dmac_criteria()))
        .unwrap();
    let rule = group
        .add_rule(&FlowSpec::new(dmac(1)), FlowDestination::Tir(1))
        .unwrap();

    let before = device.commands().len();
    let err = k1.destroy().unwrap_err();
    assert!(matches!(err, FsError::PermissionDenied { .. }));
    assert_eq!(err.errno(), 1);

    assert_eq!(device.commands().len(), before);
    assert!(k1.is_live() && group.is_live() && rule.is_live());
    assert_eq!(k1.next_table_id().unwrap(), Some(left.id()));
    assert_eq!(device.root_table(FlowTableType::NicRx), Some(k1.id()));

    rule.delete().unwrap();
    group.destroy().unwrap();
    k2.destroy().unwrap();
    k1.destroy().unwrap();
    left.destroy().unwrap();
}

#[test]
fn test_destroy_busy_table() {
    let (_device, steering) = setup();
    let kernel = steering.get_namespace(NamespaceType::Kernel).unwrap();
    let table = kernel.create_table(0, "k", 4).unwrap();
    let group = table
        .create_group(&FlowGroupConfig::new(0, 3, dmac_criteria()))
        .unwrap();

    let err = table.destroy().unwrap_err();
    assert!(matches!(err, FsError::Busy { .. }));
    assert!(table.is_live());

    group.destroy().unwrap();
    table.destroy().unwrap();
    assert!(matches!(table.destroy().unwrap_err(), FsError::NotFound { .. }));
}

#[test]
fn test_create_table_unwinds() {
    let (device, steering) = setup();
    let kernel = steering.get_namespace(NamespaceType::Kernel).unwrap();
    let leftovers = steering.get_namespace(NamespaceType::Leftovers).unwrap();

    device.fail_next(CommandKind::CreateGroup, CmdStatus::NoResources);
    assert!(matches!(
        kernel.create_table(0, "k", 4).unwrap_err(),
        FsError::Device(_)
    ));
    assert_eq!(device.table_count(), 0);

    device.fail_next(CommandKind::UpdateRoot, CmdStatus::BadParameter);
    assert!(kernel.create_table(0, "k", 4).is_err());
    assert_eq!(device.table_count(), 0);
    assert_eq!(device.root_table(FlowTableType::NicRx), None);

    let k = kernel.create_table(0, "k", 4).unwrap();
    // connecting the kernel table to the new one fails
    device.fail_next(CommandKind::SetEntry, CmdStatus::NoResources);
    assert!(leftovers.create_table(0, "left", 4).is_err());
    assert_eq!(device.table_count(), 1);
    assert_eq!(k.next_table_id().unwrap(), None);

    // nothing left behind blocks a retry
    let left = leftovers.create_table(0, "left", 4).unwrap();
    assert_eq!(k.next_table_id().unwrap(), Some(left.id()));
    left.destroy().unwrap();
    k.destroy().unwrap();
}

#[test]
fn test_shared_priority_reuses_table() {
    let template = RootTemplate {
        children: vec![InitNode::priority(
            "p0",
            0,
            vec![InitNode::namespace(
                "shared_ns",
                vec![InitNode::table_priority("shared", 1).shared()],
            )],
        )],
    };
    let device = Arc::new(MockDevice::new());
    let steering =
        FlowSteering::init_with_template(device.clone(), SteeringConfig::default(), &template)
            .unwrap();
    let ns = steering.get_namespace(NamespaceType::Bypass).unwrap();

    let first = ns.create_auto_grouped_table(0, "a", 4, 1).unwrap();
    let second = ns.create_auto_grouped_table(0, "b", 4, 1).unwrap();
    assert_eq!(first.id(), second.id());
    assert_eq!(second.name(), "a");
    assert_eq!(first.shared_refcount().unwrap(), 2);
    assert_eq!(device.table_count(), 1);

    second.destroy().unwrap();
    assert!(first.is_live());
    assert_eq!(first.shared_refcount().unwrap(), 1);

    first.destroy().unwrap();
    assert!(!first.is_live());
    assert_eq!(device.table_count(), 0);
}

// ============================================================================
// Groups and rules
// ============================================================================

#[test]
fn test_concrete_scenario() {
    let (device, steering) = setup();
    let kernel = steering.get_namespace(NamespaceType::Kernel).unwrap();
    let table = kernel.create_table(0, "scenario", 4).unwrap();
    let group = table
        .create_group(&FlowGroupConfig::new(0, 3, dmac_criteria()))
        .unwrap();
    let spec = FlowSpec::new(dmac(0x10)).with_flow_tag(1);

    let a = table
        .add_rule(&dmac_criteria(), &spec, FlowDestination::Tir(1))
        .unwrap();
    let b = table
        .add_rule(&dmac_criteria(), &spec, FlowDestination::Tir(2))
        .unwrap();
    assert_eq!(group.num_entries().unwrap(), 1);
    assert_eq!(
        rule_entries(&device, &table),
        vec![(1, vec![FlowDestination::Tir(1), FlowDestination::Tir(2)])]
    );
    assert_eq!(a.index().unwrap(), b.index().unwrap());

    a.delete().unwrap();
    assert!(!a.is_live());
    assert_eq!(group.num_entries().unwrap(), 1);
    assert_eq!(
        rule_entries(&device, &table),
        vec![(0, vec![FlowDestination::Tir(2)])]
    );
    assert_eq!(b.index().unwrap(), 0);
    assert_eq!(b.flow_tag().unwrap(), 1);

    b.delete().unwrap();
    assert_eq!(group.num_entries().unwrap(), 0);
    assert!(rule_entries(&device, &table).is_empty());

    group.destroy().unwrap();
    table.destroy().unwrap();
}

#[test]
fn test_freed_index_is_reused() {
    let (device, steering) = setup();
    let kernel = steering.get_namespace(NamespaceType::Kernel).unwrap();
    let table = kernel.create_table(0, "k", 4).unwrap();
    let group = table
        .create_group(&FlowGroupConfig::new(0, 3, dmac_criteria()))
        .unwrap();

    let rules: Vec<FlowRule> = (1..=3)
        .map(|i| {
            group
                .add_rule(&FlowSpec::new(dmac(i)), FlowDestination::Tir(u32::from(i)))
                .unwrap()
        })
        .collect();
    let indices: Vec<u32> = rules.iter().map(|r| r.index().unwrap()).collect();
    assert_eq!(indices, vec![0, 1, 2]);

    rules[1].delete().unwrap();
    assert!(device.entry(table.id(), 1).is_none());

    let reused = group
        .add_rule(&FlowSpec::new(dmac(9)), FlowDestination::Tir(9))
        .unwrap();
    assert_eq!(reused.index().unwrap(), 1);
    assert_eq!(reused.name(), "dest_tir_9");
    assert_eq!(reused.match_value().unwrap(), dmac(9));
    assert_eq!(reused.match_criteria().unwrap(), dmac_criteria());

    for rule in [&rules[0], &rules[2], &reused] {
        rule.delete().unwrap();
    }
    group.destroy().unwrap();
    table.destroy().unwrap();
}

#[test]
fn test_different_action_is_a_new_entry() {
    let (device, steering) = setup();
    let kernel = steering.get_namespace(NamespaceType::Kernel).unwrap();
    let table = kernel.create_auto_grouped_table(0, "k", 6, 2).unwrap();

    let forward = table
        .add_rule(&dmac_criteria(), &FlowSpec::new(dmac(1)), FlowDestination::Tir(1))
        .unwrap();
    let counted = table
        .add_rule(
            &dmac_criteria(),
            &FlowSpec::new(dmac(1)).with_action(FlowAction::FWD_DEST | FlowAction::COUNT),
            FlowDestination::Tir(1),
        )
        .unwrap();
    assert_eq!(forward.group_id().unwrap(), counted.group_id().unwrap());
    assert_ne!(forward.index().unwrap(), counted.index().unwrap());
    assert_eq!(rule_entries(&device, &table).len(), 2);

    forward.delete().unwrap();
    counted.delete().unwrap();
    table.destroy().unwrap();
}

#[test]
fn test_explicit_group_errors() {
    let (_device, steering) = setup();
    let kernel = steering.get_namespace(NamespaceType::Kernel).unwrap();
    let table = kernel.create_table(0, "k", 4).unwrap();
    assert_eq!(table.max_entries(), 6);

    let err = table
        .add_rule(&dmac_criteria(), &FlowSpec::new(dmac(1)), FlowDestination::Tir(1))
        .unwrap_err();
    assert!(matches!(err, FsError::ExplicitGroupRequired { .. }));
    assert_eq!(err.errno(), 22);

    assert!(matches!(
        table
            .create_group(&FlowGroupConfig::new(3, 2, dmac_criteria()))
            .unwrap_err(),
        FsError::InvalidArgument { .. }
    ));
    assert!(matches!(
        table
            .create_group(&FlowGroupConfig::new(4, 6, dmac_criteria()))
            .unwrap_err(),
        FsError::InvalidArgument { .. }
    ));

    let group = table
        .create_group(&FlowGroupConfig::new(0, 1, dmac_criteria()))
        .unwrap();
    assert!(matches!(
        table
            .create_group(&FlowGroupConfig::new(1, 2, byte_criteria(6)))
            .unwrap_err(),
        FsError::InvalidArgument { .. }
    ));

    let a = group
        .add_rule(&FlowSpec::new(dmac(1)), FlowDestination::Tir(1))
        .unwrap();
    let b = group
        .add_rule(&FlowSpec::new(dmac(2)), FlowDestination::Tir(2))
        .unwrap();

    // full: neither a new entry nor a relocation fits
    let err = table
        .add_rule(&dmac_criteria(), &FlowSpec::new(dmac(3)), FlowDestination::Tir(3))
        .unwrap_err();
    assert!(err.is_no_space());
    let err = group
        .add_rule(&FlowSpec::new(dmac(1)), FlowDestination::Tir(4))
        .unwrap_err();
    assert!(matches!(err, FsError::EntryFull { .. }));
    assert_eq!(err.errno(), 28);
    assert_eq!(a.index().unwrap(), 0);

    assert!(matches!(group.destroy().unwrap_err(), FsError::Busy { .. }));

    a.delete().unwrap();
    b.delete().unwrap();
    assert!(matches!(a.delete().unwrap_err(), FsError::NotFound { .. }));
    group.destroy().unwrap();
    assert!(!group.is_live());
    table.destroy().unwrap();
}

#[test]
fn test_fdb_group_keeps_slack() {
    let (device, steering) = setup();
    let fdb = steering.get_namespace(NamespaceType::Fdb).unwrap();
    let table = fdb.create_table(0, "fdb", 4).unwrap();
    assert_eq!(table.table_type(), FlowTableType::Fdb);
    let group = table
        .create_group(&FlowGroupConfig::new(0, 2, dmac_criteria()))
        .unwrap();

    let a = group
        .add_rule(&FlowSpec::new(dmac(1)), FlowDestination::Vport(1))
        .unwrap();
    let b = group
        .add_rule(&FlowSpec::new(dmac(2)), FlowDestination::Vport(2))
        .unwrap();
    assert!(group
        .add_rule(&FlowSpec::new(dmac(3)), FlowDestination::Vport(3))
        .unwrap_err()
        .is_no_space());

    // the reserved index still lets an entry be rewritten
    let merged = group
        .add_rule(&FlowSpec::new(dmac(1)), FlowDestination::Vport(4))
        .unwrap();
    assert_eq!(merged.index().unwrap(), 2);
    assert_eq!(a.index().unwrap(), 2);
    assert_eq!(
        rule_entries(&device, &table),
        vec![
            (1, vec![FlowDestination::Vport(2)]),
            (2, vec![FlowDestination::Vport(1), FlowDestination::Vport(4)]),
        ]
    );

    for rule in [&a, &b, &merged] {
        rule.delete().unwrap();
    }
    group.destroy().unwrap();
    table.destroy().unwrap();
}

#[test]
fn test_autogroup_ranges() {
    let (device, steering) = setup();
    let kernel = steering.get_namespace(NamespaceType::Kernel).unwrap();
    let table = kernel.create_auto_grouped_table(0, "auto", 6, 2).unwrap();
    assert!(table.is_auto_grouped().unwrap());
    assert_eq!(table.max_entries(), 6);

    let err = table
        .create_group(&FlowGroupConfig::new(0, 1, dmac_criteria()))
        .unwrap_err();
    assert!(matches!(err, FsError::PermissionDenied { .. }));

    let mut rules = Vec::new();
    let mut ranges = Vec::new();
    for byte in 0..4 {
        let rule = table
            .add_rule(
                &byte_criteria(byte),
                &FlowSpec::new(MatchParam::zeroed()),
                FlowDestination::Tir(1),
            )
            .unwrap();
        ranges.push(
            device
                .group_range(table.id(), rule.group_id().unwrap())
                .unwrap(),
        );
        rules.push(rule);
    }
    // two even groups, then single-entry groups once the budget is spent
    assert_eq!(ranges, vec![(0, 1), (2, 3), (4, 4), (5, 5)]);

    // an existing mask reuses its group
    let again = table
        .add_rule(&byte_criteria(0), &FlowSpec::new(dmac(1)), FlowDestination::Tir(1))
        .unwrap();
    assert_eq!(again.group_id().unwrap(), rules[0].group_id().unwrap());
    assert_eq!(again.index().unwrap(), 1);

    let err = table
        .add_rule(&byte_criteria(9), &FlowSpec::default(), FlowDestination::Tir(1))
        .unwrap_err();
    assert!(err.is_no_space());

    // the autogroup goes with its last entry and its range frees up
    rules[1].delete().unwrap();
    let refill = table
        .add_rule(&byte_criteria(9), &FlowSpec::default(), FlowDestination::Tir(1))
        .unwrap();
    assert_eq!(
        device.group_range(table.id(), refill.group_id().unwrap()),
        Some((2, 2))
    );

    let groups_before = table.groups().unwrap().len();
    for rule in rules.iter().filter(|r| r.is_live()).chain([&again, &refill]) {
        rule.delete().unwrap();
    }
    assert_eq!(groups_before, 4);
    assert!(table.groups().unwrap().is_empty());
    // only the star group is left
    assert_eq!(device.group_count(table.id()), 1);
    table.destroy().unwrap();
}

#[test]
fn test_failed_add_drops_new_autogroup() {
    let (device, steering) = setup();
    let kernel = steering.get_namespace(NamespaceType::Kernel).unwrap();
    let table = kernel.create_auto_grouped_table(0, "auto", 6, 2).unwrap();

    device.fail_next(CommandKind::SetEntry, CmdStatus::BadParameter);
    let err = table
        .add_rule(&dmac_criteria(), &FlowSpec::new(dmac(1)), FlowDestination::Tir(1))
        .unwrap_err();
    assert!(matches!(err, FsError::Device(_)));
    assert!(table.groups().unwrap().is_empty());
    assert_eq!(device.group_count(table.id()), 1);
    table.destroy().unwrap();
}

#[test]
fn test_merge_into_full_autogroup_is_refused() {
    let (device, steering) = setup();
    let kernel = steering.get_namespace(NamespaceType::Kernel).unwrap();
    // six entries over five groups: one entry per group
    let table = kernel.create_auto_grouped_table(0, "t", 4, 5).unwrap();
    let spec = FlowSpec::new(dmac(1)).with_flow_tag(1);

    let a = table
        .add_rule(&dmac_criteria(), &spec, FlowDestination::Tir(1))
        .unwrap();
    let err = table
        .add_rule(&dmac_criteria(), &spec, FlowDestination::Tir(2))
        .unwrap_err();
    assert!(matches!(err, FsError::EntryFull { .. }));

    // no second group with the same match
    assert_eq!(table.groups().unwrap().len(), 1);
    assert_eq!(
        rule_entries(&device, &table),
        vec![(0, vec![FlowDestination::Tir(1)])]
    );
    assert_eq!(a.index().unwrap(), 0);

    // a different match still gets its own group
    let other = table
        .add_rule(&dmac_criteria(), &FlowSpec::new(dmac(2)), FlowDestination::Tir(2))
        .unwrap();
    assert_ne!(other.group_id().unwrap(), a.group_id().unwrap());

    a.delete().unwrap();
    other.delete().unwrap();
    table.destroy().unwrap();
}

#[test]
fn test_failed_reconnect_on_destroy_completes() {
    let (device, steering) = setup();
    let (t0, t1, t2) = bypass_chain(&steering);

    device.fail_next(CommandKind::SetEntry, CmdStatus::BadResource);
    destroy_or_hang(&t1).unwrap();
    assert!(!t1.is_live());

    // t0 could not be pointed at t2, so it falls through to nothing
    assert_eq!(t0.next_table_id().unwrap(), None);
    assert!(device
        .entries(t0.id())
        .iter()
        .all(|(_, entry)| entry.destinations != vec![FlowDestination::FlowTable(t1.id())]));
    assert_eq!(device_chain(&device, FlowTableType::NicRx), vec![t0.id()]);

    // the chain lock was released and a new table repairs the chain
    let bypass = steering.get_namespace(NamespaceType::Bypass).unwrap();
    let again = bypass.create_table(1, "t1", 4).unwrap();
    assert_eq!(
        device_chain(&device, FlowTableType::NicRx),
        vec![t0.id(), again.id(), t2.id()]
    );

    for table in [&t2, &again, &t0] {
        destroy_or_hang(table).unwrap();
    }
    assert_eq!(device.table_count(), 0);
}

#[test]
fn test_failed_reconnect_on_destroy_strict() {
    let config = SteeringConfig::new().with_teardown_policy(TeardownPolicy::Strict);
    let (device, steering) = setup_with(config);
    let (t0, t1, t2) = bypass_chain(&steering);

    device.fail_next(CommandKind::SetEntry, CmdStatus::BadResource);
    let err = destroy_or_hang(&t1).unwrap_err();
    assert!(matches!(err, FsError::Device(_)));
    assert!(!t1.is_live());
    assert_eq!(t0.next_table_id().unwrap(), None);

    destroy_or_hang(&t2).unwrap();
    destroy_or_hang(&t0).unwrap();
    assert_eq!(device.table_count(), 0);
}

#[test]
fn test_stale_star_rule_is_cleared_before_reuse() {
    let (device, steering) = setup();
    let (t0, t1, t2) = bypass_chain(&steering);

    // retargeting t0 fails and so does deleting its old star entry
    device.fail_next(CommandKind::SetEntry, CmdStatus::BadResource);
    device.fail_next(CommandKind::DeleteEntry, CmdStatus::InternalError);
    t1.destroy().unwrap();
    assert_eq!(t0.next_table_id().unwrap(), None);

    // the leftover device entry is removed before t0 is pointed anywhere
    let bypass = steering.get_namespace(NamespaceType::Bypass).unwrap();
    let again = bypass.create_table(1, "t1", 4).unwrap();
    assert_eq!(t0.next_table_id().unwrap(), Some(again.id()));
    let star_entries: Vec<Vec<FlowDestination>> = device
        .entries(t0.id())
        .into_iter()
        .map(|(_, entry)| entry.destinations)
        .collect();
    assert_eq!(
        star_entries,
        vec![vec![FlowDestination::FlowTable(again.id())]]
    );

    for table in [&t2, &again, &t0] {
        table.destroy().unwrap();
    }
}

#[test]
fn test_failed_relocation_on_delete() {
    let (device, steering) = setup();
    let kernel = steering.get_namespace(NamespaceType::Kernel).unwrap();
    let table = kernel.create_table(0, "k", 4).unwrap();
    let group = table
        .create_group(&FlowGroupConfig::new(0, 3, dmac_criteria()))
        .unwrap();
    let spec = FlowSpec::new(dmac(1));
    let a = group.add_rule(&spec, FlowDestination::Tir(1)).unwrap();
    let b = group.add_rule(&spec, FlowDestination::Tir(2)).unwrap();
    assert_eq!(b.index().unwrap(), 1);

    device.fail_next(CommandKind::SetEntry, CmdStatus::BadParameter);
    a.delete().unwrap();
    assert!(!a.is_live());
    // the entry stays where the device still has it
    assert_eq!(b.index().unwrap(), 1);
    assert_eq!(group.num_entries().unwrap(), 1);

    b.delete().unwrap();
    assert!(rule_entries(&device, &table).is_empty());
    group.destroy().unwrap();
    table.destroy().unwrap();
}

#[test]
fn test_delete_in_full_group_keeps_index() {
    let config = SteeringConfig::new().with_teardown_policy(TeardownPolicy::Strict);
    let (device, steering) = setup_with(config);
    let kernel = steering.get_namespace(NamespaceType::Kernel).unwrap();
    let table = kernel.create_table(0, "k", 4).unwrap();
    let group = table
        .create_group(&FlowGroupConfig::new(0, 1, dmac_criteria()))
        .unwrap();

    let x1 = group
        .add_rule(&FlowSpec::new(dmac(1)), FlowDestination::Tir(1))
        .unwrap();
    let x2 = group
        .add_rule(&FlowSpec::new(dmac(1)), FlowDestination::Tir(2))
        .unwrap();
    let y = group
        .add_rule(&FlowSpec::new(dmac(2)), FlowDestination::Tir(3))
        .unwrap();
    assert_eq!((x2.index().unwrap(), y.index().unwrap()), (1, 0));

    // no free index to rewrite x into
    let err = x1.delete().unwrap_err();
    assert!(matches!(err, FsError::EntryFull { .. }));
    assert!(!x1.is_live());
    assert_eq!(x2.index().unwrap(), 1);

    for rule in [&x2, &y] {
        rule.delete().unwrap();
    }
    assert!(rule_entries(&device, &table).is_empty());
    group.destroy().unwrap();
    table.destroy().unwrap();
}

#[test]
fn test_strict_teardown_reports_failure() {
    let config = SteeringConfig::new().with_teardown_policy(TeardownPolicy::Strict);
    let (device, steering) = setup_with(config);
    let kernel = steering.get_namespace(NamespaceType::Kernel).unwrap();
    let table = kernel.create_auto_grouped_table(0, "auto", 6, 2).unwrap();
    let rule = table
        .add_rule(&dmac_criteria(), &FlowSpec::new(dmac(1)), FlowDestination::Tir(1))
        .unwrap();

    device.fail_next(CommandKind::DeleteEntry, CmdStatus::InternalError);
    assert!(matches!(rule.delete().unwrap_err(), FsError::Device(_)));
    // the tree is torn down regardless
    assert!(!rule.is_live());
    assert!(table.groups().unwrap().is_empty());
}

#[test]
fn test_best_effort_teardown_hides_failure() {
    let (device, steering) = setup();
    let kernel = steering.get_namespace(NamespaceType::Kernel).unwrap();
    let table = kernel.create_auto_grouped_table(0, "auto", 6, 2).unwrap();
    let rule = table
        .add_rule(&dmac_criteria(), &FlowSpec::new(dmac(1)), FlowDestination::Tir(1))
        .unwrap();

    device.fail_next(CommandKind::DeleteEntry, CmdStatus::InternalError);
    rule.delete().unwrap();
    assert!(!rule.is_live());
}

// ============================================================================
// Notifiers
// ============================================================================

#[test]
fn test_notifier_events_and_private_data() {
    let (_device, steering) = setup();
    let kernel = steering.get_namespace(NamespaceType::Kernel).unwrap();

    let (adds, add) = recorder();
    let deletes: Arc<Mutex<Vec<(bool, Option<u32>)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&deletes);
    let del: RuleEventFn = Arc::new(
        move |_: &FlowRule, ctx_changed: bool, data: Option<&ClientData>| -> FsResult<()> {
            let value = data.and_then(|d| (**d).downcast_ref::<u32>().copied());
            sink.lock().push((ctx_changed, value));
            Ok(())
        },
    );
    let notifier = steering
        .register_rule_notifier(NamespaceType::Kernel, Some(add), Some(del))
        .unwrap();
    assert_eq!(notifier.namespace().name(), "kernel_ns");

    let table = kernel.create_auto_grouped_table(0, "auto", 6, 2).unwrap();
    let first = table
        .add_rule(&dmac_criteria(), &FlowSpec::new(dmac(1)), FlowDestination::Tir(1))
        .unwrap();
    let second = table
        .add_rule(&dmac_criteria(), &FlowSpec::new(dmac(1)), FlowDestination::Tir(2))
        .unwrap();
    assert_eq!(
        *adds.lock(),
        vec![
            ("dest_tir_1".to_string(), true),
            ("dest_tir_2".to_string(), false)
        ]
    );

    first.set_private_data(&notifier, Arc::new(7u32)).unwrap();
    first.set_private_data(&notifier, Arc::new(8u32)).unwrap();
    let data = first.private_data(&notifier).unwrap();
    assert_eq!(data.downcast_ref::<u32>(), Some(&8));
    assert!(second.private_data(&notifier).is_none());

    first.delete().unwrap();
    second.delete().unwrap();
    assert_eq!(*deletes.lock(), vec![(false, Some(8)), (true, None)]);

    notifier.unregister().unwrap();
    let third = table
        .add_rule(&dmac_criteria(), &FlowSpec::new(dmac(2)), FlowDestination::Tir(3))
        .unwrap();
    assert_eq!(adds.lock().len(), 2);
    third.delete().unwrap();
    table.destroy().unwrap();
}

#[test]
fn test_add_callback_error_stops_delivery() {
    let (_device, steering) = setup();
    let kernel = steering.get_namespace(NamespaceType::Kernel).unwrap();

    let failing: RuleEventFn =
        Arc::new(|_: &FlowRule, _: bool, _: Option<&ClientData>| -> FsResult<()> {
            Err(FsError::notifier("refused"))
        });
    let (later, add) = recorder();
    let _first = kernel.register_rule_notifier(Some(failing), None).unwrap();
    let _second = kernel.register_rule_notifier(Some(add), None).unwrap();

    let table = kernel.create_auto_grouped_table(0, "auto", 6, 2).unwrap();
    let rule = table
        .add_rule(&dmac_criteria(), &FlowSpec::new(dmac(1)), FlowDestination::Tir(1))
        .unwrap();
    assert!(rule.is_live());
    assert!(later.lock().is_empty());

    rule.delete().unwrap();
    table.destroy().unwrap();
}

#[test]
fn test_nearest_namespace_with_handlers() {
    let (_device, steering) = setup();
    let root = steering.root_namespace(FlowTableType::NicRx).unwrap();
    let kernel = steering.get_namespace(NamespaceType::Kernel).unwrap();
    let bypass = steering.get_namespace(NamespaceType::Bypass).unwrap();

    let (root_events, root_add) = recorder();
    let (kernel_events, kernel_add) = recorder();
    let _root = root.register_rule_notifier(Some(root_add), None).unwrap();
    let _kernel = kernel.register_rule_notifier(Some(kernel_add), None).unwrap();

    let k = kernel.create_auto_grouped_table(0, "k", 6, 1).unwrap();
    let b = bypass.create_auto_grouped_table(0, "b", 6, 1).unwrap();
    let in_kernel = k
        .add_rule(&dmac_criteria(), &FlowSpec::new(dmac(1)), FlowDestination::Tir(1))
        .unwrap();
    let in_bypass = b
        .add_rule(&dmac_criteria(), &FlowSpec::new(dmac(1)), FlowDestination::Tir(2))
        .unwrap();

    assert_eq!(*kernel_events.lock(), vec![("dest_tir_1".to_string(), true)]);
    assert_eq!(*root_events.lock(), vec![("dest_tir_2".to_string(), true)]);

    in_kernel.delete().unwrap();
    in_bypass.delete().unwrap();
    b.destroy().unwrap();
    k.destroy().unwrap();
}

#[test]
fn test_iterate_existing_rules() {
    let (_device, steering) = setup();
    let root = steering.root_namespace(FlowTableType::NicRx).unwrap();
    let kernel = steering.get_namespace(NamespaceType::Kernel).unwrap();
    let bypass = steering.get_namespace(NamespaceType::Bypass).unwrap();

    let k = kernel.create_auto_grouped_table(0, "k", 14, 2).unwrap();
    let b = bypass.create_auto_grouped_table(1, "b", 14, 2).unwrap();
    let mut rules = Vec::new();
    for i in 0..3u8 {
        rules.push(
            k.add_rule(&dmac_criteria(), &FlowSpec::new(dmac(i)), FlowDestination::Tir(1))
                .unwrap(),
        );
    }
    rules.push(
        k.add_rule(&dmac_criteria(), &FlowSpec::new(dmac(0)), FlowDestination::Tir(2))
            .unwrap(),
    );
    rules.push(
        b.add_rule(&byte_criteria(6), &FlowSpec::default(), FlowDestination::Tir(3))
            .unwrap(),
    );

    let mut seen = Vec::new();
    let mut firsts = 0;
    root.iterate_existing_rules(|rule, is_new| {
        assert!(rule.is_live());
        seen.push((rule.table_id()?, rule.index()?, rule.destination()));
        firsts += usize::from(is_new);
        Ok(())
    })
    .unwrap();
    assert_eq!(seen.len(), rules.len());
    assert_eq!(seen.iter().collect::<HashSet<_>>().len(), rules.len());
    assert_eq!(firsts, 4);

    let mut kernel_only = 0;
    kernel
        .iterate_existing_rules(|_, _| {
            kernel_only += 1;
            Ok(())
        })
        .unwrap();
    assert_eq!(kernel_only, 4);

    let err = root
        .iterate_existing_rules(|_, _| Err(FsError::notifier("stop")))
        .unwrap_err();
    assert!(matches!(err, FsError::Notifier { .. }));

    for rule in &rules {
        rule.delete().unwrap();
    }
    b.destroy().unwrap();
    k.destroy().unwrap();
}

// ============================================================================
// Cleanup, dump and concurrency
// ============================================================================

#[test]
fn test_cleanup_leaves_owned_tables() {
    let (device, mut steering) = setup();
    let kernel = steering.get_namespace(NamespaceType::Kernel).unwrap();
    let table = kernel.create_table(0, "k", 4).unwrap();

    steering.cleanup().unwrap();
    assert!(table.is_live());
    assert!(steering.get_namespace(NamespaceType::Kernel).is_none());

    table.destroy().unwrap();
    assert_eq!(device.table_count(), 0);
}

#[test]
fn test_dump_serializes() {
    let (_device, steering) = setup();
    let kernel = steering.get_namespace(NamespaceType::Kernel).unwrap();
    let table = kernel.create_auto_grouped_table(0, "k", 6, 2).unwrap();
    let rule = table
        .add_rule(&dmac_criteria(), &FlowSpec::new(dmac(1)), FlowDestination::Tir(4))
        .unwrap();

    let dump = steering.dump().unwrap();
    assert_eq!(dump.roots.len(), 4);
    let nic = dump.root(FlowTableType::NicRx).unwrap();
    assert_eq!(nic.root_table.as_deref(), Some("k"));
    assert_eq!(nic.tree.count(NodeType::Table), 1);
    assert_eq!(nic.tree.count(NodeType::Rule), 1);
    let entry = nic.tree.find("fte_0").unwrap();
    assert_eq!(entry.users, 1);

    let json = serde_json::to_value(&dump).unwrap();
    assert_eq!(json["roots"][0]["tree"]["name"], "root");
    assert!(serde_yaml::to_string(&dump).unwrap().contains("dest_tir_4"));

    rule.delete().unwrap();
    table.destroy().unwrap();
}

#[test]
fn test_concurrent_rule_churn() {
    let (device, steering) = setup();
    let kernel = steering.get_namespace(NamespaceType::Kernel).unwrap();
    let table = kernel.create_auto_grouped_table(0, "churn", 64, 4).unwrap();

    thread::scope(|s| {
        for worker in 0..4u8 {
            let table = &table;
            s.spawn(move || {
                for i in 0..25u8 {
                    let value = dmac(worker * 32 + i);
                    let rule = table
                        .add_rule(
                            &dmac_criteria(),
                            &FlowSpec::new(value.clone()),
                            FlowDestination::Tir(u32::from(worker)),
                        )
                        .unwrap();
                    assert_eq!(rule.match_value().unwrap(), value);
                    rule.delete().unwrap();
                }
            });
        }
    });

    assert!(table.groups().unwrap().is_empty());
    assert!(rule_entries(&device, &table).is_empty());
    table.destroy().unwrap();
    assert_eq!(device.table_count(), 0);
}
