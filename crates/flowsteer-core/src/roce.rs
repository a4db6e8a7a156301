//! Match templates for RoCE traffic.

use crate::error::FsResult;
use crate::rule::{FlowRule, FlowSpec};
use crate::table::FlowTable;
use bitflags::bitflags;
use flowsteer_cmd::{FlowDestination, MatchCriteria, MatchCriteriaEnable, MatchParam};
use log::{debug, warn};

pub const ETH_P_ROCE: u16 = 0x8915;
pub const ETH_P_IP: u16 = 0x0800;
pub const ETH_P_IPV6: u16 = 0x86dd;
pub const IPPROTO_UDP: u8 = 17;
pub const ROCE_V2_UDP_DPORT: u16 = 4791;

bitflags! {
    /// RoCE versions the device advertises.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RoceModes: u8 {
        const V1 = 0x1;
        const V2 = 0x4;
    }
}

fn outer_criteria(mask: MatchParam) -> MatchCriteria {
    MatchCriteria::new(MatchCriteriaEnable::OUTER_HEADERS, mask)
}

fn v1_rule() -> (MatchCriteria, MatchParam) {
    let mut mask = MatchParam::zeroed();
    mask.outer_mut().ethertype(0xffff);
    let mut value = MatchParam::zeroed();
    value.outer_mut().ethertype(ETH_P_ROCE);
    (outer_criteria(mask), value)
}

fn v2_rule(ethertype: u16) -> (MatchCriteria, MatchParam) {
    let mut mask = MatchParam::zeroed();
    mask.outer_mut()
        .ethertype(0xffff)
        .ip_protocol(0xff)
        .udp_dport(0xffff);
    let mut value = MatchParam::zeroed();
    value
        .outer_mut()
        .ethertype(ethertype)
        .ip_protocol(IPPROTO_UDP)
        .udp_dport(ROCE_V2_UDP_DPORT);
    (outer_criteria(mask), value)
}

/// Criteria and match values catching RoCE traffic for `modes`.
pub fn roce_flow_rules(modes: RoceModes) -> Vec<(MatchCriteria, MatchParam)> {
    let mut rules = Vec::new();
    if modes.contains(RoceModes::V1) {
        rules.push(v1_rule());
    }
    if modes.contains(RoceModes::V2) {
        rules.push(v2_rule(ETH_P_IP));
        rules.push(v2_rule(ETH_P_IPV6));
    }
    rules
}

/// Installs the RoCE rules for `modes` into `table`, all forwarding to
/// `dest`. Rules added before a failure are deleted again.
pub fn add_roce_rules(
    table: &FlowTable,
    modes: RoceModes,
    dest: FlowDestination,
) -> FsResult<Vec<FlowRule>> {
    let mut added: Vec<FlowRule> = Vec::new();
    for (criteria, value) in roce_flow_rules(modes) {
        match table.add_rule(&criteria, &FlowSpec::new(value), dest) {
            Ok(rule) => added.push(rule),
            Err(e) => {
                warn!("failed to add RoCE rule to {}: {}", table.name(), e);
                for rule in added.iter().rev() {
                    if let Err(del) = rule.delete() {
                        warn!("failed to remove RoCE rule {}: {}", rule.name(), del);
                    }
                }
                return Err(e);
            }
        }
    }
    debug!("added {} RoCE rules to {}", added.len(), table.name());
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_v1_only() {
        let rules = roce_flow_rules(RoceModes::V1);
        assert_eq!(rules.len(), 1);
        let (criteria, value) = &rules[0];
        assert_eq!(criteria.enable, MatchCriteriaEnable::OUTER_HEADERS);
        assert_eq!(value.outer().ethertype(), ETH_P_ROCE);
        assert_eq!(criteria.mask.outer().ip_protocol(), 0);
    }

    #[test]
    fn test_v2_matches_udp_port() {
        let rules = roce_flow_rules(RoceModes::V2);
        let ethertypes: Vec<u16> = rules.iter().map(|(_, v)| v.outer().ethertype()).collect();
        assert_eq!(ethertypes, vec![ETH_P_IP, ETH_P_IPV6]);
        for (criteria, value) in &rules {
            assert_eq!(value.outer().ip_protocol(), IPPROTO_UDP);
            assert_eq!(value.outer().udp_dport(), ROCE_V2_UDP_DPORT);
            assert_eq!(criteria.mask.outer().udp_dport(), 0xffff);
        }
        // both IP versions share one mask and so one group
        assert_eq!(rules[0].0, rules[1].0);
    }

    #[test]
    fn test_no_modes() {
        assert!(roce_flow_rules(RoceModes::empty()).is_empty());
        assert_eq!(roce_flow_rules(RoceModes::all()).len(), 3);
    }
}
