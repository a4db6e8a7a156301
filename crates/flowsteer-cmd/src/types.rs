//! Type-safe device object ids.
//!
//! Flow tables and flow groups are both named by 32-bit ids allocated by
//! the device. Wrapping them in distinct types keeps a group id from being
//! passed where a table id is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;
use std::str::FromStr;

/// Raw device object id.
pub type RawDeviceId = u32;

/// Marker trait for device object kinds.
pub trait DeviceObjectKind: Send + Sync + 'static {
    /// Returns the object type name for debugging.
    fn type_name() -> &'static str;
}

/// A type-safe device object id.
///
/// The phantom type parameter `T` records what kind of object this id
/// names.
///
/// # Examples
///
/// ```
/// use flowsteer_cmd::{FlowGroupId, FlowTableId};
///
/// let table = FlowTableId::new(1);
/// let group = FlowGroupId::new(1);
/// assert_eq!(table.as_raw(), group.as_raw());
///
/// // This would fail to compile:
/// // fn takes_table(t: FlowTableId) {}
/// // takes_table(group);
/// ```
#[derive(Clone, Copy)]
pub struct DeviceId<T: DeviceObjectKind> {
    raw: RawDeviceId,
    _marker: PhantomData<T>,
}

impl<T: DeviceObjectKind> DeviceId<T> {
    /// Wraps a raw id returned by the device.
    pub const fn new(raw: RawDeviceId) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    /// Returns the raw id value.
    pub const fn as_raw(&self) -> RawDeviceId {
        self.raw
    }
}

impl<T: DeviceObjectKind> fmt::Debug for DeviceId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:x})", T::type_name(), self.raw)
    }
}

impl<T: DeviceObjectKind> fmt::Display for DeviceId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl<T: DeviceObjectKind> PartialEq for DeviceId<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T: DeviceObjectKind> Eq for DeviceId<T> {}

impl<T: DeviceObjectKind> Hash for DeviceId<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<T: DeviceObjectKind> PartialOrd for DeviceId<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: DeviceObjectKind> Ord for DeviceId<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.raw.cmp(&other.raw)
    }
}

impl<T: DeviceObjectKind> Serialize for DeviceId<T> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.raw)
    }
}

// ============================================================================
// Object Kind Markers
// ============================================================================

macro_rules! define_object_kind {
    ($name:ident, $type_name:literal, $id_alias:ident) => {
        #[doc = concat!("Marker type for device ", $type_name, " objects.")]
        #[derive(Debug, Clone, Copy)]
        pub struct $name;

        impl DeviceObjectKind for $name {
            fn type_name() -> &'static str {
                $type_name
            }
        }

        #[doc = concat!("Type-safe id for ", $type_name, " objects.")]
        pub type $id_alias = DeviceId<$name>;
    };
}

define_object_kind!(FlowTableKind, "FlowTable", FlowTableId);
define_object_kind!(FlowGroupKind, "FlowGroup", FlowGroupId);

// ============================================================================
// Table Types
// ============================================================================

/// Flow table type, selecting which steering domain a table lives in.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowTableType {
    /// NIC receive steering.
    NicRx = 0x0,
    /// E-switch forwarding database.
    Fdb = 0x4,
    /// Receive sniffer tap.
    SnifferRx = 0x5,
    /// Transmit sniffer tap.
    SnifferTx = 0x6,
}

impl FlowTableType {
    /// Returns the raw table type written into commands.
    pub fn as_raw(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for FlowTableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlowTableType::NicRx => "nic_rx",
            FlowTableType::Fdb => "fdb",
            FlowTableType::SnifferRx => "sniffer_rx",
            FlowTableType::SnifferTx => "sniffer_tx",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for FlowTableType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nic_rx" | "rx" => Ok(FlowTableType::NicRx),
            "fdb" => Ok(FlowTableType::Fdb),
            "sniffer_rx" => Ok(FlowTableType::SnifferRx),
            "sniffer_tx" => Ok(FlowTableType::SnifferTx),
            _ => Err(format!("Unknown flow table type: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_id_debug_format() {
        let id = FlowTableId::new(0x2a);
        assert_eq!(format!("{:?}", id), "FlowTable(0x2a)");
        assert_eq!(format!("{}", id), "42");
    }

    #[test]
    fn test_id_hash_and_order() {
        let mut set = HashSet::new();
        set.insert(FlowGroupId::new(3));
        set.insert(FlowGroupId::new(3));
        set.insert(FlowGroupId::new(1));
        assert_eq!(set.len(), 2);
        assert!(FlowGroupId::new(1) < FlowGroupId::new(3));
    }

    #[test]
    fn test_table_type_parse() {
        assert_eq!("rx".parse::<FlowTableType>().unwrap(), FlowTableType::NicRx);
        assert_eq!(
            "Sniffer_TX".parse::<FlowTableType>().unwrap(),
            FlowTableType::SnifferTx
        );
        assert_eq!(FlowTableType::Fdb.as_raw(), 4);
        assert!("egress_acl".parse::<FlowTableType>().is_err());
    }
}
