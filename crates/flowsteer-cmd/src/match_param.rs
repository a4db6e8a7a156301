//! Match criteria and match value buffers.
//!
//! The device describes matching with a fixed 256-byte `fte_match_param`
//! record made of three 64-byte sections:
//!
//! ```text
//! offset   0: outer headers   (layer 2-4 fields of the outer packet)
//! offset  64: misc parameters (source port, tunnel ids, ...)
//! offset 128: inner headers   (layer 2-4 fields after decapsulation)
//! offset 192: reserved
//! ```
//!
//! A flow group carries a mask in this layout plus an enable byte selecting
//! which sections take part in matching. Entries carry a value in the same
//! layout. The tree engine treats both as opaque bytes; the typed setters
//! here only exist so callers can build buffers without hand-computing
//! offsets. All multi-byte fields are big-endian.

use crate::error::{CmdError, CmdResult};
use bitflags::bitflags;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::fmt;

/// Size of a full match parameter record in bytes.
pub const MATCH_PARAM_SIZE: usize = 256;

/// Size of one match section in bytes.
pub const MATCH_SET_SIZE: usize = 64;

bitflags! {
    /// Sections of the match parameter record that participate in matching.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MatchCriteriaEnable: u8 {
        const OUTER_HEADERS = 1 << 0;
        const MISC_PARAMETERS = 1 << 1;
        const INNER_HEADERS = 1 << 2;
    }
}

/// One 64-byte section of the match parameter record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchSection {
    OuterHeaders,
    MiscParameters,
    InnerHeaders,
}

impl MatchSection {
    /// All sections in record order.
    pub const ALL: [MatchSection; 3] = [
        MatchSection::OuterHeaders,
        MatchSection::MiscParameters,
        MatchSection::InnerHeaders,
    ];

    /// Byte offset of the section within the record.
    pub const fn offset(&self) -> usize {
        match self {
            MatchSection::OuterHeaders => 0,
            MatchSection::MiscParameters => MATCH_SET_SIZE,
            MatchSection::InnerHeaders => 2 * MATCH_SET_SIZE,
        }
    }

    /// The enable bit that turns this section on.
    pub const fn enable_bit(&self) -> MatchCriteriaEnable {
        match self {
            MatchSection::OuterHeaders => MatchCriteriaEnable::OUTER_HEADERS,
            MatchSection::MiscParameters => MatchCriteriaEnable::MISC_PARAMETERS,
            MatchSection::InnerHeaders => MatchCriteriaEnable::INNER_HEADERS,
        }
    }

    fn key(&self) -> &'static str {
        match self {
            MatchSection::OuterHeaders => "outer_headers",
            MatchSection::MiscParameters => "misc_parameters",
            MatchSection::InnerHeaders => "inner_headers",
        }
    }
}

// Byte offsets inside a layer 2-4 header section.
const L24_SMAC: usize = 0;
const L24_ETHERTYPE: usize = 6;
const L24_DMAC: usize = 8;
const L24_FIRST_VID: usize = 14;
const L24_IP_PROTOCOL: usize = 16;
const L24_TCP_SPORT: usize = 20;
const L24_TCP_DPORT: usize = 22;
const L24_UDP_SPORT: usize = 28;
const L24_UDP_DPORT: usize = 30;
const L24_SRC_IP: usize = 32;
const L24_DST_IP: usize = 48;

// Byte offsets inside the misc section.
const MISC_SOURCE_PORT: usize = 2;

/// A 256-byte match value or match mask.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct MatchParam {
    bytes: [u8; MATCH_PARAM_SIZE],
}

impl MatchParam {
    /// Returns an all-zero record.
    pub const fn zeroed() -> Self {
        Self {
            bytes: [0; MATCH_PARAM_SIZE],
        }
    }

    /// Copies a record out of a raw buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffer is not exactly 256 bytes.
    pub fn from_slice(buf: &[u8]) -> CmdResult<Self> {
        let bytes: [u8; MATCH_PARAM_SIZE] = buf.try_into().map_err(|_| {
            CmdError::invalid_parameter(format!(
                "match param must be {} bytes, got {}",
                MATCH_PARAM_SIZE,
                buf.len()
            ))
        })?;
        Ok(Self { bytes })
    }

    /// Returns the raw record.
    pub fn as_bytes(&self) -> &[u8; MATCH_PARAM_SIZE] {
        &self.bytes
    }

    /// Returns one section of the record.
    pub fn section(&self, section: MatchSection) -> &[u8] {
        let off = section.offset();
        &self.bytes[off..off + MATCH_SET_SIZE]
    }

    /// Returns one section of the record for writing.
    pub fn section_mut(&mut self, section: MatchSection) -> &mut [u8] {
        let off = section.offset();
        &mut self.bytes[off..off + MATCH_SET_SIZE]
    }

    /// Returns true if every byte is zero.
    pub fn is_zeroed(&self) -> bool {
        self.bytes.iter().all(|b| *b == 0)
    }

    /// Read view of the outer header fields.
    pub fn outer(&self) -> Headers<'_> {
        Headers {
            bytes: self.section(MatchSection::OuterHeaders),
        }
    }

    /// Read view of the inner header fields.
    pub fn inner(&self) -> Headers<'_> {
        Headers {
            bytes: self.section(MatchSection::InnerHeaders),
        }
    }

    /// Write view of the outer header fields.
    pub fn outer_mut(&mut self) -> HeadersMut<'_> {
        HeadersMut {
            bytes: self.section_mut(MatchSection::OuterHeaders),
        }
    }

    /// Write view of the inner header fields.
    pub fn inner_mut(&mut self) -> HeadersMut<'_> {
        HeadersMut {
            bytes: self.section_mut(MatchSection::InnerHeaders),
        }
    }

    /// Returns the misc-section source port.
    pub fn misc_source_port(&self) -> u16 {
        read_be16(self.section(MatchSection::MiscParameters), MISC_SOURCE_PORT)
    }

    /// Sets the misc-section source port (the ingress vport).
    pub fn set_misc_source_port(&mut self, port: u16) -> &mut Self {
        write_be16(
            self.section_mut(MatchSection::MiscParameters),
            MISC_SOURCE_PORT,
            port,
        );
        self
    }

    fn hex_section(&self, section: MatchSection) -> Option<String> {
        let bytes = self.section(section);
        let last = bytes.iter().rposition(|b| *b != 0)?;
        Some(bytes[..=last].iter().map(|b| format!("{:02x}", b)).collect())
    }
}

impl Default for MatchParam {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl fmt::Debug for MatchParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("MatchParam");
        for section in MatchSection::ALL {
            if let Some(hex) = self.hex_section(section) {
                s.field(section.key(), &hex);
            }
        }
        s.finish()
    }
}

impl Serialize for MatchParam {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let sections: Vec<(MatchSection, String)> = MatchSection::ALL
            .iter()
            .filter_map(|s| self.hex_section(*s).map(|hex| (*s, hex)))
            .collect();
        let mut map = serializer.serialize_map(Some(sections.len()))?;
        for (section, hex) in &sections {
            map.serialize_entry(section.key(), hex)?;
        }
        map.end()
    }
}

fn read_be16(bytes: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([bytes[off], bytes[off + 1]])
}

fn write_be16(bytes: &mut [u8], off: usize, value: u16) {
    bytes[off..off + 2].copy_from_slice(&value.to_be_bytes());
}

/// Read view over a layer 2-4 header section.
#[derive(Debug, Clone, Copy)]
pub struct Headers<'a> {
    bytes: &'a [u8],
}

impl Headers<'_> {
    pub fn smac(&self) -> [u8; 6] {
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&self.bytes[L24_SMAC..L24_SMAC + 6]);
        mac
    }

    pub fn dmac(&self) -> [u8; 6] {
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&self.bytes[L24_DMAC..L24_DMAC + 6]);
        mac
    }

    pub fn ethertype(&self) -> u16 {
        read_be16(self.bytes, L24_ETHERTYPE)
    }

    /// VLAN id of the first tag (low 12 bits).
    pub fn first_vid(&self) -> u16 {
        read_be16(self.bytes, L24_FIRST_VID) & 0x0fff
    }

    pub fn ip_protocol(&self) -> u8 {
        self.bytes[L24_IP_PROTOCOL]
    }

    pub fn tcp_dport(&self) -> u16 {
        read_be16(self.bytes, L24_TCP_DPORT)
    }

    pub fn udp_dport(&self) -> u16 {
        read_be16(self.bytes, L24_UDP_DPORT)
    }
}

/// Write view over a layer 2-4 header section.
#[derive(Debug)]
pub struct HeadersMut<'a> {
    bytes: &'a mut [u8],
}

impl HeadersMut<'_> {
    pub fn smac(&mut self, mac: [u8; 6]) -> &mut Self {
        self.bytes[L24_SMAC..L24_SMAC + 6].copy_from_slice(&mac);
        self
    }

    pub fn dmac(&mut self, mac: [u8; 6]) -> &mut Self {
        self.bytes[L24_DMAC..L24_DMAC + 6].copy_from_slice(&mac);
        self
    }

    pub fn ethertype(&mut self, ethertype: u16) -> &mut Self {
        write_be16(self.bytes, L24_ETHERTYPE, ethertype);
        self
    }

    /// Sets the first VLAN id, leaving the priority and CFI bits alone.
    pub fn first_vid(&mut self, vid: u16) -> &mut Self {
        let keep = read_be16(self.bytes, L24_FIRST_VID) & 0xf000;
        write_be16(self.bytes, L24_FIRST_VID, keep | (vid & 0x0fff));
        self
    }

    pub fn ip_protocol(&mut self, protocol: u8) -> &mut Self {
        self.bytes[L24_IP_PROTOCOL] = protocol;
        self
    }

    pub fn tcp_sport(&mut self, port: u16) -> &mut Self {
        write_be16(self.bytes, L24_TCP_SPORT, port);
        self
    }

    pub fn tcp_dport(&mut self, port: u16) -> &mut Self {
        write_be16(self.bytes, L24_TCP_DPORT, port);
        self
    }

    pub fn udp_sport(&mut self, port: u16) -> &mut Self {
        write_be16(self.bytes, L24_UDP_SPORT, port);
        self
    }

    pub fn udp_dport(&mut self, port: u16) -> &mut Self {
        write_be16(self.bytes, L24_UDP_DPORT, port);
        self
    }

    /// Sets an IPv4 source address (low 32 bits of the 128-bit field).
    pub fn src_ipv4(&mut self, addr: [u8; 4]) -> &mut Self {
        self.bytes[L24_SRC_IP + 12..L24_SRC_IP + 16].copy_from_slice(&addr);
        self
    }

    /// Sets an IPv4 destination address (low 32 bits of the 128-bit field).
    pub fn dst_ipv4(&mut self, addr: [u8; 4]) -> &mut Self {
        self.bytes[L24_DST_IP + 12..L24_DST_IP + 16].copy_from_slice(&addr);
        self
    }
}

/// A group's match criteria: enabled sections plus the mask.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize)]
pub struct MatchCriteria {
    #[serde(serialize_with = "serialize_enable")]
    pub enable: MatchCriteriaEnable,
    pub mask: MatchParam,
}

fn serialize_enable<S: Serializer>(
    enable: &MatchCriteriaEnable,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_u8(enable.bits())
}

impl MatchCriteria {
    /// Creates criteria from an enable byte and a mask.
    pub fn new(enable: MatchCriteriaEnable, mask: MatchParam) -> Self {
        Self { enable, mask }
    }

    /// Criteria that match every packet.
    pub fn match_all() -> Self {
        Self::default()
    }

    /// Returns true if two match values are equal under this mask.
    ///
    /// Only enabled sections are compared; bytes outside the mask are
    /// ignored.
    pub fn matches(&self, a: &MatchParam, b: &MatchParam) -> bool {
        MatchSection::ALL
            .iter()
            .filter(|s| self.enable.contains(s.enable_bit()))
            .all(|s| {
                let mask = self.mask.section(*s);
                let lhs = a.section(*s);
                let rhs = b.section(*s);
                mask.iter()
                    .zip(lhs.iter().zip(rhs.iter()))
                    .all(|(m, (x, y))| x & m == y & m)
            })
    }
}
