//! # NetFlow V5 flow records
//!
//! The engine consumes one [`FlowRecord`] per unidirectional IP conversation.
//! Records normally arrive from an export stream; the parser here understands
//! the classic fixed-width V5 layout, and the tagged variant (V1005) extends
//! it with operator-assigned source/destination tags.
//!
//! References:
//! - <https://www.cisco.com/en/US/technologies/tk648/tk362/technologies_white_paper09186a00800a3db9.html>

use crate::FlowStatError;

use nom::number::complete::be_u32;
use nom_derive::*;
use serde::Serialize;

use std::fmt;
use std::net::Ipv4Addr;
use std::ops::{BitOr, BitOrAssign};
use std::time::{Duration, SystemTime};

/// Set of logical fields carried by a flow record.
///
/// Every report kind declares the fields it reads; a definition refuses to
/// accumulate a flow stream whose version does not carry all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FlowFields(u32);

macro_rules! flow_fields {
    ($($name:ident = $bit:expr, $label:literal;)*) => {
        impl FlowFields {
            pub const NONE: FlowFields = FlowFields(0);
            $(pub const $name: FlowFields = FlowFields(1 << $bit);)*

            const LABELS: &'static [(FlowFields, &'static str)] =
                &[$((FlowFields(1 << $bit), $label)),*];
        }
    };
}

flow_fields! {
    SRCADDR = 0, "srcaddr";
    DSTADDR = 1, "dstaddr";
    NEXTHOP = 2, "nexthop";
    EXADDR = 3, "exaddr";
    SRC_MASK = 4, "src_mask";
    DST_MASK = 5, "dst_mask";
    SRCPORT = 6, "srcport";
    DSTPORT = 7, "dstport";
    INPUT = 8, "input";
    OUTPUT = 9, "output";
    SRC_AS = 10, "src_as";
    DST_AS = 11, "dst_as";
    PROT = 12, "prot";
    TOS = 13, "tos";
    TCP_FLAGS = 14, "tcp_flags";
    ENGINE_ID = 15, "engine_id";
    ENGINE_TYPE = 16, "engine_type";
    SRC_TAG = 17, "src_tag";
    DST_TAG = 18, "dst_tag";
    DPKTS = 19, "dPkts";
    DOCTETS = 20, "dOctets";
    DFLOWS = 21, "dFlows";
    FIRST = 22, "first";
    LAST = 23, "last";
    SYSUPTIME = 24, "sysUpTime";
    UNIX_SECS = 25, "unix_secs";
    UNIX_NSECS = 26, "unix_nsecs";
}

impl FlowFields {
    /// Union of two field sets, usable in const context.
    pub const fn with(self, other: FlowFields) -> FlowFields {
        FlowFields(self.0 | other.0)
    }

    pub const fn contains(self, other: FlowFields) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, other: FlowFields) {
        self.0 |= other.0;
    }

    /// Fields in `required` that this set does not carry.
    pub fn missing(self, required: FlowFields) -> FlowFields {
        FlowFields(required.0 & !self.0)
    }

    /// Textual names of every field in the set.
    pub fn names(self) -> Vec<&'static str> {
        Self::LABELS
            .iter()
            .filter(|(f, _)| self.contains(*f))
            .map(|(_, l)| *l)
            .collect()
    }
}

impl BitOr for FlowFields {
    type Output = FlowFields;

    fn bitor(self, rhs: FlowFields) -> FlowFields {
        FlowFields(self.0 | rhs.0)
    }
}

impl BitOrAssign for FlowFields {
    fn bitor_assign(&mut self, rhs: FlowFields) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for FlowFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.names().join(","))
    }
}

/// Flow record version descriptor.
///
/// The descriptor fixes which logical fields are present; readers never touch
/// a field whose bit is not set. V1005 is V5 plus the two 32-bit tag fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FlowVersion {
    V5,
    V1005,
}

impl FlowVersion {
    const V5_FIELDS: FlowFields = FlowFields::SRCADDR
        .with(FlowFields::DSTADDR)
        .with(FlowFields::NEXTHOP)
        .with(FlowFields::EXADDR)
        .with(FlowFields::SRC_MASK)
        .with(FlowFields::DST_MASK)
        .with(FlowFields::SRCPORT)
        .with(FlowFields::DSTPORT)
        .with(FlowFields::INPUT)
        .with(FlowFields::OUTPUT)
        .with(FlowFields::SRC_AS)
        .with(FlowFields::DST_AS)
        .with(FlowFields::PROT)
        .with(FlowFields::TOS)
        .with(FlowFields::TCP_FLAGS)
        .with(FlowFields::ENGINE_ID)
        .with(FlowFields::ENGINE_TYPE)
        .with(FlowFields::DPKTS)
        .with(FlowFields::DOCTETS)
        .with(FlowFields::FIRST)
        .with(FlowFields::LAST)
        .with(FlowFields::SYSUPTIME)
        .with(FlowFields::UNIX_SECS)
        .with(FlowFields::UNIX_NSECS);

    /// Fields carried by records of this version.
    pub fn fields(self) -> FlowFields {
        match self {
            FlowVersion::V5 => Self::V5_FIELDS,
            FlowVersion::V1005 => Self::V5_FIELDS
                .with(FlowFields::SRC_TAG)
                .with(FlowFields::DST_TAG),
        }
    }
}

/// An absolute wallclock instant with millisecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Wallclock {
    pub secs: u32,
    pub nsecs: u32,
}

impl Wallclock {
    pub fn as_system_time(self) -> SystemTime {
        SystemTime::UNIX_EPOCH
            + Duration::from_secs(self.secs.into())
            + Duration::from_nanos(self.nsecs.into())
    }
}

/// Translate an uptime-relative millisecond stamp to wallclock time.
///
/// `offset_ms` is the uptime-relative stamp (`first` or `last`); the export
/// header supplies `sys_uptime` and the `unix_secs`/`unix_nsecs` pair taken
/// at export time.
pub fn wallclock(sys_uptime: u32, unix_secs: u32, unix_nsecs: u32, offset_ms: u32) -> Wallclock {
    let export_ms = u64::from(unix_secs) * 1_000 + u64::from(unix_nsecs) / 1_000_000;
    let ms = export_ms
        .saturating_sub(u64::from(sys_uptime))
        .saturating_add(u64::from(offset_ms));
    Wallclock {
        secs: (ms / 1_000) as u32,
        nsecs: ((ms % 1_000) * 1_000_000) as u32,
    }
}

/// One unidirectional IP conversation summary.
///
/// Counters are held as 64-bit regardless of the wire width; `d_flows` is
/// synthesized as 1 for versions that do not carry it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowRecord {
    pub version: FlowVersion,
    /// Milliseconds since the export device booted, at export time
    pub sys_uptime: u32,
    /// Seconds since 0000 UTC 1970, at export time
    pub unix_secs: u32,
    /// Residual nanoseconds at export time
    pub unix_nsecs: u32,
    /// Address of the exporting device
    pub exaddr: Ipv4Addr,
    /// Source IP address
    pub srcaddr: Ipv4Addr,
    /// Destination IP address
    pub dstaddr: Ipv4Addr,
    /// IP address of next hop router
    pub nexthop: Ipv4Addr,
    /// SNMP index of input interface
    pub input: u16,
    /// SNMP index of output interface
    pub output: u16,
    /// Flows aggregated into this record
    pub d_flows: u64,
    /// Packets in the flow
    pub d_pkts: u64,
    /// Total number of Layer 3 bytes in the packets of the flow
    pub d_octets: u64,
    /// Uptime at start of flow, milliseconds
    pub first: u32,
    /// Uptime when the last packet of the flow was seen, milliseconds
    pub last: u32,
    /// TCP/UDP source port number or equivalent
    pub srcport: u16,
    /// TCP/UDP destination port number or equivalent
    pub dstport: u16,
    /// IP protocol number (for example, TCP = 6; UDP = 17)
    pub prot: u8,
    /// IP type of service
    pub tos: u8,
    /// Cumulative OR of TCP flags
    pub tcp_flags: u8,
    /// Source address prefix mask bits
    pub src_mask: u8,
    /// Destination address prefix mask bits
    pub dst_mask: u8,
    /// Autonomous system number of the source, either origin or peer
    pub src_as: u16,
    /// Autonomous system number of the destination, either origin or peer
    pub dst_as: u16,
    /// Type of flow-switching engine
    pub engine_type: u8,
    /// Slot number of the flow-switching engine
    pub engine_id: u8,
    /// Operator-assigned source endpoint tag (V1005)
    pub src_tag: u32,
    /// Operator-assigned destination endpoint tag (V1005)
    pub dst_tag: u32,
}

impl Default for FlowRecord {
    fn default() -> Self {
        FlowRecord {
            version: FlowVersion::V1005,
            sys_uptime: 0,
            unix_secs: 0,
            unix_nsecs: 0,
            exaddr: Ipv4Addr::UNSPECIFIED,
            srcaddr: Ipv4Addr::UNSPECIFIED,
            dstaddr: Ipv4Addr::UNSPECIFIED,
            nexthop: Ipv4Addr::UNSPECIFIED,
            input: 0,
            output: 0,
            d_flows: 1,
            d_pkts: 0,
            d_octets: 0,
            first: 0,
            last: 0,
            srcport: 0,
            dstport: 0,
            prot: 0,
            tos: 0,
            tcp_flags: 0,
            src_mask: 0,
            dst_mask: 0,
            src_as: 0,
            dst_as: 0,
            engine_type: 0,
            engine_id: 0,
            src_tag: 0,
            dst_tag: 0,
        }
    }
}

impl FlowRecord {
    /// Fields present in this record.
    pub fn xfields(&self) -> FlowFields {
        self.version.fields()
    }

    /// Promote to the tagged variant so tag fields become writable.
    ///
    /// Tag values start at zero; a tag policy is expected to rewrite them.
    pub fn upcast_tagged(&mut self) {
        if self.version == FlowVersion::V5 {
            self.version = FlowVersion::V1005;
        }
    }

    /// Flow lifetime in milliseconds. Zero when `last <= first`.
    pub fn duration_ms(&self) -> u32 {
        self.last.saturating_sub(self.first)
    }

    /// Wallclock instant of the first packet.
    pub fn wall_first(&self) -> Wallclock {
        wallclock(self.sys_uptime, self.unix_secs, self.unix_nsecs, self.first)
    }

    /// Wallclock instant of the last packet.
    pub fn wall_last(&self) -> Wallclock {
        wallclock(self.sys_uptime, self.unix_secs, self.unix_nsecs, self.last)
    }
}

/// NetFlow V5 export header, 24 bytes on the wire.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Nom)]
pub struct V5Header {
    /// NetFlow export format version number
    pub version: u16,
    /// Number of flows exported in this packet (1-30)
    pub count: u16,
    /// Current time in milliseconds since the export device booted
    pub sys_uptime: u32,
    /// Current count of seconds since 0000 UTC 1970
    pub unix_secs: u32,
    /// Residual nanoseconds since 0000 UTC 1970
    pub unix_nsecs: u32,
    /// Sequence counter of total flows seen
    pub flow_sequence: u32,
    /// Type of flow-switching engine
    pub engine_type: u8,
    /// Slot number of the flow-switching engine
    pub engine_id: u8,
    /// First two bits hold the sampling mode; remaining 14 bits hold value of sampling interval
    pub sampling_interval: u16,
}

/// Raw V5 flow record, 48 bytes on the wire.
#[derive(Debug, Clone, Nom)]
struct RawV5Record {
    #[nom(Map = "Ipv4Addr::from", Parse = "be_u32")]
    srcaddr: Ipv4Addr,
    #[nom(Map = "Ipv4Addr::from", Parse = "be_u32")]
    dstaddr: Ipv4Addr,
    #[nom(Map = "Ipv4Addr::from", Parse = "be_u32")]
    nexthop: Ipv4Addr,
    input: u16,
    output: u16,
    d_pkts: u32,
    d_octets: u32,
    first: u32,
    last: u32,
    srcport: u16,
    dstport: u16,
    pad1: u8,
    tcp_flags: u8,
    prot: u8,
    tos: u8,
    src_as: u16,
    dst_as: u16,
    src_mask: u8,
    dst_mask: u8,
    pad2: u16,
}

impl FlowRecord {
    fn from_raw(header: &V5Header, exaddr: Ipv4Addr, raw: RawV5Record) -> FlowRecord {
        FlowRecord {
            version: FlowVersion::V5,
            sys_uptime: header.sys_uptime,
            unix_secs: header.unix_secs,
            unix_nsecs: header.unix_nsecs,
            exaddr,
            srcaddr: raw.srcaddr,
            dstaddr: raw.dstaddr,
            nexthop: raw.nexthop,
            input: raw.input,
            output: raw.output,
            d_flows: 1,
            d_pkts: raw.d_pkts.into(),
            d_octets: raw.d_octets.into(),
            first: raw.first,
            last: raw.last,
            srcport: raw.srcport,
            dstport: raw.dstport,
            prot: raw.prot,
            tos: raw.tos,
            tcp_flags: raw.tcp_flags,
            src_mask: raw.src_mask,
            dst_mask: raw.dst_mask,
            src_as: raw.src_as,
            dst_as: raw.dst_as,
            engine_type: header.engine_type,
            engine_id: header.engine_id,
            src_tag: 0,
            dst_tag: 0,
        }
    }
}

/// Parse one V5 export packet (header plus `count` records).
///
/// `exaddr` identifies the exporting device; the wire format does not carry
/// it, so the transport layer supplies it.
pub fn parse_v5_packet(
    buf: &[u8],
    exaddr: Ipv4Addr,
) -> Result<(V5Header, Vec<FlowRecord>), FlowStatError> {
    let (mut rest, header) = V5Header::parse(buf).map_err(|e| FlowStatError::FlowDecode {
        offset: 0,
        reason: format!("V5 header: {e}"),
    })?;
    if header.version != 5 {
        return Err(FlowStatError::FlowDecode {
            offset: 0,
            reason: format!("unexpected export version {}", header.version),
        });
    }

    let mut records = Vec::with_capacity(header.count as usize);
    for i in 0..header.count {
        let offset = buf.len() - rest.len();
        let (next, raw) = RawV5Record::parse(rest).map_err(|e| FlowStatError::FlowDecode {
            offset,
            reason: format!("V5 record {i}: {e}"),
        })?;
        let _ = (raw.pad1, raw.pad2);
        records.push(FlowRecord::from_raw(&header, exaddr, raw));
        rest = next;
    }

    Ok((header, records))
}
