//! Report kind registry.
//!
//! Every kind is a row in one table: its key columns, storage choice,
//! required flow fields, and column constraints. The accumulate/calc/dump
//! machinery is shared; nothing here is executed per kind beyond key
//! extraction.

use super::{AddrMode, FieldSet, KeyCell, KeyVec, OptionSet, Report, StatKey, prefix_mask};
use crate::flow::{FlowFields, FlowRecord};
use crate::rate::RateStats;
use crate::symbols::SymClass;

use serde::{Serialize, Serializer};

use std::sync::LazyLock;

/// One key column of a report kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeyCol {
    SrcAddr,
    DstAddr,
    /// Both endpoints land in the same table, one key each.
    EitherAddr,
    NextHop,
    Exporter,
    SrcPort,
    DstPort,
    /// Both ports land in the same table, one key each.
    EitherPort,
    Input,
    Output,
    SrcAs,
    DstAs,
    SrcTag,
    DstTag,
    Protocol,
    Tos,
    EngineId,
    EngineType,
    /// Destination class: 0 unicast, 1 multicast.
    AddrType,
    /// Mean packet size, octets over packets.
    PacketSize,
    Octets,
    Packets,
    Bps,
    Pps,
    /// Wallclock second of the first packet.
    StartTime,
    /// Wallclock second of the last packet.
    EndTime,
    /// Flow lifetime in milliseconds.
    Duration,
}

impl KeyCol {
    fn required(self) -> FlowFields {
        match self {
            KeyCol::SrcAddr => FlowFields::SRCADDR,
            KeyCol::DstAddr => FlowFields::DSTADDR,
            KeyCol::EitherAddr => FlowFields::SRCADDR.with(FlowFields::DSTADDR),
            KeyCol::NextHop => FlowFields::NEXTHOP,
            KeyCol::Exporter => FlowFields::EXADDR,
            KeyCol::SrcPort => FlowFields::SRCPORT,
            KeyCol::DstPort => FlowFields::DSTPORT,
            KeyCol::EitherPort => FlowFields::SRCPORT.with(FlowFields::DSTPORT),
            KeyCol::Input => FlowFields::INPUT,
            KeyCol::Output => FlowFields::OUTPUT,
            KeyCol::SrcAs => FlowFields::SRC_AS,
            KeyCol::DstAs => FlowFields::DST_AS,
            KeyCol::SrcTag => FlowFields::SRC_TAG,
            KeyCol::DstTag => FlowFields::DST_TAG,
            KeyCol::Protocol => FlowFields::PROT,
            KeyCol::Tos => FlowFields::TOS,
            KeyCol::EngineId => FlowFields::ENGINE_ID,
            KeyCol::EngineType => FlowFields::ENGINE_TYPE,
            KeyCol::AddrType => FlowFields::DSTADDR,
            _ => FlowFields::NONE,
        }
    }

    pub(crate) fn sym_class(self) -> SymClass {
        match self {
            KeyCol::SrcPort | KeyCol::DstPort | KeyCol::EitherPort => SymClass::Port,
            KeyCol::Protocol => SymClass::Protocol,
            KeyCol::SrcAs | KeyCol::DstAs => SymClass::As,
            KeyCol::SrcTag | KeyCol::DstTag => SymClass::Tag,
            KeyCol::Input | KeyCol::Output => SymClass::Interface,
            _ => SymClass::Plain,
        }
    }

    fn is_addr(self) -> bool {
        matches!(
            self,
            KeyCol::SrcAddr
                | KeyCol::DstAddr
                | KeyCol::EitherAddr
                | KeyCol::NextHop
                | KeyCol::Exporter
        )
    }

    /// Key value for scalar columns.
    fn scalar(self, flow: &FlowRecord) -> u32 {
        match self {
            KeyCol::SrcPort => flow.srcport.into(),
            KeyCol::DstPort => flow.dstport.into(),
            KeyCol::Input => flow.input.into(),
            KeyCol::Output => flow.output.into(),
            KeyCol::SrcAs => flow.src_as.into(),
            KeyCol::DstAs => flow.dst_as.into(),
            KeyCol::SrcTag => flow.src_tag,
            KeyCol::DstTag => flow.dst_tag,
            KeyCol::Protocol => flow.prot.into(),
            KeyCol::Tos => flow.tos.into(),
            KeyCol::EngineId => flow.engine_id.into(),
            KeyCol::EngineType => flow.engine_type.into(),
            KeyCol::AddrType => u32::from(flow.dstaddr.is_multicast()),
            KeyCol::PacketSize => {
                if flow.d_pkts > 0 {
                    (flow.d_octets / flow.d_pkts).min(u64::from(u32::MAX)) as u32
                } else {
                    0
                }
            }
            KeyCol::Octets => flow.d_octets.min(u64::from(u32::MAX)) as u32,
            KeyCol::Packets => flow.d_pkts.min(u64::from(u32::MAX)) as u32,
            KeyCol::Bps => RateStats::sample(flow.d_octets, flow.d_pkts, flow.duration_ms())
                .map(|(bps, _)| bps as u32)
                .unwrap_or(0),
            KeyCol::Pps => RateStats::sample(flow.d_octets, flow.d_pkts, flow.duration_ms())
                .map(|(_, pps)| pps as u32)
                .unwrap_or(0),
            KeyCol::StartTime => flow.wall_first().secs,
            KeyCol::EndTime => flow.wall_last().secs,
            KeyCol::Duration => flow.duration_ms(),
            _ => 0,
        }
    }
}

/// Storage backend for one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StorageKind {
    Hash { h_size: usize },
    Index { domain: usize },
}

/// Accumulation shape of one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FormKind {
    Keyed,
    SummaryDetail,
    SummaryCounters,
    Linear,
}

/// Registry row describing one report kind.
#[derive(Debug, Clone)]
pub(crate) struct KindDescr {
    pub name: &'static str,
    pub form: FormKind,
    pub storage: StorageKind,
    pub columns: Vec<KeyCol>,
    pub required: FlowFields,
    pub allowed_fields: FieldSet,
    pub default_fields: FieldSet,
    pub allowed_options: OptionSet,
    /// Column counted per bucket through the inner distinct set.
    pub distinct: Option<KeyCol>,
}

const BASE_REQUIRED: FlowFields = FlowFields::DPKTS
    .with(FlowFields::DOCTETS)
    .with(FlowFields::FIRST)
    .with(FlowFields::LAST)
    .with(FlowFields::UNIX_SECS)
    .with(FlowFields::SYSUPTIME);

const ALL_OPTIONS: OptionSet = OptionSet::PERCENT
    .with(OptionSet::NAMES)
    .with(OptionSet::HEADER)
    .with(OptionSet::XHEADER)
    .with(OptionSet::TOTALS);

fn key_bits(n: usize) -> FieldSet {
    const KEYS: [FieldSet; 6] = [
        FieldSet::KEY1,
        FieldSet::KEY2,
        FieldSet::KEY3,
        FieldSet::KEY4,
        FieldSet::KEY5,
        FieldSet::KEY6,
    ];
    KEYS[..n]
        .iter()
        .fold(FieldSet::NONE, |acc, f| acc.with(*f))
}

fn keyed(name: &'static str, storage: StorageKind, cols: &[KeyCol]) -> KindDescr {
    let mut required = BASE_REQUIRED;
    for col in cols {
        required |= col.required();
    }
    let keys = key_bits(cols.len());
    KindDescr {
        name,
        form: FormKind::Keyed,
        storage,
        columns: cols.to_vec(),
        required,
        allowed_fields: FieldSet::INDEX
            .with(FieldSet::FIRST)
            .with(FieldSet::LAST)
            .with(keys)
            .with(FieldSet::FLOWS)
            .with(FieldSet::OCTETS)
            .with(FieldSet::PACKETS)
            .with(FieldSet::DURATION)
            .with(FieldSet::RATES)
            .with(FieldSet::FRECS),
        default_fields: keys
            .with(FieldSet::FLOWS)
            .with(FieldSet::OCTETS)
            .with(FieldSet::PACKETS)
            .with(FieldSet::DURATION),
        allowed_options: ALL_OPTIONS,
        distinct: None,
    }
}

impl KindDescr {
    fn with_distinct(mut self, col: KeyCol) -> KindDescr {
        self.required |= col.required();
        self.allowed_fields.insert(FieldSet::COUNT);
        self.default_fields.insert(FieldSet::COUNT);
        self.distinct = Some(col);
        self
    }

    fn alias(mut self, extra: FieldSet) -> KindDescr {
        self.allowed_fields.insert(extra);
        self
    }

    pub(crate) fn keys_src_addr(&self) -> bool {
        self.columns
            .iter()
            .any(|c| matches!(c, KeyCol::SrcAddr | KeyCol::EitherAddr))
    }

    pub(crate) fn keys_dst_addr(&self) -> bool {
        self.columns
            .iter()
            .any(|c| matches!(c, KeyCol::DstAddr | KeyCol::EitherAddr))
    }

    /// KEY1..KEYn for this kind's key columns.
    pub(crate) fn key_fields(&self) -> FieldSet {
        key_bits(self.columns.len())
    }

    /// Extract this kind's key(s) from one flow.
    pub(crate) fn extract(&self, flow: &FlowRecord, report: &Report, keys: &mut KeyVec) {
        match self.columns.as_slice() {
            [KeyCol::EitherAddr] => {
                for (addr, mask) in [
                    (flow.srcaddr, flow.src_mask),
                    (flow.dstaddr, flow.dst_mask),
                ] {
                    let mut key = StatKey::default();
                    let (w, m) = addr_key(u32::from(addr), mask, report.src_addr_mode);
                    key.w[0] = w;
                    key.m[0] = m;
                    keys.push(key);
                }
            }
            [KeyCol::EitherPort] => {
                for port in [flow.srcport, flow.dstport] {
                    let mut key = StatKey::default();
                    key.w[0] = port.into();
                    keys.push(key);
                }
            }
            cols => {
                let mut key = StatKey::default();
                let mut slot = 0;
                for (i, col) in cols.iter().enumerate() {
                    if col.is_addr() {
                        let (addr, mask, mode) = match col {
                            KeyCol::SrcAddr => {
                                (flow.srcaddr, flow.src_mask, report.src_addr_mode)
                            }
                            KeyCol::DstAddr => {
                                (flow.dstaddr, flow.dst_mask, report.dst_addr_mode)
                            }
                            KeyCol::NextHop => (flow.nexthop, 0, AddrMode::Address),
                            _ => (flow.exaddr, 0, AddrMode::Address),
                        };
                        let (w, m) = addr_key(u32::from(addr), mask, mode);
                        key.w[i] = w;
                        if matches!(col, KeyCol::SrcAddr | KeyCol::DstAddr) && slot < 2 {
                            key.m[slot] = m;
                            slot += 1;
                        }
                    } else {
                        key.w[i] = col.scalar(flow);
                    }
                }
                keys.push(key);
            }
        }
    }

    /// Inner distinct-set value for the count kinds.
    pub(crate) fn distinct_value(&self, flow: &FlowRecord) -> Option<u32> {
        self.distinct.map(|col| match col {
            KeyCol::SrcAddr => u32::from(flow.srcaddr),
            KeyCol::DstAddr => u32::from(flow.dstaddr),
            other => other.scalar(flow),
        })
    }

    /// Render one stored key into display cells.
    pub(crate) fn cells(&self, key: &StatKey, report: &Report) -> Vec<KeyCell> {
        let mut cells = Vec::with_capacity(self.columns.len());
        let mut slot = 0;
        for (i, col) in self.columns.iter().enumerate() {
            let cell = match col {
                KeyCol::SrcAddr | KeyCol::EitherAddr => {
                    let mode = report.src_addr_mode;
                    let mask = (mode != AddrMode::Address).then(|| key.m[slot.min(1)]);
                    slot += 1;
                    KeyCell::Addr {
                        addr: key.w[i],
                        mask,
                    }
                }
                KeyCol::DstAddr => {
                    let mode = report.dst_addr_mode;
                    let mask = (mode != AddrMode::Address).then(|| key.m[slot.min(1)]);
                    slot += 1;
                    KeyCell::Addr {
                        addr: key.w[i],
                        mask,
                    }
                }
                KeyCol::NextHop | KeyCol::Exporter => KeyCell::Addr {
                    addr: key.w[i],
                    mask: None,
                },
                KeyCol::StartTime | KeyCol::EndTime => KeyCell::Time(key.w[i]),
                other => KeyCell::Num {
                    value: key.w[i].into(),
                    class: other.sym_class(),
                },
            };
            cells.push(cell);
        }
        cells
    }
}

fn addr_key(addr: u32, mask_len: u8, mode: AddrMode) -> (u32, u8) {
    match mode {
        AddrMode::Address => (addr, 0),
        AddrMode::PrefixLen => (addr, mask_len),
        AddrMode::PrefixMask => (addr & prefix_mask(mask_len), mask_len),
    }
}

fn summary(detail: bool) -> KindDescr {
    let (name, form, allowed, default) = if detail {
        (
            "summary-detail",
            FormKind::SummaryDetail,
            FieldSet::INDEX
                .with(FieldSet::KEY1)
                .with(FieldSet::KEY2)
                .with(FieldSet::FLOWS),
            FieldSet::KEY1.with(FieldSet::KEY2).with(FieldSet::FLOWS),
        )
    } else {
        (
            "summary-counters",
            FormKind::SummaryCounters,
            FieldSet::FIRST
                .with(FieldSet::LAST)
                .with(FieldSet::FLOWS)
                .with(FieldSet::OCTETS)
                .with(FieldSet::PACKETS)
                .with(FieldSet::DURATION)
                .with(FieldSet::RATES)
                .with(FieldSet::FRECS),
            FieldSet::FLOWS
                .with(FieldSet::OCTETS)
                .with(FieldSet::PACKETS)
                .with(FieldSet::DURATION),
        )
    };
    KindDescr {
        name,
        form,
        storage: StorageKind::Index { domain: 1 },
        columns: Vec::new(),
        required: BASE_REQUIRED,
        allowed_fields: allowed,
        default_fields: default,
        allowed_options: ALL_OPTIONS,
        distinct: None,
    }
}

fn linear() -> KindDescr {
    KindDescr {
        name: "linear-interpolated-flows-octets-packets",
        form: FormKind::Linear,
        storage: StorageKind::Hash { h_size: 65536 },
        columns: vec![KeyCol::StartTime],
        required: BASE_REQUIRED.with(FlowFields::UNIX_NSECS),
        allowed_fields: FieldSet::INDEX
            .with(FieldSet::KEY1)
            .with(FieldSet::FLOWS)
            .with(FieldSet::OCTETS)
            .with(FieldSet::PACKETS),
        default_fields: FieldSet::KEY1
            .with(FieldSet::FLOWS)
            .with(FieldSet::OCTETS)
            .with(FieldSet::PACKETS),
        allowed_options: ALL_OPTIONS,
        distinct: None,
    }
}

static KINDS: LazyLock<Vec<KindDescr>> = LazyLock::new(build_kinds);

fn build_kinds() -> Vec<KindDescr> {
    use KeyCol::*;

    let hash = StorageKind::Hash { h_size: 65536 };
    let idx = |domain| StorageKind::Index { domain };

    vec![
        summary(true),
        summary(false),
        keyed("packet-size", idx(65536), &[PacketSize]).alias(FieldSet::GENERIC),
        keyed("octets", hash, &[Octets]).alias(FieldSet::GENERIC),
        keyed("packets", hash, &[Packets]).alias(FieldSet::GENERIC),
        keyed("ip-source-port", idx(65536), &[SrcPort]),
        keyed("ip-destination-port", idx(65536), &[DstPort]),
        keyed("ip-source/destination-port", hash, &[SrcPort, DstPort]),
        keyed("bps", hash, &[Bps]).alias(FieldSet::BPS.with(FieldSet::GENERIC)),
        keyed("pps", hash, &[Pps]).alias(FieldSet::PPS.with(FieldSet::GENERIC)),
        keyed("ip-destination-address-type", idx(2), &[AddrType]),
        keyed("ip-protocol", idx(256), &[Protocol]),
        keyed("ip-tos", idx(256), &[Tos]),
        keyed("ip-next-hop-address", hash, &[NextHop]),
        keyed("ip-source-address", hash, &[SrcAddr]),
        keyed("ip-destination-address", hash, &[DstAddr]),
        keyed("ip-source/destination-address", hash, &[SrcAddr, DstAddr]),
        keyed("ip-exporter-address", hash, &[Exporter]),
        keyed("input-interface", idx(65536), &[Input]),
        keyed("output-interface", idx(65536), &[Output]),
        keyed("input/output-interface", hash, &[Input, Output]),
        keyed("engine-id", idx(256), &[EngineId]),
        keyed("engine-type", idx(256), &[EngineType]),
        keyed("source-tag", hash, &[SrcTag]),
        keyed("destination-tag", hash, &[DstTag]),
        keyed("source/destination-tag", hash, &[SrcTag, DstTag]),
        keyed("ip-source-address/source-tag", hash, &[SrcAddr, SrcTag]),
        keyed("ip-source-address/destination-tag", hash, &[SrcAddr, DstTag]),
        keyed("ip-destination-address/source-tag", hash, &[DstAddr, SrcTag]),
        keyed(
            "ip-destination-address/destination-tag",
            hash,
            &[DstAddr, DstTag],
        ),
        keyed(
            "ip-source-address/source/destination-tag",
            hash,
            &[SrcAddr, SrcTag, DstTag],
        ),
        keyed(
            "ip-destination-address/source/destination-tag",
            hash,
            &[DstAddr, SrcTag, DstTag],
        ),
        keyed("ip-source-address/ip-source-port", hash, &[SrcAddr, SrcPort]),
        keyed(
            "ip-source-address/ip-destination-port",
            hash,
            &[SrcAddr, DstPort],
        ),
        keyed(
            "ip-source-address/ip-source/destination-port",
            hash,
            &[SrcAddr, SrcPort, DstPort],
        ),
        keyed(
            "ip-destination-address/ip-source-port",
            hash,
            &[DstAddr, SrcPort],
        ),
        keyed(
            "ip-destination-address/ip-destination-port",
            hash,
            &[DstAddr, DstPort],
        ),
        keyed(
            "ip-destination-address/ip-source/destination-port",
            hash,
            &[DstAddr, SrcPort, DstPort],
        ),
        keyed(
            "ip-source/destination-address/ip-source-port",
            hash,
            &[SrcAddr, DstAddr, SrcPort],
        ),
        keyed(
            "ip-source/destination-address/ip-destination-port",
            hash,
            &[SrcAddr, DstAddr, DstPort],
        ),
        keyed(
            "ip-source/destination-address/ip-source/destination-port",
            hash,
            &[SrcAddr, DstAddr, SrcPort, DstPort],
        ),
        keyed("ip-source-address/input-interface", hash, &[SrcAddr, Input]),
        keyed("ip-source-address/output-interface", hash, &[SrcAddr, Output]),
        keyed(
            "ip-source-address/input/output-interface",
            hash,
            &[SrcAddr, Input, Output],
        ),
        keyed(
            "ip-destination-address/input-interface",
            hash,
            &[DstAddr, Input],
        ),
        keyed(
            "ip-destination-address/output-interface",
            hash,
            &[DstAddr, Output],
        ),
        keyed(
            "ip-destination-address/input/output-interface",
            hash,
            &[DstAddr, Input, Output],
        ),
        keyed(
            "ip-source/destination-address/input-interface",
            hash,
            &[SrcAddr, DstAddr, Input],
        ),
        keyed(
            "ip-source/destination-address/output-interface",
            hash,
            &[SrcAddr, DstAddr, Output],
        ),
        keyed(
            "ip-source/destination-address/input/output-interface",
            hash,
            &[SrcAddr, DstAddr, Input, Output],
        ),
        keyed("ip-next-hop-address/input-interface", hash, &[NextHop, Input]),
        keyed(
            "ip-next-hop-address/output-interface",
            hash,
            &[NextHop, Output],
        ),
        keyed(
            "ip-next-hop-address/input/output-interface",
            hash,
            &[NextHop, Input, Output],
        ),
        keyed("source-as", idx(65536), &[SrcAs]),
        keyed("destination-as", idx(65536), &[DstAs]),
        keyed("source/destination-as", hash, &[SrcAs, DstAs]),
        keyed("ip-source-address/source-as", hash, &[SrcAddr, SrcAs]),
        keyed("ip-source-address/destination-as", hash, &[SrcAddr, DstAs]),
        keyed(
            "ip-source-address/source/destination-as",
            hash,
            &[SrcAddr, SrcAs, DstAs],
        ),
        keyed("ip-destination-address/source-as", hash, &[DstAddr, SrcAs]),
        keyed(
            "ip-destination-address/destination-as",
            hash,
            &[DstAddr, DstAs],
        ),
        keyed(
            "ip-destination-address/source/destination-as",
            hash,
            &[DstAddr, SrcAs, DstAs],
        ),
        keyed(
            "ip-source/destination-address/source-as",
            hash,
            &[SrcAddr, DstAddr, SrcAs],
        ),
        keyed(
            "ip-source/destination-address/destination-as",
            hash,
            &[SrcAddr, DstAddr, DstAs],
        ),
        keyed(
            "ip-source/destination-address/source/destination-as",
            hash,
            &[SrcAddr, DstAddr, SrcAs, DstAs],
        ),
        keyed("input-interface/source-as", hash, &[Input, SrcAs]),
        keyed("input-interface/destination-as", hash, &[Input, DstAs]),
        keyed("output-interface/source-as", hash, &[Output, SrcAs]),
        keyed("output-interface/destination-as", hash, &[Output, DstAs]),
        keyed("ip-address", hash, &[EitherAddr]),
        keyed("ip-port", idx(65536), &[EitherPort]),
        keyed("ip-source-address-destination-count", hash, &[SrcAddr])
            .with_distinct(DstAddr),
        keyed("ip-destination-address-source-count", hash, &[DstAddr])
            .with_distinct(SrcAddr),
        keyed(
            "ip-source/destination-address/ip-protocol/ip-tos/ip-source/destination-port",
            hash,
            &[SrcAddr, DstAddr, Protocol, Tos, SrcPort, DstPort],
        ),
        linear(),
        keyed("first", hash, &[StartTime]).alias(FieldSet::GENERIC),
        keyed("last", hash, &[EndTime]).alias(FieldSet::GENERIC),
        keyed("duration", hash, &[Duration]).alias(FieldSet::GENERIC),
    ]
}

/// A registered report kind.
///
/// Kinds resolve by their configuration label; the set is fixed at build
/// time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportKind(u16);

impl ReportKind {
    /// Look up a kind by its configuration label.
    pub fn from_name(name: &str) -> Option<ReportKind> {
        KINDS
            .iter()
            .position(|k| k.name == name)
            .map(|i| ReportKind(i as u16))
    }

    pub fn name(self) -> &'static str {
        self.descr().name
    }

    pub(crate) fn descr(self) -> &'static KindDescr {
        &KINDS[self.0 as usize]
    }

    /// All registered kinds, in registration order.
    pub fn all() -> impl Iterator<Item = ReportKind> {
        (0..KINDS.len() as u16).map(ReportKind)
    }
}

impl Serialize for ReportKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_has_the_full_catalogue() {
        assert_eq!(KINDS.len(), 78);
        // anchors at both ends of the table
        assert_eq!(KINDS[0].name, "summary-detail");
        assert_eq!(KINDS[1].name, "summary-counters");
        assert_eq!(KINDS[77].name, "duration");
        assert_eq!(KINDS[76].name, "last");

        // labels are unique
        let mut names: Vec<&str> = KINDS.iter().map(|k| k.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), 78);
    }

    #[test]
    fn lookup_by_label() {
        let kind = ReportKind::from_name("ip-source-port").unwrap();
        assert_eq!(kind.name(), "ip-source-port");
        assert!(matches!(
            kind.descr().storage,
            StorageKind::Index { domain: 65536 }
        ));
        assert!(ReportKind::from_name("no-such-kind").is_none());
    }

    #[test]
    fn six_tuple_kind_keys_every_column() {
        let kind = ReportKind::from_name(
            "ip-source/destination-address/ip-protocol/ip-tos/ip-source/destination-port",
        )
        .unwrap();
        let descr = kind.descr();
        assert_eq!(descr.columns.len(), 6);
        assert!(descr.allowed_fields.contains(FieldSet::KEY6));
        assert!(descr.required.contains(
            FlowFields::SRCADDR
                .with(FlowFields::DSTADDR)
                .with(FlowFields::PROT)
                .with(FlowFields::TOS)
                .with(FlowFields::SRCPORT)
                .with(FlowFields::DSTPORT)
        ));
    }

    #[test]
    fn count_kind_carries_count_column() {
        let kind = ReportKind::from_name("ip-source-address-destination-count").unwrap();
        let descr = kind.descr();
        assert_eq!(descr.distinct, Some(KeyCol::DstAddr));
        assert!(descr.allowed_fields.contains(FieldSet::COUNT));
        assert!(descr.required.contains(FlowFields::DSTADDR));
    }

    #[test]
    fn prefix_mask_mode_clears_host_bits() {
        use std::net::Ipv4Addr;

        let kind = ReportKind::from_name("ip-source-address").unwrap();
        let mut report = Report::new("src", kind);
        report.src_addr_mode = AddrMode::PrefixMask;

        let flow = FlowRecord {
            srcaddr: Ipv4Addr::new(10, 1, 2, 3),
            src_mask: 16,
            ..FlowRecord::default()
        };
        let mut keys = KeyVec::default();
        kind.descr().extract(&flow, &report, &mut keys);
        let key = keys.iter().next().unwrap();
        assert_eq!(key.w[0], u32::from(Ipv4Addr::new(10, 1, 0, 0)));
        assert_eq!(key.m[0], 16);
        assert_eq!(key.w[0] & !prefix_mask(16), 0);
    }

    #[test]
    fn either_endpoint_kinds_extract_two_keys() {
        use std::net::Ipv4Addr;

        let kind = ReportKind::from_name("ip-address").unwrap();
        let report = Report::new("both", kind);
        let flow = FlowRecord {
            srcaddr: Ipv4Addr::new(10, 0, 0, 1),
            dstaddr: Ipv4Addr::new(10, 0, 0, 2),
            ..FlowRecord::default()
        };
        let mut keys = KeyVec::default();
        kind.descr().extract(&flow, &report, &mut keys);
        let got: Vec<u32> = keys.iter().map(|k| k.w[0]).collect();
        assert_eq!(
            got,
            vec![
                u32::from(Ipv4Addr::new(10, 0, 0, 1)),
                u32::from(Ipv4Addr::new(10, 0, 0, 2))
            ]
        );
    }
}
