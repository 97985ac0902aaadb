//! Report aggregator family.
//!
//! A report names one of the registered kinds plus the knobs that shape its
//! accumulation and output: an optional filter, a counter scale, scoped tag
//! masks, address display modes, and any number of output sinks. Kinds share
//! one pipeline; a kind contributes its key columns, storage choice, and
//! column constraints through the kind descriptor table.

mod keyed;
mod kinds;
mod linear;
mod summary;

pub use kinds::ReportKind;

use crate::flow::{FlowFields, FlowRecord};
use crate::rate::RateStats;
use crate::symbols::SymClass;

use serde::Serialize;

use std::fmt;

/// How address key columns are keyed and displayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum AddrMode {
    /// Full address; the prefix length is neither keyed nor shown.
    #[default]
    Address,
    /// Full address with the prefix length shown alongside.
    PrefixLen,
    /// Host bits cleared; keys aggregate per prefix.
    PrefixMask,
}

impl AddrMode {
    pub fn parse(token: &str) -> Option<AddrMode> {
        match token {
            "address" => Some(AddrMode::Address),
            "prefix-len" => Some(AddrMode::PrefixLen),
            "prefix-mask" => Some(AddrMode::PrefixMask),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AddrMode::Address => "address",
            AddrMode::PrefixLen => "prefix-len",
            AddrMode::PrefixMask => "prefix-mask",
        }
    }
}

/// Network mask for a prefix length in bits.
pub fn prefix_mask(len: u8) -> u32 {
    match len {
        0 => 0,
        n if n >= 32 => u32::MAX,
        n => ((1u32 << n) - 1) << (32 - n),
    }
}

/// Output column selection, also used to name sort fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FieldSet(u32);

macro_rules! field_bits {
    ($($name:ident = $bit:expr;)*) => {
        impl FieldSet {
            pub const NONE: FieldSet = FieldSet(0);
            $(pub const $name: FieldSet = FieldSet(1 << $bit);)*
        }
    };
}

field_bits! {
    INDEX = 0;
    FIRST = 1;
    LAST = 2;
    KEY1 = 3;
    KEY2 = 4;
    KEY3 = 5;
    KEY4 = 6;
    KEY5 = 7;
    KEY6 = 8;
    FLOWS = 9;
    OCTETS = 10;
    PACKETS = 11;
    DURATION = 12;
    COUNT = 13;
    AVG_BPS = 14;
    MIN_BPS = 15;
    MAX_BPS = 16;
    AVG_PPS = 17;
    MIN_PPS = 18;
    MAX_PPS = 19;
    FRECS = 20;
    PPS = 21;
    BPS = 22;
    GENERIC = 23;
    OTHER = 24;
}

impl FieldSet {
    pub const RATES: FieldSet = FieldSet::AVG_BPS
        .with(FieldSet::MIN_BPS)
        .with(FieldSet::MAX_BPS)
        .with(FieldSet::AVG_PPS)
        .with(FieldSet::MIN_PPS)
        .with(FieldSet::MAX_PPS);

    const NAMES: &'static [(FieldSet, &'static str)] = &[
        (FieldSet::INDEX, "index"),
        (FieldSet::FIRST, "first"),
        (FieldSet::LAST, "last"),
        (FieldSet::KEY1, "key"),
        (FieldSet::KEY2, "key2"),
        (FieldSet::KEY3, "key3"),
        (FieldSet::KEY4, "key4"),
        (FieldSet::KEY5, "key5"),
        (FieldSet::KEY6, "key6"),
        (FieldSet::FLOWS, "flows"),
        (FieldSet::OCTETS, "octets"),
        (FieldSet::PACKETS, "packets"),
        (FieldSet::DURATION, "duration"),
        (FieldSet::COUNT, "count"),
        (FieldSet::AVG_BPS, "avg-bps"),
        (FieldSet::MIN_BPS, "min-bps"),
        (FieldSet::MAX_BPS, "max-bps"),
        (FieldSet::AVG_PPS, "avg-pps"),
        (FieldSet::MIN_PPS, "min-pps"),
        (FieldSet::MAX_PPS, "max-pps"),
        (FieldSet::FRECS, "frecs"),
        (FieldSet::PPS, "pps"),
        (FieldSet::BPS, "bps"),
        (FieldSet::GENERIC, "generic"),
        (FieldSet::OTHER, "other"),
    ];

    pub const fn with(self, other: FieldSet) -> FieldSet {
        FieldSet(self.0 | other.0)
    }

    pub const fn contains(self, other: FieldSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: FieldSet) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, other: FieldSet) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: FieldSet) {
        self.0 &= !other.0;
    }

    /// Fields present here but not in `allowed`.
    pub fn excess(self, allowed: FieldSet) -> FieldSet {
        FieldSet(self.0 & !allowed.0)
    }

    /// Single field for a bare name: `key`, `key1`, `flows`, `avg-bps`, ...
    pub fn from_name(name: &str) -> Option<FieldSet> {
        if name == "key1" {
            return Some(FieldSet::KEY1);
        }
        Self::NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(f, _)| *f)
    }

    pub fn names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(f, _)| self.contains(*f))
            .map(|(_, n)| *n)
            .collect()
    }
}

impl fmt::Display for FieldSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for name in self.names() {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "+{name}")?;
            first = false;
        }
        Ok(())
    }
}

/// Per-sink option flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct OptionSet(u32);

impl OptionSet {
    pub const NONE: OptionSet = OptionSet(0);
    pub const PERCENT: OptionSet = OptionSet(1 << 0);
    pub const NAMES: OptionSet = OptionSet(1 << 1);
    pub const HEADER: OptionSet = OptionSet(1 << 2);
    pub const XHEADER: OptionSet = OptionSet(1 << 3);
    pub const TOTALS: OptionSet = OptionSet(1 << 4);

    const LABELS: &'static [(OptionSet, &'static str)] = &[
        (OptionSet::PERCENT, "percent-total"),
        (OptionSet::NAMES, "names"),
        (OptionSet::HEADER, "header"),
        (OptionSet::XHEADER, "xheader"),
        (OptionSet::TOTALS, "totals"),
    ];

    pub const fn with(self, other: OptionSet) -> OptionSet {
        OptionSet(self.0 | other.0)
    }

    pub const fn contains(self, other: OptionSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: OptionSet) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: OptionSet) {
        self.0 &= !other.0;
    }

    pub fn excess(self, allowed: OptionSet) -> OptionSet {
        OptionSet(self.0 & !allowed.0)
    }

    pub fn from_name(name: &str) -> Option<OptionSet> {
        Self::LABELS
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(o, _)| *o)
    }

    pub fn names(self) -> Vec<&'static str> {
        Self::LABELS
            .iter()
            .filter(|(o, _)| self.contains(*o))
            .map(|(_, n)| *n)
            .collect()
    }
}

impl fmt::Display for OptionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for name in self.names() {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "+{name}")?;
            first = false;
        }
        Ok(())
    }
}

/// Sort selection for one sink: a single field plus direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SortSpec {
    pub field: FieldSet,
    pub descending: bool,
}

impl SortSpec {
    /// Parse `+field` (ascending) or `-field` (descending).
    pub fn parse(token: &str) -> Option<SortSpec> {
        let (descending, name) = match token.as_bytes().first()? {
            b'+' => (false, &token[1..]),
            b'-' => (true, &token[1..]),
            _ => return None,
        };
        Some(SortSpec {
            field: FieldSet::from_name(name)?,
            descending,
        })
    }
}

/// Sink output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum SinkFormat {
    #[default]
    Ascii,
    Binary,
}

/// Which instant seeds path expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum TimeAnchor {
    #[default]
    Now,
    Start,
    End,
    Mid,
}

impl TimeAnchor {
    pub fn parse(token: &str) -> Option<TimeAnchor> {
        match token {
            "now" => Some(TimeAnchor::Now),
            "start" => Some(TimeAnchor::Start),
            "end" => Some(TimeAnchor::End),
            "mid" => Some(TimeAnchor::Mid),
            _ => None,
        }
    }
}

/// One output destination for a report.
#[derive(Debug, Clone, Serialize)]
pub struct OutputSink {
    pub format: SinkFormat,
    pub sort: Option<SortSpec>,
    pub fields: FieldSet,
    pub options: OptionSet,
    /// Data row cap; 0 means unlimited.
    pub records: u64,
    /// Running-total comment every `tally` rows; 0 disables.
    pub tally: u64,
    /// Literal path, `strftime`-expanded; a leading `|` spawns a pipeline.
    /// `None` writes to stdout.
    pub path: Option<String>,
    pub time_anchor: TimeAnchor,
}

impl OutputSink {
    pub(crate) fn with_default_fields(fields: FieldSet) -> OutputSink {
        OutputSink {
            format: SinkFormat::Ascii,
            sort: None,
            fields,
            options: OptionSet::NONE,
            records: 0,
            tally: 0,
            path: None,
            time_anchor: TimeAnchor::Now,
        }
    }
}

/// Named report configuration.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub name: String,
    pub kind: ReportKind,
    /// Filter name, resolved through the policy provider at load.
    pub filter: Option<String>,
    /// Counter scale applied to octets and packets at accumulation; 0 and 1
    /// both mean unscaled.
    pub scale: u32,
    /// AND-masks applied to `src_tag`/`dst_tag` for this report only.
    pub tag_mask: Option<(u32, u32)>,
    pub src_addr_mode: AddrMode,
    pub dst_addr_mode: AddrMode,
    pub sinks: Vec<OutputSink>,
}

impl Report {
    pub fn new(name: &str, kind: ReportKind) -> Report {
        Report {
            name: name.to_string(),
            kind,
            filter: None,
            scale: 0,
            tag_mask: None,
            src_addr_mode: AddrMode::Address,
            dst_addr_mode: AddrMode::Address,
            sinks: Vec::new(),
        }
    }

    /// Flow fields this report reads, including the prefix-length fields its
    /// address display modes imply and the tag fields a tag mask touches.
    pub fn required_fields(&self) -> FlowFields {
        let descr = self.kind.descr();
        let mut required = descr.required;
        if self.src_addr_mode != AddrMode::Address && descr.keys_src_addr() {
            required |= FlowFields::SRC_MASK;
        }
        if self.dst_addr_mode != AddrMode::Address && descr.keys_dst_addr() {
            required |= FlowFields::DST_MASK;
        }
        if self.tag_mask.is_some() {
            required |= FlowFields::SRC_TAG | FlowFields::DST_TAG;
        }
        required
    }

    /// Whether any sink consumes per-entry rate columns.
    pub(crate) fn wants_rates(&self) -> bool {
        self.sinks.iter().any(|sink| {
            sink.fields.intersects(FieldSet::RATES)
                || sink
                    .sort
                    .map(|s| s.field.intersects(FieldSet::RATES))
                    .unwrap_or(false)
        })
    }
}

/// Aggregation key: up to six 32-bit words plus two prefix lengths.
///
/// Extractors zero the words they do not use, so whole-struct equality is
/// key equality for every kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct StatKey {
    pub w: [u32; 6],
    pub m: [u8; 2],
}

impl StatKey {
    /// Trivial XOR/fold mixer; tables mask the result into their bucket
    /// range.
    pub fn fold(&self) -> u32 {
        let mut h = self.w[0];
        for word in &self.w[1..] {
            h ^= *word;
        }
        h ^= u32::from(self.m[0]) | (u32::from(self.m[1]) << 8);
        h ^ (h >> 16)
    }
}

/// Keys extracted from one flow; the two-endpoint kinds yield two.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct KeyVec {
    keys: [StatKey; 2],
    len: usize,
}

impl KeyVec {
    pub(crate) fn push(&mut self, key: StatKey) {
        self.keys[self.len] = key;
        self.len += 1;
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &StatKey> {
        self.keys[..self.len].iter()
    }
}

/// Per-bucket counters.
#[derive(Debug, Clone, Serialize)]
pub struct StatEntry {
    pub flows: u64,
    pub octets: u64,
    pub packets: u64,
    /// Sum of flow lifetimes, milliseconds.
    pub duration: u64,
    /// Flows that contributed to the rate aggregates.
    pub recs: u64,
    /// Earliest wallclock second seen.
    pub time_start: u32,
    /// Latest wallclock second seen.
    pub time_end: u32,
    pub rates: Option<RateStats>,
    #[serde(skip)]
    pub(crate) distinct: Option<Box<crate::chash::CountingHash<u32, ()>>>,
}

impl StatEntry {
    pub(crate) fn new(with_rates: bool, with_distinct: bool) -> StatEntry {
        StatEntry {
            flows: 0,
            octets: 0,
            packets: 0,
            duration: 0,
            recs: 0,
            time_start: u32::MAX,
            time_end: 0,
            rates: with_rates.then(RateStats::default),
            distinct: with_distinct
                .then(|| Box::new(crate::chash::CountingHash::new(256, 64))),
        }
    }

    pub(crate) fn add(&mut self, m: &FlowMeasure) {
        self.flows += m.flows;
        self.octets += m.octets;
        self.packets += m.packets;
        self.duration += u64::from(m.duration_ms);
        if self.time_start > m.wall_first {
            self.time_start = m.wall_first;
        }
        if self.time_end < m.wall_last {
            self.time_end = m.wall_last;
        }
        if let Some((bps, pps)) = m.rate {
            self.recs += 1;
            if let Some(rates) = self.rates.as_mut() {
                rates.add_sample(bps, pps);
            }
        }
    }

    /// Distinct inner-set cardinality, for the count kinds.
    pub fn count(&self) -> u64 {
        self.distinct
            .as_ref()
            .map(|set| set.entries() as u64)
            .unwrap_or(0)
    }
}

/// Report-wide totals.
#[derive(Debug, Clone, Serialize)]
pub struct ReportTotals {
    pub flows: u64,
    pub octets: u64,
    pub packets: u64,
    pub duration: u64,
    /// Flows that contributed to rates.
    pub recs: u64,
    /// Flows skipped for rate accounting (zero duration or zero packets).
    pub ignores: u64,
    /// Sum of distinct counts, for the count kinds.
    pub count: u64,
    pub time_start: u32,
    pub time_end: u32,
    pub rates: RateStats,
}

impl Default for ReportTotals {
    fn default() -> Self {
        ReportTotals {
            flows: 0,
            octets: 0,
            packets: 0,
            duration: 0,
            recs: 0,
            ignores: 0,
            count: 0,
            time_start: u32::MAX,
            time_end: 0,
            rates: RateStats::default(),
        }
    }
}

impl ReportTotals {
    pub(crate) fn add(&mut self, m: &FlowMeasure) {
        self.flows += m.flows;
        self.octets += m.octets;
        self.packets += m.packets;
        self.duration += u64::from(m.duration_ms);
        if self.time_start > m.wall_first {
            self.time_start = m.wall_first;
        }
        if self.time_end < m.wall_last {
            self.time_end = m.wall_last;
        }
        match m.rate {
            Some((bps, pps)) => {
                self.recs += 1;
                self.rates.add_sample(bps, pps);
            }
            None => self.ignores += 1,
        }
    }
}

/// One flow reduced to the quantities every form accumulates.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FlowMeasure {
    pub flows: u64,
    pub octets: u64,
    pub packets: u64,
    pub duration_ms: u32,
    pub wall_first: u32,
    pub wall_last: u32,
    /// `(bps, pps)`; absent when the flow cannot contribute to rates.
    pub rate: Option<(f64, f64)>,
}

impl FlowMeasure {
    pub(crate) fn of(flow: &FlowRecord, scale: u32) -> FlowMeasure {
        let scale = u64::from(scale.max(1));
        let octets = flow.d_octets * scale;
        let packets = flow.d_pkts * scale;
        let duration_ms = flow.duration_ms();
        let rate = if packets > 0 {
            RateStats::sample(octets, packets, duration_ms)
        } else {
            None
        };
        FlowMeasure {
            flows: flow.d_flows,
            octets,
            packets,
            duration_ms,
            wall_first: flow.wall_first().secs,
            wall_last: flow.wall_last().secs,
            rate,
        }
    }
}

/// Counter value: integral for ordinary kinds, fractional for the
/// interpolating kind.
#[derive(Debug, Clone, Copy, Serialize)]
pub enum Cv {
    U(u64),
    F(f64),
}

impl Cv {
    pub fn as_f64(self) -> f64 {
        match self {
            Cv::U(v) => v as f64,
            Cv::F(v) => v,
        }
    }
}

impl fmt::Display for Cv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cv::U(v) => write!(f, "{v}"),
            Cv::F(v) => write!(f, "{v:.6}"),
        }
    }
}

/// One rendered key column.
#[derive(Debug, Clone, Serialize)]
pub enum KeyCell {
    /// IPv4 address, with the prefix length when the display mode shows it.
    Addr { addr: u32, mask: Option<u8> },
    /// Integer key, symbol-substitutable per its class.
    Num { value: u64, class: SymClass },
    /// Wallclock seconds.
    Time(u32),
    /// Fixed label (histogram names).
    Label(&'static str),
}

/// One output row handed to the formatter.
#[derive(Debug, Clone, Serialize)]
pub struct RowData {
    pub cells: Vec<KeyCell>,
    pub flows: Cv,
    pub octets: Cv,
    pub packets: Cv,
    pub duration: Cv,
    pub recs: u64,
    pub first: u32,
    pub last: u32,
    pub rates: Option<RateStats>,
    pub count: Option<u64>,
}

/// Lifecycle hooks shared by every report kind.
///
/// A form is created per definition and interval, accumulates flows, has its
/// derived values computed once at the end, and then dumps through each of
/// its report's sinks.
pub trait ReportForm: Send {
    fn accum(&mut self, flow: &FlowRecord, report: &Report);

    /// Finalize derived values (averages, distinct counts).
    fn calc(&mut self);

    fn totals(&self) -> &ReportTotals;

    /// Aggregate bucket count.
    fn entries(&self) -> u64;

    /// Build or drop the sort order subsequent row iteration follows.
    fn sort(&mut self, spec: Option<&SortSpec>);

    /// Visit rows in the current order until exhausted or `cb` returns
    /// `false`.
    fn for_each_row(&self, report: &Report, cb: &mut dyn FnMut(RowData) -> bool);
}

/// Instantiate the form for a report's kind.
pub fn new_form(report: &Report) -> Box<dyn ReportForm> {
    use kinds::FormKind;

    match report.kind.descr().form {
        FormKind::Keyed => Box::new(keyed::KeyedForm::new(report)),
        FormKind::SummaryDetail => Box::new(summary::SummaryForm::new(true)),
        FormKind::SummaryCounters => Box::new(summary::SummaryForm::new(false)),
        FormKind::Linear => Box::new(linear::LinearForm::new()),
    }
}
