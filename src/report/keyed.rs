//! Shared accumulation pipeline for every keyed report kind.

use super::kinds::{KindDescr, StorageKind};
use super::{
    Cv, FieldSet, FlowMeasure, KeyVec, Report, ReportForm, ReportTotals, RowData, SortSpec,
    StatEntry, StatKey,
};
use crate::buckets::IndexTable;
use crate::chash::{CountingHash, SortVal};
use crate::flow::FlowRecord;

const RECORDS_PER_CHUNK: usize = 256;

enum Store {
    Hash(CountingHash<StatKey, StatEntry>),
    Index(IndexTable<StatEntry>),
}

/// Generic keyed aggregation: extract keys, bump per-bucket counters, track
/// report totals, optionally count distinct inner values.
pub(crate) struct KeyedForm {
    descr: &'static KindDescr,
    store: Store,
    totals: ReportTotals,
    with_rates: bool,
}

impl KeyedForm {
    pub(crate) fn new(report: &Report) -> KeyedForm {
        let descr = report.kind.descr();
        let store = match descr.storage {
            StorageKind::Hash { h_size } => {
                Store::Hash(CountingHash::new(h_size, RECORDS_PER_CHUNK))
            }
            StorageKind::Index { domain } => Store::Index(IndexTable::new(domain)),
        };
        KeyedForm {
            descr,
            store,
            totals: ReportTotals::default(),
            with_rates: report.wants_rates(),
        }
    }

    fn row(&self, key: &StatKey, entry: &StatEntry, report: &Report) -> RowData {
        RowData {
            cells: self.descr.cells(key, report),
            flows: Cv::U(entry.flows),
            octets: Cv::U(entry.octets),
            packets: Cv::U(entry.packets),
            duration: Cv::U(entry.duration),
            recs: entry.recs,
            first: entry.time_start,
            last: entry.time_end,
            rates: entry.rates,
            count: self.descr.distinct.is_some().then(|| entry.count()),
        }
    }
}

/// Comparand for one entry under a sort field.
fn sort_val(key: &StatKey, entry: &StatEntry, field: FieldSet) -> SortVal {
    if field == FieldSet::FLOWS {
        SortVal::U64(entry.flows)
    } else if field == FieldSet::OCTETS {
        SortVal::U64(entry.octets)
    } else if field == FieldSet::PACKETS {
        SortVal::U64(entry.packets)
    } else if field == FieldSet::DURATION {
        SortVal::U64(entry.duration)
    } else if field == FieldSet::COUNT {
        SortVal::U64(entry.count())
    } else if field == FieldSet::FRECS {
        SortVal::U64(entry.recs)
    } else if field == FieldSet::FIRST {
        SortVal::U32(entry.time_start)
    } else if field == FieldSet::LAST {
        SortVal::U32(entry.time_end)
    } else if field == FieldSet::AVG_BPS {
        SortVal::F64(entry.rates.map(|r| r.avg_bps).unwrap_or(0.0))
    } else if field == FieldSet::MIN_BPS {
        SortVal::F64(entry.rates.map(|r| r.min_bps).unwrap_or(0.0))
    } else if field == FieldSet::MAX_BPS {
        SortVal::F64(entry.rates.map(|r| r.max_bps).unwrap_or(0.0))
    } else if field == FieldSet::AVG_PPS {
        SortVal::F64(entry.rates.map(|r| r.avg_pps).unwrap_or(0.0))
    } else if field == FieldSet::MIN_PPS {
        SortVal::F64(entry.rates.map(|r| r.min_pps).unwrap_or(0.0))
    } else if field == FieldSet::MAX_PPS {
        SortVal::F64(entry.rates.map(|r| r.max_pps).unwrap_or(0.0))
    } else {
        SortVal::U32(key.w[key_index(field)])
    }
}

fn key_index(field: FieldSet) -> usize {
    const KEYS: [FieldSet; 6] = [
        FieldSet::KEY1,
        FieldSet::KEY2,
        FieldSet::KEY3,
        FieldSet::KEY4,
        FieldSet::KEY5,
        FieldSet::KEY6,
    ];
    KEYS.iter().position(|k| *k == field).unwrap_or(0)
}

impl ReportForm for KeyedForm {
    fn accum(&mut self, flow: &FlowRecord, report: &Report) {
        let m = FlowMeasure::of(flow, report.scale);
        self.totals.add(&m);

        let mut keys = KeyVec::default();
        self.descr.extract(flow, report, &mut keys);
        let distinct_value = self.descr.distinct_value(flow);
        let with_rates = self.with_rates;
        let with_distinct = self.descr.distinct.is_some();

        for key in keys.iter() {
            let entry = match &mut self.store {
                Store::Hash(table) => table.update(*key, key.fold(), || {
                    StatEntry::new(with_rates, with_distinct)
                }),
                Store::Index(table) => table.entry_mut(key.w[0] as usize, || {
                    StatEntry::new(with_rates, with_distinct)
                }),
            };
            entry.add(&m);

            if let (Some(value), Some(set)) = (distinct_value, entry.distinct.as_mut()) {
                // inner tables are 256 buckets; collapse the folded hash the
                // same way the upstream two-level reports do
                let folded = value ^ (value >> 16);
                let inner = (folded >> 8) ^ (folded & 0xff);
                set.update(value, inner, || ());
            }
        }
    }

    fn calc(&mut self) {
        let mut count = 0;
        match &mut self.store {
            Store::Hash(table) => {
                for (_, entry) in table.iter_mut() {
                    let recs = entry.recs;
                    if let Some(rates) = entry.rates.as_mut() {
                        rates.calc(recs);
                    }
                    count += entry.count();
                }
            }
            Store::Index(table) => {
                for (_, entry) in table.iter_mut() {
                    let recs = entry.recs;
                    if let Some(rates) = entry.rates.as_mut() {
                        rates.calc(recs);
                    }
                    count += entry.count();
                }
            }
        }
        self.totals.count = count;
        self.totals.rates.calc(self.totals.recs);
    }

    fn totals(&self) -> &ReportTotals {
        &self.totals
    }

    fn entries(&self) -> u64 {
        match &self.store {
            Store::Hash(table) => table.entries() as u64,
            Store::Index(table) => table.entries() as u64,
        }
    }

    fn sort(&mut self, spec: Option<&SortSpec>) {
        match spec {
            None => match &mut self.store {
                Store::Hash(table) => table.clear_sort(),
                Store::Index(table) => table.clear_sort(),
            },
            Some(spec) => {
                let field = spec.field;
                match &mut self.store {
                    Store::Hash(table) => {
                        table.sort_by(spec.descending, |key, entry| sort_val(key, entry, field));
                    }
                    Store::Index(table) => {
                        table.sort_by(spec.descending, |idx, entry| {
                            let mut key = StatKey::default();
                            key.w[0] = idx as u32;
                            sort_val(&key, entry, field)
                        });
                    }
                }
            }
        }
    }

    fn for_each_row(&self, report: &Report, cb: &mut dyn FnMut(RowData) -> bool) {
        match &self.store {
            Store::Hash(table) => {
                for (key, entry) in table.iter_ordered() {
                    if !cb(self.row(key, entry, report)) {
                        break;
                    }
                }
            }
            Store::Index(table) => {
                for (idx, entry) in table.iter_ordered() {
                    let mut key = StatKey::default();
                    key.w[0] = idx as u32;
                    if !cb(self.row(&key, entry, report)) {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{AddrMode, ReportKind, new_form};
    use super::*;
    use std::net::Ipv4Addr;

    fn flow(srcport: u16, octets: u64, packets: u64, dur_ms: u32) -> FlowRecord {
        FlowRecord {
            srcport,
            d_octets: octets,
            d_pkts: packets,
            first: 1_000,
            last: 1_000 + dur_ms,
            unix_secs: 10_000,
            sys_uptime: 5_000,
            ..FlowRecord::default()
        }
    }

    fn report(kind: &str) -> Report {
        Report::new("t", ReportKind::from_name(kind).unwrap())
    }

    #[test]
    fn source_port_buckets() {
        let rpt = report("ip-source-port");
        let mut form = new_form(&rpt);
        for port in [80u16, 80, 443, 22] {
            form.accum(&flow(port, 100, 1, 1_000), &rpt);
        }
        form.calc();

        assert_eq!(form.entries(), 3);
        let totals = form.totals();
        assert_eq!(totals.flows, 4);
        assert_eq!(totals.octets, 400);

        form.sort(Some(&SortSpec {
            field: FieldSet::FLOWS,
            descending: true,
        }));
        let mut seen = Vec::new();
        form.for_each_row(&rpt, &mut |row| {
            if let super::super::KeyCell::Num { value, .. } = row.cells[0] {
                seen.push((value, row.flows.as_f64() as u64));
            }
            true
        });
        assert_eq!(seen[0], (80, 2));
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn scale_multiplies_counters() {
        let mut rpt = report("ip-source-port");
        rpt.scale = 10;
        let mut form = new_form(&rpt);
        form.accum(&flow(80, 100, 4, 1_000), &rpt);
        form.calc();
        let totals = form.totals();
        assert_eq!(totals.octets, 1_000);
        assert_eq!(totals.packets, 40);
    }

    #[test]
    fn prefix_aggregation_collapses_hosts() {
        let mut rpt = report("ip-source-address");
        rpt.src_addr_mode = AddrMode::PrefixMask;
        let mut form = new_form(&rpt);

        for host in [Ipv4Addr::new(10, 1, 2, 3), Ipv4Addr::new(10, 1, 99, 99)] {
            let f = FlowRecord {
                srcaddr: host,
                src_mask: 16,
                d_octets: 100,
                d_pkts: 1,
                ..FlowRecord::default()
            };
            form.accum(&f, &rpt);
        }
        form.calc();

        assert_eq!(form.entries(), 1);
        let mut got = None;
        form.for_each_row(&rpt, &mut |row| {
            got = Some(row);
            true
        });
        let row = got.unwrap();
        assert_eq!(row.flows.as_f64() as u64, 2);
        match row.cells[0] {
            super::super::KeyCell::Addr { addr, mask } => {
                assert_eq!(Ipv4Addr::from(addr), Ipv4Addr::new(10, 1, 0, 0));
                assert_eq!(mask, Some(16));
            }
            _ => panic!("expected an address cell"),
        }
    }

    #[test]
    fn distinct_destinations_per_source() {
        let rpt = report("ip-source-address-destination-count");
        let mut form = new_form(&rpt);

        let a = Ipv4Addr::new(10, 0, 0, 1);
        let d = Ipv4Addr::new(10, 0, 0, 4);
        let b = Ipv4Addr::new(172, 16, 0, 1);
        let c = Ipv4Addr::new(172, 16, 0, 2);
        for (src, dst) in [(a, b), (a, c), (a, c), (d, b)] {
            let f = FlowRecord {
                srcaddr: src,
                dstaddr: dst,
                d_octets: 10,
                d_pkts: 1,
                ..FlowRecord::default()
            };
            form.accum(&f, &rpt);
        }
        form.calc();

        assert_eq!(form.entries(), 2);
        assert_eq!(form.totals().count, 3);

        let mut counts = Vec::new();
        form.for_each_row(&rpt, &mut |row| {
            counts.push((row.cells.len(), row.count.unwrap()));
            true
        });
        let mut seen: Vec<u64> = counts.iter().map(|(_, c)| *c).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn rate_totals_match_weighted_bucket_averages() {
        let mut rpt = report("ip-source-port");
        rpt.sinks
            .push(super::super::OutputSink::with_default_fields(
                FieldSet::KEY1.with(FieldSet::AVG_PPS),
            ));
        let mut form = new_form(&rpt);

        form.accum(&flow(80, 1_000, 10, 1_000), &rpt); // 10 pps
        form.accum(&flow(80, 1_000, 30, 1_000), &rpt); // 30 pps
        form.accum(&flow(443, 1_000, 10, 500), &rpt); // 20 pps
        form.calc();

        let totals = form.totals();
        assert_eq!(totals.recs, 3);
        assert!((totals.rates.avg_pps - 20.0).abs() < 1e-9);

        let mut weighted = 0.0;
        let mut recs = 0;
        form.for_each_row(&rpt, &mut |row| {
            let rates = row.rates.unwrap();
            weighted += rates.avg_pps * row.recs as f64;
            recs += row.recs;
            true
        });
        assert_eq!(recs, 3);
        assert!((weighted / recs as f64 - totals.rates.avg_pps).abs() < 1e-9);
    }

    #[test]
    fn zero_duration_flows_count_in_totals_not_rates() {
        let rpt = report("ip-source-port");
        let mut form = new_form(&rpt);
        form.accum(&flow(80, 100, 1, 0), &rpt);
        form.calc();

        let totals = form.totals();
        assert_eq!(totals.flows, 1);
        assert_eq!(totals.octets, 100);
        assert_eq!(totals.recs, 0);
        assert_eq!(totals.ignores, 1);
    }
}
