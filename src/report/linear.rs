//! Per-second linear interpolation.
//!
//! A flow spanning several wallclock seconds spreads its counters evenly
//! across them, one fractional share per second of its lifetime. Counters
//! here are fractional by construction.

use super::{Cv, FlowMeasure, Report, ReportForm, ReportTotals, RowData, SortSpec};
use crate::chash::{CountingHash, SortVal};
use crate::flow::FlowRecord;
use crate::report::{FieldSet, KeyCell};

const H_SIZE: usize = 65536;
const RECORDS_PER_CHUNK: usize = 256;

#[derive(Debug, Clone, Copy, Default)]
struct Share {
    flows: f64,
    octets: f64,
    packets: f64,
}

pub(crate) struct LinearForm {
    store: CountingHash<u32, Share>,
    totals: ReportTotals,
}

impl LinearForm {
    pub(crate) fn new() -> LinearForm {
        LinearForm {
            store: CountingHash::new(H_SIZE, RECORDS_PER_CHUNK),
            totals: ReportTotals::default(),
        }
    }
}

impl ReportForm for LinearForm {
    fn accum(&mut self, flow: &FlowRecord, report: &Report) {
        let m = FlowMeasure::of(flow, report.scale);
        self.totals.add(&m);

        let start = m.wall_first;
        let end = m.wall_last.max(start);
        let span = f64::from(end - start) + 1.0;
        let share = Share {
            flows: m.flows as f64 / span,
            octets: m.octets as f64 / span,
            packets: m.packets as f64 / span,
        };
        for sec in start..=end {
            let slot = self.store.update(sec, sec ^ (sec >> 16), Share::default);
            slot.flows += share.flows;
            slot.octets += share.octets;
            slot.packets += share.packets;
        }
    }

    fn calc(&mut self) {
        self.totals.rates.calc(self.totals.recs);
    }

    fn totals(&self) -> &ReportTotals {
        &self.totals
    }

    fn entries(&self) -> u64 {
        self.store.entries() as u64
    }

    fn sort(&mut self, spec: Option<&SortSpec>) {
        match spec {
            None => self.store.clear_sort(),
            Some(spec) => {
                let field = spec.field;
                self.store.sort_by(spec.descending, move |sec, share| {
                    if field == FieldSet::FLOWS {
                        SortVal::F64(share.flows)
                    } else if field == FieldSet::OCTETS {
                        SortVal::F64(share.octets)
                    } else if field == FieldSet::PACKETS {
                        SortVal::F64(share.packets)
                    } else {
                        SortVal::U32(*sec)
                    }
                });
            }
        }
    }

    fn for_each_row(&self, _report: &Report, cb: &mut dyn FnMut(RowData) -> bool) {
        for (sec, share) in self.store.iter_ordered() {
            let row = RowData {
                cells: vec![KeyCell::Time(*sec)],
                flows: Cv::F(share.flows),
                octets: Cv::F(share.octets),
                packets: Cv::F(share.packets),
                duration: Cv::U(0),
                recs: 0,
                first: *sec,
                last: *sec,
                rates: None,
                count: None,
            };
            if !cb(row) {
                break;
            }
        }
    }
}
