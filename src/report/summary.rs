//! Stream-wide summary reports.
//!
//! `summary-counters` reduces the stream to one totals record.
//! `summary-detail` additionally histograms packet sizes and per-flow
//! packet, octet, and duration magnitudes into coarse bins.

use super::{Cv, FieldSet, FlowMeasure, Report, ReportForm, ReportTotals, RowData, SortSpec};
use crate::flow::FlowRecord;
use crate::report::KeyCell;
use crate::symbols::SymClass;

/// 32-byte-wide packet size bins, 0..=2047 plus a catch-all.
const PSIZE_BINS: usize = 65;
const PSIZE_WIDTH: u64 = 32;

/// Power-of-two magnitude bins: 0, 1, 2..3, 4..7, ... 2^31.., 33 in all.
const POW2_BINS: usize = 33;

fn pow2_bin(value: u64) -> usize {
    if value == 0 {
        0
    } else {
        (64 - value.leading_zeros() as usize).min(POW2_BINS - 1)
    }
}

fn pow2_floor(bin: usize) -> u64 {
    if bin == 0 { 0 } else { 1u64 << (bin - 1) }
}

pub(crate) struct SummaryForm {
    detail: bool,
    totals: ReportTotals,
    psize: Vec<u64>,
    packets: Vec<u64>,
    octets: Vec<u64>,
    durations: Vec<u64>,
    sort: Option<SortSpec>,
}

impl SummaryForm {
    pub(crate) fn new(detail: bool) -> SummaryForm {
        SummaryForm {
            detail,
            totals: ReportTotals::default(),
            psize: vec![0; PSIZE_BINS],
            packets: vec![0; POW2_BINS],
            octets: vec![0; POW2_BINS],
            durations: vec![0; POW2_BINS],
            sort: None,
        }
    }

    fn histograms(&self) -> [(&'static str, &[u64], bool); 4] {
        [
            ("packet-size", self.psize.as_slice(), false),
            ("packets", self.packets.as_slice(), true),
            ("octets", self.octets.as_slice(), true),
            ("duration", self.durations.as_slice(), true),
        ]
    }

    /// Occupied bins as `(label, bin floor, flows)`, in the order the
    /// current sort dictates; histogram order when unsorted.
    fn detail_rows(&self) -> Vec<(&'static str, u64, u64)> {
        let mut rows = Vec::new();
        for (label, bins, pow2) in self.histograms() {
            for (bin, &flows) in bins.iter().enumerate() {
                if flows == 0 {
                    continue;
                }
                let floor = if pow2 {
                    pow2_floor(bin)
                } else {
                    bin as u64 * PSIZE_WIDTH
                };
                rows.push((label, floor, flows));
            }
        }
        if let Some(spec) = self.sort {
            if spec.field == FieldSet::KEY1 {
                rows.sort_by(|a, b| a.0.cmp(b.0));
            } else if spec.field == FieldSet::KEY2 {
                rows.sort_by(|a, b| a.1.cmp(&b.1));
            } else if spec.field == FieldSet::FLOWS {
                rows.sort_by(|a, b| a.2.cmp(&b.2));
            }
            if spec.descending {
                rows.reverse();
            }
        }
        rows
    }
}

impl ReportForm for SummaryForm {
    fn accum(&mut self, flow: &FlowRecord, report: &Report) {
        let m = FlowMeasure::of(flow, report.scale);
        self.totals.add(&m);

        if self.detail {
            if m.packets > 0 {
                let size = m.octets / m.packets;
                let bin = ((size / PSIZE_WIDTH) as usize).min(PSIZE_BINS - 1);
                self.psize[bin] += m.flows;
            }
            self.packets[pow2_bin(m.packets)] += m.flows;
            self.octets[pow2_bin(m.octets)] += m.flows;
            self.durations[pow2_bin(u64::from(m.duration_ms))] += m.flows;
        }
    }

    fn calc(&mut self) {
        self.totals.rates.calc(self.totals.recs);
    }

    fn totals(&self) -> &ReportTotals {
        &self.totals
    }

    fn entries(&self) -> u64 {
        if self.detail {
            self.histograms()
                .iter()
                .map(|(_, bins, _)| bins.iter().filter(|&&v| v > 0).count() as u64)
                .sum()
        } else {
            1
        }
    }

    fn sort(&mut self, spec: Option<&SortSpec>) {
        // the totals record stands alone; bin rows reorder at emission
        self.sort = spec.copied();
    }

    fn for_each_row(&self, _report: &Report, cb: &mut dyn FnMut(RowData) -> bool) {
        if !self.detail {
            cb(RowData {
                cells: Vec::new(),
                flows: Cv::U(self.totals.flows),
                octets: Cv::U(self.totals.octets),
                packets: Cv::U(self.totals.packets),
                duration: Cv::U(self.totals.duration),
                recs: self.totals.recs,
                first: self.totals.time_start,
                last: self.totals.time_end,
                rates: Some(self.totals.rates),
                count: None,
            });
            return;
        }

        for (label, floor, flows) in self.detail_rows() {
            let row = RowData {
                cells: vec![
                    KeyCell::Label(label),
                    KeyCell::Num {
                        value: floor,
                        class: SymClass::Plain,
                    },
                ],
                flows: Cv::U(flows),
                octets: Cv::U(0),
                packets: Cv::U(0),
                duration: Cv::U(0),
                recs: 0,
                first: self.totals.time_start,
                last: self.totals.time_end,
                rates: None,
                count: None,
            };
            if !cb(row) {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::ReportKind;
    use super::*;

    fn flow(octets: u64, packets: u64, dur_ms: u32) -> FlowRecord {
        FlowRecord {
            d_octets: octets,
            d_pkts: packets,
            first: 0,
            last: dur_ms,
            ..FlowRecord::default()
        }
    }

    #[test]
    fn magnitude_bins() {
        assert_eq!(pow2_bin(0), 0);
        assert_eq!(pow2_bin(1), 1);
        assert_eq!(pow2_bin(2), 2);
        assert_eq!(pow2_bin(3), 2);
        assert_eq!(pow2_bin(1024), 11);
        assert_eq!(pow2_floor(11), 1024);
        assert_eq!(pow2_bin(u64::MAX), POW2_BINS - 1);
    }

    #[test]
    fn counters_form_reduces_to_one_record() {
        let rpt = super::super::Report::new(
            "sum",
            ReportKind::from_name("summary-counters").unwrap(),
        );
        let mut form = SummaryForm::new(false);
        form.accum(&flow(400, 4, 2_000), &rpt);
        form.accum(&flow(100, 1, 1_000), &rpt);
        form.calc();

        assert_eq!(form.entries(), 1);
        let mut rows = 0;
        form.for_each_row(&rpt, &mut |row| {
            rows += 1;
            assert_eq!(row.flows.as_f64() as u64, 2);
            assert_eq!(row.octets.as_f64() as u64, 500);
            assert!(row.rates.is_some());
            true
        });
        assert_eq!(rows, 1);
    }

    #[test]
    fn detail_form_bins_sizes() {
        let rpt = super::super::Report::new(
            "det",
            ReportKind::from_name("summary-detail").unwrap(),
        );
        let mut form = SummaryForm::new(true);
        // mean packet size 100 -> packet-size bin 3 (96..127)
        form.accum(&flow(400, 4, 2_000), &rpt);
        form.calc();

        let mut labelled = Vec::new();
        form.for_each_row(&rpt, &mut |row| {
            if let [KeyCell::Label(label), KeyCell::Num { value, .. }] = row.cells.as_slice() {
                labelled.push((*label, *value, row.flows.as_f64() as u64));
            }
            true
        });
        assert!(labelled.contains(&("packet-size", 96, 1)));
        assert!(labelled.contains(&("packets", 4, 1)));
        assert!(labelled.contains(&("octets", 256, 1)));
        assert!(labelled.contains(&("duration", 1024, 1)));
    }

    #[test]
    fn detail_rows_follow_the_requested_sort() {
        let rpt = super::super::Report::new(
            "det",
            ReportKind::from_name("summary-detail").unwrap(),
        );
        let mut form = SummaryForm::new(true);
        form.accum(&flow(400, 4, 2_000), &rpt);
        form.accum(&flow(400, 4, 2_000), &rpt);
        form.accum(&flow(64, 1, 500), &rpt);
        form.calc();

        form.sort(Some(&SortSpec {
            field: FieldSet::FLOWS,
            descending: true,
        }));
        let mut flows = Vec::new();
        form.for_each_row(&rpt, &mut |row| {
            flows.push(row.flows.as_f64() as u64);
            true
        });
        let mut expect = flows.clone();
        expect.sort_unstable_by(|a, b| b.cmp(a));
        assert_eq!(flows, expect);
        assert_eq!(flows.first(), Some(&2));
        assert_eq!(flows.last(), Some(&1));

        form.sort(Some(&SortSpec {
            field: FieldSet::KEY2,
            descending: false,
        }));
        let mut floors = Vec::new();
        form.for_each_row(&rpt, &mut |row| {
            if let KeyCell::Num { value, .. } = row.cells[1] {
                floors.push(value);
            }
            true
        });
        let mut expect = floors.clone();
        expect.sort_unstable();
        assert_eq!(floors, expect);

        // dropping the sort restores histogram order
        form.sort(None);
        let mut labels = Vec::new();
        form.for_each_row(&rpt, &mut |row| {
            if let KeyCell::Label(label) = row.cells[0] {
                labels.push(label);
            }
            true
        });
        assert_eq!(labels.first(), Some(&"packet-size"));
        assert_eq!(labels.last(), Some(&"duration"));
    }
}
