//! Definition runtime.
//!
//! A definition routes every inbound flow through its mask overlay, tag
//! rewrite, and filter, then accumulates each of its reports in
//! configuration order. With `time-series` set, a flow past the window
//! boundary first calcs, dumps, and resets the reports, then opens the next
//! interval; no flow ever lands in two intervals.

use crate::config::{DefinitionCfg, StatConfig};
use crate::flow::{FlowFields, FlowRecord};
use crate::output::{dump_report, DumpEnv};
use crate::policy::{FilterPolicy, FilterVerdict, FlowSource, MaskPolicy, TagPolicy};
use crate::report::{new_form, Report, ReportForm, ReportTotals, RowData, SortSpec};
use crate::symbols::SymbolResolver;
use crate::FlowStatError;

use log::{debug, warn};

use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DefState {
    Created,
    Accumulating,
    Calculated,
    Dumped,
    Freed,
}

struct BoundReport {
    cfg: Arc<Report>,
    filter: Option<Arc<dyn FilterPolicy>>,
    form: Box<dyn ReportForm>,
}

/// One definition bound to live report state.
pub struct Definition {
    name: String,
    filter: Option<Arc<dyn FilterPolicy>>,
    tag: Option<Arc<dyn TagPolicy>>,
    mask: Option<Arc<dyn MaskPolicy>>,
    max_time: u32,
    reports: Vec<BoundReport>,
    required: FlowFields,
    start_time: u32,
    interval: u32,
    state: DefState,
    disabled: bool,
}

impl Definition {
    fn bind(cfg: &DefinitionCfg, config: &StatConfig) -> Definition {
        let reports = cfg
            .report_idx
            .iter()
            .map(|&idx| {
                let report = config.reports[idx].clone();
                let filter = report
                    .filter
                    .as_ref()
                    .and_then(|name| config.filters.get(name))
                    .cloned();
                BoundReport {
                    form: new_form(&report),
                    filter,
                    cfg: report,
                }
            })
            .collect();
        Definition {
            name: cfg.name.clone(),
            filter: cfg
                .filter
                .as_ref()
                .and_then(|name| config.filters.get(name))
                .cloned(),
            tag: cfg
                .tag
                .as_ref()
                .and_then(|name| config.tags.get(name))
                .cloned(),
            mask: cfg
                .mask
                .as_ref()
                .and_then(|name| config.masks.get(name))
                .cloned(),
            max_time: cfg.max_time,
            reports,
            required: cfg.required,
            start_time: 0,
            interval: 0,
            state: DefState::Created,
            disabled: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Completed time-series roll-overs so far.
    pub fn interval(&self) -> u32 {
        self.interval
    }

    /// Totals of one of this definition's reports.
    pub fn report_totals(&self, report: &str) -> Option<&ReportTotals> {
        self.bound(report).map(|r| r.form.totals())
    }

    /// Bucket count of one of this definition's reports.
    pub fn report_entries(&self, report: &str) -> Option<u64> {
        self.bound(report).map(|r| r.form.entries())
    }

    /// Materialize one report's rows, optionally sorted.
    pub fn report_rows(&mut self, report: &str, sort: Option<SortSpec>) -> Option<Vec<RowData>> {
        let bound = self
            .reports
            .iter_mut()
            .find(|r| r.cfg.name == report)?;
        bound.form.sort(sort.as_ref());
        let mut rows = Vec::new();
        bound.form.for_each_row(&bound.cfg, &mut |row| {
            rows.push(row);
            true
        });
        Some(rows)
    }

    fn bound(&self, report: &str) -> Option<&BoundReport> {
        self.reports.iter().find(|r| r.cfg.name == report)
    }

    /// Route one flow; rolls the time-series window first when the flow
    /// falls beyond it.
    fn process(&mut self, flow: &FlowRecord, env: &mut DumpEnv<'_>) -> Result<(), FlowStatError> {
        if self.disabled || self.state == DefState::Freed {
            return Ok(());
        }

        let mut have = flow.xfields();
        if self.tag.is_some() {
            have |= FlowFields::SRC_TAG | FlowFields::DST_TAG;
        }
        if !have.contains(self.required) {
            self.disabled = true;
            return Err(FlowStatError::FieldMismatch {
                definition: self.name.clone(),
                missing: have.missing(self.required),
            });
        }

        if self.start_time == 0 {
            self.start_time = flow.unix_secs;
        }
        if self.max_time > 0 && flow.unix_secs >= self.start_time.saturating_add(self.max_time) {
            self.calc();
            if let Err(err) = self.dump(env) {
                warn!("definition {}: interval dump failed: {err}", self.name);
            }
            self.reset(flow.unix_secs);
        }

        self.accumulate(flow);
        Ok(())
    }

    fn accumulate(&mut self, flow: &FlowRecord) {
        self.state = DefState::Accumulating;
        let mut local = flow.clone();

        if let Some(mask) = &self.mask {
            mask.apply(&mut local);
        }
        if let Some(tag) = &self.tag {
            local.upcast_tagged();
            tag.apply(&mut local);
        }
        if let Some(filter) = &self.filter {
            if filter.eval(&local) == FilterVerdict::Deny {
                return;
            }
        }

        for report in &mut self.reports {
            let saved = report.cfg.tag_mask.map(|(src_mask, dst_mask)| {
                let saved = (local.src_tag, local.dst_tag);
                local.src_tag &= src_mask;
                local.dst_tag &= dst_mask;
                saved
            });

            let denied = report
                .filter
                .as_ref()
                .map(|f| f.eval(&local) == FilterVerdict::Deny)
                .unwrap_or(false);
            if !denied {
                report.form.accum(&local, &report.cfg);
            }

            if let Some((src_tag, dst_tag)) = saved {
                local.src_tag = src_tag;
                local.dst_tag = dst_tag;
            }
        }
    }

    fn calc(&mut self) {
        if matches!(self.state, DefState::Created | DefState::Accumulating) {
            for report in &mut self.reports {
                report.form.calc();
            }
            self.state = DefState::Calculated;
        }
    }

    /// Dump every report; repeat calls in one interval are no-ops.
    fn dump(&mut self, env: &mut DumpEnv<'_>) -> Result<(), FlowStatError> {
        self.calc();
        if self.state != DefState::Calculated {
            return Ok(());
        }
        let mut first_err = None;
        for report in &mut self.reports {
            if let Err(err) = dump_report(&report.cfg, report.form.as_mut(), env, self.interval) {
                first_err.get_or_insert(err);
            }
        }
        self.state = DefState::Dumped;
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Start the next interval: fresh report state, bumped counter.
    fn reset(&mut self, new_start: u32) {
        for report in &mut self.reports {
            report.form = new_form(&report.cfg);
        }
        self.interval += 1;
        self.start_time = new_start;
        self.state = DefState::Created;
        debug!(
            "definition {} rolled to interval {} at t={}",
            self.name, self.interval, new_start
        );
    }

    fn finish(&mut self, env: &mut DumpEnv<'_>) -> Result<(), FlowStatError> {
        if self.state == DefState::Freed {
            return Ok(());
        }
        let result = self.dump(env);
        self.state = DefState::Freed;
        result
    }
}

/// The report engine: every definition of a loaded configuration, driven
/// flow by flow.
pub struct StatEngine {
    definitions: Vec<Definition>,
    resolver: SymbolResolver,
    xheader: Vec<String>,
}

impl StatEngine {
    /// Instantiate live state for every definition in `config`.
    pub fn new(config: &StatConfig) -> StatEngine {
        StatEngine {
            definitions: config
                .definitions
                .iter()
                .map(|cfg| Definition::bind(cfg, config))
                .collect(),
            resolver: SymbolResolver::new(),
            xheader: Vec::new(),
        }
    }

    /// Symbol tables used by `options +names`.
    pub fn resolver_mut(&mut self) -> &mut SymbolResolver {
        &mut self.resolver
    }

    /// Stream description printed by `options +xheader`.
    pub fn set_extended_header(&mut self, lines: Vec<String>) {
        self.xheader = lines;
    }

    pub fn definitions(&self) -> impl Iterator<Item = &Definition> {
        self.definitions.iter()
    }

    pub fn definition(&self, name: &str) -> Option<&Definition> {
        self.definitions.iter().find(|d| d.name == name)
    }

    pub fn definition_mut(&mut self, name: &str) -> Option<&mut Definition> {
        self.definitions.iter_mut().find(|d| d.name == name)
    }

    /// Route one flow to every definition.
    ///
    /// A definition whose required fields the stream cannot supply reports
    /// once and is skipped from then on; other definitions keep running.
    pub fn process(&mut self, flow: &FlowRecord) -> Result<(), FlowStatError> {
        let mut first_err = None;
        for definition in &mut self.definitions {
            let mut env = DumpEnv {
                resolver: &mut self.resolver,
                xheader: &self.xheader,
            };
            if let Err(err) = definition.process(flow, &mut env) {
                warn!("definition {}: {err}", definition.name);
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Final calc and dump for every definition.
    pub fn finish(&mut self) -> Result<(), FlowStatError> {
        let mut first_err = None;
        for definition in &mut self.definitions {
            let mut env = DumpEnv {
                resolver: &mut self.resolver,
                xheader: &self.xheader,
            };
            if let Err(err) = definition.finish(&mut env) {
                warn!("definition {}: dump failed: {err}", definition.name);
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Drain a flow source and finish.
    ///
    /// Per-flow errors are logged and do not stop the run.
    pub fn run(&mut self, source: &mut dyn FlowSource) -> Result<(), FlowStatError> {
        self.xheader = source.header_lines();
        while let Some(flow) = source.read()? {
            let _ = self.process(&flow);
        }
        self.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StatConfig;
    use crate::policy::{FnFilter, NoPolicies, TablePolicies};

    fn config(text: &str) -> StatConfig {
        StatConfig::parse_str(text, "test.cfg", &mut NoPolicies).unwrap()
    }

    fn port_flow(unix_secs: u32, srcport: u16) -> FlowRecord {
        FlowRecord {
            unix_secs,
            srcport,
            d_octets: 100,
            d_pkts: 1,
            first: 0,
            last: 100,
            ..FlowRecord::default()
        }
    }

    #[test]
    fn reports_accumulate_in_configuration_order_with_scoped_tag_masks() {
        let text = "\
stat-report masked
  type source-tag
  tag-mask 0x0000FF00 0x000000FF
stat-report plain
  type source-tag
stat-definition both
  report masked
  report plain
";
        let cfg = config(text);
        let mut engine = StatEngine::new(&cfg);

        let mut flow = port_flow(100, 80);
        flow.src_tag = 0x12345678;
        flow.dst_tag = 0x9ABCDEF0;
        engine.process(&flow).unwrap();

        let def = engine.definition_mut("both").unwrap();
        let masked = def.report_rows("masked", None).unwrap();
        let plain = def.report_rows("plain", None).unwrap();

        match masked[0].cells[0] {
            crate::report::KeyCell::Num { value, .. } => assert_eq!(value, 0x00005600),
            _ => panic!("tag key expected"),
        }
        match plain[0].cells[0] {
            crate::report::KeyCell::Num { value, .. } => assert_eq!(value, 0x12345678),
            _ => panic!("tag key expected"),
        }
        // the original flow is untouched
        assert_eq!(flow.src_tag, 0x12345678);
    }

    #[test]
    fn definition_filter_short_circuits() {
        let text = "\
stat-report ports
  type ip-source-port
stat-definition f
  filter evens
  report ports
";
        let mut policies = TablePolicies::new();
        policies.add_filter(
            "evens",
            std::sync::Arc::new(FnFilter::new(|flow: &FlowRecord| {
                if flow.srcport % 2 == 0 {
                    crate::policy::FilterVerdict::Permit
                } else {
                    crate::policy::FilterVerdict::Deny
                }
            })),
        );
        let cfg = StatConfig::parse_str(text, "test.cfg", &mut policies).unwrap();
        let mut engine = StatEngine::new(&cfg);

        for port in [80u16, 81, 82, 83] {
            engine.process(&port_flow(100, port)).unwrap();
        }
        let def = engine.definition("f").unwrap();
        assert_eq!(def.report_entries("ports"), Some(2));
        assert_eq!(def.report_totals("ports").unwrap().flows, 2);
    }

    #[test]
    fn time_series_rolls_on_the_boundary_flow() {
        let text = "\
stat-report ports
  type ip-source-port
stat-definition ts
  time-series 60
  report ports
";
        let cfg = config(text);
        let mut engine = StatEngine::new(&cfg);

        let base = 1_000;
        for t in [0u32, 10, 59] {
            engine.process(&port_flow(base + t, 80)).unwrap();
        }
        assert_eq!(engine.definition("ts").unwrap().interval(), 0);
        assert_eq!(
            engine
                .definition("ts")
                .unwrap()
                .report_totals("ports")
                .unwrap()
                .flows,
            3
        );

        for t in [60u32, 61] {
            engine.process(&port_flow(base + t, 80)).unwrap();
        }
        let def = engine.definition("ts").unwrap();
        assert_eq!(def.interval(), 1);
        // the new interval holds exactly the boundary flow and its successor
        assert_eq!(def.report_totals("ports").unwrap().flows, 2);
    }

    #[test]
    fn missing_fields_disable_a_definition_once() {
        let text = "\
stat-report tags
  type source-tag
stat-definition t
  report tags
";
        let cfg = config(text);
        let mut engine = StatEngine::new(&cfg);

        let mut flow = port_flow(100, 80);
        flow.version = crate::flow::FlowVersion::V5;
        assert!(matches!(
            engine.process(&flow),
            Err(FlowStatError::FieldMismatch { .. })
        ));
        // second flow: the definition is silently skipped
        engine.process(&flow).unwrap();
        assert_eq!(engine.definition("t").unwrap().report_totals("tags").unwrap().flows, 0);
    }

    #[test]
    fn tag_policy_upcasts_v5_flows() {
        let text = "\
stat-report tags
  type source-tag
stat-definition t
  tag by-prefix
  report tags
";
        let mut policies = TablePolicies::new();
        let mut tagger = crate::policy::PrefixTagPolicy::new();
        tagger.add(std::net::Ipv4Addr::new(10, 0, 0, 0), 8, 42);
        policies.add_tag_policy("by-prefix", std::sync::Arc::new(tagger));
        let cfg = StatConfig::parse_str(text, "test.cfg", &mut policies).unwrap();
        let mut engine = StatEngine::new(&cfg);

        let mut flow = port_flow(100, 80);
        flow.version = crate::flow::FlowVersion::V5;
        flow.srcaddr = std::net::Ipv4Addr::new(10, 1, 2, 3);
        engine.process(&flow).unwrap();

        let def = engine.definition_mut("t").unwrap();
        let rows = def.report_rows("tags", None).unwrap();
        match rows[0].cells[0] {
            crate::report::KeyCell::Num { value, .. } => assert_eq!(value, 42),
            _ => panic!("tag key expected"),
        }
    }
}
