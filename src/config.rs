//! Report configuration loader.
//!
//! Line-oriented directives, whitespace tokens, `#` comments. Two nesting
//! levels: `stat-report` blocks (with nested `output` sinks) and
//! `stat-definition` blocks. Blocks close implicitly at the next top-level
//! directive or at end of input. `report` references inside definitions may
//! point forward; they resolve after the last line. Every error carries its
//! `file:line`.

use crate::flow::FlowFields;
use crate::policy::{FilterPolicy, MaskPolicy, PolicyProvider, TagPolicy};
use crate::report::{
    AddrMode, FieldSet, OptionSet, OutputSink, Report, ReportKind, SinkFormat, SortSpec,
    TimeAnchor,
};
use crate::{FlowStatError, PolicyKind};

use log::debug;
use serde::Serialize;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Caller-supplied `${name}` expander applied to every line before
/// tokenization.
pub type VarExpander<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Parsed `stat-definition` block.
#[derive(Debug, Clone, Serialize)]
pub struct DefinitionCfg {
    pub name: String,
    pub filter: Option<String>,
    pub tag: Option<String>,
    pub mask: Option<String>,
    /// Time-series window in seconds; 0 disables slicing.
    pub max_time: u32,
    /// Referenced report names, in accumulation order.
    pub reports: Vec<String>,
    #[serde(skip)]
    pub(crate) report_idx: Vec<usize>,
    /// Union of the referenced reports' required flow fields.
    pub required: FlowFields,
}

/// A loaded configuration: reports, definitions, and the policy handles
/// their references resolved to.
pub struct StatConfig {
    pub reports: Vec<Arc<Report>>,
    pub definitions: Vec<DefinitionCfg>,
    pub(crate) filters: HashMap<String, Arc<dyn FilterPolicy>>,
    pub(crate) tags: HashMap<String, Arc<dyn TagPolicy>>,
    pub(crate) masks: HashMap<String, Arc<dyn MaskPolicy>>,
}

impl fmt::Debug for StatConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatConfig")
            .field("reports", &self.reports)
            .field("definitions", &self.definitions)
            .field("filters", &self.filters.keys().collect::<Vec<_>>())
            .field("tags", &self.tags.keys().collect::<Vec<_>>())
            .field("masks", &self.masks.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StatConfig {
    /// Load a configuration file.
    pub fn load(
        path: impl AsRef<Path>,
        provider: &mut dyn PolicyProvider,
    ) -> Result<StatConfig, FlowStatError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| FlowStatError::Io {
            context: format!("reading {}", path.display()),
            source,
        })?;
        Self::parse_str(&text, &path.to_string_lossy(), provider)
    }

    /// Parse configuration text without variable expansion.
    pub fn parse_str(
        text: &str,
        origin: &str,
        provider: &mut dyn PolicyProvider,
    ) -> Result<StatConfig, FlowStatError> {
        Self::parse_str_with(text, origin, provider, None)
    }

    /// Parse configuration text, expanding `${name}` through `expander`.
    pub fn parse_str_with(
        text: &str,
        origin: &str,
        provider: &mut dyn PolicyProvider,
        expander: Option<VarExpander<'_>>,
    ) -> Result<StatConfig, FlowStatError> {
        let mut parser = Parser::new(origin, provider, expander);
        for line in text.lines() {
            parser.line_no += 1;
            parser.feed_line(line)?;
        }
        parser.finish()
    }

    pub fn report(&self, name: &str) -> Option<&Arc<Report>> {
        self.reports.iter().find(|r| r.name == name)
    }

    pub fn definition(&self, name: &str) -> Option<&DefinitionCfg> {
        self.definitions.iter().find(|d| d.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    TopLevel,
    InReport,
    InSink,
    InDefinition,
}

struct ReportBuilder {
    name: String,
    kind: Option<ReportKind>,
    filter: Option<String>,
    scale: u32,
    tag_mask: Option<(u32, u32)>,
    src_addr_mode: AddrMode,
    dst_addr_mode: AddrMode,
    sinks: Vec<OutputSink>,
}

struct Parser<'a> {
    origin: String,
    provider: &'a mut dyn PolicyProvider,
    expander: Option<VarExpander<'a>>,
    line_no: u32,
    state: ParseState,
    reports: Vec<Arc<Report>>,
    report_names: HashSet<String>,
    definitions: Vec<DefinitionCfg>,
    definition_names: HashSet<String>,
    filters: HashMap<String, Arc<dyn FilterPolicy>>,
    tags: HashMap<String, Arc<dyn TagPolicy>>,
    masks: HashMap<String, Arc<dyn MaskPolicy>>,
    cur_report: Option<ReportBuilder>,
    cur_sink: Option<OutputSink>,
    cur_def: Option<DefinitionCfg>,
}

const TOP_KEYWORDS: [&str; 5] = [
    "stat-report",
    "stat-definition",
    "include-filter",
    "include-tag",
    "include-mask",
];

const SINK_KEYWORDS: [&str; 8] = [
    "format", "sort", "records", "tally", "fields", "options", "path", "time",
];

impl<'a> Parser<'a> {
    fn new(
        origin: &str,
        provider: &'a mut dyn PolicyProvider,
        expander: Option<VarExpander<'a>>,
    ) -> Parser<'a> {
        Parser {
            origin: origin.to_string(),
            provider,
            expander,
            line_no: 0,
            state: ParseState::TopLevel,
            reports: Vec::new(),
            report_names: HashSet::new(),
            definitions: Vec::new(),
            definition_names: HashSet::new(),
            filters: HashMap::new(),
            tags: HashMap::new(),
            masks: HashMap::new(),
            cur_report: None,
            cur_sink: None,
            cur_def: None,
        }
    }

    fn err(&self, reason: impl Into<String>) -> FlowStatError {
        FlowStatError::Parse {
            path: self.origin.clone(),
            line: self.line_no,
            reason: reason.into(),
        }
    }

    fn expand(&self, raw: &str) -> String {
        let Some(expander) = self.expander else {
            return raw.to_string();
        };
        let mut out = String::with_capacity(raw.len());
        let mut rest = raw;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            match rest[start..].find('}') {
                Some(rel_end) => {
                    let name = &rest[start + 2..start + rel_end];
                    match expander(name) {
                        Some(value) => out.push_str(&value),
                        None => out.push_str(&rest[start..=start + rel_end]),
                    }
                    rest = &rest[start + rel_end + 1..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }

    fn feed_line(&mut self, raw: &str) -> Result<(), FlowStatError> {
        let line = self.expand(raw);
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(());
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let keyword = tokens[0];
        let rest = line[keyword.len()..].trim();

        if TOP_KEYWORDS.contains(&keyword) {
            self.close_blocks()?;
            return self.top_level(keyword, &tokens);
        }

        match self.state {
            ParseState::TopLevel => Err(self.err(format!("unknown directive '{keyword}'"))),
            ParseState::InReport => self.report_directive(keyword, &tokens, rest),
            ParseState::InSink => {
                if SINK_KEYWORDS.contains(&keyword) {
                    self.sink_directive(keyword, &tokens, rest)
                } else {
                    self.close_sink()?;
                    self.state = ParseState::InReport;
                    self.report_directive(keyword, &tokens, rest)
                }
            }
            ParseState::InDefinition => self.definition_directive(keyword, &tokens),
        }
    }

    fn top_level(&mut self, keyword: &str, tokens: &[&str]) -> Result<(), FlowStatError> {
        let arg = |i: usize| -> Result<&str, FlowStatError> {
            tokens
                .get(i)
                .copied()
                .ok_or_else(|| self.err(format!("'{keyword}' needs an argument")))
        };
        match keyword {
            "stat-report" => {
                let name = arg(1)?;
                if self.report_names.contains(name) {
                    return Err(self.err(format!("duplicate stat-report '{name}'")));
                }
                self.cur_report = Some(ReportBuilder {
                    name: name.to_string(),
                    kind: None,
                    filter: None,
                    scale: 0,
                    tag_mask: None,
                    src_addr_mode: AddrMode::Address,
                    dst_addr_mode: AddrMode::Address,
                    sinks: Vec::new(),
                });
                self.state = ParseState::InReport;
            }
            "stat-definition" => {
                let name = arg(1)?;
                if self.definition_names.contains(name) {
                    return Err(self.err(format!("duplicate stat-definition '{name}'")));
                }
                self.cur_def = Some(DefinitionCfg {
                    name: name.to_string(),
                    filter: None,
                    tag: None,
                    mask: None,
                    max_time: 0,
                    reports: Vec::new(),
                    report_idx: Vec::new(),
                    required: FlowFields::NONE,
                });
                self.state = ParseState::InDefinition;
            }
            "include-filter" => {
                let path = arg(1)?.to_string();
                self.provider.include_filter(&path);
            }
            "include-tag" => {
                let path = arg(1)?.to_string();
                self.provider.include_tag(&path);
            }
            "include-mask" => {
                let path = arg(1)?.to_string();
                self.provider.include_mask(&path);
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    fn report_directive(
        &mut self,
        keyword: &str,
        tokens: &[&str],
        _rest: &str,
    ) -> Result<(), FlowStatError> {
        let arg = |i: usize| -> Result<&str, FlowStatError> {
            tokens
                .get(i)
                .copied()
                .ok_or_else(|| self.err(format!("'{keyword}' needs an argument")))
        };
        match keyword {
            "type" => {
                let label = arg(1)?;
                let kind = ReportKind::from_name(label)
                    .ok_or_else(|| self.err(format!("unknown report type '{label}'")))?;
                let report = self.cur_report.as_mut().unwrap();
                if report.kind.is_some() {
                    return Err(self.err("type already set"));
                }
                report.kind = Some(kind);
            }
            "filter" => {
                let name = arg(1)?.to_string();
                let policy = self.provider.filter(&name).ok_or(FlowStatError::UnknownPolicy {
                    kind: PolicyKind::Filter,
                    name: name.clone(),
                })?;
                self.filters.insert(name.clone(), policy);
                self.cur_report.as_mut().unwrap().filter = Some(name);
            }
            "scale" => {
                let scale = parse_u32(arg(1)?)
                    .ok_or_else(|| self.err("scale expects an unsigned integer"))?;
                self.cur_report.as_mut().unwrap().scale = scale;
            }
            "tag-mask" => {
                let src = parse_u32(arg(1)?)
                    .ok_or_else(|| self.err("tag-mask expects two integers"))?;
                let dst = parse_u32(arg(2)?)
                    .ok_or_else(|| self.err("tag-mask expects two integers"))?;
                self.cur_report.as_mut().unwrap().tag_mask = Some((src, dst));
            }
            "ip-source-address-format" => {
                let mode = AddrMode::parse(arg(1)?)
                    .ok_or_else(|| self.err("expected address, prefix-len, or prefix-mask"))?;
                self.cur_report.as_mut().unwrap().src_addr_mode = mode;
            }
            "ip-destination-address-format" => {
                let mode = AddrMode::parse(arg(1)?)
                    .ok_or_else(|| self.err("expected address, prefix-len, or prefix-mask"))?;
                self.cur_report.as_mut().unwrap().dst_addr_mode = mode;
            }
            "output" => {
                let report = self.cur_report.as_ref().unwrap();
                let kind = report
                    .kind
                    .ok_or_else(|| self.err("type must be set before output"))?;
                self.cur_sink = Some(OutputSink::with_default_fields(
                    kind.descr().default_fields,
                ));
                self.state = ParseState::InSink;
            }
            other => return Err(self.err(format!("unknown stat-report directive '{other}'"))),
        }
        Ok(())
    }

    fn sink_directive(
        &mut self,
        keyword: &str,
        tokens: &[&str],
        rest: &str,
    ) -> Result<(), FlowStatError> {
        let arg = |i: usize| -> Result<&str, FlowStatError> {
            tokens
                .get(i)
                .copied()
                .ok_or_else(|| self.err(format!("'{keyword}' needs an argument")))
        };
        match keyword {
            "format" => {
                let format = match arg(1)? {
                    "ascii" => SinkFormat::Ascii,
                    "binary" => SinkFormat::Binary,
                    other => return Err(self.err(format!("unknown output format '{other}'"))),
                };
                self.cur_sink.as_mut().unwrap().format = format;
            }
            "sort" => {
                let token = arg(1)?;
                let spec = SortSpec::parse(token)
                    .ok_or_else(|| self.err(format!("bad sort field '{token}'")))?;
                self.cur_sink.as_mut().unwrap().sort = Some(spec);
            }
            "records" => {
                let n: u64 = arg(1)?
                    .parse()
                    .map_err(|_| self.err("records expects an unsigned integer"))?;
                self.cur_sink.as_mut().unwrap().records = n;
            }
            "tally" => {
                let n: u64 = arg(1)?
                    .parse()
                    .map_err(|_| self.err("tally expects an unsigned integer"))?;
                self.cur_sink.as_mut().unwrap().tally = n;
            }
            "fields" => {
                let mut fields = self.cur_sink.as_ref().unwrap().fields;
                for item in signed_items(tokens) {
                    let (add, name) = split_sign(item)
                        .ok_or_else(|| self.err(format!("field '{item}' needs a +/- sign")))?;
                    let bit = FieldSet::from_name(name)
                        .ok_or_else(|| self.err(format!("unknown field '{name}'")))?;
                    if add {
                        fields.insert(bit);
                    } else {
                        fields.remove(bit);
                    }
                }
                self.cur_sink.as_mut().unwrap().fields = fields;
            }
            "options" => {
                let mut options = self.cur_sink.as_ref().unwrap().options;
                for item in signed_items(tokens) {
                    let (add, name) = split_sign(item)
                        .ok_or_else(|| self.err(format!("option '{item}' needs a +/- sign")))?;
                    let bit = OptionSet::from_name(name)
                        .ok_or_else(|| self.err(format!("unknown option '{name}'")))?;
                    if add {
                        options.insert(bit);
                    } else {
                        options.remove(bit);
                    }
                }
                self.cur_sink.as_mut().unwrap().options = options;
            }
            "path" => {
                if rest.is_empty() {
                    return Err(self.err("path needs an argument"));
                }
                self.cur_sink.as_mut().unwrap().path = Some(rest.to_string());
            }
            "time" => {
                let anchor = TimeAnchor::parse(arg(1)?)
                    .ok_or_else(|| self.err("expected now, start, end, or mid"))?;
                self.cur_sink.as_mut().unwrap().time_anchor = anchor;
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    fn definition_directive(
        &mut self,
        keyword: &str,
        tokens: &[&str],
    ) -> Result<(), FlowStatError> {
        let arg = |i: usize| -> Result<&str, FlowStatError> {
            tokens
                .get(i)
                .copied()
                .ok_or_else(|| self.err(format!("'{keyword}' needs an argument")))
        };
        match keyword {
            "filter" => {
                let name = arg(1)?.to_string();
                let policy = self.provider.filter(&name).ok_or(FlowStatError::UnknownPolicy {
                    kind: PolicyKind::Filter,
                    name: name.clone(),
                })?;
                self.filters.insert(name.clone(), policy);
                self.cur_def.as_mut().unwrap().filter = Some(name);
            }
            "tag" => {
                let name = arg(1)?.to_string();
                let policy = self
                    .provider
                    .tag_policy(&name)
                    .ok_or(FlowStatError::UnknownPolicy {
                        kind: PolicyKind::Tag,
                        name: name.clone(),
                    })?;
                self.tags.insert(name.clone(), policy);
                self.cur_def.as_mut().unwrap().tag = Some(name);
            }
            "mask" => {
                let name = arg(1)?.to_string();
                let policy = self
                    .provider
                    .mask_policy(&name)
                    .ok_or(FlowStatError::UnknownPolicy {
                        kind: PolicyKind::Mask,
                        name: name.clone(),
                    })?;
                self.masks.insert(name.clone(), policy);
                self.cur_def.as_mut().unwrap().mask = Some(name);
            }
            "time-series" => {
                let secs = parse_u32(arg(1)?)
                    .ok_or_else(|| self.err("time-series expects seconds"))?;
                self.cur_def.as_mut().unwrap().max_time = secs;
            }
            "report" => {
                let name = arg(1)?.to_string();
                self.cur_def.as_mut().unwrap().reports.push(name);
            }
            other => {
                return Err(self.err(format!("unknown stat-definition directive '{other}'")));
            }
        }
        Ok(())
    }

    fn close_sink(&mut self) -> Result<(), FlowStatError> {
        let Some(sink) = self.cur_sink.take() else {
            return Ok(());
        };
        let report = self.cur_report.as_mut().unwrap();
        let descr = report.kind.unwrap().descr();

        let excess = sink.fields.excess(descr.allowed_fields);
        if !excess.is_empty() {
            return Err(self.err(format!(
                "fields {excess} not valid for type {}",
                descr.name
            )));
        }
        let bad_options = sink.options.excess(descr.allowed_options);
        if !bad_options.names().is_empty() {
            return Err(self.err(format!(
                "options {bad_options} not valid for type {}",
                descr.name
            )));
        }
        if let Some(sort) = sink.sort {
            if !descr.allowed_fields.contains(sort.field) {
                return Err(self.err(format!(
                    "sort field not valid for type {}",
                    descr.name
                )));
            }
        }
        report.sinks.push(sink);
        Ok(())
    }

    fn close_report(&mut self) -> Result<(), FlowStatError> {
        self.close_sink()?;
        let Some(builder) = self.cur_report.take() else {
            return Ok(());
        };
        let kind = builder
            .kind
            .ok_or_else(|| self.err(format!("stat-report '{}' has no type", builder.name)))?;
        self.report_names.insert(builder.name.clone());
        self.reports.push(Arc::new(Report {
            name: builder.name,
            kind,
            filter: builder.filter,
            scale: builder.scale,
            tag_mask: builder.tag_mask,
            src_addr_mode: builder.src_addr_mode,
            dst_addr_mode: builder.dst_addr_mode,
            sinks: builder.sinks,
        }));
        Ok(())
    }

    fn close_definition(&mut self) {
        if let Some(def) = self.cur_def.take() {
            self.definition_names.insert(def.name.clone());
            self.definitions.push(def);
        }
    }

    fn close_blocks(&mut self) -> Result<(), FlowStatError> {
        self.close_report()?;
        self.close_definition();
        self.state = ParseState::TopLevel;
        Ok(())
    }

    /// Close open blocks and resolve forward report references.
    fn finish(mut self) -> Result<StatConfig, FlowStatError> {
        self.close_blocks()?;

        for def in &mut self.definitions {
            for name in &def.reports {
                let idx = self
                    .reports
                    .iter()
                    .position(|r| &r.name == name)
                    .ok_or_else(|| FlowStatError::UnresolvedReport {
                        definition: def.name.clone(),
                        report: name.clone(),
                    })?;
                def.report_idx.push(idx);
                def.required |= self.reports[idx].required_fields();
            }
        }

        debug!(
            "loaded {}: {} reports, {} definitions",
            self.origin,
            self.reports.len(),
            self.definitions.len()
        );
        Ok(StatConfig {
            reports: self.reports,
            definitions: self.definitions,
            filters: self.filters,
            tags: self.tags,
            masks: self.masks,
        })
    }
}

/// Items of a `+a,+b -c` list: comma- or whitespace-separated signed names.
fn signed_items<'t>(tokens: &'t [&str]) -> impl Iterator<Item = &'t str> {
    tokens[1..]
        .iter()
        .flat_map(|token| token.split(','))
        .filter(|item| !item.is_empty())
}

fn split_sign(item: &str) -> Option<(bool, &str)> {
    match item.as_bytes().first()? {
        b'+' => Some((true, &item[1..])),
        b'-' => Some((false, &item[1..])),
        _ => None,
    }
}

/// Unsigned integer, decimal or `0x`-prefixed hex.
fn parse_u32(token: &str) -> Option<u32> {
    if let Some(hex) = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
    {
        u32::from_str_radix(hex, 16).ok()
    } else {
        token.parse().ok()
    }
}
