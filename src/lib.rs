#![doc = include_str!("../README.md")]

pub mod buckets;
pub mod chash;
pub mod config;
pub mod definition;
pub mod flow;
mod output;
pub mod policy;
pub mod protocol;
pub mod rate;
pub mod report;
pub mod symbols;

pub use config::{DefinitionCfg, StatConfig, VarExpander};
pub use definition::{Definition, StatEngine};
pub use flow::{FlowFields, FlowRecord, FlowVersion, V5Header, Wallclock, parse_v5_packet, wallclock};
pub use policy::{
    FilterPolicy, FilterVerdict, FlowSource, FnFilter, MaskPolicy, NoPolicies, PolicyProvider,
    PrefixMaskPolicy, PrefixTagPolicy, TablePolicies, TagPolicy, VecFlowSource,
};
pub use rate::RateStats;
pub use report::{
    AddrMode, Cv, FieldSet, KeyCell, OptionSet, OutputSink, Report, ReportForm, ReportKind,
    ReportTotals, RowData, SinkFormat, SortSpec, StatEntry, TimeAnchor, new_form, prefix_mask,
};
pub use symbols::{MapSymbols, SymClass, SymbolResolver, SymbolSource};

use std::fmt;

/// Collaborator family a failed reference belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    Filter,
    Tag,
    Mask,
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PolicyKind::Filter => "filter",
            PolicyKind::Tag => "tag",
            PolicyKind::Mask => "mask",
        };
        write!(f, "{name}")
    }
}

/// Errors raised while loading configuration or running the engine.
#[derive(Debug)]
pub enum FlowStatError {
    /// Malformed directive, unknown kind, duplicate name, or an illegal
    /// field/option for a kind. Carries the `file:line` it was found at.
    Parse {
        path: String,
        line: u32,
        reason: String,
    },

    /// A definition references a report that never appeared; raised at
    /// end-of-parse resolution.
    UnresolvedReport { definition: String, report: String },

    /// A `filter`/`tag`/`mask` reference the policy provider cannot supply.
    UnknownPolicy { kind: PolicyKind, name: String },

    /// A definition's reports need flow fields the current stream does not
    /// carry. Reported once; the definition then refuses the stream.
    FieldMismatch {
        definition: String,
        missing: FlowFields,
    },

    /// A flow record buffer that does not decode.
    FlowDecode { offset: usize, reason: String },

    /// Configuration or sink I/O failure.
    Io {
        context: String,
        source: std::io::Error,
    },
}

impl fmt::Display for FlowStatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowStatError::Parse { path, line, reason } => {
                write!(f, "{path}:{line}: {reason}")
            }
            FlowStatError::UnresolvedReport { definition, report } => {
                write!(
                    f,
                    "stat-definition {definition} references undefined report '{report}'"
                )
            }
            FlowStatError::UnknownPolicy { kind, name } => {
                write!(f, "unknown {kind} '{name}'")
            }
            FlowStatError::FieldMismatch {
                definition,
                missing,
            } => {
                write!(
                    f,
                    "definition {definition}: flow stream lacks required fields {missing}"
                )
            }
            FlowStatError::FlowDecode { offset, reason } => {
                write!(f, "flow decode error at offset {offset}: {reason}")
            }
            FlowStatError::Io { context, source } => {
                write!(f, "{context}: {source}")
            }
        }
    }
}

impl std::error::Error for FlowStatError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FlowStatError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}
