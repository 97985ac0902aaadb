//! Collaborator interfaces: filters, tag policies, mask policies, flow
//! sources.
//!
//! The report engine treats these as external providers. Traits define the
//! contract; the built-in implementations here cover programmatic use and
//! testing, not the providers' own rule languages.

use crate::flow::FlowRecord;
use crate::FlowStatError;

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Outcome of evaluating a filter against one flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterVerdict {
    Permit,
    Deny,
}

/// Predicate deciding whether a flow participates.
pub trait FilterPolicy: Send + Sync {
    fn eval(&self, flow: &FlowRecord) -> FilterVerdict;
}

/// Rewrites `src_tag`/`dst_tag` in place.
///
/// Callers upcast the flow to the tagged variant before applying.
pub trait TagPolicy: Send + Sync {
    fn apply(&self, flow: &mut FlowRecord);
}

/// Overrides `src_mask`/`dst_mask` in place from a prefix lookup.
pub trait MaskPolicy: Send + Sync {
    fn apply(&self, flow: &mut FlowRecord);
}

/// Stream of flow records; `None` at end of input.
pub trait FlowSource {
    fn read(&mut self) -> Result<Option<FlowRecord>, FlowStatError>;

    /// Human-readable description of the stream, one line per entry, used by
    /// the extended header output.
    fn header_lines(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Resolves policy names for the configuration loader.
///
/// `include-*` directives hand the override path to the provider before any
/// lookup; a `None` return surfaces as a load error naming the reference.
pub trait PolicyProvider {
    fn filter(&mut self, name: &str) -> Option<Arc<dyn FilterPolicy>>;
    fn tag_policy(&mut self, name: &str) -> Option<Arc<dyn TagPolicy>>;
    fn mask_policy(&mut self, name: &str) -> Option<Arc<dyn MaskPolicy>>;

    fn include_filter(&mut self, _path: &str) {}
    fn include_tag(&mut self, _path: &str) {}
    fn include_mask(&mut self, _path: &str) {}
}

/// Provider with no policies; any reference fails the load.
#[derive(Debug, Default)]
pub struct NoPolicies;

impl PolicyProvider for NoPolicies {
    fn filter(&mut self, _name: &str) -> Option<Arc<dyn FilterPolicy>> {
        None
    }
    fn tag_policy(&mut self, _name: &str) -> Option<Arc<dyn TagPolicy>> {
        None
    }
    fn mask_policy(&mut self, _name: &str) -> Option<Arc<dyn MaskPolicy>> {
        None
    }
}

/// Provider over registered policy objects, keyed by name.
#[derive(Default)]
pub struct TablePolicies {
    filters: HashMap<String, Arc<dyn FilterPolicy>>,
    tags: HashMap<String, Arc<dyn TagPolicy>>,
    masks: HashMap<String, Arc<dyn MaskPolicy>>,
}

impl TablePolicies {
    pub fn new() -> TablePolicies {
        TablePolicies::default()
    }

    pub fn add_filter(&mut self, name: &str, policy: Arc<dyn FilterPolicy>) -> &mut Self {
        self.filters.insert(name.to_string(), policy);
        self
    }

    pub fn add_tag_policy(&mut self, name: &str, policy: Arc<dyn TagPolicy>) -> &mut Self {
        self.tags.insert(name.to_string(), policy);
        self
    }

    pub fn add_mask_policy(&mut self, name: &str, policy: Arc<dyn MaskPolicy>) -> &mut Self {
        self.masks.insert(name.to_string(), policy);
        self
    }
}

impl fmt::Debug for TablePolicies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TablePolicies")
            .field("filters", &self.filters.keys().collect::<Vec<_>>())
            .field("tags", &self.tags.keys().collect::<Vec<_>>())
            .field("masks", &self.masks.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PolicyProvider for TablePolicies {
    fn filter(&mut self, name: &str) -> Option<Arc<dyn FilterPolicy>> {
        self.filters.get(name).cloned()
    }
    fn tag_policy(&mut self, name: &str) -> Option<Arc<dyn TagPolicy>> {
        self.tags.get(name).cloned()
    }
    fn mask_policy(&mut self, name: &str) -> Option<Arc<dyn MaskPolicy>> {
        self.masks.get(name).cloned()
    }
}

/// Filter backed by a plain closure.
pub struct FnFilter<F>(F);

impl<F> FnFilter<F>
where
    F: Fn(&FlowRecord) -> FilterVerdict + Send + Sync,
{
    pub fn new(f: F) -> FnFilter<F> {
        FnFilter(f)
    }
}

impl<F> FilterPolicy for FnFilter<F>
where
    F: Fn(&FlowRecord) -> FilterVerdict + Send + Sync,
{
    fn eval(&self, flow: &FlowRecord) -> FilterVerdict {
        (self.0)(flow)
    }
}

#[derive(Debug, Clone, Copy)]
struct PrefixEntry<T> {
    net: u32,
    len: u8,
    value: T,
}

/// Longest-prefix-match table over IPv4 prefixes.
///
/// Entries are kept ordered by descending prefix length so the first match
/// wins.
#[derive(Debug, Clone, Default)]
struct PrefixTable<T> {
    entries: Vec<PrefixEntry<T>>,
}

impl<T: Copy> PrefixTable<T> {
    fn add(&mut self, prefix: Ipv4Addr, len: u8, value: T) {
        let len = len.min(32);
        let net = u32::from(prefix) & crate::report::prefix_mask(len);
        let entry = PrefixEntry { net, len, value };
        let pos = self
            .entries
            .partition_point(|e| e.len >= len);
        self.entries.insert(pos, entry);
    }

    fn lookup(&self, addr: Ipv4Addr) -> Option<T> {
        let addr = u32::from(addr);
        self.entries
            .iter()
            .find(|e| addr & crate::report::prefix_mask(e.len) == e.net)
            .map(|e| e.value)
    }
}

/// Mask policy rewriting prefix lengths from a longest-prefix lookup.
///
/// The source address decides `src_mask`, the destination address decides
/// `dst_mask`; a miss leaves the field untouched.
#[derive(Debug, Clone, Default)]
pub struct PrefixMaskPolicy {
    table: PrefixTable<u8>,
}

impl PrefixMaskPolicy {
    pub fn new() -> PrefixMaskPolicy {
        PrefixMaskPolicy::default()
    }

    /// Register `prefix/len -> new_mask`.
    pub fn add(&mut self, prefix: Ipv4Addr, len: u8, new_mask: u8) -> &mut Self {
        self.table.add(prefix, len, new_mask.min(32));
        self
    }
}

impl MaskPolicy for PrefixMaskPolicy {
    fn apply(&self, flow: &mut FlowRecord) {
        if let Some(mask) = self.table.lookup(flow.srcaddr) {
            flow.src_mask = mask;
        }
        if let Some(mask) = self.table.lookup(flow.dstaddr) {
            flow.dst_mask = mask;
        }
    }
}

/// Tag policy assigning endpoint tags from a longest-prefix lookup.
#[derive(Debug, Clone, Default)]
pub struct PrefixTagPolicy {
    table: PrefixTable<u32>,
}

impl PrefixTagPolicy {
    pub fn new() -> PrefixTagPolicy {
        PrefixTagPolicy::default()
    }

    /// Register `prefix/len -> tag` for both endpoints.
    pub fn add(&mut self, prefix: Ipv4Addr, len: u8, tag: u32) -> &mut Self {
        self.table.add(prefix, len, tag);
        self
    }
}

impl TagPolicy for PrefixTagPolicy {
    fn apply(&self, flow: &mut FlowRecord) {
        if let Some(tag) = self.table.lookup(flow.srcaddr) {
            flow.src_tag = tag;
        }
        if let Some(tag) = self.table.lookup(flow.dstaddr) {
            flow.dst_tag = tag;
        }
    }
}

/// In-memory flow source.
#[derive(Debug, Clone, Default)]
pub struct VecFlowSource {
    flows: std::collections::VecDeque<FlowRecord>,
    header: Vec<String>,
}

impl VecFlowSource {
    pub fn new(flows: impl IntoIterator<Item = FlowRecord>) -> VecFlowSource {
        VecFlowSource {
            flows: flows.into_iter().collect(),
            header: Vec::new(),
        }
    }

    pub fn with_header_lines(mut self, lines: Vec<String>) -> VecFlowSource {
        self.header = lines;
        self
    }
}

impl FlowSource for VecFlowSource {
    fn read(&mut self) -> Result<Option<FlowRecord>, FlowStatError> {
        Ok(self.flows.pop_front())
    }

    fn header_lines(&self) -> Vec<String> {
        self.header.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_prefix_wins() {
        let mut policy = PrefixMaskPolicy::new();
        policy
            .add(Ipv4Addr::new(10, 0, 0, 0), 8, 8)
            .add(Ipv4Addr::new(10, 1, 0, 0), 16, 24);

        let mut flow = FlowRecord {
            srcaddr: Ipv4Addr::new(10, 1, 2, 3),
            dstaddr: Ipv4Addr::new(10, 200, 0, 1),
            src_mask: 32,
            dst_mask: 32,
            ..FlowRecord::default()
        };
        policy.apply(&mut flow);
        assert_eq!(flow.src_mask, 24);
        assert_eq!(flow.dst_mask, 8);
    }

    #[test]
    fn mask_miss_leaves_field_untouched() {
        let mut policy = PrefixMaskPolicy::new();
        policy.add(Ipv4Addr::new(10, 0, 0, 0), 8, 16);

        let mut flow = FlowRecord {
            srcaddr: Ipv4Addr::new(192, 168, 1, 1),
            dstaddr: Ipv4Addr::new(10, 0, 0, 5),
            src_mask: 27,
            ..FlowRecord::default()
        };
        policy.apply(&mut flow);
        assert_eq!(flow.src_mask, 27);
        assert_eq!(flow.dst_mask, 16);
    }

    #[test]
    fn prefix_tags_assign_both_endpoints() {
        let mut policy = PrefixTagPolicy::new();
        policy.add(Ipv4Addr::new(172, 16, 0, 0), 12, 0xA0);

        let mut flow = FlowRecord {
            srcaddr: Ipv4Addr::new(172, 16, 9, 9),
            dstaddr: Ipv4Addr::new(8, 8, 8, 8),
            ..FlowRecord::default()
        };
        policy.apply(&mut flow);
        assert_eq!(flow.src_tag, 0xA0);
        assert_eq!(flow.dst_tag, 0);
    }
}
