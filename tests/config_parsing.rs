use flowstat::{
    FilterVerdict, FlowRecord, FnFilter, NoPolicies, PolicyProvider, PrefixMaskPolicy,
    PrefixTagPolicy, ReportKind, StatConfig, TablePolicies,
};

use std::net::Ipv4Addr;
use std::sync::Arc;

#[test]
fn every_registered_kind_parses_as_a_type() {
    for kind in ReportKind::all() {
        let text = format!(
            "stat-report probe\n  type {}\nstat-definition d\n  report probe\n",
            kind.name()
        );
        let config = StatConfig::parse_str(&text, "all-kinds.cfg", &mut NoPolicies)
            .unwrap_or_else(|err| panic!("kind {} failed: {err}", kind.name()));
        assert_eq!(config.report("probe").unwrap().kind, kind);
    }
}

#[test]
fn catalogue_is_exactly_the_published_set() {
    let names: Vec<&str> = ReportKind::all().map(|k| k.name()).collect();
    assert_eq!(names.len(), 78);
    for anchor in [
        "summary-detail",
        "summary-counters",
        "packet-size",
        "octets",
        "packets",
        "ip-source-port",
        "ip-address",
        "ip-port",
        "ip-source-address-destination-count",
        "ip-destination-address-source-count",
        "ip-source/destination-address/ip-protocol/ip-tos/ip-source/destination-port",
        "linear-interpolated-flows-octets-packets",
        "first",
        "last",
        "duration",
    ] {
        assert!(names.contains(&anchor), "missing kind {anchor}");
    }
}

#[test]
fn full_configuration_with_policies() {
    let mut policies = TablePolicies::new();
    policies.add_filter(
        "tcp-only",
        Arc::new(FnFilter::new(|flow: &FlowRecord| {
            if flow.prot == 6 {
                FilterVerdict::Permit
            } else {
                FilterVerdict::Deny
            }
        })),
    );
    let mut tagger = PrefixTagPolicy::new();
    tagger.add(Ipv4Addr::new(10, 0, 0, 0), 8, 1);
    policies.add_tag_policy("internal", Arc::new(tagger));
    let mut masker = PrefixMaskPolicy::new();
    masker.add(Ipv4Addr::new(10, 0, 0, 0), 8, 24);
    policies.add_mask_policy("campus", Arc::new(masker));

    let text = "\
include-filter /etc/flow/filters.cfg
include-tag /etc/flow/tags.cfg
include-mask /etc/flow/masks.cfg

stat-report by-tag
  type source-tag
  filter tcp-only
  tag-mask 0xFFFF0000 0xFFFF0000
  output
    sort -flows

stat-definition tagged
  filter tcp-only
  tag internal
  mask campus
  time-series 300
  report by-tag
";
    let config = StatConfig::parse_str(text, "full.cfg", &mut policies).unwrap();

    let report = config.report("by-tag").unwrap();
    assert_eq!(report.filter.as_deref(), Some("tcp-only"));
    assert_eq!(report.tag_mask, Some((0xFFFF0000, 0xFFFF0000)));

    let def = config.definition("tagged").unwrap();
    assert_eq!(def.max_time, 300);
    assert_eq!(def.tag.as_deref(), Some("internal"));
    assert_eq!(def.mask.as_deref(), Some("campus"));
    assert_eq!(def.reports, vec!["by-tag".to_string()]);
}

#[test]
fn include_directives_reach_the_provider() {
    #[derive(Default)]
    struct Recording {
        includes: Vec<String>,
    }
    impl PolicyProvider for Recording {
        fn filter(&mut self, _: &str) -> Option<Arc<dyn flowstat::FilterPolicy>> {
            None
        }
        fn tag_policy(&mut self, _: &str) -> Option<Arc<dyn flowstat::TagPolicy>> {
            None
        }
        fn mask_policy(&mut self, _: &str) -> Option<Arc<dyn flowstat::MaskPolicy>> {
            None
        }
        fn include_filter(&mut self, path: &str) {
            self.includes.push(format!("filter:{path}"));
        }
        fn include_tag(&mut self, path: &str) {
            self.includes.push(format!("tag:{path}"));
        }
        fn include_mask(&mut self, path: &str) {
            self.includes.push(format!("mask:{path}"));
        }
    }

    let mut provider = Recording::default();
    StatConfig::parse_str(
        "include-filter /a\ninclude-tag /b\ninclude-mask /c\n",
        "inc.cfg",
        &mut provider,
    )
    .unwrap();
    assert_eq!(
        provider.includes,
        vec!["filter:/a", "tag:/b", "mask:/c"]
    );
}

#[test]
fn parsed_reports_serialize_for_downstream_tools() {
    let text = "\
stat-report ports
  type ip-source-port
  output
    sort -flows
    options +names
";
    let config = StatConfig::parse_str(text, "ser.cfg", &mut NoPolicies).unwrap();
    let json = serde_json::to_value(config.report("ports").unwrap().as_ref()).unwrap();
    assert_eq!(json["kind"], "ip-source-port");
    assert_eq!(json["name"], "ports");
    assert_eq!(json["sinks"][0]["sort"]["descending"], true);
}

#[test]
fn definition_requirements_union_report_requirements() {
    let text = "\
stat-report ports
  type ip-source-port
stat-report nets
  type ip-destination-address
  ip-destination-address-format prefix-mask
stat-definition d
  report ports
  report nets
";
    let config = StatConfig::parse_str(text, "req.cfg", &mut NoPolicies).unwrap();
    let required = config.definition("d").unwrap().required;
    assert!(required.contains(flowstat::FlowFields::SRCPORT));
    assert!(required.contains(flowstat::FlowFields::DSTADDR));
    // prefix-mask display pulls in the prefix length field
    assert!(required.contains(flowstat::FlowFields::DST_MASK));
}
