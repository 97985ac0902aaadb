use flowstat::{FlowRecord, NoPolicies, StatConfig, StatEngine, VecFlowSource};

use std::fs;
use std::net::Ipv4Addr;
use std::path::PathBuf;

fn temp_path(name: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("flowstat-it-{}-{name}", std::process::id()));
    path
}

fn port_flow(srcport: u16, unix_secs: u32) -> FlowRecord {
    FlowRecord {
        srcport,
        unix_secs,
        d_octets: 100,
        d_pkts: 2,
        first: 0,
        last: 1_000,
        ..FlowRecord::default()
    }
}

#[test]
fn top_source_ports_end_to_end() {
    let out = temp_path("ports.csv");
    let config = format!(
        "\
stat-report ports
  type ip-source-port
  output
    sort -flows
    path {}
stat-definition main
  report ports
",
        out.display()
    );
    let config = StatConfig::parse_str(&config, "ports.cfg", &mut NoPolicies).unwrap();
    let mut engine = StatEngine::new(&config);

    let flows: Vec<FlowRecord> = [80u16, 80, 443, 22]
        .iter()
        .map(|p| port_flow(*p, 1_000))
        .collect();
    let mut source = VecFlowSource::new(flows);
    engine.run(&mut source).unwrap();

    let text = fs::read_to_string(&out).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], "80,2,200,4,2000");
    // the two singletons follow in either order
    assert!(lines[1..].iter().all(|l| l.ends_with(",1,100,2,1000")));

    let def = engine.definition("main").unwrap();
    let totals = def.report_totals("ports").unwrap();
    assert_eq!(totals.flows, 4);
    assert_eq!(def.report_entries("ports"), Some(3));

    let _ = fs::remove_file(&out);
}

#[test]
fn percent_mode_shares() {
    let out = temp_path("percent.csv");
    let config = format!(
        "\
stat-report ports
  type ip-source-port
  output
    sort -flows
    fields -octets,-packets,-duration
    options +percent-total
    path {}
stat-definition main
  report ports
",
        out.display()
    );
    let config = StatConfig::parse_str(&config, "percent.cfg", &mut NoPolicies).unwrap();
    let mut engine = StatEngine::new(&config);
    for port in [80u16, 80, 443, 22] {
        engine.process(&port_flow(port, 1_000)).unwrap();
    }
    engine.finish().unwrap();

    let text = fs::read_to_string(&out).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "80,50.000000");
    assert!(lines[1..]
        .iter()
        .all(|l| l.ends_with(",25.000000")));

    let _ = fs::remove_file(&out);
}

#[test]
fn prefix_aggregation_collapses_to_one_bucket() {
    let out = temp_path("prefix.csv");
    let config = format!(
        "\
stat-report nets
  type ip-source-address
  ip-source-address-format prefix-mask
  output
    path {}
stat-definition main
  report nets
",
        out.display()
    );
    let config = StatConfig::parse_str(&config, "prefix.cfg", &mut NoPolicies).unwrap();
    let mut engine = StatEngine::new(&config);

    for host in [Ipv4Addr::new(10, 1, 2, 3), Ipv4Addr::new(10, 1, 99, 99)] {
        let flow = FlowRecord {
            srcaddr: host,
            src_mask: 16,
            d_octets: 50,
            d_pkts: 1,
            ..FlowRecord::default()
        };
        engine.process(&flow).unwrap();
    }
    engine.finish().unwrap();

    let text = fs::read_to_string(&out).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("10.1.0.0/16,2,"));

    let _ = fs::remove_file(&out);
}

#[test]
fn distinct_destinations_per_source() {
    let out = temp_path("count.csv");
    let config = format!(
        "\
stat-report fanout
  type ip-source-address-destination-count
  output
    sort -count
    path {}
stat-definition main
  report fanout
",
        out.display()
    );
    let config = StatConfig::parse_str(&config, "count.cfg", &mut NoPolicies).unwrap();
    let mut engine = StatEngine::new(&config);

    let a = Ipv4Addr::new(10, 0, 0, 1);
    let d = Ipv4Addr::new(10, 0, 0, 9);
    let b = Ipv4Addr::new(172, 16, 0, 1);
    let c = Ipv4Addr::new(172, 16, 0, 2);
    for (src, dst) in [(a, b), (a, c), (a, c), (d, b)] {
        let flow = FlowRecord {
            srcaddr: src,
            dstaddr: dst,
            d_octets: 10,
            d_pkts: 1,
            ..FlowRecord::default()
        };
        engine.process(&flow).unwrap();
    }
    engine.finish().unwrap();

    let def = engine.definition("main").unwrap();
    assert_eq!(def.report_totals("fanout").unwrap().count, 3);

    let text = fs::read_to_string(&out).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    // sorted by distinct destination count: A (2) first, D (1) second
    assert!(lines[0].starts_with("10.0.0.1,"));
    assert!(lines[0].ends_with(",2"));
    assert!(lines[1].starts_with("10.0.0.9,"));
    assert!(lines[1].ends_with(",1"));

    let _ = fs::remove_file(&out);
}

#[test]
fn linear_interpolation_spreads_per_second() {
    let out = temp_path("linear.csv");
    let config = format!(
        "\
stat-report persec
  type linear-interpolated-flows-octets-packets
  output
    sort +key
    path {}
stat-definition main
  report persec
",
        out.display()
    );
    let config = StatConfig::parse_str(&config, "linear.cfg", &mut NoPolicies).unwrap();
    let mut engine = StatEngine::new(&config);

    // export at t=200 with 100s uptime; flow alive t=100..=103
    let flow = FlowRecord {
        unix_secs: 200,
        sys_uptime: 100_000,
        first: 0,
        last: 3_000,
        d_octets: 400,
        d_pkts: 4,
        ..FlowRecord::default()
    };
    engine.process(&flow).unwrap();
    engine.finish().unwrap();

    let text = fs::read_to_string(&out).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(
        lines,
        vec![
            "100,0.250000,100.000000,1.000000",
            "101,0.250000,100.000000,1.000000",
            "102,0.250000,100.000000,1.000000",
            "103,0.250000,100.000000,1.000000",
        ]
    );

    let _ = fs::remove_file(&out);
}

#[test]
fn time_series_dumps_each_interval() {
    let out = temp_path("series.csv");
    let config = format!(
        "\
stat-report ports
  type ip-source-port
  output
    options +header
    path {}
stat-definition ts
  time-series 60
  report ports
",
        out.display()
    );
    let config = StatConfig::parse_str(&config, "series.cfg", &mut NoPolicies).unwrap();
    let mut engine = StatEngine::new(&config);

    let base = 1_000;
    for t in [0u32, 10, 59, 60, 61] {
        engine.process(&port_flow(80, base + t)).unwrap();
    }
    let def = engine.definition("ts").unwrap();
    assert_eq!(def.interval(), 1);
    engine.finish().unwrap();

    let text = fs::read_to_string(&out).unwrap();
    // header once, then one data row per interval (appended)
    assert_eq!(text.matches("Report Information").count(), 1);
    let data: Vec<&str> = text
        .lines()
        .filter(|l| !l.starts_with('#'))
        .collect();
    assert_eq!(data, vec!["80,3,300,6,3000", "80,2,200,4,2000"]);

    let _ = fs::remove_file(&out);
}

#[test]
fn sort_ascending_yields_non_decreasing_octets() {
    let config = "\
stat-report ports
  type ip-source-port
stat-definition main
  report ports
";
    let config = StatConfig::parse_str(config, "sorted.cfg", &mut NoPolicies).unwrap();
    let mut engine = StatEngine::new(&config);

    for (port, reps) in [(20u16, 3u32), (21, 1), (22, 5), (23, 2)] {
        for _ in 0..reps {
            engine.process(&port_flow(port, 500)).unwrap();
        }
    }
    engine.finish().unwrap();

    let def = engine.definition_mut("main").unwrap();
    let rows = def
        .report_rows(
            "ports",
            Some(flowstat::SortSpec {
                field: flowstat::FieldSet::OCTETS,
                descending: false,
            }),
        )
        .unwrap();
    let octets: Vec<f64> = rows.iter().map(|r| r.octets.as_f64()).collect();
    let mut sorted = octets.clone();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    assert_eq!(octets, sorted);

    // bucket sums equal report totals
    let totals = def.report_totals("ports").unwrap();
    let flows: f64 = rows.iter().map(|r| r.flows.as_f64()).sum();
    assert_eq!(flows as u64, totals.flows);
}

#[test]
fn pipeline_sink_feeds_a_shell_command() {
    let out = temp_path("piped.csv");
    let config = format!(
        "\
stat-report ports
  type ip-source-port
  output
    path |cat > {}
stat-definition main
  report ports
",
        out.display()
    );
    let config = StatConfig::parse_str(&config, "pipe.cfg", &mut NoPolicies).unwrap();
    let mut engine = StatEngine::new(&config);
    engine.process(&port_flow(80, 100)).unwrap();
    engine.finish().unwrap();

    let text = fs::read_to_string(&out).unwrap();
    assert_eq!(text, "80,1,100,2,1000\n");

    let _ = fs::remove_file(&out);
}

#[test]
fn binary_sink_writes_records() {
    let out = temp_path("rows.bin");
    let config = format!(
        "\
stat-report ports
  type ip-source-port
  output
    format binary
    path {}
stat-definition main
  report ports
",
        out.display()
    );
    let config = StatConfig::parse_str(&config, "bin.cfg", &mut NoPolicies).unwrap();
    let mut engine = StatEngine::new(&config);
    engine.process(&port_flow(80, 100)).unwrap();
    engine.finish().unwrap();

    let bytes = fs::read(&out).unwrap();
    assert!(!bytes.is_empty());

    let _ = fs::remove_file(&out);
}
