//! Report output sinks.
//!
//! Each sink renders one report: CSV rows in a fixed column order, or a
//! binary record stream. Paths pass through `strftime` seeded by the sink's
//! time anchor; a leading `|` runs the remainder as a shell pipeline. The
//! first interval truncates files, later intervals append. A failing sink
//! never cancels its siblings.

use crate::report::{
    Cv, FieldSet, KeyCell, OptionSet, OutputSink, Report, ReportForm, ReportTotals, RowData,
    SinkFormat, TimeAnchor,
};
use crate::symbols::SymbolResolver;
use crate::FlowStatError;

use chrono::format::{Item, StrftimeItems};
use chrono::{Local, TimeZone};
use log::{debug, warn};

use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::net::Ipv4Addr;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

/// Shared dump context: symbol tables plus the stream header for `+xheader`.
pub(crate) struct DumpEnv<'a> {
    pub resolver: &'a mut SymbolResolver,
    pub xheader: &'a [String],
}

/// Dump one report through every sink it carries.
///
/// Sink failures are logged and the first one is reported after all sinks
/// have been attempted.
pub(crate) fn dump_report(
    report: &Report,
    form: &mut dyn ReportForm,
    env: &mut DumpEnv<'_>,
    interval: u32,
) -> Result<(), FlowStatError> {
    let mut first_err = None;
    for sink in &report.sinks {
        form.sort(sink.sort.as_ref());
        if let Err(err) = emit_sink(report, &*form, sink, env, interval) {
            warn!("report {}: sink failed: {err}", report.name);
            first_err.get_or_insert(err);
        }
    }
    debug!(
        "report {} dumped: {} entries, interval {interval}",
        report.name,
        form.entries()
    );
    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn emit_sink(
    report: &Report,
    form: &dyn ReportForm,
    sink: &OutputSink,
    env: &mut DumpEnv<'_>,
    interval: u32,
) -> Result<(), FlowStatError> {
    let anchor = anchor_secs(sink.time_anchor, form.totals());
    let mut out = SinkWriter::open(sink, anchor, interval)?;
    let result = match sink.format {
        SinkFormat::Ascii => emit_ascii(&mut out, report, form, sink, env, interval),
        SinkFormat::Binary => emit_binary(&mut out, report, form, sink),
    };
    out.close();
    result.map_err(|source| FlowStatError::Io {
        context: format!(
            "writing sink {} of report {}",
            sink.path.as_deref().unwrap_or("<stdout>"),
            report.name
        ),
        source,
    })
}

/// Running sums backing `#TALLY` lines.
#[derive(Default)]
struct RowTally {
    written: u64,
    flows: f64,
    octets: f64,
    packets: f64,
    avg_bps: f64,
    avg_pps: f64,
}

fn emit_ascii(
    w: &mut dyn Write,
    report: &Report,
    form: &dyn ReportForm,
    sink: &OutputSink,
    env: &mut DumpEnv<'_>,
    interval: u32,
) -> io::Result<()> {
    let totals = form.totals();

    if sink.options.contains(OptionSet::HEADER) && interval == 0 {
        write_header(w, report, sink)?;
    }
    if sink.options.contains(OptionSet::XHEADER) {
        for line in env.xheader {
            writeln!(w, "# {line}")?;
        }
    }
    if sink.options.contains(OptionSet::TOTALS) {
        writeln!(w, "# rec1: flows,octets,packets,duration,recs,ignores")?;
        writeln!(
            w,
            "# {},{},{},{},{},{}",
            totals.flows,
            totals.octets,
            totals.packets,
            totals.duration,
            totals.recs,
            totals.ignores
        )?;
    }

    let entries = form.entries();
    let rates_wanted = sink.fields.intersects(FieldSet::RATES);
    let mut tally = RowTally::default();
    let mut io_err: Option<io::Error> = None;

    form.for_each_row(report, &mut |row| {
        if sink.records > 0 && tally.written >= sink.records {
            if let Err(err) = writeln!(w, "# stop, hit record limit.") {
                io_err = Some(err);
            }
            return false;
        }

        if let Err(err) = write_row(w, sink, &row, &tally, totals, env.resolver) {
            io_err = Some(err);
            return false;
        }

        tally.written += 1;
        tally.flows += row.flows.as_f64();
        tally.octets += row.octets.as_f64();
        tally.packets += row.packets.as_f64();
        if let Some(rates) = row.rates {
            tally.avg_bps += rates.avg_bps;
            tally.avg_pps += rates.avg_pps;
        }

        if sink.tally > 0 && tally.written % sink.tally == 0 {
            if let Err(err) = write_tally(w, &tally, entries, totals, rates_wanted) {
                io_err = Some(err);
                return false;
            }
        }
        true
    });

    match io_err {
        Some(err) => Err(err),
        None => w.flush(),
    }
}

fn write_header(w: &mut dyn Write, report: &Report, sink: &OutputSink) -> io::Result<()> {
    writeln!(w, "# --- ---- ---- Report Information --- --- ---")?;
    writeln!(
        w,
        "# build version:      flowstat {}",
        env!("CARGO_PKG_VERSION")
    )?;
    writeln!(w, "# name:               {}", report.name)?;
    writeln!(w, "# type:               {}", report.kind.name())?;
    writeln!(w, "# scale:              {}", report.scale)?;
    if let Some((src, dst)) = report.tag_mask {
        writeln!(w, "# tag mask:           {src:#010x} {dst:#010x}")?;
    }
    if let Some(filter) = &report.filter {
        writeln!(w, "# filter:             {filter}")?;
    }
    writeln!(
        w,
        "# ip source address format: {}",
        report.src_addr_mode.name()
    )?;
    writeln!(
        w,
        "# ip destination address format: {}",
        report.dst_addr_mode.name()
    )?;
    if let Some(sort) = sink.sort {
        let sign = if sort.descending { '-' } else { '+' };
        let name = sort.field.names().first().copied().unwrap_or("key");
        writeln!(w, "# sort:               {sign}{name}")?;
    }
    writeln!(w, "# fields:             {}", sink.fields)?;
    writeln!(w, "# options:            {}", sink.options)?;
    writeln!(w, "# records:            {}", sink.records)?;
    writeln!(w, "# tally:              {}", sink.tally)?;
    Ok(())
}

fn write_tally(
    w: &mut dyn Write,
    tally: &RowTally,
    entries: u64,
    totals: &ReportTotals,
    rates: bool,
) -> io::Result<()> {
    write!(
        w,
        "#TALLY %recs={:.6} %flows={:.6} %octets={:.6} %packets={:.6}",
        percent(tally.written as f64, entries as f64),
        percent(tally.flows, totals.flows as f64),
        percent(tally.octets, totals.octets as f64),
        percent(tally.packets, totals.packets as f64),
    )?;
    if rates && tally.written > 0 {
        write!(
            w,
            " %avg-bps={:.6} %avg-pps={:.6}",
            tally.avg_bps / tally.written as f64,
            tally.avg_pps / tally.written as f64,
        )?;
    }
    writeln!(w)
}

fn percent(part: f64, whole: f64) -> f64 {
    if whole > 0.0 { part * 100.0 / whole } else { 0.0 }
}

const KEY_FIELDS: [FieldSet; 6] = [
    FieldSet::KEY1,
    FieldSet::KEY2,
    FieldSet::KEY3,
    FieldSet::KEY4,
    FieldSet::KEY5,
    FieldSet::KEY6,
];

fn write_row(
    w: &mut dyn Write,
    sink: &OutputSink,
    row: &RowData,
    tally: &RowTally,
    totals: &ReportTotals,
    resolver: &mut SymbolResolver,
) -> io::Result<()> {
    let fields = sink.fields;
    let percent_mode = sink.options.contains(OptionSet::PERCENT);
    let names = sink.options.contains(OptionSet::NAMES);

    let mut cols: Vec<String> = Vec::new();
    if fields.contains(FieldSet::INDEX) {
        cols.push(tally.written.to_string());
    }
    if fields.contains(FieldSet::FIRST) {
        let first = if row.first == u32::MAX { 0 } else { row.first };
        cols.push(first.to_string());
    }
    if fields.contains(FieldSet::LAST) {
        cols.push(row.last.to_string());
    }
    for (i, cell) in row.cells.iter().enumerate() {
        if i < KEY_FIELDS.len() && fields.contains(KEY_FIELDS[i]) {
            cols.push(render_cell(cell, names, resolver));
        }
    }

    let counter = |value: Cv, whole: u64| -> String {
        if percent_mode {
            format!("{:.6}", percent(value.as_f64(), whole as f64))
        } else {
            value.to_string()
        }
    };
    if fields.contains(FieldSet::FLOWS) {
        cols.push(counter(row.flows, totals.flows));
    }
    if fields.contains(FieldSet::OCTETS) {
        cols.push(counter(row.octets, totals.octets));
    }
    if fields.contains(FieldSet::PACKETS) {
        cols.push(counter(row.packets, totals.packets));
    }
    if fields.contains(FieldSet::DURATION) {
        cols.push(counter(row.duration, totals.duration));
    }
    if fields.contains(FieldSet::COUNT) {
        let count = row.count.unwrap_or(0);
        cols.push(counter(Cv::U(count), totals.count));
    }

    let rates = row.rates.unwrap_or_default();
    for (bit, value) in [
        (FieldSet::AVG_BPS, rates.avg_bps),
        (FieldSet::MIN_BPS, rates.min_bps),
        (FieldSet::MAX_BPS, rates.max_bps),
        (FieldSet::AVG_PPS, rates.avg_pps),
        (FieldSet::MIN_PPS, rates.min_pps),
        (FieldSet::MAX_PPS, rates.max_pps),
    ] {
        if fields.contains(bit) {
            cols.push(format!("{value:.6}"));
        }
    }
    if fields.contains(FieldSet::FRECS) {
        cols.push(row.recs.to_string());
    }

    writeln!(w, "{}", cols.join(","))
}

fn render_cell(cell: &KeyCell, names: bool, resolver: &mut SymbolResolver) -> String {
    match cell {
        KeyCell::Addr { addr, mask } => {
            let addr = Ipv4Addr::from(*addr);
            match mask {
                Some(len) => format!("{addr}/{len}"),
                None => addr.to_string(),
            }
        }
        KeyCell::Num { value, class } => {
            if names {
                if let Some(alias) = u32::try_from(*value)
                    .ok()
                    .and_then(|v| resolver.resolve(*class, v))
                {
                    return alias;
                }
            }
            value.to_string()
        }
        KeyCell::Time(secs) => secs.to_string(),
        KeyCell::Label(label) => (*label).to_string(),
    }
}

fn emit_binary(
    w: &mut dyn Write,
    report: &Report,
    form: &dyn ReportForm,
    sink: &OutputSink,
) -> io::Result<()> {
    let mut written = 0u64;
    let mut io_err: Option<io::Error> = None;
    form.for_each_row(report, &mut |row| {
        if sink.records > 0 && written >= sink.records {
            return false;
        }
        match bincode::serialize_into(&mut *w, &row) {
            Ok(()) => {
                written += 1;
                true
            }
            Err(err) => {
                io_err = Some(io::Error::other(err));
                false
            }
        }
    });
    match io_err {
        Some(err) => Err(err),
        None => w.flush(),
    }
}

fn anchor_secs(anchor: TimeAnchor, totals: &ReportTotals) -> u32 {
    let start = if totals.time_start == u32::MAX {
        0
    } else {
        totals.time_start
    };
    match anchor {
        TimeAnchor::Now => SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0),
        TimeAnchor::Start => start,
        TimeAnchor::End => totals.time_end,
        TimeAnchor::Mid => ((u64::from(start) + u64::from(totals.time_end)) / 2) as u32,
    }
}

/// `strftime`-expand a sink path against the anchor instant.
///
/// Unrecognized format items leave the path untouched rather than failing
/// the dump.
fn expand_path(path: &str, anchor_secs: u32) -> String {
    if !path.contains('%') {
        return path.to_string();
    }
    let Some(when) = Local
        .timestamp_opt(i64::from(anchor_secs), 0)
        .single()
    else {
        return path.to_string();
    };
    let items: Vec<Item<'_>> = StrftimeItems::new(path).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        warn!("sink path '{path}': unrecognized strftime item, using the literal path");
        return path.to_string();
    }
    when.format_with_items(items.into_iter()).to_string()
}

enum SinkWriter {
    Stdout(io::Stdout),
    File(BufWriter<fs::File>),
    Pipe {
        child: Child,
        stdin: Option<ChildStdin>,
        command: String,
    },
}

impl SinkWriter {
    fn open(sink: &OutputSink, anchor: u32, interval: u32) -> Result<SinkWriter, FlowStatError> {
        let Some(path) = &sink.path else {
            return Ok(SinkWriter::Stdout(io::stdout()));
        };
        let expanded = expand_path(path, anchor);

        if let Some(command) = expanded.strip_prefix('|') {
            let command = command.trim().to_string();
            let mut child = Command::new("/bin/sh")
                .arg("-c")
                .arg(&command)
                .stdin(Stdio::piped())
                .spawn()
                .map_err(|source| FlowStatError::Io {
                    context: format!("spawning pipeline '{command}'"),
                    source,
                })?;
            let stdin = child.stdin.take();
            return Ok(SinkWriter::Pipe {
                child,
                stdin,
                command,
            });
        }

        let target = Path::new(&expanded);
        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() {
                // parents are always 0755, independent of the umask
                fs::DirBuilder::new()
                    .recursive(true)
                    .mode(0o755)
                    .create(parent)
                    .map_err(|source| FlowStatError::Io {
                        context: format!("creating {}", parent.display()),
                        source,
                    })?;
            }
        }
        let file = if interval == 0 {
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(target)
        } else {
            OpenOptions::new().append(true).create(true).open(target)
        }
        .map_err(|source| FlowStatError::Io {
            context: format!("opening {expanded}"),
            source,
        })?;
        Ok(SinkWriter::File(BufWriter::new(file)))
    }

    /// Close the writer; a pipeline's non-zero exit is a warning, not an
    /// error.
    fn close(self) {
        match self {
            SinkWriter::Stdout(mut out) => {
                let _ = out.flush();
            }
            SinkWriter::File(mut file) => {
                let _ = file.flush();
            }
            SinkWriter::Pipe {
                mut child,
                stdin,
                command,
            } => {
                drop(stdin);
                match child.wait() {
                    Ok(status) if !status.success() => {
                        warn!("pipeline '{command}' exited with {status}");
                    }
                    Err(err) => warn!("pipeline '{command}': wait failed: {err}"),
                    Ok(_) => {}
                }
            }
        }
    }
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            SinkWriter::Stdout(out) => out.write(buf),
            SinkWriter::File(file) => file.write(buf),
            SinkWriter::Pipe { stdin, .. } => match stdin.as_mut() {
                Some(stdin) => stdin.write(buf),
                None => Err(io::Error::other("pipeline stdin closed")),
            },
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            SinkWriter::Stdout(out) => out.flush(),
            SinkWriter::File(file) => file.flush(),
            SinkWriter::Pipe { stdin, .. } => match stdin.as_mut() {
                Some(stdin) => stdin.flush(),
                None => Ok(()),
            },
        }
    }
}
