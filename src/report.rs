//! Aggregated view of a decoded stream
//!
//! Groups events by the source location they were charged to, the way the
//! allocation report of the `memprof` binary prints them. Symbols are
//! resolved in stream order, so a prototype address reused after a dynamic
//! symbol insertion resolves to the newer prototype from that point on.

use crate::attribution::{AllocEvent, AllocSource};
use crate::decode::{Record, Stream, Symbol};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write;

/// Totals for one source location
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceRow {
    pub location: String,
    pub events: u64,
    /// Bytes obtained (new sizes).
    pub allocated: u64,
    /// Bytes given back (old sizes).
    pub freed: u64,
}

/// Memory still held at the end of the stream, by allocating location
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LeakRow {
    pub location: String,
    pub blocks: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Report {
    pub allocations: Vec<SourceRow>,
    pub reallocations: Vec<SourceRow>,
    pub deallocations: Vec<SourceRow>,
    pub leaks: Vec<LeakRow>,
    /// The stream ended with an epilogue.
    pub complete: bool,
}

#[derive(Default)]
struct SymbolIndex {
    protos: HashMap<u64, (String, u64)>,
    traces: HashMap<u64, (u64, u64)>,
}

impl SymbolIndex {
    fn learn(&mut self, symbol: &Symbol) {
        match symbol {
            Symbol::Lfunc {
                identity,
                chunk_name,
                first_line,
            } => {
                self.protos
                    .insert(*identity, (chunk_name.clone(), *first_line));
            }
            Symbol::Trace {
                trace_no,
                owner_identity,
                start_line,
                ..
            } => {
                self.traces
                    .insert(*trace_no, (*owner_identity, *start_line));
            }
        }
    }

    fn function(&self, proto: u64) -> String {
        match self.protos.get(&proto) {
            Some((chunk, first_line)) => format!("@{}:{}", chunk, first_line),
            None => format!("@0x{:x}", proto),
        }
    }

    fn location(&self, source: &AllocSource) -> String {
        match *source {
            AllocSource::Internal => "INTERNAL".to_string(),
            AllocSource::Lfunc { proto, line } => {
                format!("{}, line {}", self.function(proto), line)
            }
            AllocSource::Cfunc { addr } => format!("CFUNC 0x{:x}", addr),
            AllocSource::Trace {
                trace_no,
                mcode_addr,
            } => match self.traces.get(&trace_no) {
                Some((owner, start_line)) => format!(
                    "TRACE [{}] started at {}, line {}",
                    trace_no,
                    self.function(*owner),
                    start_line
                ),
                None => format!("TRACE [{}] 0x{:x}", trace_no, mcode_addr),
            },
        }
    }
}

fn bump(rows: &mut HashMap<String, SourceRow>, location: &str, allocated: u64, freed: u64) {
    let row = rows
        .entry(location.to_string())
        .or_insert_with(|| SourceRow {
            location: location.to_string(),
            ..Default::default()
        });
    row.events += 1;
    row.allocated = row.allocated.saturating_add(allocated);
    row.freed = row.freed.saturating_add(freed);
}

fn sorted(rows: HashMap<String, SourceRow>) -> Vec<SourceRow> {
    let mut rows: Vec<_> = rows.into_values().collect();
    rows.sort_by(|a, b| b.events.cmp(&a.events).then_with(|| a.location.cmp(&b.location)));
    rows
}

impl Report {
    pub fn build(stream: &Stream) -> Self {
        let mut symbols = SymbolIndex::default();
        for symbol in &stream.symbols {
            symbols.learn(symbol);
        }

        let mut allocations = HashMap::new();
        let mut reallocations = HashMap::new();
        let mut deallocations = HashMap::new();
        // Live blocks: address -> (allocating location, size)
        let mut heap: HashMap<u64, (String, u64)> = HashMap::new();

        for record in &stream.records {
            let (event, source) = match record {
                Record::Symbol { symbol } => {
                    symbols.learn(symbol);
                    continue;
                }
                Record::Event { event, source } => (event, source),
            };
            let location = symbols.location(source);

            match *event {
                AllocEvent::Alloc { new_ptr, new_size } => {
                    bump(&mut allocations, &location, new_size, 0);
                    if new_ptr != 0 {
                        heap.insert(new_ptr, (location, new_size));
                    }
                }
                AllocEvent::Realloc {
                    old_ptr,
                    old_size,
                    new_ptr,
                    new_size,
                } => {
                    bump(&mut reallocations, &location, new_size, old_size);
                    heap.remove(&old_ptr);
                    if new_ptr != 0 {
                        heap.insert(new_ptr, (location, new_size));
                    }
                }
                AllocEvent::Free { old_ptr, old_size } => {
                    bump(&mut deallocations, &location, 0, old_size);
                    heap.remove(&old_ptr);
                }
            }
        }

        let mut leaks: HashMap<String, LeakRow> = HashMap::new();
        for (location, size) in heap.into_values() {
            let row = leaks.entry(location.clone()).or_insert_with(|| LeakRow {
                location,
                ..Default::default()
            });
            row.blocks += 1;
            row.bytes = row.bytes.saturating_add(size);
        }
        let mut leaks: Vec<_> = leaks.into_values().collect();
        leaks.sort_by(|a, b| b.bytes.cmp(&a.bytes).then_with(|| a.location.cmp(&b.location)));

        Self {
            allocations: sorted(allocations),
            reallocations: sorted(reallocations),
            deallocations: sorted(deallocations),
            leaks,
            complete: stream.complete,
        }
    }

    /// Human-readable rendering of the three event sections.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for (title, rows) in [
            ("ALLOCATIONS", &self.allocations),
            ("REALLOCATIONS", &self.reallocations),
            ("DEALLOCATIONS", &self.deallocations),
        ] {
            let _ = writeln!(out, "{}", title);
            for row in rows {
                let _ = writeln!(
                    out,
                    "{}: {} events\t+{} bytes\t-{} bytes",
                    row.location, row.events, row.allocated, row.freed
                );
            }
            out.push('\n');
        }
        if !self.complete {
            out.push_str("WARNING: stream has no epilogue, the profiled process may have stopped early\n");
        }
        out
    }

    /// Human-readable rendering of the memory left allocated.
    pub fn render_leaks(&self) -> String {
        let mut out = String::from("HEAP SUMMARY:\n");
        for row in &self.leaks {
            let _ = writeln!(
                out,
                "{} holds {} bytes in {} blocks",
                row.location, row.bytes, row.blocks
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lfunc(identity: u64, chunk: &str, first_line: u64) -> Symbol {
        Symbol::Lfunc {
            identity,
            chunk_name: chunk.to_string(),
            first_line,
        }
    }

    fn event(event: AllocEvent, source: AllocSource) -> Record {
        Record::Event { event, source }
    }

    fn sample() -> Stream {
        let f = AllocSource::Lfunc { proto: 1, line: 10 };
        Stream {
            symbols: vec![lfunc(1, "m.lua", 1)],
            records: vec![
                event(
                    AllocEvent::Alloc {
                        new_ptr: 0x100,
                        new_size: 64,
                    },
                    f,
                ),
                event(
                    AllocEvent::Alloc {
                        new_ptr: 0x200,
                        new_size: 32,
                    },
                    f,
                ),
                event(
                    AllocEvent::Realloc {
                        old_ptr: 0x200,
                        old_size: 32,
                        new_ptr: 0x300,
                        new_size: 48,
                    },
                    AllocSource::Cfunc { addr: 0xc0 },
                ),
                event(
                    AllocEvent::Free {
                        old_ptr: 0x100,
                        old_size: 64,
                    },
                    AllocSource::Internal,
                ),
            ],
            complete: true,
        }
    }

    #[test]
    fn test_sections_aggregate_by_location() {
        let report = Report::build(&sample());

        assert_eq!(
            report.allocations,
            vec![SourceRow {
                location: "@m.lua:1, line 10".to_string(),
                events: 2,
                allocated: 96,
                freed: 0,
            }]
        );
        assert_eq!(report.reallocations[0].location, "CFUNC 0xc0");
        assert_eq!(report.reallocations[0].allocated, 48);
        assert_eq!(report.reallocations[0].freed, 32);
        assert_eq!(report.deallocations[0].location, "INTERNAL");
        assert_eq!(report.deallocations[0].freed, 64);
    }

    #[test]
    fn test_leaks_follow_reallocation() {
        let report = Report::build(&sample());
        assert_eq!(
            report.leaks,
            vec![LeakRow {
                location: "CFUNC 0xc0".to_string(),
                blocks: 1,
                bytes: 48,
            }]
        );
    }

    #[test]
    fn test_unknown_symbols_fall_back_to_addresses() {
        let stream = Stream {
            symbols: vec![],
            records: vec![
                event(
                    AllocEvent::Alloc {
                        new_ptr: 1,
                        new_size: 8,
                    },
                    AllocSource::Lfunc { proto: 0xab, line: 3 },
                ),
                event(
                    AllocEvent::Alloc {
                        new_ptr: 2,
                        new_size: 8,
                    },
                    AllocSource::Trace {
                        trace_no: 4,
                        mcode_addr: 0x7000,
                    },
                ),
            ],
            complete: false,
        };
        let report = Report::build(&stream);
        let locations: Vec<_> = report
            .allocations
            .iter()
            .map(|r| r.location.as_str())
            .collect();
        assert_eq!(locations, vec!["@0xab, line 3", "TRACE [4] 0x7000"]);
        assert!(report.render_text().contains("WARNING"));
    }

    #[test]
    fn test_trace_location_uses_owner() {
        let stream = Stream {
            symbols: vec![
                lfunc(1, "loop.lua", 2),
                Symbol::Trace {
                    trace_no: 1,
                    mcode_addr: 0x7000,
                    owner_identity: 1,
                    start_line: 5,
                },
            ],
            records: vec![event(
                AllocEvent::Alloc {
                    new_ptr: 1,
                    new_size: 8,
                },
                AllocSource::Trace {
                    trace_no: 1,
                    mcode_addr: 0x7000,
                },
            )],
            complete: true,
        };
        let report = Report::build(&stream);
        assert_eq!(
            report.allocations[0].location,
            "TRACE [1] started at @loop.lua:2, line 5"
        );
    }

    #[test]
    fn test_dynamic_symbol_resolves_later_events() {
        let stream = Stream {
            symbols: vec![],
            records: vec![
                Record::Symbol {
                    symbol: lfunc(9, "late.lua", 7),
                },
                event(
                    AllocEvent::Alloc {
                        new_ptr: 1,
                        new_size: 8,
                    },
                    AllocSource::Lfunc { proto: 9, line: 8 },
                ),
            ],
            complete: true,
        };
        let report = Report::build(&stream);
        assert_eq!(report.allocations[0].location, "@late.lua:7, line 8");
    }

    #[test]
    fn test_render_text_sections() {
        let text = Report::build(&sample()).render_text();
        let alloc = text.find("ALLOCATIONS").unwrap();
        let realloc = text.find("REALLOCATIONS").unwrap();
        let dealloc = text.find("DEALLOCATIONS").unwrap();
        assert!(alloc < realloc && realloc < dealloc);
        assert!(text.contains("@m.lua:1, line 10: 2 events\t+96 bytes\t-0 bytes"));
        assert!(!text.contains("WARNING"));
    }
}
