//! Offline decoder for memprof streams
//!
//! Parses the bytes a sink received back into symbols and events. A stream
//! that ends on a record boundary without the epilogue (the profiled process
//! died, or the sink stopped early) still decodes; it is just marked
//! incomplete.

use crate::attribution::{AllocEvent, AllocSource};
use crate::format::{
    split_tag, EventKind, SourceKind, EPILOGUE_TAG, EVENTS_MAGIC, EVENTS_VERSION, HEADER_LEN,
    SYMTAB_FINAL, SYMTAB_LFUNC, SYMTAB_MAGIC, SYMTAB_TRACE, SYMTAB_VERSION,
};
use serde::Serialize;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("bad {section} header magic at offset {offset}")]
    BadMagic { section: &'static str, offset: usize },

    #[error("unsupported {section} format version {version}")]
    UnsupportedVersion { section: &'static str, version: u8 },

    #[error("unknown {section} tag 0x{tag:02x} at offset {offset}")]
    UnknownTag {
        section: &'static str,
        tag: u8,
        offset: usize,
    },

    #[error("stream truncated at offset {offset}")]
    Truncated { offset: usize },

    #[error("{len} trailing bytes after the epilogue")]
    TrailingData { len: usize },
}

pub type Result<T> = std::result::Result<T, DecodeError>;

/// Symbol record, from the symbol section or inserted while profiling
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Symbol {
    Lfunc {
        identity: u64,
        chunk_name: String,
        first_line: u64,
    },
    Trace {
        trace_no: u64,
        mcode_addr: u64,
        owner_identity: u64,
        start_line: u64,
    },
}

/// One record of the event section
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum Record {
    /// Prototype created while profiling.
    Symbol { symbol: Symbol },
    Event {
        event: AllocEvent,
        source: AllocSource,
    },
}

/// A decoded stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Stream {
    pub symbols: Vec<Symbol>,
    pub records: Vec<Record>,
    /// The epilogue was seen.
    pub complete: bool,
}

impl Stream {
    pub fn events(&self) -> impl Iterator<Item = (&AllocEvent, &AllocSource)> {
        self.records.iter().filter_map(|record| match record {
            Record::Event { event, source } => Some((event, source)),
            Record::Symbol { .. } => None,
        })
    }

    pub fn event_count(&self) -> usize {
        self.events().count()
    }

    /// Indexes into `records` of events whose prototype or trace had no
    /// symbol earlier in the stream.
    pub fn unresolved_events(&self) -> Vec<usize> {
        let mut protos = HashSet::new();
        let mut traces = HashSet::new();
        let learn = |symbol: &Symbol, protos: &mut HashSet<u64>, traces: &mut HashSet<u64>| {
            match symbol {
                Symbol::Lfunc { identity, .. } => protos.insert(*identity),
                Symbol::Trace { trace_no, .. } => traces.insert(*trace_no),
            };
        };
        for symbol in &self.symbols {
            learn(symbol, &mut protos, &mut traces);
        }

        let mut unresolved = Vec::new();
        for (idx, record) in self.records.iter().enumerate() {
            match record {
                Record::Symbol { symbol } => learn(symbol, &mut protos, &mut traces),
                Record::Event { source, .. } => {
                    let known = match source {
                        AllocSource::Lfunc { proto, .. } => protos.contains(proto),
                        AllocSource::Trace { trace_no, .. } => traces.contains(trace_no),
                        AllocSource::Internal | AllocSource::Cfunc { .. } => true,
                    };
                    if !known {
                        unresolved.push(idx);
                    }
                }
            }
        }
        unresolved
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(DecodeError::Truncated { offset: self.pos })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u64(&mut self) -> Result<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.bytes(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    fn string(&mut self) -> Result<String> {
        let offset = self.pos;
        let len = usize::try_from(self.u64()?).map_err(|_| DecodeError::Truncated { offset })?;
        Ok(String::from_utf8_lossy(self.bytes(len)?).into_owned())
    }

    fn header(&mut self, section: &'static str, magic: &[u8; 3], version: u8) -> Result<()> {
        let offset = self.pos;
        let raw = self.bytes(HEADER_LEN)?;
        if &raw[..3] != magic {
            return Err(DecodeError::BadMagic { section, offset });
        }
        if raw[3] != version {
            return Err(DecodeError::UnsupportedVersion {
                section,
                version: raw[3],
            });
        }
        Ok(())
    }

    fn lfunc(&mut self) -> Result<Symbol> {
        Ok(Symbol::Lfunc {
            identity: self.u64()?,
            chunk_name: self.string()?,
            first_line: self.u64()?,
        })
    }

    fn trace(&mut self) -> Result<Symbol> {
        Ok(Symbol::Trace {
            trace_no: self.u64()?,
            mcode_addr: self.u64()?,
            owner_identity: self.u64()?,
            start_line: self.u64()?,
        })
    }

    fn source(&mut self, kind: SourceKind) -> Result<AllocSource> {
        Ok(match kind {
            SourceKind::Internal => AllocSource::Internal,
            SourceKind::Lfunc => AllocSource::Lfunc {
                proto: self.u64()?,
                line: self.u64()?,
            },
            SourceKind::Cfunc => AllocSource::Cfunc { addr: self.u64()? },
            SourceKind::Trace => AllocSource::Trace {
                trace_no: self.u64()?,
                mcode_addr: self.u64()?,
            },
        })
    }

    fn event(&mut self, kind: EventKind) -> Result<AllocEvent> {
        Ok(match kind {
            EventKind::Alloc => AllocEvent::Alloc {
                new_ptr: self.u64()?,
                new_size: self.u64()?,
            },
            EventKind::Free => AllocEvent::Free {
                old_ptr: self.u64()?,
                old_size: self.u64()?,
            },
            EventKind::Realloc => AllocEvent::Realloc {
                old_ptr: self.u64()?,
                old_size: self.u64()?,
                new_ptr: self.u64()?,
                new_size: self.u64()?,
            },
            EventKind::Symtab => unreachable!("symbol records are handled by the caller"),
        })
    }
}

fn parse_symtab(reader: &mut Reader<'_>) -> Result<Vec<Symbol>> {
    reader.header("symtab", &SYMTAB_MAGIC, SYMTAB_VERSION)?;

    let mut symbols = Vec::new();
    loop {
        let offset = reader.pos;
        match reader.u8()? {
            SYMTAB_LFUNC => symbols.push(reader.lfunc()?),
            SYMTAB_TRACE => symbols.push(reader.trace()?),
            SYMTAB_FINAL => return Ok(symbols),
            tag => {
                return Err(DecodeError::UnknownTag {
                    section: "symtab",
                    tag,
                    offset,
                })
            }
        }
    }
}

fn parse_events(reader: &mut Reader<'_>, stream: &mut Stream) -> Result<()> {
    reader.header("events", &EVENTS_MAGIC, EVENTS_VERSION)?;

    while !reader.is_empty() {
        let offset = reader.pos;
        let tag = reader.u8()?;
        if tag == EPILOGUE_TAG {
            stream.complete = true;
            let trailing = reader.data.len() - reader.pos;
            if trailing > 0 {
                return Err(DecodeError::TrailingData { len: trailing });
            }
            return Ok(());
        }

        let unknown = DecodeError::UnknownTag {
            section: "events",
            tag,
            offset,
        };
        let (event_nibble, source_nibble) = split_tag(tag);
        let event = EventKind::from_nibble(event_nibble).ok_or_else(|| unknown.clone())?;
        let source = SourceKind::from_nibble(source_nibble).ok_or_else(|| unknown.clone())?;

        let record = match (event, source) {
            (EventKind::Symtab, SourceKind::Lfunc) => Record::Symbol {
                symbol: reader.lfunc()?,
            },
            (EventKind::Symtab, _) => return Err(unknown),
            (event, source) => {
                let source = reader.source(source)?;
                let event = reader.event(event)?;
                Record::Event { event, source }
            }
        };
        stream.records.push(record);
    }
    Ok(())
}

/// Decode a whole stream.
pub fn parse(data: &[u8]) -> Result<Stream> {
    let mut reader = Reader { data, pos: 0 };
    let mut stream = Stream {
        symbols: parse_symtab(&mut reader)?,
        ..Default::default()
    };
    parse_events(&mut reader, &mut stream)?;
    Ok(stream)
}
