//! Wire format constants shared by the encoder and the offline decoder
//!
//! A memprof stream is two sections back to back:
//!
//! ```text
//! symtab: 'l' 'j' 's' <version> 0 0 0  { LFUNC | TRACE record }*  FINAL
//! events: 'l' 'j' 'm' <version> 0 0 0  { event | dynamic symbol }*  EPILOGUE
//! ```
//!
//! Every integer is an unsigned 64-bit little-endian value, every string is a
//! u64 length followed by the raw bytes.

/// Symbol section magic.
pub const SYMTAB_MAGIC: [u8; 3] = *b"ljs";
/// Symbol section format version.
pub const SYMTAB_VERSION: u8 = 0x3;

/// Event section magic.
pub const EVENTS_MAGIC: [u8; 3] = *b"ljm";
/// Event section format version.
pub const EVENTS_VERSION: u8 = 0x3;

/// Length of both section headers: magic, version, three reserved bytes.
pub const HEADER_LEN: usize = 7;

/// Opening bytes of the symbol section.
pub const SYMTAB_HEADER: [u8; HEADER_LEN] = [
    SYMTAB_MAGIC[0],
    SYMTAB_MAGIC[1],
    SYMTAB_MAGIC[2],
    SYMTAB_VERSION,
    0x0,
    0x0,
    0x0,
];

/// Opening bytes of the event section.
pub const EVENTS_HEADER: [u8; HEADER_LEN] = [
    EVENTS_MAGIC[0],
    EVENTS_MAGIC[1],
    EVENTS_MAGIC[2],
    EVENTS_VERSION,
    0x0,
    0x0,
    0x0,
];

// Symbol section record tags.
pub const SYMTAB_LFUNC: u8 = 1;
pub const SYMTAB_TRACE: u8 = 2;
pub const SYMTAB_FINAL: u8 = 0xff;

/// Clean end of the event section.
pub const EPILOGUE_TAG: u8 = 0x80;

/// What happened, stored in the high nibble of an event tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventKind {
    /// Prototype created while profiling.
    Symtab = 1,
    Alloc = 2,
    Free = 3,
    Realloc = 4,
}

/// Who caused it, stored in the low nibble of an event tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SourceKind {
    Internal = 0,
    Lfunc = 1,
    Cfunc = 2,
    Trace = 3,
}

impl EventKind {
    pub fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            1 => Some(Self::Symtab),
            2 => Some(Self::Alloc),
            3 => Some(Self::Free),
            4 => Some(Self::Realloc),
            _ => None,
        }
    }
}

impl SourceKind {
    pub fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            0 => Some(Self::Internal),
            1 => Some(Self::Lfunc),
            2 => Some(Self::Cfunc),
            3 => Some(Self::Trace),
            _ => None,
        }
    }
}

/// Build an event tag byte.
#[inline]
pub const fn event_tag(event: EventKind, source: SourceKind) -> u8 {
    ((event as u8) << 4) | source as u8
}

/// Split an event tag byte into its nibbles.
#[inline]
pub const fn split_tag(tag: u8) -> (u8, u8) {
    (tag >> 4, tag & 0x0f)
}
