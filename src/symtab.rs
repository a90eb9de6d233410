//! Symbol table emitter
//!
//! Event records refer to prototypes and traces by number only. The symbol
//! table written at session start (plus the dynamic records appended by
//! [`add_symbol`]) is what lets an offline decoder turn those numbers back
//! into chunk names and lines.

use crate::format::{
    event_tag, EventKind, SourceKind, SYMTAB_FINAL, SYMTAB_HEADER, SYMTAB_LFUNC, SYMTAB_TRACE,
};
use crate::vm::{GcObject, ProfiledVm, PrototypeView, TraceView};
use crate::wbuf::WireBuffer;

fn dump_proto(out: &mut WireBuffer, proto: &dyn PrototypeView) {
    out.add_u64(proto.identity());
    out.add_string(proto.chunk_name());
    out.add_u64(proto.first_line());
}

fn dump_trace(out: &mut WireBuffer, trace: &dyn TraceView) {
    let proto = trace.start_proto();
    let start_pc = trace.start_pc();
    debug_assert!(
        start_pc < proto.bytecode_len(),
        "trace {} starts outside its prototype",
        trace.trace_no()
    );
    // Prototypes built without debug info have no line table.
    let line = u64::try_from(proto.line_at(start_pc)).unwrap_or(0);

    out.add_u8(SYMTAB_TRACE);
    out.add_u64(u64::from(trace.trace_no()));
    out.add_u64(trace.mcode_addr());
    // The owning prototype is anchored by the trace and was enumerated
    // earlier, so its chunk name is not repeated here.
    out.add_u64(proto.identity());
    out.add_u64(line);
}

/// Write the symbol section: header, one record per live prototype and
/// trace, terminator.
///
/// Only writes into the wire buffer's region, so it never goes through the
/// VM allocator.
pub fn dump_symtab(out: &mut WireBuffer, vm: &dyn ProfiledVm) {
    out.add_bytes(&SYMTAB_HEADER);

    let mut protos = 0usize;
    let mut traces = 0usize;
    vm.for_each_object(&mut |obj| match obj {
        GcObject::Proto(proto) => {
            out.add_u8(SYMTAB_LFUNC);
            dump_proto(out, proto);
            protos += 1;
        }
        GcObject::Trace(trace) => {
            dump_trace(out, trace);
            traces += 1;
        }
        GcObject::Other => {}
    });

    out.add_u8(SYMTAB_FINAL);
    tracing::debug!(protos, traces, "memprof symtab dumped");
}

/// Append a prototype created after profiling started to the event section.
pub fn add_symbol(out: &mut WireBuffer, proto: &dyn PrototypeView) {
    out.add_u8(event_tag(EventKind::Symtab, SourceKind::Lfunc));
    dump_proto(out, proto);
}
