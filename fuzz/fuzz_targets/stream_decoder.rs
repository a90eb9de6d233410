#![no_main]

use libfuzzer_sys::fuzz_target;
use memprof::{decode, report::Report};

fuzz_target!(|data: &[u8]| {
    // Any byte string must decode to a stream or an error, never a panic
    if let Ok(stream) = decode::parse(data) {
        let report = Report::build(&stream);
        let _ = report.render_text();
        let _ = report.render_leaks();
    }
});
