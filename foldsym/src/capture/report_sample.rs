//! `simpleperf report-sample` text output.
//!
//! ```text
//! sample:
//!   time: 7193482210
//!   event_count: 250000
//!   thread_id: 4250
//!   thread_name: Benchmark
//!   vaddr_in_file: 2a1f0
//!   file: /apex/com.android.art/lib64/libart.so
//!   symbol: art::Thread::Run()
//!   callchain:
//!     vaddr_in_file: 4c10
//!     file: /system/lib64/libc.so
//!     symbol: unknown
//! ```
//!
//! The frame before `callchain:` is the sampled one; callchain frames follow
//! innermost to outermost. `symbol: unknown` means the device did not know.

use foldsym_common::{Capture, RawFrame, Sample};

use crate::diagnostics::{Diagnostics, InputKind};

use super::{parse_hex, parse_module, CaptureImport, LineTracker};

const UNKNOWN_SYMBOL: &str = "unknown";

#[derive(Debug)]
struct PendingFrame {
    vaddr: u64,
    file: Option<String>,
    symbol: Option<String>,
    line_no: usize,
    line: String,
}

#[derive(Debug, Default)]
struct PendingSample {
    pid: Option<u32>,
    tid: u32,
    timestamp: u64,
    weight: Option<u64>,
    frames: Vec<RawFrame>,
}

struct Parser<'a> {
    lines: LineTracker<'a>,
    samples: Vec<Sample>,
    sample: Option<PendingSample>,
    frame: Option<PendingFrame>,
}

impl<'a> Parser<'a> {
    fn flush_frame(&mut self) {
        let Some(frame) = self.frame.take() else {
            return;
        };
        // a frame without a file cannot be resolved or named
        let Some(binary) = frame.file.as_deref().and_then(parse_module) else {
            self.lines.skip(frame.line_no, &frame.line);
            return;
        };
        let Some(sample) = self.sample.as_mut() else {
            return;
        };
        let mut raw = RawFrame::new(binary, frame.vaddr);
        if let Some(symbol) = frame.symbol.filter(|s| !s.is_empty() && s != UNKNOWN_SYMBOL) {
            raw = raw.with_reported_symbol(symbol);
        }
        sample.frames.push(raw);
    }

    fn flush_sample(&mut self) {
        self.flush_frame();
        let Some(sample) = self.sample.take() else {
            return;
        };
        // without a process id the thread id is the best guess for the
        // process of a main-thread sample
        let pid = sample.pid.unwrap_or(sample.tid);
        self.samples.push(Sample {
            pid,
            tid: sample.tid,
            timestamp: sample.timestamp,
            weight: sample.weight.unwrap_or(1),
            call_chain: sample.frames,
        });
    }

    /// Handle one `key: value` line. Returns false if it must be skipped.
    fn field(&mut self, key: &str, value: &str, line_no: usize, line: &str) -> bool {
        if key == "vaddr_in_file" {
            self.flush_frame();
            let Some(vaddr) = parse_hex(value) else {
                return false;
            };
            if self.sample.is_none() {
                return false;
            }
            self.frame = Some(PendingFrame {
                vaddr,
                file: None,
                symbol: None,
                line_no,
                line: line.to_owned(),
            });
            return true;
        }

        if key == "file" || key == "symbol" {
            let Some(frame) = self.frame.as_mut() else {
                return false;
            };
            let value = Some(value.to_owned());
            if key == "file" {
                frame.file = value;
            } else {
                frame.symbol = value;
            }
            return true;
        }

        let Some(sample) = self.sample.as_mut() else {
            return false;
        };
        match key {
            "time" => value.parse().map(|v| sample.timestamp = v).is_ok(),
            "thread_id" => value.parse().map(|v| sample.tid = v).is_ok(),
            "process_id" => value.parse().map(|v| sample.pid = Some(v)).is_ok(),
            "event_count" => match value.parse::<u64>() {
                Ok(w) if w > 0 => {
                    sample.weight = Some(w);
                    true
                }
                _ => false,
            },
            "callchain" => {
                self.flush_frame();
                true
            }
            // event_type, thread_name, cpu and friends
            _ => true,
        }
    }
}

pub fn parse(text: &str, diagnostics: &Diagnostics) -> CaptureImport {
    let mut parser = Parser {
        lines: LineTracker::new(InputKind::Capture, diagnostics),
        samples: Vec::new(),
        sample: None,
        frame: None,
    };

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        parser.lines.line();

        if line == "sample:" {
            parser.flush_sample();
            parser.sample = Some(PendingSample::default());
            continue;
        }
        let accepted = match line.split_once(':') {
            Some((key, value)) => parser.field(key.trim(), value.trim(), idx + 1, line),
            None => false,
        };
        if !accepted {
            parser.lines.skip(idx + 1, line);
        }
    }
    parser.flush_sample();

    CaptureImport {
        capture: Capture::new(parser.samples),
        stats: parser.lines.stats,
    }
}
