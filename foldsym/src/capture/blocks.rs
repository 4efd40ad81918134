//! Block capture format: one sample per block of frame lines, innermost
//! frame first, blocks separated by blank lines.
//!
//! ```text
//! # pid=4242 tid=4250 weight=3
//! /apex/com.android.art/lib64/libart.so+0x2a1f0
//! /system/lib64/libc.so+0x4c10 __libc_start_main
//! buildid:8e1f7c2a+0x1000
//! [anon:dalvik-jit-code-cache] void com.example.FFT.transform(double[])
//! ```

use foldsym_common::{Capture, RawFrame, Sample};

use crate::diagnostics::{Diagnostics, InputKind};

use super::{parse_hex, parse_module, CaptureImport, LineTracker};

#[derive(Debug, Default)]
struct Block {
    pid: u32,
    tid: Option<u32>,
    timestamp: u64,
    weight: u64,
    frames: Vec<RawFrame>,
    /// a header or frame was accepted
    used: bool,
}

impl Block {
    fn new() -> Self {
        Self {
            weight: 1,
            ..Default::default()
        }
    }

    fn finish(self, samples: &mut Vec<Sample>) {
        if !self.used {
            return;
        }
        samples.push(Sample {
            pid: self.pid,
            tid: self.tid.unwrap_or(self.pid),
            timestamp: self.timestamp,
            weight: self.weight,
            call_chain: self.frames,
        });
    }
}

pub fn parse(text: &str, diagnostics: &Diagnostics) -> CaptureImport {
    let mut lines = LineTracker::new(InputKind::Capture, diagnostics);
    let mut samples = Vec::new();
    let mut block = Block::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            std::mem::replace(&mut block, Block::new()).finish(&mut samples);
            continue;
        }
        lines.line();

        let accepted = match line.strip_prefix('#') {
            Some(header) => parse_header(header, &mut block),
            None => match parse_frame(line) {
                Some(frame) => {
                    block.frames.push(frame);
                    true
                }
                None => false,
            },
        };
        if accepted {
            block.used = true;
        } else {
            lines.skip(idx + 1, line);
        }
    }
    block.finish(&mut samples);

    CaptureImport {
        capture: Capture::new(samples),
        stats: lines.stats,
    }
}

/// `key=value` pairs; a header without any pair is a comment
fn parse_header(header: &str, block: &mut Block) -> bool {
    let mut pairs = header
        .split_whitespace()
        .filter_map(|field| field.split_once('='))
        .peekable();
    if pairs.peek().is_none() {
        return true;
    }

    for (key, value) in pairs {
        let ok = match key {
            "pid" => value.parse().map(|v| block.pid = v).is_ok(),
            "tid" => value.parse().map(|v| block.tid = Some(v)).is_ok(),
            "time" => value.parse().map(|v| block.timestamp = v).is_ok(),
            "weight" => match value.parse::<u64>() {
                Ok(w) if w > 0 => {
                    block.weight = w;
                    true
                }
                _ => false,
            },
            // forward compatible with headers we do not use
            _ => true,
        };
        if !ok {
            return false;
        }
    }
    true
}

/// `<module>+<hex>`, `<module> <symbol>` or `<module>+<hex> <symbol>`.
///
/// The offset belongs to the first word. A symbol may carry its own
/// `+0x..` (`art_quick_invoke_stub+0x1c`), which is part of the name.
fn parse_frame(line: &str) -> Option<RawFrame> {
    let (head, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    if let Some(frame) = addressed(head, rest) {
        return Some(frame);
    }
    if let Some(frame) = spaced_path(line) {
        return Some(frame);
    }
    if rest.is_empty() {
        return None;
    }
    Some(RawFrame::symbol_only(parse_module(head)?, rest))
}

fn addressed(module: &str, symbol: &str) -> Option<RawFrame> {
    // `libc++.so+0x10`: the offset follows the last `+`
    let (module, offset) = module.rsplit_once('+')?;
    let frame = RawFrame::new(parse_module(module)?, parse_hex(offset)?);
    Some(with_symbol(frame, symbol))
}

/// Paths with spaces, e.g. `/memfd:jit-cache (deleted)+0x20` or
/// `/data/app/My App/base.apk+0x10`. Words after the first must continue
/// the path (contain a `/`) or be an annotation in parentheses.
fn spaced_path(line: &str) -> Option<RawFrame> {
    if !line.starts_with(|c| c == '/' || c == '[') {
        return None;
    }
    for (idx, _) in line.match_indices('+') {
        let rest = &line[idx + 1..];
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let Some(offset) = parse_hex(&rest[..end]) else {
            continue;
        };
        let module = &line[..idx];
        let continues = module
            .split_whitespace()
            .skip(1)
            .all(|word| word.contains('/') || word.starts_with('('));
        if !continues {
            return None;
        }
        let frame = RawFrame::new(parse_module(module)?, offset);
        return Some(with_symbol(frame, rest[end..].trim()));
    }
    None
}

fn with_symbol(frame: RawFrame, symbol: &str) -> RawFrame {
    if symbol.is_empty() {
        frame
    } else {
        frame.with_reported_symbol(symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foldsym_common::{BinaryIdentity, BuildId};

    fn path(p: &str) -> BinaryIdentity {
        BinaryIdentity::Path(p.into())
    }

    #[test]
    fn test_frames() {
        assert_eq!(parse_frame("libfoo.so+0x1000"), Some(RawFrame::new(path("libfoo.so"), 0x1000)));
        assert_eq!(
            parse_frame("/system/lib64/libc.so+4c10 __libc_start_main"),
            Some(RawFrame::new(path("/system/lib64/libc.so"), 0x4c10).with_reported_symbol("__libc_start_main"))
        );
        assert_eq!(
            parse_frame("libart.so art::Thread::Run()"),
            Some(RawFrame::symbol_only(path("libart.so"), "art::Thread::Run()"))
        );
        assert_eq!(
            parse_frame("/memfd:jit-cache (deleted)+0x20 void Foo.bar()"),
            Some(RawFrame::new(path("/memfd:jit-cache (deleted)"), 0x20).with_reported_symbol("void Foo.bar()"))
        );
        assert_eq!(
            parse_frame("buildid:b1b1+0x1000"),
            Some(RawFrame::new(
                BinaryIdentity::BuildId(BuildId::parse("b1b1").unwrap()),
                0x1000
            ))
        );
        // symbol containing `+` but no offset
        assert_eq!(
            parse_frame("libc++.so std::string::append"),
            Some(RawFrame::symbol_only(path("libc++.so"), "std::string::append"))
        );
        assert_eq!(
            parse_frame("/data/app/My App/base.apk+0x10 run"),
            Some(RawFrame::new(path("/data/app/My App/base.apk"), 0x10).with_reported_symbol("run"))
        );
        assert_eq!(parse_frame("libc++.so+0x10"), Some(RawFrame::new(path("libc++.so"), 0x10)));
        assert_eq!(parse_frame("libfoo.so"), None);
        assert_eq!(parse_frame("+0x10"), None);
        assert_eq!(parse_frame("buildid:zz+0x10"), None);
    }

    #[test]
    fn test_symbol_offsets_stay_in_the_name() {
        assert_eq!(
            parse_frame("libart.so art_quick_invoke_stub+0x1c"),
            Some(RawFrame::symbol_only(path("libart.so"), "art_quick_invoke_stub+0x1c"))
        );
        assert_eq!(
            parse_frame("/apex/com.android.art/lib64/libart.so art_quick_invoke_stub+0x1c"),
            Some(RawFrame::symbol_only(
                path("/apex/com.android.art/lib64/libart.so"),
                "art_quick_invoke_stub+0x1c"
            ))
        );
        assert_eq!(
            parse_frame("libfoo.so+0x10 foo_compute+0x4"),
            Some(RawFrame::new(path("libfoo.so"), 0x10).with_reported_symbol("foo_compute+0x4"))
        );
    }

    #[test]
    fn test_blocks() {
        let text = "\
# pid=42 tid=43 time=1000 weight=5
c+0x3
b+0x2
a+0x1

# comment only
x+0x9
a+0x1


c+0x3
";
        let diagnostics = Diagnostics::new();
        let import = parse(text, &diagnostics);
        let samples = import.capture.samples();
        assert_eq!(samples.len(), 3);
        assert_eq!((samples[0].pid, samples[0].tid, samples[0].timestamp, samples[0].weight), (42, 43, 1000, 5));
        assert_eq!(samples[0].call_chain.len(), 3);
        assert_eq!(samples[0].call_chain[0], RawFrame::new(path("c"), 3));
        assert_eq!((samples[1].pid, samples[1].weight), (0, 1));
        assert_eq!(samples[2].call_chain, vec![RawFrame::new(path("c"), 3)]);
        assert_eq!(import.stats.total, 8);
        assert_eq!(import.stats.skipped, 0);
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let diagnostics = Diagnostics::new();
        let import = parse("# pid=abc\nlibfoo.so\nlibfoo.so+0x10\n# weight=0\n", &diagnostics);
        assert_eq!(import.capture.len(), 1);
        assert_eq!(import.capture.samples()[0].call_chain.len(), 1);
        assert_eq!(import.capture.samples()[0].weight, 1);
        assert_eq!(import.stats.total, 4);
        assert_eq!(import.stats.skipped, 3);
        assert_eq!(diagnostics.counts().malformed_input, 3);
    }

    #[test]
    fn test_header_without_frames_is_an_empty_sample() {
        let import = parse("# pid=1\n\n", &Diagnostics::new());
        assert_eq!(import.capture.len(), 1);
        assert!(import.capture.samples()[0].call_chain.is_empty());

        let import = parse("garbage\n\n", &Diagnostics::new());
        assert!(import.capture.is_empty());
    }
}
