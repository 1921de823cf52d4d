//! Terminal-state transform seam. The broker never interprets terminal
//! output itself; it hands raw pty bytes to an `OutputTransform` and forwards
//! whatever comes back. The default transform escapes the stream for the
//! in-band wire protocol and keeps just enough parser state to answer three
//! questions: what title describes this session, is the terminal in
//! application cursor mode, and what snapshot should a fresh subscriber get.
//! A full screen engine plugs in behind the same trait.

use serde_json::json;

pub trait OutputTransform {
    /// Process one chunk of raw child output, appending wire-ready bytes to
    /// `out`. Must be incrementally invokable: escape sequences split across
    /// chunks parse the same as unsplit ones.
    fn transform(&mut self, raw: &[u8], out: &mut Vec<u8>);

    /// Best-effort title derived from the output stream, used when no client
    /// has set one explicitly.
    fn derived_title(&self) -> String;

    /// Whether the child has switched the terminal to application cursor
    /// mode (DECCKM), which changes arrow-key encoding.
    fn app_cursor(&self) -> bool;

    /// Snapshot sent to a newly subscribing client.
    fn state_json(&self) -> serde_json::Value;
}

const LINE_MAX: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Scan {
    Ground,
    Esc,
    Csi(Vec<u8>),
    Osc(Vec<u8>),
    /// Inside an OSC, saw ESC; `ESC \` (ST) ends the sequence.
    OscEsc(Vec<u8>),
}

/// Default transform: hex-escapes the stream and shadows a minimal slice of
/// terminal state by scanning escape sequences without acting on them.
pub struct PlainTransform {
    scan: Scan,
    /// Text of the line currently being written, for title derivation.
    line: String,
    /// Last completed non-empty line, or an OSC-set window title.
    title: String,
    /// The child set the title explicitly via OSC 0/2; line tracking stops
    /// overriding it.
    osc_title: bool,
    app_cursor: bool,
}

impl Default for PlainTransform {
    fn default() -> Self {
        Self {
            scan: Scan::Ground,
            line: String::new(),
            title: String::new(),
            osc_title: false,
            app_cursor: false,
        }
    }
}

impl PlainTransform {
    fn scan_byte(&mut self, byte: u8) {
        match std::mem::replace(&mut self.scan, Scan::Ground) {
            Scan::Ground => match byte {
                0x1b => self.scan = Scan::Esc,
                // ONLCR turns child newlines into \r\n, so \r must commit
                // the line too or nothing ever would.
                b'\n' | b'\r' => {
                    if !self.line.is_empty() && !self.osc_title {
                        self.title = std::mem::take(&mut self.line);
                    } else {
                        self.line.clear();
                    }
                }
                0x20..=0x7e => {
                    if self.line.len() < LINE_MAX {
                        self.line.push(byte as char);
                    }
                }
                _ => {}
            },
            Scan::Esc => match byte {
                b'[' => self.scan = Scan::Csi(Vec::new()),
                b']' => self.scan = Scan::Osc(Vec::new()),
                _ => {} // two-byte escape, done
            },
            Scan::Csi(mut buf) => {
                if (0x40..=0x7e).contains(&byte) {
                    self.csi_final(&buf, byte);
                } else if buf.len() < 16 {
                    buf.push(byte);
                    self.scan = Scan::Csi(buf);
                } else {
                    self.scan = Scan::Csi(buf); // overlong, keep consuming
                }
            }
            Scan::Osc(mut buf) => match byte {
                0x07 => self.osc_final(&buf),
                0x1b => self.scan = Scan::OscEsc(buf),
                _ => {
                    if buf.len() < 256 {
                        buf.push(byte);
                    }
                    self.scan = Scan::Osc(buf);
                }
            },
            Scan::OscEsc(buf) => {
                if byte == b'\\' {
                    self.osc_final(&buf);
                } else {
                    self.scan = Scan::Osc(buf);
                }
            }
        }
    }

    fn csi_final(&mut self, params: &[u8], final_byte: u8) {
        // DECCKM: CSI ? 1 h / CSI ? 1 l
        if params == b"?1" {
            match final_byte {
                b'h' => self.app_cursor = true,
                b'l' => self.app_cursor = false,
                _ => {}
            }
        }
    }

    fn osc_final(&mut self, buf: &[u8]) {
        let text = String::from_utf8_lossy(buf);
        if let Some(title) = text.strip_prefix("0;").or_else(|| text.strip_prefix("2;")) {
            self.title = title.chars().take(LINE_MAX).collect();
            self.osc_title = true;
        }
    }
}

impl OutputTransform for PlainTransform {
    fn transform(&mut self, raw: &[u8], out: &mut Vec<u8>) {
        for &byte in raw {
            self.scan_byte(byte);
            match byte {
                b'\\' => out.extend_from_slice(b"\\5c"),
                0x00..=0x1f | 0x7f => {
                    out.extend_from_slice(format!("\\{:02x}", byte).as_bytes());
                }
                _ => out.push(byte),
            }
        }
    }

    fn derived_title(&self) -> String {
        if !self.title.is_empty() {
            self.title.clone()
        } else {
            self.line.clone()
        }
    }

    fn app_cursor(&self) -> bool {
        self.app_cursor
    }

    fn state_json(&self) -> serde_json::Value {
        json!({
            "title": self.derived_title(),
            "app_cursor": self.app_cursor,
            "line": self.line,
        })
    }
}
