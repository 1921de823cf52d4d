//! Control-escape codec: a single-pass state machine over client keyboard
//! bytes. Most bytes are forwarded verbatim to the child; the `\` marker
//! introduces a command byte that may in turn start a fixed- or
//! variable-length field read. The codec is resumable at any chunk boundary:
//! feeding a stream split arbitrarily produces the same forwarded bytes and
//! actions as feeding it whole.
//!
//! One codec instance exists per session process, not per client; only one
//! client's keystrokes are live at a time by convention of the upper layer.

use tracing::warn;

/// In-band escape marker. Not producible by a real keyboard, which is what
/// makes the in-band protocol safe for interactive use.
pub const ESCAPE: u8 = b'\\';

/// Window-size field: four decimal digits of rows, four of columns.
pub const WINSIZE_LEN: usize = 8;

/// Opaque endpoint identity, chosen by the remote side.
pub const ENDPOINT_LEN: usize = 8;

/// Longest accepted client-set title. Bytes past this are dropped, not
/// buffered, so malformed input cannot grow state.
pub const TITLE_MAX: usize = 128;

// The scratch buffer must hold the largest bounded field.
const SCRATCH_MAX: usize = TITLE_MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Verbatim,
    Escaped,
    Size,
    Title,
    Identity,
}

/// Side effects requested by decoded commands, applied by the event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Resize { rows: u16, cols: u16 },
    TitleChanged,
    Identity([u8; ENDPOINT_LEN]),
    /// Client wants terminal output from now on, plus a full state snapshot.
    Subscribe,
    /// Client wants the watcher roster as structured data.
    Watchers,
    /// Dump codec/session diagnostics to a file.
    Dump,
    KeepAlive,
}

/// Bytes destined for the child plus actions for the broker, accumulated
/// across one or more `feed` calls.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct KbdOutput {
    pub pty: Vec<u8>,
    pub actions: Vec<Action>,
}

pub struct KbdCodec {
    mode: Mode,
    scratch: [u8; SCRATCH_MAX],
    scratch_len: usize,
    /// Title field ran past TITLE_MAX; remainder is discarded until the
    /// terminating newline.
    overflowed: bool,
    rows: u16,
    cols: u16,
    title: String,
    client_title: bool,
}

impl Default for KbdCodec {
    fn default() -> Self {
        Self::new(24, 80)
    }
}

impl KbdCodec {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            mode: Mode::Verbatim,
            scratch: [0; SCRATCH_MAX],
            scratch_len: 0,
            overflowed: false,
            rows,
            cols,
            title: String::new(),
            client_title: false,
        }
    }

    /// Last fully-parsed window size.
    pub fn winsize(&self) -> (u16, u16) {
        (self.rows, self.cols)
    }

    /// Client-set title, if one is in effect. `None` means automatic
    /// derivation applies.
    pub fn client_title(&self) -> Option<&str> {
        if self.client_title {
            Some(&self.title)
        } else {
            None
        }
    }

    /// Decode one chunk. `app_cursor` selects the alternate arrow-key lead
    /// byte while the terminal is in application cursor mode.
    pub fn feed(&mut self, input: &[u8], app_cursor: bool, out: &mut KbdOutput) {
        for &byte in input {
            match self.mode {
                Mode::Verbatim => match byte {
                    // Keyboard line endings are normalized by the client;
                    // a bare newline here is transport framing, not input.
                    b'\n' => {}
                    ESCAPE => self.mode = Mode::Escaped,
                    _ => out.pty.push(byte),
                },
                Mode::Escaped => self.command(byte, app_cursor, out),
                Mode::Size => {
                    self.scratch[self.scratch_len] = byte;
                    self.scratch_len += 1;
                    if self.scratch_len == WINSIZE_LEN {
                        self.finish_size(out);
                    }
                }
                Mode::Title => {
                    if byte == b'\n' {
                        self.finish_title(out);
                    } else if self.scratch_len < TITLE_MAX {
                        self.scratch[self.scratch_len] = byte;
                        self.scratch_len += 1;
                    } else if !self.overflowed {
                        self.overflowed = true;
                        warn!(max = TITLE_MAX, "title field overflow; truncating");
                    }
                }
                Mode::Identity => {
                    self.scratch[self.scratch_len] = byte;
                    self.scratch_len += 1;
                    if self.scratch_len == ENDPOINT_LEN {
                        let mut endpoint = [0u8; ENDPOINT_LEN];
                        endpoint.copy_from_slice(&self.scratch[..ENDPOINT_LEN]);
                        out.actions.push(Action::Identity(endpoint));
                        self.mode = Mode::Verbatim;
                    }
                }
            }
        }
    }

    fn command(&mut self, byte: u8, app_cursor: bool, out: &mut KbdOutput) {
        self.mode = Mode::Verbatim;
        match byte {
            b'n' => out.pty.push(b'\n'),
            ESCAPE => out.pty.push(ESCAPE),
            b'w' => {
                self.scratch_len = 0;
                self.mode = Mode::Size;
            }
            b't' => {
                self.scratch_len = 0;
                self.overflowed = false;
                self.mode = Mode::Title;
            }
            b'i' => {
                self.scratch_len = 0;
                self.mode = Mode::Identity;
            }
            b's' => out.actions.push(Action::Subscribe),
            b'l' => out.actions.push(Action::Watchers),
            b'd' => out.actions.push(Action::Dump),
            b'N' => out.actions.push(Action::KeepAlive),
            b'^' | b'v' | b'>' | b'<' | b'h' | b'e' => cursor_key(byte, app_cursor, &mut out.pty),
            _ => {
                // No negative-acknowledgement channel exists; drop it.
                warn!(command = byte, "ignoring unknown control command");
            }
        }
    }

    fn finish_size(&mut self, out: &mut KbdOutput) {
        self.mode = Mode::Verbatim;
        let rows = parse_dim(&self.scratch[..4]);
        let cols = parse_dim(&self.scratch[4..WINSIZE_LEN]);
        match (rows, cols) {
            (Some(rows), Some(cols)) => {
                self.rows = rows;
                self.cols = cols;
                out.actions.push(Action::Resize { rows, cols });
            }
            _ => {
                warn!(
                    field = %String::from_utf8_lossy(&self.scratch[..WINSIZE_LEN]),
                    "unparseable window size"
                );
            }
        }
    }

    fn finish_title(&mut self, out: &mut KbdOutput) {
        self.mode = Mode::Verbatim;
        self.title = String::from_utf8_lossy(&self.scratch[..self.scratch_len]).into_owned();
        // An empty title reverts to automatic derivation.
        self.client_title = !self.title.is_empty();
        out.actions.push(Action::TitleChanged);
    }

    /// Human-readable state for the `\d` diagnostic dump.
    pub fn dump(&self) -> String {
        let mut text = format!(
            "mode: {:?}\nwindim: {}:{}\nclient_title: {}\ntitle: ",
            self.mode, self.rows, self.cols, self.client_title
        );
        for byte in self.title.bytes() {
            if (b' '..0x7f).contains(&byte) {
                text.push(byte as char);
            } else {
                text.push_str(&format!("\\{:03o}", byte));
            }
        }
        text.push('\n');
        text
    }
}

fn parse_dim(digits: &[u8]) -> Option<u16> {
    if !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}

/// Directional keys become 3-byte terminal sequences for the child: CSI
/// normally, SS3 in application cursor mode.
fn cursor_key(cmd: u8, app_cursor: bool, pty: &mut Vec<u8>) {
    let final_byte = match cmd {
        b'^' => b'A',
        b'v' => b'B',
        b'>' => b'C',
        b'<' => b'D',
        b'h' => b'H',
        b'e' => b'F',
        _ => return,
    };
    pty.push(0x1b);
    pty.push(if app_cursor { b'O' } else { b'[' });
    pty.push(final_byte);
}
