//! Client side of the broker protocol: connect to a session socket, announce
//! ourselves, then relay bytes both ways until the broker goes away. The
//! relay is intentionally blind about terminal contents; it only encodes
//! local keystrokes into the control-escape protocol and decodes the
//! broker's escaped output stream back into raw bytes for the local tty.

use std::env;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use nix::sys::termios::{self, SetArg, Termios};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::session::{self, SessionDirs};

/// Attach to a running session. Returns the process exit code: 0 when the
/// broker closed the connection, 1 on local failure or detach-by-signal.
pub fn attach(dir: Option<PathBuf>, name: &str) -> Result<i32> {
    let dirs = SessionDirs::open(dir)?;
    let path = dirs.socket_path(name);
    let stream = session::connect_socket(&path).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => {
            Error::NoSuchSession(name.to_owned())
        }
        _ => Error::Io(err),
    })?;
    run_attached(stream)
}

pub struct OpenOpts {
    pub session: String,
    pub profile: Option<String>,
    pub dir: Option<PathBuf>,
    pub command: Vec<String>,
}

/// Attach-or-spawn: connect if the session exists, otherwise clean up any
/// stale socket, start a detached broker for it, and attach once the socket
/// appears.
pub fn open(opts: OpenOpts) -> Result<i32> {
    let dirs = SessionDirs::open(opts.dir.clone())?;
    let path = dirs.socket_path(&opts.session);

    match session::connect_socket(&path) {
        Ok(stream) => return run_attached(stream),
        Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => {
            warn!(path = %path.display(), "removing stale socket");
            let _ = fs::remove_file(&path);
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }

    spawn_broker(&opts)?;

    // The broker binds its socket before forking the child, so this resolves
    // quickly or not at all.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match session::connect_socket(&path) {
            Ok(stream) => return run_attached(stream),
            Err(_) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(_) => return Err(Error::NoSuchSession(opts.session.clone())),
        }
    }
}

/// Start a broker process for the session, detached from our stdio. The
/// broker is expected to outlive us, so the child handle is dropped
/// unwaited.
fn spawn_broker(opts: &OpenOpts) -> Result<()> {
    let exe = env::current_exe()?;
    let mut cmd = Command::new(exe);
    cmd.arg("serve").arg("--session").arg(&opts.session);
    if let Some(dir) = &opts.dir {
        cmd.arg("--dir").arg(dir);
    }
    if let Some(profile) = &opts.profile {
        cmd.arg("--profile").arg(profile);
    }
    if !opts.command.is_empty() {
        cmd.arg("--");
        cmd.args(&opts.command);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    let child = cmd.spawn()?;
    debug!(pid = child.id(), session = %opts.session, "spawned broker");
    Ok(())
}

fn run_attached(stream: std::os::unix::net::UnixStream) -> Result<i32> {
    stream.set_nonblocking(true)?;
    let _raw = RawGuard::enable();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let stream = tokio::net::UnixStream::from_std(stream)?;
        relay(stream).await
    })
}

async fn relay(stream: tokio::net::UnixStream) -> Result<i32> {
    let (mut rx, mut tx) = stream.into_split();
    let mut stdin = tokio::io::stdin();
    let mut winch = signal(SignalKind::window_change())?;
    let mut hup = signal(SignalKind::hangup())?;
    let mut int = signal(SignalKind::interrupt())?;
    let mut term = signal(SignalKind::terminate())?;

    // Attach marker, then subscribe so output starts flowing, then our
    // current window size.
    tx.write_all(b"\\N\\s").await?;
    send_winsize(&mut tx).await;

    let is_tty = unsafe { libc::isatty(libc::STDOUT_FILENO) } == 1;
    let mut decoder = OutputDecoder::default();
    let mut stdin_open = true;
    let mut inbuf = [0u8; 1024];
    let mut sockbuf = [0u8; 8192];
    let mut raw = Vec::new();
    let mut records = Vec::new();

    loop {
        tokio::select! {
            read = stdin.read(&mut inbuf), if stdin_open => match read {
                Ok(0) | Err(_) => stdin_open = false,
                Ok(n) => {
                    let encoded = encode_input(&inbuf[..n]);
                    if let Err(err) = tx.write_all(&encoded).await {
                        eprintln!("\r\nsesh-broker: connection lost: {}\r", err);
                        return Ok(1);
                    }
                }
            },
            read = rx.read(&mut sockbuf) => match read {
                Ok(0) => return Ok(0),
                Ok(n) => {
                    raw.clear();
                    records.clear();
                    decoder.feed(&sockbuf[..n], &mut raw, &mut records);
                    let mut stdout = io::stdout();
                    stdout.write_all(&raw)?;
                    stdout.flush()?;
                    for record in &records {
                        handle_record(record, is_tty);
                    }
                }
                Err(err) => {
                    eprintln!("\r\nsesh-broker: connection lost: {}\r", err);
                    return Ok(1);
                }
            },
            _ = winch.recv() => send_winsize(&mut tx).await,
            _ = hup.recv() => {
                eprintln!("\r\nsesh-broker: detached (hangup)\r");
                return Ok(1);
            }
            _ = int.recv() => {
                eprintln!("\r\nsesh-broker: detached (interrupt)\r");
                return Ok(1);
            }
            _ = term.recv() => {
                eprintln!("\r\nsesh-broker: detached (terminated)\r");
                return Ok(1);
            }
        }
    }
}

/// Broker records are `kind:payload`. Title updates get mirrored into the
/// local terminal's window title; the rest is display-less state.
fn handle_record(record: &[u8], is_tty: bool) {
    let text = String::from_utf8_lossy(record);
    if let Some(title) = text.strip_prefix("title:") {
        if is_tty {
            let mut stdout = io::stdout();
            let _ = write!(stdout, "\x1b]0;{}\x07", title);
            let _ = stdout.flush();
        }
    } else {
        debug!(record = %text, "broker record");
    }
}

async fn send_winsize(tx: &mut OwnedWriteHalf) {
    let mut ws = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let rc = unsafe { libc::ioctl(libc::STDIN_FILENO, libc::TIOCGWINSZ, &mut ws) };
    if rc != 0 || ws.ws_row == 0 || ws.ws_col == 0 {
        return; // not a terminal
    }
    let msg = format!("\\w{:04}{:04}", ws.ws_row.min(9999), ws.ws_col.min(9999));
    let _ = tx.write_all(msg.as_bytes()).await;
}

/// Escape local keystrokes for the keyboard protocol: the broker drops bare
/// newlines and treats backslash as the command marker, so both must travel
/// escaped.
pub fn encode_input(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    for &byte in input {
        match byte {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'\n' => out.extend_from_slice(b"\\n"),
            _ => out.push(byte),
        }
    }
    out
}

// ── Output decoding ─────────────────────────────────────────────────

#[derive(Debug)]
enum DecodeState {
    Ground,
    /// Saw the escape marker.
    Escape,
    /// Saw `\` plus one hex digit.
    Hex(u8),
    /// Inside a `\@` record, collecting until newline.
    Record(Vec<u8>),
}

/// Inverse of the broker's output escaping, resumable across reads.
#[derive(Debug)]
pub struct OutputDecoder {
    state: DecodeState,
}

impl Default for OutputDecoder {
    fn default() -> Self {
        Self { state: DecodeState::Ground }
    }
}

impl OutputDecoder {
    /// Split one chunk into raw terminal bytes and complete broker records
    /// (without the `\@` prefix or trailing newline).
    pub fn feed(&mut self, input: &[u8], raw: &mut Vec<u8>, records: &mut Vec<Vec<u8>>) {
        for &byte in input {
            match std::mem::replace(&mut self.state, DecodeState::Ground) {
                DecodeState::Ground => {
                    if byte == b'\\' {
                        self.state = DecodeState::Escape;
                    } else {
                        raw.push(byte);
                    }
                }
                DecodeState::Escape => {
                    if byte == b'@' {
                        self.state = DecodeState::Record(Vec::new());
                    } else if let Some(high) = hex_val(byte) {
                        self.state = DecodeState::Hex(high);
                    } else {
                        // Not produced by our broker; pass it through.
                        raw.push(b'\\');
                        raw.push(byte);
                    }
                }
                DecodeState::Hex(high) => {
                    if let Some(low) = hex_val(byte) {
                        raw.push(high << 4 | low);
                    } else {
                        raw.push(b'\\');
                        raw.push(unhex(high));
                        raw.push(byte);
                    }
                }
                DecodeState::Record(mut buf) => {
                    if byte == b'\n' {
                        records.push(buf);
                    } else {
                        buf.push(byte);
                        self.state = DecodeState::Record(buf);
                    }
                }
            }
        }
    }
}

fn hex_val(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        _ => None,
    }
}

fn unhex(val: u8) -> u8 {
    if val < 10 {
        b'0' + val
    } else {
        b'a' + val - 10
    }
}

// ── Local terminal raw mode ─────────────────────────────────────────

/// Puts the controlling terminal into raw mode for the duration of the
/// attach, restoring the saved settings on drop. A non-tty stdin (pipes,
/// tests) leaves the terminal alone.
struct RawGuard {
    saved: Option<Termios>,
}

impl RawGuard {
    fn enable() -> Self {
        if unsafe { libc::isatty(libc::STDIN_FILENO) } != 1 {
            return Self { saved: None };
        }
        let stdin = io::stdin();
        let saved = match termios::tcgetattr(&stdin) {
            Ok(saved) => saved,
            Err(err) => {
                warn!(error = %err, "cannot read terminal attributes");
                return Self { saved: None };
            }
        };
        let mut raw = saved.clone();
        termios::cfmakeraw(&mut raw);
        if let Err(err) = termios::tcsetattr(&stdin, SetArg::TCSANOW, &raw) {
            warn!(error = %err, "cannot enter raw mode");
            return Self { saved: None };
        }
        Self { saved: Some(saved) }
    }
}

impl Drop for RawGuard {
    fn drop(&mut self) {
        if let Some(saved) = &self.saved {
            let _ = termios::tcsetattr(&io::stdin(), SetArg::TCSANOW, saved);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_escapes_backslash_and_newline() {
        assert_eq!(encode_input(b"a\\b\nc"), b"a\\\\b\\nc");
    }

    #[test]
    fn encode_leaves_carriage_return_alone() {
        assert_eq!(encode_input(b"ls\r"), b"ls\r");
    }

    fn decode_whole(input: &[u8]) -> (Vec<u8>, Vec<Vec<u8>>) {
        let mut decoder = OutputDecoder::default();
        let mut raw = Vec::new();
        let mut records = Vec::new();
        decoder.feed(input, &mut raw, &mut records);
        (raw, records)
    }

    #[test]
    fn decode_hex_escapes() {
        let (raw, _) = decode_whole(b"a\\0ab\\5cc\\07");
        assert_eq!(raw, b"a\nb\\c\x07");
    }

    #[test]
    fn decode_extracts_records() {
        let (raw, records) = decode_whole(b"out\\@title:hello\nput");
        assert_eq!(raw, b"output");
        assert_eq!(records, vec![b"title:hello".to_vec()]);
    }

    #[test]
    fn decode_is_chunking_invariant() {
        let stream: &[u8] = b"one\\0atwo\\@state:{\"x\":1}\nthree\\5c";
        let whole = decode_whole(stream);
        for split in 1..stream.len() {
            let mut decoder = OutputDecoder::default();
            let mut raw = Vec::new();
            let mut records = Vec::new();
            decoder.feed(&stream[..split], &mut raw, &mut records);
            decoder.feed(&stream[split..], &mut raw, &mut records);
            assert_eq!((raw, records), whole, "split at {}", split);
        }
    }

    #[test]
    fn decode_passes_unknown_escapes_through() {
        let (raw, _) = decode_whole(b"x\\zy");
        assert_eq!(raw, b"x\\zy");
    }
}
