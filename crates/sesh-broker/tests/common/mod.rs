//! Reusable harness for sesh-broker integration tests.
//!
//! Spawns the real binary against a tempdir state directory and talks the
//! control-escape protocol over the session's Unix socket with plain
//! blocking sockets.

use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tempfile::TempDir;

pub const BIN: &str = env!("CARGO_BIN_EXE_sesh-broker");

/// A broker process bound to its own isolated state directory. Kills the
/// process and removes the directory on drop.
pub struct Broker {
    pub child: Child,
    pub name: String,
    tmp: TempDir,
}

impl Broker {
    pub fn dir(&self) -> PathBuf {
        self.tmp.path().join("state")
    }

    pub fn socket_path(&self) -> PathBuf {
        self.dir().join("sockets").join(format!("{}.sock", self.name))
    }

    pub fn meta_path(&self) -> PathBuf {
        self.dir().join("sessions").join(format!("{}.json", self.name))
    }

    pub fn meta_json(&self) -> Option<serde_json::Value> {
        let text = fs::read_to_string(self.meta_path()).ok()?;
        serde_json::from_str(&text).ok()
    }

    pub fn connect(&self) -> Client {
        Client::connect(&self.socket_path())
    }

    /// Poll until the broker process exits, or panic after the timeout.
    pub fn wait_exit(&mut self, timeout: Duration) -> ExitStatus {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.child.try_wait().expect("try_wait") {
                return status;
            }
            assert!(Instant::now() < deadline, "broker did not exit in time");
            std::thread::sleep(Duration::from_millis(25));
        }
    }

    pub fn is_running(&mut self) -> bool {
        self.child.try_wait().expect("try_wait").is_none()
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Spawn `sesh-broker serve` for a named session and wait for its socket.
pub fn spawn_broker(name: &str, flags: &[&str], command: &[&str]) -> Broker {
    let tmp = tempfile::tempdir().expect("tempdir");
    let dir = tmp.path().join("state");

    let mut cmd = Command::new(BIN);
    cmd.arg("serve")
        .arg("--session")
        .arg(name)
        .args(flags)
        .args(command)
        .env("SESH_DIR", &dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    let child = cmd.spawn().expect("spawn sesh-broker");

    let mut broker = Broker {
        child,
        name: name.to_owned(),
        tmp,
    };

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if broker.socket_path().exists() {
            // Give the listener a moment to start accepting.
            std::thread::sleep(Duration::from_millis(50));
            break;
        }
        // A short-lived child can end the whole session, socket unlinked and
        // all, before this poll ever observes the socket.
        if let Some(status) = broker.child.try_wait().expect("try_wait") {
            assert!(status.success(), "broker failed at startup: {:?}", status);
            break;
        }
        assert!(Instant::now() < deadline, "socket never appeared");
        std::thread::sleep(Duration::from_millis(20));
    }
    broker
}

/// Poll an arbitrary child process until it exits, or panic after the
/// timeout.
pub fn wait_child_exit(child: &mut Child, timeout: Duration) -> ExitStatus {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait().expect("try_wait") {
            return status;
        }
        assert!(Instant::now() < deadline, "process did not exit in time");
        std::thread::sleep(Duration::from_millis(25));
    }
}

/// Blocking protocol client. Output arrives escaped; `wait_for` searches the
/// raw stream, which works for printable needles.
pub struct Client {
    pub stream: UnixStream,
    pub received: Vec<u8>,
}

impl Client {
    pub fn connect(path: &std::path::Path) -> Self {
        let stream = UnixStream::connect(path).expect("connect");
        stream
            .set_read_timeout(Some(Duration::from_millis(100)))
            .expect("read timeout");
        Self {
            stream,
            received: Vec::new(),
        }
    }

    /// Announce ourselves and subscribe to output.
    pub fn attach(&mut self) {
        self.send(b"\\N\\s");
    }

    pub fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).expect("write");
    }

    fn pump(&mut self) -> bool {
        let mut buf = [0u8; 8192];
        match self.stream.read(&mut buf) {
            Ok(0) => false,
            Ok(n) => {
                self.received.extend_from_slice(&buf[..n]);
                true
            }
            Err(ref err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut =>
            {
                true
            }
            Err(_) => false,
        }
    }

    /// Collect output until the needle shows up. Panics on timeout with the
    /// received bytes in the message.
    pub fn wait_for(&mut self, needle: &[u8], timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            if self
                .received
                .windows(needle.len().max(1))
                .any(|w| w == needle)
            {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "never saw {:?}; received so far: {:?}",
                String::from_utf8_lossy(needle),
                String::from_utf8_lossy(&self.received)
            );
            if !self.pump() {
                std::thread::sleep(Duration::from_millis(20));
            }
        }
    }

    /// Drain whatever arrives within the window.
    pub fn collect(&mut self, window: Duration) -> &[u8] {
        let deadline = Instant::now() + window;
        while Instant::now() < deadline {
            if !self.pump() {
                break;
            }
        }
        &self.received
    }
}

/// Poll a condition until it holds or the timeout expires.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    cond()
}
