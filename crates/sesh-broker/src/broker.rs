//! The session broker process: owns the pty child, the listening socket, the
//! client roster, the codec, and the transform, and drives them all from one
//! readiness loop on a current-thread runtime.
//!
//! Every iteration waits for exactly one event (new connection, client
//! input, pty output, pty writability, child signal, termination signal),
//! handles it, then runs a post-pass that compacts dead clients, reacts to
//! attach transitions, and decides whether an ephemeral session is over.
//! Handlers never block and never touch session state from a signal context;
//! signals arrive as events like everything else.

use std::fs;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::process;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use tokio::io::unix::AsyncFd;
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info, warn};

use crate::codec::{Action, KbdCodec, KbdOutput};
use crate::error::{Error, Result};
use crate::pty::PtyProcess;
use crate::roster::{ClientId, Roster};
use crate::session::{
    self, SessionDirs, SessionMeta, SOCKET_MODE_ATTACHED, SOCKET_MODE_IDLE,
};
use crate::transform::{OutputTransform, PlainTransform};

/// Bounded pty read per pass, so one chatty child cannot starve the loop.
const PTY_CHUNK: usize = 4096;

pub struct ServeOpts {
    pub session: Option<String>,
    pub ephemeral: bool,
    pub profile: Option<String>,
    pub dir: Option<PathBuf>,
    pub rows: u16,
    pub cols: u16,
    pub cwd: Option<PathBuf>,
    pub command: String,
    pub args: Vec<String>,
}

/// A session started without a name is ephemeral and gets a pid-derived one.
fn resolve_name(session: Option<String>, ephemeral_flag: bool) -> (String, bool) {
    match session {
        Some(name) => (name, ephemeral_flag),
        None => (session::ephemeral_name(), true),
    }
}

/// Run a session to completion. Returns the process exit code: 0 once the
/// child has exited or the ephemeral session terminated, errors only for
/// startup failures.
pub fn serve(opts: ServeOpts) -> Result<i32> {
    let dirs = SessionDirs::open(opts.dir)?;
    let (name, ephemeral) = resolve_name(opts.session, opts.ephemeral);
    let socket_path = dirs.socket_path(&name);

    let listener = bind_or_recover(&socket_path)
        .map_err(|source| Error::Bind { path: socket_path.clone(), source })?;

    let cwd = opts
        .cwd
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("/"));
    let pty = PtyProcess::spawn(&opts.command, &opts.args, opts.rows, opts.cols, &cwd)
        .map_err(|source| Error::PtySpawn { command: opts.command.clone(), source })?;
    pty.set_nonblocking()?;

    let meta_path = dirs.meta_path(&name);
    let meta = SessionMeta {
        id: name.clone(),
        command: opts.command,
        args: opts.args,
        pid: pty.pid().as_raw() as u32,
        broker_pid: process::id(),
        created_at: session::now_millis(),
        rows: opts.rows,
        cols: opts.cols,
        status: "running".into(),
        exit_code: None,
        title: None,
        ephemeral,
    };
    session::write_meta(&meta_path, &meta);
    info!(session = %name, pid = %pty.pid(), ephemeral, "session started");

    let rows = opts.rows;
    let cols = opts.cols;
    let profile = opts.profile;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let master_fd = pty.master_fd();
        // SAFETY: the fd is owned by `pty`, which lives in the broker until
        // the loop returns; the AsyncFd is dropped first (field order).
        let pty_fd = AsyncFd::new(unsafe { BorrowedFd::borrow_raw(master_fd) })?;
        let listener = UnixListener::from_std(listener)?;

        let mut broker = Broker {
            dirs,
            socket_path,
            meta_path,
            meta,
            listener,
            pty_fd,
            pty,
            roster: Roster::default(),
            codec: KbdCodec::new(rows, cols),
            transform: Box::new(PlainTransform::default()),
            profile,
            ephemeral,
            first_attach: false,
            socket_attached: false,
            pending_pty: Vec::new(),
            read_buf: vec![0u8; PTY_CHUNK],
            out_buf: Vec::new(),
            last_title: String::new(),
            child_exit: None,
            done: false,
            dump_seq: 0,
        };
        Ok(broker.run().await)
    })
}

/// Bind the session socket; if the path is occupied by a dead broker's
/// socket (connect refused), unlink it and bind again.
fn bind_or_recover(path: &std::path::Path) -> io::Result<std::os::unix::net::UnixListener> {
    match session::bind_socket(path) {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
            match session::connect_socket(path) {
                Err(probe) if probe.kind() == io::ErrorKind::ConnectionRefused => {
                    warn!(path = %path.display(), "removing stale socket");
                    fs::remove_file(path)?;
                    session::bind_socket(path)
                }
                _ => Err(err),
            }
        }
        Err(err) => Err(err),
    }
}

enum Event {
    Accepted(UnixStream),
    ClientReadable(ClientId),
    ClientWritable(ClientId),
    /// `read_buf[..n]` holds fresh child output.
    PtyData(usize),
    PtyClosed,
    ChildSignal,
    Terminate,
}

struct Signals {
    child: tokio::signal::unix::Signal,
    term: tokio::signal::unix::Signal,
    int: tokio::signal::unix::Signal,
    hup: tokio::signal::unix::Signal,
}

impl Signals {
    fn new() -> io::Result<Self> {
        Ok(Self {
            child: signal(SignalKind::child())?,
            term: signal(SignalKind::terminate())?,
            int: signal(SignalKind::interrupt())?,
            hup: signal(SignalKind::hangup())?,
        })
    }
}

/// Wait for the next event. Takes the broker's fields individually so the
/// handlers keep exclusive access to the rest of the state.
///
/// The pty arms do their I/O here because clearing readiness on WouldBlock
/// needs the guard; everything touching the roster mutably happens in the
/// handlers instead.
async fn next_event(
    listener: &UnixListener,
    pty_fd: &AsyncFd<BorrowedFd<'static>>,
    signals: &mut Signals,
    roster: &Roster,
    read_buf: &mut [u8],
    pending_pty: &mut Vec<u8>,
    pty_armed: bool,
) -> Event {
    let fd = pty_fd.get_ref().as_raw_fd();
    loop {
        let event = tokio::select! {
            biased;

            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => Some(Event::Accepted(stream)),
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    None
                }
            },

            _ = signals.child.recv() => Some(Event::ChildSignal),
            _ = signals.term.recv() => Some(Event::Terminate),
            _ = signals.int.recv() => Some(Event::Terminate),
            _ = signals.hup.recv() => Some(Event::Terminate),

            ready = pty_fd.writable(), if !pending_pty.is_empty() => match ready {
                Ok(mut guard) => write_pty(fd, pending_pty, &mut guard),
                Err(_) => Some(Event::PtyClosed),
            },

            ready = pty_fd.readable(), if pty_armed => match ready {
                Ok(mut guard) => read_pty(fd, read_buf, &mut guard),
                Err(_) => Some(Event::PtyClosed),
            },

            id = std::future::poll_fn(|cx| roster.poll_readable(cx)) => {
                Some(Event::ClientReadable(id))
            },

            id = std::future::poll_fn(|cx| roster.poll_writable(cx)),
                if roster.any_pending() =>
            {
                Some(Event::ClientWritable(id))
            },
        };
        if let Some(event) = event {
            return event;
        }
    }
}

fn read_pty(
    fd: RawFd,
    buf: &mut [u8],
    guard: &mut tokio::io::unix::AsyncFdReadyGuard<'_, BorrowedFd<'static>>,
) -> Option<Event> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n > 0 {
        return Some(Event::PtyData(n as usize));
    }
    if n == 0 {
        return Some(Event::PtyClosed);
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock {
        guard.clear_ready();
        return None;
    }
    // EIO here means the child side of the pty is gone.
    Some(Event::PtyClosed)
}

fn write_pty(
    fd: RawFd,
    pending: &mut Vec<u8>,
    guard: &mut tokio::io::unix::AsyncFdReadyGuard<'_, BorrowedFd<'static>>,
) -> Option<Event> {
    while !pending.is_empty() {
        let n = unsafe { libc::write(fd, pending.as_ptr() as *const libc::c_void, pending.len()) };
        if n > 0 {
            pending.drain(..n as usize);
            continue;
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            guard.clear_ready();
            return None;
        }
        return Some(Event::PtyClosed);
    }
    None
}

struct Broker {
    dirs: SessionDirs,
    socket_path: PathBuf,
    meta_path: PathBuf,
    meta: SessionMeta,
    listener: UnixListener,
    // pty_fd borrows pty's master descriptor; declared first so it drops
    // before the OwnedFd closes.
    pty_fd: AsyncFd<BorrowedFd<'static>>,
    pty: PtyProcess,
    roster: Roster,
    codec: KbdCodec,
    transform: Box<dyn OutputTransform>,
    profile: Option<String>,
    ephemeral: bool,
    /// Latched on the first successful client read; gates pty reads so early
    /// output waits for someone to see it.
    first_attach: bool,
    /// Current state of the socket exec-bit discovery signal.
    socket_attached: bool,
    /// Input bytes waiting for the pty to accept them.
    pending_pty: Vec<u8>,
    read_buf: Vec<u8>,
    /// Shared transformed-output buffer, filled and fanned out at most once
    /// per pass.
    out_buf: Vec<u8>,
    last_title: String,
    child_exit: Option<i32>,
    done: bool,
    dump_seq: u32,
}

impl Broker {
    async fn run(&mut self) -> i32 {
        let mut signals = match Signals::new() {
            Ok(signals) => signals,
            Err(err) => {
                warn!(error = %err, "cannot install signal handlers");
                return 1;
            }
        };

        while !self.done {
            let event = next_event(
                &self.listener,
                &self.pty_fd,
                &mut signals,
                &self.roster,
                &mut self.read_buf,
                &mut self.pending_pty,
                self.first_attach || self.child_exit.is_some(),
            )
            .await;

            match event {
                Event::Accepted(stream) => {
                    let id = self.roster.add(stream);
                    debug!(client = id, total = self.roster.len(), "client connected");
                }
                Event::ClientReadable(id) => self.client_input(id),
                Event::ClientWritable(id) => {
                    if let Some(client) = self.roster.get_mut(id) {
                        client.flush();
                    }
                }
                Event::PtyData(n) => self.pump_output(n),
                Event::PtyClosed => self.finish_child(),
                Event::ChildSignal => {
                    if let Some(code) = self.pty.reap() {
                        debug!(code, "child exited");
                        self.child_exit = Some(code);
                        // Without a first attach the pty arm never fires, so
                        // there is no output left worth draining.
                        if !self.first_attach {
                            self.done = true;
                        }
                    }
                }
                Event::Terminate => {
                    info!("termination signal; stopping session");
                    self.pty.signal_group(Signal::SIGTERM);
                    self.done = true;
                }
            }

            self.post_pass();
        }

        self.cleanup();
        0
    }

    /// One client became readable: pull a chunk, run it through the codec,
    /// queue child input, apply control actions.
    fn client_input(&mut self, id: ClientId) {
        let mut buf = [0u8; 1024];
        let n = {
            let client = match self.roster.get_mut(id) {
                Some(client) => client,
                None => return,
            };
            match client.stream.try_read(&mut buf) {
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    debug!(client = id, error = %err, "client read failed");
                    client.dead = true;
                    return;
                }
            }
        };
        if n == 0 {
            debug!(client = id, "client disconnected");
            self.roster.mark_dead(id);
            return;
        }

        if self.roster.mark_attached(id) {
            debug!(client = id, "client attached");
            self.on_first_attach();
            self.broadcast_watchers();
        }

        let mut out = KbdOutput::default();
        self.codec.feed(&buf[..n], self.transform.app_cursor(), &mut out);

        if !out.pty.is_empty() {
            self.pending_pty.extend_from_slice(&out.pty);
            self.flush_pty();
        }
        for action in out.actions {
            self.apply_action(id, action);
        }
    }

    fn apply_action(&mut self, id: ClientId, action: Action) {
        match action {
            Action::Resize { rows, cols } => {
                if let Err(err) = self.pty.resize(rows, cols) {
                    warn!(error = %err, "resize failed");
                }
                self.meta.rows = rows;
                self.meta.cols = cols;
                session::write_meta(&self.meta_path, &self.meta);
            }
            Action::TitleChanged => {
                self.meta.title = self.codec.client_title().map(str::to_owned);
                session::write_meta(&self.meta_path, &self.meta);
                self.last_title = self.title();
                let record = self.title_record();
                self.broadcast(record.as_bytes());
            }
            Action::Identity(endpoint) => {
                if let Some(client) = self.roster.get_mut(id) {
                    client.endpoint = endpoint;
                }
                self.broadcast_watchers();
            }
            Action::Subscribe => {
                let title = self.title_record();
                let state = format!("\\@state:{}\n", self.transform.state_json());
                let profiles = format!(
                    "\\@profiles:{}\n",
                    serde_json::to_string(&self.dirs.profile_names())
                        .unwrap_or_else(|_| "[]".into())
                );
                if let Some(client) = self.roster.get_mut(id) {
                    client.wants_output = true;
                    client.send(title.as_bytes());
                    client.send(state.as_bytes());
                    client.send(profiles.as_bytes());
                }
            }
            Action::Watchers => {
                let record = format!("\\@watchers:{}\n", self.roster.watchers_json());
                if let Some(client) = self.roster.get_mut(id) {
                    client.send(record.as_bytes());
                }
            }
            Action::Dump => self.write_dump(),
            Action::KeepAlive => {}
        }
    }

    /// Child output pass: transform once into the shared buffer, fan out to
    /// every subscribed client, clear. Also notices derived-title changes.
    fn pump_output(&mut self, n: usize) {
        self.transform.transform(&self.read_buf[..n], &mut self.out_buf);
        if !self.out_buf.is_empty() {
            for (_, client) in self.roster.iter_mut() {
                if client.wants_output {
                    client.send(&self.out_buf);
                }
            }
            self.out_buf.clear();
        }

        let title = self.title();
        if title != self.last_title {
            self.last_title = title;
            let record = self.title_record();
            self.broadcast(record.as_bytes());
        }
    }

    /// Effective title: a client-set one wins over the derived one.
    fn title(&self) -> String {
        match self.codec.client_title() {
            Some(title) => title.to_owned(),
            None => self.transform.derived_title(),
        }
    }

    fn title_record(&self) -> String {
        format!("\\@title:{}\n", self.title())
    }

    fn broadcast(&mut self, bytes: &[u8]) {
        for (_, client) in self.roster.iter_mut() {
            if client.wants_output {
                client.send(bytes);
            }
        }
    }

    fn broadcast_watchers(&mut self) {
        let record = format!("\\@watchers:{}\n", self.roster.watchers_json());
        self.broadcast(record.as_bytes());
    }

    /// Opportunistic pty write; whatever hits WouldBlock stays queued for
    /// the writable arm.
    fn flush_pty(&mut self) {
        let fd = self.pty.master_fd();
        while !self.pending_pty.is_empty() {
            let n = unsafe {
                libc::write(
                    fd,
                    self.pending_pty.as_ptr() as *const libc::c_void,
                    self.pending_pty.len(),
                )
            };
            if n > 0 {
                self.pending_pty.drain(..n as usize);
                continue;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                debug!(error = %err, "pty write failed");
            }
            return;
        }
    }

    /// Latched at the mark-attached transition, not derived from roster
    /// presence: a client that attaches and dies within the same pass still
    /// counts as the first attach.
    fn on_first_attach(&mut self) {
        if self.first_attach {
            return;
        }
        self.first_attach = true;
        info!("first client attached");
        if let Some(pre) = self.profile.as_deref().and_then(|p| self.dirs.preamble(p)) {
            self.pending_pty.extend_from_slice(&pre);
            self.flush_pty();
        }
    }

    /// After any event: compact the roster, react to attach transitions,
    /// decide whether an ephemeral session is over.
    fn post_pass(&mut self) {
        if self.roster.compact() > 0 {
            self.broadcast_watchers();
        }

        let attached = self.roster.any_attached();

        if attached != self.socket_attached {
            self.socket_attached = attached;
            let mode = if attached { SOCKET_MODE_ATTACHED } else { SOCKET_MODE_IDLE };
            let perms = fs::Permissions::from_mode(mode);
            if let Err(err) = fs::set_permissions(&self.socket_path, perms) {
                warn!(error = %err, "cannot update socket mode");
            }
        }

        if self.ephemeral && self.first_attach && self.roster.is_empty() && !self.done {
            // No signal needed: closing the pty master on exit hangs up the
            // child's controlling terminal.
            info!("last client detached; terminating ephemeral session");
            self.done = true;
        }
    }

    /// The pty went away: collect the child's status, with a short grace
    /// period in case SIGCHLD has not been delivered yet.
    fn finish_child(&mut self) {
        if self.child_exit.is_none() {
            let deadline = Instant::now() + Duration::from_secs(2);
            loop {
                if let Some(code) = self.pty.reap() {
                    self.child_exit = Some(code);
                    break;
                }
                if Instant::now() >= deadline {
                    warn!("pty closed but child did not exit; signalling");
                    self.pty.signal_group(Signal::SIGTERM);
                    break;
                }
                std::thread::sleep(Duration::from_millis(20));
            }
        }
        self.done = true;
    }

    fn write_dump(&mut self) {
        self.dump_seq += 1;
        let path = self
            .dirs
            .dumps_dir()
            .join(format!("{}.{}", process::id(), self.dump_seq));
        let mut text = self.codec.dump();
        text.push_str(&format!(
            "clients: {}\nattached: {}\nwatchers: {}\n",
            self.roster.len(),
            self.roster.any_attached(),
            self.roster.watchers_json(),
        ));
        if let Err(err) = fs::write(&path, text) {
            warn!(path = %path.display(), error = %err, "cannot write dump");
        } else {
            info!(path = %path.display(), "diagnostics dumped");
        }
    }

    fn cleanup(&mut self) {
        let _ = fs::remove_file(&self.socket_path);
        self.meta.status = "exited".into();
        self.meta.exit_code = self.child_exit;
        session::write_meta(&self.meta_path, &self.meta);
        info!(code = ?self.child_exit, "session ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_sessions_keep_their_name() {
        let (name, ephemeral) = resolve_name(Some("work".into()), false);
        assert_eq!(name, "work");
        assert!(!ephemeral);
    }

    #[test]
    fn named_sessions_can_still_be_ephemeral() {
        let (_, ephemeral) = resolve_name(Some("scratch".into()), true);
        assert!(ephemeral);
    }

    #[test]
    fn unnamed_sessions_are_ephemeral() {
        let (name, ephemeral) = resolve_name(None, false);
        assert_eq!(name, session::ephemeral_name());
        assert!(ephemeral);
    }

    #[test]
    fn stale_socket_is_recovered() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("stale.sock");
        // Bind and drop: the file stays behind with nothing listening.
        drop(session::bind_socket(&path).unwrap());
        assert!(path.exists());

        let listener = bind_or_recover(&path).expect("recover stale socket");
        drop(listener);
    }

    #[test]
    fn live_socket_is_not_stolen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("live.sock");
        let _holder = session::bind_socket(&path).unwrap();

        let err = bind_or_recover(&path).expect_err("should refuse to steal");
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }
}
