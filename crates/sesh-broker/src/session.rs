//! Session directory layout, naming, and on-disk session metadata.
//!
//! Every session is one socket under `<state dir>/sockets/` plus one JSON
//! metadata file under `<state dir>/sessions/`. The state directory defaults
//! to `~/.sesh` and can be overridden with `--dir` / `SESH_DIR`. A session
//! invoked without a name gets a process-derived ephemeral name and
//! terminates itself once its last viewer detaches.

use std::env;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const SOCKET_EXT: &str = "sock";

/// Mode bits for the socket file: owner rw, plus the executable bit toggled
/// on while at least one client is attached (out-of-band discovery signal).
pub const SOCKET_MODE_IDLE: u32 = 0o600;
pub const SOCKET_MODE_ATTACHED: u32 = 0o700;

pub struct SessionDirs {
    root: PathBuf,
}

impl SessionDirs {
    /// Resolve and create the state directory tree. "Already exists" is
    /// success; any other failure is fatal to startup.
    pub fn open(override_dir: Option<PathBuf>) -> Result<Self> {
        let root = match override_dir {
            Some(dir) => dir,
            None => {
                let home = env::var_os("HOME").ok_or(Error::NoStateDir)?;
                PathBuf::from(home).join(".sesh")
            }
        };
        let dirs = Self { root };
        for dir in [dirs.root.clone(), dirs.sockets_dir(), dirs.sessions_dir(), dirs.dumps_dir()] {
            fs::create_dir_all(&dir).map_err(|source| Error::CreateDir { path: dir, source })?;
        }
        Ok(dirs)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sockets_dir(&self) -> PathBuf {
        self.root.join("sockets")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    pub fn dumps_dir(&self) -> PathBuf {
        self.root.join("dumps")
    }

    pub fn profiles_dir(&self) -> PathBuf {
        self.root.join("profiles")
    }

    pub fn socket_path(&self, name: &str) -> PathBuf {
        self.sockets_dir().join(format!("{}.{}", name, SOCKET_EXT))
    }

    pub fn meta_path(&self, name: &str) -> PathBuf {
        self.sessions_dir().join(format!("{}.json", name))
    }

    /// Profile names are the subdirectories of `profiles/`. Missing profile
    /// directory just means no profiles.
    pub fn profile_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        let entries = match fs::read_dir(self.profiles_dir()) {
            Ok(entries) => entries,
            Err(_) => return names,
        };
        for entry in entries.flatten() {
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        names
    }

    /// Welcome text injected into the pty input on first attach, if the
    /// profile provides one.
    pub fn preamble(&self, profile: &str) -> Option<Vec<u8>> {
        fs::read(self.profiles_dir().join(profile).join("preamble")).ok()
    }

    /// Scan the socket directory. Attached state is read from the exec bit
    /// without opening any socket.
    pub fn list_sessions(&self) -> io::Result<Vec<SessionEntry>> {
        let mut sessions = Vec::new();
        for entry in fs::read_dir(self.sockets_dir())? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SOCKET_EXT) {
                continue;
            }
            let name = match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) => stem.to_string(),
                None => continue,
            };
            let attached = entry
                .metadata()
                .map(|m| m.permissions().mode() & 0o100 != 0)
                .unwrap_or(false);
            sessions.push(SessionEntry { name, attached });
        }
        sessions.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(sessions)
    }
}

pub struct SessionEntry {
    pub name: String,
    pub attached: bool,
}

/// Name for a session started without an explicit identifier. Unique per
/// broker process, which is what ephemeral sessions need.
pub fn ephemeral_name() -> String {
    format!("e{}", std::process::id())
}

// ── Socket-address length fallback ──────────────────────────────────

/// `sockaddr_un` paths are limited to ~108 bytes. When a path exceeds that,
/// retry once from inside the parent directory with a relative name, then
/// restore the working directory.
fn with_short_path<T>(
    path: &Path,
    op: impl Fn(&Path) -> io::Result<T>,
) -> io::Result<T> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "socket path has no parent"))?;
    let name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "socket path has no file name"))?;

    let saved = env::current_dir()?;
    env::set_current_dir(parent)?;
    let result = op(Path::new(name));
    let restored = env::set_current_dir(&saved);
    if let Err(err) = restored {
        tracing::warn!(dir = %saved.display(), error = %err, "could not restore working directory");
    }
    result
}

/// Paths too long for `sockaddr_un` surface as `InvalidInput` from std or as
/// raw `ENAMETOOLONG` from the kernel.
fn name_too_long(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ENAMETOOLONG) || err.kind() == io::ErrorKind::InvalidInput
}

/// Bind the session's listening socket, falling back to the chdir trick on
/// over-long paths. The socket starts in idle mode (0600).
pub fn bind_socket(path: &Path) -> io::Result<UnixListener> {
    let listener = match UnixListener::bind(path) {
        Ok(listener) => listener,
        Err(err) if name_too_long(&err) => with_short_path(path, |p| UnixListener::bind(p))?,
        Err(err) => return Err(err),
    };
    listener.set_nonblocking(true)?;
    fs::set_permissions(path, fs::Permissions::from_mode(SOCKET_MODE_IDLE))?;
    Ok(listener)
}

/// Connect to a session socket with the same over-long-path fallback as
/// `bind_socket`.
pub fn connect_socket(path: &Path) -> io::Result<UnixStream> {
    match UnixStream::connect(path) {
        Ok(stream) => Ok(stream),
        Err(err) if name_too_long(&err) => with_short_path(path, |p| UnixStream::connect(p)),
        Err(err) => Err(err),
    }
}

// ── Session metadata ────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Clone)]
pub struct SessionMeta {
    pub id: String,
    pub command: String,
    pub args: Vec<String>,
    pub pid: u32,
    pub broker_pid: u32,
    pub created_at: u64,
    pub rows: u16,
    pub cols: u16,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub ephemeral: bool,
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Write-temp-then-rename so a concurrent reader never sees a torn file.
pub fn write_meta(path: &Path, meta: &SessionMeta) {
    let json = match serde_json::to_string(meta) {
        Ok(json) => json,
        Err(err) => {
            tracing::warn!(error = %err, "could not serialize session metadata");
            return;
        }
    };
    let tmp = path.with_extension("json.tmp");
    let written = fs::write(&tmp, &json).and_then(|_| fs::rename(&tmp, path));
    if written.is_err() {
        // Fall back to a direct write; metadata is advisory.
        let _ = fs::write(path, &json);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dirs_in(tmp: &tempfile::TempDir) -> SessionDirs {
        SessionDirs::open(Some(tmp.path().join("state"))).expect("open dirs")
    }

    #[test]
    fn open_creates_directory_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = dirs_in(&tmp);
        assert!(dirs.sockets_dir().is_dir());
        assert!(dirs.sessions_dir().is_dir());
        assert!(dirs.dumps_dir().is_dir());
    }

    #[test]
    fn open_tolerates_existing_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let _ = dirs_in(&tmp);
        // Second open over the same tree must succeed.
        let _ = dirs_in(&tmp);
    }

    #[test]
    fn open_fails_when_root_is_a_file() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("state");
        fs::write(&blocker, b"not a directory").unwrap();
        let err = SessionDirs::open(Some(blocker)).err().expect("should fail");
        assert!(matches!(err, Error::CreateDir { .. }));
    }

    #[test]
    fn socket_path_uses_name_and_extension() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = dirs_in(&tmp);
        let path = dirs.socket_path("work");
        assert!(path.ends_with("sockets/work.sock"));
    }

    #[test]
    fn ephemeral_name_derives_from_pid() {
        assert_eq!(ephemeral_name(), format!("e{}", std::process::id()));
    }

    #[test]
    fn bind_socket_short_path() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("s.sock");
        let listener = bind_socket(&path).expect("bind");
        drop(listener);
        assert!(path.exists());
    }

    #[test]
    fn bind_socket_falls_back_on_long_path() {
        let tmp = tempfile::tempdir().unwrap();
        // Build a directory chain well past the sockaddr_un limit.
        let mut dir = tmp.path().to_path_buf();
        for _ in 0..4 {
            dir = dir.join("x".repeat(40));
        }
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("deep.sock");
        assert!(path.as_os_str().len() > 108);

        let listener = bind_socket(&path).expect("bind via chdir fallback");
        assert!(path.exists(), "socket file should appear under the long path");

        // And the connect side must reach it the same way.
        let stream = connect_socket(&path).expect("connect via chdir fallback");
        drop(stream);
        drop(listener);
    }

    #[test]
    fn list_sessions_reads_exec_bit() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = dirs_in(&tmp);
        let idle = dirs.socket_path("idle");
        let busy = dirs.socket_path("busy");
        let _l1 = bind_socket(&idle).unwrap();
        let _l2 = bind_socket(&busy).unwrap();
        fs::set_permissions(&busy, fs::Permissions::from_mode(SOCKET_MODE_ATTACHED)).unwrap();

        let sessions = dirs.list_sessions().unwrap();
        let busy_entry = sessions.iter().find(|s| s.name == "busy").unwrap();
        let idle_entry = sessions.iter().find(|s| s.name == "idle").unwrap();
        assert!(busy_entry.attached);
        assert!(!idle_entry.attached);
    }

    #[test]
    fn meta_round_trips_through_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = dirs_in(&tmp);
        let meta = SessionMeta {
            id: "work".into(),
            command: "bash".into(),
            args: vec!["-l".into()],
            pid: 42,
            broker_pid: 41,
            created_at: now_millis(),
            rows: 24,
            cols: 80,
            status: "running".into(),
            exit_code: None,
            title: None,
            ephemeral: false,
        };
        let path = dirs.meta_path("work");
        write_meta(&path, &meta);
        let read: SessionMeta = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(read.id, "work");
        assert_eq!(read.pid, 42);
        // Optional None fields stay off disk.
        let raw = fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("exit_code"));
        assert!(!raw.contains("title"));
    }

    #[test]
    fn profile_names_empty_without_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = dirs_in(&tmp);
        assert!(dirs.profile_names().is_empty());
    }

    #[test]
    fn profile_names_and_preamble() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = dirs_in(&tmp);
        let prof = dirs.profiles_dir().join("dev");
        fs::create_dir_all(&prof).unwrap();
        fs::write(prof.join("preamble"), b"welcome\n").unwrap();

        assert_eq!(dirs.profile_names(), vec!["dev".to_string()]);
        assert_eq!(dirs.preamble("dev").unwrap(), b"welcome\n");
        assert!(dirs.preamble("missing").is_none());
    }
}
