//! PTY process manager: forks a child on a fresh pseudo-terminal, applies
//! window-size changes, signals the child's process group, and reaps it
//! without blocking. A dead pty is fatal to the whole session; the broker
//! observes it as EOF/EIO on the master descriptor and exits.

use std::env;
use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::process;

use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

pub struct PtyProcess {
    master: OwnedFd,
    pid: Pid,
}

impl PtyProcess {
    /// Create a pty pair and fork. The child makes the pty its controlling
    /// terminal (forkpty does the setsid/TIOCSCTTY dance) and execs the
    /// target program; the parent keeps the master descriptor and pid.
    ///
    /// Descriptors the child must not keep, like the listening socket, are
    /// opened close-on-exec by std, so the exec drops them.
    pub fn spawn(command: &str, args: &[String], rows: u16, cols: u16, cwd: &Path) -> io::Result<Self> {
        let mut winsize = libc::winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        let mut master_fd: libc::c_int = -1;
        let pid = unsafe {
            libc::forkpty(
                &mut master_fd as *mut libc::c_int,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                &mut winsize as *mut libc::winsize,
            )
        };

        if pid < 0 {
            return Err(io::Error::last_os_error());
        }

        if pid == 0 {
            // Child. Only exec or exit from here.
            env::set_var("TERM", "xterm-256color");
            if env::set_current_dir(cwd).is_err() {
                eprintln!("sesh-broker: failed to chdir to {}", cwd.display());
            }

            let c_command = CString::new(command).unwrap_or_else(|_| {
                eprintln!("sesh-broker: invalid command name");
                process::exit(127);
            });
            let c_args: Vec<CString> = std::iter::once(c_command.clone())
                .chain(args.iter().map(|a| {
                    CString::new(a.as_str()).unwrap_or_else(|_| {
                        eprintln!("sesh-broker: invalid argument");
                        process::exit(127);
                    })
                }))
                .collect();
            let c_argv: Vec<*const libc::c_char> = c_args
                .iter()
                .map(|a| a.as_ptr())
                .chain(std::iter::once(std::ptr::null()))
                .collect();

            unsafe {
                libc::execvp(c_command.as_ptr(), c_argv.as_ptr());
            }
            let err = io::Error::last_os_error();
            eprintln!("sesh-broker: exec {} failed: {}", command, err);
            process::exit(127);
        }

        // SAFETY: master_fd is a fresh descriptor owned by us after forkpty.
        let master = unsafe { OwnedFd::from_raw_fd(master_fd) };
        Ok(Self {
            master,
            pid: Pid::from_raw(pid),
        })
    }

    pub fn master_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Put the master descriptor into non-blocking mode for use with the
    /// readiness loop.
    pub fn set_nonblocking(&self) -> io::Result<()> {
        let fd = self.master_fd();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Apply a new window size. Idempotent; errors only for a dead pty.
    pub fn resize(&self, rows: u16, cols: u16) -> io::Result<()> {
        let ws = libc::winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let rc = unsafe { libc::ioctl(self.master_fd(), libc::TIOCSWINSZ, &ws) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Deliver a signal to the child's process group. Tries the pty-level
    /// TIOCSIG ioctl first, then the foreground process group, and as a last
    /// resort signals the pid directly.
    pub fn signal_group(&self, sig: Signal) {
        #[cfg(target_os = "linux")]
        {
            let rc = unsafe { libc::ioctl(self.master_fd(), libc::TIOCSIG, sig as libc::c_int) };
            if rc == 0 {
                return;
            }
        }

        let pgrp = unsafe { libc::tcgetpgrp(self.master_fd()) };
        if pgrp > 0 && signal::killpg(Pid::from_raw(pgrp), sig).is_ok() {
            return;
        }

        if let Err(err) = signal::kill(self.pid, sig) {
            tracing::warn!(pid = %self.pid, signal = %sig, error = %err, "could not signal child");
        }
    }

    /// Non-blocking reap. Returns the child's exit code once it has exited;
    /// `None` while it is still running (or already collected).
    pub fn reap(&self) -> Option<i32> {
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => Some(code),
            Ok(WaitStatus::Signaled(_, sig, _)) => Some(128 + sig as i32),
            Ok(_) => None,
            Err(nix::errno::Errno::ECHILD) => Some(0),
            Err(err) => {
                tracing::warn!(pid = %self.pid, error = %err, "waitpid failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn read_all(pty: &PtyProcess, deadline: Duration) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        let until = Instant::now() + deadline;
        while Instant::now() < until {
            let n = unsafe {
                libc::read(pty.master_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n > 0 {
                out.extend_from_slice(&buf[..n as usize]);
            } else if n == 0 {
                break;
            } else {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    std::thread::sleep(Duration::from_millis(10));
                    continue;
                }
                break; // EIO after child exit
            }
        }
        out
    }

    #[test]
    fn spawn_runs_command_on_a_tty() {
        let pty = PtyProcess::spawn(
            "/bin/sh",
            &["-c".into(), "echo pty_spawn_works".into()],
            24,
            80,
            Path::new("/tmp"),
        )
        .expect("spawn");
        pty.set_nonblocking().unwrap();

        let out = read_all(&pty, Duration::from_secs(5));
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("pty_spawn_works"), "got: {:?}", text);
    }

    #[test]
    fn reap_returns_exit_code() {
        let pty = PtyProcess::spawn(
            "/bin/sh",
            &["-c".into(), "exit 7".into()],
            24,
            80,
            Path::new("/tmp"),
        )
        .expect("spawn");
        pty.set_nonblocking().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(code) = pty.reap() {
                assert_eq!(code, 7);
                break;
            }
            assert!(Instant::now() < deadline, "child never exited");
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn resize_is_idempotent() {
        let pty = PtyProcess::spawn(
            "/bin/sh",
            &["-c".into(), "sleep 2".into()],
            24,
            80,
            Path::new("/tmp"),
        )
        .expect("spawn");
        pty.resize(40, 120).expect("first resize");
        pty.resize(40, 120).expect("second resize");
        pty.signal_group(Signal::SIGTERM);
    }
}
