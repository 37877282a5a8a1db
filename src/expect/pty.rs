//! Program running on a pseudo-terminal.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use std::{mem, ptr};

use super::pattern::{ExpectBuffer, PromptMatcher};
use super::{ExpectEngine, Outcome};

/// Size of a single read from the master side
const READ_CHUNK: usize = 4096;

/// Wide enough that shells do not wrap echoed commands
const PTY_COLUMNS: u16 = 1024;

enum Filled {
    Data,
    Eof,
    Timeout,
}

fn set_cloexec(fd: &OwnedFd) -> io::Result<()> {
    let rc = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Open a master/slave pair. The slave does not translate `\n` to `\r\n`
/// on output, so program output reaches the matcher as written.
fn open_pty() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut master = -1;
    let mut slave = -1;
    let mut ws: libc::winsize = unsafe { mem::zeroed() };
    ws.ws_row = 24;
    ws.ws_col = PTY_COLUMNS;

    let rc = unsafe {
        libc::openpty(
            &mut master,
            &mut slave,
            ptr::null_mut(),
            ptr::null_mut(),
            &mut ws,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    let master = unsafe { OwnedFd::from_raw_fd(master) };
    let slave = unsafe { OwnedFd::from_raw_fd(slave) };

    set_cloexec(&master)?;
    set_cloexec(&slave)?;

    let mut term: libc::termios = unsafe { mem::zeroed() };
    if unsafe { libc::tcgetattr(slave.as_raw_fd(), &mut term) } < 0 {
        return Err(io::Error::last_os_error());
    }
    term.c_oflag &= !libc::ONLCR;
    if unsafe { libc::tcsetattr(slave.as_raw_fd(), libc::TCSANOW, &term) } < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok((master, slave))
}

/// A program started as a session leader with a pty slave as its
/// controlling terminal and stdio.
pub struct PtySession {
    master: File,
    child: Child,
    buffer: ExpectBuffer,
    status: Option<ExitStatus>,
}

impl PtySession {
    pub fn spawn(argv: &[String], match_max: usize) -> io::Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command line"))?;

        let (master, slave) = open_pty()?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env("TERM", "dumb")
            .stdin(Stdio::from(slave.try_clone()?))
            .stdout(Stdio::from(slave.try_clone()?))
            .stderr(Stdio::from(slave));

        // Runs in the child between fork and exec: only async-signal-safe calls.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() < 0 {
                    return Err(io::Error::last_os_error());
                }
                if libc::ioctl(0, libc::TIOCSCTTY as _, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn()?;
        // the Command holds our copies of the slave
        drop(cmd);

        tracing::debug!("Spawned {:?} as pid {}", argv, child.id());

        Ok(Self {
            master: File::from(master),
            child,
            buffer: ExpectBuffer::new(match_max),
            status: None,
        })
    }

    fn fill(&mut self, timeout: Duration) -> io::Result<Filled> {
        let mut pfd = libc::pollfd {
            fd: self.master.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

        let ready = loop {
            let rc = unsafe { libc::poll(&mut pfd, 1, ms) };
            if rc >= 0 {
                break rc;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        };
        if ready == 0 {
            return Ok(Filled::Timeout);
        }

        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.master.read(&mut chunk) {
                Ok(0) => return Ok(Filled::Eof),
                Ok(n) => {
                    self.buffer.push(&chunk[..n]);
                    return Ok(Filled::Data);
                }
                // Linux reports a closed slave side as EIO
                Err(e) if e.raw_os_error() == Some(libc::EIO) => return Ok(Filled::Eof),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl ExpectEngine for PtySession {
    fn match_next(&mut self, matcher: &PromptMatcher, timeout: Duration) -> io::Result<Outcome> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(index) = self.buffer.try_match(matcher) {
                return Ok(Outcome::Matched(index));
            }
            if self.buffer.is_full() {
                return Ok(Outcome::FullBuffer);
            }
            let now = Instant::now();
            if now >= deadline {
                self.buffer.abandon_echo();
                return Ok(Outcome::Timeout);
            }
            match self.fill(deadline - now)? {
                Filled::Data => continue,
                Filled::Eof => return Ok(Outcome::Eof),
                Filled::Timeout => {
                    self.buffer.abandon_echo();
                    return Ok(Outcome::Timeout);
                }
            }
        }
    }

    fn before_match(&self) -> &[u8] {
        self.buffer.before_match()
    }

    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.master.write_all(data)?;
        self.master.flush()
    }

    fn expect_echo(&mut self, command: &[u8]) {
        self.buffer.expect_echo(command);
    }

    fn discard_pending(&mut self) -> usize {
        self.buffer.discard()
    }

    fn pid(&self) -> Option<libc::pid_t> {
        if self.status.is_some() {
            return None;
        }
        Some(self.child.id() as libc::pid_t)
    }

    fn close(&mut self) -> io::Result<Option<ExitStatus>> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        if self.child.try_wait()?.is_none() {
            if let Err(e) = self.child.kill() {
                tracing::debug!("kill of pid {} failed: {}", self.child.id(), e);
            }
        }
        let status = self.child.wait()?;
        self.status = Some(status);
        Ok(Some(status))
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("Failed to reap pid {}: {}", self.child.id(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{PatternKind, Prompt, PromptTag};
    use serial_test::serial;

    fn matcher(pattern: &str) -> PromptMatcher {
        PromptMatcher::new(&[Prompt {
            tag: PromptTag::Command,
            pattern: pattern.to_string(),
            kind: PatternKind::Glob,
        }])
        .unwrap()
    }

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    #[serial]
    fn test_output_without_carriage_returns() {
        let mut session =
            PtySession::spawn(&argv(&["sh", "-c", "printf 'one\\ntwo\\nREADY'"]), 4096).unwrap();
        let outcome = session
            .match_next(&matcher("READY"), Duration::from_secs(5))
            .unwrap();
        assert_eq!(outcome, Outcome::Matched(0));
        assert_eq!(session.before_match(), b"one\ntwo\n");

        // program has exited
        let outcome = session
            .match_next(&matcher("never"), Duration::from_secs(5))
            .unwrap();
        assert_eq!(outcome, Outcome::Eof);
        assert!(session.close().unwrap().is_some());
        assert_eq!(session.pid(), None);
    }

    #[test]
    #[serial]
    fn test_timeout_and_kill() {
        let mut session = PtySession::spawn(&argv(&["sleep", "30"]), 4096).unwrap();
        assert!(session.pid().is_some());
        let outcome = session
            .match_next(&matcher("x"), Duration::from_millis(100))
            .unwrap();
        assert_eq!(outcome, Outcome::Timeout);

        let status = session.close().unwrap().unwrap();
        assert!(!status.success());
    }

    #[test]
    #[serial]
    fn test_full_buffer() {
        let mut session =
            PtySession::spawn(&argv(&["sh", "-c", "printf '%0100d' 0; sleep 5"]), 16).unwrap();
        let outcome = session
            .match_next(&matcher("never"), Duration::from_secs(5))
            .unwrap();
        assert_eq!(outcome, Outcome::FullBuffer);
    }

    #[test]
    fn test_missing_program() {
        assert!(PtySession::spawn(&argv(&["/nonexistent/tad-cli-program"]), 16).is_err());
        assert!(PtySession::spawn(&[], 16).is_err());
    }
}
