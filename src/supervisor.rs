//! Expect supervisor: the thread that owns the spawned program.
//!
//! ```text
//! start:  spawn, wait for the command prompt, CR, handshake NUL
//! loop:   wait for a command on fw -> child
//!         wait for the command prompt, drop leftover output
//!         command + CR to the program
//!         wait for the command prompt
//!         output before the prompt + NUL on child -> fw, CR to the program
//! ```
//!
//! Prompt timeouts inside the loop are retried; at startup they end the
//! session. Any other failure ends the session: pipe ends are closed, the
//! program is killed and reaped, and the reason is returned from the thread.

use chrono::Local;
use std::convert::Infallible;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::csap::CsapId;
use crate::expect::driver::CR;
use crate::expect::{spawn_argv, Awaited, DriverError, ExpectDriver, Spawner};
use crate::spec::{CliSpec, ConnectionKind};
use crate::transport::SupervisorEnds;

/// Pid of the running program, shared with the framework side so it can
/// be killed. The supervisor clears it before reaping.
pub type PidSlot = Arc<Mutex<Option<libc::pid_t>>>;

/// Why a supervisor stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The framework closed its end of the command pipe
    FrameworkClosed,
    /// The program closed its terminal (exited or was killed)
    ProgramExited,
    /// Program output between prompts exceeded the match buffer
    BufferOverflow,
    /// Writing to or reading from the program failed
    ProgramIo(String),
    /// A synchronisation pipe failed
    PipeError(String),
    SpawnFailed(String),
    /// No command prompt within the read timeout at startup
    StartupTimeout,
}

impl SessionEnd {
    /// True when the session ended because the program went away.
    pub fn program_gone(&self) -> bool {
        matches!(self, SessionEnd::ProgramExited | SessionEnd::ProgramIo(_))
    }
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEnd::FrameworkClosed => write!(f, "framework closed the session"),
            SessionEnd::ProgramExited => write!(f, "program exited"),
            SessionEnd::BufferOverflow => write!(f, "program output overflowed the match buffer"),
            SessionEnd::ProgramIo(e) => write!(f, "program I/O failed: {}", e),
            SessionEnd::PipeError(e) => write!(f, "sync pipe failed: {}", e),
            SessionEnd::SpawnFailed(e) => write!(f, "cannot spawn program: {}", e),
            SessionEnd::StartupTimeout => write!(f, "no command prompt at startup"),
        }
    }
}

impl From<DriverError> for SessionEnd {
    fn from(e: DriverError) -> Self {
        match e {
            DriverError::Eof => SessionEnd::ProgramExited,
            DriverError::FullBuffer => SessionEnd::BufferOverflow,
            other => SessionEnd::ProgramIo(other.to_string()),
        }
    }
}

fn pipe_error(e: std::io::Error) -> SessionEnd {
    SessionEnd::PipeError(e.to_string())
}

/// SIGKILL the program and its process group if it is still running.
/// Returns whether a signal was sent.
pub fn kill_program(slot: &Mutex<Option<libc::pid_t>>) -> bool {
    let guard = match slot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    match *guard {
        Some(pid) => {
            tracing::debug!("Killing program pid {}", pid);
            // the program leads its own session: its pid is also its group id
            unsafe { libc::kill(-pid, libc::SIGKILL) == 0 || libc::kill(pid, libc::SIGKILL) == 0 }
        }
        None => false,
    }
}

// =============================================================================
// Debug transcript
// =============================================================================

/// Timestamped record of one session.
struct Transcript {
    out: BufWriter<File>,
    path: PathBuf,
}

impl Transcript {
    fn create(path: PathBuf) -> std::io::Result<Self> {
        let file = File::create(&path)?;
        Ok(Self {
            out: BufWriter::new(file),
            path,
        })
    }

    fn record(&mut self, marker: char, data: &[u8]) {
        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let line = format!("[{}] {} {:?}\n", stamp, marker, String::from_utf8_lossy(data));
        if let Err(e) = self.out.write_all(line.as_bytes()) {
            tracing::warn!("Failed to write transcript {}: {}", self.path.display(), e);
        }
    }

    fn finish(mut self, end: &SessionEnd) {
        self.record('*', end.to_string().as_bytes());
        if let Err(e) = self.out.flush() {
            tracing::warn!("Failed to flush transcript {}: {}", self.path.display(), e);
        }
    }
}

// =============================================================================
// Supervisor
// =============================================================================

pub struct SupervisorParams {
    pub csap_id: CsapId,
    pub spec: CliSpec,
    pub ends: SupervisorEnds,
    pub spawner: Spawner,
    pub match_max: usize,
    pub pid_slot: PidSlot,
    pub transcript: Option<PathBuf>,
}

/// Start the supervisor thread.
pub fn start(params: SupervisorParams) -> std::io::Result<JoinHandle<SessionEnd>> {
    std::thread::Builder::new()
        .name(format!("tad-cli-{}", params.csap_id))
        .spawn(move || run(params))
}

fn run(params: SupervisorParams) -> SessionEnd {
    let SupervisorParams {
        csap_id,
        spec,
        ends,
        spawner,
        match_max,
        pid_slot,
        transcript,
    } = params;

    let mut transcript = transcript.and_then(|path| match Transcript::create(path.clone()) {
        Ok(t) => Some(t),
        Err(e) => {
            tracing::warn!("Cannot open transcript {}: {}", path.display(), e);
            None
        }
    });

    let argv = spawn_argv(&spec);
    if let Some(t) = transcript.as_mut() {
        t.record('*', argv.join(" ").as_bytes());
    }

    let driver = spawner(argv.as_slice(), match_max)
        .map_err(|e| SessionEnd::SpawnFailed(format!("{}: {}", argv[0], e)))
        .and_then(|engine| {
            ExpectDriver::new(engine, &spec).map_err(|e| SessionEnd::SpawnFailed(e.to_string()))
        });
    let driver = match driver {
        Ok(driver) => driver,
        Err(end) => {
            tracing::error!("CSAP {}: {}", csap_id, end);
            drop(ends);
            if let Some(t) = transcript {
                t.finish(&end);
            }
            return end;
        }
    };

    if let Ok(mut slot) = pid_slot.lock() {
        *slot = driver.pid();
    }
    tracing::info!(
        "CSAP {}: started {} session, pid {:?}",
        csap_id,
        spec.kind,
        driver.pid()
    );

    let mut session = Session {
        csap_id,
        kind: spec.kind,
        driver,
        ends,
        transcript,
    };
    let end = match session.serve() {
        Ok(never) => match never {},
        Err(end) => end,
    };
    session.finalize(end, &pid_slot)
}

struct Session {
    csap_id: CsapId,
    kind: ConnectionKind,
    driver: ExpectDriver,
    ends: SupervisorEnds,
    transcript: Option<Transcript>,
}

impl Session {
    fn note(&mut self, marker: char, data: &[u8]) {
        if let Some(t) = self.transcript.as_mut() {
            t.record(marker, data);
        }
    }

    /// Wait for the command prompt, retrying timeouts.
    fn await_command_prompt(&mut self) -> Result<(), SessionEnd> {
        loop {
            match self.driver.await_command()? {
                Awaited::Prompt(_) => return Ok(()),
                Awaited::Timeout => {
                    tracing::trace!("CSAP {}: still waiting for command prompt", self.csap_id);
                }
            }
        }
    }

    fn startup(&mut self) -> Result<(), SessionEnd> {
        // a serial console prints nothing until it sees a line
        if self.kind == ConnectionKind::Serial {
            self.driver.send(CR)?;
        }

        match self.driver.await_command()? {
            Awaited::Prompt(_) => {}
            Awaited::Timeout => return Err(SessionEnd::StartupTimeout),
        }
        self.note('*', b"command prompt");

        self.driver.send(CR)?;
        self.ends.responses.ready().map_err(pipe_error)
    }

    fn serve(&mut self) -> Result<Infallible, SessionEnd> {
        self.startup()?;

        loop {
            if !self.ends.commands.wait_readable().map_err(pipe_error)? {
                return Err(SessionEnd::FrameworkClosed);
            }

            self.await_command_prompt()?;
            let dropped = self.driver.discard_pending();
            if dropped > 0 {
                tracing::trace!("CSAP {}: dropped {} bytes after prompt", self.csap_id, dropped);
            }

            let command = self
                .ends
                .commands
                .read_command()
                .map_err(pipe_error)?
                .ok_or(SessionEnd::FrameworkClosed)?;
            tracing::debug!(
                "CSAP {}: command {:?}",
                self.csap_id,
                String::from_utf8_lossy(&command)
            );
            self.note('>', &command);
            self.driver.send_command(&command)?;

            self.await_command_prompt()?;

            let sent = self
                .ends
                .responses
                .send_response(self.driver.before_match())
                .map_err(pipe_error)?;
            let response = self.driver.before_match()[..sent].to_vec();
            self.note('<', &response);

            self.driver.send(CR)?;
        }
    }

    fn finalize(self, end: SessionEnd, pid_slot: &Mutex<Option<libc::pid_t>>) -> SessionEnd {
        let Session {
            csap_id,
            mut driver,
            ends,
            transcript,
            ..
        } = self;

        drop(ends);

        // clear the slot first so nobody signals a reaped pid
        let mut slot = match pid_slot.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.take();
        match driver.close() {
            Ok(Some(status)) => tracing::debug!("CSAP {}: program {}", csap_id, status),
            Ok(None) => {}
            Err(e) => tracing::warn!("CSAP {}: failed to reap program: {}", csap_id, e),
        }
        drop(slot);

        match &end {
            SessionEnd::FrameworkClosed => tracing::info!("CSAP {}: session closed", csap_id),
            other => tracing::warn!("CSAP {}: session ended: {}", csap_id, other),
        }
        if let Some(t) = transcript {
            t.finish(&end);
        }
        end
    }
}
