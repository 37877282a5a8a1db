//! Prompt handling: answers login and password prompts on its own and
//! hands command prompts back to the caller.

use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use super::pattern::PromptMatcher;
use super::{ExpectEngine, Outcome};
use crate::error::Result;
use crate::spec::{CliSpec, ConnectionKind, Endpoint, PromptTag};

/// Terminates every line written to the program
pub const CR: &[u8] = b"\r";

/// Command line used to start the program of a session.
pub fn spawn_argv(spec: &CliSpec) -> Vec<String> {
    let mut argv = vec![spec.program.clone()];
    match &spec.endpoint {
        Endpoint::Serial { device } => argv.push(device.clone()),
        Endpoint::Remote { host, port } => {
            argv.push(host.clone());
            match spec.kind {
                ConnectionKind::Ssh => argv.push(format!("-p{}", port)),
                _ => argv.push(port.to_string()),
            }
            if let Some(user) = &spec.user {
                argv.push(format!("-l{}", user));
            }
        }
        Endpoint::Shell { args } => {
            if let Some(args) = args {
                argv.push("-c".to_string());
                argv.push(args.clone());
            }
        }
    }
    argv
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Awaited {
    Prompt(PromptTag),
    Timeout,
}

#[derive(thiserror::Error, Debug)]
pub enum DriverError {
    #[error("program closed its terminal")]
    Eof,

    #[error("program output exceeded the match buffer without a prompt")]
    FullBuffer,

    #[error("short write to program")]
    ShortWrite,

    #[error("program I/O failed: {0}")]
    Io(#[source] io::Error),
}

impl From<io::Error> for DriverError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WriteZero => DriverError::ShortWrite,
            _ => DriverError::Io(e),
        }
    }
}

/// Drives one program through its prompts.
pub struct ExpectDriver {
    engine: Box<dyn ExpectEngine>,
    matcher: PromptMatcher,
    user: Option<String>,
    password: Option<String>,
    timeout: Duration,
}

impl ExpectDriver {
    pub fn new(engine: Box<dyn ExpectEngine>, spec: &CliSpec) -> Result<Self> {
        Ok(Self {
            engine,
            matcher: PromptMatcher::new(&spec.prompts)?,
            user: spec.user.clone(),
            password: spec.password.clone(),
            timeout: spec.read_timeout,
        })
    }

    /// One expect cycle. Login and password prompts are answered with the
    /// credential and CR every time they appear.
    pub fn await_prompt(&mut self) -> std::result::Result<Awaited, DriverError> {
        let index = match self.engine.match_next(&self.matcher, self.timeout)? {
            Outcome::Matched(index) => index,
            Outcome::Timeout => return Ok(Awaited::Timeout),
            Outcome::Eof => return Err(DriverError::Eof),
            Outcome::FullBuffer => return Err(DriverError::FullBuffer),
        };

        let tag = self.matcher.tag(index).unwrap_or(PromptTag::Command);
        let credential = match tag {
            PromptTag::Command => None,
            PromptTag::Login => self.user.clone(),
            PromptTag::Password => self.password.clone(),
        };
        if let Some(credential) = credential {
            tracing::debug!("Answering {:?} prompt", tag);
            self.send_line(credential.as_bytes())?;
        }
        Ok(Awaited::Prompt(tag))
    }

    /// Cycle until the command prompt or a timeout.
    pub fn await_command(&mut self) -> std::result::Result<Awaited, DriverError> {
        loop {
            match self.await_prompt()? {
                Awaited::Prompt(PromptTag::Command) => return Ok(Awaited::Prompt(PromptTag::Command)),
                Awaited::Prompt(_) => continue,
                Awaited::Timeout => return Ok(Awaited::Timeout),
            }
        }
    }

    pub fn send(&mut self, data: &[u8]) -> std::result::Result<(), DriverError> {
        self.engine.send(data).map_err(DriverError::from)
    }

    pub fn send_line(&mut self, line: &[u8]) -> std::result::Result<(), DriverError> {
        self.send(line)?;
        self.send(CR)
    }

    /// Send a command line. The next prompt is searched for only after the
    /// program's echo of it.
    pub fn send_command(&mut self, command: &[u8]) -> std::result::Result<(), DriverError> {
        self.engine.expect_echo(command);
        self.send_line(command)
    }

    pub fn before_match(&self) -> &[u8] {
        self.engine.before_match()
    }

    pub fn discard_pending(&mut self) -> usize {
        self.engine.discard_pending()
    }

    pub fn pid(&self) -> Option<libc::pid_t> {
        self.engine.pid()
    }

    pub fn close(&mut self) -> io::Result<Option<ExitStatus>> {
        self.engine.close()
    }
}
