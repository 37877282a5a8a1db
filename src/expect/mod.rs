//! Expect-style interaction with a spawned interactive program.
//!
//! - [`pattern`]: prompt patterns and the output buffer they match against
//! - [`pty`]: the real engine, a program running on a pseudo-terminal
//! - [`driver`]: prompt handling on top of any [`ExpectEngine`]

pub mod driver;
pub mod pattern;
pub mod pty;

use std::io;
use std::process::ExitStatus;
use std::time::Duration;

pub use driver::{spawn_argv, Awaited, DriverError, ExpectDriver};
pub use pattern::{glob_to_regex, ExpectBuffer, PromptMatcher};
pub use pty::PtySession;

/// Result of one expect cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Index into the prompt table
    Matched(usize),
    Eof,
    Timeout,
    /// Unmatched output reached the buffer limit
    FullBuffer,
}

/// An interactive program and the output it has produced so far.
pub trait ExpectEngine: Send {
    /// Read program output until a prompt matches, the program goes away,
    /// the buffer fills up or `timeout` passes.
    fn match_next(&mut self, matcher: &PromptMatcher, timeout: Duration) -> io::Result<Outcome>;

    /// Output preceding the most recent match
    fn before_match(&self) -> &[u8];

    /// Write all of `data` to the program.
    fn send(&mut self, data: &[u8]) -> io::Result<()>;

    /// Skip the terminal echo of `command` when matching the next prompt.
    /// A timeout gives up on an echo that has not fully arrived.
    fn expect_echo(&mut self, command: &[u8]);

    /// Drop output read but not yet matched; returns the number of bytes.
    fn discard_pending(&mut self) -> usize;

    fn pid(&self) -> Option<libc::pid_t>;

    /// Kill the program if it is still running and reap it.
    fn close(&mut self) -> io::Result<Option<ExitStatus>>;
}

/// Starts a program for a session: `argv` and the match buffer limit.
pub type Spawner =
    Box<dyn FnOnce(&[String], usize) -> io::Result<Box<dyn ExpectEngine>> + Send + 'static>;

/// Spawner for [`PtySession`].
pub fn pty_spawner() -> Spawner {
    Box::new(
        |argv: &[String], match_max: usize| -> io::Result<Box<dyn ExpectEngine>> {
            Ok(Box::new(PtySession::spawn(argv, match_max)?))
        },
    )
}
