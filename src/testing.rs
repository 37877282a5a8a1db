//! Scripted expect engine for unit tests.

use std::collections::VecDeque;
use std::io;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::expect::{ExpectBuffer, ExpectEngine, Outcome, PromptMatcher, Spawner};

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

/// A fake program. Input is split into lines at CR; every complete line is
/// handed to the responder and whatever it returns becomes program output.
pub struct ScriptedEngine {
    buffer: ExpectBuffer,
    line: Vec<u8>,
    responder: Responder,
    input: Arc<Mutex<Vec<u8>>>,
    exited: Arc<AtomicBool>,
    exit_when_idle: bool,
    steps: VecDeque<(Vec<u8>, Vec<u8>)>,
}

impl ScriptedEngine {
    pub fn new(initial: &[u8]) -> Self {
        let mut buffer = ExpectBuffer::new(64 * 1024);
        buffer.push(initial);
        Self {
            buffer,
            line: Vec::new(),
            responder: Box::new(|_| Vec::new()),
            input: Arc::new(Mutex::new(Vec::new())),
            exited: Arc::new(AtomicBool::new(false)),
            exit_when_idle: false,
            steps: VecDeque::new(),
        }
    }

    /// A shell-like program: echoes each line, runs it through `run` and
    /// prints `prompt` afterwards.
    pub fn shell(prompt: &'static str, mut run: impl FnMut(&str) -> String + Send + 'static) -> Self {
        let mut engine = Self::new(prompt.as_bytes());
        engine.responder = Box::new(move |line| {
            let line = String::from_utf8_lossy(line).into_owned();
            let mut out = format!("{}\n", line);
            out.push_str(&run(&line));
            out.push_str(prompt);
            out.into_bytes()
        });
        engine
    }

    /// Output `output` when the next expected line `line` arrives.
    pub fn reply(mut self, line: &[u8], output: &[u8]) -> Self {
        self.steps.push_back((line.to_vec(), output.to_vec()));
        self
    }

    /// Report EOF instead of a timeout once output is exhausted.
    pub fn exit_when_idle(mut self) -> Self {
        self.exit_when_idle = true;
        self
    }

    pub fn with_match_max(mut self, match_max: usize) -> Self {
        let pending = self.buffer.pending().to_vec();
        self.buffer = ExpectBuffer::new(match_max);
        self.buffer.push(&pending);
        self
    }

    pub fn spawner(self) -> Spawner {
        Box::new(
            move |_: &[String], _: usize| -> io::Result<Box<dyn ExpectEngine>> {
                Ok(Box::new(self))
            },
        )
    }

    pub fn input_log(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.input)
    }

    /// Setting the flag makes the program look dead from then on.
    pub fn exit_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.exited)
    }

    fn on_line(&mut self, line: Vec<u8>) {
        let output = match self.steps.front() {
            Some((expected, _)) if *expected == line => {
                self.steps.pop_front().map(|(_, out)| out).unwrap_or_default()
            }
            Some(_) => Vec::new(),
            None => (self.responder)(&line),
        };
        self.buffer.push(&output);
    }
}

impl ExpectEngine for ScriptedEngine {
    fn match_next(&mut self, matcher: &PromptMatcher, timeout: Duration) -> io::Result<Outcome> {
        if self.exited.load(Ordering::SeqCst) {
            return Ok(Outcome::Eof);
        }
        if let Some(index) = self.buffer.try_match(matcher) {
            return Ok(Outcome::Matched(index));
        }
        if self.buffer.is_full() {
            return Ok(Outcome::FullBuffer);
        }
        if self.exit_when_idle {
            return Ok(Outcome::Eof);
        }
        std::thread::sleep(timeout.min(Duration::from_millis(5)));
        self.buffer.abandon_echo();
        Ok(Outcome::Timeout)
    }

    fn before_match(&self) -> &[u8] {
        self.buffer.before_match()
    }

    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        if self.exited.load(Ordering::SeqCst) {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        self.input.lock().unwrap().extend_from_slice(data);
        for &b in data {
            if b == b'\r' {
                let line = std::mem::take(&mut self.line);
                self.on_line(line);
            } else {
                self.line.push(b);
            }
        }
        Ok(())
    }

    fn expect_echo(&mut self, command: &[u8]) {
        self.buffer.expect_echo(command);
    }

    fn discard_pending(&mut self) -> usize {
        self.buffer.discard()
    }

    fn pid(&self) -> Option<libc::pid_t> {
        None
    }

    fn close(&mut self) -> io::Result<Option<ExitStatus>> {
        self.exited.store(true, Ordering::SeqCst);
        Ok(None)
    }
}
