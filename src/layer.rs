//! CLI layer callbacks: the framework side of a CLI CSAP.
//!
//! Each call sends one command frame to the supervisor and consumes exactly
//! one response frame. A pipe failure tears the session down for good.

use bytes::Bytes;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::codec::{self, EchoStripper};
use crate::config::Config;
use crate::csap::{AbortHandle, CsapId, ProtocolSupport, RwLayer};
use crate::error::{Error, Result};
use crate::expect::{pty_spawner, Spawner};
use crate::ndn::AsnValue;
use crate::spec::CliSpec;
use crate::supervisor::{self, kill_program, PidSlot, SessionEnd, SupervisorParams};
use crate::transport::{sync_pipes, FrameworkEnds};

/// Traffic counters of one CSAP
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LayerStats {
    pub commands: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Live session: framework pipe ends and the supervisor owning the program.
struct LayerState {
    spec: CliSpec,
    ends: FrameworkEnds,
    supervisor: Option<JoinHandle<SessionEnd>>,
    pid_slot: PidSlot,
}

impl LayerState {
    /// Kill the program, close our pipe ends and wait for the supervisor.
    fn teardown(self, csap_id: CsapId) -> Option<SessionEnd> {
        let LayerState {
            ends,
            supervisor,
            pid_slot,
            ..
        } = self;

        kill_program(&pid_slot);
        drop(ends);
        let handle = supervisor?;
        match handle.join() {
            Ok(end) => Some(end),
            Err(_) => {
                tracing::error!("CSAP {}: supervisor thread panicked", csap_id);
                None
            }
        }
    }
}

/// The CLI layer of one CSAP: a running program behind its supervisor.
///
/// Once the program is gone every call fails with `NotRunning`.
pub struct CliLayer {
    csap_id: CsapId,
    state: Option<LayerState>,
    strip_echo: bool,
    stats: LayerStats,
    dead: bool,
}

impl fmt::Debug for CliLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CliLayer")
            .field("csap_id", &self.csap_id)
            .field("running", &self.state.is_some())
            .field("dead", &self.dead)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl CliLayer {
    /// Parse the CLI layer `layer_index` of `value` and start a session on
    /// a pseudo-terminal.
    pub fn init(csap_id: CsapId, value: &AsnValue, layer_index: usize, config: &Config) -> Result<Self> {
        let spec = CliSpec::from_layer(value, layer_index, config)?;
        Self::init_with_engine(csap_id, spec, config, pty_spawner())
    }

    /// Start a session with a custom program spawner. Blocks until the
    /// program shows its command prompt.
    pub fn init_with_engine(
        csap_id: CsapId,
        spec: CliSpec,
        config: &Config,
        spawner: Spawner,
    ) -> Result<Self> {
        let (mut ends, supervisor_ends) = sync_pipes()?;
        let pid_slot: PidSlot = Arc::new(Mutex::new(None));

        let transcript = config.cli.debug_log.then(|| {
            config
                .cli
                .debug_dir()
                .join(format!("tad-cli-{}-{}.log", std::process::id(), csap_id))
        });
        if let Some(path) = &transcript {
            tracing::debug!("CSAP {}: transcript at {}", csap_id, path.display());
        }

        let handle = supervisor::start(SupervisorParams {
            csap_id,
            spec: spec.clone(),
            ends: supervisor_ends,
            spawner,
            match_max: config.cli.match_max,
            pid_slot: Arc::clone(&pid_slot),
            transcript,
        })
        .map_err(|e| Error::io("starting supervisor thread", e))?;

        if let Err(e) = ends.reader.wait_handshake() {
            let state = LayerState {
                spec,
                ends,
                supervisor: Some(handle),
                pid_slot,
            };
            return Err(match state.teardown(csap_id) {
                Some(SessionEnd::SpawnFailed(reason)) => Error::InvalidArgument(reason),
                Some(end) => Error::LowerLayer(end.to_string()),
                None => Error::LowerLayer(e.to_string()),
            });
        }

        tracing::info!("CSAP {}: CLI session ready", csap_id);
        Ok(Self {
            csap_id,
            state: Some(LayerState {
                spec,
                ends,
                supervisor: Some(handle),
                pid_slot,
            }),
            strip_echo: config.cli.strip_echo,
            stats: LayerStats::default(),
            dead: false,
        })
    }

    pub fn csap_id(&self) -> CsapId {
        self.csap_id
    }

    pub fn spec(&self) -> Option<&CliSpec> {
        self.state.as_ref().map(|s| &s.spec)
    }

    pub fn stats(&self) -> LayerStats {
        self.stats
    }

    /// Whether the supervisor is still serving commands.
    pub fn is_running(&self) -> bool {
        match &self.state {
            Some(state) if !self.dead => state
                .supervisor
                .as_ref()
                .map_or(false, |handle| !handle.is_finished()),
            _ => false,
        }
    }

    pub fn program_pid(&self) -> Option<libc::pid_t> {
        let state = self.state.as_ref()?;
        let slot = match state.pid_slot.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot
    }

    /// Kills the program from another thread, failing the call in flight.
    pub fn abort_handle(&self) -> Option<AbortHandle> {
        let slot = Arc::clone(&self.state.as_ref()?.pid_slot);
        Some(AbortHandle::new(move || kill_program(&slot)))
    }

    /// Tear the session down after a pipe failure and classify it.
    fn fail(&mut self, cause: Error) -> Error {
        self.dead = true;
        let Some(state) = self.state.take() else {
            return Error::NotRunning;
        };
        match state.teardown(self.csap_id) {
            Some(end) if end.program_gone() => {
                tracing::warn!("CSAP {}: {} ({})", self.csap_id, end, cause);
                Error::NotRunning
            }
            Some(end) => {
                tracing::error!("CSAP {}: {} ({})", self.csap_id, end, cause);
                Error::FatalProtocol(end.to_string())
            }
            None => Error::FatalProtocol(cause.to_string()),
        }
    }

    /// Send one command and hand every chunk of its response to `on_chunk`.
    fn transact(&mut self, command: &[u8], on_chunk: impl FnMut(&[u8])) -> Result<usize> {
        if !self.is_running() {
            if !self.dead && self.state.is_some() {
                // supervisor gone since the last call
                return Err(self.fail(Error::NotRunning));
            }
            return Err(Error::NotRunning);
        }
        let Some(state) = self.state.as_mut() else {
            return Err(Error::NotRunning);
        };

        if let Err(e) = state.ends.writer.send_frame(command) {
            if matches!(e, Error::InvalidArgument(_)) {
                return Err(e);
            }
            return Err(self.fail(e));
        }
        let total = match state.ends.reader.read_frame_with(on_chunk) {
            Ok(total) => total,
            Err(e) => return Err(self.fail(e)),
        };

        self.stats.commands += 1;
        self.stats.bytes_sent += command.len() as u64;
        self.stats.bytes_received += total as u64;
        tracing::debug!(
            "CSAP {}: {} byte command, {} byte response",
            self.csap_id,
            command.len(),
            total
        );
        Ok(total)
    }

    /// Run a command, discarding its output. Returns `buf.len()`.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.transact(buf, |_| {})?;
        Ok(buf.len())
    }

    /// Run a command and copy its output into `rbuf`. The output is
    /// truncated to fit and NUL-terminated when space remains.
    pub fn write_read(&mut self, _timeout: Duration, wbuf: &[u8], rbuf: &mut [u8]) -> Result<usize> {
        let mut copied = 0;
        let mut sink = |chunk: &[u8]| {
            let n = chunk.len().min(rbuf.len() - copied);
            rbuf[copied..copied + n].copy_from_slice(&chunk[..n]);
            copied += n;
        };

        if self.strip_echo {
            let mut stripper = EchoStripper::new(wbuf);
            let mut deliver = |chunk: &[u8]| stripper.feed(chunk, &mut sink);
            self.transact(wbuf, &mut deliver)?;
            stripper.finish(&mut sink);
        } else {
            self.transact(wbuf, &mut sink)?;
        }

        if copied < rbuf.len() {
            rbuf[copied] = 0;
        }
        Ok(copied)
    }

    /// Kill the program, close the pipes and join the supervisor. Safe to
    /// call more than once.
    pub fn destroy(&mut self) -> Result<()> {
        self.dead = true;
        let Some(state) = self.state.take() else {
            tracing::debug!("CSAP {}: CLI layer already destroyed", self.csap_id);
            return Ok(());
        };
        match state.teardown(self.csap_id) {
            Some(end) => tracing::info!("CSAP {}: destroyed ({})", self.csap_id, end),
            None => tracing::info!("CSAP {}: destroyed", self.csap_id),
        }
        Ok(())
    }
}

impl Drop for CliLayer {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            tracing::warn!("CSAP {}: destroy on drop failed: {}", self.csap_id, e);
        }
    }
}

impl RwLayer for CliLayer {
    fn read(&mut self, _timeout: Duration, _buf: &mut [u8]) -> Result<usize> {
        Err(Error::NotSupported("read on a CLI CSAP"))
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        CliLayer::write(self, buf)
    }

    fn write_read(&mut self, timeout: Duration, wbuf: &[u8], rbuf: &mut [u8]) -> Result<usize> {
        CliLayer::write_read(self, timeout, wbuf, rbuf)
    }

    fn destroy(&mut self) -> Result<()> {
        CliLayer::destroy(self)
    }

    fn abort_handle(&self) -> Option<AbortHandle> {
        CliLayer::abort_handle(self)
    }
}

/// Protocol support for the `cli` layer label.
#[derive(Debug, Default, Clone, Copy)]
pub struct CliProtocol;

impl ProtocolSupport for CliProtocol {
    fn name(&self) -> &'static str {
        "cli"
    }

    fn init(
        &self,
        csap_id: CsapId,
        spec: &AsnValue,
        layer_index: usize,
        config: &Config,
    ) -> Result<Box<dyn RwLayer>> {
        Ok(Box::new(CliLayer::init(csap_id, spec, layer_index, config)?))
    }

    fn generate_bin(&self, template: &AsnValue) -> Result<Bytes> {
        codec::generate_bin(template)
    }

    fn match_bin(&self, pattern: &AsnValue, payload: &[u8], parsed: &mut AsnValue) -> Result<()> {
        codec::match_bin(pattern, payload, parsed)
    }

    fn generate_pattern(&self, template: &AsnValue) -> Result<AsnValue> {
        Ok(codec::generate_pattern(template))
    }
}
