//! NUL-framed synchronisation pipes between the framework and the expect
//! supervisor.
//!
//! Two one-way pipes:
//!
//! ```text
//! fw -> child : command bytes | 0x00
//! child -> fw : program output | 0x00
//! ```
//!
//! Exactly one NUL terminates each frame in each direction. The supervisor
//! also sends a lone NUL once the program is up (the handshake).

use bytes::{BufMut, BytesMut};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::os::fd::{FromRawFd, OwnedFd};

use crate::error::{Error, Result};

/// Frame sentinel
pub const NUL: u8 = 0;

fn pipe() -> io::Result<(File, File)> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    let rd = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let wr = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    Ok((File::from(rd), File::from(wr)))
}

/// Create both pipes (close-on-exec). Returns the framework ends and the
/// supervisor ends.
pub fn sync_pipes() -> Result<(FrameworkEnds, SupervisorEnds)> {
    let (cmd_rd, cmd_wr) = pipe().map_err(|e| Error::io("creating command pipe", e))?;
    let (rsp_rd, rsp_wr) = pipe().map_err(|e| Error::io("creating response pipe", e))?;

    Ok((
        FrameworkEnds {
            writer: FrameWriter { inner: cmd_wr },
            reader: FrameReader {
                inner: BufReader::new(rsp_rd),
            },
        },
        SupervisorEnds {
            commands: CommandReader {
                inner: BufReader::new(cmd_rd),
            },
            responses: ResponseWriter { inner: rsp_wr },
        },
    ))
}

pub struct FrameworkEnds {
    pub writer: FrameWriter,
    pub reader: FrameReader,
}

pub struct SupervisorEnds {
    pub commands: CommandReader,
    pub responses: ResponseWriter,
}

// =============================================================================
// Framework side
// =============================================================================

/// Write end of `fw -> child`
pub struct FrameWriter {
    inner: File,
}

impl FrameWriter {
    /// Write `data` followed by one NUL.
    pub fn send_frame(&mut self, data: &[u8]) -> Result<()> {
        if let Some(pos) = data.iter().position(|&b| b == NUL) {
            return Err(Error::invalid(format!(
                "command contains NUL at offset {}",
                pos
            )));
        }

        let mut frame = BytesMut::with_capacity(data.len() + 1);
        frame.put_slice(data);
        frame.put_u8(NUL);

        self.inner
            .write_all(&frame)
            .map_err(|e| Error::io("writing command frame", e))
    }
}

/// Bytes of one response frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRead {
    /// Copied into the caller's buffer
    pub copied: usize,
    /// In the frame, excluding the NUL
    pub total: usize,
}

/// Read end of `child -> fw`
pub struct FrameReader {
    inner: BufReader<File>,
}

impl FrameReader {
    /// Feed every chunk of the next frame to `f`, consuming the frame and
    /// its NUL. Returns the frame length.
    pub fn read_frame_with(&mut self, mut f: impl FnMut(&[u8])) -> Result<usize> {
        let mut total = 0;
        loop {
            let available = self
                .inner
                .fill_buf()
                .map_err(|e| Error::io("reading response frame", e))?;
            if available.is_empty() {
                return Err(Error::io(
                    "reading response frame",
                    io::Error::new(io::ErrorKind::UnexpectedEof, "pipe closed before NUL"),
                ));
            }

            match available.iter().position(|&b| b == NUL) {
                Some(pos) => {
                    f(&available[..pos]);
                    total += pos;
                    self.inner.consume(pos + 1);
                    return Ok(total);
                }
                None => {
                    let n = available.len();
                    f(available);
                    total += n;
                    self.inner.consume(n);
                }
            }
        }
    }

    /// Copy up to `buf.len()` bytes of the next frame, discarding the rest
    /// up to the NUL.
    pub fn read_frame_into(&mut self, buf: &mut [u8]) -> Result<FrameRead> {
        let mut copied = 0;
        let total = self.read_frame_with(|chunk| {
            let n = chunk.len().min(buf.len() - copied);
            buf[copied..copied + n].copy_from_slice(&chunk[..n]);
            copied += n;
        })?;
        Ok(FrameRead { copied, total })
    }

    /// Discard the next frame.
    pub fn drain_frame(&mut self) -> Result<usize> {
        self.read_frame_with(|_| {})
    }

    /// Block until the supervisor reports the program is up.
    pub fn wait_handshake(&mut self) -> Result<()> {
        let stray = self.drain_frame()?;
        if stray != 0 {
            return Err(Error::FatalProtocol(format!(
                "{} unexpected bytes before handshake",
                stray
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Supervisor side
// =============================================================================

/// Read end of `fw -> child`
pub struct CommandReader {
    inner: BufReader<File>,
}

impl CommandReader {
    /// Block until a command starts arriving. `false` means the framework
    /// closed its end.
    pub fn wait_readable(&mut self) -> io::Result<bool> {
        Ok(!self.inner.fill_buf()?.is_empty())
    }

    /// The next command, without its NUL. `None` at a clean end of stream.
    pub fn read_command(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut command = Vec::new();
        if self.inner.read_until(NUL, &mut command)? == 0 {
            return Ok(None);
        }
        if command.pop() != Some(NUL) {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "command frame truncated",
            ));
        }
        Ok(Some(command))
    }
}

/// Write end of `child -> fw`
pub struct ResponseWriter {
    inner: File,
}

impl ResponseWriter {
    /// Send program output as one frame. Output is cut at its first NUL,
    /// which would otherwise end the frame early.
    pub fn send_response(&mut self, output: &[u8]) -> io::Result<usize> {
        let end = output.iter().position(|&b| b == NUL).unwrap_or(output.len());
        if end < output.len() {
            tracing::debug!(
                "Response truncated at NUL: {} of {} bytes sent",
                end,
                output.len()
            );
        }

        let mut frame = BytesMut::with_capacity(end + 1);
        frame.put_slice(&output[..end]);
        frame.put_u8(NUL);
        self.inner.write_all(&frame)?;
        Ok(end)
    }

    /// Handshake: the program is up and waiting at its command prompt.
    pub fn ready(&mut self) -> io::Result<()> {
        self.inner.write_all(&[NUL])
    }
}
