//! Traffic codec for the CLI layer.
//!
//! Send: `{ message plain : "show version" }` becomes the command bytes.
//! Receive: the captured output is stored as `cli.message.plain` of the
//! parsed packet.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::ndn::{AsnValue, NdnError};

/// Where `match_bin` stores the response
pub const RESPONSE_PATH: &str = "cli.message.#plain";

/// Command bytes of a send template (`message.plain` or a bare `message`
/// string).
pub fn generate_bin(template: &AsnValue) -> Result<Bytes> {
    let len = match template.get_length("message") {
        Ok(0) => return Err(Error::invalid("message is empty")),
        Ok(len) => len,
        Err(NdnError::NotFound(_)) => return Err(Error::invalid("message is missing")),
        Err(e) => return Err(Error::invalid(format!("message: {}", e))),
    };

    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| Error::OutOfMemory(len))?;
    buf.resize(len, 0);

    let n = template
        .read_value("message", &mut buf)
        .map_err(|e| Error::invalid(format!("message: {}", e)))?;
    buf.truncate(n);
    Ok(Bytes::from(buf))
}

/// Store `payload` under `cli.message.plain` of `parsed`. The pattern
/// carries no constraints and is not consulted.
pub fn match_bin(_pattern: &AsnValue, payload: &[u8], parsed: &mut AsnValue) -> Result<()> {
    parsed
        .write_field(RESPONSE_PATH, AsnValue::octets(Bytes::copy_from_slice(payload)))
        .map_err(|e| Error::invalid(format!("cannot store response: {}", e)))
}

/// Receive pattern for a template: `{ cli { } }`, matching any response.
pub fn generate_pattern(_template: &AsnValue) -> AsnValue {
    AsnValue::Sequence(vec![("cli".to_string(), AsnValue::empty())])
}

fn is_newline(b: u8) -> bool {
    b == b'\r' || b == b'\n'
}

/// How much of a command's echo is at the start of some output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoScan {
    /// The whole echo is there and ends at this offset.
    Complete(usize),
    /// Everything so far belongs to the echo.
    Partial,
    Mismatch,
}

/// Look for the echo of `command` at the start of `data`, allowing CR/LF
/// anywhere inside it.
pub fn scan_echo(command: &[u8], data: &[u8]) -> EchoScan {
    if command.is_empty() {
        return EchoScan::Complete(0);
    }
    let mut pos = 0;
    for (i, &b) in data.iter().enumerate() {
        if b == command[pos] {
            pos += 1;
            if pos == command.len() {
                return EchoScan::Complete(i + 1);
            }
        } else if !is_newline(b) {
            return EchoScan::Mismatch;
        }
    }
    EchoScan::Partial
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EchoState {
    /// Inside the echoed command, at this offset
    Echo(usize),
    /// Past the echo, skipping its line ending
    LineEnd,
    Done,
}

/// Removes the echo of a command from the start of its response.
///
/// The echo may be interleaved with CR/LF (terminal line wrapping); the
/// CR/LF run after it is removed too. When the response does not start
/// with the full echo, nothing is removed.
#[derive(Debug)]
pub struct EchoStripper<'a> {
    command: &'a [u8],
    state: EchoState,
    held: Vec<u8>,
}

impl<'a> EchoStripper<'a> {
    pub fn new(command: &'a [u8]) -> Self {
        let state = if command.is_empty() {
            EchoState::LineEnd
        } else {
            EchoState::Echo(0)
        };
        Self {
            command,
            state,
            held: Vec::new(),
        }
    }

    /// Process the next chunk of the response; `out` receives the bytes to
    /// keep.
    pub fn feed(&mut self, chunk: &[u8], out: &mut impl FnMut(&[u8])) {
        let mut i = 0;
        while i < chunk.len() {
            let b = chunk[i];
            match self.state {
                EchoState::Echo(pos) => {
                    if b == self.command[pos] {
                        self.held.push(b);
                        self.state = if pos + 1 == self.command.len() {
                            self.held.clear();
                            EchoState::LineEnd
                        } else {
                            EchoState::Echo(pos + 1)
                        };
                    } else if is_newline(b) {
                        self.held.push(b);
                    } else {
                        // not an echo after all
                        out(&self.held);
                        self.held.clear();
                        self.state = EchoState::Done;
                        continue;
                    }
                }
                EchoState::LineEnd => {
                    if !is_newline(b) {
                        self.state = EchoState::Done;
                        continue;
                    }
                }
                EchoState::Done => {
                    out(&chunk[i..]);
                    return;
                }
            }
            i += 1;
        }
    }

    /// End of response: release anything held back.
    pub fn finish(&mut self, out: &mut impl FnMut(&[u8])) {
        if !self.held.is_empty() {
            out(&self.held);
            self.held.clear();
        }
        self.state = EchoState::Done;
    }
}

/// Strip the echo of `command` from a complete response.
pub fn strip_echo(command: &[u8], response: &[u8]) -> Vec<u8> {
    let mut kept = Vec::with_capacity(response.len());
    let mut stripper = EchoStripper::new(command);
    let mut sink = |chunk: &[u8]| kept.extend_from_slice(chunk);
    stripper.feed(response, &mut sink);
    stripper.finish(&mut sink);
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::ndn::parse;
    use proptest::prelude::*;

    #[test]
    fn test_generate_bin_plain_and_bare() {
        let t = parse(r#"{ message plain : "echo hello" }"#).unwrap();
        assert_eq!(generate_bin(&t).unwrap().as_ref(), b"echo hello");

        let t = parse(r#"{ message "uname -a" }"#).unwrap();
        assert_eq!(generate_bin(&t).unwrap().as_ref(), b"uname -a");
    }

    #[test]
    fn test_generate_bin_rejects_missing_and_empty() {
        for text in [r#"{ }"#, r#"{ message plain : "" }"#, r#"{ message 5 }"#] {
            let err = generate_bin(&parse(text).unwrap()).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{}", text);
        }
    }

    #[test]
    fn test_codec_round_trip() {
        let template = parse(r#"{ message plain : "show run" }"#).unwrap();
        let bin = generate_bin(&template).unwrap();
        let pattern = generate_pattern(&template);
        let mut parsed = AsnValue::empty();
        match_bin(&pattern, &bin, &mut parsed).unwrap();
        assert_eq!(
            parsed.read_octets("cli.message.plain").unwrap(),
            template.read_octets("message").unwrap()
        );
        assert_eq!(pattern.to_string(), "{ cli { } }");
    }

    #[test]
    fn test_strip_echo() {
        assert_eq!(strip_echo(b"echo hello", b"echo hello\nhello\n"), b"hello\n");
        assert_eq!(strip_echo(b"echo hello", b"echo hello\r\n\r\nhello\n"), b"hello\n");
        // wrapped echo
        assert_eq!(strip_echo(b"echo hello", b"echo he\r\nllo\nhello\n"), b"hello\n");
        assert_eq!(strip_echo(b"true", b"true\n"), b"");
        // no echo: output untouched
        assert_eq!(strip_echo(b"ls", b"lib\nsrc\n"), b"lib\nsrc\n");
        // truncated echo
        assert_eq!(strip_echo(b"echo hello", b"echo"), b"echo");
        assert_eq!(strip_echo(b"", b"\r\n$ x"), b"$ x");
    }

    #[test]
    fn test_scan_echo() {
        assert_eq!(scan_echo(b"echo hi", b"echo hi\nhi\n"), EchoScan::Complete(7));
        assert_eq!(scan_echo(b"echo hi", b"ec\r\nho hi"), EchoScan::Complete(9));
        assert_eq!(scan_echo(b"echo hi", b"echo"), EchoScan::Partial);
        assert_eq!(scan_echo(b"echo hi", b""), EchoScan::Partial);
        assert_eq!(scan_echo(b"echo hi", b"hi\n$ "), EchoScan::Mismatch);
        assert_eq!(scan_echo(b"", b"$ "), EchoScan::Complete(0));
    }

    #[test]
    fn test_stripper_across_chunks() {
        let mut kept = Vec::new();
        let mut stripper = EchoStripper::new(b"echo abc");
        let mut sink = |c: &[u8]| kept.extend_from_slice(c);
        for chunk in [&b"ec"[..], b"ho a", b"bc", b"\n", b"abc\n"] {
            stripper.feed(chunk, &mut sink);
        }
        stripper.finish(&mut sink);
        assert_eq!(kept, b"abc\n");
    }

    proptest! {
        #[test]
        fn test_echo_then_output_is_stripped(
            command in "[a-z][a-z ]{0,20}",
            output in "[a-z0-9 ][a-z0-9 \n]{0,40}",
        ) {
            let response = format!("{}\n{}", command, output);
            prop_assert_eq!(strip_echo(command.as_bytes(), response.as_bytes()), output.as_bytes());
        }

        #[test]
        fn test_strip_never_grows(command in ".{0,10}", response in ".{0,30}") {
            let kept = strip_echo(command.as_bytes(), response.as_bytes());
            prop_assert!(kept.len() <= response.len());
            prop_assert!(response.as_bytes().ends_with(&kept));
        }
    }
}
