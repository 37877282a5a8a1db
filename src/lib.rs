//! CLI CSAP: interactive command-line sessions driven through expect-style
//! prompt matching.
//!
//! A CSAP wraps one program (serial console client, telnet, ssh or a local
//! shell) running on a pseudo-terminal. Commands go in one at a time; each
//! returns the program output up to the next command prompt.
//!
//! ```text
//!  framework thread                     supervisor thread
//!  ----------------                     -----------------
//!  CliLayer::write_read ── cmd\0 ──▶    ExpectDriver ── cmd\r ──▶ program (pty)
//!                       ◀── out\0 ──                 ◀── output ──
//! ```
//!
//! # Modules
//!
//! - [`ndn`]: abstract value tree and its text notation
//! - [`spec`]: CLI layer specification parsing
//! - [`expect`]: pty engine, prompt matching and the expect driver
//! - [`transport`]: NUL-framed sync pipes
//! - [`supervisor`]: the thread owning the program
//! - [`layer`]: framework-side callbacks
//! - [`codec`]: traffic templates to command bytes and back
//! - [`csap`]: CSAP registry
//! - [`tapi`]: helpers for tests driving CLI CSAPs

pub mod codec;
pub mod config;
pub mod csap;
pub mod error;
pub mod expect;
pub mod layer;
pub mod ndn;
pub mod spec;
pub mod supervisor;
pub mod tapi;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use csap::{CsapId, CsapRegistry};
pub use error::{Error, ErrorKind, Result};
pub use layer::{CliLayer, CliProtocol};
pub use ndn::AsnValue;
pub use spec::{CliSpec, ConnectionKind};
