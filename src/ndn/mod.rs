//! Abstract (ASN.1-style) values used to describe CSAPs and traffic.
//!
//! Values are trees of integers, octet strings, sequences, sequence-ofs and
//! choices, addressed by dotted paths such as `conn-params.telnet.host.plain`.

pub mod text;
pub mod value;

pub use text::parse;
pub use value::{AsnValue, NdnError};
