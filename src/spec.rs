//! CLI CSAP specification parsing.
//!
//! Turns the `cli` layer of an abstract CSAP specification into a typed
//! [`CliSpec`]:
//!
//! ```text
//! { layers { cli : { conn-type 1,
//!                    conn-params telnet : { host plain : "dut", port plain : 23 },
//!                    user plain : "admin",
//!                    login-prompt plain : "ogin: ",
//!                    command-prompt script : "[>#] $" } } }
//! ```

use std::fmt;
use std::time::Duration;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::expect::pattern::CompiledPrompt;
use crate::ndn::{AsnValue, NdnError};

/// Fields accepted directly under the `cli` layer
const LAYER_FIELDS: &[&str] = &[
    "conn-type",
    "conn-params",
    "command-prompt",
    "login-prompt",
    "password-prompt",
    "user",
    "password",
    "read-timeout",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionKind {
    Serial = 0,
    Telnet = 1,
    Ssh = 2,
    Shell = 3,
}

impl ConnectionKind {
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(Self::Serial),
            1 => Some(Self::Telnet),
            2 => Some(Self::Ssh),
            3 => Some(Self::Shell),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Serial => "serial",
            Self::Telnet => "telnet",
            Self::Ssh => "ssh",
            Self::Shell => "sh",
        }
    }

    /// `conn-params` choice labels accepted for this kind
    fn param_labels(self) -> &'static [&'static str] {
        match self {
            Self::Serial => &["serial"],
            Self::Telnet => &["telnet"],
            Self::Ssh => &["telnet", "ssh"],
            Self::Shell => &["shell"],
        }
    }

    fn param_fields(self) -> &'static [&'static str] {
        match self {
            Self::Serial => &["device"],
            Self::Telnet | Self::Ssh => &["host", "port"],
            Self::Shell => &["args"],
        }
    }
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a prompt pattern is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    /// expect-style glob (`plain` in CSAP specifications)
    Glob,
    /// regular expression (`script` in CSAP specifications)
    Regex,
}

/// Prompt identity; the discriminant is the prompt's index in the table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PromptTag {
    Command = 0,
    Login = 1,
    Password = 2,
}

impl PromptTag {
    fn field(self) -> &'static str {
        match self {
            Self::Command => "command-prompt",
            Self::Login => "login-prompt",
            Self::Password => "password-prompt",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub tag: PromptTag,
    pub pattern: String,
    pub kind: PatternKind,
}

bitflags::bitflags! {
    /// Which prompts a session knows about
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PromptStatus: u8 {
        const COMMAND = 1 << 0;
        const LOGIN = 1 << 1;
        const PASSWORD = 1 << 2;
    }
}

impl From<PromptTag> for PromptStatus {
    fn from(tag: PromptTag) -> Self {
        match tag {
            PromptTag::Command => PromptStatus::COMMAND,
            PromptTag::Login => PromptStatus::LOGIN,
            PromptTag::Password => PromptStatus::PASSWORD,
        }
    }
}

/// Where the spawned program connects to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Serial { device: String },
    Remote { host: String, port: u16 },
    Shell { args: Option<String> },
}

/// A fully validated CLI layer specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliSpec {
    pub kind: ConnectionKind,
    pub program: String,
    pub endpoint: Endpoint,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Ordered prompt table, command prompt first
    pub prompts: Vec<Prompt>,
    pub status: PromptStatus,
    pub read_timeout: Duration,
}

fn invalid_at(path: &str, err: NdnError) -> Error {
    Error::invalid(format!("{}: {}", path, err))
}

/// Read the octet string at `path` as an owned UTF-8 string.
///
/// The buffer is sized from the declared field length and reserved
/// fallibly. Absence is `Ok(None)`.
pub fn get_string(spec: &AsnValue, path: &str) -> Result<Option<String>> {
    let len = match spec.get_length(path) {
        Ok(len) => len,
        Err(NdnError::NotFound(_)) => return Ok(None),
        Err(e) => return Err(invalid_at(path, e)),
    };

    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| Error::OutOfMemory(len))?;
    buf.resize(len, 0);

    let n = spec
        .read_value(path, &mut buf)
        .map_err(|e| invalid_at(path, e))?;
    buf.truncate(n);

    String::from_utf8(buf)
        .map(Some)
        .map_err(|_| Error::invalid(format!("{}: not valid UTF-8", path)))
}

pub fn get_integer(spec: &AsnValue, path: &str) -> Result<Option<i64>> {
    match spec.read_integer(path) {
        Ok(v) => Ok(Some(v)),
        Err(NdnError::NotFound(_)) => Ok(None),
        Err(e) => Err(invalid_at(path, e)),
    }
}

/// The specification of layer `layer_index` of a CSAP (the alternative
/// selected at that position of its `layers` list).
pub fn get_spec(value: &AsnValue, layer_index: usize) -> Result<&AsnValue> {
    let layer = value
        .get("layers")
        .and_then(|layers| layers.read_indexed(layer_index, ""))
        .map_err(|e| invalid_at("layers", e))?;
    match layer {
        AsnValue::Choice(_, inner) => Ok(inner.as_ref()),
        other => Ok(other),
    }
}

fn check_fields(value: &AsnValue, allowed: &[&str], context: &str) -> Result<()> {
    match value {
        AsnValue::Sequence(fields) => {
            for (name, _) in fields {
                if !allowed.contains(&name.as_str()) {
                    return Err(Error::invalid(format!(
                        "unknown field '{}' in {}",
                        name, context
                    )));
                }
            }
            Ok(())
        }
        _ => Err(Error::invalid(format!("{} must be a sequence", context))),
    }
}

/// `plain` (glob) first, then `script` (regex)
fn get_prompt(spec: &AsnValue, tag: PromptTag) -> Result<Option<Prompt>> {
    let field = tag.field();
    if let Ok(AsnValue::Choice(label, _)) = spec.get(field) {
        if label != "plain" && label != "script" {
            return Err(Error::invalid(format!(
                "{}: unknown pattern kind '{}'",
                field, label
            )));
        }
    }

    for (label, kind) in [("plain", PatternKind::Glob), ("script", PatternKind::Regex)] {
        let path = format!("{}.#{}", field, label);
        if let Some(pattern) = get_string(spec, &path)? {
            let prompt = Prompt { tag, pattern, kind };
            CompiledPrompt::compile(&prompt)?;
            return Ok(Some(prompt));
        }
    }

    if spec.contains(field) {
        return Err(Error::invalid(format!(
            "{} must be 'plain' or 'script'",
            field
        )));
    }
    Ok(None)
}

impl CliSpec {
    /// Parse the CLI layer at `layer_index` of a whole CSAP specification.
    pub fn from_layer(value: &AsnValue, layer_index: usize, config: &Config) -> Result<Self> {
        Self::parse(get_spec(value, layer_index)?, config)
    }

    /// Parse a CLI layer specification.
    pub fn parse(spec: &AsnValue, config: &Config) -> Result<Self> {
        check_fields(spec, LAYER_FIELDS, "cli layer")?;

        let raw_kind = get_integer(spec, "conn-type")?
            .ok_or_else(|| Error::invalid("conn-type is missing"))?;
        let kind = ConnectionKind::from_i64(raw_kind)
            .ok_or_else(|| Error::invalid(format!("unknown conn-type {}", raw_kind)))?;

        let endpoint = parse_endpoint(spec, kind)?;

        let user = get_string(spec, "user")?;
        let password = get_string(spec, "password")?;

        let mut prompts = Vec::with_capacity(3);
        let mut status = PromptStatus::empty();
        for tag in [PromptTag::Command, PromptTag::Login, PromptTag::Password] {
            if let Some(prompt) = get_prompt(spec, tag)? {
                status |= PromptStatus::from(tag);
                prompts.push(prompt);
            }
        }

        if !status.contains(PromptStatus::COMMAND) {
            return Err(Error::invalid("command-prompt is missing"));
        }
        if status.contains(PromptStatus::LOGIN) && user.is_none() {
            return Err(Error::invalid("login-prompt is set but user is missing"));
        }
        if status.contains(PromptStatus::PASSWORD) && password.is_none() {
            return Err(Error::invalid(
                "password-prompt is set but password is missing",
            ));
        }

        let read_timeout = match get_integer(spec, "read-timeout")? {
            None => config.cli.read_timeout(),
            Some(secs) if secs > 0 => Duration::from_secs(secs as u64),
            Some(secs) => {
                return Err(Error::invalid(format!(
                    "read-timeout must be positive, got {}",
                    secs
                )))
            }
        };

        Ok(Self {
            kind,
            program: config.programs.program(kind).to_string(),
            endpoint,
            user,
            password,
            prompts,
            status,
            read_timeout,
        })
    }

    pub fn prompt(&self, tag: PromptTag) -> Option<&Prompt> {
        self.prompts.iter().find(|p| p.tag == tag)
    }
}

fn parse_endpoint(spec: &AsnValue, kind: ConnectionKind) -> Result<Endpoint> {
    let params = match spec.get("conn-params") {
        Ok(AsnValue::Choice(label, inner)) => {
            if !kind.param_labels().contains(&label.as_str()) {
                return Err(Error::invalid(format!(
                    "conn-params '{}' does not match conn-type {}",
                    label, kind
                )));
            }
            Some(inner.as_ref())
        }
        Ok(_) => return Err(Error::invalid("conn-params must be a choice")),
        Err(_) => None,
    };

    if let Some(params) = params {
        check_fields(params, kind.param_fields(), "conn-params")?;
    }
    let empty = AsnValue::empty();
    let params = params.unwrap_or(&empty);

    match kind {
        ConnectionKind::Serial => {
            let device = get_string(params, "device")?
                .ok_or_else(|| Error::invalid("serial device is missing"))?;
            Ok(Endpoint::Serial { device })
        }
        ConnectionKind::Telnet | ConnectionKind::Ssh => {
            let host = get_string(params, "host")?
                .ok_or_else(|| Error::invalid("host is missing"))?;
            let raw_port = get_integer(params, "port")?
                .ok_or_else(|| Error::invalid("port is missing"))?;
            let port = u16::try_from(raw_port)
                .map_err(|_| Error::invalid(format!("port {} out of range", raw_port)))?;
            Ok(Endpoint::Remote { host, port })
        }
        ConnectionKind::Shell => Ok(Endpoint::Shell {
            args: get_string(params, "args")?,
        }),
    }
}
