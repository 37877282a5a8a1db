//! Test API helpers: build CLI CSAP specifications and run commands
//! through a [`CsapRegistry`].
//!
//! ```ignore
//! let params = CliCsapParams::shell(Some("exec sh -i"))
//!     .command_prompt(PromptType::Plain, DEBIAN_COMMAND_PROMPT);
//! let id = cli_csap_create(&registry, &params)?;
//! let out = cli_send_recv(&registry, id, "uname -s", Duration::from_secs(5))?;
//! ```

use std::time::Duration;

use crate::csap::{CsapId, CsapRegistry};
use crate::error::{Error, Result};
use crate::ndn::AsnValue;
use crate::spec::{ConnectionKind, Endpoint};

pub const TELNET_DEFAULT_PORT: u16 = 23;
pub const SSH_DEFAULT_PORT: u16 = 22;

/// Command prompt of a RedHat shell: `[...]$ `
pub const REDHAT_COMMAND_PROMPT: &str = r"\]\$\ ";
/// Command prompt of a Debian shell: `...$ `
pub const DEBIAN_COMMAND_PROMPT: &str = r"\$\ ";

pub const DEFAULT_LOGIN_PROMPT: &str = "ogin: ";
pub const DEFAULT_PASSWORD_PROMPT: &str = "assword: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptType {
    /// Glob pattern
    Plain,
    /// Regular expression
    RegExp,
}

impl PromptType {
    fn label(self) -> &'static str {
        match self {
            PromptType::Plain => "plain",
            PromptType::RegExp => "script",
        }
    }
}

/// Login prompt answered with the user name by default; ssh takes the user
/// on its command line instead.
fn default_login_prompt(kind: ConnectionKind) -> Option<&'static str> {
    match kind {
        ConnectionKind::Ssh => None,
        _ => Some(DEFAULT_LOGIN_PROMPT),
    }
}

/// Parameters of a CLI CSAP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliCsapParams {
    kind: ConnectionKind,
    endpoint: Endpoint,
    command_prompt: Option<(PromptType, String)>,
    login_prompt: Option<(PromptType, String)>,
    user: Option<String>,
    password_prompt: Option<(PromptType, String)>,
    password: Option<String>,
    read_timeout: Option<u64>,
}

impl CliCsapParams {
    fn new(kind: ConnectionKind, endpoint: Endpoint) -> Self {
        Self {
            kind,
            endpoint,
            command_prompt: None,
            login_prompt: None,
            user: None,
            password_prompt: None,
            password: None,
            read_timeout: None,
        }
    }

    /// Local serial console.
    pub fn serial(device: &str) -> Self {
        Self::new(
            ConnectionKind::Serial,
            Endpoint::Serial {
                device: device.to_string(),
            },
        )
    }

    /// Telnet or ssh session; `port` defaults to the protocol's well-known
    /// port.
    pub fn remote(kind: ConnectionKind, host: &str, port: Option<u16>) -> Result<Self> {
        let default_port = match kind {
            ConnectionKind::Telnet => TELNET_DEFAULT_PORT,
            ConnectionKind::Ssh => SSH_DEFAULT_PORT,
            other => {
                return Err(Error::invalid(format!(
                    "{} is not a remote connection type",
                    other
                )))
            }
        };
        Ok(Self::new(
            kind,
            Endpoint::Remote {
                host: host.to_string(),
                port: port.unwrap_or(default_port),
            },
        ))
    }

    /// Local shell, optionally with `-c <args>`.
    pub fn shell(args: Option<&str>) -> Self {
        Self::new(
            ConnectionKind::Shell,
            Endpoint::Shell {
                args: args.map(str::to_string),
            },
        )
    }

    pub fn command_prompt(mut self, kind: PromptType, pattern: &str) -> Self {
        self.command_prompt = Some((kind, pattern.to_string()));
        self
    }

    pub fn login_prompt(mut self, kind: PromptType, pattern: &str) -> Self {
        self.login_prompt = Some((kind, pattern.to_string()));
        self
    }

    pub fn password_prompt(mut self, kind: PromptType, pattern: &str) -> Self {
        self.password_prompt = Some((kind, pattern.to_string()));
        self
    }

    /// User name to log in with. Adds the default login prompt unless one
    /// is set.
    pub fn user(mut self, user: &str) -> Self {
        self.user = Some(user.to_string());
        if self.login_prompt.is_none() {
            self.login_prompt = default_login_prompt(self.kind)
                .map(|p| (PromptType::Plain, p.to_string()));
        }
        self
    }

    /// Password to answer the password prompt with. Adds the default
    /// password prompt unless one is set.
    pub fn password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        if self.password_prompt.is_none() {
            self.password_prompt = Some((PromptType::Plain, DEFAULT_PASSWORD_PROMPT.to_string()));
        }
        self
    }

    pub fn read_timeout(mut self, secs: u64) -> Self {
        self.read_timeout = Some(secs);
        self
    }

    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    /// The CSAP specification: `{ layers { cli : { ... } } }`.
    pub fn to_asn(&self) -> AsnValue {
        fn field(name: &str, value: AsnValue) -> (String, AsnValue) {
            (name.to_string(), value)
        }
        fn plain(text: &str) -> AsnValue {
            AsnValue::choice("plain", AsnValue::string(text))
        }
        fn prompt((kind, pattern): &(PromptType, String)) -> AsnValue {
            AsnValue::choice(kind.label(), AsnValue::string(pattern))
        }

        let mut cli = vec![field("conn-type", AsnValue::Integer(self.kind as i64))];

        let params = match &self.endpoint {
            Endpoint::Serial { device } => Some((
                "serial",
                vec![field("device", plain(device))],
            )),
            Endpoint::Remote { host, port } => Some((
                "telnet",
                vec![
                    field("host", plain(host)),
                    field("port", AsnValue::choice("plain", AsnValue::Integer(i64::from(*port)))),
                ],
            )),
            Endpoint::Shell { args } => args
                .as_deref()
                .map(|args| ("shell", vec![field("args", plain(args))])),
        };
        if let Some((label, fields)) = params {
            cli.push(field("conn-params", AsnValue::choice(label, AsnValue::Sequence(fields))));
        }

        if let Some(p) = &self.command_prompt {
            cli.push(field("command-prompt", prompt(p)));
        }
        if let Some(p) = &self.login_prompt {
            cli.push(field("login-prompt", prompt(p)));
        }
        if let Some(user) = &self.user {
            cli.push(field("user", plain(user)));
        }
        if let Some(p) = &self.password_prompt {
            cli.push(field("password-prompt", prompt(p)));
        }
        if let Some(password) = &self.password {
            cli.push(field("password", plain(password)));
        }
        if let Some(secs) = self.read_timeout {
            cli.push(field("read-timeout", AsnValue::Integer(secs as i64)));
        }

        AsnValue::Sequence(vec![field(
            "layers",
            AsnValue::SequenceOf(vec![AsnValue::choice("cli", AsnValue::Sequence(cli))]),
        )])
    }
}

/// Traffic template sending `command`:
/// `{ pdus { cli : { message plain : "..." } } }`.
pub fn command_template(command: &str) -> AsnValue {
    let message = AsnValue::Sequence(vec![(
        "message".to_string(),
        AsnValue::choice("plain", AsnValue::string(command)),
    )]);
    AsnValue::Sequence(vec![(
        "pdus".to_string(),
        AsnValue::SequenceOf(vec![AsnValue::choice("cli", message)]),
    )])
}

pub fn cli_csap_create(registry: &CsapRegistry, params: &CliCsapParams) -> Result<CsapId> {
    let id = registry.create(&params.to_asn())?;
    tracing::debug!("Created {} CLI CSAP {}", params.kind, id);
    Ok(id)
}

/// Run `command`, discarding its output.
pub fn cli_send(registry: &CsapRegistry, id: CsapId, command: &str) -> Result<()> {
    registry.send(id, &command_template(command))
}

/// Run `command` and return its output.
pub fn cli_send_recv(
    registry: &CsapRegistry,
    id: CsapId,
    command: &str,
    timeout: Duration,
) -> Result<String> {
    let packet = registry.send_recv(id, &command_template(command), timeout)?;
    let output = packet
        .read_octets("cli.message.plain")
        .map_err(|e| Error::FatalProtocol(format!("response packet: {}", e)))?;
    Ok(String::from_utf8_lossy(output).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::spec::{CliSpec, PatternKind, PromptStatus, PromptTag};

    fn parse_back(params: &CliCsapParams) -> CliSpec {
        CliSpec::from_layer(&params.to_asn(), 0, &Config::default()).unwrap()
    }

    #[test]
    fn test_shell_params() {
        let params = CliCsapParams::shell(Some("exec sh -i"))
            .command_prompt(PromptType::Plain, DEBIAN_COMMAND_PROMPT)
            .read_timeout(2);
        let spec = parse_back(&params);
        assert_eq!(spec.kind, ConnectionKind::Shell);
        assert_eq!(
            spec.endpoint,
            Endpoint::Shell {
                args: Some("exec sh -i".into())
            }
        );
        assert_eq!(spec.prompt(PromptTag::Command).unwrap().pattern, r"\$\ ");
        assert_eq!(spec.read_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_remote_default_ports() {
        let telnet = CliCsapParams::remote(ConnectionKind::Telnet, "dut", None).unwrap();
        let ssh = CliCsapParams::remote(ConnectionKind::Ssh, "dut", None).unwrap();
        let custom = CliCsapParams::remote(ConnectionKind::Ssh, "dut", Some(2222)).unwrap();
        for (params, port) in [(telnet, 23), (ssh, 22), (custom, 2222)] {
            let spec = parse_back(&params.command_prompt(PromptType::Plain, "# "));
            assert_eq!(
                spec.endpoint,
                Endpoint::Remote {
                    host: "dut".into(),
                    port
                }
            );
        }
        assert!(CliCsapParams::remote(ConnectionKind::Shell, "dut", None).is_err());
    }

    #[test]
    fn test_default_credential_prompts() {
        let telnet = CliCsapParams::remote(ConnectionKind::Telnet, "dut", None)
            .unwrap()
            .command_prompt(PromptType::RegExp, "[>#] $")
            .user("admin")
            .password("secret");
        let spec = parse_back(&telnet);
        assert_eq!(spec.status, PromptStatus::all());
        assert_eq!(spec.prompt(PromptTag::Login).unwrap().pattern, "ogin: ");
        assert_eq!(spec.prompt(PromptTag::Password).unwrap().pattern, "assword: ");
        assert_eq!(spec.prompt(PromptTag::Command).unwrap().kind, PatternKind::Regex);

        // ssh passes the user with -l
        let ssh = CliCsapParams::remote(ConnectionKind::Ssh, "dut", None)
            .unwrap()
            .command_prompt(PromptType::Plain, "$ ")
            .user("admin")
            .password("secret");
        let spec = parse_back(&ssh);
        assert!(spec.prompt(PromptTag::Login).is_none());
        assert_eq!(spec.user.as_deref(), Some("admin"));
    }

    #[test]
    fn test_explicit_prompt_kept() {
        let params = CliCsapParams::serial("/dev/ttyS0")
            .command_prompt(PromptType::Plain, REDHAT_COMMAND_PROMPT)
            .login_prompt(PromptType::Plain, "Name:")
            .user("root");
        let spec = parse_back(&params);
        assert_eq!(spec.prompt(PromptTag::Login).unwrap().pattern, "Name:");
        assert_eq!(
            spec.endpoint,
            Endpoint::Serial {
                device: "/dev/ttyS0".into()
            }
        );
    }

    #[test]
    fn test_spec_text() {
        let params = CliCsapParams::remote(ConnectionKind::Telnet, "dut", Some(2323))
            .unwrap()
            .command_prompt(PromptType::Plain, "> ");
        assert_eq!(
            params.to_asn().to_string(),
            r#"{ layers { cli : { conn-type 1, conn-params telnet : { host plain : "dut", port plain : 2323 }, command-prompt plain : "> " } } }"#
        );
    }

    #[test]
    fn test_command_template() {
        let template = command_template("show version");
        assert_eq!(
            template.to_string(),
            r#"{ pdus { cli : { message plain : "show version" } } }"#
        );
        assert_eq!(
            crate::codec::generate_bin(template.get("pdus.0.#cli").unwrap())
                .unwrap()
                .as_ref(),
            b"show version"
        );
    }
}
