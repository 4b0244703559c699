use thiserror::Error;

/// Core error types for nodewall
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed (spawning a tool, writing a log file)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// iptables / ip6tables / *-save exited non-zero
    #[error("{binary} {args} failed ({kind}): {stderr}")]
    Command {
        binary: String,
        args: String,
        kind: CommandErrorKind,
        stderr: String,
        exit_code: Option<i32>,
    },

    /// An IP literal did not parse as an address of any known family
    #[error("Invalid address in {field}: {value:?}")]
    InvalidAddress { field: String, value: String },

    /// A dumped rule line did not match the expected grammar
    #[error("Unparseable rule line ({reason}): {line}")]
    ParseSkew { line: String, reason: String },

    /// Required configuration missing or malformed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Kubernetes API call failed
    #[error("Kubernetes API error: {0}")]
    Cluster(String),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the command failure kind, if this is a command failure.
    pub fn command_kind(&self) -> Option<CommandErrorKind> {
        match self {
            Error::Command { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// `true` when the failure only says the chain, rule or target is absent.
    pub fn is_not_found(&self) -> bool {
        self.command_kind() == Some(CommandErrorKind::NotFound)
    }
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        Error::Cluster(e.to_string())
    }
}

/// Classification of a failed iptables invocation, decided once at the
/// command boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum CommandErrorKind {
    /// Chain, rule, match or target does not exist
    #[strum(serialize = "not found")]
    NotFound,
    /// Chain already exists
    #[strum(serialize = "already exists")]
    AlreadyExists,
    /// Anything else: lock timeout, permission, bad arguments
    #[strum(serialize = "failed")]
    Other,
}

/// Database of iptables diagnostic patterns.
pub struct IptablesErrorPattern;

impl IptablesErrorPattern {
    const NOT_FOUND: &'static [&'static str] = &[
        "no chain/target/match by that name",
        "couldn't load target",
        "couldn't load match",
        "does a matching rule exist",
        "bad rule",
        "does not exist",
    ];

    const ALREADY_EXISTS: &'static [&'static str] = &["chain already exists", "file exists"];

    /// Maps a tool's stderr onto a [`CommandErrorKind`].
    pub fn classify(stderr: &str) -> CommandErrorKind {
        let lower = stderr.to_lowercase();

        if Self::NOT_FOUND.iter().any(|p| lower.contains(p)) {
            return CommandErrorKind::NotFound;
        }

        if Self::ALREADY_EXISTS.iter().any(|p| lower.contains(p)) {
            return CommandErrorKind::AlreadyExists;
        }

        CommandErrorKind::Other
    }
}

pub type Result<T> = std::result::Result<T, Error>;
