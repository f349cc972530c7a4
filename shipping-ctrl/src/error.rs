use shipping_agent::ShipError;

/// Controller-side failures. Request errors carry a remediation hint in
/// their message.
#[derive(thiserror::Error, Debug)]
pub enum CtrlError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("The remote {0} does not exist. Please provide a valid remote or create a new one.")]
    RemoteNotFound(String),

    #[error("Could not find a matching backup '{0}'")]
    BackupNotFound(String),

    #[error("Backup chain of {key} is broken: {reason}")]
    ChainBroken { key: String, reason: String },

    #[error("Ambiguous id '{prefix}' for remote '{remote}':\n{}", indented(.matches))]
    AmbiguousId {
        prefix: String,
        remote: String,
        matches: Vec<String>,
    },

    #[error("{key} should be deleted, but at least {dependent} is referencing it. Use --cascading to delete recursively")]
    DependentBackupExists { key: String, dependent: String },

    #[error("Unable to decrypt the S3/OBS access key and secret key without having a master key. Create or enter the master passphrase")]
    CryptoKeyUnavailable,

    #[error("Illegal shipping flags {0}")]
    IllegalFlags(String),

    #[error("Lock {0} is not held in the required mode")]
    LockNotHeld(&'static str),

    #[error(transparent)]
    Ship(#[from] ShipError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CtrlError {
    /// Request errors are reported back to the caller rather than logged as
    /// internal failures.
    pub fn is_request_error(&self) -> bool {
        !matches!(
            self,
            CtrlError::Internal(_) | CtrlError::LockNotHeld(_) | CtrlError::Ship(ShipError::Io(_))
        )
    }
}

fn indented(lines: &[String]) -> String {
    lines
        .iter()
        .map(|line| format!("  {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

pub type Result<T> = std::result::Result<T, CtrlError>;
