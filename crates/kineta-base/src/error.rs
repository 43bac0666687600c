/// The error kinds a command can fail with, per the reply-channel taxonomy.
///
/// These map 1:1 onto uppercase RESP error tokens and memcache error lines;
/// see `kineta-wire` for the rendering side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandErrorKind {
    Syntax,
    WrongType,
    OutOfRange,
    InvalidInt,
    InvalidFloat,
    InvalidNumericResult,
    KeyNotFound,
    OutOfMemory,
    Loading,
    AuthRequired,
    AuthRejected,
    BusyGroup,
    WrongSlot,
    Moved,
    ClusterDown,
    ProtocolError,
    Internal,
}

impl CommandErrorKind {
    /// The uppercase RESP error token, e.g. `-WRONGTYPE ...`.
    pub fn resp_token(self) -> &'static str {
        use CommandErrorKind::*;
        match self {
            Syntax => "ERR",
            WrongType => "WRONGTYPE",
            OutOfRange => "ERR",
            InvalidInt => "ERR",
            InvalidFloat => "ERR",
            InvalidNumericResult => "ERR",
            KeyNotFound => "ERR",
            OutOfMemory => "OOM",
            Loading => "LOADING",
            AuthRequired => "NOAUTH",
            AuthRejected => "WRONGPASS",
            BusyGroup => "BUSYGROUP",
            WrongSlot => "CLUSTERDOWN",
            Moved => "MOVED",
            ClusterDown => "CLUSTERDOWN",
            ProtocolError => "ERR",
            Internal => "ERR",
        }
    }
}

/// A per-command failure, reported on the reply channel only. This never
/// tears down the connection.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct CommandError {
    pub kind: CommandErrorKind,
    pub message: String,
}

impl CommandError {
    pub fn new(kind: CommandErrorKind, message: impl Into<String>) -> Self {
        CommandError {
            kind,
            message: message.into(),
        }
    }

    pub fn moved(slot: crate::SlotId, host_port: impl Into<String>) -> Self {
        CommandError::new(CommandErrorKind::Moved, format!("{} {}", slot.0, host_port.into()))
    }
}

/// Engine-internal failures: things that are not a single command's fault,
/// such as a parser desync, I/O failure, or snapshot write error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("encode/decode failure: {0}")]
    Codec(String),
    #[error("transaction {0:?} was cancelled")]
    Cancelled(crate::TxId),
    #[error("shard channel closed")]
    ShardGone,
    #[error(transparent)]
    Command(#[from] CommandError),
}

pub type Result<T> = std::result::Result<T, Error>;
