use thiserror::Error;

#[derive(Error, Debug)]
pub enum CofferError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed lock encoding: {0}")]
    MalformedEncoding(String),

    #[error("Lock is already unlocked")]
    AlreadyUnlocked,

    #[error("Wrong lock type: {0}")]
    WrongLockType(String),

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Key derivation error: {0}")]
    KeyDerivation(String),

    #[error("Corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("An entry stream is already open")]
    StreamAlreadyOpen,

    #[error("Archive is closed")]
    ArchiveClosed,

    #[error("Entry descriptor does not belong to this archive")]
    EntryNotOwned,

    #[error("Entry {0} not found")]
    EntryNotFound(String),

    #[error("Lock was already used for another archive")]
    LockNotFresh,

    #[error("Invalid container format: {0}")]
    InvalidFormat(String),
}

pub type Result<T> = std::result::Result<T, CofferError>;

impl CofferError {
    /// Wrap for use inside `io::Read`/`io::Write` impls, where only
    /// `io::Error` can travel. `from_io` undoes the wrapping at the
    /// archive boundary so callers see the original variant.
    pub(crate) fn into_io(self) -> std::io::Error {
        std::io::Error::other(self)
    }

    pub(crate) fn from_io(err: std::io::Error) -> Self {
        match err.downcast::<CofferError>() {
            Ok(inner) => inner,
            Err(err) => CofferError::Io(err),
        }
    }
}
