/// Failures surfaced by [`Target`](crate::Target) implementations and by the
/// handle's own readers.
///
/// Queries never surface these: a lookup that fails for any reason other than
/// a collaborator error simply reports "not found" (`None`). The variants
/// exist so collaborators can describe what went wrong and so ingest can
/// decide between recovery (drift, unreadable files) and giving up.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("target memory at {0:#x} could not be read")]
    TargetUnreadable(u64),
    #[error("a mapping entry is invalid")]
    InvalidMapping,
    #[error("malformed ELF image")]
    MalformedElf,
    #[error("ELF class, byte order, or version is not supported")]
    UnsupportedElf,
    #[error("the target process is not live")]
    NotLive,
    #[error("no dynamic-linker agent is available for the target")]
    AgentUnavailable,
}
