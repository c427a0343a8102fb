use thiserror::Error;

use crate::inspect::Category;

/// Per-packet and control-plane errors raised by the core pipeline.
///
/// Packet-granularity variants (everything except [`CoreError::Io`] and
/// [`CoreError::Config`]) are never fatal: the stage that raises one drops
/// the single offending packet, increments the matching counter in
/// [`crate::stats`], and the worker moves on to the next buffer in the
/// batch. Only [`CoreError::Config`] is returned synchronously to a
/// control-plane caller; it never affects packets already in flight.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),

    #[error("policy denied the flow")]
    PolicyDeny,

    #[error("dlp violation: {0:?}")]
    DlpViolation(Category),

    #[error("ips blocked: {0:?}")]
    IpsBlock(Category),

    #[error("nat pool exhausted")]
    NatPortExhausted,

    #[error("session table full")]
    SessionTableFull,

    #[error("rate limited")]
    RateLimited,
}

pub type Result<T> = std::result::Result<T, CoreError>;
