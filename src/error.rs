use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::types::Endpoint;

/// Network stage a timeout was hit in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Connect,
    Request,
    Upgrade,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Connect => "connect",
            Stage::Request => "trace request",
            Stage::Upgrade => "upgrade handshake",
        };
        f.write_str(s)
    }
}

/// Per-endpoint probe failure. None of these abort a run.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("connect to {endpoint} failed: {source}")]
    Connect {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },
    #[error("{stage} timed out after {}ms", .after.as_millis())]
    Timeout { stage: Stage, after: Duration },
    #[error("response did not match: {0}")]
    NoMatch(&'static str),
    #[error("upgrade check failed: {0}")]
    UpgradeFailed(String),
    #[error("http exchange failed: {0}")]
    Http(#[from] hyper::Error),
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
}

impl ProbeError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProbeError::Timeout { .. })
    }
}
