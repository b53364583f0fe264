use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Contribution id {0} is outside the derivable range 0..2^31")]
    InvalidContributionId(i64),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid memo: {0}")]
    InvalidMemo(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("RPC {method} failed with code {code}: {message}")]
    RpcFailure {
        method: String,
        code: i64,
        message: String,
    },

    #[error("RPC {method} timed out after {secs}s")]
    Timeout { method: String, secs: u64 },

    #[error("Custodial wallet error: {0}")]
    Custodial(String),

    #[error("Address derivation error: {0}")]
    Derivation(String),

    #[error("Delivery to {sink} failed: {reason}")]
    Delivery { sink: &'static str, reason: String },

    #[error("Scanner halted at height {height} after {failures} consecutive failures: {reason}")]
    ScannerHalted {
        height: u64,
        failures: u32,
        reason: String,
    },
}

impl Error {
    /// Errors caused by the caller's input. These are rejected, never retried.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            Error::InvalidContributionId(_) | Error::InvalidInput(_) | Error::InvalidMemo(_)
        )
    }

    /// Errors raised by the node or the transport to it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Rpc(_) | Error::RpcFailure { .. } | Error::Timeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
