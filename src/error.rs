//! Typed failures surfaced by the harness.
//!
//! Everything fallible in the crate returns `anyhow::Result`; the variants
//! below are the conditions callers need to tell apart, recovered with
//! `anyhow::Error::downcast_ref::<HarnessError>()`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    /// Server and client observed a different number of handshakes on one
    /// port. Pairing them would silently mismatch records.
    #[error("session on port {port} out of sync: {server} server records != {client} client records")]
    Desync {
        port: u16,
        server: usize,
        client: usize,
    },

    /// An external command (netem, ping) exited unsuccessfully.
    #[error("command `{command}` failed with {status}: {output}")]
    CommandFailed {
        command: String,
        status: String,
        output: String,
    },

    /// The port range requested for the worker pool is unusable.
    #[error("invalid port range: {0}")]
    PortRange(String),

    /// Output of an external tool could not be interpreted.
    #[error("unexpected output from `{command}`: {detail}")]
    UnexpectedOutput { command: String, detail: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desync_message_names_port_and_counts() {
        let err = HarnessError::Desync {
            port: 10007,
            server: 399,
            client: 400,
        };
        let msg = err.to_string();
        assert!(msg.contains("10007"));
        assert!(msg.contains("399 server records != 400 client records"));
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = HarnessError::PortRange("empty".into()).into();
        assert!(matches!(
            err.downcast_ref::<HarnessError>(),
            Some(HarnessError::PortRange(_))
        ));
    }
}
