//! Process exit codes.
//!
//! Run states map to 0 (completed), 1 (failed), 2 (killed) and 3 (paused);
//! the remaining codes report why a command could not run.

use phasegate_core::error::PhasegateError;
use phasegate_core::types::RunStatus;

pub const CHAIN_INTEGRITY: u8 = 4;
pub const CONFIG: u8 = 5;
pub const USAGE: u8 = 6;
/// Another process holds the run's writer lock.
pub const LOCKED: u8 = 7;

pub fn for_status(status: RunStatus) -> u8 {
    // exit_code() is always within 0..=3.
    status.exit_code() as u8
}

pub fn for_error(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<PhasegateError>() {
        Some(PhasegateError::ChainIntegrity { .. }) => CHAIN_INTEGRITY,
        Some(PhasegateError::Config(_) | PhasegateError::ConfigNotFound(_)) => CONFIG,
        Some(PhasegateError::RunLocked { .. }) => LOCKED,
        _ => USAGE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(for_status(RunStatus::Completed), 0);
        assert_eq!(for_status(RunStatus::Failed), 1);
        assert_eq!(for_status(RunStatus::Killed), 2);
        assert_eq!(for_status(RunStatus::Paused), 3);
        assert_eq!(for_status(RunStatus::Running), 3);
    }

    #[test]
    fn error_codes() {
        let chain = anyhow::Error::new(PhasegateError::ChainIntegrity {
            run: "r".into(),
            seq: 3,
            reason: "hash mismatch".into(),
        });
        assert_eq!(for_error(&chain), CHAIN_INTEGRITY);
        let config = anyhow::Error::new(PhasegateError::Config("bad".into()));
        assert_eq!(for_error(&config), CONFIG);
        let locked = anyhow::Error::new(PhasegateError::RunLocked {
            run: "r".into(),
            lock: "ledger/r/writer.lock".into(),
        });
        assert_eq!(for_error(&locked), LOCKED);
        assert_eq!(for_error(&anyhow::anyhow!("other")), USAGE);
    }
}
