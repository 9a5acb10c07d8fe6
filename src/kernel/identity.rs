//! Sandbox execution identities.
//!
//! Each pool slot maps to its own uid/gid pair, so two sandboxes that run at the
//! same time never share an identity: they cannot signal each other, cannot open
//! each other's 0700 workspaces, and RLIMIT_NPROC counts only their own tasks.

use crate::config::harness::HarnessConfig;
use crate::config::types::{HarnessError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SandboxIdentity {
    pub uid: u32,
    pub gid: u32,
}

impl SandboxIdentity {
    pub fn for_slot(config: &HarnessConfig, slot: usize) -> Self {
        SandboxIdentity {
            uid: config.sandbox_uid_base + slot as u32,
            gid: config.sandbox_gid_base + slot as u32,
        }
    }

    /// Root is never a valid sandbox identity.
    pub fn validate(&self) -> Result<()> {
        if self.uid == 0 || self.gid == 0 {
            return Err(HarnessError::Privilege(format!(
                "refusing to run a sandbox as uid={} gid={}",
                self.uid, self.gid
            )));
        }
        Ok(())
    }
}

pub fn running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_get_distinct_identities() {
        let config = HarnessConfig::default();
        let a = SandboxIdentity::for_slot(&config, 0);
        let b = SandboxIdentity::for_slot(&config, 1);
        assert_ne!(a, b);
        assert_eq!(b.uid, config.sandbox_uid_base + 1);
        assert!(a.validate().is_ok());
    }

    #[test]
    fn test_root_identity_is_rejected() {
        let identity = SandboxIdentity { uid: 0, gid: 1000 };
        assert!(matches!(identity.validate(), Err(HarnessError::Privilege(_))));
    }
}
