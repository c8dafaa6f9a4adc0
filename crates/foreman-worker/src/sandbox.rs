//! Process sandbox applied before running tenant code

use tracing::debug;

use crate::error::TaskError;

/// Restricts what tenant code may do inside this process
pub trait Sandbox: Send + Sync {
    /// Apply restrictions on behalf of a tenant; called until it succeeds once
    fn apply(&self, application_id: &str) -> Result<(), TaskError>;
}

/// Leaves the process unrestricted
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSandbox;

impl Sandbox for NoSandbox {
    fn apply(&self, application_id: &str) -> Result<(), TaskError> {
        debug!("Running unsandboxed as {}", tenant_user(application_id));
        Ok(())
    }
}

/// System user name a tenant's code runs as
pub fn tenant_user(application_id: &str) -> String {
    application_id.replace('-', "").to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_user() {
        assert_eq!(tenant_user("ABCD-12-EF"), "abcd12ef");
    }
}
