use futures::future::{self, BoxFuture};
use futures::FutureExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    Scan,
    Connect,
}

/// Runtime capability grants required before touching the radio.
pub trait PermissionGate: Send + Sync {
    fn check(&self, permission: Permission) -> bool;

    /// Asks the user; resolves to `true` only if the grant was given.
    fn request(&self, permission: Permission) -> BoxFuture<'_, bool>;
}

/// Desktop platforms grant radio access per process; the OS prompts on first use.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrantedPermissions;

impl PermissionGate for GrantedPermissions {
    fn check(&self, _permission: Permission) -> bool {
        true
    }

    fn request(&self, _permission: Permission) -> BoxFuture<'_, bool> {
        future::ready(true).boxed()
    }
}
