use serde::{Deserialize, Serialize};

/// Permissions a caller holds on one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceClaims {
    pub allow_read: bool,
    pub allow_overwrite: bool,
    pub allow_delete: bool,
    pub allow_rename: bool,
}

impl ResourceClaims {
    pub const ALL: Self = Self {
        allow_read: true,
        allow_overwrite: true,
        allow_delete: true,
        allow_rename: true,
    };

    pub const READ_ONLY: Self = Self {
        allow_read: true,
        allow_overwrite: false,
        allow_delete: false,
        allow_rename: false,
    };
}

/// Yields the claims for a resource. Policy lives entirely behind this trait.
pub trait ClaimsProvider: Send + Sync {
    fn claims(&self, resource_id: &str) -> ResourceClaims;
}

/// Grants everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAllClaims;

impl ClaimsProvider for AllowAllClaims {
    fn claims(&self, _resource_id: &str) -> ResourceClaims {
        ResourceClaims::ALL
    }
}
