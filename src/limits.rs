//! Hard caps on tenant size and input lengths.

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 256;

pub const MAX_RESOURCES_PER_TENANT: usize = 100_000;
pub const MAX_HOLDERS_PER_TENANT: usize = 1_000_000;

pub const MAX_NAME_LEN: usize = 512;
pub const MAX_DESCRIPTION_LEN: usize = 4096;
pub const MAX_CONTACT_LEN: usize = 320;

/// Largest unit count a single resource may be provisioned with.
pub const MAX_STOCK: u32 = 1_000_000;

/// Default threshold for the low-stock listing.
pub const DEFAULT_LOW_STOCK_THRESHOLD: u32 = 3;
