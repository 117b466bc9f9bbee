//! Domain types and pure validation rules for tenant provisioning.
//!
//! Nothing in this crate performs I/O. Storage and HTTP layers build on the
//! types defined here.
pub mod identifier;
pub mod signup;
pub mod types;

pub use identifier::{IdentifierError, IdentifierPolicy, TenantIdentifier, RESERVED_IDENTIFIERS};
pub use signup::{FieldErrors, SignupRequest, ValidatedSignup};
pub use types::{normalize_hostname, Domain, PartitionHandle, Tenant};
