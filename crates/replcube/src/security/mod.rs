//! Security policy and the static pre-execution guard

pub use crate::security::guard::{GuardViolation, StaticGuard};
pub use crate::security::policy::SecurityPolicy;

mod guard;
mod policy;
pub mod scan;
