//! # cove-id
//!
//! Typed identifiers for the cove control plane.
//!
//! Identifiers end up embedded in coordination-store paths and in instance
//! state IDs (`{host}-{service}-{instance}`), so every ID type rejects the
//! characters those encodings reserve: `-`, `/` and whitespace.
//!
//! Freshly generated IDs use a prefixed ULID: `svc_01HV4Z2WQXKJNM8GPQY6VBKC3D`.
//! IDs supplied by operators (`web`, `default`) are accepted as-is once they
//! pass validation.

mod error;
mod macros;
mod types;

pub use error::IdError;

#[doc(hidden)]
pub use error::validate as error_validate;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
