//! Repository verification module.
//!
//! A `RepositoryVerifier` holds the trusted state of one repository
//! (Director or Image) and advances it only through fully verified
//! documents:
//! - `verifier` - trust state machine, root chain, bundle checks
//! - `source` - transport or storage as the document source
//! - `error` - refresh errors

pub mod error;
pub mod source;
pub mod verifier;

pub use error::*;
pub use source::*;
pub use verifier::*;
