//! Types shared by every ripc crate: identities, endpoints, calls and the
//! workspace-wide error type.

pub mod call;
pub mod endpoint;
pub mod error;
pub mod identity;

pub use call::*;
pub use endpoint::*;
pub use error::*;
pub use identity::*;
