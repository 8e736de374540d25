//! chatgate-core — domain model, capability traits and error taxonomy
//! shared by the gateway binary and the LLM crate.
//!
//! ## Modules
//!
//! - [`model`]: `Session`, `Message`, `Sender`, `Identity` (§3)
//! - [`store`]: the `SessionStore` capability the core consumes (§4.6)
//! - [`error`]: the error taxonomy (§7)

pub mod error;
pub mod model;
pub mod store;

pub use error::{ChatGateError, Result};
pub use model::{Identity, Message, ModelError, Role, Sender, Session};
pub use store::{Page, Pagination, SessionFilter, SessionSort, SessionStore, StoreError};
