//! HTTP request handlers.

pub mod admin;
pub mod auth;
pub mod clusters;
pub mod common;
pub mod dns;
pub mod node;

pub use admin::*;
pub use auth::*;
pub use clusters::*;
pub use common::*;
pub use dns::*;
pub use node::*;
