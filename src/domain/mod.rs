mod auth;
mod method;
mod types;

pub use auth::{ApiKeyLocation, AuthMethod};
pub use method::HttpMethod;
pub use types::*;
