pub mod errors;
pub mod locator;

pub use errors::{StreamError, StreamResult};
