pub mod error;

pub use error::StreamError;
