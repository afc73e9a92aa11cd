pub mod error;
pub mod hash;
pub mod logging;
pub mod time;

pub use error::{ConfigError, ErrorKind, ErrorUtils, ProxyError, ProxyResult};
