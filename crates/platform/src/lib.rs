//! # Tessera Platform
//!
//! Core platform types shared by the Tessera SSH crates.
//!
//! This crate provides:
//! - Unified error types (`TesseraError`, `TesseraResult`)
//! - An injectable randomness service (`RandomSource`)
//!
//! # Examples
//!
//! ```
//! use tessera_platform::{TesseraError, TesseraResult};
//!
//! fn example_function() -> TesseraResult<String> {
//!     Ok("Hello, Tessera!".to_string())
//! }
//!
//! # fn main() -> TesseraResult<()> {
//! let result = example_function()?;
//! assert_eq!(result, "Hello, Tessera!");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;
pub mod random;

pub use error::{AuthError, ChannelError, TesseraError, TesseraResult};
pub use random::{RandomSource, SystemRandomSource};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
