//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports the [`secrecy`] types used for TURN credentials and any other
//! value that must never show up in `{:?}` output or tracing fields.
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct TurnServer {
//!     url: String,
//!     credential: SecretString,
//! }
//!
//! let server = TurnServer {
//!     url: "turn:turn.example.org:443".to_string(),
//!     credential: SecretString::from("s3cret"),
//! };
//!
//! assert!(!format!("{server:?}").contains("s3cret"));
//! assert_eq!(server.credential.expose_secret(), "s3cret");
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};
