//! Secret types for values that must never reach a log line.
//!
//! Re-exports the [`secrecy`] types. The harness handles one secret of its own,
//! the default keystore password handed to the key generation script, and it
//! is only exposed at the point where the shell command is assembled.
//!
//! ```rust
//! use helm_harness::secret::{ExposeSecret, SecretString};
//!
//! let password = SecretString::from("Changeme!");
//! assert!(!format!("{password:?}").contains("Changeme!"));
//! assert_eq!(password.expose_secret(), "Changeme!");
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};
