//! # ksef-pdf-bridge – C-callable bridge to the KSeF PDF generator
//!
//! Rendering is done by an external executable (`ksef-pdf-generator`). This
//! crate launches it, feeds it the source XML either as a file path or as
//! raw bytes on stdin, captures its output and reports the result to native
//! callers. The layers are:
//!
//! 1. **Run** – launch one child with piped stdio and collect everything it
//!    prints ([`runner`])
//! 2. **Locate** – find the generator executable on disk ([`locator`])
//! 3. **Bridge** – validate input, build generator arguments, interpret the
//!    child's result ([`bridge`])
//! 4. **Export** – C ABI entry points and buffer ownership ([`ffi`])
//!
//! Configuration lives in [`config`] and the error taxonomy in [`error`].

pub mod bridge;
pub mod config;
pub mod error;
pub mod ffi;
pub mod locator;
pub mod runner;

// Re-exports for convenience
pub use bridge::{Artifact, Bridge, DocumentKind, InvoiceParams, OperationOutcome};
pub use config::BridgeConfig;
pub use error::{BridgeError, LaunchError};
pub use runner::{ChildInvocation, ChildResult, ProcessRunner};
