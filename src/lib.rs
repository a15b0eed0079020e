//! nxdump - dumping and repackaging of Nintendo Switch gamecard and
//! installed title content.
//!
//! The crate covers the content-crypto and container pipeline: key vault
//! assembly from process memory, the seal service and an external key
//! file; hotplug-aware raw cartridge access with normal/secure area
//! routing; the hash-indexed and plain partition filesystems; content
//! archives with per-section crypto (including BKTR patch relocation);
//! content-metadata parsing; ticket-based titlekey recovery; and an
//! extraction driver that emits installable packages with re-signed
//! program archives.
//!
//! Platform services (process debugging, spl:crypto, calibration, ES
//! ticket state, the raw card transport) are traits implemented by the
//! embedder; nothing in here talks to the horizon OS directly.

pub mod crypto;
pub mod dump;
pub mod error;
pub mod formats;
pub mod gamecard;
pub mod io;
pub mod keys;
pub mod title;
pub mod util;
pub mod version;

pub use error::Error;
