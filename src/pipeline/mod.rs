//! Pipeline stages between the month listing and the batch driver.
//!
//! ## Data Flow
//!
//! ```text
//! source ──▶ prefetch ──▶ invoke ──▶ images
//! (list/GET)  (bounded)   (engine)   (upload + rewrite)
//! ```
//!
//! 1. [`source`]: list a month's PDFs and fetch one into a file
//! 2. [`prefetch`]: keep a bounded window of downloads ahead of conversion,
//!    yielding papers in enumeration order
//! 3. [`invoke`]: run the conversion engine in a child process with a hard
//!    deadline; the only stage that spawns processes
//! 4. [`images`]: JPEG re-encode figures, upload them, point the Markdown at
//!    the public URLs

pub mod images;
pub mod invoke;
pub mod prefetch;
pub mod source;
