//! Platform abstraction layer for cross-platform compatibility.
//!
//! This module centralizes the OS-specific pieces of the content store so
//! that `#[cfg]` blocks do not leak into the store and fetcher modules.
//!
//! - `atomic` - temp-file-then-rename writes for refs and metadata
//! - `disk` - free space on the volume holding a path
//! - `links` - snapshot links with hardlink/copy fallback

pub mod atomic;
pub mod disk;
pub mod links;

pub use atomic::{atomic_read_json, atomic_write, atomic_write_json};
pub use disk::available_space;
pub use links::{link_blob, link_dir, LinkType};
