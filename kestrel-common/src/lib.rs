#![cfg_attr(not(feature = "user"), no_std)]

pub mod models;
pub mod selectors;
pub mod utils;

pub use models::KsEvent;

/// Maximum number of alternative selectors per attachment point.
pub const SELECTORS_MAX: usize = 8;

/// Maximum argument filters within one selector.
pub const ARGS_PER_SELECTOR: usize = 5;

/// PID values stored inline in a descriptor. Larger sets go to a value table.
pub const PIDS_INLINE_MAX: usize = 4;

/// Literal values stored inline in an argument descriptor. Larger sets must
/// use table-backed membership so the kernel side stays O(1) per value set.
pub const VALUES_INLINE_MAX: usize = 4;

/// Maximum length of a string literal in a selector.
pub const STR_VAL_LEN: usize = 64;

/// Leading tag of a valid selector record. A zero tag terminates the blob.
pub const SELECTOR_TAG: u32 = 0x4b53_454c;

/// Config slots per attachment. Publishing writes the inactive slot and then
/// flips the active index, so a blob-sized write never has to be atomic.
pub const BLOB_SLOTS: u32 = 2;
