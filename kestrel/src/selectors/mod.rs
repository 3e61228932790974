//! Selector compilation and live reload.
//!
//! A policy attachment carries an ordered list of selectors (OR-ed
//! alternatives). Each selector compiles into a fixed-layout record the
//! kernel matcher walks on every intercepted call: a PID descriptor plus
//! argument descriptors, AND-ed together. The records for one attachment
//! are packed into a blob that is published into the attachment's live
//! map configuration without detaching the program: the candidate blob is
//! written to the inactive slot of a two-slot region and a single index
//! flip makes it visible.
//!
//! Large value sets go through auxiliary membership tables keyed by a
//! content hash, so kernel-side evaluation stays a single lookup and
//! identical filters reuse storage across reloads. Tables referenced by a
//! superseded blob are retired one generation late, after the replacing
//! publish is confirmed.

pub(crate) mod arg_filter;
pub(crate) mod compiler;
pub(crate) mod encode;
pub(crate) mod matcher;
pub(crate) mod ops;
pub(crate) mod pid_filter;
pub(crate) mod reload;
pub(crate) mod tables;

#[cfg(test)]
pub(crate) mod testutil;
