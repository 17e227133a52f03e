//! Segment Craft: fabrication of procedurally composed music, one segment at a time.
//!
//! A chain of segments is grown from a library of programs and instruments.
//! Each segment is crafted by a `Fabricator`: the macro/main structure is
//! chosen first by a segment-type state machine, then rhythm and detail
//! layers are arranged into time-stamped picks for a downstream mixer.

pub mod core;
pub mod schema;
