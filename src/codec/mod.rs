//! Intermediate-file codecs: the sorted-file container that is the
//! wire-compatible hand-off between stages, the plain-text
//! split-alignment reader used by the very first (source) stage, and the
//! binary sequence-file reader for sources that are already record-oriented.

pub mod plain_text;
pub mod sequence_file;
pub mod sort_file;
