/// Fabrication failures and diagnostics.
///
/// `FatalError` aborts before anything changes; `ValidationError` aborts and
/// fails the segment; `MissingContent` is only reported and the slot skipped.
/// All three carry the segment, the slot being filled and how many
/// candidates were considered.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::core::music::MusicError;
use crate::core::store::StoreError;
use crate::core::time::TimeError;
use crate::schema::content::{InstrumentType, ProgramType, VoiceId};
use crate::schema::segment::{ChainId, SegmentId, SegmentState};

/// The part of a segment being filled when something went wrong.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Slot {
    Segment,
    Program(ProgramType, Option<InstrumentType>),
    Instrument(VoiceId),
    Audio(VoiceId, String),
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Segment => f.write_str("segment"),
            Self::Program(t, None) => write!(f, "{:?} program", t),
            Self::Program(t, Some(i)) => write!(f, "{:?} program for {:?}", t, i),
            Self::Instrument(voice) => write!(f, "instrument for voice {}", voice),
            Self::Audio(voice, key) => write!(f, "audio for voice {} ({})", voice, key),
        }
    }
}

#[derive(Debug, Error)]
pub enum FatalKind {
    #[error("segment could not be loaded: {0}")]
    SegmentNotFound(#[source] StoreError),
    #[error("chain {0} could not be loaded: {1}")]
    ChainNotFound(ChainId, #[source] StoreError),
    #[error("segment is {0:?}; only Planned or Failed segments can be fabricated")]
    NotPlanned(SegmentState),
    #[error("content not found: {0}")]
    ContentNotFound(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
}

/// Fabrication cannot start or cannot be handed off; the segment is untouched.
#[derive(Debug, Error)]
#[error("{kind} [segment {segment}, {slot}, {candidates} candidates]")]
pub struct FatalError {
    pub kind: FatalKind,
    pub segment: SegmentId,
    pub slot: Slot,
    pub candidates: usize,
}

impl FatalError {
    pub fn new(kind: FatalKind, segment: SegmentId) -> Self {
        Self {
            kind,
            segment,
            slot: Slot::Segment,
            candidates: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum ValidationKind {
    #[error("required {0:?} choice is missing")]
    MissingChoice(ProgramType),
    #[error("more than one {0:?} choice")]
    DuplicateChoice(ProgramType),
    #[error("reference to missing {0}")]
    DanglingReference(String),
    #[error("malformed music: {0}")]
    Music(#[from] MusicError),
    #[error("bad timing: {0}")]
    Time(#[from] TimeError),
    #[error("{0}")]
    Malformed(String),
}

/// The crafted graph is inconsistent; the segment is marked Failed.
#[derive(Debug, Error)]
#[error("{kind} [segment {segment}, {slot}, {candidates} candidates]")]
pub struct ValidationError {
    pub kind: ValidationKind,
    pub segment: SegmentId,
    pub slot: Slot,
    pub candidates: usize,
}

impl ValidationError {
    pub fn new(kind: impl Into<ValidationKind>, segment: SegmentId, slot: Slot) -> Self {
        Self {
            kind: kind.into(),
            segment,
            slot,
            candidates: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum FabricationError {
    #[error("fatal: {0}")]
    Fatal(#[from] FatalError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
}

impl FabricationError {
    pub fn segment(&self) -> SegmentId {
        match self {
            Self::Fatal(e) => e.segment,
            Self::Validation(e) => e.segment,
        }
    }
}

/// A slot that could not be filled; craft skips it and carries on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissingContent {
    pub segment: SegmentId,
    pub slot: Slot,
    pub candidates: usize,
    pub description: String,
}

impl fmt::Display for MissingContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "missing {} in segment {} ({} candidates): {}",
            self.slot, self.segment, self.candidates, self.description
        )
    }
}

/// Result of one craft decision.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Chosen(T),
    Skipped(MissingContent),
}

impl<T> Outcome<T> {
    pub fn chosen(self) -> Option<T> {
        match self {
            Self::Chosen(t) => Some(t),
            Self::Skipped(_) => None,
        }
    }
}
