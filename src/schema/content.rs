use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::core::music::{Key, MusicError};

id_type!(
    /// Identifies a program in the library.
    ProgramId
);
id_type!(SequenceId);
id_type!(BindingId);
id_type!(PatternId);
id_type!(VoiceId);
id_type!(TrackId);
id_type!(EventId);
id_type!(ChordId);
id_type!(InstrumentId);
id_type!(AudioId);

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON deserialization error: {0}")]
    Ron(#[from] ron::error::SpannedError),
}

/// What a program contributes to a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ProgramType {
    Macro,
    Main,
    Rhythm,
    Detail,
    Beat,
}

impl ProgramType {
    /// Macro and Main programs shape the segment rather than sound in it.
    pub fn is_structural(self) -> bool {
        matches!(self, Self::Macro | Self::Main)
    }
}

/// Instrument category, also used to type chord voicings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InstrumentType {
    Drum,
    Percussion,
    Bass,
    Pad,
    Sticky,
    Stripe,
    Stab,
}

impl InstrumentType {
    pub fn is_tonal(self) -> bool {
        !matches!(self, Self::Drum | Self::Percussion)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PatternType {
    Intro,
    Loop,
    Outro,
}

fn default_true() -> bool {
    true
}

fn default_density() -> f64 {
    0.5
}

fn default_velocity() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramConfig {
    /// Transpose this program to follow the segment's key.
    #[serde(default = "default_true")]
    pub do_transpose: bool,
    /// Restart the intro/loop/outro cycle at every chord change.
    #[serde(default)]
    pub restart_on_chord: bool,
}

impl Default for ProgramConfig {
    fn default() -> Self {
        Self {
            do_transpose: true,
            restart_on_chord: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    pub id: ProgramId,
    pub name: String,
    pub program_type: ProgramType,
    pub key: String,
    pub tempo: f64,
    #[serde(default = "default_density")]
    pub density: f64,
    #[serde(default)]
    pub memes: Vec<String>,
    #[serde(default)]
    pub config: ProgramConfig,
    #[serde(default)]
    pub sequences: Vec<Sequence>,
    #[serde(default)]
    pub bindings: Vec<SequenceBinding>,
    #[serde(default)]
    pub voices: Vec<ProgramVoice>,
}

impl Program {
    pub fn parsed_key(&self) -> Result<Key, MusicError> {
        self.key.parse()
    }

    pub fn sequence(&self, id: SequenceId) -> Option<&Sequence> {
        self.sequences.iter().find(|s| s.id == id)
    }

    pub fn binding(&self, id: BindingId) -> Option<&SequenceBinding> {
        self.bindings.iter().find(|b| b.id == id)
    }

    pub fn voice(&self, id: VoiceId) -> Option<&ProgramVoice> {
        self.voices.iter().find(|v| v.id == id)
    }

    /// Distinct binding offsets, ascending.
    pub fn offsets(&self) -> Vec<u32> {
        let mut offsets: Vec<u32> = self.bindings.iter().map(|b| b.offset).collect();
        offsets.sort_unstable();
        offsets.dedup();
        offsets
    }

    pub fn bindings_at(&self, offset: u32) -> Vec<&SequenceBinding> {
        self.bindings.iter().filter(|b| b.offset == offset).collect()
    }

    /// Smallest binding offset strictly after `offset`.
    pub fn next_offset(&self, offset: u32) -> Option<u32> {
        self.bindings
            .iter()
            .map(|b| b.offset)
            .filter(|&o| o > offset)
            .min()
    }

    /// How many distinct binding offsets come after `offset`.
    pub fn offsets_after(&self, offset: u32) -> usize {
        self.offsets().into_iter().filter(|&o| o > offset).count()
    }

    /// Memes of the bindings at the lowest offset.
    pub fn first_binding_memes(&self) -> Vec<String> {
        match self.offsets().first() {
            Some(&first) => self
                .bindings_at(first)
                .into_iter()
                .flat_map(|b| b.memes.iter().cloned())
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn has_voice_of(&self, instrument_type: InstrumentType) -> bool {
        self.voices
            .iter()
            .any(|v| v.instrument_type == instrument_type)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequence {
    pub id: SequenceId,
    pub name: String,
    /// Empty means "same as the program".
    #[serde(default)]
    pub key: String,
    pub total: u32,
    #[serde(default = "default_density")]
    pub density: f64,
    #[serde(default)]
    pub tempo: Option<f64>,
    #[serde(default)]
    pub chords: Vec<SequenceChord>,
    #[serde(default)]
    pub patterns: Vec<Pattern>,
}

impl Sequence {
    /// This sequence's key, falling back to its program's.
    pub fn key_or<'a>(&'a self, program: &'a Program) -> &'a str {
        if self.key.trim().is_empty() {
            &program.key
        } else {
            &self.key
        }
    }

    /// Chords ordered by position.
    pub fn sorted_chords(&self) -> Vec<&SequenceChord> {
        let mut chords: Vec<&SequenceChord> = self.chords.iter().collect();
        chords.sort_by(|a, b| a.position.total_cmp(&b.position));
        chords
    }

    pub fn patterns_for(&self, voice: VoiceId, pattern_type: PatternType) -> Vec<&Pattern> {
        self.patterns
            .iter()
            .filter(|p| p.voice_id == voice && p.pattern_type == pattern_type)
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceChord {
    pub id: ChordId,
    pub position: f64,
    pub name: String,
    #[serde(default)]
    pub voicings: Vec<ChordVoicing>,
}

/// Realized pitch classes of a chord for one instrument type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChordVoicing {
    pub instrument_type: InstrumentType,
    pub notes: String,
}

/// Places a sequence at an offset of its program's arc.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceBinding {
    pub id: BindingId,
    pub sequence_id: SequenceId,
    pub offset: u32,
    #[serde(default)]
    pub memes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramVoice {
    pub id: VoiceId,
    pub name: String,
    pub instrument_type: InstrumentType,
    #[serde(default)]
    pub tracks: Vec<Track>,
}

impl ProgramVoice {
    pub fn track(&self, id: TrackId) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub id: TrackId,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub id: PatternId,
    pub voice_id: VoiceId,
    pub pattern_type: PatternType,
    pub total: u32,
    #[serde(default)]
    pub events: Vec<PatternEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternEvent {
    pub id: EventId,
    pub track_id: TrackId,
    pub position: f64,
    pub duration: f64,
    #[serde(default = "default_velocity")]
    pub velocity: f64,
    /// A note such as "Eb3", or "X" for atonal hits.
    pub tones: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub id: InstrumentId,
    pub name: String,
    pub instrument_type: InstrumentType,
    #[serde(default)]
    pub memes: Vec<String>,
    /// Audios are matched by note rather than cached per track.
    #[serde(default)]
    pub multiphonic: bool,
    #[serde(default)]
    pub audios: Vec<InstrumentAudio>,
}

impl Instrument {
    pub fn audio(&self, id: AudioId) -> Option<&InstrumentAudio> {
        self.audios.iter().find(|a| a.id == id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentAudio {
    pub id: AudioId,
    pub name: String,
    #[serde(default)]
    pub events: Vec<AudioEvent>,
}

impl InstrumentAudio {
    /// Tones of the first recorded event, if any.
    pub fn first_tones(&self) -> Option<&str> {
        self.events
            .iter()
            .min_by(|a, b| a.position.total_cmp(&b.position))
            .map(|e| e.tones.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioEvent {
    pub position: f64,
    pub tones: String,
}

/// Immutable snapshot of every program and instrument visible to a chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceMaterial {
    /// Identity of the content scope, used to key digests.
    pub scope: String,
    #[serde(default)]
    pub programs: Vec<Program>,
    #[serde(default)]
    pub instruments: Vec<Instrument>,
}

impl SourceMaterial {
    pub fn parse_ron(input: &str) -> Result<Self, ContentError> {
        Ok(ron::from_str(input)?)
    }

    pub fn load_from_ron(path: &Path) -> Result<Self, ContentError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse_ron(&contents)
    }

    pub fn program(&self, id: ProgramId) -> Option<&Program> {
        self.programs.iter().find(|p| p.id == id)
    }

    pub fn programs_of(&self, program_type: ProgramType) -> impl Iterator<Item = &Program> {
        self.programs
            .iter()
            .filter(move |p| p.program_type == program_type)
    }

    pub fn instrument(&self, id: InstrumentId) -> Option<&Instrument> {
        self.instruments.iter().find(|i| i.id == id)
    }

    pub fn instruments_of(
        &self,
        instrument_type: InstrumentType,
    ) -> impl Iterator<Item = &Instrument> {
        self.instruments
            .iter()
            .filter(move |i| i.instrument_type == instrument_type)
    }

    pub fn audio(&self, id: AudioId) -> Option<(&Instrument, &InstrumentAudio)> {
        self.instruments
            .iter()
            .find_map(|i| i.audio(id).map(|a| (i, a)))
    }

    /// The program and sequence a binding belongs to.
    pub fn bound_sequence(
        &self,
        program: ProgramId,
        binding: BindingId,
    ) -> Option<(&Program, &SequenceBinding, &Sequence)> {
        let program = self.program(program)?;
        let binding = program.binding(binding)?;
        let sequence = program.sequence(binding.sequence_id)?;
        Some((program, binding, sequence))
    }
}
