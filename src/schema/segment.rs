use serde::{Deserialize, Serialize};

use super::content::{
    AudioId, BindingId, EventId, InstrumentId, InstrumentType, ProgramId, ProgramType, VoiceId,
};

id_type!(ChainId);
id_type!(SegmentId);
id_type!(ChoiceId);
id_type!(ArrangementId);
id_type!(PickId);
id_type!(SegmentChordId);
id_type!(VoicingId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChainType {
    Production,
    Preview,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChainState {
    Draft,
    Fabricate,
    Complete,
    Failed,
}

/// An ordered, append-only stream of segments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chain {
    pub id: ChainId,
    pub name: String,
    pub chain_type: ChainType,
    pub state: ChainState,
    /// Programs bound directly to this chain; they win selection by a large margin.
    #[serde(default)]
    pub bound_programs: Vec<ProgramId>,
    #[serde(default)]
    pub bound_instruments: Vec<InstrumentId>,
}

impl Chain {
    pub fn new(id: ChainId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            chain_type: ChainType::Production,
            state: ChainState::Fabricate,
            bound_programs: Vec::new(),
            bound_instruments: Vec::new(),
        }
    }

    pub fn is_program_bound(&self, id: ProgramId) -> bool {
        self.bound_programs.contains(&id)
    }

    pub fn is_instrument_bound(&self, id: InstrumentId) -> bool {
        self.bound_instruments.contains(&id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegmentType {
    /// Not yet determined.
    Pending,
    Initial,
    Continue,
    NextMain,
    NextMacro,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegmentState {
    Planned,
    Crafting,
    Crafted,
    Dubbing,
    Dubbed,
    Failed,
}

/// One fabricated unit of music.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: SegmentId,
    pub chain_id: ChainId,
    pub offset: u64,
    pub segment_type: SegmentType,
    pub state: SegmentState,
    /// Seconds since the start of the chain.
    pub begin_at: f64,
    pub end_at: Option<f64>,
    pub key: Option<String>,
    /// Length in beats.
    pub total: u32,
    /// Beats of the main sequence already played by earlier segments.
    pub delta: u32,
    pub density: f64,
    pub tempo: f64,
    pub output_key: String,
}

impl Segment {
    pub fn planned(id: SegmentId, chain_id: ChainId, offset: u64, begin_at: f64) -> Self {
        Self {
            id,
            chain_id,
            offset,
            segment_type: SegmentType::Pending,
            state: SegmentState::Planned,
            begin_at,
            end_at: None,
            key: None,
            total: 0,
            delta: 0,
            density: 0.0,
            tempo: 0.0,
            output_key: String::new(),
        }
    }
}

/// A program chosen for one slot of a segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentChoice {
    pub id: ChoiceId,
    pub segment_id: SegmentId,
    pub program_id: ProgramId,
    pub program_type: ProgramType,
    pub binding_id: Option<BindingId>,
    /// Voicing type this choice fills, for chord-voiced layers.
    pub instrument_type: Option<InstrumentType>,
    pub transpose: i32,
    pub delta_in: Option<u32>,
    pub delta_out: Option<u32>,
}

impl SegmentChoice {
    /// A choice not yet added to a segment; ids are assigned on add.
    pub fn new(program_id: ProgramId, program_type: ProgramType) -> Self {
        Self {
            id: ChoiceId(0),
            segment_id: SegmentId(0),
            program_id,
            program_type,
            binding_id: None,
            instrument_type: None,
            transpose: 0,
            delta_in: None,
            delta_out: None,
        }
    }
}

/// Binds a choice's voice to an instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentChoiceArrangement {
    pub id: ArrangementId,
    pub segment_id: SegmentId,
    pub choice_id: ChoiceId,
    pub voice_id: VoiceId,
    pub instrument_id: InstrumentId,
}

/// One scheduled sound event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentChoiceArrangementPick {
    pub id: PickId,
    pub segment_id: SegmentId,
    pub arrangement_id: ArrangementId,
    pub event_id: EventId,
    pub audio_id: AudioId,
    /// Track name of the source event.
    pub track: String,
    /// Seconds from segment start.
    pub start: f64,
    pub length: f64,
    pub amplitude: f64,
    /// Final note name, or "X" when atonal.
    pub tones: String,
    pub pitch_hz: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentMeme {
    pub segment_id: SegmentId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentChord {
    pub id: SegmentChordId,
    pub segment_id: SegmentId,
    pub position: f64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentChordVoicing {
    pub id: VoicingId,
    pub segment_id: SegmentId,
    pub chord_id: SegmentChordId,
    pub instrument_type: InstrumentType,
    pub notes: String,
}

/// A segment plus everything crafted for it; the unit of persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentGraph {
    pub segment: Segment,
    pub choices: Vec<SegmentChoice>,
    pub arrangements: Vec<SegmentChoiceArrangement>,
    pub picks: Vec<SegmentChoiceArrangementPick>,
    pub memes: Vec<SegmentMeme>,
    pub chords: Vec<SegmentChord>,
    pub voicings: Vec<SegmentChordVoicing>,
}

impl SegmentGraph {
    pub fn new(segment: Segment) -> Self {
        Self {
            segment,
            choices: Vec::new(),
            arrangements: Vec::new(),
            picks: Vec::new(),
            memes: Vec::new(),
            chords: Vec::new(),
            voicings: Vec::new(),
        }
    }

    pub fn choice(&self, id: ChoiceId) -> Option<&SegmentChoice> {
        self.choices.iter().find(|c| c.id == id)
    }

    pub fn choice_of(&self, program_type: ProgramType) -> Option<&SegmentChoice> {
        self.choices.iter().find(|c| c.program_type == program_type)
    }

    pub fn macro_choice(&self) -> Option<&SegmentChoice> {
        self.choice_of(ProgramType::Macro)
    }

    pub fn main_choice(&self) -> Option<&SegmentChoice> {
        self.choice_of(ProgramType::Main)
    }

    pub fn arrangement(&self, id: ArrangementId) -> Option<&SegmentChoiceArrangement> {
        self.arrangements.iter().find(|a| a.id == id)
    }

    pub fn picks_of(
        &self,
        arrangement: ArrangementId,
    ) -> impl Iterator<Item = &SegmentChoiceArrangementPick> {
        self.picks
            .iter()
            .filter(move |p| p.arrangement_id == arrangement)
    }

    pub fn meme_names(&self) -> Vec<&str> {
        self.memes.iter().map(|m| m.name.as_str()).collect()
    }

    /// Latest chord at or before `position`.
    pub fn chord_at(&self, position: f64) -> Option<&SegmentChord> {
        self.chords
            .iter()
            .filter(|c| c.position <= position)
            .max_by(|a, b| a.position.total_cmp(&b.position))
    }

    pub fn voicing(
        &self,
        chord: SegmentChordId,
        instrument_type: InstrumentType,
    ) -> Option<&SegmentChordVoicing> {
        self.voicings
            .iter()
            .find(|v| v.chord_id == chord && v.instrument_type == instrument_type)
    }
}
