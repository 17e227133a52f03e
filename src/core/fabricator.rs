/// The per-segment fabrication context.
///
/// A `Fabricator` owns the segment being crafted, the in-progress graph of
/// choices, arrangements and picks, and every cache craft relies on. Craft
/// functions borrow it mutably; library content is borrowed from the shared
/// snapshot for the fabricator's whole lifetime.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::core::config::FabricationConfig;
use crate::core::digest::{ChordMarkovDigest, DigestCache};
use crate::core::error::{
    FabricationError, FatalError, FatalKind, MissingContent, Slot, ValidationError,
    ValidationKind,
};
use crate::core::music::{parse_notes, Note, Tuning};
use crate::core::scoring::{normalize_meme, normally_around, EntityScorePicker, MemeIsometry};
use crate::core::store::SegmentStore;
use crate::core::time::TempoRamp;
use crate::schema::content::{
    AudioId, BindingId, InstrumentId, InstrumentType, Pattern, PatternId, PatternType,
    ProgramId, ProgramType, Sequence, SequenceBinding, SequenceId, SourceMaterial, VoiceId,
};
use crate::schema::segment::{
    ArrangementId, Chain, ChoiceId, PickId, Segment, SegmentChoice, SegmentChoiceArrangement,
    SegmentChoiceArrangementPick, SegmentChord, SegmentChordId, SegmentChordVoicing,
    SegmentGraph, SegmentId, SegmentMeme, SegmentState, SegmentType, VoicingId,
};

/// Container format of the rendered segment audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Wav,
    Flac,
    Ogg,
    Mp3,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Flac => "flac",
            Self::Ogg => "ogg",
            Self::Mp3 => "mp3",
        }
    }
}

/// What a completed fabrication hands back: the persisted graph and every
/// slot that was skipped along the way.
#[derive(Debug, Clone)]
pub struct FabricationReport {
    pub graph: SegmentGraph,
    pub diagnostics: Vec<MissingContent>,
}

/// Segment structure established by macro/main craft.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentStructure {
    pub key: String,
    pub total: u32,
    pub delta: u32,
    pub density: f64,
    pub tempo: f64,
}

pub fn voice_track_key(voice: VoiceId, track: &str) -> String {
    format!("{}_{}", voice, track)
}

pub fn voice_note_key(voice: VoiceId, note: &str) -> String {
    format!("{}_{}", voice, note)
}

fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

pub struct Fabricator<'a> {
    source: &'a SourceMaterial,
    config: &'a FabricationConfig,
    digests: &'a DigestCache,
    chain: Chain,
    graph: SegmentGraph,
    /// Crafted graphs of earlier segments, newest first.
    previous: Vec<SegmentGraph>,
    rng: StdRng,
    tuning: Tuning,
    diagnostics: Vec<MissingContent>,
    id_counter: u64,
    segment_type: Option<SegmentType>,
    voicing_types: Option<Vec<InstrumentType>>,
    bindings_at_offset: HashMap<(ProgramId, u32), Option<BindingId>>,
    patterns: HashMap<(SequenceId, VoiceId, PatternType), Option<PatternId>>,
    pitches: HashMap<Note, f64>,
    audio_by_voice_track: HashMap<String, AudioId>,
    audio_by_voice_note: HashMap<String, AudioId>,
    previous_audio: Option<HashMap<String, AudioId>>,
    tempo_ramp: Option<TempoRamp>,
}

impl<'a> Fabricator<'a> {
    /// Load the segment, its chain and its predecessors, ready for craft.
    ///
    /// Fails without touching the segment when anything cannot be loaded.
    pub fn create(
        source: &'a SourceMaterial,
        store: &dyn SegmentStore,
        segment_id: SegmentId,
        output_format: OutputFormat,
        config: &'a FabricationConfig,
        digests: &'a DigestCache,
        seed: u64,
    ) -> Result<Self, FatalError> {
        let fatal = |kind| FatalError::new(kind, segment_id);

        config
            .validate()
            .map_err(|e| fatal(FatalKind::InvalidConfig(e.to_string())))?;
        let tuning = Tuning::at_a4(config.tuning_a4_hz)
            .map_err(|e| fatal(FatalKind::InvalidConfig(e.to_string())))?;

        let mut segment = store
            .segment(segment_id)
            .map_err(|e| fatal(FatalKind::SegmentNotFound(e)))?;
        if !matches!(segment.state, SegmentState::Planned | SegmentState::Failed) {
            return Err(fatal(FatalKind::NotPlanned(segment.state)));
        }
        let chain = store
            .chain(segment.chain_id)
            .map_err(|e| fatal(FatalKind::ChainNotFound(segment.chain_id, e)))?;
        let previous = store
            .previous(chain.id, segment.offset, config.previous_segment_limit.max(1))
            .map_err(|e| fatal(FatalKind::Store(e)))?;
        if segment.offset > 0
            && previous.first().map(|g| g.segment.offset) != Some(segment.offset - 1)
        {
            return Err(fatal(FatalKind::ContentNotFound(format!(
                "crafted segment at offset {}",
                segment.offset - 1
            ))));
        }

        segment.output_key = format!(
            "{}-{}.{}",
            slug(&chain.name),
            segment.offset,
            output_format.extension()
        );

        info!(
            segment = %segment.id,
            chain = %chain.id,
            offset = segment.offset,
            previous = previous.len(),
            "fabricator created"
        );

        Ok(Self {
            source,
            config,
            digests,
            chain,
            graph: SegmentGraph::new(segment),
            previous,
            rng: StdRng::seed_from_u64(seed),
            tuning,
            diagnostics: Vec::new(),
            id_counter: 0,
            segment_type: None,
            voicing_types: None,
            bindings_at_offset: HashMap::new(),
            patterns: HashMap::new(),
            pitches: HashMap::new(),
            audio_by_voice_track: HashMap::new(),
            audio_by_voice_note: HashMap::new(),
            previous_audio: None,
            tempo_ramp: None,
        })
    }

    pub fn source(&self) -> &'a SourceMaterial {
        self.source
    }

    pub fn config(&self) -> &'a FabricationConfig {
        self.config
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn segment(&self) -> &Segment {
        &self.graph.segment
    }

    pub fn segment_id(&self) -> SegmentId {
        self.graph.segment.id
    }

    pub fn graph(&self) -> &SegmentGraph {
        &self.graph
    }

    pub fn diagnostics(&self) -> &[MissingContent] {
        &self.diagnostics
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    pub fn entropy(&mut self, sigma: f64) -> f64 {
        normally_around(&mut self.rng, 0.0, sigma)
    }

    pub fn chord_markov(&self) -> Arc<ChordMarkovDigest> {
        self.digests.chord_markov(self.source, self.config.markov_order)
    }

    // ---------------------------------------------------------------------
    // Segment type
    // ---------------------------------------------------------------------

    /// Type of this segment, computed once from the previous segment.
    pub fn segment_type(&mut self) -> SegmentType {
        if let Some(t) = self.segment_type {
            return t;
        }
        let t = self.compute_type();
        debug!(segment = %self.segment_id(), segment_type = ?t, "segment type");
        self.segment_type = Some(t);
        t
    }

    fn compute_type(&self) -> SegmentType {
        if self.graph.segment.offset == 0 {
            return SegmentType::Initial;
        }
        let Some(prev) = self.previous.first() else {
            return SegmentType::Initial;
        };

        // Beats left in the previous main sequence
        if let Some(main) = prev.main_choice() {
            let sequence = main
                .binding_id
                .and_then(|b| self.source.bound_sequence(main.program_id, b));
            if let Some((_, _, sequence)) = sequence {
                let consumed = prev.segment.delta + prev.segment.total;
                if sequence.total > consumed {
                    return SegmentType::Continue;
                }
            }
        }

        let Some(macro_choice) = prev.macro_choice() else {
            return SegmentType::NextMacro;
        };
        let remaining = macro_choice
            .binding_id
            .and_then(|b| self.source.bound_sequence(macro_choice.program_id, b))
            .map(|(program, binding, _)| program.offsets_after(binding.offset))
            .unwrap_or(0);
        if remaining >= 2 {
            SegmentType::NextMain
        } else {
            SegmentType::NextMacro
        }
    }

    // ---------------------------------------------------------------------
    // Previous segments
    // ---------------------------------------------------------------------

    pub fn previous_segment(&self) -> Option<&SegmentGraph> {
        self.previous.first()
    }

    pub fn previous_segments(&self) -> &[SegmentGraph] {
        &self.previous
    }

    pub fn previous_choice(&self, program_type: ProgramType) -> Option<&SegmentChoice> {
        self.previous.first()?.choice_of(program_type)
    }

    /// Choice that filled this layer slot in the nearest previous segment
    /// still playing the current main program.
    pub fn previous_layer_choice(
        &self,
        program_type: ProgramType,
        instrument_type: Option<InstrumentType>,
    ) -> Option<&SegmentChoice> {
        let main = self.graph.main_choice()?.program_id;
        for prev in &self.previous {
            if prev.main_choice().map(|c| c.program_id) != Some(main) {
                break;
            }
            let found = prev.choices.iter().find(|c| {
                c.program_type == program_type && c.instrument_type == instrument_type
            });
            if found.is_some() {
                return found;
            }
        }
        None
    }

    pub fn previous_layer_program(
        &self,
        program_type: ProgramType,
        instrument_type: Option<InstrumentType>,
    ) -> Option<ProgramId> {
        self.previous_layer_choice(program_type, instrument_type)
            .map(|c| c.program_id)
    }

    /// Instrument most recently arranged for this voice.
    pub fn previous_voice_instrument(&self, voice: VoiceId) -> Option<InstrumentId> {
        self.previous.iter().find_map(|g| {
            g.arrangements
                .iter()
                .find(|a| a.voice_id == voice)
                .map(|a| a.instrument_id)
        })
    }

    /// Memes of a graph's Macro and Main programs and bindings, as one key.
    pub fn structure_constellation(&self, graph: &SegmentGraph) -> String {
        let mut memes: Vec<&str> = Vec::new();
        for choice in graph.choices.iter().filter(|c| c.program_type.is_structural()) {
            let Some(program) = self.source.program(choice.program_id) else {
                continue;
            };
            memes.extend(program.memes.iter().map(String::as_str));
            if let Some(binding) = choice.binding_id.and_then(|b| program.binding(b)) {
                memes.extend(binding.memes.iter().map(String::as_str));
            }
        }
        MemeIsometry::of(memes).constellation()
    }

    /// Audio picked per voice and track in previous segments whose structure
    /// carried exactly this segment's structure memes. Built once, after
    /// macro/main craft.
    pub fn previous_instrument_audio(&mut self) -> &HashMap<String, AudioId> {
        if self.previous_audio.is_none() {
            let constellation = self.structure_constellation(&self.graph);
            let mut map = HashMap::new();
            for prev in &self.previous {
                if self.structure_constellation(prev) != constellation {
                    continue;
                }
                for pick in &prev.picks {
                    if let Some(arrangement) = prev.arrangement(pick.arrangement_id) {
                        map.entry(voice_track_key(arrangement.voice_id, &pick.track))
                            .or_insert(pick.audio_id);
                    }
                }
            }
            debug!(
                segment = %self.segment_id(),
                constellation = %constellation,
                entries = map.len(),
                "previous instrument audio"
            );
            self.previous_audio = Some(map);
        }
        self.previous_audio.get_or_insert_with(HashMap::new)
    }

    // ---------------------------------------------------------------------
    // Content lookups
    // ---------------------------------------------------------------------

    /// Binding of `program` at `offset`; several bindings at one offset are
    /// decided once by entropy.
    pub fn binding_at_offset(
        &mut self,
        program: ProgramId,
        offset: u32,
    ) -> Option<&'a SequenceBinding> {
        let source = self.source;
        let program_ref = source.program(program)?;
        if let Some(&cached) = self.bindings_at_offset.get(&(program, offset)) {
            return cached.and_then(|id| program_ref.binding(id));
        }
        let sigma = self.config.scoring.entropy_sigma;
        let mut picker = EntityScorePicker::new();
        for binding in program_ref.bindings_at(offset) {
            let score = self.entropy(sigma);
            picker.score(binding.id, score);
        }
        let chosen = picker.get_top();
        self.bindings_at_offset.insert((program, offset), chosen);
        chosen.and_then(|id| program_ref.binding(id))
    }

    pub fn sequence_at_offset(&mut self, program: ProgramId, offset: u32) -> Option<&'a Sequence> {
        let binding = self.binding_at_offset(program, offset)?;
        self.source.program(program)?.sequence(binding.sequence_id)
    }

    /// Sequence a choice plays: its bound sequence, else the program's first
    /// binding, else its first sequence.
    pub fn sequence_of(&mut self, choice: &SegmentChoice) -> Option<&'a Sequence> {
        let source = self.source;
        let program = source.program(choice.program_id)?;
        if let Some(binding) = choice.binding_id.and_then(|b| program.binding(b)) {
            return program.sequence(binding.sequence_id);
        }
        if let Some(&first) = program.offsets().first() {
            if let Some(sequence) = self.sequence_at_offset(program.id, first) {
                return Some(sequence);
            }
        }
        program.sequences.first()
    }

    /// A pattern of the given type for a voice in a sequence, chosen at
    /// random once; repeat calls return the same pattern.
    pub fn random_pattern(
        &mut self,
        sequence: &'a Sequence,
        voice: VoiceId,
        pattern_type: PatternType,
    ) -> Option<&'a Pattern> {
        let key = (sequence.id, voice, pattern_type);
        if let Some(&cached) = self.patterns.get(&key) {
            return cached.and_then(|id| sequence.patterns.iter().find(|p| p.id == id));
        }
        let candidates = sequence.patterns_for(voice, pattern_type);
        let chosen = candidates.choose(&mut self.rng).map(|p| p.id);
        self.patterns.insert(key, chosen);
        chosen.and_then(|id| sequence.patterns.iter().find(|p| p.id == id))
    }

    /// Instrument types voiced by this segment's chords, computed once the
    /// main choice is in place.
    pub fn distinct_chord_voicing_types(&mut self) -> Vec<InstrumentType> {
        if let Some(types) = &self.voicing_types {
            return types.clone();
        }
        if self.graph.main_choice().is_none() {
            return Vec::new();
        }
        let mut types: Vec<InstrumentType> = self
            .graph
            .voicings
            .iter()
            .filter(|v| !v.notes.trim().is_empty())
            .map(|v| v.instrument_type)
            .collect();
        types.sort();
        types.dedup();
        self.voicing_types = Some(types.clone());
        types
    }

    /// Notes of the voicing sounding at `position` for an instrument type.
    pub fn voicing_notes_at(
        &self,
        position: f64,
        instrument_type: InstrumentType,
    ) -> Result<Vec<Note>, ValidationError> {
        let Some(chord) = self.graph.chord_at(position) else {
            return Ok(Vec::new());
        };
        match self.graph.voicing(chord.id, instrument_type) {
            Some(voicing) => parse_notes(&voicing.notes)
                .map_err(|e| ValidationError::new(e, self.segment_id(), Slot::Segment)),
            None => Ok(Vec::new()),
        }
    }

    pub fn meme_isometry(&self) -> MemeIsometry {
        MemeIsometry::of(self.graph.meme_names())
    }

    // ---------------------------------------------------------------------
    // Stable audio selection
    // ---------------------------------------------------------------------

    pub fn audio_for_voice_track(&self, key: &str) -> Option<AudioId> {
        self.audio_by_voice_track.get(key).copied()
    }

    pub fn remember_voice_track_audio(&mut self, key: String, audio: AudioId) {
        self.audio_by_voice_track.insert(key, audio);
    }

    pub fn audio_for_voice_note(&self, key: &str) -> Option<AudioId> {
        self.audio_by_voice_note.get(key).copied()
    }

    pub fn remember_voice_note_audio(&mut self, key: String, audio: AudioId) {
        self.audio_by_voice_note.insert(key, audio);
    }

    // ---------------------------------------------------------------------
    // Time and pitch
    // ---------------------------------------------------------------------

    /// Seconds from segment start to a beat position, ramping linearly from
    /// the previous segment's tempo to this one's.
    pub fn seconds_at(&mut self, beat: f64) -> Result<f64, ValidationError> {
        if let Some(ramp) = &self.tempo_ramp {
            return Ok(ramp.seconds_at(beat));
        }
        let segment = &self.graph.segment;
        let from = self
            .previous
            .first()
            .map(|p| p.segment.tempo)
            .filter(|t| *t > 0.0)
            .unwrap_or(segment.tempo);
        let ramp = TempoRamp::new(segment.total as f64, from, segment.tempo)
            .map_err(|e| ValidationError::new(e, segment.id, Slot::Segment))?;
        self.tempo_ramp = Some(ramp);
        Ok(ramp.seconds_at(beat))
    }

    pub fn pitch(&mut self, note: &Note) -> f64 {
        let tuning = self.tuning;
        *self
            .pitches
            .entry(*note)
            .or_insert_with(|| tuning.pitch(note))
    }

    // ---------------------------------------------------------------------
    // Mutation
    // ---------------------------------------------------------------------

    fn next_id(&mut self) -> u64 {
        self.id_counter += 1;
        (self.graph.segment.id.0 << 32) | self.id_counter
    }

    fn invalid(&self, kind: impl Into<ValidationKind>, slot: Slot) -> ValidationError {
        ValidationError::new(kind, self.segment_id(), slot)
    }

    pub fn set_structure(&mut self, structure: SegmentStructure) {
        let segment = &mut self.graph.segment;
        segment.key = Some(structure.key);
        segment.total = structure.total;
        segment.delta = structure.delta;
        segment.density = structure.density;
        segment.tempo = structure.tempo;
        self.tempo_ramp = None;
    }

    /// Add a choice; its id and segment are assigned here.
    pub fn add_choice(
        &mut self,
        mut choice: SegmentChoice,
    ) -> Result<SegmentChoice, ValidationError> {
        let slot = Slot::Program(choice.program_type, choice.instrument_type);
        let program = self.source.program(choice.program_id).ok_or_else(|| {
            self.invalid(
                ValidationKind::DanglingReference(format!("program {}", choice.program_id)),
                slot.clone(),
            )
        })?;
        if program.program_type != choice.program_type {
            return Err(self.invalid(
                ValidationKind::Malformed(format!(
                    "program {} is {:?}, not {:?}",
                    program.id, program.program_type, choice.program_type
                )),
                slot,
            ));
        }
        if let Some(binding) = choice.binding_id {
            if program.binding(binding).is_none() {
                return Err(self.invalid(
                    ValidationKind::DanglingReference(format!(
                        "binding {} of program {}",
                        binding, program.id
                    )),
                    slot,
                ));
            }
        }
        if choice.program_type.is_structural()
            && self.graph.choice_of(choice.program_type).is_some()
        {
            return Err(self.invalid(ValidationKind::DuplicateChoice(choice.program_type), slot));
        }

        choice.id = ChoiceId(self.next_id());
        choice.segment_id = self.segment_id();
        debug!(
            segment = %self.segment_id(),
            program = %choice.program_id,
            program_type = ?choice.program_type,
            transpose = choice.transpose,
            "choice added"
        );
        self.graph.choices.push(choice.clone());
        Ok(choice)
    }

    pub fn add_arrangement(
        &mut self,
        mut arrangement: SegmentChoiceArrangement,
    ) -> Result<SegmentChoiceArrangement, ValidationError> {
        let slot = Slot::Instrument(arrangement.voice_id);
        let choice = self.graph.choice(arrangement.choice_id).ok_or_else(|| {
            self.invalid(
                ValidationKind::DanglingReference(format!("choice {}", arrangement.choice_id)),
                slot.clone(),
            )
        })?;
        let voice_known = self
            .source
            .program(choice.program_id)
            .and_then(|p| p.voice(arrangement.voice_id))
            .is_some();
        if !voice_known {
            return Err(self.invalid(
                ValidationKind::DanglingReference(format!("voice {}", arrangement.voice_id)),
                slot,
            ));
        }
        if self.source.instrument(arrangement.instrument_id).is_none() {
            return Err(self.invalid(
                ValidationKind::DanglingReference(format!(
                    "instrument {}",
                    arrangement.instrument_id
                )),
                slot,
            ));
        }

        arrangement.id = ArrangementId(self.next_id());
        arrangement.segment_id = self.segment_id();
        self.graph.arrangements.push(arrangement.clone());
        Ok(arrangement)
    }

    pub fn add_pick(
        &mut self,
        mut pick: SegmentChoiceArrangementPick,
    ) -> Result<PickId, ValidationError> {
        let Some(arrangement) = self.graph.arrangement(pick.arrangement_id) else {
            return Err(self.invalid(
                ValidationKind::DanglingReference(format!("arrangement {}", pick.arrangement_id)),
                Slot::Segment,
            ));
        };
        let voice = arrangement.voice_id;
        if self.source.audio(pick.audio_id).is_none() {
            return Err(self.invalid(
                ValidationKind::DanglingReference(format!("audio {}", pick.audio_id)),
                Slot::Audio(voice, pick.track.clone()),
            ));
        }

        let id = PickId(self.next_id());
        pick.id = id;
        pick.segment_id = self.segment_id();
        self.graph.picks.push(pick);
        Ok(id)
    }

    /// Add a meme to the segment; duplicates and blanks are ignored.
    pub fn add_meme(&mut self, name: &str) {
        let name = normalize_meme(name);
        if name.is_empty() || self.graph.memes.iter().any(|m| m.name == name) {
            return;
        }
        self.graph.memes.push(SegmentMeme {
            segment_id: self.segment_id(),
            name,
        });
    }

    pub fn add_chord(&mut self, position: f64, name: &str) -> SegmentChordId {
        let id = SegmentChordId(self.next_id());
        self.graph.chords.push(SegmentChord {
            id,
            segment_id: self.segment_id(),
            position,
            name: name.to_string(),
        });
        id
    }

    pub fn add_voicing(
        &mut self,
        chord: SegmentChordId,
        instrument_type: InstrumentType,
        notes: &str,
    ) -> Result<VoicingId, ValidationError> {
        if !self.graph.chords.iter().any(|c| c.id == chord) {
            return Err(self.invalid(
                ValidationKind::DanglingReference(format!("chord {}", chord)),
                Slot::Segment,
            ));
        }
        parse_notes(notes).map_err(|e| self.invalid(e, Slot::Segment))?;
        let id = VoicingId(self.next_id());
        self.graph.voicings.push(SegmentChordVoicing {
            id,
            segment_id: self.segment_id(),
            chord_id: chord,
            instrument_type,
            notes: notes.to_string(),
        });
        Ok(id)
    }

    /// Record an unfillable optional slot; craft carries on without it.
    pub fn report_missing(&mut self, missing: MissingContent) {
        warn!(
            segment = %missing.segment,
            slot = %missing.slot,
            candidates = missing.candidates,
            "{}",
            missing.description
        );
        self.diagnostics.push(missing);
    }

    pub fn missing(
        &self,
        slot: Slot,
        candidates: usize,
        description: impl Into<String>,
    ) -> MissingContent {
        MissingContent {
            segment: self.segment_id(),
            slot,
            candidates,
            description: description.into(),
        }
    }

    // ---------------------------------------------------------------------
    // Completion
    // ---------------------------------------------------------------------

    fn validate(&mut self) -> Result<(), ValidationError> {
        let segment_type = self.segment_type();
        let main_candidates = self.source.programs_of(ProgramType::Main).count();
        let macro_candidates = self.source.programs_of(ProgramType::Macro).count();

        for (program_type, candidates) in [
            (ProgramType::Macro, macro_candidates),
            (ProgramType::Main, main_candidates),
        ] {
            let count = self
                .graph
                .choices
                .iter()
                .filter(|c| c.program_type == program_type)
                .count();
            if count > 1 {
                return Err(self.invalid(
                    ValidationKind::DuplicateChoice(program_type),
                    Slot::Program(program_type, None),
                ));
            }
            let required = match program_type {
                ProgramType::Main => true,
                _ => matches!(segment_type, SegmentType::Continue | SegmentType::NextMain),
            };
            if required && count == 0 {
                let mut err = self.invalid(
                    ValidationKind::MissingChoice(program_type),
                    Slot::Program(program_type, None),
                );
                err.candidates = candidates;
                return Err(err);
            }
        }

        if self.graph.segment.total == 0 {
            return Err(self.invalid(
                ValidationKind::Malformed("segment has no length".into()),
                Slot::Segment,
            ));
        }
        for arrangement in &self.graph.arrangements {
            if self.graph.choice(arrangement.choice_id).is_none() {
                return Err(self.invalid(
                    ValidationKind::DanglingReference(format!("choice {}", arrangement.choice_id)),
                    Slot::Instrument(arrangement.voice_id),
                ));
            }
        }
        for pick in &self.graph.picks {
            if self.graph.arrangement(pick.arrangement_id).is_none() {
                return Err(self.invalid(
                    ValidationKind::DanglingReference(format!(
                        "arrangement {}",
                        pick.arrangement_id
                    )),
                    Slot::Segment,
                ));
            }
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), ValidationError> {
        self.validate()?;
        let total = self.graph.segment.total as f64;
        let length = self.seconds_at(total)?;
        let segment_type = self.segment_type();

        let segment = &mut self.graph.segment;
        segment.segment_type = segment_type;
        segment.end_at = Some(segment.begin_at + length);
        segment.state = SegmentState::Crafted;
        self.graph.memes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(())
    }

    /// Validate the crafted graph and hand it to the store.
    ///
    /// On validation failure the segment is marked Failed and nothing is
    /// persisted.
    pub fn done(
        mut self,
        store: &mut dyn SegmentStore,
    ) -> Result<FabricationReport, FabricationError> {
        let id = self.segment_id();
        if let Err(e) = self.finish() {
            mark_failed(store, id, &e.to_string());
            return Err(e.into());
        }

        store
            .persist(self.graph.clone())
            .map_err(|e| FatalError::new(FatalKind::Store(e), id))?;

        info!(
            segment = %id,
            offset = self.graph.segment.offset,
            segment_type = ?self.graph.segment.segment_type,
            choices = self.graph.choices.len(),
            picks = self.graph.picks.len(),
            skipped = self.diagnostics.len(),
            "segment crafted"
        );
        Ok(FabricationReport {
            graph: self.graph,
            diagnostics: self.diagnostics,
        })
    }
}

/// Transition a segment to Failed after an aborted craft.
pub fn mark_failed(store: &mut dyn SegmentStore, id: SegmentId, reason: &str) {
    error!(segment = %id, reason, "segment failed");
    if let Err(e) = store.set_state(id, SegmentState::Failed) {
        warn!(segment = %id, error = %e, "could not mark segment failed");
    }
}
