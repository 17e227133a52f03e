/// Arrangement craft for the layer programs: Rhythm, Detail and Beat.
///
/// Each layer slot gets a program, each of its voices an instrument, and the
/// voice's Intro/Loop/Outro patterns are laid over the segment and turned
/// into picks.

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

use crate::core::digest::{ChordMarkovDigest, ChordNode};
use crate::core::error::{FabricationError, Outcome, Slot, ValidationError, ValidationKind};
use crate::core::fabricator::{voice_note_key, voice_track_key, Fabricator};
use crate::core::music::{Adjustment, Key, Note, ATONAL};
use crate::core::scoring::{normalize_meme, score_candidate, EntityScorePicker};
use crate::schema::content::{
    AudioId, Instrument, InstrumentType, Pattern, PatternEvent, PatternType, Program,
    ProgramType, ProgramVoice, Sequence,
};
use crate::schema::segment::{
    ArrangementId, PickId, SegmentChoice, SegmentChoiceArrangement, SegmentChoiceArrangementPick,
    SegmentId, SegmentType,
};

/// Score added to an audio whose name or first note matches the event.
const AUDIO_MATCH_BONUS: f64 = 100.0;

/// Craft every slot of one layer type.
///
/// Rhythm and Beat fill a single unconditional slot; Detail fills one slot
/// per instrument type voiced by the segment's chords.
pub fn craft_layer(
    fab: &mut Fabricator<'_>,
    program_type: ProgramType,
) -> Result<(), FabricationError> {
    if fab.graph().main_choice().is_none() {
        return Ok(());
    }
    let slots: Vec<Option<InstrumentType>> = match program_type {
        ProgramType::Rhythm | ProgramType::Beat => vec![None],
        ProgramType::Detail => fab
            .distinct_chord_voicing_types()
            .into_iter()
            .map(Some)
            .collect(),
        ProgramType::Macro | ProgramType::Main => return Ok(()),
    };

    let windows = layer_windows(fab, program_type, &slots);
    for (instrument_type, window) in slots.into_iter().zip(windows) {
        match choose_program(fab, program_type, instrument_type, window)? {
            Outcome::Chosen(choice) => arrange_choice(fab, &choice)?,
            Outcome::Skipped(missing) => fab.report_missing(missing),
        }
    }
    Ok(())
}

/// Beats of the main program's run a layer choice sounds in, counted from
/// the start of the run. Open ends are `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Window {
    delta_in: Option<u32>,
    delta_out: Option<u32>,
}

impl Window {
    fn of(choice: &SegmentChoice) -> Self {
        Self {
            delta_in: choice.delta_in,
            delta_out: choice.delta_out,
        }
    }

    /// Gain of an event `position` beats into a segment that starts `delta`
    /// beats into the run, or `None` while the layer is silent. Past
    /// `delta_out` the layer fades to nothing by the end of the segment.
    fn gain(&self, delta: u32, total: u32, position: f64) -> Option<f64> {
        let at = delta as f64 + position;
        if self.delta_in.is_some_and(|d| at < d as f64) {
            return None;
        }
        let Some(out) = self.delta_out else {
            return Some(1.0);
        };
        if out < delta {
            return None;
        }
        if at <= out as f64 {
            return Some(1.0);
        }
        let span = (delta + total).saturating_sub(out) as f64;
        if span <= 0.0 {
            return None;
        }
        Some((1.0 - (at - out as f64) / span).max(0.0))
    }
}

/// Stagger the slots of one layer in and out across the main program's run.
///
/// Only a segment that starts a run draws new windows; one slot leads in
/// from the start and another plays through to the end, and the rest enter
/// across the first half and leave across the second.
fn layer_windows(
    fab: &mut Fabricator<'_>,
    program_type: ProgramType,
    slots: &[Option<InstrumentType>],
) -> Vec<Window> {
    let mut windows = vec![Window::default(); slots.len()];
    let count = slots.len();
    if !fab.config().choice_delta_enabled
        || fab.segment_type() == SegmentType::Continue
        || count < 2
    {
        return windows;
    }

    // whichever slot played out the previous run leads this one in
    let carried = fab
        .previous_segment()
        .and_then(|prev| {
            prev.choices
                .iter()
                .find(|c| c.program_type == program_type && c.delta_out.is_none())
        })
        .and_then(|c| slots.iter().position(|&s| s == c.instrument_type));
    let intro = match carried {
        Some(slot) => slot,
        None => fab.rng().gen_range(0..count),
    };
    let others: Vec<usize> = (0..count).filter(|&i| i != intro).collect();
    let outro = others.choose(fab.rng()).copied().unwrap_or(intro);

    let limit = fab.config().main_length_max_delta as f64;
    let unit = limit / 2.0 / count as f64;
    let mut order: Vec<usize> = (0..count).collect();
    order.shuffle(fab.rng());
    for (rank, &slot) in order.iter().enumerate() {
        let d = (rank + 1) as f64 * unit + fab.entropy(unit / 2.0);
        windows[slot].delta_in = (d >= 1.0).then_some(d as u32);
    }
    order.shuffle(fab.rng());
    for (rank, &slot) in order.iter().enumerate() {
        let d = limit / 2.0 + (rank + 1) as f64 * unit + fab.entropy(unit / 2.0);
        windows[slot].delta_out = Some(d.max(0.0) as u32);
    }
    windows[intro].delta_in = None;
    windows[outro].delta_out = None;

    debug!(
        segment = %fab.segment_id(),
        layer = ?program_type,
        windows = ?windows,
        "layer windows"
    );
    windows
}

fn choose_program(
    fab: &mut Fabricator<'_>,
    program_type: ProgramType,
    instrument_type: Option<InstrumentType>,
    window: Window,
) -> Result<Outcome<SegmentChoice>, FabricationError> {
    let source = fab.source();
    let candidates: Vec<&Program> = source
        .programs_of(program_type)
        .filter(|p| match instrument_type {
            Some(t) => p.has_voice_of(t),
            None => !p.voices.is_empty(),
        })
        .collect();

    let (reused, window) = match fab.segment_type() {
        SegmentType::Continue => match fab.previous_layer_choice(program_type, instrument_type) {
            Some(prior) => (
                candidates.iter().copied().find(|p| p.id == prior.program_id),
                Window::of(prior),
            ),
            None => (None, Window::default()),
        },
        _ => (None, window),
    };
    let program = match reused {
        Some(program) => program,
        None => match score_programs(fab, &candidates) {
            Some(program) => program,
            None => {
                return Ok(Outcome::Skipped(fab.missing(
                    Slot::Program(program_type, instrument_type),
                    0,
                    format!("no {:?} program with a matching voice", program_type),
                )));
            }
        },
    };

    let mut choice = SegmentChoice::new(program.id, program_type);
    choice.instrument_type = instrument_type;
    choice.transpose = layer_transpose(fab, program);
    choice.delta_in = window.delta_in;
    choice.delta_out = window.delta_out;
    let choice = fab.add_choice(choice)?;
    for meme in &program.memes {
        fab.add_meme(meme);
    }
    Ok(Outcome::Chosen(choice))
}

fn score_programs<'a>(
    fab: &mut Fabricator<'a>,
    candidates: &[&'a Program],
) -> Option<&'a Program> {
    let scoring = &fab.config().scoring;
    let terms = scoring.terms();
    let affinity_weight = scoring.chord_affinity_weight;
    let target = fab.meme_isometry();
    let digest = fab.chord_markov();

    let mut picker = EntityScorePicker::new();
    for program in candidates {
        let bound = fab.chain().is_program_bound(program.id);
        let extra = affinity_weight * chord_affinity(&digest, program);
        let score = score_candidate(fab.rng(), &terms, &target, &program.memes, bound, extra);
        picker.score(program.id, score);
    }
    picker.get_top().and_then(|id| fab.source().program(id))
}

/// How conventional the program's chord progressions are for the library;
/// the best of its sequences.
fn chord_affinity(digest: &ChordMarkovDigest, program: &Program) -> f64 {
    program
        .sequences
        .iter()
        .filter(|s| !s.chords.is_empty())
        .filter_map(|s| {
            let key: Key = s.key_or(program).parse().ok()?;
            let names = s.sorted_chords().into_iter().map(|c| c.name.as_str());
            Some(digest.progression_affinity(&ChordNode::progression(names, &key)))
        })
        .fold(0.0, f64::max)
}

/// Key delta from the program's key to the segment's; unkeyed content is
/// left where it is.
fn layer_transpose(fab: &Fabricator<'_>, program: &Program) -> i32 {
    if !program.config.do_transpose {
        return 0;
    }
    let segment_key = fab.segment().key.as_deref().map(str::parse::<Key>);
    match (program.parsed_key(), segment_key) {
        (Ok(from), Some(Ok(to))) => Key::delta(&from, &to, 0),
        _ => 0,
    }
}

/// Everything needed to lay one voice's patterns into the segment.
struct Voicing<'a> {
    arrangement: ArrangementId,
    transpose: i32,
    window: Window,
    adjustment: Adjustment,
    sequence: &'a Sequence,
    voice: &'a ProgramVoice,
    instrument: &'a Instrument,
}

fn arrange_choice(
    fab: &mut Fabricator<'_>,
    choice: &SegmentChoice,
) -> Result<(), FabricationError> {
    let source = fab.source();
    let program = source.program(choice.program_id).ok_or_else(|| {
        ValidationError::new(
            ValidationKind::DanglingReference(format!("program {}", choice.program_id)),
            fab.segment_id(),
            Slot::Program(choice.program_type, choice.instrument_type),
        )
    })?;
    let Some(sequence) = fab.sequence_of(choice) else {
        let missing = fab.missing(
            Slot::Program(choice.program_type, choice.instrument_type),
            1,
            format!("program {} has no sequences", program.name),
        );
        fab.report_missing(missing);
        return Ok(());
    };
    let adjustment = fab
        .segment()
        .key
        .as_deref()
        .and_then(|k| k.parse::<Key>().ok())
        .map(|k| k.adjustment)
        .unwrap_or_default();

    for voice in &program.voices {
        if choice.instrument_type.is_some_and(|t| t != voice.instrument_type) {
            continue;
        }
        let instrument = match choose_instrument(fab, voice) {
            Outcome::Chosen(instrument) => instrument,
            Outcome::Skipped(missing) => {
                fab.report_missing(missing);
                continue;
            }
        };
        let arrangement = fab.add_arrangement(SegmentChoiceArrangement {
            id: ArrangementId(0),
            segment_id: SegmentId(0),
            choice_id: choice.id,
            voice_id: voice.id,
            instrument_id: instrument.id,
        })?;
        debug!(
            segment = %fab.segment_id(),
            voice = %voice.name,
            instrument = %instrument.name,
            "voice arranged"
        );

        let voicing = Voicing {
            arrangement: arrangement.id,
            transpose: choice.transpose,
            window: Window::of(choice),
            adjustment,
            sequence,
            voice,
            instrument,
        };
        for (from, to) in sections(fab, program) {
            craft_section(fab, &voicing, from, to)?;
        }
    }
    Ok(())
}

fn choose_instrument<'a>(
    fab: &mut Fabricator<'a>,
    voice: &ProgramVoice,
) -> Outcome<&'a Instrument> {
    let source = fab.source();
    if fab.segment_type() == SegmentType::Continue {
        let previous = fab
            .previous_voice_instrument(voice.id)
            .and_then(|id| source.instrument(id))
            .filter(|i| i.instrument_type == voice.instrument_type);
        if let Some(instrument) = previous {
            return Outcome::Chosen(instrument);
        }
    }

    let candidates: Vec<&Instrument> = source.instruments_of(voice.instrument_type).collect();
    let terms = fab.config().scoring.terms();
    let target = fab.meme_isometry();
    let mut picker = EntityScorePicker::new();
    for instrument in &candidates {
        let bound = fab.chain().is_instrument_bound(instrument.id);
        let score = score_candidate(fab.rng(), &terms, &target, &instrument.memes, bound, 0.0);
        picker.score(instrument.id, score);
    }
    match picker.get_top().and_then(|id| source.instrument(id)) {
        Some(instrument) => Outcome::Chosen(instrument),
        None => Outcome::Skipped(fab.missing(
            Slot::Instrument(voice.id),
            candidates.len(),
            format!("no {:?} instrument for voice {}", voice.instrument_type, voice.name),
        )),
    }
}

/// Beat ranges the pattern cycle restarts in: one per chord when the
/// program restarts on chords, else the whole segment.
fn sections(fab: &Fabricator<'_>, program: &Program) -> Vec<(f64, f64)> {
    let total = fab.segment().total as f64;
    let mut starts: Vec<f64> = Vec::new();
    if program.config.restart_on_chord {
        starts = fab
            .graph()
            .chords
            .iter()
            .map(|c| c.position)
            .filter(|&p| p > 0.0 && p < total)
            .collect();
        starts.sort_by(f64::total_cmp);
        starts.dedup();
    }
    starts.insert(0, 0.0);

    let mut bounds = Vec::with_capacity(starts.len());
    for (i, &from) in starts.iter().enumerate() {
        let to = starts.get(i + 1).copied().unwrap_or(total);
        bounds.push((from, to));
    }
    bounds
}

/// Intro, then loops up to where the outro has to begin, then the outro.
fn craft_section<'a>(
    fab: &mut Fabricator<'a>,
    voicing: &Voicing<'a>,
    from: f64,
    to: f64,
) -> Result<(), FabricationError> {
    let voice = voicing.voice.id;
    let mut position = from;

    let intro = fab.random_pattern(voicing.sequence, voice, PatternType::Intro);
    let outro = fab.random_pattern(voicing.sequence, voice, PatternType::Outro);
    // the outro always owns the tail of the section
    let loop_end = (to - outro.map(|o| o.total as f64).unwrap_or(0.0)).max(from);

    if let Some(intro) = intro {
        position += place(fab, voicing, intro, position, loop_end)?;
    }

    match fab.random_pattern(voicing.sequence, voice, PatternType::Loop) {
        Some(pattern) => {
            while position < loop_end {
                let placed = place(fab, voicing, pattern, position, loop_end)?;
                if placed <= 0.0 {
                    break;
                }
                position += placed;
            }
        }
        None => position = position.max(loop_end),
    }

    if let Some(outro) = outro {
        if position < to {
            place(fab, voicing, outro, position, to)?;
        }
    }
    Ok(())
}

/// Turn a pattern's events inside [from, to) into picks; returns the beats
/// the pattern occupied.
fn place(
    fab: &mut Fabricator<'_>,
    voicing: &Voicing<'_>,
    pattern: &Pattern,
    from: f64,
    to: f64,
) -> Result<f64, FabricationError> {
    for event in &pattern.events {
        let position = from + event.position;
        if position >= to {
            continue;
        }
        let segment = fab.segment();
        let Some(gain) = voicing.window.gain(segment.delta, segment.total, position) else {
            continue;
        };
        let duration = event.duration.min(to - position);
        let note = event_note(fab, voicing, event, position)?;
        let track = voicing
            .voice
            .track(event.track_id)
            .map(|t| t.name.as_str())
            .unwrap_or_default();
        let Some(audio) = select_audio(fab, voicing, track, note) else {
            continue;
        };

        let start = fab.seconds_at(position)?;
        let length = fab.seconds_at(position + duration)? - start;
        let amplitude = event.velocity * gain;
        add_pick(fab, voicing, event, audio, track, note, start, length, amplitude)?;
    }
    Ok((to - from).min(pattern.total as f64))
}

/// The event's note transposed with its choice and conformed to the voicing
/// sounding at `position`; `None` for atonal events.
fn event_note(
    fab: &Fabricator<'_>,
    voicing: &Voicing<'_>,
    event: &PatternEvent,
    position: f64,
) -> Result<Option<Note>, ValidationError> {
    let parsed = Note::parse_tones(&event.tones).map_err(|e| {
        ValidationError::new(
            e,
            fab.segment_id(),
            Slot::Audio(voicing.voice.id, event.tones.clone()),
        )
    })?;
    let Some(note) = parsed else {
        return Ok(None);
    };
    let chord_notes = fab.voicing_notes_at(position, voicing.voice.instrument_type)?;
    Ok(Some(note.transpose(voicing.transpose).conform_to(&chord_notes)))
}

fn note_name(note: Option<Note>, adjustment: Adjustment) -> String {
    match note {
        Some(note) => note.name(adjustment),
        None => ATONAL.to_string(),
    }
}

/// Audio for one event. Multiphonic instruments need an audio whose first
/// note is the event's note; others keep one audio per voice and track.
fn select_audio(
    fab: &mut Fabricator<'_>,
    voicing: &Voicing<'_>,
    track: &str,
    note: Option<Note>,
) -> Option<AudioId> {
    let voice = voicing.voice.id;
    let instrument = voicing.instrument;

    if instrument.multiphonic {
        let name = note_name(note, voicing.adjustment);
        let key = voice_note_key(voice, &name);
        if let Some(audio) = fab.audio_for_voice_note(&key) {
            return Some(audio);
        }
        let found = instrument.audios.iter().find(|a| {
            a.first_tones()
                .and_then(|t| Note::parse_tones(t).ok().flatten())
                .is_some_and(|first| Some(first) == note)
        });
        return match found {
            Some(audio) => {
                fab.remember_voice_note_audio(key, audio.id);
                Some(audio.id)
            }
            None => {
                report_once(
                    fab,
                    Slot::Audio(voice, key),
                    instrument.audios.len(),
                    format!("instrument {} has no audio playing {}", instrument.name, name),
                );
                None
            }
        };
    }

    let key = voice_track_key(voice, track);
    if let Some(audio) = fab.audio_for_voice_track(&key) {
        return Some(audio);
    }
    let previous = fab
        .previous_instrument_audio()
        .get(&key)
        .copied()
        .filter(|&id| instrument.audio(id).is_some());
    if let Some(audio) = previous {
        fab.remember_voice_track_audio(key, audio);
        return Some(audio);
    }

    let sigma = fab.config().scoring.entropy_sigma;
    let track_name = normalize_meme(track);
    let mut picker = EntityScorePicker::new();
    for audio in &instrument.audios {
        let matches = if instrument.instrument_type.is_tonal() {
            let first = audio
                .first_tones()
                .and_then(|t| Note::parse_tones(t).ok().flatten());
            first.is_some() && first == note
        } else {
            !track_name.is_empty() && normalize_meme(&audio.name) == track_name
        };
        let bonus = if matches { AUDIO_MATCH_BONUS } else { 0.0 };
        let score = fab.entropy(sigma) + bonus;
        picker.score(audio.id, score);
    }
    match picker.get_top() {
        Some(audio) => {
            fab.remember_voice_track_audio(key, audio);
            Some(audio)
        }
        None => {
            report_once(
                fab,
                Slot::Audio(voice, key),
                0,
                format!("instrument {} has no audio", instrument.name),
            );
            None
        }
    }
}

fn report_once(fab: &mut Fabricator<'_>, slot: Slot, candidates: usize, description: String) {
    if fab.diagnostics().iter().any(|d| d.slot == slot) {
        return;
    }
    let missing = fab.missing(slot, candidates, description);
    fab.report_missing(missing);
}

#[allow(clippy::too_many_arguments)]
fn add_pick(
    fab: &mut Fabricator<'_>,
    voicing: &Voicing<'_>,
    event: &PatternEvent,
    audio: AudioId,
    track: &str,
    note: Option<Note>,
    start: f64,
    length: f64,
    amplitude: f64,
) -> Result<PickId, ValidationError> {
    let pitch_hz = note.map(|n| fab.pitch(&n));
    fab.add_pick(SegmentChoiceArrangementPick {
        id: PickId(0),
        segment_id: SegmentId(0),
        arrangement_id: voicing.arrangement,
        event_id: event.id,
        audio_id: audio,
        track: track.to_string(),
        start,
        length,
        amplitude,
        tones: note_name(note, voicing.adjustment),
        pitch_hz,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::FabricationConfig;
    use crate::core::digest::DigestCache;
    use crate::core::fabricator::OutputFormat;
    use crate::core::macro_main;
    use crate::core::store::{InMemorySegmentStore, SegmentStore};
    use crate::schema::content::{EventId, SourceMaterial, VoiceId};
    use crate::schema::segment::{Chain, ChainId, SegmentGraph};

    const LIBRARY: &str = r#"(
        scope: "arrangement",
        programs: [
            (
                id: 1, name: "Song", program_type: Main, key: "C minor", tempo: 120.0,
                sequences: [(
                    id: 10, name: "Verse", total: 8,
                    chords: [(id: 1, position: 0.0, name: "Cm",
                              voicings: [(instrument_type: Bass, notes: "C2, Eb2, G2")])],
                )],
                bindings: [(id: 100, sequence_id: 10, offset: 0)],
            ),
            (
                id: 2, name: "Beat", program_type: Rhythm, key: "C", tempo: 120.0,
                voices: [(id: 21, name: "Drums", instrument_type: Drum,
                          tracks: [(id: 211, name: "KICK"), (id: 212, name: "SNARE")])],
                sequences: [(
                    id: 20, name: "Groove", total: 4,
                    patterns: [(
                        id: 201, voice_id: 21, pattern_type: Loop, total: 4,
                        events: [
                            (id: 1, track_id: 211, position: 0.0, duration: 1.0, tones: "X"),
                            (id: 2, track_id: 212, position: 1.0, duration: 1.0, tones: "X"),
                            (id: 3, track_id: 211, position: 2.0, duration: 1.0, tones: "X"),
                        ],
                    )],
                )],
            ),
            (
                id: 3, name: "Line", program_type: Detail, key: "C minor", tempo: 120.0,
                voices: [(id: 31, name: "Bass", instrument_type: Bass,
                          tracks: [(id: 311, name: "BASS")])],
                sequences: [(
                    id: 30, name: "Walk", total: 8,
                    patterns: [
                        (id: 301, voice_id: 31, pattern_type: Intro, total: 2, events: [
                            (id: 4, track_id: 311, position: 0.0, duration: 1.0, tones: "Eb3"),
                        ]),
                        (id: 302, voice_id: 31, pattern_type: Loop, total: 2, events: [
                            (id: 5, track_id: 311, position: 0.0, duration: 1.0, tones: "Eb3"),
                        ]),
                        (id: 303, voice_id: 31, pattern_type: Outro, total: 2, events: [
                            (id: 6, track_id: 311, position: 0.0, duration: 4.0, tones: "Eb3"),
                        ]),
                    ],
                )],
            ),
        ],
        instruments: [
            (id: 5, name: "Kit", instrument_type: Drum, audios: [
                (id: 50, name: "Snare", events: [(position: 0.0, tones: "X")]),
                (id: 51, name: "Kick", events: [(position: 0.0, tones: "X")]),
            ]),
            (id: 6, name: "Bass", instrument_type: Bass, audios: [
                (id: 60, name: "Low", events: [(position: 0.0, tones: "G2")]),
                (id: 61, name: "High", events: [(position: 0.0, tones: "Eb3")]),
            ]),
        ],
    )"#;

    struct Setup {
        source: SourceMaterial,
        store: InMemorySegmentStore,
        config: FabricationConfig,
        digests: DigestCache,
    }

    fn setup() -> Setup {
        let mut store = InMemorySegmentStore::new();
        store.add_chain(Chain::new(ChainId(1), "layers"));
        Setup {
            source: SourceMaterial::parse_ron(LIBRARY).unwrap(),
            store,
            config: FabricationConfig::default(),
            digests: DigestCache::default(),
        }
    }

    fn crafted(s: &mut Setup) -> (SegmentGraph, Vec<Slot>) {
        let segment = s.store.plan_next(ChainId(1)).unwrap();
        let mut fab = Fabricator::create(
            &s.source,
            &s.store,
            segment.id,
            OutputFormat::Wav,
            &s.config,
            &s.digests,
            11,
        )
        .unwrap();
        macro_main::craft(&mut fab).unwrap();
        craft_layer(&mut fab, ProgramType::Rhythm).unwrap();
        craft_layer(&mut fab, ProgramType::Detail).unwrap();
        let report = fab.done(&mut s.store).unwrap();
        let slots = report.diagnostics.into_iter().map(|d| d.slot).collect();
        (report.graph, slots)
    }

    fn picks_of_voice(graph: &SegmentGraph, voice: u64) -> Vec<&SegmentChoiceArrangementPick> {
        let mut picks: Vec<&SegmentChoiceArrangementPick> = graph
            .arrangements
            .iter()
            .filter(|a| a.voice_id == VoiceId(voice))
            .flat_map(|a| graph.picks_of(a.id))
            .collect();
        picks.sort_by(|a, b| a.start.total_cmp(&b.start));
        picks
    }

    #[test]
    fn kick_events_share_one_audio() {
        let mut s = setup();
        let (graph, _) = crafted(&mut s);
        let drums = picks_of_voice(&graph, 21);
        assert_eq!(drums.len(), 6);

        let kicks: Vec<_> = drums.iter().filter(|p| p.track == "KICK").collect();
        assert_eq!(kicks.len(), 4);
        assert!(kicks.iter().all(|p| p.audio_id == AudioId(51)));
        let snares: Vec<_> = drums.iter().filter(|p| p.track == "SNARE").collect();
        assert!(snares.iter().all(|p| p.audio_id == AudioId(50)));
        assert!(drums.iter().all(|p| p.tones == ATONAL && p.pitch_hz.is_none()));
    }

    #[test]
    fn detail_follows_chord_voicing_types() {
        let mut s = setup();
        let (graph, _) = crafted(&mut s);
        let detail = graph
            .choices
            .iter()
            .find(|c| c.program_type == ProgramType::Detail)
            .unwrap();
        assert_eq!(detail.instrument_type, Some(InstrumentType::Bass));
        assert_eq!(detail.transpose, 0);
    }

    #[test]
    fn intro_loops_and_outro_fill_the_segment() {
        let mut s = setup();
        let (graph, _) = crafted(&mut s);
        let bass = picks_of_voice(&graph, 31);
        let events: Vec<EventId> = bass.iter().map(|p| p.event_id).collect();
        assert_eq!(events, vec![EventId(4), EventId(5), EventId(5), EventId(6)]);

        let starts: Vec<f64> = bass.iter().map(|p| p.start).collect();
        assert_eq!(starts, vec![0.0, 1.0, 2.0, 3.0]);
        assert!((bass[0].length - 0.5).abs() < 1e-9);
        // The outro's 4-beat note is cut at the segment end
        assert!((bass[3].length - 1.0).abs() < 1e-9);
    }

    #[test]
    fn tonal_events_conform_and_pick_matching_audio() {
        let mut s = setup();
        let (graph, _) = crafted(&mut s);
        let bass = picks_of_voice(&graph, 31);
        for pick in &bass {
            assert_eq!(pick.tones, "Eb3");
            assert_eq!(pick.audio_id, AudioId(61));
            let expected = 432.0 * 2f64.powf((3.0 + 36.0 - 57.0) / 12.0);
            assert!((pick.pitch_hz.unwrap() - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn outro_takes_the_tail_without_a_loop() {
        let mut s = setup();
        let line = &mut s.source.programs[2];
        line.sequences[0].patterns.retain(|p| p.pattern_type != PatternType::Loop);

        let (graph, _) = crafted(&mut s);
        let bass = picks_of_voice(&graph, 31);
        let placed: Vec<(EventId, f64)> = bass.iter().map(|p| (p.event_id, p.start)).collect();
        // 120 bpm: the outro begins at beat 6 of 8
        assert_eq!(placed, vec![(EventId(4), 0.0), (EventId(6), 3.0)]);
        assert!((bass[1].length - 1.0).abs() < 1e-9);
    }

    #[test]
    fn long_intro_stops_where_the_outro_begins() {
        let mut s = setup();
        let line = &mut s.source.programs[2];
        let patterns = &mut line.sequences[0].patterns;
        patterns.retain(|p| p.pattern_type != PatternType::Loop);
        let intro = &mut patterns[0];
        intro.total = 8;
        intro.events.push(
            ron::from_str(r#"(id: 7, track_id: 311, position: 7.0, duration: 1.0, tones: "Eb3")"#)
                .unwrap(),
        );

        let (graph, _) = crafted(&mut s);
        let events: Vec<EventId> = picks_of_voice(&graph, 31)
            .iter()
            .map(|p| p.event_id)
            .collect();
        assert_eq!(events, vec![EventId(4), EventId(6)]);
    }

    #[test]
    fn open_window_always_sounds() {
        let open = Window::default();
        assert_eq!(open.gain(0, 8, 0.0), Some(1.0));
        assert_eq!(open.gain(64, 8, 7.5), Some(1.0));
    }

    #[test]
    fn window_holds_a_layer_back_until_delta_in() {
        let window = Window {
            delta_in: Some(10),
            delta_out: None,
        };
        assert_eq!(window.gain(8, 8, 1.0), None);
        assert_eq!(window.gain(8, 8, 2.0), Some(1.0));
        assert_eq!(window.gain(16, 8, 0.0), Some(1.0));
    }

    #[test]
    fn window_fades_a_layer_out_after_delta_out() {
        let window = Window {
            delta_in: None,
            delta_out: Some(12),
        };
        assert_eq!(window.gain(8, 8, 4.0), Some(1.0));
        let half = window.gain(8, 8, 6.0).unwrap();
        assert!((half - 0.5).abs() < 1e-9);
        // gone for every later segment of the run
        assert_eq!(window.gain(16, 8, 0.0), None);
    }

    #[test]
    fn restart_on_chord_repeats_the_cycle() {
        let mut s = setup();
        s.source.programs[0].sequences[0].chords.push(
            ron::from_str(
                r#"(id: 2, position: 4.0, name: "Ab",
                    voicings: [(instrument_type: Bass, notes: "Ab1, C2, Eb2")])"#,
            )
            .unwrap(),
        );
        let line = &mut s.source.programs[2];
        line.config.restart_on_chord = true;
        line.sequences[0].patterns.retain(|p| p.pattern_type != PatternType::Outro);

        let (graph, _) = crafted(&mut s);
        let bass = picks_of_voice(&graph, 31);
        let events: Vec<EventId> = bass.iter().map(|p| p.event_id).collect();
        assert_eq!(events, vec![EventId(4), EventId(5), EventId(4), EventId(5)]);
    }

    #[test]
    fn multiphonic_without_matching_note_is_reported_once() {
        let mut s = setup();
        let bass = &mut s.source.instruments[1];
        bass.multiphonic = true;
        bass.audios.retain(|a| a.id == AudioId(60));

        let (graph, slots) = crafted(&mut s);
        assert!(picks_of_voice(&graph, 31).is_empty());
        let expected = Slot::Audio(VoiceId(31), voice_note_key(VoiceId(31), "Eb3"));
        assert_eq!(slots.iter().filter(|s| **s == expected).count(), 1);
    }

    #[test]
    fn missing_instrument_skips_the_voice() {
        let mut s = setup();
        s.source.instruments.retain(|i| i.instrument_type != InstrumentType::Bass);

        let (graph, slots) = crafted(&mut s);
        assert!(slots.contains(&Slot::Instrument(VoiceId(31))));
        assert!(graph.arrangements.iter().all(|a| a.voice_id != VoiceId(31)));
        assert!(!picks_of_voice(&graph, 21).is_empty());
    }
}
