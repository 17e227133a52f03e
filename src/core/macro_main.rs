/// Macro-Main craft: the segment-type state machine.
///
/// The segment type decides how the Macro and Main programs are chosen:
/// an Initial or NextMacro segment scores both afresh, NextMain advances the
/// Macro arc by one binding and re-scores Main, Continue carries both over.
/// The Main sequence then fixes the segment's key, length, tempo, density,
/// chords and memes.

use tracing::debug;

use crate::core::error::{FabricationError, Outcome, Slot, ValidationError, ValidationKind};
use crate::core::fabricator::{Fabricator, SegmentStructure};
use crate::core::music::{format_notes, parse_notes, Chord, Key};
use crate::core::scoring::{score_candidate, EntityScorePicker, MemeIsometry};
use crate::schema::content::{Program, ProgramId, ProgramType, Sequence, SequenceBinding};
use crate::schema::segment::{SegmentChoice, SegmentType};

pub fn craft(fab: &mut Fabricator<'_>) -> Result<(), FabricationError> {
    let segment_type = fab.segment_type();

    let macro_choice = match choose_macro(fab, segment_type)? {
        Outcome::Chosen(choice) => Some(choice),
        Outcome::Skipped(missing) => {
            fab.report_missing(missing);
            None
        }
    };
    let main_choice = match choose_main(fab, segment_type, macro_choice.as_ref())? {
        Outcome::Chosen(choice) => choice,
        Outcome::Skipped(missing) => {
            // Without a Main program the segment fails validation in done()
            fab.report_missing(missing);
            return Ok(());
        }
    };

    let main_sequence = fab
        .sequence_of(&main_choice)
        .ok_or_else(|| dangling(fab, &main_choice, "main sequence"))?;
    let macro_sequence = macro_choice.as_ref().and_then(|c| fab.sequence_of(c));

    let structure =
        compute_structure(fab, segment_type, &main_choice, main_sequence, macro_sequence)?;
    debug!(
        segment = %fab.segment_id(),
        key = %structure.key,
        total = structure.total,
        delta = structure.delta,
        tempo = structure.tempo,
        "segment structure"
    );
    let (delta, total, key) = (structure.delta, structure.total, structure.key.clone());
    fab.set_structure(structure);

    add_chords(fab, main_sequence, delta, total, &key, main_choice.transpose)?;
    add_memes(fab, macro_choice.as_ref());
    add_memes(fab, Some(&main_choice));
    Ok(())
}

fn choose_macro(
    fab: &mut Fabricator<'_>,
    segment_type: SegmentType,
) -> Result<Outcome<SegmentChoice>, FabricationError> {
    let previous = fab.previous_choice(ProgramType::Macro).cloned();

    match (segment_type, &previous) {
        (SegmentType::Continue, Some(prev)) => {
            return Ok(Outcome::Chosen(fab.add_choice(prev.clone())?));
        }
        (SegmentType::NextMain, Some(prev)) => {
            if let Some(choice) = advance_macro(fab, prev) {
                return Ok(Outcome::Chosen(fab.add_choice(choice)?));
            }
        }
        _ => {}
    }

    let target = match (segment_type, &previous) {
        (SegmentType::Initial, _) | (_, None) => MemeIsometry::default(),
        (_, Some(prev)) => next_binding_memes(fab, prev),
    };
    let avoid = previous
        .as_ref()
        .filter(|_| segment_type == SegmentType::NextMacro)
        .map(|c| c.program_id);

    let source = fab.source();
    let candidates: Vec<&Program> = source.programs_of(ProgramType::Macro).collect();
    let Some(program) = pick_program(fab, &candidates, &target, avoid) else {
        return Ok(Outcome::Skipped(fab.missing(
            Slot::Program(ProgramType::Macro, None),
            candidates.len(),
            "no Macro program to choose from",
        )));
    };
    let Some(binding) = first_binding(fab, program) else {
        return Ok(Outcome::Skipped(fab.missing(
            Slot::Program(ProgramType::Macro, None),
            candidates.len(),
            format!("Macro program {} has no sequence bindings", program.name),
        )));
    };

    let transpose = match (segment_type, &previous) {
        (SegmentType::Initial, _) | (_, None) => 0,
        (SegmentType::NextMacro, Some(prev)) => {
            next_macro_transpose(fab, program, binding, prev)?
        }
        (_, Some(prev)) => prev.transpose,
    };

    let mut choice = SegmentChoice::new(program.id, ProgramType::Macro);
    choice.binding_id = Some(binding.id);
    choice.transpose = transpose;
    Ok(Outcome::Chosen(fab.add_choice(choice)?))
}

fn choose_main(
    fab: &mut Fabricator<'_>,
    segment_type: SegmentType,
    macro_choice: Option<&SegmentChoice>,
) -> Result<Outcome<SegmentChoice>, FabricationError> {
    let previous = fab.previous_choice(ProgramType::Main).cloned();
    if segment_type == SegmentType::Continue {
        if let Some(prev) = &previous {
            return Ok(Outcome::Chosen(fab.add_choice(prev.clone())?));
        }
    }

    let source = fab.source();
    let macro_bound = macro_choice.and_then(|c| {
        c.binding_id
            .and_then(|b| source.bound_sequence(c.program_id, b))
            .map(|bound| (c, bound))
    });
    let target = macro_bound
        .map(|(_, (_, binding, _))| MemeIsometry::of(&binding.memes))
        .unwrap_or_default();
    let avoid = previous.as_ref().map(|c| c.program_id);

    let candidates: Vec<&Program> = source.programs_of(ProgramType::Main).collect();
    let Some(program) = pick_program(fab, &candidates, &target, avoid) else {
        return Ok(Outcome::Skipped(fab.missing(
            Slot::Program(ProgramType::Main, None),
            candidates.len(),
            "no Main program to choose from",
        )));
    };
    let Some(binding) = first_binding(fab, program) else {
        return Ok(Outcome::Skipped(fab.missing(
            Slot::Program(ProgramType::Main, None),
            candidates.len(),
            format!("Main program {} has no sequence bindings", program.name),
        )));
    };

    let mut transpose = 0;
    if let Some((macro_choice, (macro_program, _, macro_sequence))) = macro_bound {
        if program.config.do_transpose {
            let main_key = bound_key(fab, program, binding, ProgramType::Main)?;
            let macro_key =
                parse_key(fab, macro_sequence.key_or(macro_program), ProgramType::Macro)?;
            transpose = Key::delta(&main_key, &macro_key, macro_choice.transpose);
        }
    }

    let mut choice = SegmentChoice::new(program.id, ProgramType::Main);
    choice.binding_id = Some(binding.id);
    choice.transpose = transpose;
    Ok(Outcome::Chosen(fab.add_choice(choice)?))
}

/// Score structural candidates against a target meme set and return the
/// best. The program to avoid is skipped unless it is the only candidate.
fn pick_program<'a>(
    fab: &mut Fabricator<'a>,
    candidates: &[&'a Program],
    target: &MemeIsometry,
    avoid: Option<ProgramId>,
) -> Option<&'a Program> {
    let terms = fab.config().scoring.terms();
    let mut picker = EntityScorePicker::new();
    for program in candidates {
        if candidates.len() > 1 && Some(program.id) == avoid {
            continue;
        }
        let memes = memes_at_beginning(program);
        let bound = fab.chain().is_program_bound(program.id);
        let score = score_candidate(fab.rng(), &terms, target, &memes, bound, 0.0);
        picker.score(program.id, score);
    }
    picker.get_top().and_then(|id| fab.source().program(id))
}

/// Program memes together with the memes of its opening bindings.
fn memes_at_beginning(program: &Program) -> Vec<String> {
    let mut memes = program.memes.clone();
    memes.extend(program.first_binding_memes());
    memes
}

fn first_binding<'a>(
    fab: &mut Fabricator<'a>,
    program: &'a Program,
) -> Option<&'a SequenceBinding> {
    let first = *program.offsets().first()?;
    fab.binding_at_offset(program.id, first)
}

/// The previous Macro program's next binding, kept at the same transpose.
fn advance_macro(fab: &mut Fabricator<'_>, prev: &SegmentChoice) -> Option<SegmentChoice> {
    let program = fab.source().program(prev.program_id)?;
    let current = program.binding(prev.binding_id?)?;
    let next = program.next_offset(current.offset)?;
    let binding = fab.binding_at_offset(program.id, next)?;

    let mut choice = SegmentChoice::new(program.id, ProgramType::Macro);
    choice.binding_id = Some(binding.id);
    choice.transpose = prev.transpose;
    Some(choice)
}

/// Memes the previous Macro arc was heading towards: those of its next
/// binding, else of the binding it was playing.
fn next_binding_memes(fab: &Fabricator<'_>, prev: &SegmentChoice) -> MemeIsometry {
    let source = fab.source();
    let Some(program) = source.program(prev.program_id) else {
        return MemeIsometry::default();
    };
    let Some(current) = prev.binding_id.and_then(|b| program.binding(b)) else {
        return MemeIsometry::default();
    };
    match program.next_offset(current.offset) {
        Some(next) => MemeIsometry::of(
            program
                .bindings_at(next)
                .into_iter()
                .flat_map(|b| b.memes.iter()),
        ),
        None => MemeIsometry::of(&current.memes),
    }
}

/// Transpose putting a new Macro program where the previous Macro's next
/// sequence would have sounded.
fn next_macro_transpose(
    fab: &Fabricator<'_>,
    program: &Program,
    binding: &SequenceBinding,
    prev: &SegmentChoice,
) -> Result<i32, ValidationError> {
    let source = fab.source();
    let Some((prev_program, current, current_sequence)) =
        prev.binding_id.and_then(|b| source.bound_sequence(prev.program_id, b))
    else {
        return Ok(prev.transpose);
    };
    let next_sequence = prev_program
        .next_offset(current.offset)
        .and_then(|offset| prev_program.bindings_at(offset).into_iter().next())
        .and_then(|b| prev_program.sequence(b.sequence_id))
        .unwrap_or(current_sequence);

    let new_key = bound_key(fab, program, binding, ProgramType::Macro)?;
    let heading = parse_key(fab, next_sequence.key_or(prev_program), ProgramType::Macro)?;
    Ok(Key::delta(&new_key, &heading, prev.transpose))
}

fn bound_key(
    fab: &Fabricator<'_>,
    program: &Program,
    binding: &SequenceBinding,
    program_type: ProgramType,
) -> Result<Key, ValidationError> {
    let key = program
        .sequence(binding.sequence_id)
        .map(|s| s.key_or(program))
        .unwrap_or(program.key.as_str());
    parse_key(fab, key, program_type)
}

fn parse_key(
    fab: &Fabricator<'_>,
    key: &str,
    program_type: ProgramType,
) -> Result<Key, ValidationError> {
    key.parse()
        .map_err(|e| ValidationError::new(e, fab.segment_id(), Slot::Program(program_type, None)))
}

fn dangling(fab: &Fabricator<'_>, choice: &SegmentChoice, what: &str) -> ValidationError {
    ValidationError::new(
        ValidationKind::DanglingReference(format!("{} of program {}", what, choice.program_id)),
        fab.segment_id(),
        Slot::Program(choice.program_type, None),
    )
}

fn compute_structure(
    fab: &Fabricator<'_>,
    segment_type: SegmentType,
    main_choice: &SegmentChoice,
    main_sequence: &Sequence,
    macro_sequence: Option<&Sequence>,
) -> Result<SegmentStructure, ValidationError> {
    let program = fab
        .source()
        .program(main_choice.program_id)
        .ok_or_else(|| dangling(fab, main_choice, "program"))?;

    let mut delta = match (segment_type, fab.previous_segment()) {
        (SegmentType::Continue, Some(prev)) => prev.segment.delta + prev.segment.total,
        _ => 0,
    };
    if delta >= main_sequence.total {
        delta = 0;
    }
    let remaining = main_sequence.total - delta;
    let total = match fab.config().segment_beats {
        Some(beats) => remaining.min(beats),
        None => remaining,
    };

    let key = parse_key(fab, main_sequence.key_or(program), ProgramType::Main)?
        .transpose(main_choice.transpose);

    let densities: Vec<f64> = macro_sequence
        .into_iter()
        .chain(Some(main_sequence))
        .map(|s| s.density)
        .collect();
    let density = densities.iter().sum::<f64>() / densities.len() as f64;

    Ok(SegmentStructure {
        key: key.to_string(),
        total,
        delta,
        density,
        tempo: main_sequence.tempo.unwrap_or(program.tempo),
    })
}

/// Copy the Main sequence chords sounding in [delta, delta + total) into
/// segment time, transposed. The chord already sounding at `delta` opens
/// the segment at position 0.
fn add_chords(
    fab: &mut Fabricator<'_>,
    sequence: &Sequence,
    delta: u32,
    total: u32,
    key: &str,
    transpose: i32,
) -> Result<(), ValidationError> {
    let adjustment = parse_key(fab, key, ProgramType::Main)?.adjustment;
    let start = delta as f64;
    let end = (delta + total) as f64;
    let chords = sequence.sorted_chords();
    let sounding = chords.iter().rposition(|c| c.position <= start);

    for (i, chord) in chords.into_iter().enumerate() {
        let position = if Some(i) == sounding {
            0.0
        } else if chord.position > start && chord.position < end {
            chord.position - start
        } else {
            continue;
        };
        let name = chord
            .name
            .parse::<Chord>()
            .map_err(|e| ValidationError::new(e, fab.segment_id(), Slot::Segment))?
            .transpose(transpose)
            .name(adjustment);
        let id = fab.add_chord(position, &name);

        for voicing in &chord.voicings {
            let notes: Vec<_> = parse_notes(&voicing.notes)
                .map_err(|e| ValidationError::new(e, fab.segment_id(), Slot::Segment))?
                .iter()
                .map(|n| n.transpose(transpose))
                .collect();
            fab.add_voicing(id, voicing.instrument_type, &format_notes(&notes, adjustment))?;
        }
    }
    Ok(())
}

fn add_memes(fab: &mut Fabricator<'_>, choice: Option<&SegmentChoice>) {
    let Some(choice) = choice else {
        return;
    };
    let source = fab.source();
    let Some(program) = source.program(choice.program_id) else {
        return;
    };
    for meme in &program.memes {
        fab.add_meme(meme);
    }
    if let Some(binding) = choice.binding_id.and_then(|b| program.binding(b)) {
        for meme in &binding.memes {
            fab.add_meme(meme);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::FabricationConfig;
    use crate::core::digest::DigestCache;
    use crate::core::fabricator::OutputFormat;
    use crate::core::store::{InMemorySegmentStore, SegmentStore};
    use crate::schema::content::{BindingId, InstrumentType, SourceMaterial};
    use crate::schema::segment::{Chain, ChainId, SegmentGraph};

    const LIBRARY: &str = r#"(
        scope: "macro-main",
        programs: [
            (
                id: 1, name: "Arc", program_type: Macro, key: "C", tempo: 120.0,
                memes: ["Arc"],
                sequences: [
                    (id: 10, name: "Dawn", total: 0, density: 0.4),
                    (id: 11, name: "Noon", key: "G", total: 0, density: 0.4),
                    (id: 12, name: "Dusk", total: 0, density: 0.4),
                ],
                bindings: [
                    (id: 100, sequence_id: 10, offset: 0, memes: ["Dawn"]),
                    (id: 101, sequence_id: 11, offset: 1, memes: ["Noon"]),
                    (id: 102, sequence_id: 12, offset: 2, memes: ["Dusk"]),
                ],
            ),
            (
                id: 3, name: "Bow", program_type: Macro, key: "D", tempo: 120.0,
                sequences: [(id: 30, name: "Rise", total: 0)],
                bindings: [(id: 300, sequence_id: 30, offset: 0, memes: ["Noon"])],
            ),
            (
                id: 2, name: "Groove", program_type: Main, key: "C minor", tempo: 100.0,
                memes: ["Groove"],
                sequences: [(
                    id: 20, name: "Verse", total: 16, density: 0.6,
                    chords: [
                        (id: 1, position: 0.0, name: "Cm",
                         voicings: [(instrument_type: Bass, notes: "C2, Eb2, G2")]),
                        (id: 2, position: 8.0, name: "Ab",
                         voicings: [(instrument_type: Bass, notes: "Ab1, C2, Eb2")]),
                        (id: 3, position: 12.0, name: "Bb"),
                    ],
                )],
                bindings: [(id: 200, sequence_id: 20, offset: 0, memes: ["Dawn"])],
            ),
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
        let mut chain = Chain::new(ChainId(1), "arc");
        chain.bound_programs = vec![ProgramId(1)];
        store.add_chain(chain);
        Setup {
            source: SourceMaterial::parse_ron(LIBRARY).unwrap(),
            store,
            config: FabricationConfig {
                segment_beats: Some(8),
                ..FabricationConfig::default()
            },
            digests: DigestCache::default(),
        }
    }

    fn fabricate(s: &mut Setup) -> SegmentGraph {
        let segment = s.store.plan_next(ChainId(1)).unwrap();
        let mut fab = Fabricator::create(
            &s.source,
            &s.store,
            segment.id,
            OutputFormat::Wav,
            &s.config,
            &s.digests,
            7,
        )
        .unwrap();
        craft(&mut fab).unwrap();
        fab.done(&mut s.store).unwrap().graph
    }

    fn main_of(graph: &SegmentGraph) -> &SegmentChoice {
        graph.main_choice().unwrap()
    }

    fn chord_names(graph: &SegmentGraph) -> Vec<(f64, &str)> {
        let mut chords: Vec<(f64, &str)> = graph
            .chords
            .iter()
            .map(|c| (c.position, c.name.as_str()))
            .collect();
        chords.sort_by(|a, b| a.0.total_cmp(&b.0));
        chords
    }

    #[test]
    fn initial_segment_sets_structure() {
        let mut s = setup();
        let graph = fabricate(&mut s);
        let segment = &graph.segment;

        assert_eq!(segment.segment_type, SegmentType::Initial);
        assert_eq!(graph.macro_choice().unwrap().program_id, ProgramId(1));
        assert_eq!(graph.macro_choice().unwrap().binding_id, Some(BindingId(100)));
        assert_eq!(main_of(&graph).program_id, ProgramId(2));
        assert_eq!(main_of(&graph).transpose, 0);
        assert_eq!(segment.total, 8);
        assert_eq!(segment.delta, 0);
        assert_eq!(segment.tempo, 100.0);
        assert_eq!(segment.key.as_deref(), Some("C Minor"));
        assert!((segment.density - 0.5).abs() < 1e-9);
        assert_eq!(chord_names(&graph), vec![(0.0, "Cm")]);
        assert_eq!(graph.voicings.len(), 1);
        assert_eq!(graph.voicings[0].instrument_type, InstrumentType::Bass);
        assert_eq!(graph.voicings[0].notes, "C2, Eb2, G2");
        assert_eq!(graph.meme_names(), vec!["ARC", "DAWN", "GROOVE"]);
    }

    #[test]
    fn continue_segment_carries_main_and_advances_delta() {
        let mut s = setup();
        let first = fabricate(&mut s);
        let second = fabricate(&mut s);

        assert_eq!(second.segment.segment_type, SegmentType::Continue);
        assert_eq!(main_of(&second).program_id, main_of(&first).program_id);
        assert_eq!(main_of(&second).binding_id, main_of(&first).binding_id);
        assert_eq!(main_of(&second).transpose, main_of(&first).transpose);
        assert_eq!(
            second.macro_choice().unwrap().binding_id,
            first.macro_choice().unwrap().binding_id
        );
        assert_eq!(second.segment.delta, 8);
        assert_eq!(second.segment.total, 8);
        assert_eq!(chord_names(&second), vec![(0.0, "Ab"), (4.0, "Bb")]);
    }

    #[test]
    fn next_main_advances_macro_binding_and_transposes_main() {
        let mut s = setup();
        fabricate(&mut s);
        fabricate(&mut s);
        let third = fabricate(&mut s);

        assert_eq!(third.segment.segment_type, SegmentType::NextMain);
        let macro_choice = third.macro_choice().unwrap();
        assert_eq!(macro_choice.program_id, ProgramId(1));
        assert_eq!(macro_choice.binding_id, Some(BindingId(101)));
        assert_eq!(macro_choice.transpose, 0);
        // C minor moved to where the G macro sequence sits
        assert_eq!(main_of(&third).transpose, -5);
        assert_eq!(third.segment.delta, 0);
        assert_eq!(third.segment.key.as_deref(), Some("G Minor"));
        assert_eq!(chord_names(&third), vec![(0.0, "Gm")]);
        assert_eq!(third.voicings[0].notes, "G1, Bb1, D2");
    }

    #[test]
    fn next_macro_switches_program_and_keys_to_previous_arc() {
        let mut s = setup();
        s.source.programs[0].bindings.retain(|b| b.offset < 2);
        fabricate(&mut s);
        fabricate(&mut s);
        let third = fabricate(&mut s);

        assert_eq!(third.segment.segment_type, SegmentType::NextMacro);
        let macro_choice = third.macro_choice().unwrap();
        assert_eq!(macro_choice.program_id, ProgramId(3));
        // D lands on the G the previous arc was heading to
        assert_eq!(macro_choice.transpose, 5);
        assert_eq!(main_of(&third).program_id, ProgramId(2));
    }

    #[test]
    fn missing_main_fails_the_segment() {
        let mut s = setup();
        s.source.programs.retain(|p| p.program_type != ProgramType::Main);
        let segment = s.store.plan_next(ChainId(1)).unwrap();
        let mut fab = Fabricator::create(
            &s.source,
            &s.store,
            segment.id,
            OutputFormat::Wav,
            &s.config,
            &s.digests,
            7,
        )
        .unwrap();
        craft(&mut fab).unwrap();
        assert_eq!(fab.diagnostics().len(), 1);
        assert_eq!(
            fab.diagnostics()[0].slot,
            Slot::Program(ProgramType::Main, None)
        );
        let err = fab.done(&mut s.store).unwrap_err();
        assert!(matches!(
            err,
            FabricationError::Validation(ValidationError {
                kind: ValidationKind::MissingChoice(ProgramType::Main),
                ..
            })
        ));
        assert_eq!(
            s.store.segment(segment.id).unwrap().state,
            crate::schema::segment::SegmentState::Failed
        );
    }

    #[test]
    fn unparseable_chord_is_a_validation_error() {
        let mut s = setup();
        s.source.programs[2].sequences[0].chords[0].name = "H7".into();
        let segment = s.store.plan_next(ChainId(1)).unwrap();
        let mut fab = Fabricator::create(
            &s.source,
            &s.store,
            segment.id,
            OutputFormat::Wav,
            &s.config,
            &s.digests,
            7,
        )
        .unwrap();
        let err = craft(&mut fab).unwrap_err();
        assert!(matches!(err, FabricationError::Validation(_)));
    }
}
