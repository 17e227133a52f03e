/// Chain integration tests: segment types, continuity and determinism over
/// the fixture library.
mod common;

use std::sync::Arc;
use std::thread;

use common::{BRIDGE, FALL, RISE, VERSE};
use segment_craft::core::pipeline::SegmentEngine;
use segment_craft::core::store::{SegmentStore, StaticContent};
use segment_craft::schema::content::{BindingId, ProgramType, SourceMaterial};
use segment_craft::schema::segment::{ChainId, SegmentGraph, SegmentState, SegmentType};

#[test]
fn segment_types_follow_main_and_macro_arcs() {
    let reports = common::fabricate(&common::engine(7), 6);
    let types: Vec<SegmentType> = reports
        .iter()
        .map(|r| r.graph.segment.segment_type)
        .collect();
    assert_eq!(
        types,
        vec![
            SegmentType::Initial,
            SegmentType::Continue,
            SegmentType::NextMain,
            SegmentType::Continue,
            SegmentType::NextMacro,
            SegmentType::Continue,
        ]
    );

    let macros: Vec<_> = reports
        .iter()
        .map(|r| common::program_of(&r.graph, ProgramType::Macro))
        .collect();
    assert_eq!(macros, vec![RISE, RISE, RISE, RISE, FALL, FALL]);

    let mains: Vec<_> = reports
        .iter()
        .map(|r| common::program_of(&r.graph, ProgramType::Main))
        .collect();
    assert_eq!(mains, vec![VERSE, VERSE, BRIDGE, BRIDGE, VERSE, VERSE]);
}

#[test]
fn continue_carries_main_and_advances_delta() {
    let reports = common::fabricate(&common::engine(7), 2);
    let (first, second) = (&reports[0].graph, &reports[1].graph);

    assert_eq!(first.segment.delta, 0);
    assert_eq!(first.segment.total, 8);
    assert_eq!(second.segment.delta, 8);
    assert_eq!(second.segment.total, 8);
    assert_eq!(first.segment.key.as_deref(), Some("C Minor"));
    assert_eq!(second.segment.key, first.segment.key);
    assert!((first.segment.density - 0.55).abs() < 1e-9);

    let main = |g: &SegmentGraph| {
        let c = g.main_choice().unwrap();
        (c.program_id, c.binding_id, c.transpose)
    };
    assert_eq!(main(first), main(second));

    let chords: Vec<(f64, &str)> = second
        .chords
        .iter()
        .map(|c| (c.position, c.name.as_str()))
        .collect();
    assert_eq!(chords, vec![(0.0, "Eb"), (4.0, "Bb")]);
}

#[test]
fn next_main_advances_macro_binding_and_keys_the_new_main() {
    let reports = common::fabricate(&common::engine(7), 3);
    let graph = &reports[2].graph;

    let macro_choice = graph.macro_choice().unwrap();
    assert_eq!(macro_choice.binding_id, Some(BindingId(101)));
    assert_eq!(macro_choice.transpose, 0);

    // Bridge is written in Eb and follows the macro arc down to C
    let main = graph.main_choice().unwrap();
    assert_eq!(main.program_id, BRIDGE);
    assert_eq!(main.transpose, -3);
    assert_eq!(graph.segment.key.as_deref(), Some("C Major"));
    assert_eq!(graph.segment.delta, 0);
    assert_eq!(graph.segment.tempo, 100.0);
    assert_eq!(graph.chords[0].name, "C");
}

#[test]
fn next_macro_switches_program_and_transposes_towards_previous_arc() {
    let reports = common::fabricate(&common::engine(7), 5);
    let graph = &reports[4].graph;

    let macro_choice = graph.macro_choice().unwrap();
    assert_eq!(macro_choice.program_id, FALL);
    assert_eq!(macro_choice.binding_id, Some(BindingId(200)));
    assert_eq!(macro_choice.transpose, 3);

    let main = graph.main_choice().unwrap();
    assert_eq!(main.program_id, VERSE);
    assert_eq!(main.transpose, 0);
    assert_eq!(graph.segment.key.as_deref(), Some("C Minor"));
}

#[test]
fn segments_are_contiguous_in_offset_and_time() {
    let engine = common::engine(11);
    let content = common::content();
    let mut store = common::store(ChainId(1));
    let reports = engine
        .fabricate_chain(&content, &mut store, ChainId(1), 5)
        .unwrap();

    for (i, report) in reports.iter().enumerate() {
        let segment = &report.graph.segment;
        assert_eq!(segment.offset, i as u64);
        assert_eq!(segment.state, SegmentState::Crafted);
        assert!(segment.end_at.unwrap() > segment.begin_at);
    }
    for pair in reports.windows(2) {
        let (a, b) = (&pair[0].graph.segment, &pair[1].graph.segment);
        assert_eq!(b.begin_at, a.end_at.unwrap());
    }

    // Constant tempo: eight beats at 120 bpm, and later at 100 bpm
    assert!((reports[0].graph.segment.end_at.unwrap() - 4.0).abs() < 1e-9);
    let third = &reports[3].graph.segment;
    assert!((third.end_at.unwrap() - third.begin_at - 4.8).abs() < 1e-9);

    // The first Bridge segment ramps from the Verse's 120 bpm down to 100 bpm
    let ramped = &reports[2].graph.segment;
    assert_eq!(ramped.segment_type, SegmentType::NextMain);
    assert_eq!(ramped.tempo, 100.0);
    let slope = (100.0 - 120.0) / 8.0;
    let expected = 60.0 / slope * (100.0f64 / 120.0).ln();
    assert!((ramped.end_at.unwrap() - ramped.begin_at - expected).abs() < 1e-9);
    // slower than a constant 120 bpm, faster than a constant 100 bpm
    assert!(expected > 4.0 && expected < 4.8);

    // Everything crafted is what the store now holds
    let stored = store.segments_of(ChainId(1));
    assert_eq!(stored.len(), 5);
    assert_eq!(store.graph(reports[2].graph.segment.id), Some(&reports[2].graph));
}

#[test]
fn continue_reuses_layer_programs_and_instruments() {
    let reports = common::fabricate(&common::engine(23), 2);
    let (first, second) = (&reports[0].graph, &reports[1].graph);

    for layer in [ProgramType::Rhythm, ProgramType::Detail] {
        let programs = |g: &SegmentGraph| {
            let mut ids: Vec<_> = g
                .choices
                .iter()
                .filter(|c| c.program_type == layer)
                .map(|c| (c.instrument_type, c.program_id))
                .collect();
            ids.sort();
            ids
        };
        assert_eq!(programs(first), programs(second));
    }

    let instruments = |g: &SegmentGraph| {
        let mut ids: Vec<_> = g
            .arrangements
            .iter()
            .map(|a| (a.voice_id, a.instrument_id))
            .collect();
        ids.sort();
        ids
    };
    assert_eq!(instruments(first), instruments(second));
}

#[test]
fn equal_seeds_craft_equal_chains() {
    let a = common::fabricate(&common::engine(99), 4);
    let b = common::fabricate(&common::engine(99), 4);
    for (x, y) in a.iter().zip(&b) {
        assert_eq!(x.graph, y.graph);
        assert_eq!(x.diagnostics, y.diagnostics);
    }
}

#[test]
fn concurrent_chains_share_one_digest_cache() {
    let engine: SegmentEngine = common::engine(5);
    let source = common::library();

    let results: Vec<usize> = thread::scope(|scope| {
        let handles: Vec<_> = (1..=4u64)
            .map(|chain| {
                let engine = &engine;
                let content = StaticContent(Arc::clone(&source));
                scope.spawn(move || {
                    let mut store = common::store(ChainId(chain));
                    let reports = engine
                        .fabricate_chain(&content, &mut store, ChainId(chain), 3)
                        .unwrap();
                    reports
                        .iter()
                        .filter(|r| r.graph.segment.state == SegmentState::Crafted)
                        .count()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(results, vec![3, 3, 3, 3]);

    // One digest per scope, handed to every chain
    let order = engine.config().markov_order;
    let first = engine.digests().chord_markov(&source, order);
    let second = engine.digests().chord_markov(&source, order);
    assert!(Arc::ptr_eq(&first, &second));
    assert!(!first.forward().is_empty());
}

#[test]
fn failed_segment_blocks_the_chain_until_refabricated() {
    let engine = common::engine(3);
    let mut store = common::store(ChainId(1));
    let planned = store.plan_next(ChainId(1)).unwrap();

    let empty = SourceMaterial::default();
    assert!(engine.fabricate(&empty, &mut store, planned.id).is_err());
    assert_eq!(store.segment(planned.id).unwrap().state, SegmentState::Failed);
    assert!(store.plan_next(ChainId(1)).is_err());

    let report = engine
        .fabricate(&common::library(), &mut store, planned.id)
        .unwrap();
    assert_eq!(report.graph.segment.segment_type, SegmentType::Initial);
    assert_eq!(store.plan_next(ChainId(1)).unwrap().offset, 1);
}
