//! Shared setup for the integration tests: the fixture library, its config
//! and a chain bound to the "Rise" macro program.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use segment_craft::core::config::FabricationConfig;
use segment_craft::core::fabricator::FabricationReport;
use segment_craft::core::pipeline::SegmentEngine;
use segment_craft::core::store::{InMemorySegmentStore, StaticContent};
use segment_craft::schema::content::{ProgramId, ProgramType, SourceMaterial, VoiceId};
use segment_craft::schema::segment::{
    Chain, ChainId, SegmentChoiceArrangementPick, SegmentGraph,
};

pub const LIBRARY: &str = "tests/fixtures/library.ron";
pub const CONFIG: &str = "tests/fixtures/config.ron";

pub const RISE: ProgramId = ProgramId(1);
pub const FALL: ProgramId = ProgramId(2);
pub const VERSE: ProgramId = ProgramId(3);
pub const BRIDGE: ProgramId = ProgramId(4);

pub fn library() -> Arc<SourceMaterial> {
    Arc::new(SourceMaterial::load_from_ron(Path::new(LIBRARY)).unwrap())
}

pub fn content() -> StaticContent {
    StaticContent(library())
}

pub fn config() -> FabricationConfig {
    FabricationConfig::load_from_ron(Path::new(CONFIG)).unwrap()
}

pub fn engine(seed: u64) -> SegmentEngine {
    SegmentEngine::builder()
        .seed(seed)
        .config_file(CONFIG)
        .build()
        .unwrap()
}

/// A store holding one chain whose macro arc starts on "Rise".
pub fn store(chain: ChainId) -> InMemorySegmentStore {
    let mut store = InMemorySegmentStore::new();
    let mut c = Chain::new(chain, "fixture");
    c.bound_programs.push(RISE);
    store.add_chain(c);
    store
}

pub fn fabricate(engine: &SegmentEngine, count: usize) -> Vec<FabricationReport> {
    let mut store = store(ChainId(1));
    engine
        .fabricate_chain(&content(), &mut store, ChainId(1), count)
        .unwrap()
}

pub fn program_of(graph: &SegmentGraph, program_type: ProgramType) -> ProgramId {
    graph.choice_of(program_type).unwrap().program_id
}

/// Picks of every arrangement of one layer type, in time order.
pub fn picks_of_layer(
    graph: &SegmentGraph,
    program_type: ProgramType,
) -> Vec<&SegmentChoiceArrangementPick> {
    let mut picks: Vec<&SegmentChoiceArrangementPick> = graph
        .choices
        .iter()
        .filter(|c| c.program_type == program_type)
        .flat_map(move |c| graph.arrangements.iter().filter(move |a| a.choice_id == c.id))
        .flat_map(|a| graph.picks_of(a.id))
        .collect();
    picks.sort_by(|a, b| a.start.total_cmp(&b.start));
    picks
}

pub fn picks_of_voice(graph: &SegmentGraph, voice: u64) -> Vec<&SegmentChoiceArrangementPick> {
    let mut picks: Vec<&SegmentChoiceArrangementPick> = graph
        .arrangements
        .iter()
        .filter(|a| a.voice_id == VoiceId(voice))
        .flat_map(|a| graph.picks_of(a.id))
        .collect();
    picks.sort_by(|a, b| a.start.total_cmp(&b.start));
    picks
}
