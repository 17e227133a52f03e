/// Persistence and content collaborators, plus in-memory implementations.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

use crate::schema::content::SourceMaterial;
use crate::schema::segment::{Chain, ChainId, Segment, SegmentGraph, SegmentId, SegmentState};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("chain {0} not found")]
    ChainNotFound(ChainId),
    #[error("segment {0} not found")]
    SegmentNotFound(SegmentId),
    #[error("segment {0} is already crafted and cannot change")]
    Immutable(SegmentId),
    #[error("segment {0} must be crafted before the next one is planned")]
    PredecessorNotCrafted(SegmentId),
    #[error("no content bound to chain {0}")]
    NoContent(ChainId),
}

/// Reads and writes segments of chains.
pub trait SegmentStore {
    fn chain(&self, id: ChainId) -> Result<Chain, StoreError>;

    fn segment(&self, id: SegmentId) -> Result<Segment, StoreError>;

    /// Up to `limit` crafted segment graphs before `offset`, newest first.
    fn previous(
        &self,
        chain: ChainId,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<SegmentGraph>, StoreError>;

    /// Create the next Planned segment at the chain's next contiguous offset.
    fn plan_next(&mut self, chain: ChainId) -> Result<Segment, StoreError>;

    fn set_state(&mut self, id: SegmentId, state: SegmentState) -> Result<(), StoreError>;

    /// Replace a segment and all its crafted entities in one step.
    fn persist(&mut self, graph: SegmentGraph) -> Result<(), StoreError>;
}

/// Supplies the library snapshot visible to a chain.
pub trait ContentProvider {
    fn source_material(&self, chain: &Chain) -> Result<Arc<SourceMaterial>, StoreError>;
}

/// One snapshot shared by every chain.
#[derive(Debug, Clone)]
pub struct StaticContent(pub Arc<SourceMaterial>);

impl ContentProvider for StaticContent {
    fn source_material(&self, _chain: &Chain) -> Result<Arc<SourceMaterial>, StoreError> {
        Ok(Arc::clone(&self.0))
    }
}

#[derive(Debug, Default)]
pub struct InMemorySegmentStore {
    chains: BTreeMap<ChainId, Chain>,
    segments: BTreeMap<SegmentId, Segment>,
    graphs: HashMap<SegmentId, SegmentGraph>,
    next_segment_id: u64,
}

impl InMemorySegmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_chain(&mut self, chain: Chain) {
        self.chains.insert(chain.id, chain);
    }

    pub fn graph(&self, id: SegmentId) -> Option<&SegmentGraph> {
        self.graphs.get(&id)
    }

    /// Segments of a chain ordered by offset.
    pub fn segments_of(&self, chain: ChainId) -> Vec<&Segment> {
        let mut segments: Vec<&Segment> = self
            .segments
            .values()
            .filter(|s| s.chain_id == chain)
            .collect();
        segments.sort_by_key(|s| s.offset);
        segments
    }
}

impl SegmentStore for InMemorySegmentStore {
    fn chain(&self, id: ChainId) -> Result<Chain, StoreError> {
        self.chains.get(&id).cloned().ok_or(StoreError::ChainNotFound(id))
    }

    fn segment(&self, id: SegmentId) -> Result<Segment, StoreError> {
        self.segments
            .get(&id)
            .cloned()
            .ok_or(StoreError::SegmentNotFound(id))
    }

    fn previous(
        &self,
        chain: ChainId,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<SegmentGraph>, StoreError> {
        if !self.chains.contains_key(&chain) {
            return Err(StoreError::ChainNotFound(chain));
        }
        let mut graphs: Vec<&SegmentGraph> = self
            .graphs
            .values()
            .filter(|g| g.segment.chain_id == chain && g.segment.offset < offset)
            .collect();
        graphs.sort_by(|a, b| b.segment.offset.cmp(&a.segment.offset));
        Ok(graphs.into_iter().take(limit).cloned().collect())
    }

    fn plan_next(&mut self, chain: ChainId) -> Result<Segment, StoreError> {
        if !self.chains.contains_key(&chain) {
            return Err(StoreError::ChainNotFound(chain));
        }
        let last = self.segments_of(chain).last().map(|s| (*s).clone());
        let (offset, begin_at) = match last {
            None => (0, 0.0),
            Some(last) => match (last.state, last.end_at) {
                (SegmentState::Crafted | SegmentState::Dubbing | SegmentState::Dubbed, Some(end)) => {
                    (last.offset + 1, end)
                }
                _ => return Err(StoreError::PredecessorNotCrafted(last.id)),
            },
        };
        self.next_segment_id += 1;
        let segment = Segment::planned(SegmentId(self.next_segment_id), chain, offset, begin_at);
        self.segments.insert(segment.id, segment.clone());
        Ok(segment)
    }

    fn set_state(&mut self, id: SegmentId, state: SegmentState) -> Result<(), StoreError> {
        let segment = self
            .segments
            .get_mut(&id)
            .ok_or(StoreError::SegmentNotFound(id))?;
        segment.state = state;
        Ok(())
    }

    fn persist(&mut self, graph: SegmentGraph) -> Result<(), StoreError> {
        let id = graph.segment.id;
        let current = self
            .segments
            .get(&id)
            .ok_or(StoreError::SegmentNotFound(id))?;
        if self.graphs.contains_key(&id) || current.state == SegmentState::Crafted {
            return Err(StoreError::Immutable(id));
        }
        self.segments.insert(id, graph.segment.clone());
        self.graphs.insert(id, graph);
        Ok(())
    }
}
