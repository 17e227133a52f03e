/// The fabrication pipeline: one segment from Planned to Crafted.
///
/// Wires together fabricator creation, macro/main craft, each configured
/// arrangement layer, and the hand-off to the segment store.

use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::core::arrangement;
use crate::core::config::{ConfigError, FabricationConfig};
use crate::core::digest::DigestCache;
use crate::core::error::{FabricationError, FatalError, FatalKind};
use crate::core::fabricator::{mark_failed, FabricationReport, Fabricator, OutputFormat};
use crate::core::macro_main;
use crate::core::store::{ContentProvider, SegmentStore, StoreError};
use crate::schema::content::{ProgramType, SourceMaterial};
use crate::schema::segment::{ChainId, Segment, SegmentId, SegmentState};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Fabrication(#[from] FabricationError),
}

/// Fabricates segments of any chain. Built via `SegmentEngine::builder()`.
///
/// The engine is immutable once built and may be shared across threads;
/// every fabrication gets its own `Fabricator`.
pub struct SegmentEngine {
    config: FabricationConfig,
    digests: Arc<DigestCache>,
    output_format: OutputFormat,
    seed: u64,
}

/// Builder for constructing a `SegmentEngine`.
pub struct SegmentEngineBuilder {
    config_path: Option<String>,
    output_format: OutputFormat,
    seed: u64,
    /// Directly provided configuration (for testing without files).
    config: Option<FabricationConfig>,
    /// Digest cache shared with other engines.
    digests: Option<Arc<DigestCache>>,
}

impl SegmentEngine {
    pub fn builder() -> SegmentEngineBuilder {
        SegmentEngineBuilder {
            config_path: None,
            output_format: OutputFormat::default(),
            seed: 0,
            config: None,
            digests: None,
        }
    }

    pub fn config(&self) -> &FabricationConfig {
        &self.config
    }

    pub fn digests(&self) -> &Arc<DigestCache> {
        &self.digests
    }

    /// Entropy seed of one segment, distinct per chain and offset.
    pub fn seed_for(&self, segment: &Segment) -> u64 {
        self.seed
            .wrapping_add(segment.chain_id.0.wrapping_mul(104_729))
            .wrapping_add(segment.offset.wrapping_mul(7919)) // prime offset per segment
    }

    /// Craft a Planned (or previously Failed) segment and persist it.
    ///
    /// Fatal errors raised before craft starts leave the segment untouched.
    /// Anything failing after that marks it Failed.
    pub fn fabricate(
        &self,
        source: &SourceMaterial,
        store: &mut dyn SegmentStore,
        segment_id: SegmentId,
    ) -> Result<FabricationReport, FabricationError> {
        let segment = store
            .segment(segment_id)
            .map_err(|e| FatalError::new(FatalKind::SegmentNotFound(e), segment_id))?;
        let mut fab = Fabricator::create(
            source,
            &*store,
            segment_id,
            self.output_format,
            &self.config,
            &self.digests,
            self.seed_for(&segment),
        )?;
        store
            .set_state(segment_id, SegmentState::Crafting)
            .map_err(|e| FatalError::new(FatalKind::Store(e), segment_id))?;
        info!(
            segment = %segment_id,
            chain = %segment.chain_id,
            offset = segment.offset,
            scope = %source.scope,
            "fabrication started"
        );

        if let Err(e) = self.craft(&mut fab) {
            mark_failed(store, segment_id, &e.to_string());
            return Err(e);
        }
        match fab.done(store) {
            Err(FabricationError::Fatal(e)) => {
                mark_failed(store, segment_id, &e.to_string());
                Err(e.into())
            }
            other => other,
        }
    }

    fn craft(&self, fab: &mut Fabricator<'_>) -> Result<(), FabricationError> {
        macro_main::craft(fab)?;
        for &layer in &self.config.layers {
            match layer {
                ProgramType::Rhythm | ProgramType::Detail | ProgramType::Beat => {
                    arrangement::craft_layer(fab, layer)?
                }
                ProgramType::Macro | ProgramType::Main => {}
            }
        }
        Ok(())
    }

    /// Plan the chain's next segment and fabricate it.
    pub fn fabricate_next(
        &self,
        content: &dyn ContentProvider,
        store: &mut dyn SegmentStore,
        chain: ChainId,
    ) -> Result<FabricationReport, EngineError> {
        let chain = store.chain(chain)?;
        let source = content.source_material(&chain)?;
        let segment = store.plan_next(chain.id)?;
        Ok(self.fabricate(&source, store, segment.id)?)
    }

    /// Fabricate `count` consecutive segments, stopping at the first error.
    pub fn fabricate_chain(
        &self,
        content: &dyn ContentProvider,
        store: &mut dyn SegmentStore,
        chain: ChainId,
        count: usize,
    ) -> Result<Vec<FabricationReport>, EngineError> {
        let mut reports = Vec::with_capacity(count);
        for _ in 0..count {
            reports.push(self.fabricate_next(content, store, chain)?);
        }
        Ok(reports)
    }
}

impl SegmentEngineBuilder {
    pub fn config_file(mut self, path: &str) -> Self {
        self.config_path = Some(path.to_string());
        self
    }

    pub fn output_format(mut self, format: OutputFormat) -> Self {
        self.output_format = format;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Provide configuration directly (for testing without files).
    pub fn config(mut self, config: FabricationConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Share a digest cache instead of creating one from the configuration.
    pub fn digests(mut self, digests: Arc<DigestCache>) -> Self {
        self.digests = Some(digests);
        self
    }

    pub fn build(self) -> Result<SegmentEngine, EngineError> {
        // A config file overrides any directly provided configuration
        let config = match (&self.config_path, self.config) {
            (Some(path), _) => FabricationConfig::load_from_ron(Path::new(path))?,
            (None, Some(config)) => config,
            (None, None) => FabricationConfig::default(),
        };
        config.validate()?;

        let digests = self
            .digests
            .unwrap_or_else(|| Arc::new(DigestCache::new(&config.digest_cache)));

        Ok(SegmentEngine {
            config,
            digests,
            output_format: self.output_format,
            seed: self.seed,
        })
    }
}
