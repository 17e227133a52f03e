/// Digests: aggregate statistics over a content scope, computed once and cached.
///
/// The chord Markov digest records which chord follows (and precedes) every
/// run of up to N chords in the library, keyed relative to each sequence's
/// key so that transposed progressions count as the same observation.

use rand::distributions::WeightedIndex;
use rand::prelude::Distribution;
use rand::rngs::StdRng;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::core::cache::{CachePolicy, TtlCache};
use crate::core::config::DigestCacheConfig;
use crate::core::music::{Chord, Key};
use crate::core::scoring::normalize_meme;
use crate::schema::content::{InstrumentId, ProgramId, SourceMaterial};

/// Descriptor of a sequence boundary in precedent-state keys.
const BOOKEND: &str = "---";
/// Separator between nodes of a precedent-state descriptor.
const STATE_SEPARATOR: &str = ":";

/// One observed state of a chord sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChordNode {
    /// Start or end of a sequence.
    Bookend,
    /// A chord as a semitone offset from the key root plus its form.
    Chord { delta: u8, form: String },
}

impl ChordNode {
    pub fn relative(chord: &Chord, key: &Key) -> Self {
        Self::Chord {
            delta: (chord.root.semitone() - key.root.semitone()).rem_euclid(12) as u8,
            form: chord.form(),
        }
    }

    pub fn is_chord(&self) -> bool {
        matches!(self, Self::Chord { .. })
    }

    /// Chord nodes of a whole progression, without bookends. Unparseable
    /// chord names are skipped.
    pub fn progression<'a, I>(names: I, key: &Key) -> Vec<ChordNode>
    where
        I: IntoIterator<Item = &'a str>,
    {
        names
            .into_iter()
            .filter_map(|name| name.parse::<Chord>().ok())
            .map(|chord| Self::relative(&chord, key))
            .collect()
    }
}

impl fmt::Display for ChordNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bookend => f.write_str(BOOKEND),
            Self::Chord { delta, form } => write!(f, "{}|{}", delta, form),
        }
    }
}

/// Canonical key for a run of preceding nodes.
pub fn precedent_descriptor(nodes: &[ChordNode]) -> String {
    nodes
        .iter()
        .map(ChordNode::to_string)
        .collect::<Vec<_>>()
        .join(STATE_SEPARATOR)
}

/// Everything observed after (or before, in the reverse map) one precedent state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChordMarkovNode {
    pub precedent: Vec<ChordNode>,
    /// Observed next nodes with counts, in first-observed order.
    pub observations: Vec<(ChordNode, u32)>,
}

impl ChordMarkovNode {
    pub fn total(&self) -> u32 {
        self.observations.iter().map(|(_, n)| n).sum()
    }

    pub fn count_of(&self, node: &ChordNode) -> u32 {
        self.observations
            .iter()
            .find(|(n, _)| n == node)
            .map(|(_, c)| *c)
            .unwrap_or(0)
    }
}

type NodeMap = FxHashMap<String, ChordMarkovNode>;

/// Order-N chord transition statistics for one content scope.
#[derive(Debug, Clone, Default)]
pub struct ChordMarkovDigest {
    order: usize,
    forward: NodeMap,
    reverse: NodeMap,
}

impl ChordMarkovDigest {
    /// Digest every chord-bearing sequence in the library.
    pub fn compute(source: &SourceMaterial, order: usize) -> Self {
        let mut forward = NodeMap::default();
        let mut reverse = NodeMap::default();
        let order = order.max(1);

        for program in &source.programs {
            for sequence in &program.sequences {
                if sequence.chords.is_empty() {
                    continue;
                }
                let key: Key = match sequence.key_or(program).parse() {
                    Ok(key) => key,
                    Err(e) => {
                        debug!(
                            program = %program.id,
                            sequence = %sequence.id,
                            error = %e,
                            "skipping sequence with unparseable key"
                        );
                        continue;
                    }
                };
                let names = sequence.sorted_chords();
                let chords = ChordNode::progression(names.iter().map(|c| c.name.as_str()), &key);
                if chords.is_empty() {
                    continue;
                }

                let mut nodes = Vec::with_capacity(chords.len() + 2);
                nodes.push(ChordNode::Bookend);
                nodes.extend(chords);
                nodes.push(ChordNode::Bookend);

                observe_all(&mut forward, &nodes, order);
                nodes.reverse();
                observe_all(&mut reverse, &nodes, order);
            }
        }

        Self {
            order,
            forward,
            reverse,
        }
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn forward(&self) -> &FxHashMap<String, ChordMarkovNode> {
        &self.forward
    }

    pub fn reverse(&self) -> &FxHashMap<String, ChordMarkovNode> {
        &self.reverse
    }

    /// What was observed to follow exactly this run of nodes.
    pub fn following(&self, precedent: &[ChordNode]) -> Option<&ChordMarkovNode> {
        self.forward.get(&precedent_descriptor(precedent))
    }

    /// What was observed to precede exactly this run of nodes (given in reverse time).
    pub fn preceding(&self, successors: &[ChordNode]) -> Option<&ChordMarkovNode> {
        self.reverse.get(&precedent_descriptor(successors))
    }

    /// How conventional a progression is for this library, in [0, 1].
    ///
    /// Averages, over each chord, the probability of that chord given the
    /// longest run of preceding chords (starting from the opening bookend)
    /// that was ever observed.
    pub fn progression_affinity(&self, chords: &[ChordNode]) -> f64 {
        if chords.is_empty() {
            return 0.0;
        }
        let mut history: Vec<ChordNode> = vec![ChordNode::Bookend];
        let mut sum = 0.0;
        for chord in chords {
            if let Some(node) = self.longest_match(&history) {
                sum += node.count_of(chord) as f64 / node.total().max(1) as f64;
            }
            history.push(chord.clone());
        }
        sum / chords.len() as f64
    }

    /// Weighted random walk forward from the opening bookend, backing off to
    /// shorter precedent runs when a longer one was never observed. Stops at
    /// a closing bookend or after `max_len` chords.
    pub fn walk(&self, rng: &mut StdRng, max_len: usize) -> Vec<ChordNode> {
        let mut result = Vec::new();
        let mut buffer: VecDeque<ChordNode> = VecDeque::from(vec![ChordNode::Bookend]);

        while result.len() < max_len {
            let history: Vec<ChordNode> = buffer.iter().cloned().collect();
            let next = match self.longest_match(&history).and_then(|n| pick_next(n, rng)) {
                Some(next) => next,
                None => break,
            };
            if !next.is_chord() {
                break;
            }
            result.push(next.clone());
            buffer.push_back(next);
            while buffer.len() > self.order {
                buffer.pop_front();
            }
        }
        result
    }

    fn longest_match(&self, history: &[ChordNode]) -> Option<&ChordMarkovNode> {
        let size = history.len();
        let deepest = size.min(self.order);
        (1..=deepest)
            .rev()
            .find_map(|n| self.following(&history[size - n..]))
    }
}

/// Register each node under every suffix of the preceding buffer.
fn observe_all(map: &mut NodeMap, nodes: &[ChordNode], order: usize) {
    let mut buffer: VecDeque<ChordNode> = VecDeque::with_capacity(order + 1);
    for node in nodes {
        if !buffer.is_empty() {
            let run: Vec<ChordNode> = buffer.iter().cloned().collect();
            for start in 0..run.len() {
                add_observation(map, &run[start..], node.clone());
            }
        }
        buffer.push_back(node.clone());
        if buffer.len() > order {
            buffer.pop_front();
        }
    }
}

fn add_observation(map: &mut NodeMap, precedent: &[ChordNode], next: ChordNode) {
    let node = map
        .entry(precedent_descriptor(precedent))
        .or_insert_with(|| ChordMarkovNode {
            precedent: precedent.to_vec(),
            observations: Vec::new(),
        });
    if let Some(entry) = node.observations.iter_mut().find(|(n, _)| *n == next) {
        entry.1 += 1;
    } else {
        node.observations.push((next, 1));
    }
}

fn pick_next(node: &ChordMarkovNode, rng: &mut StdRng) -> Option<ChordNode> {
    if node.observations.is_empty() {
        return None;
    }
    let weights: Vec<u32> = node.observations.iter().map(|(_, c)| *c).collect();
    let dist = WeightedIndex::new(&weights).ok()?;
    Some(node.observations[dist.sample(rng)].0.clone())
}

/// Which programs and instruments carry each meme in a content scope.
#[derive(Debug, Clone, Default)]
pub struct MemeDigest {
    programs: BTreeMap<String, BTreeSet<ProgramId>>,
    instruments: BTreeMap<String, BTreeSet<InstrumentId>>,
}

impl MemeDigest {
    pub fn compute(source: &SourceMaterial) -> Self {
        let mut digest = Self::default();
        for program in &source.programs {
            let binding_memes = program.bindings.iter().flat_map(|b| b.memes.iter());
            for meme in program.memes.iter().chain(binding_memes) {
                digest
                    .programs
                    .entry(normalize_meme(meme))
                    .or_default()
                    .insert(program.id);
            }
        }
        for instrument in &source.instruments {
            for meme in &instrument.memes {
                digest
                    .instruments
                    .entry(normalize_meme(meme))
                    .or_default()
                    .insert(instrument.id);
            }
        }
        digest
    }

    /// All memes, sorted.
    pub fn memes(&self) -> Vec<&str> {
        let all: BTreeSet<&str> = self
            .programs
            .keys()
            .chain(self.instruments.keys())
            .map(String::as_str)
            .collect();
        all.into_iter().collect()
    }

    pub fn programs_with(&self, meme: &str) -> Vec<ProgramId> {
        self.programs
            .get(&normalize_meme(meme))
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn instruments_with(&self, meme: &str) -> Vec<InstrumentId> {
        self.instruments
            .get(&normalize_meme(meme))
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }
}

/// Process-wide digest cache, shared by every fabricator through a handle.
pub struct DigestCache {
    chord_markov: TtlCache<(String, usize), Arc<ChordMarkovDigest>>,
    memes: TtlCache<String, Arc<MemeDigest>>,
}

impl DigestCache {
    pub fn new(config: &DigestCacheConfig) -> Self {
        let policy = CachePolicy {
            capacity: config.capacity,
            ttl: Duration::from_secs(config.ttl_secs),
            refresh_after: Duration::from_secs(config.refresh_after_secs),
        };
        Self {
            chord_markov: TtlCache::new(policy),
            memes: TtlCache::new(policy),
        }
    }

    pub fn chord_markov(&self, source: &SourceMaterial, order: usize) -> Arc<ChordMarkovDigest> {
        let key = (source.scope.clone(), order);
        self.chord_markov.get_or_load(&key, || {
            debug!(scope = %source.scope, order, "computing chord markov digest");
            Arc::new(ChordMarkovDigest::compute(source, order))
        })
    }

    pub fn memes(&self, source: &SourceMaterial) -> Arc<MemeDigest> {
        self.memes.get_or_load(&source.scope, || {
            debug!(scope = %source.scope, "computing meme digest");
            Arc::new(MemeDigest::compute(source))
        })
    }
}

impl Default for DigestCache {
    fn default() -> Self {
        Self::new(&DigestCacheConfig::default())
    }
}
