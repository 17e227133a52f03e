/// Candidate scoring: meme isometry, Gaussian entropy and the top-candidate picker.

use rand::rngs::StdRng;
use rand::Rng;
use rustc_hash::{FxHashMap, FxHashSet};
use std::hash::Hash;

/// Canonical form of a meme name: trimmed and upper-cased.
pub fn normalize_meme(name: &str) -> String {
    name.trim().to_uppercase()
}

/// A set of normalized memes that other meme sets are compared against.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemeIsometry {
    memes: FxHashSet<String>,
}

impl MemeIsometry {
    pub fn of<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            memes: names
                .into_iter()
                .map(|n| normalize_meme(n.as_ref()))
                .filter(|n| !n.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.memes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.memes.len()
    }

    pub fn contains(&self, meme: &str) -> bool {
        self.memes.contains(&normalize_meme(meme))
    }

    /// Similarity to another meme set, in [0, 1].
    pub fn score(&self, other: &MemeIsometry) -> f64 {
        isometry(self, other)
    }

    /// Sorted memes joined into one key, identifying this exact meme set.
    pub fn constellation(&self) -> String {
        let mut names: Vec<&str> = self.memes.iter().map(String::as_str).collect();
        names.sort_unstable();
        names.join("_")
    }
}

/// Symmetric overlap-normalized similarity (intersection over union).
///
/// Empty sets never match anything, including each other.
pub fn isometry(a: &MemeIsometry, b: &MemeIsometry) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.memes.intersection(&b.memes).count();
    let union = a.memes.len() + b.memes.len() - shared;
    shared as f64 / union as f64
}

/// Draw from Normal(mean, sigma) using the Box–Muller transform.
pub fn normally_around(rng: &mut StdRng, mean: f64, sigma: f64) -> f64 {
    if sigma <= 0.0 {
        return mean;
    }
    // 1 - u keeps the logarithm finite
    let u1: f64 = 1.0 - rng.gen::<f64>();
    let u2: f64 = rng.gen::<f64>();
    let z = (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
    mean + z * sigma
}

/// Weights for one scoring decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreTerms {
    pub meme_weight: f64,
    pub entropy_sigma: f64,
    pub bound_bonus: f64,
}

/// Score one candidate against a target meme set.
///
/// `entropy + meme_weight × isometry [+ bound_bonus] + extra`. A candidate
/// without memes scores exactly 0 unless it is directly bound, and in that
/// case no entropy is drawn for it.
pub fn score_candidate(
    rng: &mut StdRng,
    terms: &ScoreTerms,
    target: &MemeIsometry,
    candidate_memes: &[String],
    directly_bound: bool,
    extra: f64,
) -> f64 {
    let candidate = MemeIsometry::of(candidate_memes);
    if candidate.is_empty() && !directly_bound {
        return 0.0;
    }
    let mut score = normally_around(rng, 0.0, terms.entropy_sigma)
        + terms.meme_weight * target.score(&candidate)
        + extra;
    if directly_bound {
        score += terms.bound_bonus;
    }
    score
}

/// Accumulates scores per entity and returns the best one.
///
/// Ties go to whichever entity was scored first, so results are
/// deterministic for a deterministic insertion order.
#[derive(Debug, Clone)]
pub struct EntityScorePicker<T> {
    entries: Vec<(T, f64)>,
    index: FxHashMap<T, usize>,
}

impl<T> Default for EntityScorePicker<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            index: FxHashMap::default(),
        }
    }
}

impl<T: Clone + Eq + Hash> EntityScorePicker<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `delta` to the entity's score, creating the entry at `delta`.
    pub fn score(&mut self, id: T, delta: f64) {
        match self.index.get(&id) {
            Some(&i) => self.entries[i].1 += delta,
            None => {
                self.index.insert(id.clone(), self.entries.len());
                self.entries.push((id, delta));
            }
        }
    }

    pub fn score_of(&self, id: &T) -> Option<f64> {
        self.index.get(id).map(|&i| self.entries[i].1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get_top(&self) -> Option<T> {
        let mut best: Option<&(T, f64)> = None;
        for entry in &self.entries {
            match best {
                Some(b) if b.1 >= entry.1 => {}
                _ => best = Some(entry),
            }
        }
        best.map(|(id, _)| id.clone())
    }
}
