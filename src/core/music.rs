/// Music theory primitives: pitch classes, notes, keys, chords and tuning.
///
/// Everything here is plain value arithmetic. Craft code only needs
/// transpose-by-semitones, conforming a note to a chord voicing, key deltas
/// and Hz pitch from a fixed A4 root.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MusicError {
    #[error("unrecognized note: {0:?}")]
    BadNote(String),
    #[error("unrecognized chord: {0:?}")]
    BadChord(String),
    #[error("unrecognized key: {0:?}")]
    BadKey(String),
    #[error("tuning root must be a positive frequency, got {0}")]
    BadTuning(f64),
}

/// Absolute semitone index of A4, counting from C0.
const A4_SEMITONES: i32 = 4 * 12 + 9;

/// Tones written this way carry no pitch (drum hits, noises).
pub const ATONAL: &str = "X";

/// Which accidental to prefer when a pitch class is spelled out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Adjustment {
    #[default]
    Flat,
    Sharp,
}

/// One of the twelve equal-tempered pitch classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PitchClass {
    C,
    Db,
    D,
    Eb,
    E,
    F,
    Gb,
    G,
    Ab,
    A,
    Bb,
    B,
}

const PITCH_CLASSES: [PitchClass; 12] = [
    PitchClass::C,
    PitchClass::Db,
    PitchClass::D,
    PitchClass::Eb,
    PitchClass::E,
    PitchClass::F,
    PitchClass::Gb,
    PitchClass::G,
    PitchClass::Ab,
    PitchClass::A,
    PitchClass::Bb,
    PitchClass::B,
];

const FLAT_NAMES: [&str; 12] = [
    "C", "Db", "D", "Eb", "E", "F", "Gb", "G", "Ab", "A", "Bb", "B",
];
const SHARP_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

impl PitchClass {
    pub fn from_semitone(n: i32) -> Self {
        PITCH_CLASSES[n.rem_euclid(12) as usize]
    }

    pub fn semitone(self) -> i32 {
        self as i32
    }

    pub fn transpose(self, semitones: i32) -> Self {
        Self::from_semitone(self.semitone() + semitones)
    }

    /// Signed shortest move from `self` to `other`, in -5..=6 semitones.
    pub fn delta_to(self, other: PitchClass) -> i32 {
        let d = (other.semitone() - self.semitone()).rem_euclid(12);
        if d > 6 {
            d - 12
        } else {
            d
        }
    }

    pub fn name(self, adjustment: Adjustment) -> &'static str {
        match adjustment {
            Adjustment::Flat => FLAT_NAMES[self as usize],
            Adjustment::Sharp => SHARP_NAMES[self as usize],
        }
    }

    /// Parse a leading note name ("C", "Eb", "F#") off the front of `s`.
    ///
    /// Returns the pitch class, the accidental style it was written in (if
    /// any), and the remainder of the string.
    fn parse_prefix(s: &str) -> Option<(Self, Option<Adjustment>, &str)> {
        let mut chars = s.char_indices();
        let (_, letter) = chars.next()?;
        let base = match letter {
            'C' => 0,
            'D' => 2,
            'E' => 4,
            'F' => 5,
            'G' => 7,
            'A' => 9,
            'B' => 11,
            _ => return None,
        };
        let mut semitone = base;
        let mut adjustment = None;
        let mut rest_at = letter.len_utf8();
        for (i, c) in chars {
            match c {
                '#' | '♯' => {
                    semitone += 1;
                    adjustment = Some(Adjustment::Sharp);
                }
                'b' | '♭' => {
                    semitone -= 1;
                    adjustment = Some(Adjustment::Flat);
                }
                _ => {
                    rest_at = i;
                    break;
                }
            }
            rest_at = i + c.len_utf8();
        }
        Some((Self::from_semitone(semitone), adjustment, &s[rest_at..]))
    }
}

impl fmt::Display for PitchClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name(Adjustment::Flat))
    }
}

/// A pitched note: pitch class plus octave (C4 is middle C).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Note {
    pub pitch_class: PitchClass,
    pub octave: i32,
}

impl Note {
    pub fn new(pitch_class: PitchClass, octave: i32) -> Self {
        Self {
            pitch_class,
            octave,
        }
    }

    /// Absolute semitones above C0.
    pub fn semitones(&self) -> i32 {
        self.octave * 12 + self.pitch_class.semitone()
    }

    pub fn from_semitones(n: i32) -> Self {
        Self {
            pitch_class: PitchClass::from_semitone(n),
            octave: n.div_euclid(12),
        }
    }

    pub fn transpose(&self, semitones: i32) -> Self {
        Self::from_semitones(self.semitones() + semitones)
    }

    /// Parse tones as written on an event, `None` when atonal.
    pub fn parse_tones(tones: &str) -> Result<Option<Note>, MusicError> {
        let trimmed = tones.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(ATONAL) {
            return Ok(None);
        }
        trimmed.parse().map(Some)
    }

    /// Move this note to the nearest pitch class found among `candidates`.
    ///
    /// Distance is absolute semitones around the pitch-class circle; the
    /// first candidate wins ties. The octave follows the shortest move, so
    /// Eb3 against a C2/Eb2/G2 voicing stays Eb3.
    pub fn conform_to(&self, candidates: &[Note]) -> Note {
        let mut best: Option<i32> = None;
        for candidate in candidates {
            let delta = self.pitch_class.delta_to(candidate.pitch_class);
            match best {
                Some(b) if b.abs() <= delta.abs() => {}
                _ => best = Some(delta),
            }
        }
        match best {
            Some(delta) => self.transpose(delta),
            None => *self,
        }
    }

    pub fn name(&self, adjustment: Adjustment) -> String {
        format!("{}{}", self.pitch_class.name(adjustment), self.octave)
    }
}

impl FromStr for Note {
    type Err = MusicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (pitch_class, _, rest) =
            PitchClass::parse_prefix(trimmed).ok_or_else(|| MusicError::BadNote(s.to_string()))?;
        let octave = rest
            .trim()
            .parse::<i32>()
            .map_err(|_| MusicError::BadNote(s.to_string()))?;
        Ok(Self::new(pitch_class, octave))
    }
}

impl fmt::Display for Note {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name(Adjustment::Flat))
    }
}

/// Parse a voicing such as "C2, Eb2, G2" into notes. Empty means no voicing.
pub fn parse_notes(s: &str) -> Result<Vec<Note>, MusicError> {
    s.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .map(str::parse)
        .collect()
}

/// Render notes back to voicing text.
pub fn format_notes(notes: &[Note], adjustment: Adjustment) -> String {
    notes
        .iter()
        .map(|n| n.name(adjustment))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    Major,
    Minor,
}

/// A musical key: root plus mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
    pub root: PitchClass,
    pub mode: Mode,
    pub adjustment: Adjustment,
}

impl Key {
    pub fn new(root: PitchClass, mode: Mode) -> Self {
        Self {
            root,
            mode,
            adjustment: Adjustment::Flat,
        }
    }

    pub fn transpose(&self, semitones: i32) -> Self {
        Self {
            root: self.root.transpose(semitones),
            ..*self
        }
    }

    /// Semitones to transpose `from` by so that it lands on `to` shifted by
    /// `shift`, normalized to the shortest move.
    pub fn delta(from: &Key, to: &Key, shift: i32) -> i32 {
        from.root.delta_to(to.root.transpose(shift))
    }
}

impl FromStr for Key {
    type Err = MusicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (root, adjustment, rest) =
            PitchClass::parse_prefix(trimmed).ok_or_else(|| MusicError::BadKey(s.to_string()))?;
        let rest = rest.trim();
        let mode = if rest == "M" {
            Mode::Major
        } else {
            match rest.to_ascii_lowercase().as_str() {
                "" | "maj" | "major" => Mode::Major,
                "m" | "min" | "minor" | "-" => Mode::Minor,
                _ => return Err(MusicError::BadKey(s.to_string())),
            }
        };
        Ok(Self {
            root,
            mode,
            adjustment: adjustment.unwrap_or_default(),
        })
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.mode {
            Mode::Major => "Major",
            Mode::Minor => "Minor",
        };
        write!(f, "{} {}", self.root.name(self.adjustment), mode)
    }
}

/// A chord symbol: root, optional slash bass, and the suffix as written.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Chord {
    pub root: PitchClass,
    pub bass: Option<PitchClass>,
    pub suffix: String,
    pub adjustment: Adjustment,
}

impl Chord {
    /// Normalized chord form, independent of root and spelling.
    pub fn form(&self) -> String {
        let trimmed = self.suffix.trim();
        if trimmed == "M" {
            return "major".to_string();
        }
        let lower = trimmed.to_ascii_lowercase();
        match lower.as_str() {
            "" | "maj" | "major" => "major".to_string(),
            "m" | "min" | "minor" | "-" => "minor".to_string(),
            _ => lower.split_whitespace().collect::<Vec<_>>().join(" "),
        }
    }

    pub fn transpose(&self, semitones: i32) -> Self {
        Self {
            root: self.root.transpose(semitones),
            bass: self.bass.map(|b| b.transpose(semitones)),
            suffix: self.suffix.clone(),
            adjustment: self.adjustment,
        }
    }

    pub fn name(&self, adjustment: Adjustment) -> String {
        let mut out = format!("{}{}", self.root.name(adjustment), self.suffix);
        if let Some(bass) = self.bass {
            out.push('/');
            out.push_str(bass.name(adjustment));
        }
        out
    }
}

impl FromStr for Chord {
    type Err = MusicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (head, bass) = match trimmed.rsplit_once('/') {
            Some((head, bass)) => {
                let (bass, _, rest) = PitchClass::parse_prefix(bass.trim())
                    .ok_or_else(|| MusicError::BadChord(s.to_string()))?;
                if !rest.trim().is_empty() {
                    return Err(MusicError::BadChord(s.to_string()));
                }
                (head, Some(bass))
            }
            None => (trimmed, None),
        };
        let (root, adjustment, suffix) =
            PitchClass::parse_prefix(head).ok_or_else(|| MusicError::BadChord(s.to_string()))?;
        Ok(Self {
            root,
            bass,
            suffix: suffix.trim_end().to_string(),
            adjustment: adjustment.unwrap_or_default(),
        })
    }
}

impl fmt::Display for Chord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name(self.adjustment))
    }
}

/// Equal temperament anchored at a fixed A4 frequency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tuning {
    a4_hz: f64,
}

impl Tuning {
    pub fn at_a4(hz: f64) -> Result<Self, MusicError> {
        if !(hz.is_finite() && hz > 0.0) {
            return Err(MusicError::BadTuning(hz));
        }
        Ok(Self { a4_hz: hz })
    }

    pub fn a4(&self) -> f64 {
        self.a4_hz
    }

    /// Pitch in Hz: root × 2^(Δsemitones/12).
    pub fn pitch(&self, note: &Note) -> f64 {
        let delta = (note.semitones() - A4_SEMITONES) as f64;
        self.a4_hz * (delta / 12.0).exp2()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(s: &str) -> Note {
        s.parse().unwrap()
    }

    #[test]
    fn parse_notes_with_accidentals() {
        assert_eq!(note("Eb3"), Note::new(PitchClass::Eb, 3));
        assert_eq!(note("D#3"), Note::new(PitchClass::Eb, 3));
        assert_eq!(note("C#4"), Note::new(PitchClass::Db, 4));
        assert_eq!(note("Cb4"), Note::new(PitchClass::B, 3).transpose(12));
        assert_eq!(note("A-1").octave, -1);
        assert!("H3".parse::<Note>().is_err());
        assert!("C".parse::<Note>().is_err());
    }

    #[test]
    fn atonal_tones_have_no_note() {
        assert_eq!(Note::parse_tones("X").unwrap(), None);
        assert_eq!(Note::parse_tones("").unwrap(), None);
        assert_eq!(Note::parse_tones(" G2 ").unwrap(), Some(note("G2")));
    }

    #[test]
    fn transpose_crosses_octaves() {
        assert_eq!(note("B3").transpose(1), note("C4"));
        assert_eq!(note("C4").transpose(-1), note("B3"));
        assert_eq!(note("C4").transpose(-13), note("B2"));
    }

    #[test]
    fn conform_keeps_exact_match() {
        let voicing = parse_notes("C2, Eb2, G2").unwrap();
        let conformed = note("Eb3").conform_to(&voicing);
        assert_eq!(conformed.pitch_class, PitchClass::Eb);
        assert_eq!(conformed, note("Eb3"));
    }

    #[test]
    fn conform_moves_to_nearest_pitch_class() {
        let voicing = parse_notes("C2, Eb2, G2").unwrap();
        assert_eq!(note("D3").conform_to(&voicing), note("Eb3"));
        assert_eq!(note("B3").conform_to(&voicing), note("C4"));
        assert_eq!(note("Ab3").conform_to(&voicing), note("G3"));
    }

    #[test]
    fn conform_ties_go_to_first_candidate() {
        let voicing = parse_notes("C2 E2").unwrap();
        assert_eq!(note("D3").conform_to(&voicing), note("C3"));
        let reversed = parse_notes("E2 C2").unwrap();
        assert_eq!(note("D3").conform_to(&reversed), note("E3"));
    }

    #[test]
    fn conform_to_empty_voicing_is_identity() {
        assert_eq!(note("F#2").conform_to(&[]), note("F#2"));
    }

    #[test]
    fn chord_forms_normalize() {
        let c: Chord = "C minor".parse().unwrap();
        assert_eq!(c.root, PitchClass::C);
        assert_eq!(c.form(), "minor");
        assert_eq!("Cm".parse::<Chord>().unwrap().form(), "minor");
        assert_eq!("C-".parse::<Chord>().unwrap().form(), "minor");
        assert_eq!("G".parse::<Chord>().unwrap().form(), "major");
        assert_eq!("GM".parse::<Chord>().unwrap().form(), "major");
        assert_eq!("Bb  Dom7".parse::<Chord>().unwrap().form(), "dom7");
    }

    #[test]
    fn chord_transpose_keeps_suffix_and_bass() {
        let c: Chord = "C minor/G".parse().unwrap();
        let d = c.transpose(2);
        assert_eq!(d.name(Adjustment::Flat), "D minor/A");
        assert_eq!(d.form(), "minor");
    }

    #[test]
    fn key_parse_and_delta() {
        let c: Key = "C minor".parse().unwrap();
        let g: Key = "G".parse().unwrap();
        assert_eq!(c.mode, Mode::Minor);
        assert_eq!(g.mode, Mode::Major);
        assert_eq!(Key::delta(&c, &g, 0), -5);
        assert_eq!(Key::delta(&g, &c, 0), 5);
        assert_eq!(Key::delta(&c, &c, 3), 3);
        assert_eq!(Key::delta(&c, &c, 12), 0);
        assert!("Q major".parse::<Key>().is_err());
    }

    #[test]
    fn tuning_at_432() {
        let tuning = Tuning::at_a4(432.0).unwrap();
        let close = |n: &str, hz: f64| (tuning.pitch(&note(n)) - hz).abs() < 0.01;
        assert!(close("C0", 16.05));
        assert!(close("C1", 32.11));
        assert!(close("C2", 64.22));
        assert!(close("A3", 216.00));
        assert!(close("C4", 256.87));
        assert!(close("A4", 432.00));
    }

    #[test]
    fn tuning_rejects_non_positive_root() {
        assert_eq!(Tuning::at_a4(0.0), Err(MusicError::BadTuning(0.0)));
        assert!(Tuning::at_a4(-440.0).is_err());
    }
}
