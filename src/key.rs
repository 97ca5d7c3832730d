//! Key-signature resolution via the circle of fifths.
//!
//! A key name maps to a position on the circle of fifths, and that position
//! says how many letters of the fixed sharp order (F C G D A E B) or flat
//! order (B E A D G C F) are raised or lowered a semitone from natural. The
//! resolved [`Key`] maps each letter A-G to its [`Pitch`] at the reference
//! octave.
//!
//! Key names are matched case-insensitively. An unrecognized name resolves
//! to nothing; the caller rejects it.

use crate::pitch::Pitch;
use std::collections::HashMap;

/// Major keys in sharp order: position i carries i sharps.
const FIFTHS_MAJOR_SHARP: [&str; 8] = ["C", "G", "D", "A", "E", "B", "F#", "C#"];
/// Major keys in flat order: position i carries i flats.
const FIFTHS_MAJOR_FLAT: [&str; 8] = ["C", "F", "Bb", "Eb", "Ab", "Db", "Gb", "Cb"];
/// Relative minors of the sharp-side majors.
const FIFTHS_MINOR_SHARP: [&str; 8] = ["am", "em", "bm", "f#m", "c#m", "g#m", "d#m", "a#m"];
/// Relative minors of the flat-side majors.
const FIFTHS_MINOR_FLAT: [&str; 8] = ["am", "dm", "gm", "cm", "fm", "bbm", "ebm", "abm"];

/// The order sharps accumulate.
const SHARPS: [char; 7] = ['F', 'C', 'G', 'D', 'A', 'E', 'B'];
/// The order flats accumulate.
const FLATS: [char; 7] = ['B', 'E', 'A', 'D', 'G', 'C', 'F'];

/// A resolved key signature: each letter's default pitch at the reference
/// octave.
#[derive(Debug, Clone, PartialEq)]
pub struct Key {
    scale: HashMap<char, Pitch>,
}

impl Key {
    /// Builds a key from the letters it sharpens or flattens.
    fn with_accidentals(letters: &[char], shift: i32) -> Key {
        let mut scale = HashMap::new();
        for letter in ['A', 'B', 'C', 'D', 'E', 'F', 'G'] {
            // The letter set is fixed, so natural() always resolves.
            if let Some(pitch) = Pitch::natural(letter) {
                scale.insert(letter, pitch);
            }
        }
        for &letter in letters {
            if let Some(pitch) = scale.get_mut(&letter) {
                *pitch = pitch.transpose(shift);
            }
        }
        Key { scale }
    }

    /// The pitch a letter denotes in this key at the reference octave.
    /// Accepts either case; `None` outside A-G.
    pub fn pitch(&self, letter: char) -> Option<Pitch> {
        self.scale.get(&letter.to_ascii_uppercase()).copied()
    }
}

/// Resolves a key name to its seven-letter scale, case-insensitively.
pub fn key_signature(name: &str) -> Option<Key> {
    let position = |table: &[&str; 8]| table.iter().position(|k| k.eq_ignore_ascii_case(name));

    if let Some(i) = position(&FIFTHS_MAJOR_SHARP).or_else(|| position(&FIFTHS_MINOR_SHARP)) {
        return Some(Key::with_accidentals(&SHARPS[..i], 1));
    }
    if let Some(i) = position(&FIFTHS_MAJOR_FLAT).or_else(|| position(&FIFTHS_MINOR_FLAT)) {
        return Some(Key::with_accidentals(&FLATS[..i], -1));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn midi(key: &Key, letter: char) -> i32 {
        key.pitch(letter).unwrap().midi()
    }

    #[test]
    fn test_c_major_is_all_naturals() {
        let key = key_signature("C").unwrap();
        for (letter, expected) in [('C', 60), ('D', 62), ('E', 64), ('F', 65), ('G', 67), ('A', 69), ('B', 71)]
        {
            assert_eq!(midi(&key, letter), expected);
        }
    }

    #[test]
    fn test_major_sharp_keys() {
        // G major: one sharp, F#.
        let g = key_signature("G").unwrap();
        assert_eq!(midi(&g, 'F'), 66);
        assert_eq!(midi(&g, 'C'), 60);

        // E major: F# C# G# D#.
        let e = key_signature("E").unwrap();
        assert_eq!(midi(&e, 'F'), 66);
        assert_eq!(midi(&e, 'C'), 61);
        assert_eq!(midi(&e, 'G'), 68);
        assert_eq!(midi(&e, 'D'), 63);
        assert_eq!(midi(&e, 'A'), 69);
        assert_eq!(midi(&e, 'B'), 71);
    }

    #[test]
    fn test_major_flat_keys() {
        // Eb major: Bb Eb Ab.
        let eb = key_signature("Eb").unwrap();
        assert_eq!(midi(&eb, 'B'), 70);
        assert_eq!(midi(&eb, 'E'), 63);
        assert_eq!(midi(&eb, 'A'), 68);
        assert_eq!(midi(&eb, 'D'), 62);

        // Cb major: every letter flattened.
        let cb = key_signature("Cb").unwrap();
        for letter in ['A', 'B', 'C', 'D', 'E', 'F', 'G'] {
            let natural = Pitch::natural(letter).unwrap();
            assert_eq!(midi(&cb, letter), natural.midi() - 1);
        }
    }

    #[test]
    fn test_relative_minors_share_signatures() {
        assert_eq!(key_signature("am").unwrap(), key_signature("C").unwrap());
        assert_eq!(key_signature("em").unwrap(), key_signature("G").unwrap());
        assert_eq!(key_signature("c#m").unwrap(), key_signature("E").unwrap());
        assert_eq!(key_signature("cm").unwrap(), key_signature("Eb").unwrap());
        assert_eq!(key_signature("abm").unwrap(), key_signature("Cb").unwrap());
    }

    #[test]
    fn test_case_insensitive() {
        assert_eq!(key_signature("c").unwrap(), key_signature("C").unwrap());
        assert_eq!(key_signature("eb").unwrap(), key_signature("Eb").unwrap());
        assert_eq!(key_signature("AM").unwrap(), key_signature("am").unwrap());
    }

    #[test]
    fn test_unrecognized_key() {
        assert!(key_signature("H").is_none());
        assert!(key_signature("C#b").is_none());
        assert!(key_signature("").is_none());
    }
}
