//! The `Pitch` value type.
//!
//! A pitch is an absolute chromatic position numbered the MIDI way: middle C
//! is 60, one semitone is one step, one octave is twelve. Transposition
//! composes additively, so `p.transpose(a).transpose(b) == p.transpose(a + b)`.

use serde::Serialize;
use std::fmt;

/// Semitone offsets of the natural letters from C within one octave.
const LETTER_STEPS: [(char, i32); 7] = [
    ('C', 0),
    ('D', 2),
    ('E', 4),
    ('F', 5),
    ('G', 7),
    ('A', 9),
    ('B', 11),
];

/// MIDI number of middle C, the reference octave for key resolution.
const MIDDLE_C: i32 = 60;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Pitch {
    midi: i32,
}

impl Pitch {
    /// The natural pitch of a letter A-G at the reference octave.
    /// Accepts either case; returns `None` for anything outside A-G.
    pub fn natural(letter: char) -> Option<Pitch> {
        let letter = letter.to_ascii_uppercase();
        LETTER_STEPS
            .iter()
            .find(|(l, _)| *l == letter)
            .map(|(_, step)| Pitch {
                midi: MIDDLE_C + step,
            })
    }

    /// Shifts the pitch by a signed number of semitones.
    pub fn transpose(self, semitones: i32) -> Pitch {
        Pitch {
            midi: self.midi + semitones,
        }
    }

    /// The MIDI note number.
    pub fn midi(self) -> i32 {
        self.midi
    }
}

impl fmt::Debug for Pitch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pitch({})", self.midi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_octave() {
        // C4=60 D4=62 E4=64 F4=65 G4=67 A4=69 B4=71
        let expected = [
            ('C', 60),
            ('D', 62),
            ('E', 64),
            ('F', 65),
            ('G', 67),
            ('A', 69),
            ('B', 71),
        ];
        for (letter, midi) in expected {
            assert_eq!(Pitch::natural(letter).unwrap().midi(), midi);
            assert_eq!(
                Pitch::natural(letter.to_ascii_lowercase()).unwrap().midi(),
                midi
            );
        }
    }

    #[test]
    fn test_non_letter_rejected() {
        assert_eq!(Pitch::natural('H'), None);
        assert_eq!(Pitch::natural('z'), None);
    }

    #[test]
    fn test_transpose_composes_additively() {
        let c = Pitch::natural('C').unwrap();
        assert_eq!(c.transpose(12).midi(), 72);
        assert_eq!(c.transpose(1).transpose(-1), c);
        assert_eq!(c.transpose(3).transpose(4), c.transpose(7));
    }
}
