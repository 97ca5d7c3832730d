//! # Score Data Model
//!
//! This module defines the structures a parse produces.
//!
//! ## Type Hierarchy
//! ```text
//! Piece
//!   ├── title, composer, track number
//!   ├── default note length, meter, tempo, key
//!   └── Vec<Voice>
//!         ├── name
//!         ├── arena of Measures (addressed by MeasureId)
//!         │     ├── duration: Fraction
//!         │     ├── notes: Vec<(Note, start offset)>
//!         │     ├── next: Option<MeasureId>
//!         │     └── alternate_next: Option<MeasureId>
//!         └── start: entry-point MeasureId
//! ```
//!
//! ## The measure graph
//!
//! Measures form a directed, possibly cyclic graph: `next` is the ordinary
//! successor, `alternate_next` the detour taken when escaping a repeat or
//! entering a second ending. Each voice owns its reachable measures in an
//! arena and links them by stable [`MeasureId`] handles rather than
//! references, so cycles need no shared ownership. Handles are only
//! meaningful to the voice that minted them.
//!
//! Rests are never stored: a rest advances time (growing the measure if
//! needed) without producing a playable event.
//!
//! Ownership is hierarchical - a `Piece` owns its `Voice`s, a `Voice` its
//! measures - and nothing is expected to mutate after `parse` returns.

use crate::error::AbcError;
use crate::fraction::Fraction;
use crate::pitch::Pitch;
use crate::playback::MeasureIter;
use serde::Serialize;

/// A single note: a strictly positive duration and a pitch, or no pitch for
/// a rest. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Note {
    pub duration: Fraction,
    pub pitch: Option<Pitch>,
}

impl Note {
    pub fn new(duration: Fraction, pitch: Pitch) -> Self {
        Self {
            duration,
            pitch: Some(pitch),
        }
    }

    pub fn rest(duration: Fraction) -> Self {
        Self {
            duration,
            pitch: None,
        }
    }

    pub fn is_rest(&self) -> bool {
        self.pitch.is_none()
    }
}

/// A stable handle into one voice's measure arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct MeasureId(usize);

/// One bar of music: its notes with start offsets, and up to two successor
/// edges.
///
/// `duration` starts at the nominal meter-implied length and grows to the
/// actual end offset if the content runs past it; a short pickup measure
/// keeps the larger nominal value. Invariant for every stored note:
/// `0 <= offset` and `offset + note.duration <= duration`.
#[derive(Debug, Clone, Serialize)]
pub struct Measure {
    duration: Fraction,
    notes: Vec<(Note, Fraction)>,
    next: Option<MeasureId>,
    alternate_next: Option<MeasureId>,
}

impl Measure {
    fn new(nominal: Fraction) -> Self {
        Self {
            duration: nominal,
            notes: Vec::new(),
            next: None,
            alternate_next: None,
        }
    }

    pub fn duration(&self) -> Fraction {
        self.duration
    }

    /// The notes with their start offsets, in the order they were added.
    pub fn notes(&self) -> &[(Note, Fraction)] {
        &self.notes
    }

    pub fn next(&self) -> Option<MeasureId> {
        self.next
    }

    pub fn alternate_next(&self) -> Option<MeasureId> {
        self.alternate_next
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    /// The largest fraction dividing every note duration and start offset in
    /// this measure, or `None` if it holds no notes.
    pub fn smallest_division(&self) -> Option<Fraction> {
        self.notes.iter().fold(None, |acc, (note, offset)| {
            let unit = note.duration.gcd(*offset);
            Some(match acc {
                Some(acc) => acc.gcd(unit),
                None => unit,
            })
        })
    }
}

/// A named voice: an entry-point measure plus the arena holding its graph.
#[derive(Debug, Clone, Serialize)]
pub struct Voice {
    pub name: String,
    measures: Vec<Measure>,
    start: Option<MeasureId>,
}

impl Voice {
    /// A voice with no measures yet, as declared in a header.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            measures: Vec::new(),
            start: None,
        }
    }

    /// The entry-point measure, once any measure exists.
    pub fn start(&self) -> Option<MeasureId> {
        self.start
    }

    /// Allocates a fresh empty measure with the given nominal duration.
    /// The first measure allocated becomes the voice's entry point.
    pub fn add_measure(&mut self, nominal: Fraction) -> MeasureId {
        let id = MeasureId(self.measures.len());
        self.measures.push(Measure::new(nominal));
        if self.start.is_none() {
            self.start = Some(id);
        }
        id
    }

    /// Borrows a measure. The handle must have been minted by this voice.
    pub fn measure(&self, id: MeasureId) -> &Measure {
        &self.measures[id.0]
    }

    pub fn measure_count(&self) -> usize {
        self.measures.len()
    }

    pub fn set_next(&mut self, id: MeasureId, next: Option<MeasureId>) {
        self.measures[id.0].next = next;
    }

    pub fn set_alternate_next(&mut self, id: MeasureId, alternate: Option<MeasureId>) {
        self.measures[id.0].alternate_next = alternate;
    }

    /// Adds a note at the given start offset, growing the measure's duration
    /// if the note runs past its current end.
    pub fn add_note(&mut self, id: MeasureId, note: Note, offset: Fraction) -> Result<(), AbcError> {
        if note.is_rest() {
            return Err(AbcError::bounds(
                "a rest has no pitch and is never stored; it only advances time",
            ));
        }
        self.check_bounds(note.duration, offset)?;
        let end = offset + note.duration;
        let measure = &mut self.measures[id.0];
        if end > measure.duration {
            measure.duration = end;
        }
        measure.notes.push((note, offset));
        Ok(())
    }

    /// Accounts for a rest: validates its timing and grows the measure, but
    /// stores nothing.
    pub fn add_rest(
        &mut self,
        id: MeasureId,
        duration: Fraction,
        offset: Fraction,
    ) -> Result<(), AbcError> {
        self.check_bounds(duration, offset)?;
        let end = offset + duration;
        let measure = &mut self.measures[id.0];
        if end > measure.duration {
            measure.duration = end;
        }
        Ok(())
    }

    fn check_bounds(&self, duration: Fraction, offset: Fraction) -> Result<(), AbcError> {
        if offset < Fraction::ZERO {
            return Err(AbcError::bounds(format!(
                "start offset {offset} is negative"
            )));
        }
        if !duration.is_positive() {
            return Err(AbcError::bounds(format!(
                "duration {duration} is not positive"
            )));
        }
        Ok(())
    }

    /// The last measure reached by following `next` edges from the start.
    ///
    /// Only meaningful during construction, before any repeat back-edge
    /// exists; once the graph is cyclic the walk stops after visiting as
    /// many measures as the arena holds.
    pub fn tail(&self) -> Option<MeasureId> {
        let mut current = self.start?;
        for _ in 0..self.measures.len() {
            match self.measure(current).next {
                Some(next) => current = next,
                None => break,
            }
        }
        Some(current)
    }

    /// Iterates over the measures as actually played, expanding repeats and
    /// selecting endings.
    pub fn play_order(&self) -> MeasureIter<'_> {
        MeasureIter::new(self)
    }

    /// The largest fraction dividing every timing value in this voice, or
    /// `None` if no measure holds a note.
    pub fn smallest_division(&self) -> Option<Fraction> {
        self.measures
            .iter()
            .filter_map(|m| m.smallest_division())
            .fold(None, |acc, unit| {
                Some(match acc {
                    Some(acc) => acc.gcd(unit),
                    None => unit,
                })
            })
    }
}

/// A complete parsed piece.
///
/// The parser populates every field; `Default` supplies the documented
/// fallbacks (composer "Unknown") with zeroed timing that the header pass
/// replaces.
#[derive(Debug, Clone, Serialize)]
pub struct Piece {
    pub title: String,
    pub composer: String,
    pub track_number: u32,
    /// Duration a note with no explicit length gets.
    pub default_note_length: Fraction,
    /// Nominal length of one measure, as a fraction of a whole note.
    pub meter: Fraction,
    /// Default-length notes per minute.
    pub tempo: u32,
    pub key: String,
    voices: Vec<Voice>,
}

impl Default for Piece {
    fn default() -> Self {
        Self {
            title: String::new(),
            composer: "Unknown".to_string(),
            track_number: 0,
            default_note_length: Fraction::ZERO,
            meter: Fraction::ZERO,
            tempo: 0,
            key: String::new(),
            voices: Vec::new(),
        }
    }
}

impl Piece {
    pub fn voices(&self) -> &[Voice] {
        &self.voices
    }

    pub fn add_voice(&mut self, voice: Voice) {
        self.voices.push(voice);
    }

    pub fn voice(&self, name: &str) -> Option<&Voice> {
        self.voices.iter().find(|v| v.name == name)
    }

    pub(crate) fn voice_mut(&mut self, name: &str) -> Option<&mut Voice> {
        self.voices.iter_mut().find(|v| v.name == name)
    }

    /// The common subdivision unit across all voices: the largest fraction
    /// dividing every duration and offset in the piece. Renderers use this
    /// to pick an exact tick grid.
    pub fn smallest_division(&self) -> Option<Fraction> {
        self.voices
            .iter()
            .filter_map(|v| v.smallest_division())
            .fold(None, |acc, unit| {
                Some(match acc {
                    Some(acc) => acc.gcd(unit),
                    None => unit,
                })
            })
    }
}
