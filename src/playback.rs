//! # Playback Order and Event Flattening
//!
//! Turning the measure graph into the music as actually heard.
//!
//! [`MeasureIter`] walks a voice's graph from its entry point, expanding
//! repeats and selecting endings by counting visits per measure:
//!
//! - a measure with no `alternate_next` always advances via `next`;
//! - a branch-point measure advances via `next` when its prior visits are
//!   even (the first time and every loop pass) and via `alternate_next` when
//!   they are odd (the escape pass).
//!
//! Each branch point counts independently, which makes nested repeats and
//! nested endings come out right. The walk is iterative, not recursive, so
//! arbitrarily long pieces cannot overflow the stack, and it terminates when
//! `next` is absent. Graphs the parser builds are always well-formed; a
//! hand-built graph with a loop and no escape edge will iterate forever.
//!
//! [`events`] flattens a whole [`Piece`] into per-voice
//! `(pitch, start, duration)` triples with exact global start times, which
//! is everything a sequencer needs.

use crate::fraction::Fraction;
use crate::pitch::Pitch;
use crate::score::{MeasureId, Piece, Voice};
use serde::Serialize;
use std::collections::HashMap;

/// Iterator over the measures of one voice in played order.
pub struct MeasureIter<'a> {
    voice: &'a Voice,
    current: Option<MeasureId>,
    started: bool,
    times_seen: HashMap<MeasureId, usize>,
}

impl<'a> MeasureIter<'a> {
    pub(crate) fn new(voice: &'a Voice) -> Self {
        Self {
            voice,
            current: None,
            started: false,
            times_seen: HashMap::new(),
        }
    }
}

impl<'a> Iterator for MeasureIter<'a> {
    type Item = MeasureId;

    fn next(&mut self) -> Option<MeasureId> {
        if !self.started {
            self.started = true;
            self.current = self.voice.start();
            return self.current;
        }

        let current = self.current?;
        let measure = self.voice.measure(current);
        measure.next()?;

        // Count this departure; parity decides the branch below.
        let seen = self.times_seen.entry(current).or_insert(0);
        *seen += 1;
        let departures = *seen;

        self.current = match measure.alternate_next() {
            // Not a branch point: always the plain successor.
            None => measure.next(),
            // Even departures (second, fourth, ...) take the escape.
            Some(alternate) if departures % 2 == 0 => Some(alternate),
            _ => measure.next(),
        };
        self.current
    }
}

/// One playable event: a pitch sounding at an exact global time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaybackEvent {
    pub pitch: Pitch,
    /// Global start time, as a fraction of a whole note from the beginning.
    pub start: Fraction,
    pub duration: Fraction,
}

/// The events of a single voice, in played order.
#[derive(Debug, Clone, Serialize)]
pub struct VoiceEvents {
    pub voice: String,
    pub events: Vec<PlaybackEvent>,
}

/// Flattens every voice of a piece into timed events.
///
/// Global time advances by each measure's actual duration, so pickup
/// measures shift the following music exactly as far as they are long.
pub fn events(piece: &Piece) -> Vec<VoiceEvents> {
    piece
        .voices()
        .iter()
        .map(|voice| {
            let mut events = Vec::new();
            let mut global = Fraction::ZERO;
            for id in voice.play_order() {
                let measure = voice.measure(id);
                for (note, offset) in measure.notes() {
                    if let Some(pitch) = note.pitch {
                        events.push(PlaybackEvent {
                            pitch,
                            start: global + *offset,
                            duration: note.duration,
                        });
                    }
                }
                global = global + measure.duration();
            }
            VoiceEvents {
                voice: voice.name.clone(),
                events,
            }
        })
        .collect()
}
