//! A parser for the abc music notation language.
//!
//! The crate turns a complete abc document into a [`Piece`]: exact-rational
//! timing throughout, a repeat-aware measure graph per voice, and an
//! iterator that expands that graph into the measures as actually played.
//!
//! ```rust
//! use abc::parse;
//!
//! let piece = parse("X:1\nT:Scale\nK:C\nC D E F|G A B c|\n")?;
//! assert_eq!(piece.title, "Scale");
//! let voice = &piece.voices()[0];
//! for id in voice.play_order() {
//!     for (note, offset) in voice.measure(id).notes() {
//!         // exact (pitch, start, duration) data for a sequencer
//!         let _ = (note.pitch, offset, note.duration);
//!     }
//! }
//! # Ok::<(), abc::AbcError>(())
//! ```
//!
//! Reading files, command-line handling and audio output are deliberately
//! out of scope; [`playback::events`] is the hand-off point for renderers.

pub mod error;
pub mod fraction;
pub mod key;
pub mod lexer;
pub mod parser;
pub mod pitch;
pub mod playback;
pub mod score;

pub use error::AbcError;
pub use fraction::{Fraction, FractionError};
pub use key::{key_signature, Key};
pub use parser::parse;
pub use pitch::Pitch;
pub use playback::{events, MeasureIter, PlaybackEvent, VoiceEvents};
pub use score::{Measure, MeasureId, Note, Piece, Voice};
