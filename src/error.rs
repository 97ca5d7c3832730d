//! # Error Types
//!
//! This module defines all error types for the abc parser.
//!
//! Every error is fatal to the `parse` call that raised it: callers receive
//! either a fully consistent [`Piece`](crate::score::Piece) or an error,
//! never a partially built one. There is no recovery or resynchronization.
//!
//! ## Error Types
//! - `Lexical` - no token type matches at the cursor
//! - `Grammar` - tokens present but out of grammar order
//! - `Bounds` - a note or rest violates a timing invariant
//! - `Fraction` - invalid rational arithmetic (zero denominator, inverting zero)

use crate::fraction::FractionError;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum AbcError {
    /// No token type matches at the cursor.
    ///
    /// Carries the head of the unmatched input so the offending text can be
    /// located in the source.
    #[error("no token matches the input at \"{rest}\"")]
    Lexical { rest: String },

    /// Tokens are present but violate the grammar: missing or misordered
    /// header fields, malformed field bodies, unterminated chords, illegal
    /// modifier combinations, undeclared voices, unmatched repeat markers.
    #[error("grammar error: {message}")]
    Grammar { message: String },

    /// A note or rest violates a timing invariant: negative start offset or
    /// non-positive duration.
    #[error("bounds error: {message}")]
    Bounds { message: String },

    /// Rational arithmetic failed while computing a duration.
    #[error(transparent)]
    Fraction(#[from] FractionError),
}

impl AbcError {
    pub(crate) fn grammar(message: impl Into<String>) -> Self {
        AbcError::Grammar {
            message: message.into(),
        }
    }

    pub(crate) fn bounds(message: impl Into<String>) -> Self {
        AbcError::Bounds {
            message: message.into(),
        }
    }
}
