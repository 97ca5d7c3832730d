//! # Parser
//!
//! This module turns abc source text into a [`Piece`].
//!
//! ## Pipeline
//! 1. The token table below splits the source into tokens (see
//!    [`crate::lexer`]; declaration order decides ties, so the table is an
//!    ordered list).
//! 2. The header parser consumes leading field lines (`X:` track number,
//!    `T:` title, optional `C:`/`L:`/`M:`/`Q:`/`V:` fields) until the `K:`
//!    key field, which resolves the scale and terminates the header.
//! 3. The body parser attaches music to the currently selected voice:
//!    notes, rests, chords, tuplets, and the barline family that closes
//!    measures and wires the repeat graph.
//!
//! ## Per-voice parse state
//!
//! Each voice carries its own context while its music is being read:
//! the open measure and running offset, a stack of open-repeat measures
//! (nesting), the anchor measure preceding a first ending, and the
//! measure-scoped accidental memory keyed by (letter, octave). A `V:` line
//! in the body switches contexts; the name must already be declared.
//!
//! Every violation is fatal: the first bad token aborts the parse with an
//! error naming the offending text. There is no recovery and no partial
//! result.

use crate::error::AbcError;
use crate::fraction::Fraction;
use crate::key::{key_signature, Key};
use crate::lexer::{Lexer, Token, TokenDef};
use crate::pitch::Pitch;
use crate::score::{MeasureId, Note, Piece, Voice};
use log::{debug, trace};
use once_cell::sync::Lazy;
use std::collections::HashMap;

/// The token types of the abc grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tok {
    FieldNumber,
    FieldTitle,
    FieldComposer,
    FieldDefaultLength,
    FieldMeter,
    FieldTempo,
    FieldVoice,
    FieldKey,
    Basenote,
    KeyAccidental,
    Accidental,
    ModeMinor,
    Meter,
    Octave,
    Duplet,
    Triplet,
    Quadruplet,
    OpenRepeat,
    CloseRepeat,
    DoubleBarline,
    Barline,
    FirstEnding,
    SecondEnding,
    Fraction,
    LooseFraction,
    Digits,
    Rest,
    OpenChord,
    CloseChord,
    Comment,
    Newline,
    Space,
}

/// The ordered token table. Earlier entries shadow later ones wherever both
/// match, so this order is part of the language: `|:` must precede `|`,
/// `3/4` must lex as one fraction rather than digits, and a basenote wins
/// over the bare `C` meter shorthand.
static LEXER: Lazy<Lexer<Tok>> = Lazy::new(|| {
    Lexer::new(vec![
        TokenDef::new(Tok::FieldNumber, r"X:\s*\d+\n"),
        TokenDef::new(Tok::FieldTitle, r"T:.*\n"),
        TokenDef::new(Tok::FieldComposer, r"C:.*\n"),
        TokenDef::new(Tok::FieldDefaultLength, r"L:"),
        TokenDef::new(Tok::FieldMeter, r"M:"),
        TokenDef::new(Tok::FieldTempo, r"Q:"),
        TokenDef::new(Tok::FieldVoice, r"V:.*\n"),
        TokenDef::new(Tok::FieldKey, r"K:"),
        TokenDef::new(Tok::Basenote, r"[a-gA-G]"),
        TokenDef::new(Tok::KeyAccidental, r"[#b]"),
        TokenDef::new(Tok::Accidental, r"(\^{1,2})|(_{1,2})|(=)"),
        TokenDef::new(Tok::ModeMinor, r"m"),
        TokenDef::new(Tok::Meter, r"(C)|(C\|)"),
        TokenDef::new(Tok::Octave, r"('+)|(,+)"),
        TokenDef::new(Tok::Duplet, r"\(2"),
        TokenDef::new(Tok::Triplet, r"\(3"),
        TokenDef::new(Tok::Quadruplet, r"\(4"),
        TokenDef::new(Tok::OpenRepeat, r"\|:"),
        TokenDef::new(Tok::CloseRepeat, r":\|"),
        TokenDef::new(Tok::DoubleBarline, r"(\|\|)|(\[\|)|(\|\])"),
        TokenDef::new(Tok::Barline, r"\|"),
        TokenDef::new(Tok::FirstEnding, r"\[1"),
        TokenDef::new(Tok::SecondEnding, r"\[2"),
        TokenDef::new(Tok::Fraction, r"\d+/\d+"),
        TokenDef::new(Tok::LooseFraction, r"\d*/\d*"),
        TokenDef::new(Tok::Digits, r"\d+"),
        TokenDef::new(Tok::Rest, r"z"),
        TokenDef::new(Tok::OpenChord, r"\["),
        TokenDef::new(Tok::CloseChord, r"\]"),
        TokenDef::new(Tok::Comment, r"%.*\n"),
        TokenDef::new(Tok::Newline, r"\n"),
        TokenDef::new(Tok::Space, r"[\s]+"),
    ])
});

/// Tokenizes abc source without parsing it.
pub fn lex(input: &str) -> Result<Vec<Token<Tok>>, AbcError> {
    LEXER.lex(input)
}

/// Parses a complete abc document into a [`Piece`].
///
/// This is the main entry point of the crate. The whole input is consumed;
/// the first grammar violation aborts with an error and no partial result.
pub fn parse(source: &str) -> Result<Piece, AbcError> {
    let tokens = lex(source)?;
    let mut parser = Parser::new(tokens);
    let mut piece = Piece::default();
    let key = parser.parse_header(&mut piece)?;
    parser.parse_body(&mut piece, &key)?;
    Ok(piece)
}

/// Scale factors for duplets, triplets and quadruplets: n notes squeezed
/// into a different number of notes' worth of time.
fn tuplet_shape(kind: Tok) -> Option<(usize, i64, i64)> {
    match kind {
        Tok::Duplet => Some((2, 3, 2)),
        Tok::Triplet => Some((3, 2, 3)),
        Tok::Quadruplet => Some((4, 3, 4)),
        _ => None,
    }
}

/// The text of a field line after its two-character marker, trimmed.
fn field_text(text: &str) -> String {
    text[2..].trim().to_string()
}

fn parse_int(text: &str) -> Result<i64, AbcError> {
    text.trim()
        .parse()
        .map_err(|_| AbcError::grammar(format!("invalid number \"{}\"", text.trim())))
}

/// `n/d` with both parts present.
fn parse_strict_fraction(text: &str) -> Result<Fraction, AbcError> {
    let (num, den) = text
        .split_once('/')
        .ok_or_else(|| AbcError::grammar(format!("invalid fraction \"{text}\"")))?;
    Ok(Fraction::new(parse_int(num)?, parse_int(den)?)?)
}

/// The shorthand fraction forms: `/` is 1/2, `n/` is n/2, `/d` is 1/d.
fn parse_loose_fraction(text: &str) -> Result<Fraction, AbcError> {
    if text == "/" {
        return Ok(Fraction::new(1, 2)?);
    }
    if let Some(num) = text.strip_suffix('/') {
        return Ok(Fraction::new(parse_int(num)?, 2)?);
    }
    if let Some(den) = text.strip_prefix('/') {
        return Ok(Fraction::new(1, parse_int(den)?)?);
    }
    Err(AbcError::grammar(format!("invalid fraction \"{text}\"")))
}

/// Accidental text to a semitone shift. `=` is an explicit natural.
fn accidental_semitones(text: &str) -> Result<i32, AbcError> {
    match text {
        "^" => Ok(1),
        "^^" => Ok(2),
        "_" => Ok(-1),
        "__" => Ok(-2),
        "=" => Ok(0),
        other => Err(AbcError::grammar(format!("invalid accidental \"{other}\""))),
    }
}

fn natural_pitch(letter: char) -> Result<Pitch, AbcError> {
    Pitch::natural(letter)
        .ok_or_else(|| AbcError::grammar(format!("\"{letter}\" is not a note letter")))
}

/// Parse state for one voice: the open measure, the running offset within
/// it, the repeat bookkeeping, and the measure-scoped accidental memory.
///
/// Contexts are private to one `parse` call and one voice, so interleaved
/// voices and concurrent parses never share state.
struct VoiceCtx {
    current: Option<MeasureId>,
    offset: Fraction,
    /// The current measure is the voice's untouched entry measure; leading
    /// barlines and open-repeats reuse it instead of closing it.
    virgin: bool,
    /// Open-repeat measures, innermost last.
    open_repeats: Vec<MeasureId>,
    /// The measure preceding the most recent first-ending marker.
    ending_anchor: Option<MeasureId>,
    /// (letter, octave) to semitone shift, reset at every measure boundary.
    accidentals: HashMap<(char, i32), i32>,
    /// The measure whose plain `next` edge points at the still-empty current
    /// measure; cleared once the measure has content. A dangling empty
    /// measure left by a trailing barline is unlinked through this.
    tail_edge: Option<MeasureId>,
}

impl VoiceCtx {
    fn new() -> Self {
        Self {
            current: None,
            offset: Fraction::ZERO,
            virgin: false,
            open_repeats: Vec::new(),
            ending_anchor: None,
            accidentals: HashMap::new(),
            tail_edge: None,
        }
    }

    fn content_added(&mut self) {
        self.virgin = false;
        self.tail_edge = None;
    }
}

/// Returns the open measure for the context, allocating the voice's entry
/// measure on first use.
fn ensure_measure(voice: &mut Voice, ctx: &mut VoiceCtx, nominal: Fraction) -> MeasureId {
    match ctx.current {
        Some(id) => id,
        None => {
            let id = voice.add_measure(nominal);
            ctx.current = Some(id);
            ctx.virgin = true;
            id
        }
    }
}

fn music_target<'a>(
    piece: &'a mut Piece,
    ctxs: &'a mut HashMap<String, VoiceCtx>,
    name: &str,
) -> Result<(&'a mut Voice, &'a mut VoiceCtx), AbcError> {
    let voice = piece
        .voice_mut(name)
        .ok_or_else(|| AbcError::grammar(format!("undeclared voice \"{name}\"")))?;
    let ctx = ctxs
        .get_mut(name)
        .ok_or_else(|| AbcError::grammar(format!("undeclared voice \"{name}\"")))?;
    Ok((voice, ctx))
}

struct Parser {
    tokens: Vec<Token<Tok>>,
    position: usize,
}

impl Parser {
    fn new(tokens: Vec<Token<Tok>>) -> Self {
        Self {
            tokens,
            position: 0,
        }
    }

    fn peek_kind(&self) -> Option<Tok> {
        self.tokens.get(self.position).map(|t| t.kind)
    }

    fn bump(&mut self) -> Option<Token<Tok>> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    /// Skips spaces (not newlines) and returns the next token, as used
    /// inside header field lines.
    fn next_non_space(&mut self) -> Option<Token<Tok>> {
        while self.peek_kind() == Some(Tok::Space) {
            self.bump();
        }
        self.bump()
    }

    /// Skips the blank tokens that may separate header lines.
    fn skip_blank(&mut self) {
        while matches!(
            self.peek_kind(),
            Some(Tok::Space | Tok::Newline | Tok::Comment)
        ) {
            self.bump();
        }
    }

    /// Header field lines end at a newline; end of input also counts.
    fn expect_newline(&mut self, field: &str) -> Result<(), AbcError> {
        match self.bump() {
            None => Ok(()),
            Some(t) if t.kind == Tok::Newline => Ok(()),
            Some(t) => Err(AbcError::grammar(format!(
                "field {field} must be ended by a newline, found \"{}\"",
                t.text.trim_end()
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Header
    // ------------------------------------------------------------------

    /// Parses the header up to and including the `K:` field, and resolves
    /// the key signature. Creates the implicit "default" voice if the
    /// header declared none.
    fn parse_header(&mut self, piece: &mut Piece) -> Result<Key, AbcError> {
        piece.default_note_length = Fraction::new(1, 8)?;
        piece.meter = Fraction::new(4, 4)?;
        piece.tempo = 120;

        self.skip_blank();
        let first = self
            .bump()
            .ok_or_else(|| AbcError::grammar("the document is empty"))?;
        if first.kind != Tok::FieldNumber {
            return Err(AbcError::grammar(format!(
                "the header must start with the track number field X:, found \"{}\"",
                first.text.trim_end()
            )));
        }
        piece.track_number = parse_int(&field_text(&first.text))? as u32;
        debug!("track number set to {}", piece.track_number);

        self.skip_blank();
        let second = self
            .bump()
            .ok_or_else(|| AbcError::grammar("the header ends before the title field T:"))?;
        if second.kind != Tok::FieldTitle {
            return Err(AbcError::grammar(format!(
                "the second header field must be the title T:, found \"{}\"",
                second.text.trim_end()
            )));
        }
        piece.title = field_text(&second.text);
        debug!("title set to {}", piece.title);

        loop {
            self.skip_blank();
            let token = self
                .bump()
                .ok_or_else(|| AbcError::grammar("the header must end with a key field K:"))?;
            match token.kind {
                Tok::FieldComposer => {
                    piece.composer = field_text(&token.text);
                    debug!("composer set to {}", piece.composer);
                }
                Tok::FieldDefaultLength => {
                    let value = self.next_non_space().ok_or_else(|| {
                        AbcError::grammar("field L: must be followed by a note length")
                    })?;
                    if value.kind != Tok::Fraction {
                        return Err(AbcError::grammar(format!(
                            "field L: must be followed by a fraction note length, found \"{}\"",
                            value.text.trim_end()
                        )));
                    }
                    piece.default_note_length = parse_strict_fraction(&value.text)?;
                    self.expect_newline("L:")?;
                    debug!("default note length set to {}", piece.default_note_length);
                }
                Tok::FieldMeter => {
                    self.parse_meter_field(piece)?;
                    debug!("meter set to {}", piece.meter);
                }
                Tok::FieldTempo => {
                    let value = self.next_non_space().ok_or_else(|| {
                        AbcError::grammar("field Q: must be followed by a tempo")
                    })?;
                    if value.kind != Tok::Digits {
                        return Err(AbcError::grammar(format!(
                            "field Q: must be followed by an integer tempo, found \"{}\"",
                            value.text.trim_end()
                        )));
                    }
                    piece.tempo = parse_int(&value.text)? as u32;
                    self.expect_newline("Q:")?;
                    debug!("tempo set to {}", piece.tempo);
                }
                Tok::FieldVoice => {
                    let name = field_text(&token.text);
                    if piece.voice(&name).is_some() {
                        return Err(AbcError::grammar(format!(
                            "voice \"{name}\" is declared twice"
                        )));
                    }
                    debug!("declared voice {name}");
                    piece.add_voice(Voice::new(name));
                }
                Tok::FieldKey => {
                    let key = self.parse_key_field(piece)?;
                    if piece.voices().is_empty() {
                        piece.add_voice(Voice::new("default"));
                    }
                    debug!("key set to {}; header done", piece.key);
                    return Ok(key);
                }
                Tok::FieldNumber | Tok::FieldTitle => {
                    return Err(AbcError::grammar(format!(
                        "duplicate header field \"{}\"",
                        token.text.trim_end()
                    )));
                }
                _ => {
                    return Err(AbcError::grammar(format!(
                        "unexpected token \"{}\" in the header; the key field K: must close it",
                        token.text.trim_end()
                    )));
                }
            }
        }
    }

    /// `M:` accepts a strict fraction or the common-time shorthands `C` and
    /// `C|`, which both mean the default whole-note measure.
    fn parse_meter_field(&mut self, piece: &mut Piece) -> Result<(), AbcError> {
        let value = self
            .next_non_space()
            .ok_or_else(|| AbcError::grammar("field M: must be followed by a meter"))?;
        match value.kind {
            Tok::Fraction => piece.meter = parse_strict_fraction(&value.text)?,
            // "C" lexes as a basenote; "C|" continues with a barline token.
            Tok::Meter => {}
            Tok::Basenote if value.text == "C" => {
                if self.peek_kind() == Some(Tok::Barline) {
                    self.bump();
                }
            }
            _ => {
                return Err(AbcError::grammar(format!(
                    "field M: must be followed by a meter definition, found \"{}\"",
                    value.text.trim_end()
                )));
            }
        }
        self.expect_newline("M:")
    }

    /// Assembles the key name after `K:`: a basenote, an optional sharp or
    /// flat, an optional minor-mode `m`, terminated by a newline. Resolves
    /// it through the circle of fifths.
    fn parse_key_field(&mut self, piece: &mut Piece) -> Result<Key, AbcError> {
        let base = self
            .next_non_space()
            .ok_or_else(|| AbcError::grammar("field K: must be followed by a key note"))?;
        if base.kind != Tok::Basenote {
            return Err(AbcError::grammar(format!(
                "field K: must be followed by a key note, found \"{}\"",
                base.text.trim_end()
            )));
        }
        let mut name = base.text;
        let mut minor = false;
        loop {
            let Some(token) = self.bump() else { break };
            match token.kind {
                // A flat marker lexes as the basenote "b"; sharps come
                // through as their own token.
                Tok::KeyAccidental | Tok::Basenote if !minor && (token.text == "b" || token.text == "#") => {
                    name.push_str(&token.text);
                }
                Tok::KeyAccidental | Tok::Basenote if minor => {
                    return Err(AbcError::grammar(
                        "in field K: a key accidental must come before the minor mode marker",
                    ));
                }
                Tok::ModeMinor => {
                    name.push('m');
                    minor = true;
                }
                Tok::Newline => break,
                _ => {
                    return Err(AbcError::grammar(format!(
                        "field K: must be ended by a newline, found \"{}\"",
                        token.text.trim_end()
                    )));
                }
            }
        }
        let key = key_signature(&name)
            .ok_or_else(|| AbcError::grammar(format!("unrecognized key \"{name}\"")))?;
        piece.key = name;
        Ok(key)
    }

    // ------------------------------------------------------------------
    // Body
    // ------------------------------------------------------------------

    /// Parses the remainder of the stream, attaching music to the currently
    /// selected voice.
    fn parse_body(&mut self, piece: &mut Piece, key: &Key) -> Result<(), AbcError> {
        let meter = piece.meter;
        let default_len = piece.default_note_length;
        let mut ctxs: HashMap<String, VoiceCtx> = piece
            .voices()
            .iter()
            .map(|v| (v.name.clone(), VoiceCtx::new()))
            .collect();
        let mut current_voice = piece
            .voices()
            .first()
            .map(|v| v.name.clone())
            .ok_or_else(|| AbcError::grammar("no voice is available for the tune body"))?;
        let mut saw_music = false;

        while let Some(kind) = self.peek_kind() {
            match kind {
                Tok::Space | Tok::Newline | Tok::Comment => {
                    self.bump();
                }
                Tok::FieldVoice => {
                    let token = self
                        .bump()
                        .ok_or_else(|| AbcError::grammar("voice field expected"))?;
                    let name = field_text(&token.text);
                    if !ctxs.contains_key(&name) {
                        return Err(AbcError::grammar(format!("undeclared voice \"{name}\"")));
                    }
                    trace!("switched to voice {name}");
                    current_voice = name;
                }
                Tok::Accidental | Tok::Basenote => {
                    saw_music = true;
                    let (voice, ctx) = music_target(piece, &mut ctxs, &current_voice)?;
                    let id = ensure_measure(voice, ctx, meter);
                    let note = self.parse_note_element(default_len, key, ctx)?;
                    let duration = note.duration;
                    voice.add_note(id, note, ctx.offset)?;
                    ctx.offset = ctx.offset + duration;
                    ctx.content_added();
                }
                Tok::Rest => {
                    saw_music = true;
                    let (voice, ctx) = music_target(piece, &mut ctxs, &current_voice)?;
                    let id = ensure_measure(voice, ctx, meter);
                    let duration = self.parse_rest_element(default_len)?;
                    voice.add_rest(id, duration, ctx.offset)?;
                    ctx.offset = ctx.offset + duration;
                    ctx.content_added();
                }
                Tok::OpenChord => {
                    saw_music = true;
                    let (voice, ctx) = music_target(piece, &mut ctxs, &current_voice)?;
                    let id = ensure_measure(voice, ctx, meter);
                    self.parse_chord(default_len, key, voice, ctx, id)?;
                    ctx.content_added();
                }
                Tok::Duplet | Tok::Triplet | Tok::Quadruplet => {
                    saw_music = true;
                    let (voice, ctx) = music_target(piece, &mut ctxs, &current_voice)?;
                    let id = ensure_measure(voice, ctx, meter);
                    self.parse_tuplet(kind, default_len, key, voice, ctx, id)?;
                    ctx.content_added();
                }
                Tok::Barline
                | Tok::DoubleBarline
                | Tok::OpenRepeat
                | Tok::CloseRepeat
                | Tok::FirstEnding
                | Tok::SecondEnding => {
                    saw_music = true;
                    self.bump();
                    let (voice, ctx) = music_target(piece, &mut ctxs, &current_voice)?;
                    handle_structural(kind, voice, ctx, meter)?;
                }
                _ => {
                    let text = self.bump().map(|t| t.text).unwrap_or_default();
                    return Err(AbcError::grammar(format!(
                        "unexpected token \"{}\" in the tune body",
                        text.trim_end()
                    )));
                }
            }
        }

        if !saw_music {
            return Err(AbcError::grammar("the tune body is empty"));
        }

        // A trailing barline leaves a fresh empty measure behind; unlink it
        // so the played sequence ends with the last real bar.
        for (name, ctx) in &ctxs {
            if let (Some(current), Some(prev)) = (ctx.current, ctx.tail_edge) {
                if let Some(voice) = piece.voice_mut(name) {
                    if voice.measure(current).is_empty() && ctx.offset.is_zero() {
                        voice.set_next(prev, None);
                    }
                }
            }
        }
        Ok(())
    }

    /// A note element: optional accidental, a required letter, optional
    /// octave marks, an optional explicit length. Resolves the pitch
    /// against the accidental memory and the key signature.
    fn parse_note_element(
        &mut self,
        default_len: Fraction,
        key: &Key,
        ctx: &mut VoiceCtx,
    ) -> Result<Note, AbcError> {
        let first = self
            .bump()
            .ok_or_else(|| AbcError::grammar("note element expected"))?;

        let (accidental, base) = if first.kind == Tok::Accidental {
            let shift = accidental_semitones(&first.text)?;
            let base = self.bump().ok_or_else(|| {
                AbcError::grammar("an accidental must be followed by a note letter")
            })?;
            if base.kind != Tok::Basenote {
                return Err(AbcError::grammar(format!(
                    "an accidental must be followed by a note letter, found \"{}\"",
                    base.text.trim_end()
                )));
            }
            (Some(shift), base)
        } else {
            (None, first)
        };

        let letter_char = base
            .text
            .chars()
            .next()
            .ok_or_else(|| AbcError::grammar("empty note letter"))?;
        let letter = letter_char.to_ascii_uppercase();
        // A lowercase letter sits one octave above the reference octave.
        let mut octave: i32 = if letter_char.is_ascii_lowercase() { 1 } else { 0 };

        if self.peek_kind() == Some(Tok::Octave) {
            let marks = self
                .bump()
                .ok_or_else(|| AbcError::grammar("octave marks expected"))?;
            if marks.text.starts_with(',') {
                octave -= marks.text.len() as i32;
            } else {
                octave += marks.text.len() as i32;
            }
            if self.peek_kind() == Some(Tok::Octave) {
                return Err(AbcError::grammar(
                    "a note must not mix apostrophe and comma octave marks",
                ));
            }
        }

        let duration = self.parse_optional_length(default_len)?;

        let pitch = match accidental {
            Some(shift) => {
                // An explicit accidental overrides the key and is remembered
                // for the rest of the measure at this letter and octave.
                ctx.accidentals.insert((letter, octave), shift);
                natural_pitch(letter)?.transpose(shift + 12 * octave)
            }
            None => match ctx.accidentals.get(&(letter, octave)) {
                Some(&shift) => natural_pitch(letter)?.transpose(shift + 12 * octave),
                None => key
                    .pitch(letter)
                    .ok_or_else(|| {
                        AbcError::grammar(format!("\"{letter}\" is not a note letter"))
                    })?
                    .transpose(12 * octave),
            },
        };

        Ok(Note::new(duration, pitch))
    }

    /// A rest: `z` with an optional explicit length.
    fn parse_rest_element(&mut self, default_len: Fraction) -> Result<Fraction, AbcError> {
        self.bump();
        self.parse_optional_length(default_len)
    }

    /// An explicit note length, or the default: digits `n` mean n/2, a
    /// strict fraction is taken as written, and the loose forms `/`, `n/`
    /// and `/d` fill in 1 and 2.
    fn parse_optional_length(&mut self, default_len: Fraction) -> Result<Fraction, AbcError> {
        match self.peek_kind() {
            Some(Tok::Fraction) => {
                let token = self
                    .bump()
                    .ok_or_else(|| AbcError::grammar("note length expected"))?;
                parse_strict_fraction(&token.text)
            }
            Some(Tok::LooseFraction) => {
                let token = self
                    .bump()
                    .ok_or_else(|| AbcError::grammar("note length expected"))?;
                parse_loose_fraction(&token.text)
            }
            Some(Tok::Digits) => {
                let token = self
                    .bump()
                    .ok_or_else(|| AbcError::grammar("note length expected"))?;
                Ok(Fraction::new(parse_int(&token.text)?, 2)?)
            }
            _ => Ok(default_len),
        }
    }

    /// A chord `[...]`: every element starts together; the offset then
    /// advances by the longest element, rests included in the comparison.
    fn parse_chord(
        &mut self,
        default_len: Fraction,
        key: &Key,
        voice: &mut Voice,
        ctx: &mut VoiceCtx,
        id: MeasureId,
    ) -> Result<(), AbcError> {
        self.bump();
        let start = ctx.offset;
        let mut longest: Option<Fraction> = None;

        loop {
            match self.peek_kind() {
                None => return Err(AbcError::grammar("unterminated chord")),
                Some(Tok::CloseChord) => {
                    self.bump();
                    break;
                }
                Some(Tok::Space) => {
                    self.bump();
                }
                Some(Tok::Accidental | Tok::Basenote) => {
                    let note = self.parse_note_element(default_len, key, ctx)?;
                    let duration = note.duration;
                    voice.add_note(id, note, start)?;
                    longest = Some(longest.map_or(duration, |d| d.max(duration)));
                }
                Some(Tok::Rest) => {
                    let duration = self.parse_rest_element(default_len)?;
                    voice.add_rest(id, duration, start)?;
                    longest = Some(longest.map_or(duration, |d| d.max(duration)));
                }
                Some(_) => {
                    let text = self.bump().map(|t| t.text).unwrap_or_default();
                    return Err(AbcError::grammar(format!(
                        "unexpected token \"{}\" inside a chord",
                        text.trim_end()
                    )));
                }
            }
        }

        let longest =
            longest.ok_or_else(|| AbcError::grammar("a chord must contain at least one note"))?;
        ctx.offset = start + longest;
        Ok(())
    }

    /// A duplet, triplet or quadruplet: the next n note elements play with
    /// their durations scaled, sequentially like plain notes.
    fn parse_tuplet(
        &mut self,
        kind: Tok,
        default_len: Fraction,
        key: &Key,
        voice: &mut Voice,
        ctx: &mut VoiceCtx,
        id: MeasureId,
    ) -> Result<(), AbcError> {
        self.bump();
        let Some((count, num, den)) = tuplet_shape(kind) else {
            return Err(AbcError::grammar("tuplet marker expected"));
        };
        let factor = Fraction::new(num, den)?;

        for _ in 0..count {
            while self.peek_kind() == Some(Tok::Space) {
                self.bump();
            }
            match self.peek_kind() {
                Some(Tok::Accidental | Tok::Basenote) => {
                    let note = self.parse_note_element(default_len, key, ctx)?;
                    let scaled = note.duration * factor;
                    voice.add_note(
                        id,
                        Note {
                            duration: scaled,
                            ..note
                        },
                        ctx.offset,
                    )?;
                    ctx.offset = ctx.offset + scaled;
                }
                Some(Tok::Rest) => {
                    let scaled = self.parse_rest_element(default_len)? * factor;
                    voice.add_rest(id, scaled, ctx.offset)?;
                    ctx.offset = ctx.offset + scaled;
                }
                _ => {
                    return Err(AbcError::grammar(format!(
                        "a tuplet requires {count} note elements"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Closes the current measure and wires the repeat graph for one structural
/// token, then continues in a fresh measure.
fn handle_structural(
    kind: Tok,
    voice: &mut Voice,
    ctx: &mut VoiceCtx,
    nominal: Fraction,
) -> Result<(), AbcError> {
    let current = ensure_measure(voice, ctx, nominal);

    // A barline family token at the very start of a voice has nothing to
    // close; it decorates the entry measure instead.
    if ctx.virgin && matches!(kind, Tok::Barline | Tok::DoubleBarline | Tok::OpenRepeat) {
        match kind {
            Tok::Barline => {}
            Tok::DoubleBarline => {
                ctx.open_repeats.clear();
                ctx.open_repeats.push(current);
                ctx.ending_anchor = None;
            }
            Tok::OpenRepeat => ctx.open_repeats.push(current),
            _ => {}
        }
        ctx.accidentals.clear();
        ctx.virgin = false;
        return Ok(());
    }

    let closed = current;
    let fresh = voice.add_measure(nominal);
    // The plain-next edge into the fresh measure, recorded so a trailing
    // empty measure can be unlinked at end of input. Escape edges and
    // second-ending joins must survive, so those cases clear it.
    let mut tail_edge = Some(closed);

    match kind {
        Tok::Barline => {
            voice.set_next(closed, Some(fresh));
        }
        Tok::DoubleBarline => {
            voice.set_next(closed, Some(fresh));
            ctx.open_repeats.clear();
            ctx.open_repeats.push(fresh);
            ctx.ending_anchor = None;
        }
        Tok::OpenRepeat => {
            voice.set_next(closed, Some(fresh));
            ctx.open_repeats.push(fresh);
        }
        Tok::CloseRepeat => {
            let open = ctx
                .open_repeats
                .pop()
                .ok_or_else(|| AbcError::grammar("close-repeat with no open repeat to match"))?;
            voice.set_next(closed, Some(open));
            voice.set_alternate_next(closed, Some(fresh));
            tail_edge = None;
            trace!("repeat closed, looping back");
        }
        Tok::FirstEnding => {
            voice.set_next(closed, Some(fresh));
            ctx.ending_anchor = Some(closed);
            trace!("first ending opened");
        }
        Tok::SecondEnding => {
            voice.set_next(closed, Some(fresh));
            let anchor = ctx.ending_anchor.take().ok_or_else(|| {
                AbcError::grammar("second ending with no preceding first ending")
            })?;
            voice.set_alternate_next(anchor, Some(fresh));
            tail_edge = None;
            trace!("second ending wired");
        }
        _ => {
            return Err(AbcError::grammar("barline expected"));
        }
    }

    ctx.current = Some(fresh);
    ctx.offset = Fraction::ZERO;
    ctx.accidentals.clear();
    ctx.virgin = false;
    ctx.tail_edge = tail_edge;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frac(n: i64, d: i64) -> Fraction {
        Fraction::new(n, d).unwrap()
    }

    fn kinds(input: &str) -> Vec<Tok> {
        lex(input).unwrap().iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_lex_header_line() {
        assert_eq!(
            kinds("X:1\nT:Test\n"),
            vec![Tok::FieldNumber, Tok::FieldTitle]
        );
    }

    #[test]
    fn test_lex_notes_and_barline() {
        assert_eq!(
            kinds("A B|"),
            vec![Tok::Basenote, Tok::Space, Tok::Basenote, Tok::Barline]
        );
    }

    #[test]
    fn test_lex_repeat_markers_win_over_barline() {
        assert_eq!(kinds("|:"), vec![Tok::OpenRepeat]);
        assert_eq!(kinds(":|"), vec![Tok::CloseRepeat]);
        assert_eq!(kinds("||"), vec![Tok::DoubleBarline]);
        assert_eq!(kinds("|]"), vec![Tok::DoubleBarline]);
        assert_eq!(kinds("[|"), vec![Tok::DoubleBarline]);
        assert_eq!(kinds("[1"), vec![Tok::FirstEnding]);
        assert_eq!(kinds("[2"), vec![Tok::SecondEnding]);
        assert_eq!(kinds("["), vec![Tok::OpenChord]);
    }

    #[test]
    fn test_lex_fraction_wins_over_digits() {
        assert_eq!(kinds("3/4"), vec![Tok::Fraction]);
        assert_eq!(kinds("3/"), vec![Tok::LooseFraction]);
        assert_eq!(kinds("/4"), vec![Tok::LooseFraction]);
        assert_eq!(kinds("3"), vec![Tok::Digits]);
    }

    #[test]
    fn test_lex_accidentals_and_octaves() {
        assert_eq!(
            kinds("^A ''"),
            vec![Tok::Accidental, Tok::Basenote, Tok::Space, Tok::Octave]
        );
        assert_eq!(kinds("__"), vec![Tok::Accidental]);
        assert_eq!(kinds(",,"), vec![Tok::Octave]);
        assert_eq!(kinds("="), vec![Tok::Accidental]);
    }

    #[test]
    fn test_lex_tokens_reconstruct_input() {
        let input = "X:1\nT:x\nK:C\n|: A2 [CEz] (3abc :|[2 z/ |]\n% done\n";
        let tokens = lex(input).unwrap();
        let rebuilt: String = tokens.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(rebuilt, input);
    }

    #[test]
    fn test_lex_rejects_garbage() {
        assert!(matches!(
            lex("A ? B"),
            Err(AbcError::Lexical { .. })
        ));
    }

    #[test]
    fn test_loose_fraction_forms() {
        assert_eq!(parse_loose_fraction("/").unwrap(), frac(1, 2));
        assert_eq!(parse_loose_fraction("3/").unwrap(), frac(3, 2));
        assert_eq!(parse_loose_fraction("/4").unwrap(), frac(1, 4));
    }

    #[test]
    fn test_strict_fraction_zero_denominator() {
        assert!(matches!(
            parse_strict_fraction("1/0"),
            Err(AbcError::Fraction(_))
        ));
    }

    #[test]
    fn test_header_defaults() {
        let piece = parse("X:1\nT:Tune\nK:C\nA\n").unwrap();
        assert_eq!(piece.track_number, 1);
        assert_eq!(piece.title, "Tune");
        assert_eq!(piece.composer, "Unknown");
        assert_eq!(piece.default_note_length, frac(1, 8));
        assert_eq!(piece.meter, frac(1, 1));
        assert_eq!(piece.tempo, 120);
        assert_eq!(piece.key, "C");
        assert_eq!(piece.voices().len(), 1);
        assert_eq!(piece.voices()[0].name, "default");
    }

    #[test]
    fn test_header_full() {
        let source = "X: 7\nT:Full Header\nC:Someone\nL:1/16\nM:3/4\nQ:90\nV:upper\nV:lower\nK:G\nV:upper\nA\n";
        let piece = parse(source).unwrap();
        assert_eq!(piece.track_number, 7);
        assert_eq!(piece.composer, "Someone");
        assert_eq!(piece.default_note_length, frac(1, 16));
        assert_eq!(piece.meter, frac(3, 4));
        assert_eq!(piece.tempo, 90);
        assert_eq!(piece.key, "G");
        assert_eq!(piece.voices().len(), 2);
    }

    #[test]
    fn test_header_meter_common_time() {
        let piece = parse("X:1\nT:x\nM:C\nK:C\nA\n").unwrap();
        assert_eq!(piece.meter, frac(1, 1));
        let piece = parse("X:1\nT:x\nM:C|\nK:C\nA\n").unwrap();
        assert_eq!(piece.meter, frac(1, 1));
    }

    #[test]
    fn test_header_key_variants() {
        assert_eq!(parse("X:1\nT:x\nK:Eb\nA\n").unwrap().key, "Eb");
        assert_eq!(parse("X:1\nT:x\nK:F#m\nA\n").unwrap().key, "F#m");
        assert_eq!(parse("X:1\nT:x\nK:am\nA\n").unwrap().key, "am");
    }

    #[test]
    fn test_duplicate_voice_declaration_fails() {
        let err = parse("X:1\nT:x\nV:a\nV:a\nK:C\nA\n").unwrap_err();
        assert!(matches!(err, AbcError::Grammar { .. }));
    }

    #[test]
    fn test_header_missing_track_number() {
        let err = parse("T:Test\nK:C\nA\n").unwrap_err();
        assert!(matches!(err, AbcError::Grammar { .. }));
    }

    #[test]
    fn test_header_title_must_be_second() {
        let err = parse("X:1\nC:Someone\nT:Test\nK:C\nA\n").unwrap_err();
        assert!(matches!(err, AbcError::Grammar { .. }));
    }

    #[test]
    fn test_header_unrecognized_key() {
        let err = parse("X:1\nT:x\nK:Cm#\nA\n").unwrap_err();
        assert!(matches!(err, AbcError::Grammar { .. }));
    }

    #[test]
    fn test_header_without_key_fails() {
        let err = parse("X:1\nT:x\n").unwrap_err();
        assert!(matches!(err, AbcError::Grammar { .. }));
    }

    #[test]
    fn test_empty_body_fails() {
        let err = parse("X:1\nT:x\nK:C\n  \n% nothing\n").unwrap_err();
        assert!(matches!(err, AbcError::Grammar { .. }));
    }

    #[test]
    fn test_default_length_requires_fraction() {
        let err = parse("X:1\nT:x\nL:8\nK:C\nA\n").unwrap_err();
        assert!(matches!(err, AbcError::Grammar { .. }));
    }

    #[test]
    fn test_undeclared_voice_fails() {
        let err = parse("X:1\nT:x\nK:C\nV:ghost\nA\n").unwrap_err();
        assert!(matches!(err, AbcError::Grammar { .. }));
    }

    #[test]
    fn test_unmatched_close_repeat_fails() {
        let err = parse("X:1\nT:x\nK:C\nA B :|\n").unwrap_err();
        assert!(matches!(err, AbcError::Grammar { .. }));
    }

    #[test]
    fn test_second_ending_requires_first() {
        let err = parse("X:1\nT:x\nK:C\nA [2 B\n").unwrap_err();
        assert!(matches!(err, AbcError::Grammar { .. }));
    }

    #[test]
    fn test_unterminated_chord_fails() {
        let err = parse("X:1\nT:x\nK:C\n[A C\n").unwrap_err();
        assert!(matches!(err, AbcError::Grammar { .. }));
    }

    #[test]
    fn test_empty_chord_fails() {
        let err = parse("X:1\nT:x\nK:C\n[] A\n").unwrap_err();
        assert!(matches!(err, AbcError::Grammar { .. }));
    }

    #[test]
    fn test_mixed_octave_marks_fail() {
        let err = parse("X:1\nT:x\nK:C\nA', B\n").unwrap_err();
        assert!(matches!(err, AbcError::Grammar { .. }));
    }

    #[test]
    fn test_tuplet_needs_enough_elements() {
        let err = parse("X:1\nT:x\nK:C\n(3AB|\n").unwrap_err();
        assert!(matches!(err, AbcError::Grammar { .. }));
    }

    #[test]
    fn test_stray_header_field_in_body_fails() {
        let err = parse("X:1\nT:x\nK:C\nA B\nL:1/4\n").unwrap_err();
        assert!(matches!(err, AbcError::Grammar { .. }));
    }

    #[test]
    fn test_zero_length_note_is_out_of_bounds() {
        let err = parse("X:1\nT:x\nK:C\nA0\n").unwrap_err();
        assert!(matches!(err, AbcError::Bounds { .. }));
    }
}
