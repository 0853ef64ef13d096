//! Text to key event encoding.
//!
//! Each character is typed either directly, with the Shift/AltGr modifiers
//! its shift level requires, or, when the active layout has no key for it,
//! through the Unicode input sequence `Ctrl+Shift+U <hex digits> Space`.

use crate::keymap::{
    keysym_for_char, Layout, ModifierLevel, KEY_LEFTCTRL, KEY_LEFTSHIFT, KEY_SPACE, KEY_U,
};
use crate::libei::InputError;
use crate::sequencer::{Injector, Sequencer, Sleeper, ThreadSleeper};

/// Exit status for a run where some characters could not be typed.
pub const EXIT_PARTIAL: u8 = 2;

/// Why a single character was skipped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CharError {
    #[error("failed to convert character U+{:04X} to keysym", u32::from(*.ch))]
    NoKeysym { ch: char },

    /// `level` is zero-based; the message counts levels from 1.
    #[error(
        "unsupported key level {} for U+{:04X} (key code {code})",
        .level + 1,
        u32::from(*.ch)
    )]
    UnsupportedLevel { ch: char, level: u32, code: u32 },

    #[error("cannot type U+{:04X}: hex digit {digit:?} is not on the keyboard", u32::from(*.ch))]
    ComposeDigitUnavailable { ch: char, digit: char },
}

/// Outcome of typing a whole text.
#[derive(Debug, Default)]
pub struct EncodeReport {
    /// Characters typed with a direct key stroke.
    pub typed: usize,
    /// Characters typed through the Unicode input sequence.
    pub composed: usize,
    /// Characters that were skipped.
    pub failures: Vec<CharError>,
}

impl EncodeReport {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// `0` if every character was typed, [`EXIT_PARTIAL`] otherwise.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        if self.is_success() {
            0
        } else {
            EXIT_PARTIAL
        }
    }
}

/// A key plus the modifiers to hold around it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stroke {
    code: u32,
    level: ModifierLevel,
}

enum Plan {
    Direct(Stroke),
    /// Hex digits of the codepoint, already resolved.
    Compose(Vec<Stroke>),
}

/// Types text through a [`Sequencer`], resolving keys against a [`Layout`].
pub struct TextEncoder<L, I, S = ThreadSleeper> {
    layout: L,
    sequencer: Sequencer<I, S>,
}

impl<L: Layout, I: Injector, S: Sleeper> TextEncoder<L, I, S> {
    #[must_use]
    pub fn new(layout: L, sequencer: Sequencer<I, S>) -> Self {
        Self { layout, sequencer }
    }

    /// Type all strings as one continuous text.
    ///
    /// Characters that cannot be typed are reported and skipped. The key
    /// delay is applied between characters, never after the last one.
    ///
    /// # Errors
    ///
    /// Returns an error as soon as the injector fails; the remaining text
    /// is not typed.
    pub fn encode<T: AsRef<str>>(&mut self, text: &[T]) -> Result<EncodeReport, InputError> {
        let mut report = EncodeReport::default();
        let mut chars = text.iter().flat_map(|s| s.as_ref().chars()).peekable();

        while let Some(ch) = chars.next() {
            match self.plan(ch) {
                Ok(Plan::Direct(stroke)) => {
                    self.type_stroke(stroke)?;
                    report.typed += 1;
                }
                Ok(Plan::Compose(digits)) => {
                    tracing::debug!(?ch, "Not in layout, typing as Unicode sequence");
                    self.type_compose(&digits)?;
                    report.composed += 1;
                }
                Err(err) => {
                    tracing::error!("{err}");
                    report.failures.push(err);
                }
            }

            if chars.peek().is_some() {
                self.sequencer.pause_between_keys();
            }
        }

        self.sequencer.finish()?;

        tracing::info!(
            typed = report.typed,
            composed = report.composed,
            failed = report.failures.len(),
            "Finished typing"
        );
        Ok(report)
    }

    /// Resolve `ch` to a direct stroke, `None` if the layout lacks it.
    fn resolve(&self, ch: char) -> Result<Option<Stroke>, CharError> {
        let keysym = keysym_for_char(ch).ok_or(CharError::NoKeysym { ch })?;
        let Some(mapping) = self.layout.lookup(keysym) else {
            return Ok(None);
        };
        let level = ModifierLevel::try_from(mapping.level).map_err(|level| {
            CharError::UnsupportedLevel {
                ch,
                level,
                code: mapping.code,
            }
        })?;
        Ok(Some(Stroke {
            code: mapping.code,
            level,
        }))
    }

    fn plan(&self, ch: char) -> Result<Plan, CharError> {
        if let Some(stroke) = self.resolve(ch)? {
            return Ok(Plan::Direct(stroke));
        }

        // Digits must be typeable directly; there is no fallback inside
        // the fallback.
        let digits = format!("{:x}", u32::from(ch))
            .chars()
            .map(|digit| match self.resolve(digit) {
                Ok(Some(stroke)) => Ok(stroke),
                Ok(None) | Err(_) => Err(CharError::ComposeDigitUnavailable { ch, digit }),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Plan::Compose(digits))
    }

    fn type_stroke(&mut self, stroke: Stroke) -> Result<(), InputError> {
        let modifiers = stroke.level.modifiers();
        for &modifier in modifiers {
            self.sequencer.press_only(modifier)?;
        }
        self.sequencer.press_and_release(stroke.code)?;
        for &modifier in modifiers.iter().rev() {
            self.sequencer.release_only(modifier)?;
        }
        Ok(())
    }

    fn type_compose(&mut self, digits: &[Stroke]) -> Result<(), InputError> {
        self.sequencer.press_only(KEY_LEFTCTRL)?;
        self.sequencer.press_only(KEY_LEFTSHIFT)?;
        self.sequencer.press_and_release(KEY_U)?;
        self.sequencer.release_only(KEY_LEFTSHIFT)?;
        self.sequencer.release_only(KEY_LEFTCTRL)?;
        for &digit in digits {
            self.type_stroke(digit)?;
        }
        self.sequencer.press_and_release(KEY_SPACE)
    }
}
