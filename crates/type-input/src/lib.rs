//! Keyboard text injection for Wayland compositors.
//!
//! Types arbitrary Unicode text by synthesizing key events over libei,
//! using the keymap the compositor announces for the virtual keyboard.
//!
//! - [`keymap`]: character to keysym to key code and shift level
//! - [`sequencer`]: press/hold/release/flush against an [`Injector`]
//! - [`encoder`]: direct strokes and the `Ctrl+Shift+U` fallback
//! - [`libei`]: reis/libei backend and readiness handshake

pub mod encoder;
pub mod keymap;
pub mod libei;
pub mod sequencer;

#[cfg(test)]
mod testing;

pub use encoder::{CharError, EncodeReport, TextEncoder, EXIT_PARTIAL};
pub use keymap::{keysym_for_char, KeyMapping, Keysym, Layout, LayoutTable, LiveKeymap};
pub use libei::{EiInjector, InputError};
pub use sequencer::{Injector, KeyAction, Sequencer, Sleeper, ThreadSleeper, Timing};
