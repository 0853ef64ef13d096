//! Key press/release sequencing on top of an [`Injector`].

use std::time::Duration;

use crate::libei::InputError;

/// A single key event, identified by evdev keycode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Press(u32),
    Release(u32),
}

/// Sink for synthesized key events.
///
/// Events may be queued until [`Injector::flush`] makes them visible to the
/// compositor. Errors are fatal for the current run.
pub trait Injector {
    /// Queue a key event.
    ///
    /// # Errors
    ///
    /// Returns [`InputError::Channel`] if the event cannot be sent.
    fn send(&mut self, action: KeyAction) -> Result<(), InputError>;

    /// Make all queued events visible to the compositor.
    ///
    /// # Errors
    ///
    /// Returns [`InputError::Channel`] if the connection is broken.
    fn flush(&mut self) -> Result<(), InputError>;
}

/// Blocking wait between events.
pub trait Sleeper {
    fn sleep(&mut self, duration: Duration);
}

/// [`Sleeper`] that parks the current thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Timing parameters for a typing run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timing {
    /// Skip the flush after each press and release.
    pub no_flush: bool,
    /// Pause between consecutive characters.
    pub key_delay: Duration,
    /// How long each key stays pressed.
    pub key_hold: Duration,
}

/// Drives an [`Injector`] one key at a time.
pub struct Sequencer<I, S = ThreadSleeper> {
    injector: I,
    sleeper: S,
    timing: Timing,
}

impl<I: Injector> Sequencer<I> {
    #[must_use]
    pub fn new(injector: I, timing: Timing) -> Self {
        Self::with_sleeper(injector, ThreadSleeper, timing)
    }
}

impl<I: Injector, S: Sleeper> Sequencer<I, S> {
    #[must_use]
    pub fn with_sleeper(injector: I, sleeper: S, timing: Timing) -> Self {
        Self {
            injector,
            sleeper,
            timing,
        }
    }

    /// Type one key: press, hold, release.
    ///
    /// # Errors
    ///
    /// Propagates injector failures.
    pub fn press_and_release(&mut self, code: u32) -> Result<(), InputError> {
        self.injector.send(KeyAction::Press(code))?;
        self.flush_unless_batched()?;
        if !self.timing.key_hold.is_zero() {
            self.sleeper.sleep(self.timing.key_hold);
        }
        self.injector.send(KeyAction::Release(code))?;
        self.flush_unless_batched()
    }

    /// Press a key that stays held across other strokes (modifiers).
    ///
    /// # Errors
    ///
    /// Propagates injector failures.
    pub fn press_only(&mut self, code: u32) -> Result<(), InputError> {
        self.injector.send(KeyAction::Press(code))
    }

    /// Release a key pressed with [`Self::press_only`].
    ///
    /// # Errors
    ///
    /// Propagates injector failures.
    pub fn release_only(&mut self, code: u32) -> Result<(), InputError> {
        self.injector.send(KeyAction::Release(code))
    }

    /// Wait the configured delay between two characters.
    pub fn pause_between_keys(&mut self) {
        if !self.timing.key_delay.is_zero() {
            self.sleeper.sleep(self.timing.key_delay);
        }
    }

    /// Flush whatever is still queued (trailing modifier releases, or the
    /// whole run when flushing per key is disabled).
    ///
    /// # Errors
    ///
    /// Propagates injector failures.
    pub fn finish(&mut self) -> Result<(), InputError> {
        self.injector.flush()
    }

    fn flush_unless_batched(&mut self) -> Result<(), InputError> {
        if self.timing.no_flush {
            Ok(())
        } else {
            self.injector.flush()
        }
    }
}
