//! Recording injector used by unit tests.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use crate::libei::InputError;
use crate::sequencer::{Injector, KeyAction, Sleeper};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Press(u32),
    Release(u32),
    Flush,
    Sleep(Duration),
}

#[derive(Default)]
struct State {
    events: Vec<Event>,
    /// Number of injector calls that succeed before every call fails.
    budget: Option<usize>,
}

/// Shared log of injector calls and sleeps, in order.
#[derive(Clone, Default)]
pub struct Recorder {
    state: Rc<RefCell<State>>,
}

impl Recorder {
    pub fn failing_after(calls: usize) -> Self {
        let rec = Self::default();
        rec.state.borrow_mut().budget = Some(calls);
        rec
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.borrow().events.clone()
    }

    /// Events without flushes.
    pub fn keys(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| *e != Event::Flush)
            .collect()
    }

    fn record(&self, event: Event) -> Result<(), InputError> {
        let mut state = self.state.borrow_mut();
        if let Some(budget) = state.budget.as_mut() {
            if *budget == 0 {
                return Err(InputError::Channel("broken pipe".to_string()));
            }
            *budget -= 1;
        }
        state.events.push(event);
        Ok(())
    }
}

impl Injector for Recorder {
    fn send(&mut self, action: KeyAction) -> Result<(), InputError> {
        self.record(match action {
            KeyAction::Press(code) => Event::Press(code),
            KeyAction::Release(code) => Event::Release(code),
        })
    }

    fn flush(&mut self) -> Result<(), InputError> {
        self.record(Event::Flush)
    }
}

impl Sleeper for Recorder {
    fn sleep(&mut self, duration: Duration) {
        self.state.borrow_mut().events.push(Event::Sleep(duration));
    }
}
