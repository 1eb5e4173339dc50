//! Abstract input events shared with the window manager
//!
//! USB HID and the PS/2 path both feed the same queue; the UI drains it once per
//! frame.

use crate::config::INPUT_QUEUE_CAPACITY;
use heapless::Deque;

/// Symbolic key actions understood by the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Up,
    Down,
    Left,
    Right,
    Enter,
    Escape,
    Tab,
    Start,
}

/// Relative pointer motion with the current button mask
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MouseEvent {
    pub dx: i32,
    pub dy: i32,
    pub buttons: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    Key(KeyAction),
    Mouse(MouseEvent),
}

/// Consumer of decoded input
pub trait InputSink {
    fn push_key(&mut self, action: KeyAction);
    fn push_mouse(&mut self, dx: i32, dy: i32, buttons: u8);
}

/// Bounded FIFO of input events. New events are dropped while it is full.
#[derive(Debug, Default)]
pub struct InputQueue {
    events: Deque<InputEvent, INPUT_QUEUE_CAPACITY>,
    dropped: u32,
}

impl InputQueue {
    pub const fn new() -> Self {
        Self {
            events: Deque::new(),
            dropped: 0,
        }
    }

    pub fn push(&mut self, event: InputEvent) {
        if self.events.push_back(event).is_err() {
            self.dropped = self.dropped.wrapping_add(1);
        }
    }

    pub fn pop(&mut self) -> Option<InputEvent> {
        self.events.pop_front()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events discarded because the queue was full.
    pub fn dropped(&self) -> u32 {
        self.dropped
    }
}

impl InputSink for InputQueue {
    fn push_key(&mut self, action: KeyAction) {
        self.push(InputEvent::Key(action));
    }

    fn push_mouse(&mut self, dx: i32, dy: i32, buttons: u8) {
        self.push(InputEvent::Mouse(MouseEvent { dx, dy, buttons }));
    }
}
