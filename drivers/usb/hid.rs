//! USB HID boot protocol keyboard and mouse
//!
//! Boot protocol reports have a fixed layout:
//! - Keyboard: modifiers, reserved, then six key usage slots
//! - Mouse: button mask, signed dx, signed dy (extra bytes ignored)

use log::trace;

use super::ehci::{EhciController, RegisterWindow};
use super::enumeration::{DeviceKind, HidSession, MAX_REPORT_LEN};
use super::request::SetupPacket;
use super::transfer::{control_transfer, ControlTarget};
use super::Direction;
use crate::config::UsbConfig;
use crate::input::{InputSink, KeyAction, MouseEvent};
use crate::memory::DmaAllocator;

/// Key usage slots in a boot keyboard report.
const KEY_SLOTS: usize = 6;
const KEY_SLOTS_OFFSET: usize = 2;

const KEYBOARD_REPORT_MIN: usize = KEY_SLOTS_OFFSET + KEY_SLOTS;
const MOUSE_REPORT_MIN: usize = 3;

/// Map a keyboard usage id (HID Usage Tables, page 0x07) to a UI action.
pub fn usage_to_action(usage: u8) -> Option<KeyAction> {
    match usage {
        0x52 => Some(KeyAction::Up),
        0x51 => Some(KeyAction::Down),
        0x50 => Some(KeyAction::Left),
        0x4F => Some(KeyAction::Right),
        0x28 => Some(KeyAction::Enter),
        0x29 => Some(KeyAction::Escape),
        0x2B => Some(KeyAction::Tab),
        0x16 => Some(KeyAction::Start),
        _ => None,
    }
}

/// Edge detection across keyboard reports
#[derive(Debug, Default, Clone)]
pub struct BootKeyboard {
    previous: [u8; KEY_SLOTS],
}

impl BootKeyboard {
    pub const fn new() -> Self {
        Self {
            previous: [0; KEY_SLOTS],
        }
    }

    /// Emit an action for every mapped key that was not down in the previous
    /// report. Short reports are ignored.
    pub fn on_report<S: InputSink + ?Sized>(&mut self, report: &[u8], sink: &mut S) {
        let Some(keys) = report.get(KEY_SLOTS_OFFSET..KEYBOARD_REPORT_MIN) else {
            return;
        };
        for &usage in keys {
            if usage == 0 || self.previous.contains(&usage) {
                continue;
            }
            if let Some(action) = usage_to_action(usage) {
                sink.push_key(action);
            }
        }
        self.previous.copy_from_slice(keys);
    }

    /// Usages held down in the last report.
    pub fn pressed(&self) -> &[u8; KEY_SLOTS] {
        &self.previous
    }
}

/// Decode a boot mouse report.
pub fn decode_mouse(report: &[u8]) -> Option<MouseEvent> {
    if report.len() < MOUSE_REPORT_MIN {
        return None;
    }
    Some(MouseEvent {
        dx: report[1] as i8 as i32,
        dy: report[2] as i8 as i32,
        buttons: report[0] & 0x07,
    })
}

/// Fetch one input report with GET_REPORT and feed it to `sink`.
///
/// Any configured session is polled. Reports from a device that is neither
/// keyboard nor mouse are discarded. A failed transfer is dropped silently;
/// the next poll tries again.
pub fn poll<W, A, S>(
    controller: &mut EhciController<W>,
    dma: &mut A,
    config: &UsbConfig,
    session: &HidSession,
    keyboard: &mut BootKeyboard,
    sink: &mut S,
) where
    W: RegisterWindow,
    A: DmaAllocator + ?Sized,
    S: InputSink + ?Sized,
{
    if !session.is_configured() {
        return;
    }

    let len = session.report_len.min(MAX_REPORT_LEN as u8) as usize;
    let mut report = [0u8; MAX_REPORT_LEN as usize];
    let result = control_transfer(
        controller,
        dma,
        ControlTarget::default_pipe(session.address, config.max_packet_size0),
        &SetupPacket::hid_get_report(session.interface, len as u16),
        &mut report[..len],
        Direction::In,
        config.completion_spins,
    );
    if let Err(err) = result {
        trace!("USB HID poll: {}", err);
        return;
    }

    let report = &report[..len];
    match session.kind {
        DeviceKind::Keyboard => keyboard.on_report(report, sink),
        DeviceKind::Mouse => {
            if let Some(event) = decode_mouse(report) {
                sink.push_mouse(event.dx, event.dy, event.buttons);
            }
        }
        DeviceKind::None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{InputEvent, InputQueue};

    fn drain(queue: &mut InputQueue) -> std::vec::Vec<InputEvent> {
        core::iter::from_fn(|| queue.pop()).collect()
    }

    #[test]
    fn test_key_press_is_edge_triggered() {
        let mut keyboard = BootKeyboard::new();
        let mut queue = InputQueue::new();
        let report = [0, 0, 0x52, 0, 0, 0, 0, 0];

        keyboard.on_report(&report, &mut queue);
        assert_eq!(drain(&mut queue), [InputEvent::Key(KeyAction::Up)]);

        keyboard.on_report(&report, &mut queue);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_key_membership_is_not_positional() {
        let mut keyboard = BootKeyboard::new();
        let mut queue = InputQueue::new();
        keyboard.on_report(&[0, 0, 0x52, 0, 0, 0, 0, 0], &mut queue);
        drain(&mut queue);

        // Up moves to another slot while Enter goes down.
        keyboard.on_report(&[0, 0, 0x28, 0x52, 0, 0, 0, 0], &mut queue);
        assert_eq!(drain(&mut queue), [InputEvent::Key(KeyAction::Enter)]);
        assert_eq!(keyboard.pressed(), &[0x28, 0x52, 0, 0, 0, 0]);
    }

    #[test]
    fn test_release_and_press_again() {
        let mut keyboard = BootKeyboard::new();
        let mut queue = InputQueue::new();
        keyboard.on_report(&[0, 0, 0x29, 0, 0, 0, 0, 0], &mut queue);
        keyboard.on_report(&[0; 8], &mut queue);
        keyboard.on_report(&[0, 0, 0x29, 0, 0, 0, 0, 0], &mut queue);
        assert_eq!(
            drain(&mut queue),
            [InputEvent::Key(KeyAction::Escape), InputEvent::Key(KeyAction::Escape)]
        );
    }

    #[test]
    fn test_unmapped_and_short_reports() {
        let mut keyboard = BootKeyboard::new();
        let mut queue = InputQueue::new();
        // 'a' has no action.
        keyboard.on_report(&[0, 0, 0x04, 0, 0, 0, 0, 0], &mut queue);
        assert!(queue.is_empty());
        assert_eq!(keyboard.pressed()[0], 0x04);

        keyboard.on_report(&[0, 0, 0x52], &mut queue);
        assert!(queue.is_empty());
        assert_eq!(keyboard.pressed()[0], 0x04);
    }

    #[test]
    fn test_usage_table() {
        assert_eq!(usage_to_action(0x4F), Some(KeyAction::Right));
        assert_eq!(usage_to_action(0x50), Some(KeyAction::Left));
        assert_eq!(usage_to_action(0x51), Some(KeyAction::Down));
        assert_eq!(usage_to_action(0x2B), Some(KeyAction::Tab));
        assert_eq!(usage_to_action(0x16), Some(KeyAction::Start));
        assert_eq!(usage_to_action(0x00), None);
    }

    #[test]
    fn test_mouse_report_decoding() {
        assert_eq!(
            decode_mouse(&[0x01, 5, 0xFE]),
            Some(MouseEvent { dx: 5, dy: -2, buttons: 1 })
        );
        assert_eq!(
            decode_mouse(&[0xFF, 0x80, 0x7F, 3]),
            Some(MouseEvent { dx: -128, dy: 127, buttons: 7 })
        );
        assert_eq!(decode_mouse(&[1, 2]), None);
    }
}
