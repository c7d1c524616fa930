//! Panel controller profiles and the byte encoding of cursor tasks.
//!
//! Bring-up sequences are opaque byte blobs: the mirror loop pushes them
//! through the task queue like any other command and never interprets them.

use std::time::Duration;

pub const SET_CURSOR_X: u8 = 0x2A;
pub const SET_CURSOR_Y: u8 = 0x2B;
pub const WRITE_PIXELS: u8 = 0x2C;
pub const DISPLAY_OFF: u8 = 0x28;
pub const DISPLAY_ON: u8 = 0x29;

/// One controller command sent during bring-up, with the pause the
/// controller needs before it accepts the next one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InitStep {
    pub command: u8,
    pub params: Vec<u8>,
    pub delay: Duration,
}

impl InitStep {
    fn new(command: u8, params: &[u8]) -> Self {
        Self {
            command,
            params: params.to_vec(),
            delay: Duration::ZERO,
        }
    }

    fn then_wait(mut self, millis: u64) -> Self {
        self.delay = Duration::from_millis(millis);
        self
    }
}

#[derive(Clone, Debug)]
pub struct PanelProfile {
    pub name: &'static str,
    /// Drawable width in pixels.
    pub width: u32,
    /// Drawable height in pixels.
    pub height: u32,
    /// Commands and parameters are clocked in as 16-bit words.
    pub bus_is_16_bits_wide: bool,
    /// Controller ignores two-byte cursor moves; every X/Y update must carry
    /// the full window.
    pub must_send_full_cursor_window: bool,
    /// Unchanged pixels that cost as much bus time as ending one span and
    /// starting the next.
    pub merge_threshold: u32,
    /// Default per-second bus budget before falling back to interlacing.
    pub default_timeslice: Duration,
    pub init_sequence: Vec<InitStep>,
}

impl PanelProfile {
    /// 320x240 ILI9341 in landscape.
    pub fn ili9341() -> Self {
        Self {
            name: "ILI9341",
            width: 320,
            height: 240,
            bus_is_16_bits_wide: false,
            must_send_full_cursor_window: false,
            merge_threshold: 4,
            default_timeslice: Duration::from_micros(1_500_000),
            init_sequence: vec![
                InitStep::new(0x01, &[]).then_wait(5),
                InitStep::new(DISPLAY_OFF, &[]),
                InitStep::new(0xC0, &[0x23]),
                InitStep::new(0xC1, &[0x10]),
                InitStep::new(0xC5, &[0x3E, 0x28]),
                InitStep::new(0xC7, &[0x86]),
                InitStep::new(0x36, &[0x28]),
                InitStep::new(0x3A, &[0x55]),
                InitStep::new(0x11, &[]).then_wait(120),
                InitStep::new(DISPLAY_ON, &[]),
            ],
        }
    }

    /// 480x320 HX8357D (Adafruit PiTFT 3.5").
    pub fn hx8357d() -> Self {
        Self {
            name: "HX8357D",
            width: 480,
            height: 320,
            bus_is_16_bits_wide: false,
            must_send_full_cursor_window: false,
            merge_threshold: 6,
            default_timeslice: Duration::from_micros(750_000),
            init_sequence: vec![
                InitStep::new(0xB9, &[0xFF, 0x83, 0x57]),
                InitStep::new(0x11, &[]).then_wait(120),
                InitStep::new(0x3A, &[0x55]),
                InitStep::new(0x36, &[0x60]),
                InitStep::new(DISPLAY_ON, &[]),
            ],
        }
    }

    /// 480x320 ILI9486 on a 16-bit wide shift-register bus.
    pub fn ili9486() -> Self {
        Self {
            name: "ILI9486",
            width: 480,
            height: 320,
            bus_is_16_bits_wide: true,
            must_send_full_cursor_window: false,
            merge_threshold: 10,
            default_timeslice: Duration::from_micros(750_000),
            init_sequence: vec![
                InitStep::new(0xB0, &[0x00, 0x00]),
                InitStep::new(0x11, &[]).then_wait(120),
                InitStep::new(0x3A, &[0x00, 0x55]),
                InitStep::new(0x20, &[]),
                InitStep::new(0x36, &[0x00, 0x28]),
                InitStep::new(DISPLAY_ON, &[]),
            ],
        }
    }

    /// Same controller with a different drawable area.
    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * crate::framebuffer::BYTES_PER_PIXEL
    }

    /// Bytes clocked out for the command word itself.
    pub fn command_bytes(&self) -> usize {
        self.encode_command(0).1
    }

    /// Command word as it appears on the wire.
    pub fn encode_command(&self, command: u8) -> ([u8; 2], usize) {
        command_word(command, self.bus_is_16_bits_wide)
    }

    pub fn move_task_bytes(&self) -> usize {
        if self.bus_is_16_bits_wide { 4 } else { 2 }
    }

    pub fn window_task_bytes(&self) -> usize {
        self.move_task_bytes() * 2
    }

    /// Payload of a cursor move: the window start only.
    pub fn encode_cursor_move(&self, start: u16, out: &mut [u8]) -> usize {
        let [hi, lo] = start.to_be_bytes();
        if self.bus_is_16_bits_wide {
            out[..4].copy_from_slice(&[0, hi, 0, lo]);
            4
        } else {
            out[..2].copy_from_slice(&[hi, lo]);
            2
        }
    }

    /// Payload of a full window update, `end` inclusive.
    pub fn encode_window(&self, start: u16, end: u16, out: &mut [u8]) -> usize {
        let written = self.encode_cursor_move(start, out);
        written + self.encode_cursor_move(end, &mut out[written..])
    }
}

/// Command word for a bus of the given width, with its length. A 16-bit
/// bus takes a zero high byte first.
pub fn command_word(command: u8, wide_bus: bool) -> ([u8; 2], usize) {
    if wide_bus {
        ([0x00, command], 2)
    } else {
        ([command, 0], 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eight_bit_cursor_encoding() {
        let panel = PanelProfile::ili9341();
        let mut out = [0u8; 8];
        assert_eq!(panel.encode_cursor_move(0x0123, &mut out), 2);
        assert_eq!(&out[..2], &[0x01, 0x23]);
        assert_eq!(panel.encode_window(10, 319, &mut out), 4);
        assert_eq!(&out[..4], &[0x00, 0x0A, 0x01, 0x3F]);
    }

    #[test]
    fn sixteen_bit_cursor_encoding_pads_high_bytes() {
        let panel = PanelProfile::ili9486();
        let mut out = [0u8; 8];
        assert_eq!(panel.encode_window(1, 0x1DF, &mut out), 8);
        assert_eq!(out, [0, 0x00, 0, 0x01, 0, 0x01, 0, 0xDF]);
        assert_eq!(panel.encode_command(WRITE_PIXELS), ([0x00, WRITE_PIXELS], 2));
    }

    #[test]
    fn frame_bytes_use_rgb565() {
        assert_eq!(PanelProfile::ili9341().frame_bytes(), 320 * 240 * 2);
    }
}
