use rustc_hash::FxHashMap;

use super::BusByte;
use crate::panel::{SET_CURSOR_X, SET_CURSOR_Y, WRITE_PIXELS};

/// Software model of an ILI9341-class controller: decodes the command and
/// data bytes seen on the bus into the image the glass would show.
///
/// `SET_CURSOR_X`/`SET_CURSOR_Y` with two parameter words set the whole
/// window; with only one they move the window start and keep the end.
/// `WRITE_PIXELS` restarts at the window origin and wraps inside the window.
#[derive(Clone)]
pub struct PanelModel {
    width: u32,
    height: u32,
    bus_is_16_bits_wide: bool,
    pixels: Vec<u16>,
    columns: (u32, u32),
    rows: (u32, u32),
    cursor: (u32, u32),
    command: Option<u8>,
    command_high: Option<u8>,
    params: Vec<u8>,
    pixel_high: Option<u8>,
    command_counts: FxHashMap<u8, u64>,
    pixels_written: u64,
    pixels_clipped: u64,
}

impl PanelModel {
    pub fn new(width: u32, height: u32, bus_is_16_bits_wide: bool) -> Self {
        Self {
            width,
            height,
            bus_is_16_bits_wide,
            pixels: vec![0; width as usize * height as usize],
            columns: (0, width.saturating_sub(1)),
            rows: (0, height.saturating_sub(1)),
            cursor: (0, 0),
            command: None,
            command_high: None,
            params: Vec::new(),
            pixel_high: None,
            command_counts: FxHashMap::default(),
            pixels_written: 0,
            pixels_clipped: 0,
        }
    }

    /// Displayed image, row-major, no padding.
    pub fn pixels(&self) -> &[u16] {
        &self.pixels
    }

    pub fn pixel(&self, x: u32, y: u32) -> u16 {
        self.pixels[(y * self.width + x) as usize]
    }

    pub fn command_count(&self, command: u8) -> u64 {
        self.command_counts.get(&command).copied().unwrap_or(0)
    }

    pub fn pixels_written(&self) -> u64 {
        self.pixels_written
    }

    /// Pixels that landed outside the panel because of a bad window.
    pub fn pixels_clipped(&self) -> u64 {
        self.pixels_clipped
    }

    pub fn feed(&mut self, byte: BusByte) {
        if byte.data {
            self.feed_data(byte.value);
        } else {
            self.feed_command(byte.value);
        }
    }

    pub fn feed_all(&mut self, bytes: &[BusByte]) {
        for byte in bytes {
            self.feed(*byte);
        }
    }

    fn feed_command(&mut self, value: u8) {
        if self.bus_is_16_bits_wide && self.command_high.is_none() {
            self.command_high = Some(value);
            return;
        }
        self.command_high = None;
        self.command = Some(value);
        self.params.clear();
        self.pixel_high = None;
        *self.command_counts.entry(value).or_default() += 1;
        if value == WRITE_PIXELS {
            self.cursor = (self.columns.0, self.rows.0);
        }
    }

    fn feed_data(&mut self, value: u8) {
        match self.command {
            Some(SET_CURSOR_X) | Some(SET_CURSOR_Y) => {
                self.params.push(value);
                let words = self.parameter_words();
                let complete = self.params_complete_word();
                let window = if self.command == Some(SET_CURSOR_X) {
                    &mut self.columns
                } else {
                    &mut self.rows
                };
                match words.as_slice() {
                    [start] if complete => window.0 = *start,
                    [_, end] if complete => window.1 = *end,
                    _ => {}
                }
            }
            Some(WRITE_PIXELS) => match self.pixel_high.take() {
                None => self.pixel_high = Some(value),
                Some(high) => self.write_pixel(u16::from_be_bytes([high, value])),
            },
            _ => {}
        }
    }

    fn bytes_per_word(&self) -> usize {
        if self.bus_is_16_bits_wide { 4 } else { 2 }
    }

    fn params_complete_word(&self) -> bool {
        self.params.len() % self.bytes_per_word() == 0
    }

    /// Parameter bytes decoded into 16-bit coordinates. A 16-bit wide bus
    /// carries each byte in the low half of a word.
    fn parameter_words(&self) -> Vec<u32> {
        let meaningful: Vec<u8> = if self.bus_is_16_bits_wide {
            self.params.iter().skip(1).step_by(2).copied().collect()
        } else {
            self.params.clone()
        };
        meaningful
            .chunks_exact(2)
            .map(|pair| u32::from(u16::from_be_bytes([pair[0], pair[1]])))
            .collect()
    }

    fn write_pixel(&mut self, value: u16) {
        let (x, y) = self.cursor;
        if x < self.width && y < self.height {
            self.pixels[(y * self.width + x) as usize] = value;
            self.pixels_written += 1;
        } else {
            self.pixels_clipped += 1;
        }

        let mut next = (x + 1, y);
        if next.0 > self.columns.1 {
            next = (self.columns.0, y + 1);
            if next.1 > self.rows.1 {
                next.1 = self.rows.0;
            }
        }
        self.cursor = next;
    }
}

impl std::fmt::Debug for PanelModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PanelModel")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("columns", &self.columns)
            .field("rows", &self.rows)
            .field("pixels_written", &self.pixels_written)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(value: u8) -> BusByte {
        BusByte { data: false, value }
    }

    fn data(value: u8) -> BusByte {
        BusByte { data: true, value }
    }

    #[test]
    fn window_then_pixels_wrap_inside_window() {
        let mut panel = PanelModel::new(8, 8, false);
        panel.feed_all(&[cmd(SET_CURSOR_X), data(0), data(2), data(0), data(3)]);
        panel.feed_all(&[cmd(SET_CURSOR_Y), data(0), data(5), data(0), data(6)]);
        panel.feed(cmd(WRITE_PIXELS));
        for px in 1u16..=3 {
            let [hi, lo] = px.to_be_bytes();
            panel.feed_all(&[data(hi), data(lo)]);
        }
        assert_eq!(panel.pixel(2, 5), 1);
        assert_eq!(panel.pixel(3, 5), 2);
        assert_eq!(panel.pixel(2, 6), 3);
        assert_eq!(panel.command_count(WRITE_PIXELS), 1);
    }

    #[test]
    fn short_cursor_move_keeps_window_end() {
        let mut panel = PanelModel::new(8, 8, false);
        panel.feed_all(&[cmd(SET_CURSOR_X), data(0), data(1), data(0), data(4)]);
        panel.feed_all(&[cmd(SET_CURSOR_X), data(0), data(3)]);
        panel.feed_all(&[cmd(SET_CURSOR_Y), data(0), data(7)]);
        panel.feed_all(&[cmd(WRITE_PIXELS), data(0xAB), data(0xCD), data(0x12), data(0x34)]);
        assert_eq!(panel.pixel(3, 7), 0xABCD);
        assert_eq!(panel.pixel(4, 7), 0x1234);
    }

    #[test]
    fn wide_bus_commands_and_parameters() {
        let mut panel = PanelModel::new(8, 8, true);
        panel.feed_all(&[cmd(0), cmd(SET_CURSOR_X), data(0), data(0), data(0), data(6)]);
        panel.feed_all(&[cmd(0), cmd(SET_CURSOR_Y), data(0), data(0), data(0), data(2)]);
        panel.feed_all(&[cmd(0), cmd(WRITE_PIXELS), data(0xF8), data(0x00)]);
        assert_eq!(panel.pixel(6, 2), 0xF800);
    }
}
