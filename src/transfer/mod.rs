//! Bus-side execution of queued tasks.
//!
//! A [`TransferBackend`] turns one [`Task`] into bus traffic: the command
//! word with D/C low, then the payload with D/C high. [`PolledBackend`]
//! feeds the SPI FIFO from the CPU; [`DmaBackend`] hands large payloads to
//! chained DMA control blocks.

mod dma;

pub use dma::{DmaBackend, DmaCounters, MAX_DMA_SPI_TASK_SIZE};

use crate::error::{MirrorError, MirrorResult};
use crate::framebuffer::{BYTES_PER_PIXEL, Framebuffer};
use crate::hw::SpiRegisters;
use crate::hw::regs::{
    SPI_CS_CLEAR, SPI_CS_CLEAR_RX, SPI_CS_DONE, SPI_CS_RXD, SPI_CS_RXF, SPI_CS_RXR, SPI_CS_TA,
    SPI_CS_TXD, SPI_DRIVE_SETTINGS,
};
use crate::panel::command_word;
use crate::pixels::copy_swap_and_update;
use crate::task_queue::{PayloadKind, Task, TaskHeader};

/// Payloads up to this many bytes are cheaper to push through the FIFO by
/// hand than to set up a DMA transfer for.
pub const DMA_IS_FASTER_THAN_POLLED_SPI: usize = 140;

/// Bytes the CPU writes into the FIFO before it starts waiting on TXD.
const POLLED_PREFILL_BYTES: usize = 15;

/// The frames a framebuffer-sourced task reads from and refreshes.
pub struct FramePair<'a> {
    pub current: &'a Framebuffer,
    pub previous: &'a mut Framebuffer,
}

pub trait TransferBackend: Send {
    /// Start sending `task`. May return before the last byte is on the wire.
    /// `frames` must be provided for framebuffer-sourced tasks.
    fn execute(&mut self, task: &Task<'_>, frames: Option<&mut FramePair<'_>>) -> MirrorResult<()>;

    /// Block until everything started so far has left the bus.
    fn wait_until_idle(&mut self) -> MirrorResult<()>;
}

/// Walks the pixels of a framebuffer-sourced task row by row, writing them
/// byte-swapped to the wire buffer and into the previous frame.
#[derive(Clone, Debug)]
pub struct PixelGather {
    next: usize,
    column: usize,
    width: usize,
    stride: usize,
    remaining: usize,
}

impl PixelGather {
    pub fn new(header: &TaskHeader, stride: u32) -> Self {
        Self {
            next: header.fb_offset as usize,
            column: 0,
            width: usize::from(header.width).max(1),
            stride: stride as usize,
            remaining: header.wire_len as usize / BYTES_PER_PIXEL,
        }
    }

    pub fn remaining_bytes(&self) -> usize {
        self.remaining * BYTES_PER_PIXEL
    }

    /// Fill as much of `out` as the task still has pixels for. Returns the
    /// number of bytes written.
    pub fn fill(&mut self, frames: &mut FramePair<'_>, out: &mut [u8]) -> usize {
        let mut written = 0;
        while self.remaining > 0 && written + BYTES_PER_PIXEL <= out.len() {
            let room = (out.len() - written) / BYTES_PER_PIXEL;
            let run = (self.width - self.column).min(self.remaining).min(room);
            let range = self.next..self.next + run;
            copy_swap_and_update(
                &frames.current.as_pixels()[range.clone()],
                &mut frames.previous.as_mut_pixels()[range],
                &mut out[written..written + run * BYTES_PER_PIXEL],
            );
            written += run * BYTES_PER_PIXEL;
            self.remaining -= run;
            self.column += run;
            self.next += run;
            if self.column == self.width {
                self.column = 0;
                self.next += self.stride - self.width;
            }
        }
        written
    }
}

/// Gather a whole framebuffer-sourced task into `scratch`.
pub(crate) fn gather_task(
    header: &TaskHeader,
    frames: Option<&mut FramePair<'_>>,
    scratch: &mut Vec<u8>,
) -> MirrorResult<()> {
    let frames = require_frames(frames)?;
    let mut gather = PixelGather::new(header, frames.current.stride());
    scratch.clear();
    scratch.resize(gather.remaining_bytes(), 0);
    gather.fill(frames, scratch);
    Ok(())
}

pub(crate) fn require_frames<'f, 'a>(
    frames: Option<&'f mut FramePair<'a>>,
) -> MirrorResult<&'f mut FramePair<'a>> {
    let frames = frames.ok_or_else(|| {
        MirrorError::InvalidConfig("framebuffer-sourced task executed without frames".into())
    })?;
    frames.current.ensure_same_geometry(frames.previous)?;
    Ok(frames)
}

/// Spin until the FIFO has drained the current polled transfer, then flush
/// anything left in the receive FIFO.
pub(crate) fn wait_for_polled_transfer<H: SpiRegisters + ?Sized>(hw: &mut H) {
    let mut cs = hw.spi_cs();
    while cs & SPI_CS_TA != 0 && cs & SPI_CS_DONE == 0 {
        if cs & (SPI_CS_RXR | SPI_CS_RXF) != 0 {
            hw.set_spi_cs(SPI_CS_CLEAR_RX | SPI_CS_TA | SPI_DRIVE_SETTINGS);
        }
        std::hint::spin_loop();
        cs = hw.spi_cs();
    }
    if cs & SPI_CS_RXD != 0 {
        hw.set_spi_cs(SPI_CS_CLEAR_RX | SPI_CS_TA | SPI_DRIVE_SETTINGS);
    }
}

/// Clock out a command word with D/C low.
pub(crate) fn send_command<H: SpiRegisters + ?Sized>(hw: &mut H, cmd: u8, wide_bus: bool) {
    let (word, len) = command_word(cmd, wide_bus);
    hw.set_data_mode(false);
    for &byte in &word[..len] {
        hw.write_fifo(byte);
    }
    if len == 2 {
        while hw.spi_cs() & SPI_CS_DONE == 0 {
            std::hint::spin_loop();
        }
        hw.read_fifo();
        hw.read_fifo();
    } else {
        while hw.spi_cs() & (SPI_CS_RXD | SPI_CS_DONE) == 0 {
            std::hint::spin_loop();
        }
    }
    hw.set_data_mode(true);
}

/// Feed `bytes` into the FIFO, draining the receive side whenever it fills.
pub(crate) fn write_polled<H: SpiRegisters + ?Sized>(hw: &mut H, bytes: &[u8]) {
    let prefill = bytes.len().min(POLLED_PREFILL_BYTES);
    for &byte in &bytes[..prefill] {
        hw.write_fifo(byte);
    }
    let mut rest = bytes[prefill..].iter();
    let mut pending = rest.next();
    while let Some(&byte) = pending {
        let cs = hw.spi_cs();
        if cs & SPI_CS_TXD != 0 {
            hw.write_fifo(byte);
            pending = rest.next();
        }
        if cs & (SPI_CS_RXR | SPI_CS_RXF) != 0 {
            hw.set_spi_cs(SPI_CS_CLEAR_RX | SPI_CS_TA | SPI_DRIVE_SETTINGS);
        }
    }
}

/// Sends every task from the CPU.
pub struct PolledBackend<H> {
    hw: H,
    wide_bus: bool,
    scratch: Vec<u8>,
}

impl<H: SpiRegisters + Send> PolledBackend<H> {
    pub fn new(mut hw: H, wide_bus: bool) -> Self {
        hw.set_spi_cs(SPI_CS_TA | SPI_CS_CLEAR | SPI_DRIVE_SETTINGS);
        hw.set_data_mode(true);
        Self {
            hw,
            wide_bus,
            scratch: Vec::new(),
        }
    }

    pub fn hw(&self) -> &H {
        &self.hw
    }

    pub fn hw_mut(&mut self) -> &mut H {
        &mut self.hw
    }

    pub fn into_inner(self) -> H {
        self.hw
    }
}

impl<H: SpiRegisters + Send> TransferBackend for PolledBackend<H> {
    fn execute(&mut self, task: &Task<'_>, frames: Option<&mut FramePair<'_>>) -> MirrorResult<()> {
        wait_for_polled_transfer(&mut self.hw);
        send_command(&mut self.hw, task.cmd(), self.wide_bus);
        match task.kind() {
            PayloadKind::Inline => write_polled(&mut self.hw, task.payload()),
            PayloadKind::Framebuffer => {
                gather_task(task.header(), frames, &mut self.scratch)?;
                write_polled(&mut self.hw, &self.scratch);
            }
        }
        log::trace!("polled task cmd={:#04x} {} bytes", task.cmd(), task.wire_len());
        Ok(())
    }

    fn wait_until_idle(&mut self) -> MirrorResult<()> {
        wait_for_polled_transfer(&mut self.hw);
        Ok(())
    }
}
