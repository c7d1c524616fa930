//! Software SPI0 + DMA peripheral.
//!
//! The model executes control-block chains the way the BCM2835 does: a TX
//! channel paced by the SPI FIFO (16 entries), an RX channel draining it, and
//! memory-to-register blocks that poke SPI/DMA registers mid-chain. Bytes
//! that reach the wire go to a [`WireTap`], which can record them and feed a
//! [`PanelModel`].

use std::sync::{Arc, Mutex, MutexGuard};

use super::regs::*;
use super::{DmaMemory, DmaRegisters, PanelModel, SpiRegisters};

const FIFO_DEPTH: usize = 16;

/// One byte shifted out on the bus with the D/C line state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BusByte {
    pub data: bool,
    pub value: u8,
}

#[derive(Default)]
struct TapState {
    record: bool,
    bytes: Vec<BusByte>,
    panel: Option<PanelModel>,
    dropped: u64,
}

/// Shared view of everything the simulated bus put on the wire. Clone it
/// before handing the bus to a backend.
#[derive(Clone, Default)]
pub struct WireTap(Arc<Mutex<TapState>>);

impl WireTap {
    pub fn recording() -> Self {
        let tap = Self::default();
        tap.lock().record = true;
        tap
    }

    pub fn with_panel(panel: PanelModel) -> Self {
        let tap = Self::default();
        tap.lock().panel = Some(panel);
        tap
    }

    pub fn recording_with_panel(panel: PanelModel) -> Self {
        let tap = Self::with_panel(panel);
        tap.lock().record = true;
        tap
    }

    fn lock(&self) -> MutexGuard<'_, TapState> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, byte: BusByte) {
        let mut state = self.lock();
        if state.record {
            state.bytes.push(byte);
        }
        if let Some(panel) = state.panel.as_mut() {
            panel.feed(byte);
        }
    }

    fn drop_byte(&self) {
        self.lock().dropped += 1;
    }

    /// Recorded bytes so far.
    pub fn bytes(&self) -> Vec<BusByte> {
        self.lock().bytes.clone()
    }

    pub fn clear(&self) {
        self.lock().bytes.clear();
    }

    /// Bytes written into the FIFO while no transfer was active. Always
    /// zero for a correctly programmed peripheral.
    pub fn dropped_bytes(&self) -> u64 {
        self.lock().dropped
    }

    pub fn with_panel_model<R>(&self, f: impl FnOnce(&PanelModel) -> R) -> Option<R> {
        self.lock().panel.as_ref().map(f)
    }
}

#[derive(Clone, Copy, Default)]
struct Channel {
    cs: u32,
    cb_addr: u32,
    ti: u32,
    debug: u32,
    loaded: Option<(DmaControlBlock, u32)>,
    stalled: bool,
}

impl Channel {
    fn active(&self) -> bool {
        self.cs & DMA_CS_ACTIVE != 0
    }
}

pub struct SimulatedBus {
    spi_control: u32,
    data_mode: bool,
    rx_fifo: usize,
    dlen: u32,
    header: Vec<u8>,
    channels: [Channel; NUM_DMA_CHANNELS as usize],
    memory: DmaMemory,
    tap: WireTap,
    kickoffs: u64,
}

impl SimulatedBus {
    pub fn new(memory: DmaMemory, tap: WireTap) -> Self {
        Self {
            spi_control: 0,
            data_mode: true,
            rx_fifo: 0,
            dlen: 0,
            header: Vec::with_capacity(4),
            channels: [Channel::default(); NUM_DMA_CHANNELS as usize],
            memory,
            tap,
            kickoffs: 0,
        }
    }

    pub fn tap(&self) -> &WireTap {
        &self.tap
    }

    /// Number of times software started a DMA channel.
    pub fn kickoffs(&self) -> u64 {
        self.kickoffs
    }

    /// Freeze a channel: once started it never completes.
    pub fn stall_channel(&mut self, channel: u8) {
        self.channels[channel as usize].stalled = true;
    }

    /// Pretend another process programmed `channel` for a different
    /// peripheral and control block.
    pub fn steal_channel(&mut self, channel: u8, peripheral: u32, cb_addr: u32) {
        let ch = &mut self.channels[channel as usize];
        ch.ti = dma_ti_permap(peripheral);
        ch.cb_addr = cb_addr;
    }

    fn transmit(&mut self, byte: u8) {
        self.tap.push(BusByte {
            data: self.data_mode,
            value: byte,
        });
        self.rx_fifo = (self.rx_fifo + 1).min(FIFO_DEPTH);
    }

    fn fifo_write(&mut self, byte: u8) {
        let dma_mode = self.spi_control & SPI_CS_DMAEN != 0;
        let active = self.spi_control & SPI_CS_TA != 0;

        if dma_mode && !active {
            // With DLEN exhausted, DMA writes are CS/DLEN header words.
            self.header.push(byte);
            if self.header.len() == 4 {
                let word = u32::from_le_bytes([
                    self.header[0],
                    self.header[1],
                    self.header[2],
                    self.header[3],
                ]);
                self.header.clear();
                self.spi_control = (self.spi_control & !0xFF) | (word & 0xFF);
                self.dlen = word >> 16;
            }
            return;
        }

        if !active || (dma_mode && self.dlen == 0) {
            self.tap.drop_byte();
            return;
        }

        self.transmit(byte);
        if dma_mode {
            self.dlen -= 1;
        }
    }

    fn write_register(&mut self, bus_address: u32, value: u32) -> bool {
        if bus_address == SPI_CS_BUS_ADDRESS {
            self.write_spi_cs(value);
            return true;
        }
        for channel in 0..NUM_DMA_CHANNELS {
            if bus_address == dma_channel_cs_bus_address(channel) {
                self.write_dma_cs(channel, value);
                return true;
            }
            if bus_address == dma_channel_cb_addr_bus_address(channel) {
                self.channels[channel as usize].cb_addr = value;
                return true;
            }
        }
        false
    }

    fn write_spi_cs(&mut self, value: u32) {
        if value & SPI_CS_CLEAR_RX != 0 {
            self.rx_fifo = 0;
        }
        if value & SPI_CS_CLEAR_TX != 0 {
            self.header.clear();
        }
        self.spi_control = value & !SPI_CS_CLEAR;
    }

    fn write_dma_cs(&mut self, channel: u8, value: u32) {
        let ch = &mut self.channels[channel as usize];
        if value & DMA_CS_RESET != 0 {
            let stalled = ch.stalled;
            *ch = Channel {
                stalled,
                ..Channel::default()
            };
            return;
        }
        if value & DMA_CS_END != 0 {
            ch.cs &= !DMA_CS_END;
        }
        if value & DMA_CS_ACTIVE != 0 {
            ch.cs |= DMA_CS_ACTIVE;
        }
    }

    fn fail_channel(&mut self, channel: usize) {
        let ch = &mut self.channels[channel];
        ch.cs = (ch.cs & !DMA_CS_ACTIVE) | DMA_CS_ERROR;
        ch.loaded = None;
    }

    /// Advance one channel as far as it can go right now.
    fn step(&mut self, channel: usize) -> bool {
        let ch = self.channels[channel];
        if !ch.active() || ch.stalled {
            return false;
        }

        let Some((cb, mut offset)) = ch.loaded else {
            if ch.cb_addr == 0 {
                let ch = &mut self.channels[channel];
                ch.cs = (ch.cs & !DMA_CS_ACTIVE) | DMA_CS_END;
                return true;
            }
            let Some(index) = self.memory.cb_index(ch.cb_addr) else {
                self.fail_channel(channel);
                return true;
            };
            let cb = *self.memory.control_block(index);
            let ch = &mut self.channels[channel];
            ch.ti = cb.ti;
            ch.debug = 0;
            ch.loaded = Some((cb, 0));
            return true;
        };

        let start = offset;
        let peripheral = dma_ti_peripheral(cb.ti);
        if cb.ti & DMA_TI_DEST_DREQ != 0 && peripheral == DMA_PERMAP_SPI_TX {
            while offset < cb.len && self.rx_fifo < FIFO_DEPTH {
                let Some(byte) = self.memory.read_byte(cb.src + offset) else {
                    self.fail_channel(channel);
                    return true;
                };
                self.fifo_write(byte);
                offset += 1;
            }
        } else if cb.ti & DMA_TI_SRC_DREQ != 0 && peripheral == DMA_PERMAP_SPI_RX {
            let take = (self.rx_fifo as u32).min(cb.len - offset);
            self.rx_fifo -= take as usize;
            offset += take;
        } else {
            while offset < cb.len {
                let Some(word) = self.memory.read_word(cb.src + offset) else {
                    self.fail_channel(channel);
                    return true;
                };
                let dst = if cb.ti & DMA_TI_DEST_INC != 0 {
                    cb.dst + offset
                } else {
                    cb.dst
                };
                if !self.write_register(dst, word) {
                    self.fail_channel(channel);
                    return true;
                }
                offset += 4;
            }
        }

        let ch = &mut self.channels[channel];
        if offset >= cb.len {
            ch.loaded = None;
            ch.cb_addr = cb.next;
            return true;
        }
        ch.loaded = Some((cb, offset));
        offset != start
    }

    fn run_dma(&mut self) {
        loop {
            let mut progressed = false;
            for channel in 0..self.channels.len() {
                progressed |= self.step(channel);
            }
            if !progressed {
                break;
            }
        }
    }
}

impl SpiRegisters for SimulatedBus {
    fn spi_cs(&mut self) -> u32 {
        let mut status = self.spi_control;
        let active = self.spi_control & SPI_CS_TA != 0;
        if self.rx_fifo < FIFO_DEPTH {
            status |= SPI_CS_TXD;
        }
        if active && (self.spi_control & SPI_CS_DMAEN == 0 || self.dlen == 0) {
            status |= SPI_CS_DONE;
        }
        if self.rx_fifo > 0 {
            status |= SPI_CS_RXD;
        }
        if self.rx_fifo >= FIFO_DEPTH * 3 / 4 {
            status |= SPI_CS_RXR;
        }
        if self.rx_fifo == FIFO_DEPTH {
            status |= SPI_CS_RXF;
        }
        status
    }

    fn set_spi_cs(&mut self, value: u32) {
        self.write_spi_cs(value);
    }

    fn write_fifo(&mut self, byte: u8) {
        self.fifo_write(byte);
    }

    fn read_fifo(&mut self) -> u8 {
        self.rx_fifo = self.rx_fifo.saturating_sub(1);
        0
    }

    fn set_data_mode(&mut self, data: bool) {
        self.data_mode = data;
    }
}

impl DmaRegisters for SimulatedBus {
    fn dma_cs(&mut self, channel: u8) -> u32 {
        self.channels[channel as usize].cs
    }

    fn set_dma_cs(&mut self, channel: u8, value: u32) {
        let was_active = self.channels[channel as usize].active();
        self.write_dma_cs(channel, value);
        if !was_active && self.channels[channel as usize].active() {
            self.kickoffs += 1;
        }
        self.run_dma();
    }

    fn dma_cb_addr(&mut self, channel: u8) -> u32 {
        self.channels[channel as usize].cb_addr
    }

    fn set_dma_cb_addr(&mut self, channel: u8, value: u32) {
        self.channels[channel as usize].cb_addr = value;
    }

    fn dma_ti(&mut self, channel: u8) -> u32 {
        self.channels[channel as usize].ti
    }

    fn dma_debug(&mut self, channel: u8) -> u32 {
        self.channels[channel as usize].debug
    }

    fn dma_memory(&mut self) -> &mut DmaMemory {
        &mut self.memory
    }
}
