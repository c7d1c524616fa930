//! Register-level access to the SPI0 controller and the DMA engine.
//!
//! Mapping the real peripherals (`/dev/mem`, mailbox-allocated uncached
//! memory) lives outside this crate. The transfer backends only talk to the
//! [`SpiRegisters`] and [`DmaRegisters`] traits, which [`SimulatedBus`]
//! implements in software.

mod panel_model;
pub mod regs;
mod sim;

use std::fmt;
use std::ops::Range;

pub use panel_model::PanelModel;
pub use regs::DmaControlBlock;
pub use sim::{BusByte, SimulatedBus, WireTap};

use regs::DMA_CONTROL_BLOCK_BYTES;

/// SPI0 register file plus the data/command GPIO line.
pub trait SpiRegisters {
    fn spi_cs(&mut self) -> u32;

    fn set_spi_cs(&mut self, value: u32);

    fn write_fifo(&mut self, byte: u8);

    fn read_fifo(&mut self) -> u8;

    /// Drive the D/C line: `false` selects command bytes, `true` data.
    fn set_data_mode(&mut self, data: bool);
}

/// DMA channel register files and the uncached memory the engine reads
/// control blocks and source bytes from.
pub trait DmaRegisters {
    fn dma_cs(&mut self, channel: u8) -> u32;

    fn set_dma_cs(&mut self, channel: u8, value: u32);

    fn dma_cb_addr(&mut self, channel: u8) -> u32;

    fn set_dma_cb_addr(&mut self, channel: u8, value: u32);

    /// Transfer information of the control block the channel last loaded.
    fn dma_ti(&mut self, channel: u8) -> u32;

    fn dma_debug(&mut self, channel: u8) -> u32 {
        let _ = channel;
        0
    }

    fn dma_memory(&mut self) -> &mut DmaMemory;
}

/// Bus-addressable, cache-bypassing memory shared with the DMA engine:
/// a pool of control blocks, a staging area for source bytes, and two
/// constant words the bridging control blocks copy into registers.
pub struct DmaMemory {
    control_blocks: Vec<DmaControlBlock>,
    cb_bus_base: u32,
    staging: Vec<u8>,
    staging_bus_base: u32,
    constants: [u32; 2],
    constants_bus_base: u32,
}

const DEFAULT_CB_BUS_BASE: u32 = 0xC100_0000;
const DEFAULT_STAGING_BUS_BASE: u32 = 0xC200_0000;
const DEFAULT_CONSTANTS_BUS_BASE: u32 = 0xC300_0000;

impl DmaMemory {
    pub fn new(control_blocks: usize, staging_bytes: usize) -> Self {
        Self {
            control_blocks: vec![DmaControlBlock::default(); control_blocks],
            cb_bus_base: DEFAULT_CB_BUS_BASE,
            staging: vec![0; staging_bytes.next_multiple_of(4)],
            staging_bus_base: DEFAULT_STAGING_BUS_BASE,
            constants: [0; 2],
            constants_bus_base: DEFAULT_CONSTANTS_BUS_BASE,
        }
    }

    pub fn control_block_count(&self) -> usize {
        self.control_blocks.len()
    }

    pub fn staging_len(&self) -> usize {
        self.staging.len()
    }

    pub fn control_block(&self, index: usize) -> &DmaControlBlock {
        &self.control_blocks[index]
    }

    pub fn control_block_mut(&mut self, index: usize) -> &mut DmaControlBlock {
        &mut self.control_blocks[index]
    }

    pub fn cb_bus_address(&self, index: usize) -> u32 {
        self.cb_bus_base + index as u32 * DMA_CONTROL_BLOCK_BYTES
    }

    pub fn cb_bus_range(&self) -> Range<u32> {
        self.cb_bus_base..self.cb_bus_address(self.control_blocks.len())
    }

    pub fn cb_index(&self, bus_address: u32) -> Option<usize> {
        if !self.cb_bus_range().contains(&bus_address) {
            return None;
        }
        let offset = bus_address - self.cb_bus_base;
        (offset % DMA_CONTROL_BLOCK_BYTES == 0).then_some((offset / DMA_CONTROL_BLOCK_BYTES) as usize)
    }

    pub fn staging(&self) -> &[u8] {
        &self.staging
    }

    pub fn staging_mut(&mut self) -> &mut [u8] {
        &mut self.staging
    }

    pub fn staging_bus_address(&self, offset: usize) -> u32 {
        self.staging_bus_base + offset as u32
    }

    pub fn write_staging_word(&mut self, offset: usize, value: u32) {
        self.staging[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn set_constants(&mut self, constants: [u32; 2]) {
        self.constants = constants;
    }

    pub fn constant_bus_address(&self, index: usize) -> u32 {
        self.constants_bus_base + index as u32 * 4
    }

    /// Byte at a bus address in the staging area or constant words.
    pub fn read_byte(&self, bus_address: u32) -> Option<u8> {
        if let Some(offset) = bus_address.checked_sub(self.staging_bus_base) {
            if let Some(byte) = self.staging.get(offset as usize) {
                return Some(*byte);
            }
        }
        let offset = bus_address.checked_sub(self.constants_bus_base)? as usize;
        let word = self.constants.get(offset / 4)?;
        Some(word.to_le_bytes()[offset % 4])
    }

    pub fn read_word(&self, bus_address: u32) -> Option<u32> {
        let mut bytes = [0u8; 4];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = self.read_byte(bus_address + i as u32)?;
        }
        Some(u32::from_le_bytes(bytes))
    }
}

impl fmt::Debug for DmaMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaMemory")
            .field("control_blocks", &self.control_blocks.len())
            .field("cb_bus_base", &format_args!("{:#010x}", self.cb_bus_base))
            .field("staging_len", &self.staging.len())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelDump {
    pub channel: u8,
    pub cs: u32,
    pub ti: u32,
    pub cb_addr: u32,
    pub debug: u32,
}

/// Snapshot of the SPI and both DMA channels, logged on fatal errors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegisterDump {
    pub spi_cs: u32,
    pub tx: ChannelDump,
    pub rx: ChannelDump,
}

impl RegisterDump {
    pub fn capture<H>(hw: &mut H, tx_channel: u8, rx_channel: u8) -> Self
    where
        H: SpiRegisters + DmaRegisters + ?Sized,
    {
        let channel = |hw: &mut H, ch: u8| ChannelDump {
            channel: ch,
            cs: hw.dma_cs(ch),
            ti: hw.dma_ti(ch),
            cb_addr: hw.dma_cb_addr(ch),
            debug: hw.dma_debug(ch),
        };
        let tx = channel(hw, tx_channel);
        let rx = channel(hw, rx_channel);
        Self {
            spi_cs: hw.spi_cs(),
            tx,
            rx,
        }
    }
}

impl fmt::Display for ChannelDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ch{} cs={:#010x} ti={:#010x} cbAddr={:#010x} debug={:#010x}",
            self.channel, self.cs, self.ti, self.cb_addr, self.debug
        )
    }
}

impl fmt::Display for RegisterDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "spi cs={:#010x}; tx {}; rx {}", self.spi_cs, self.tx, self.rx)
    }
}
