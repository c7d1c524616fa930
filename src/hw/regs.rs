//! BCM2835 SPI0 and DMA register bits, bus addresses and the DMA control
//! block layout.

pub const SPI_CS_RXF: u32 = 0x0010_0000;
pub const SPI_CS_RXR: u32 = 0x0008_0000;
pub const SPI_CS_TXD: u32 = 0x0004_0000;
pub const SPI_CS_RXD: u32 = 0x0002_0000;
pub const SPI_CS_DONE: u32 = 0x0001_0000;
pub const SPI_CS_DMAEN: u32 = 0x0000_0100;
pub const SPI_CS_TA: u32 = 0x0000_0080;
pub const SPI_CS_CLEAR: u32 = 0x0000_0030;
pub const SPI_CS_CLEAR_RX: u32 = 0x0000_0020;
pub const SPI_CS_CLEAR_TX: u32 = 0x0000_0010;

/// CPOL/CPHA/CS-polarity bits OR'ed into every CS write. Mode 0, CS0.
pub const SPI_DRIVE_SETTINGS: u32 = 0;

pub const DMA_CS_RESET: u32 = 1 << 31;
pub const DMA_CS_ABORT: u32 = 1 << 30;
pub const DMA_CS_ERROR: u32 = 1 << 8;
pub const DMA_CS_INT: u32 = 1 << 2;
pub const DMA_CS_END: u32 = 1 << 1;
pub const DMA_CS_ACTIVE: u32 = 1;

pub const DMA_TI_SRC_IGNORE: u32 = 1 << 11;
pub const DMA_TI_SRC_DREQ: u32 = 1 << 10;
pub const DMA_TI_SRC_INC: u32 = 1 << 8;
pub const DMA_TI_DEST_IGNORE: u32 = 1 << 7;
pub const DMA_TI_DEST_DREQ: u32 = 1 << 6;
pub const DMA_TI_DEST_INC: u32 = 1 << 4;
pub const DMA_TI_WAIT_RESP: u32 = 1 << 3;

pub const DMA_TI_PERMAP_SHIFT: u32 = 16;
pub const DMA_TI_PERMAP_MASK: u32 = 0x1F << DMA_TI_PERMAP_SHIFT;
pub const DMA_PERMAP_SPI_TX: u32 = 6;
pub const DMA_PERMAP_SPI_RX: u32 = 7;

#[inline(always)]
pub const fn dma_ti_permap(peripheral: u32) -> u32 {
    peripheral << DMA_TI_PERMAP_SHIFT
}

#[inline(always)]
pub const fn dma_ti_peripheral(ti: u32) -> u32 {
    (ti & DMA_TI_PERMAP_MASK) >> DMA_TI_PERMAP_SHIFT
}

pub const NUM_DMA_CHANNELS: u8 = 15;

/// Peripheral addresses as seen from the DMA engine.
pub const SPI_CS_BUS_ADDRESS: u32 = 0x7E20_4000;
pub const SPI_FIFO_BUS_ADDRESS: u32 = 0x7E20_4004;
pub const DMA0_BUS_ADDRESS: u32 = 0x7E00_7000;
pub const DMA_CHANNEL_STRIDE: u32 = 0x100;

#[inline(always)]
pub const fn dma_channel_cs_bus_address(channel: u8) -> u32 {
    DMA0_BUS_ADDRESS + channel as u32 * DMA_CHANNEL_STRIDE
}

#[inline(always)]
pub const fn dma_channel_cb_addr_bus_address(channel: u8) -> u32 {
    dma_channel_cs_bus_address(channel) + 4
}

/// Hardware DMA control block. Must be 32-byte aligned.
#[repr(C, align(32))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DmaControlBlock {
    pub ti: u32,
    pub src: u32,
    pub dst: u32,
    pub len: u32,
    pub stride: u32,
    pub next: u32,
    pub debug: u32,
    pub reserved: u32,
}

pub const DMA_CONTROL_BLOCK_BYTES: u32 = std::mem::size_of::<DmaControlBlock>() as u32;
