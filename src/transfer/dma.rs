use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{
    DMA_IS_FASTER_THAN_POLLED_SPI, FramePair, PixelGather, TransferBackend, gather_task,
    require_frames, send_command, wait_for_polled_transfer, write_polled,
};
use crate::config::{DmaConfig, MirrorConfig, TransferMode};
use crate::error::{MirrorError, MirrorResult};
use crate::hw::regs::*;
use crate::hw::{DmaControlBlock, DmaRegisters, RegisterDump, SpiRegisters};
use crate::panel::{PanelProfile, SET_CURSOR_X, SET_CURSOR_Y, WRITE_PIXELS};
use crate::sync::ShutdownSignal;
use crate::task_queue::{PayloadKind, Task, TaskHeader};

/// Largest payload one TX/RX control block pair moves. DLEN is 16 bits and
/// chunks stay 32-byte multiples.
pub const MAX_DMA_SPI_TASK_SIZE: usize = 65504;

/// With every task on DMA, payloads shorter than this still go polled.
const MIN_DMA_TASK_BYTES: usize = 4;

/// Wake up this long before the previous transfer is expected to finish.
const PACING_SLACK_US: f64 = 70.0;

const FINISH_POLL_INTERVAL: Duration = Duration::from_micros(100);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DmaCounters {
    pub dma_tasks: u64,
    pub polled_tasks: u64,
    pub chunks: u64,
    pub pool_recycles: u64,
    pub staging_recycles: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LastPath {
    Polled,
    Dma,
}

enum ChunkSource<'p, 'f, 'a> {
    Inline(&'p [u8]),
    Framebuffer(PixelGather, &'f mut FramePair<'a>),
}

/// Sends large payloads through a TX/RX DMA channel pair, small ones
/// through the FIFO.
///
/// In [`TransferMode::Dma`] each DMA transfer runs to completion before
/// `execute` returns. In [`TransferMode::DmaAllTasks`] transfers are
/// started and left running; the next task waits for them, so the CPU can
/// diff the next frame while the bus is busy.
pub struct DmaBackend<H> {
    hw: H,
    all_tasks: bool,
    wide_bus: bool,
    tx: u8,
    rx: u8,
    usecs_per_byte: f64,
    config: DmaConfig,
    shutdown: Arc<ShutdownSignal>,
    next_cb: usize,
    staging_end: usize,
    last_path: LastPath,
    pending_bytes: usize,
    task_started: Instant,
    scratch: Vec<u8>,
    counters: DmaCounters,
}

impl<H: SpiRegisters + DmaRegisters + Send> DmaBackend<H> {
    /// Claim the configured channels, reset them and put SPI into polled
    /// mode. Fails if another user owns either channel.
    pub fn new(
        hw: H,
        config: &MirrorConfig,
        panel: &PanelProfile,
        shutdown: &Arc<ShutdownSignal>,
    ) -> MirrorResult<Self> {
        let dma = config.dma.clone();
        if dma.tx_channel == dma.rx_channel
            || dma.tx_channel >= NUM_DMA_CHANNELS
            || dma.rx_channel >= NUM_DMA_CHANNELS
        {
            return Err(MirrorError::InvalidConfig(format!(
                "DMA channels {} (TX) and {} (RX) must be distinct and below {NUM_DMA_CHANNELS}",
                dma.tx_channel, dma.rx_channel
            )));
        }

        let mut backend = Self {
            hw,
            all_tasks: config.transfer_mode == TransferMode::DmaAllTasks,
            wide_bus: panel.bus_is_16_bits_wide,
            tx: dma.tx_channel,
            rx: dma.rx_channel,
            usecs_per_byte: config.bus_usecs_per_byte(),
            config: dma,
            shutdown: shutdown.clone(),
            next_cb: 0,
            staging_end: 0,
            last_path: LastPath::Polled,
            pending_bytes: 1,
            task_started: Instant::now(),
            scratch: Vec::new(),
            counters: DmaCounters::default(),
        };

        let memory = backend.hw.dma_memory();
        if memory.control_block_count() < 8 || memory.staging_len() < 64 {
            return Err(MirrorError::InvalidConfig(format!(
                "DMA memory too small: {} control blocks, {} staging bytes",
                memory.control_block_count(),
                memory.staging_len()
            )));
        }
        memory.set_constants([SPI_CS_DMAEN | SPI_DRIVE_SETTINGS, DMA_CS_ACTIVE | DMA_CS_END]);

        backend.claim_channel(backend.tx, DMA_PERMAP_SPI_TX)?;
        backend.claim_channel(backend.rx, DMA_PERMAP_SPI_RX)?;
        backend.hw.set_dma_cs(backend.tx, DMA_CS_RESET);
        backend.hw.set_dma_cs(backend.rx, DMA_CS_RESET);
        backend
            .hw
            .set_spi_cs(SPI_CS_TA | SPI_CS_CLEAR | SPI_DRIVE_SETTINGS);
        backend.hw.set_data_mode(true);

        log::info!(
            "DMA transfers on TX channel {} / RX channel {} ({} control blocks, {} staging bytes, {})",
            backend.tx,
            backend.rx,
            backend.hw.dma_memory().control_block_count(),
            backend.hw.dma_memory().staging_len(),
            if backend.all_tasks { "all tasks" } else { "large tasks" }
        );
        Ok(backend)
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

    pub fn counters(&self) -> DmaCounters {
        self.counters
    }

    fn claim_channel(&mut self, channel: u8, expected: u32) -> MirrorResult<()> {
        let peripheral = dma_ti_peripheral(self.hw.dma_ti(channel));
        if peripheral != 0 && peripheral != expected {
            return Err(self.stolen(
                channel,
                format!("assigned to peripheral {peripheral}, expected {expected}"),
            ));
        }
        if self.hw.dma_cb_addr(channel) != 0 && self.hw.dma_cs(channel) & DMA_CS_ACTIVE != 0 {
            return Err(self.stolen(channel, "already running a transfer".into()));
        }
        Ok(())
    }

    fn stolen(&mut self, channel: u8, detail: String) -> MirrorError {
        let registers = RegisterDump::capture(&mut self.hw, self.tx, self.rx);
        log::error!("DMA channel {channel} collision ({detail}): {registers}");
        MirrorError::ChannelStolen { channel, detail }
    }

    fn stalled(&mut self, channel: &'static str, waited: Duration) -> MirrorError {
        let registers = RegisterDump::capture(&mut self.hw, self.tx, self.rx);
        log::error!("DMA {channel} channel stalled for {waited:?}: {registers}");
        MirrorError::HardwareStall {
            channel,
            waited,
            registers,
        }
    }

    /// Verify nobody else has programmed our channels since the last check.
    fn check_not_stolen(&mut self) -> MirrorResult<()> {
        for (channel, expected) in [(self.tx, DMA_PERMAP_SPI_TX), (self.rx, DMA_PERMAP_SPI_RX)] {
            let peripheral = dma_ti_peripheral(self.hw.dma_ti(channel));
            if peripheral != 0 && peripheral != expected {
                return Err(self.stolen(
                    channel,
                    format!("reassigned to peripheral {peripheral}, expected {expected}"),
                ));
            }
            let cb_addr = self.hw.dma_cb_addr(channel);
            if cb_addr != 0 && !self.hw.dma_memory().cb_bus_range().contains(&cb_addr) {
                return Err(self.stolen(
                    channel,
                    format!("running a foreign control block at {cb_addr:#010x}"),
                ));
            }
        }
        Ok(())
    }

    /// Wait for TX, then RX, to drop ACTIVE. `Ok(false)` means shutdown
    /// interrupted the wait.
    fn wait_channels_idle(
        &mut self,
        timeout: Duration,
        poll: Duration,
        check_stolen: bool,
    ) -> MirrorResult<bool> {
        for (channel, name) in [(self.tx, "TX"), (self.rx, "RX")] {
            let started = Instant::now();
            while self.hw.dma_cs(channel) & DMA_CS_ACTIVE != 0 {
                if !self.shutdown.is_running() {
                    return Ok(false);
                }
                std::thread::sleep(poll);
                if check_stolen {
                    self.check_not_stolen()?;
                }
                let waited = started.elapsed();
                if waited > timeout {
                    return Err(self.stalled(name, waited));
                }
            }
        }
        Ok(true)
    }

    fn wait_for_dma_finished(&mut self) -> MirrorResult<()> {
        self.wait_channels_idle(self.config.idle_timeout, FINISH_POLL_INTERVAL, false)?;
        Ok(())
    }

    fn grab_control_blocks(&mut self, count: usize) -> MirrorResult<usize> {
        let pool = self.hw.dma_memory().control_block_count();
        if count >= pool {
            return Err(MirrorError::InvalidConfig(format!(
                "transfer needs {count} DMA control blocks, pool holds {pool}"
            )));
        }
        if self.next_cb + count >= pool {
            log::debug!("DMA control block pool exhausted, recycling after the engine idles");
            self.wait_for_dma_finished()?;
            self.next_cb = 0;
            self.counters.pool_recycles += 1;
        }
        let first = self.next_cb;
        self.next_cb += count;
        Ok(first)
    }

    fn grab_staging(&mut self, bytes: usize) -> MirrorResult<usize> {
        let len = self.hw.dma_memory().staging_len();
        if bytes >= len {
            return Err(MirrorError::TaskTooLarge {
                requested: bytes,
                capacity: len,
            });
        }
        if self.staging_end + bytes >= len {
            log::debug!("DMA staging area full, recycling after the engine idles");
            self.wait_for_dma_finished()?;
            self.staging_end = 0;
            self.counters.staging_recycles += 1;
        }
        let offset = self.staging_end;
        self.staging_end += bytes;
        Ok(offset)
    }

    fn uses_dma(&self, cmd: u8, len: usize) -> bool {
        if self.all_tasks {
            len >= MIN_DMA_TASK_BYTES && matches!(cmd, WRITE_PIXELS | SET_CURSOR_X | SET_CURSOR_Y)
        } else {
            len > DMA_IS_FASTER_THAN_POLLED_SPI
        }
    }

    /// Stage the payload and build its control block chain. Returns the bus
    /// addresses of the first TX and RX blocks.
    ///
    /// Layout of the staged bytes for `n` chunks: `n - 1` words holding the
    /// address of each follow-up TX block, then per chunk a SPI header word
    /// (`TA | DLEN << 16`) followed by the chunk bytes. Blocks per chunk: TX,
    /// RX and, from the second chunk on, three bridging blocks hung off the
    /// previous RX block that point TX at the new chunk, drop TA so SPI
    /// reads the next header, and restart TX.
    fn build_chain(&mut self, header: &TaskHeader, mut source: ChunkSource<'_, '_, '_>) -> MirrorResult<(u32, u32)> {
        let len = header.wire_len as usize;
        let chunks = len.div_ceil(MAX_DMA_SPI_TASK_SIZE).max(1);
        let staged = (4 * (chunks - 1) + 4 * chunks + len).next_multiple_of(4);
        let base = self.grab_staging(staged)?;
        let mut cb = self.grab_control_blocks(5 * chunks - 3)?;

        let tx_channel = self.tx;
        let memory = self.hw.dma_memory();
        let bridge_ti = DMA_TI_SRC_INC | DMA_TI_DEST_INC | DMA_TI_WAIT_RESP;
        let mut address_word = base;
        let mut tx_data = base + 4 * (chunks - 1);
        let mut rx_tail: Option<usize> = None;
        let mut first = (0, 0);
        let mut sent = 0;

        while sent < len {
            let size = (len - sent).min(MAX_DMA_SPI_TASK_SIZE);
            memory.write_staging_word(tx_data, SPI_CS_TA | SPI_DRIVE_SETTINGS | ((size as u32) << 16));
            let out = &mut memory.staging_mut()[tx_data + 4..tx_data + 4 + size];
            match &mut source {
                ChunkSource::Inline(bytes) => out.copy_from_slice(&bytes[sent..sent + size]),
                ChunkSource::Framebuffer(gather, frames) => {
                    gather.fill(frames, out);
                }
            }

            let (tx, rx) = (cb, cb + 1);
            cb += 2;
            let tx_addr = memory.cb_bus_address(tx);
            let rx_addr = memory.cb_bus_address(rx);
            *memory.control_block_mut(tx) = DmaControlBlock {
                ti: dma_ti_permap(DMA_PERMAP_SPI_TX) | DMA_TI_DEST_DREQ | DMA_TI_SRC_INC | DMA_TI_WAIT_RESP,
                src: memory.staging_bus_address(tx_data),
                dst: SPI_FIFO_BUS_ADDRESS,
                len: 4 + size as u32,
                ..DmaControlBlock::default()
            };
            *memory.control_block_mut(rx) = DmaControlBlock {
                ti: dma_ti_permap(DMA_PERMAP_SPI_RX) | DMA_TI_SRC_DREQ | DMA_TI_DEST_IGNORE,
                src: SPI_FIFO_BUS_ADDRESS,
                len: size as u32,
                ..DmaControlBlock::default()
            };

            match rx_tail {
                None => first = (tx_addr, rx_addr),
                Some(previous_rx) => {
                    let (set_tx, disable_ta, start_tx) = (cb, cb + 1, cb + 2);
                    cb += 3;
                    let set_tx_addr = memory.cb_bus_address(set_tx);
                    let disable_ta_addr = memory.cb_bus_address(disable_ta);
                    let start_tx_addr = memory.cb_bus_address(start_tx);

                    memory.control_block_mut(previous_rx).next = set_tx_addr;
                    memory.write_staging_word(address_word, tx_addr);
                    *memory.control_block_mut(set_tx) = DmaControlBlock {
                        ti: bridge_ti,
                        src: memory.staging_bus_address(address_word),
                        dst: dma_channel_cb_addr_bus_address(tx_channel),
                        len: 4,
                        next: disable_ta_addr,
                        ..DmaControlBlock::default()
                    };
                    address_word += 4;
                    *memory.control_block_mut(disable_ta) = DmaControlBlock {
                        ti: bridge_ti,
                        src: memory.constant_bus_address(0),
                        dst: SPI_CS_BUS_ADDRESS,
                        len: 4,
                        next: start_tx_addr,
                        ..DmaControlBlock::default()
                    };
                    *memory.control_block_mut(start_tx) = DmaControlBlock {
                        ti: bridge_ti,
                        src: memory.constant_bus_address(1),
                        dst: dma_channel_cs_bus_address(tx_channel),
                        len: 4,
                        next: rx_addr,
                        ..DmaControlBlock::default()
                    };
                }
            }
            rx_tail = Some(rx);
            tx_data += 4 + size;
            sent += size;
        }

        self.counters.chunks += chunks as u64;
        Ok(first)
    }

    /// Sleep through most of the previous transfer instead of spinning on it.
    fn pace(&self) {
        let pending_us = self.pending_bytes as f64 * self.usecs_per_byte
            - self.task_started.elapsed().as_secs_f64() * 1e6;
        if pending_us > PACING_SLACK_US {
            std::thread::sleep(Duration::from_secs_f64((pending_us - PACING_SLACK_US) / 1e6));
        }
    }

    fn transfer_dma(&mut self, task: &Task<'_>, frames: Option<&mut FramePair<'_>>) -> MirrorResult<()> {
        let header = *task.header();
        let source = match task.kind() {
            PayloadKind::Inline => ChunkSource::Inline(task.payload()),
            PayloadKind::Framebuffer => {
                let frames = require_frames(frames)?;
                let gather = PixelGather::new(&header, frames.current.stride());
                ChunkSource::Framebuffer(gather, frames)
            }
        };
        let (tx0, rx0) = self.build_chain(&header, source)?;

        self.pace();
        self.check_not_stolen()?;
        if !self.wait_channels_idle(self.config.kickoff_timeout, self.config.poll_interval, true)? {
            return Err(MirrorError::Canceled);
        }
        self.pending_bytes = header.wire_len as usize;

        self.hw.set_spi_cs(SPI_CS_TA | SPI_CS_CLEAR | SPI_DRIVE_SETTINGS);
        send_command(&mut self.hw, header.cmd, self.wide_bus);
        self.hw.set_spi_cs(SPI_CS_DMAEN | SPI_CS_CLEAR | SPI_DRIVE_SETTINGS);
        self.hw.set_dma_cb_addr(self.tx, tx0);
        self.hw.set_dma_cb_addr(self.rx, rx0);
        self.hw.set_dma_cs(self.tx, DMA_CS_ACTIVE | DMA_CS_END);
        self.hw.set_dma_cs(self.rx, DMA_CS_ACTIVE | DMA_CS_END);
        self.task_started = Instant::now();
        log::trace!("DMA task cmd={:#04x} {} bytes", header.cmd, header.wire_len);
        Ok(())
    }

    /// Block on a transfer just started and hand SPI back to polled mode.
    fn finish_synchronously(&mut self, len: usize) -> MirrorResult<()> {
        let expected_us = len as f64 * self.usecs_per_byte;
        if expected_us > PACING_SLACK_US {
            std::thread::sleep(Duration::from_secs_f64((expected_us - PACING_SLACK_US) / 1e6));
        }
        if !self.wait_channels_idle(self.config.kickoff_timeout, self.config.poll_interval, true)? {
            return Err(MirrorError::Canceled);
        }
        self.pending_bytes = 0;
        self.hw.set_spi_cs(SPI_CS_TA | SPI_CS_CLEAR | SPI_DRIVE_SETTINGS);
        Ok(())
    }

    fn transfer_polled(&mut self, task: &Task<'_>, frames: Option<&mut FramePair<'_>>) -> MirrorResult<()> {
        if self.last_path == LastPath::Dma {
            self.wait_for_dma_finished()?;
            self.hw
                .set_spi_cs(SPI_CS_TA | SPI_CS_CLEAR_TX | SPI_DRIVE_SETTINGS);
        } else {
            wait_for_polled_transfer(&mut self.hw);
        }
        send_command(&mut self.hw, task.cmd(), self.wide_bus);
        match task.kind() {
            PayloadKind::Inline => write_polled(&mut self.hw, task.payload()),
            PayloadKind::Framebuffer => {
                gather_task(task.header(), frames, &mut self.scratch)?;
                write_polled(&mut self.hw, &self.scratch);
            }
        }
        Ok(())
    }
}

impl<H: SpiRegisters + DmaRegisters + Send> TransferBackend for DmaBackend<H> {
    fn execute(&mut self, task: &Task<'_>, frames: Option<&mut FramePair<'_>>) -> MirrorResult<()> {
        if !self.uses_dma(task.cmd(), task.wire_len()) {
            self.transfer_polled(task, frames)?;
            self.last_path = LastPath::Polled;
            self.counters.polled_tasks += 1;
            return Ok(());
        }

        if self.last_path == LastPath::Polled {
            wait_for_polled_transfer(&mut self.hw);
        }
        self.transfer_dma(task, frames)?;
        if self.all_tasks {
            self.last_path = LastPath::Dma;
        } else {
            self.finish_synchronously(task.wire_len())?;
            self.last_path = LastPath::Polled;
        }
        self.counters.dma_tasks += 1;
        Ok(())
    }

    fn wait_until_idle(&mut self) -> MirrorResult<()> {
        match self.last_path {
            LastPath::Dma => self.wait_for_dma_finished(),
            LastPath::Polled => {
                wait_for_polled_transfer(&mut self.hw);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framebuffer::Framebuffer;
    use crate::hw::{BusByte, DmaMemory, SimulatedBus, WireTap};
    use crate::task_queue::{TaskConsumer, TaskProducer, task_queue};

    struct Rig {
        backend: DmaBackend<SimulatedBus>,
        tap: WireTap,
        producer: TaskProducer,
        consumer: TaskConsumer,
        _shutdown: Arc<ShutdownSignal>,
    }

    fn rig(mode: TransferMode, control_blocks: usize, queue: usize) -> Rig {
        let config = MirrorConfig {
            transfer_mode: mode,
            spi_core_hz: 400_000_000,
            spi_clock_divisor: 2,
            dma: DmaConfig {
                kickoff_timeout: Duration::from_millis(20),
                idle_timeout: Duration::from_millis(20),
                poll_interval: Duration::from_millis(1),
                ..DmaConfig::default()
            },
            ..MirrorConfig::default()
        };
        let shutdown = ShutdownSignal::new();
        let tap = WireTap::recording();
        let bus = SimulatedBus::new(DmaMemory::new(control_blocks, queue * 2), tap.clone());
        let backend = DmaBackend::new(bus, &config, &PanelProfile::ili9341(), &shutdown).unwrap();
        let (producer, consumer) = task_queue(queue, 1, &shutdown).unwrap();
        Rig {
            backend,
            tap,
            producer,
            consumer,
            _shutdown: shutdown,
        }
    }

    impl Rig {
        fn send(&mut self, cmd: u8, payload: &[u8]) -> MirrorResult<()> {
            let mut task = self.producer.allocate(cmd, payload.len()).unwrap();
            task.payload_mut().copy_from_slice(payload);
            task.commit();
            let task = self.consumer.dequeue().unwrap();
            let result = self.backend.execute(&task, None);
            task.retire();
            result
        }

        fn wire(&self) -> Vec<BusByte> {
            self.tap.bytes()
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn expect_task(wire: &[BusByte], cmd: u8, payload: &[u8]) {
        assert_eq!(wire[0], BusByte { data: false, value: cmd });
        assert_eq!(wire.len(), payload.len() + 1);
        assert!(wire[1..].iter().all(|b| b.data));
        let data: Vec<u8> = wire[1..].iter().map(|b| b.value).collect();
        assert!(data == payload, "payload mismatch");
    }

    #[test]
    fn multi_chunk_chain_shape() {
        let len = 2 * MAX_DMA_SPI_TASK_SIZE + 100;
        let mut rig = rig(TransferMode::DmaAllTasks, 64, 140_000);
        let payload = pattern(len);
        rig.send(WRITE_PIXELS, &payload).unwrap();
        rig.backend.wait_until_idle().unwrap();

        let memory = rig.backend.hw_mut().dma_memory();
        let addr = |i: usize| memory.cb_bus_address(i);
        // tx0 rx0 | tx1 rx1 set disable start | tx2 rx2 set disable start
        assert_eq!(dma_ti_peripheral(memory.control_block(0).ti), DMA_PERMAP_SPI_TX);
        assert_eq!(memory.control_block(0).len as usize, 4 + MAX_DMA_SPI_TASK_SIZE);
        assert_eq!(dma_ti_peripheral(memory.control_block(1).ti), DMA_PERMAP_SPI_RX);
        assert_eq!(memory.control_block(1).next, addr(4));
        assert_eq!(memory.control_block(4).dst, dma_channel_cb_addr_bus_address(7));
        assert_eq!(memory.control_block(4).next, addr(5));
        assert_eq!(memory.control_block(5).dst, SPI_CS_BUS_ADDRESS);
        assert_eq!(memory.control_block(5).next, addr(6));
        assert_eq!(memory.control_block(6).dst, dma_channel_cs_bus_address(7));
        assert_eq!(memory.control_block(6).next, addr(3));
        assert_eq!(memory.control_block(3).next, addr(9));
        assert_eq!(memory.control_block(11).next, addr(8));
        assert_eq!(memory.control_block(8).len, 100);
        assert_eq!(memory.control_block(8).next, 0);
        assert_eq!(
            memory.read_word(memory.control_block(4).src),
            Some(addr(2))
        );

        assert_eq!(rig.backend.next_cb, 5 * 3 - 3);
        assert_eq!(rig.backend.counters().chunks, 3);
        expect_task(&rig.wire(), WRITE_PIXELS, &payload);
        assert_eq!(rig.backend.hw().kickoffs(), 2);
        assert_eq!(rig.tap.dropped_bytes(), 0);
    }

    #[test]
    fn short_tasks_stay_polled_when_all_tasks_use_dma() {
        let mut rig = rig(TransferMode::DmaAllTasks, 64, 4096);
        rig.send(SET_CURSOR_Y, &[0, 5]).unwrap();
        rig.send(SET_CURSOR_X, &[0, 1, 0, 9]).unwrap();
        rig.send(0x36, &[0x28, 0, 0, 0, 0]).unwrap();
        rig.send(WRITE_PIXELS, &pattern(18)).unwrap();
        rig.backend.wait_until_idle().unwrap();

        let counters = rig.backend.counters();
        assert_eq!(counters.polled_tasks, 2);
        assert_eq!(counters.dma_tasks, 2);

        let wire = rig.wire();
        expect_task(&wire[0..3], SET_CURSOR_Y, &[0, 5]);
        expect_task(&wire[3..8], SET_CURSOR_X, &[0, 1, 0, 9]);
        expect_task(&wire[8..14], 0x36, &[0x28, 0, 0, 0, 0]);
        expect_task(&wire[14..], WRITE_PIXELS, &pattern(18));
        assert_eq!(rig.tap.dropped_bytes(), 0);
    }

    #[test]
    fn hybrid_mode_only_uses_dma_for_large_payloads() {
        let mut rig = rig(TransferMode::Dma, 64, 8192);
        rig.send(WRITE_PIXELS, &pattern(100)).unwrap();
        rig.send(WRITE_PIXELS, &pattern(1000)).unwrap();
        rig.send(SET_CURSOR_X, &[0, 2]).unwrap();

        let counters = rig.backend.counters();
        assert_eq!(counters.polled_tasks, 2);
        assert_eq!(counters.dma_tasks, 1);

        let wire = rig.wire();
        expect_task(&wire[0..101], WRITE_PIXELS, &pattern(100));
        expect_task(&wire[101..1102], WRITE_PIXELS, &pattern(1000));
        expect_task(&wire[1102..], SET_CURSOR_X, &[0, 2]);
        assert_eq!(rig.tap.dropped_bytes(), 0);
    }

    #[test]
    fn control_block_pool_is_recycled() {
        let mut rig = rig(TransferMode::DmaAllTasks, 16, 4096);
        for i in 0..20u8 {
            rig.send(WRITE_PIXELS, &[i; 64]).unwrap();
        }
        rig.backend.wait_until_idle().unwrap();

        assert!(rig.backend.counters().pool_recycles >= 2);
        let wire = rig.wire();
        assert_eq!(wire.len(), 20 * 65);
        for (i, task) in wire.chunks(65).enumerate() {
            expect_task(task, WRITE_PIXELS, &[i as u8; 64]);
        }
    }

    #[test]
    fn staging_area_is_recycled() {
        let mut rig = rig(TransferMode::DmaAllTasks, 256, 512);
        for i in 0..10u8 {
            rig.send(WRITE_PIXELS, &[i; 200]).unwrap();
        }
        assert!(rig.backend.counters().staging_recycles >= 1);
        assert_eq!(rig.wire().len(), 10 * 201);
    }

    #[test]
    fn stalled_channel_is_fatal() {
        let mut rig = rig(TransferMode::DmaAllTasks, 64, 4096);
        rig.backend.hw_mut().stall_channel(7);
        rig.send(WRITE_PIXELS, &pattern(64)).unwrap();
        let err = rig.send(WRITE_PIXELS, &pattern(64)).unwrap_err();
        assert!(err.is_fatal());
        match err {
            MirrorError::HardwareStall {
                channel, registers, ..
            } => {
                assert_eq!(channel, "TX");
                assert_eq!(registers.tx.channel, 7);
                assert_ne!(registers.tx.cs & DMA_CS_ACTIVE, 0);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn reassigned_channel_is_detected() {
        let mut rig = rig(TransferMode::DmaAllTasks, 64, 4096);
        rig.send(WRITE_PIXELS, &pattern(64)).unwrap();
        rig.backend.hw_mut().steal_channel(1, 2, 0);
        let err = rig.send(WRITE_PIXELS, &pattern(64)).unwrap_err();
        assert!(matches!(err, MirrorError::ChannelStolen { channel: 1, .. }));
    }

    #[test]
    fn foreign_control_block_is_detected() {
        let mut rig = rig(TransferMode::Dma, 64, 4096);
        rig.backend
            .hw_mut()
            .steal_channel(7, DMA_PERMAP_SPI_TX, 0x1000_0000);
        let err = rig.send(WRITE_PIXELS, &pattern(400)).unwrap_err();
        assert!(matches!(err, MirrorError::ChannelStolen { channel: 7, .. }));
    }

    #[test]
    fn busy_channel_cannot_be_claimed() {
        let shutdown = ShutdownSignal::new();
        let mut bus = SimulatedBus::new(DmaMemory::new(64, 4096), WireTap::default());
        bus.steal_channel(1, 3, 0);
        let result = DmaBackend::new(bus, &MirrorConfig::default(), &PanelProfile::ili9341(), &shutdown);
        assert!(matches!(result, Err(MirrorError::ChannelStolen { channel: 1, .. })));
    }

    #[test]
    fn framebuffer_task_is_gathered_across_chunks() {
        let (width, height) = (256u32, 160u32);
        let mut current = Framebuffer::with_stride(width, height, width + 8).unwrap();
        let mut previous = Framebuffer::with_stride(width, height, width + 8).unwrap();
        for y in 0..height {
            for x in 0..width {
                current.set_pixel(x, y, (y * 31 + x * 7) as u16);
            }
        }
        let mut rig = rig(TransferMode::DmaAllTasks, 64, 100_000);
        rig.producer
            .allocate_framebuffer(WRITE_PIXELS, 0, width as u16, width * height)
            .unwrap()
            .commit();
        let task = rig.consumer.dequeue().unwrap();
        let mut frames = FramePair {
            current: &current,
            previous: &mut previous,
        };
        rig.backend.execute(&task, Some(&mut frames)).unwrap();
        task.retire();
        rig.backend.wait_until_idle().unwrap();

        assert_eq!(rig.backend.counters().chunks, 2);
        let expected: Vec<u8> = (0..height)
            .flat_map(|y| current.row(y).iter().flat_map(|p| p.to_be_bytes()).collect::<Vec<_>>())
            .collect();
        expect_task(&rig.wire(), WRITE_PIXELS, &expected);
        for y in 0..height {
            assert_eq!(previous.row(y), current.row(y));
        }
    }
}
