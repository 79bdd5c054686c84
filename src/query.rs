//! The query cycle.
//!
//! One task owns all telemetry writes. Each iteration either polls the
//! battery (query frame out, up to 24 responses in, decoded fields into
//! the register bank) or, when a balancing request was latched at the
//! previous cycle boundary, sends the four balancing command frames
//! instead and returns to polling on the next round.
//!
//! Balancing requests arrive through the coils at the balancing status
//! addresses: a Modbus master sets the coils of the cells it wants
//! discharged (or clears them all to stop), and the difference against the
//! active set is latched into the intent exactly once per cycle, so a
//! request never interleaves with a running collection.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_time::Timer;
use heapless::Vec;

use bms_protocol::address::{self, scalar, CELLS_PER_BMU, CELLS_PER_PACK};
use bms_protocol::aggregate::PackAggregates;
use bms_protocol::balancing;
use bms_protocol::codec::{voltage_to_celsius, FrameId, TelemetryFrame};
use modbus_server::storage::RegisterBank;

use crate::can_management::{self, CanController};
use crate::config::GatewayConfig;

type Shared<T> = Mutex<CriticalSectionRawMutex, T>;

/// The latched balancing request. Written at cycle boundaries, consumed by
/// the cycle task before the next polling phase.
pub struct BalanceIntent {
    cells: Vec<u8, { CELLS_PER_PACK as usize }>,
    current_ma: u16,
    requested: bool,
}

impl BalanceIntent {
    pub const fn new() -> Self {
        BalanceIntent {
            cells: Vec::new(),
            current_ma: 0,
            requested: false,
        }
    }

    /// Latches a new request, replacing any pending one. An empty cell set
    /// requests stop-balancing.
    pub fn request(&mut self, cells: &[u8], current_ma: u16) {
        self.cells.clear();
        let _ = self.cells.extend_from_slice(cells);
        self.current_ma = current_ma;
        self.requested = true;
    }

    fn take(&mut self) -> Option<(Vec<u8, { CELLS_PER_PACK as usize }>, u16)> {
        if !self.requested {
            return None;
        }
        self.requested = false;
        let cells = self.cells.clone();
        self.cells.clear();
        Some((cells, self.current_ma))
    }
}

/// Runs the cycle forever. Transport errors abort the current iteration
/// and the next period retries from scratch.
pub async fn run(
    can: &'static Shared<CanController<'static>>,
    bank: &'static Shared<RegisterBank>,
    intent: &'static Shared<BalanceIntent>,
    config: &'static GatewayConfig,
) -> ! {
    let mut active_cells: Vec<u8, { CELLS_PER_PACK as usize }> = Vec::new();
    let mut query_count: u32 = 0;

    loop {
        latch_from_coils(bank, intent, config, &active_cells).await;

        let command = {
            let mut intent = intent.lock().await;
            intent.take()
        };

        match command {
            Some((cells, current_ma)) => {
                balance(can, bank, config, cells, current_ma, &mut active_cells).await;
            }
            None => {
                query_count += 1;
                poll(can, bank, config, query_count).await;
            }
        }

        Timer::after(config.query_period).await;
    }
}

/// One polling phase: query out, responses in, fields into the bank.
async fn poll(
    can: &'static Shared<CanController<'static>>,
    bank: &'static Shared<RegisterBank>,
    config: &GatewayConfig,
    query_count: u32,
) {
    defmt::info!("query cycle #{}", query_count);

    let frames = {
        let mut can = can.lock().await;
        if can_management::send_query(&mut can, &config.query_payload)
            .await
            .is_err()
        {
            defmt::warn!("query not sent, retrying next cycle");
            return;
        }
        can.collect_frames(config.expected_responses, config.collect_timeout)
            .await
    };

    if frames.is_empty() {
        defmt::warn!("no responses this cycle, register map left as is");
        return;
    }

    let mut aggregates = PackAggregates::new();
    let mut applied: u32 = 0;

    for envelope in &frames {
        let id = match FrameId::parse(envelope.id()) {
            Ok(id) => id,
            Err(e) => {
                defmt::warn!("frame id 0x{:03X} rejected: {}", envelope.id(), e);
                continue;
            }
        };
        let frame = match TelemetryFrame::parse(envelope.payload()) {
            Ok(frame) => frame,
            Err(e) => {
                defmt::warn!("payload from id 0x{:03X} rejected: {}", envelope.id(), e);
                continue;
            }
        };

        // One lock per frame: a Modbus read between two frames is fine, a
        // read in the middle of one frame's fields is not.
        let mut bank = bank.lock().await;
        apply_frame(&mut bank, &id, &frame, &mut aggregates);
        drop(bank);

        applied += 1;
    }

    if !aggregates.is_empty() {
        let mut bank = bank.lock().await;
        write_aggregates(&mut bank, &aggregates);
    }

    defmt::info!(
        "cycle complete: {} of {} frames applied",
        applied,
        frames.len()
    );
}

/// Writes every field of one decoded frame to its register slots.
fn apply_frame(
    bank: &mut RegisterBank,
    id: &FrameId,
    frame: &TelemetryFrame,
    aggregates: &mut PackAggregates,
) {
    let string = id.string_id();
    let pack = id.pack_id();
    let bmu = id.bmu_in_pack();

    // BMUs 1..=5 hold 18 cells each, BMU 6 the remaining 14.
    let (first_cell, cell_count) = if bmu <= 5 {
        ((bmu - 1) * CELLS_PER_BMU, CELLS_PER_BMU as usize)
    } else {
        (5 * CELLS_PER_BMU, 14)
    };

    for (i, &volts) in frame.cells.iter().take(cell_count).enumerate() {
        let cell = first_cell + i as u8 + 1;
        // The identifier was validated, so the address math cannot fail
        // and the slots all sit inside the bank.
        if let Ok(addr) = address::cell_voltage_address(string, pack, cell) {
            let _ = bank.write_float(addr, volts);
            aggregates.record_cell(volts);
        }
    }

    for (i, &volts) in frame.thermistors.iter().enumerate() {
        let sensor = i as u8 + 1;
        let Some(celsius) = voltage_to_celsius(volts) else {
            defmt::warn!(
                "thermistor {} of BMU {} out of curve ({} V), slot kept",
                sensor,
                id.bmu_global_id(),
                volts
            );
            continue;
        };
        if let Ok(addr) = address::temp_sensor_address(string, pack, bmu, sensor) {
            let _ = bank.write_float(addr, celsius);
            aggregates.record_temperature(celsius);
        }
    }

    aggregates.record_current(frame.current);

    defmt::debug!(
        "BMU {} (string {}, pack {}): varef {} V, dgs {:02X} {:02X} {:02X}, pressure {}, current {} A",
        id.bmu_global_id(),
        string,
        pack,
        frame.varef,
        frame.dgs[0],
        frame.dgs[1],
        frame.dgs[2],
        frame.pressure,
        frame.current
    );
}

/// Mirrors the cycle's rollups into the fixed scalar registers.
fn write_aggregates(bank: &mut RegisterBank, aggregates: &PackAggregates) {
    if let Some(v) = aggregates.pack_voltage() {
        let _ = bank.write_float(scalar::TOTAL_VOLTAGE, v);
        let _ = bank.write_float(scalar::PACK_VOLTAGE, v);
    }
    if let Some(v) = aggregates.average_cell_voltage() {
        let _ = bank.write_float(scalar::AVERAGE_VOLTAGE, v);
        let _ = bank.write_float(scalar::AVG_CELL_VOLTAGE, v);
    }
    if let Some(t) = aggregates.max_temperature() {
        let _ = bank.write_float(scalar::MAX_TEMPERATURE, t);
    }
    if let Some(t) = aggregates.average_temperature() {
        let _ = bank.write_float(scalar::AVERAGE_TEMPERATURE, t);
        let _ = bank.write_float(scalar::AVG_TEMP, t);
    }
    if let Some(i) = aggregates.current() {
        let _ = bank.write_float(scalar::CURRENT, i);
    }

    defmt::info!(
        "battery status: total {} V, min {} V, max {} V, avg {} V, max temp {} C",
        aggregates.pack_voltage(),
        aggregates.min_cell_voltage(),
        aggregates.max_cell_voltage(),
        aggregates.average_cell_voltage(),
        aggregates.max_temperature()
    );
}

/// Compares the balancing status coils against the active discharge set
/// and latches an intent when a master changed them.
async fn latch_from_coils(
    bank: &'static Shared<RegisterBank>,
    intent: &'static Shared<BalanceIntent>,
    config: &GatewayConfig,
    active_cells: &Vec<u8, { CELLS_PER_PACK as usize }>,
) {
    let mut desired: Vec<u8, { CELLS_PER_PACK as usize }> = Vec::new();
    {
        let bank = bank.lock().await;
        for cell in 1..=CELLS_PER_PACK {
            if let Ok(addr) =
                address::balancing_status_address(config.balancing_string, config.balancing_pack, cell)
            {
                if bank.coil(addr) == Ok(true) {
                    let _ = desired.push(cell);
                }
            }
        }
    }

    if desired != *active_cells {
        defmt::info!(
            "balancing request latched: {} cells at {} mA",
            desired.len(),
            config.balancing_current_ma
        );
        let mut intent = intent.lock().await;
        intent.request(&desired, config.balancing_current_ma);
    }
}

/// One balancing phase: plan the four frames, send them, keep the status
/// coils telling the truth about what is discharging.
async fn balance(
    can: &'static Shared<CanController<'static>>,
    bank: &'static Shared<RegisterBank>,
    config: &GatewayConfig,
    cells: Vec<u8, { CELLS_PER_PACK as usize }>,
    current_ma: u16,
    active_cells: &mut Vec<u8, { CELLS_PER_PACK as usize }>,
) {
    let frames = match balancing::plan(&cells) {
        Ok(frames) => frames,
        Err(e) => {
            defmt::warn!("balancing request rejected: {}", e);
            return;
        }
    };

    if cells.is_empty() {
        defmt::info!("stopping balancing");
    } else {
        defmt::info!("balancing {} cells at {} mA", cells.len(), current_ma);
    }

    let sent = {
        let mut can = can.lock().await;
        can_management::send_balancing_command(&frames, &mut can).await
    };

    match sent {
        Ok(()) => {
            *active_cells = cells;
            defmt::info!("balancing command delivered");
        }
        Err(e) => {
            // No automatic retry. The status coils fall back to the last
            // delivered command so the requester can see it did not take.
            defmt::warn!("balancing send failed: {}", e);
        }
    }

    let mut bank = bank.lock().await;
    for cell in 1..=CELLS_PER_PACK {
        if let Ok(addr) =
            address::balancing_status_address(config.balancing_string, config.balancing_pack, cell)
        {
            let _ = bank.set_coil(addr, active_cells.contains(&cell));
        }
    }
}
