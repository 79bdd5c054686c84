//! Per-cycle rollups of the polled telemetry.
//!
//! The `PackAggregates` struct accumulates every cell voltage, temperature
//! and current reading decoded during one polling phase and produces the
//! scalar values mirrored at the fixed register addresses: pack voltage,
//! average cell voltage, minimum and maximum cell voltage, average and
//! maximum temperature and the last observed pack current.

/// Accumulator for one polling phase. Feed it readings as frames decode,
/// read the rollups once the phase is done.
#[derive(Debug, Default, Copy, Clone)]
pub struct PackAggregates {
    cell_count: u32,
    cell_sum: f32,
    cell_min: f32,
    cell_max: f32,
    temp_count: u32,
    temp_sum: f32,
    temp_max: f32,
    current: Option<f32>,
}

impl PackAggregates {
    pub const fn new() -> Self {
        PackAggregates {
            cell_count: 0,
            cell_sum: 0.0,
            cell_min: 0.0,
            cell_max: 0.0,
            temp_count: 0,
            temp_sum: 0.0,
            temp_max: 0.0,
            current: None,
        }
    }

    pub fn record_cell(&mut self, volts: f32) {
        if self.cell_count == 0 {
            self.cell_min = volts;
            self.cell_max = volts;
        } else {
            self.cell_min = if volts < self.cell_min { volts } else { self.cell_min };
            self.cell_max = if volts > self.cell_max { volts } else { self.cell_max };
        }
        self.cell_sum += volts;
        self.cell_count += 1;
    }

    pub fn record_temperature(&mut self, celsius: f32) {
        if self.temp_count == 0 || celsius > self.temp_max {
            self.temp_max = celsius;
        }
        self.temp_sum += celsius;
        self.temp_count += 1;
    }

    /// Last current reading wins; every BMU of a pack reports the same
    /// shunt.
    pub fn record_current(&mut self, amperes: f32) {
        self.current = Some(amperes);
    }

    pub fn is_empty(&self) -> bool {
        self.cell_count == 0 && self.temp_count == 0 && self.current.is_none()
    }

    /// Sum of every polled cell voltage.
    pub fn pack_voltage(&self) -> Option<f32> {
        (self.cell_count > 0).then_some(self.cell_sum)
    }

    pub fn average_cell_voltage(&self) -> Option<f32> {
        (self.cell_count > 0).then_some(self.cell_sum / self.cell_count as f32)
    }

    pub fn min_cell_voltage(&self) -> Option<f32> {
        (self.cell_count > 0).then_some(self.cell_min)
    }

    pub fn max_cell_voltage(&self) -> Option<f32> {
        (self.cell_count > 0).then_some(self.cell_max)
    }

    pub fn average_temperature(&self) -> Option<f32> {
        (self.temp_count > 0).then_some(self.temp_sum / self.temp_count as f32)
    }

    pub fn max_temperature(&self) -> Option<f32> {
        (self.temp_count > 0).then_some(self.temp_max)
    }

    pub fn current(&self) -> Option<f32> {
        self.current
    }
}
