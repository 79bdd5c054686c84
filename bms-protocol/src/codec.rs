//! Codec for the BMU telemetry protocol.
//!
//! A BMU answers the wake-up query with one 64-byte CAN-FD frame. The frame
//! packs seven thermistor codes, the reference voltage code, eighteen cell
//! voltage codes, three digital status bytes and two little-endian binary32
//! values (pressure and pack current). The 11-bit identifier of the frame
//! encodes where in the battery the sender sits.

use libm::logf;

/// Payload length of a telemetry response frame.
pub const TELEMETRY_FRAME_LEN: usize = 64;

/// Thermistors reported by one BMU, in wire order T1..T4, TPCB, T6, T7.
pub const THERMISTORS_PER_BMU: usize = 7;

/// Cell voltage slots in one frame. BMU 6 only populates the first 14.
pub const CELLS_PER_FRAME: usize = 18;

/// Linear scaling of a raw 16-bit measurement code to volts.
pub const CODE_SCALE: f32 = 0.000_15;
pub const CODE_OFFSET: f32 = 1.502_4;

/// Plausibility window for a decoded voltage. The linear formula cannot
/// produce values outside this window from any 16-bit code, so a violation
/// means the conversion itself is broken.
pub const VOLTAGE_MIN: f32 = -8.5;
pub const VOLTAGE_MAX: f32 = 11.4;

/// Decode failure. The affected frame is dropped and the register slots it
/// would have written keep their previous value.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DecodeError {
    /// Identifier does not carry the response flag.
    NotAResponse,
    /// String field outside 1..=12.
    InvalidStringId(u8),
    /// Global BMU field outside 1..=24.
    InvalidBmuId(u8),
    /// Payload is not 64 bytes long.
    UnexpectedLength(usize),
    /// A decoded voltage fell outside the plausibility window.
    VoltageOutOfRange,
}

/// Decomposed 11-bit response identifier.
///
/// Layout: bit 10 response flag, bits 9..6 string, bits 5..1 global BMU
/// number, bit 0 pack parity.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FrameId {
    raw: u16,
}

impl FrameId {
    pub const RESPONSE_FLAG: u16 = 1 << 10;

    /// Validates and decomposes a raw identifier.
    pub fn parse(raw: u16) -> Result<Self, DecodeError> {
        let id = FrameId { raw: raw & 0x7FF };

        if !id.is_response() {
            return Err(DecodeError::NotAResponse);
        }
        if id.string_id() < 1 || id.string_id() > 12 {
            return Err(DecodeError::InvalidStringId(id.string_id()));
        }
        if id.bmu_global_id() < 1 || id.bmu_global_id() > 24 {
            return Err(DecodeError::InvalidBmuId(id.bmu_global_id()));
        }

        Ok(id)
    }

    pub fn raw(&self) -> u16 {
        self.raw
    }

    pub fn is_response(&self) -> bool {
        self.raw & Self::RESPONSE_FLAG != 0
    }

    pub fn string_id(&self) -> u8 {
        ((self.raw >> 6) & 0xF) as u8
    }

    pub fn bmu_global_id(&self) -> u8 {
        ((self.raw >> 1) & 0x1F) as u8
    }

    pub fn pack_bit(&self) -> u8 {
        (self.raw & 0x1) as u8
    }

    /// Pack within the string, 1..=4, derived from the global BMU number.
    pub fn pack_id(&self) -> u8 {
        (self.bmu_global_id() - 1) / 6 + 1
    }

    /// BMU within its pack, 1..=6.
    pub fn bmu_in_pack(&self) -> u8 {
        (self.bmu_global_id() - 1) % 6 + 1
    }
}

/// One decoded telemetry frame, all measurement codes already scaled to
/// volts. Pressure and current come off the wire as binary32 directly.
#[derive(Debug, PartialEq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TelemetryFrame {
    pub thermistors: [f32; THERMISTORS_PER_BMU],
    pub varef: f32,
    pub cells: [f32; CELLS_PER_FRAME],
    pub dgs: [u8; 3],
    pub pressure: f32,
    pub current: f32,
}

impl TelemetryFrame {
    /// Decodes a 64-byte payload.
    ///
    /// Byte offsets: 0..13 thermistor codes, 14..15 VAREF, 16..51 cell
    /// codes, 52..54 DGS1..DGS3, 55 reserved, 56..59 pressure, 60..63
    /// current. All 16-bit codes are little-endian on the wire.
    pub fn parse(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() != TELEMETRY_FRAME_LEN {
            return Err(DecodeError::UnexpectedLength(data.len()));
        }

        let mut thermistors = [0.0; THERMISTORS_PER_BMU];
        for (i, v) in thermistors.iter_mut().enumerate() {
            *v = checked_voltage(code_at(data, i * 2))?;
        }

        let varef = checked_voltage(code_at(data, 14))?;

        let mut cells = [0.0; CELLS_PER_FRAME];
        for (i, v) in cells.iter_mut().enumerate() {
            *v = checked_voltage(code_at(data, 16 + i * 2))?;
        }

        Ok(TelemetryFrame {
            thermistors,
            varef,
            cells,
            dgs: [data[52], data[53], data[54]],
            pressure: f32::from_le_bytes([data[56], data[57], data[58], data[59]]),
            current: f32::from_le_bytes([data[60], data[61], data[62], data[63]]),
        })
    }

    /// Builds the wire image of this frame, quantising voltages back to
    /// codes. Exists for tests and host tooling that fakes BMU traffic;
    /// the gateway itself never transmits telemetry.
    pub fn encode(&self) -> [u8; TELEMETRY_FRAME_LEN] {
        let mut data = [0u8; TELEMETRY_FRAME_LEN];
        for (i, &v) in self.thermistors.iter().enumerate() {
            data[i * 2..i * 2 + 2].copy_from_slice(&voltage_to_code(v).to_le_bytes());
        }
        data[14..16].copy_from_slice(&voltage_to_code(self.varef).to_le_bytes());
        for (i, &v) in self.cells.iter().enumerate() {
            data[16 + i * 2..18 + i * 2].copy_from_slice(&voltage_to_code(v).to_le_bytes());
        }
        data[52] = self.dgs[0];
        data[53] = self.dgs[1];
        data[54] = self.dgs[2];
        data[56..60].copy_from_slice(&self.pressure.to_le_bytes());
        data[60..64].copy_from_slice(&self.current.to_le_bytes());
        data
    }
}

fn code_at(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn checked_voltage(code: u16) -> Result<f32, DecodeError> {
    let volts = code_to_voltage(code);
    if !(VOLTAGE_MIN..=VOLTAGE_MAX).contains(&volts) {
        return Err(DecodeError::VoltageOutOfRange);
    }
    Ok(volts)
}

/// Scales a raw measurement code to volts.
///
/// Codes at or above 0x8000 wrap by subtracting 65534. The BMU firmware
/// wraps with `code - 65535 + 1`, one off from two's complement, and that
/// rule is reproduced literally here.
pub fn code_to_voltage(code: u16) -> f32 {
    let signed = if code >= 0x8000 {
        code as i32 - 65534
    } else {
        code as i32
    };
    signed as f32 * CODE_SCALE + CODE_OFFSET
}

/// Inverse of [`code_to_voltage`], mainly for tests and host tooling.
pub fn voltage_to_code(volts: f32) -> u16 {
    let signed = libm::roundf((volts - CODE_OFFSET) / CODE_SCALE) as i32;
    let wrapped = if signed < 0 { signed + 65534 } else { signed };
    wrapped.clamp(0, u16::MAX as i32) as u16
}

/// Converts a thermistor voltage to degrees Celsius over the NTC divider
/// curve (10 kΩ nominal, B = 4100, 3 V supply).
///
/// Returns `None` when the curve is undefined for the input, which the
/// caller treats as "leave the slot alone".
pub fn voltage_to_celsius(volts: f32) -> Option<f32> {
    if volts >= 3.0 {
        return None;
    }
    let ntc = volts * 10_000.0 / (3.0 - volts);
    if ntc <= 0.0 {
        return None;
    }
    let inv_kelvin = 1.0 / 298.15 - logf(10_000.0 / ntc) / 4100.0;
    Some(1.0 / inv_kelvin - 273.15)
}

/// Splits a binary32 into the two big-endian registers it occupies on the
/// Modbus side. The first register holds the high-order bytes.
pub fn float_to_registers(value: f32) -> (u16, u16) {
    let bytes = value.to_be_bytes();
    (
        u16::from_be_bytes([bytes[0], bytes[1]]),
        u16::from_be_bytes([bytes[2], bytes[3]]),
    )
}

/// Reassembles a binary32 from its register pair. Bit-exact inverse of
/// [`float_to_registers`], NaN payloads included.
pub fn registers_to_float(high: u16, low: u16) -> f32 {
    let h = high.to_be_bytes();
    let l = low.to_be_bytes();
    f32::from_be_bytes([h[0], h[1], l[0], l[1]])
}
