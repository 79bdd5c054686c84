//! Register address calculator for the cell/sensor space.
//!
//! The battery is addressed along five dimensions: string (1..=12), pack
//! within the string (1..=4), cell within the pack (1..=104), BMU within
//! the pack (1..=6) and sensor within the BMU. The Modbus map flattens
//! these into three linear blocks: cell voltage register pairs, temperature
//! register pairs and balancing status coils. Every float occupies two
//! consecutive registers, high word first.

pub const STRING_COUNT: u8 = 12;
pub const PACKS_PER_STRING: u8 = 4;
pub const CELLS_PER_PACK: u8 = 104;
pub const BMUS_PER_PACK: u8 = 6;
pub const CELLS_PER_BMU: u8 = 18;

/// Thermistors a BMU actually reports.
pub const SENSORS_PER_BMU: u8 = 7;
/// Address slots reserved per BMU. One more than the wire delivers; the
/// eighth slot is allocated but never written.
pub const SENSOR_SLOTS_PER_BMU: u8 = 8;

pub const CELL_VOLTAGE_BASE: u16 = 1016;
pub const TEMP_SENSOR_BASE: u16 = 7000;
pub const BALANCING_STATUS_BASE: u16 = 40000;

/// Fixed addresses of the aggregate scalars. Each spans two registers.
pub mod scalar {
    pub const SOC: u16 = 1000;
    pub const SOH: u16 = 1002;
    pub const TOTAL_VOLTAGE: u16 = 1004;
    pub const MAX_TEMPERATURE: u16 = 1006;
    pub const CURRENT: u16 = 1008;
    pub const AVERAGE_VOLTAGE: u16 = 1012;
    pub const AVERAGE_TEMPERATURE: u16 = 1014;

    // The coil-bank floats. These live in the holding register array like
    // everything else, the name is historical.
    pub const AVG_TEMP: u16 = 30003;
    pub const AVG_CELL_VOLTAGE: u16 = 30005;
    pub const PACK_VOLTAGE: u16 = 30007;
}

/// Rejected dimension or address, carrying the offending value.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AddressError {
    InvalidString(u8),
    InvalidPack(u8),
    InvalidCell(u8),
    InvalidBmu(u8),
    InvalidSensor(u8),
    /// Address below the block base, cannot belong to the block.
    InvalidAddress(u16),
}

fn check_string(string: u8) -> Result<(), AddressError> {
    if string < 1 || string > STRING_COUNT {
        return Err(AddressError::InvalidString(string));
    }
    Ok(())
}

fn check_pack(pack: u8) -> Result<(), AddressError> {
    if pack < 1 || pack > PACKS_PER_STRING {
        return Err(AddressError::InvalidPack(pack));
    }
    Ok(())
}

fn check_cell(cell: u8) -> Result<(), AddressError> {
    if cell < 1 || cell > CELLS_PER_PACK {
        return Err(AddressError::InvalidCell(cell));
    }
    Ok(())
}

/// First register of the voltage pair for one cell.
pub fn cell_voltage_address(string: u8, pack: u8, cell: u8) -> Result<u16, AddressError> {
    check_string(string)?;
    check_pack(pack)?;
    check_cell(cell)?;

    let cells = CELLS_PER_PACK as u16;
    let offset = (string as u16 - 1) * PACKS_PER_STRING as u16 * cells
        + (pack as u16 - 1) * cells
        + (cell as u16 - 1);
    Ok(CELL_VOLTAGE_BASE + 2 * offset)
}

/// First register of the temperature pair for one sensor slot.
pub fn temp_sensor_address(string: u8, pack: u8, bmu: u8, sensor: u8) -> Result<u16, AddressError> {
    check_string(string)?;
    check_pack(pack)?;
    if bmu < 1 || bmu > BMUS_PER_PACK {
        return Err(AddressError::InvalidBmu(bmu));
    }
    if sensor < 1 || sensor > SENSOR_SLOTS_PER_BMU {
        return Err(AddressError::InvalidSensor(sensor));
    }

    let slots = SENSOR_SLOTS_PER_BMU as u16;
    let per_pack = BMUS_PER_PACK as u16 * slots;
    let offset = (string as u16 - 1) * PACKS_PER_STRING as u16 * per_pack
        + (pack as u16 - 1) * per_pack
        + (bmu as u16 - 1) * slots
        + (sensor as u16 - 1);
    Ok(TEMP_SENSOR_BASE + 2 * offset)
}

/// Coil holding the balancing state of one cell. Single bit, no pairing.
pub fn balancing_status_address(string: u8, pack: u8, cell: u8) -> Result<u16, AddressError> {
    check_string(string)?;
    check_pack(pack)?;
    check_cell(cell)?;

    let cells = CELLS_PER_PACK as u16;
    let offset = (string as u16 - 1) * PACKS_PER_STRING as u16 * cells
        + (pack as u16 - 1) * cells
        + (cell as u16 - 1);
    Ok(BALANCING_STATUS_BASE + offset)
}

/// Recovers `(string, pack, cell)` from a cell voltage address.
pub fn parse_cell_address(address: u16) -> Result<(u8, u8, u8), AddressError> {
    if address < CELL_VOLTAGE_BASE {
        return Err(AddressError::InvalidAddress(address));
    }
    let offset = (address - CELL_VOLTAGE_BASE) / 2;
    let per_string = PACKS_PER_STRING as u16 * CELLS_PER_PACK as u16;

    let string = offset / per_string + 1;
    let remaining = offset % per_string;
    let pack = remaining / CELLS_PER_PACK as u16 + 1;
    let cell = remaining % CELLS_PER_PACK as u16 + 1;
    Ok((string as u8, pack as u8, cell as u8))
}

/// Recovers `(string, pack, bmu, sensor)` from a temperature address.
pub fn parse_temp_address(address: u16) -> Result<(u8, u8, u8, u8), AddressError> {
    if address < TEMP_SENSOR_BASE {
        return Err(AddressError::InvalidAddress(address));
    }
    let offset = (address - TEMP_SENSOR_BASE) / 2;
    let slots = SENSOR_SLOTS_PER_BMU as u16;
    let per_pack = BMUS_PER_PACK as u16 * slots;
    let per_string = PACKS_PER_STRING as u16 * per_pack;

    let string = offset / per_string + 1;
    let mut remaining = offset % per_string;
    let pack = remaining / per_pack + 1;
    remaining %= per_pack;
    let bmu = remaining / slots + 1;
    let sensor = remaining % slots + 1;
    Ok((string as u8, pack as u8, bmu as u8, sensor as u8))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cell_addresses() {
        assert_eq!(cell_voltage_address(1, 1, 1), Ok(1016));
        assert_eq!(cell_voltage_address(1, 1, 2), Ok(1018));
        // One full string ahead: 2 * 4 * 104 registers.
        assert_eq!(cell_voltage_address(2, 1, 1), Ok(1016 + 2 * 4 * 104));
        assert_eq!(cell_voltage_address(2, 1, 1), Ok(1848));
        assert_eq!(cell_voltage_address(12, 4, 104), Ok(1016 + 2 * 4991));
    }

    #[test]
    fn temp_addresses() {
        assert_eq!(temp_sensor_address(1, 1, 1, 1), Ok(7000));
        assert_eq!(temp_sensor_address(1, 1, 1, 2), Ok(7002));
        assert_eq!(temp_sensor_address(1, 1, 2, 1), Ok(7016));
        assert_eq!(temp_sensor_address(12, 4, 6, 8), Ok(7000 + 2 * 2303));
    }

    #[test]
    fn balancing_addresses() {
        assert_eq!(balancing_status_address(1, 1, 1), Ok(40000));
        assert_eq!(balancing_status_address(1, 1, 104), Ok(40103));
        assert_eq!(balancing_status_address(12, 4, 104), Ok(40000 + 4991));
    }

    #[test]
    fn rejects_out_of_domain_inputs() {
        assert_eq!(cell_voltage_address(0, 1, 1), Err(AddressError::InvalidString(0)));
        assert_eq!(cell_voltage_address(13, 1, 1), Err(AddressError::InvalidString(13)));
        assert_eq!(cell_voltage_address(1, 5, 1), Err(AddressError::InvalidPack(5)));
        assert_eq!(cell_voltage_address(1, 1, 105), Err(AddressError::InvalidCell(105)));
        assert_eq!(temp_sensor_address(1, 1, 7, 1), Err(AddressError::InvalidBmu(7)));
        assert_eq!(temp_sensor_address(1, 1, 1, 9), Err(AddressError::InvalidSensor(9)));
        assert_eq!(balancing_status_address(1, 1, 0), Err(AddressError::InvalidCell(0)));
    }

    #[test]
    fn rejects_addresses_below_base() {
        assert_eq!(parse_cell_address(1015), Err(AddressError::InvalidAddress(1015)));
        assert_eq!(parse_temp_address(6999), Err(AddressError::InvalidAddress(6999)));
    }

    #[test]
    fn cell_address_round_trip() {
        for string in 1..=STRING_COUNT {
            for pack in 1..=PACKS_PER_STRING {
                for cell in 1..=CELLS_PER_PACK {
                    let addr = cell_voltage_address(string, pack, cell).unwrap();
                    assert_eq!(parse_cell_address(addr), Ok((string, pack, cell)));
                }
            }
        }
    }

    #[test]
    fn temp_address_round_trip() {
        for string in 1..=STRING_COUNT {
            for pack in 1..=PACKS_PER_STRING {
                for bmu in 1..=BMUS_PER_PACK {
                    for sensor in 1..=SENSOR_SLOTS_PER_BMU {
                        let addr = temp_sensor_address(string, pack, bmu, sensor).unwrap();
                        assert_eq!(parse_temp_address(addr), Ok((string, pack, bmu, sensor)));
                    }
                }
            }
        }
    }

    #[test]
    fn addresses_are_distinct() {
        // Neighbouring tuples land two registers apart, so it is enough to
        // check the ends meet without overlap inside each block.
        let last_of_first_string = cell_voltage_address(1, 4, 104).unwrap();
        let first_of_second_string = cell_voltage_address(2, 1, 1).unwrap();
        assert_eq!(last_of_first_string + 2, first_of_second_string);

        let last_slot = temp_sensor_address(1, 1, 1, 8).unwrap();
        let next_bmu = temp_sensor_address(1, 1, 2, 1).unwrap();
        assert_eq!(last_slot + 2, next_bmu);
    }
}
