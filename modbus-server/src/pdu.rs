//! PDU dispatch.
//!
//! `process` takes one request PDU (function code plus data), applies it to
//! the register bank and writes the response PDU. Anything that goes wrong
//! inside a structurally complete request is answered with an exception
//! PDU; the caller never has to drop the connection over a bad quantity or
//! address.

use crate::storage::{
    RegisterBank, COIL_COUNT, DISCRETE_INPUT_COUNT, HOLDING_REGISTER_COUNT, INPUT_REGISTER_COUNT,
};

/// Modbus exception codes this device raises.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Exception {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
}

pub mod function {
    pub const READ_COILS: u8 = 0x01;
    pub const READ_DISCRETE_INPUTS: u8 = 0x02;
    pub const READ_HOLDING_REGISTERS: u8 = 0x03;
    pub const READ_INPUT_REGISTERS: u8 = 0x04;
    pub const WRITE_SINGLE_COIL: u8 = 0x05;
    pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
    pub const WRITE_MULTIPLE_COILS: u8 = 0x0F;
    pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
}

/// Per-function quantity limits from the Modbus application protocol.
pub const MAX_READ_BITS: u16 = 2000;
pub const MAX_READ_REGISTERS: u16 = 125;
pub const MAX_WRITE_BITS: u16 = 1968;
pub const MAX_WRITE_REGISTERS: u16 = 123;

const COIL_ON: u16 = 0xFF00;
const COIL_OFF: u16 = 0x0000;

/// Applies `request` to `bank` and writes the reply into `response`,
/// returning its length. `response` must hold at least 253 bytes. A return
/// of zero means the request was too mangled to answer at all and the
/// connection should be closed.
pub fn process(bank: &mut RegisterBank, request: &[u8], response: &mut [u8]) -> usize {
    let Some((&fc, tail)) = request.split_first() else {
        return 0;
    };

    match dispatch(bank, fc, tail, response) {
        Ok(len) => len,
        Err(exception) => {
            response[0] = fc | 0x80;
            response[1] = exception as u8;
            2
        }
    }
}

fn dispatch(
    bank: &mut RegisterBank,
    fc: u8,
    tail: &[u8],
    response: &mut [u8],
) -> Result<usize, Exception> {
    match fc {
        function::READ_COILS => read_bits(bank, fc, tail, response, |bank, addr| bank.coil(addr)),
        function::READ_DISCRETE_INPUTS => {
            read_bits(bank, fc, tail, response, |bank, addr| bank.discrete_input(addr))
        }
        function::READ_HOLDING_REGISTERS => {
            read_registers(fc, tail, response, |addr, count| bank.holding(addr, count))
        }
        function::READ_INPUT_REGISTERS => {
            read_registers(fc, tail, response, |addr, count| bank.input(addr, count))
        }
        function::WRITE_SINGLE_COIL => write_single_coil(bank, fc, tail, response),
        function::WRITE_SINGLE_REGISTER => write_single_register(bank, fc, tail, response),
        function::WRITE_MULTIPLE_COILS => write_multiple_coils(bank, fc, tail, response),
        function::WRITE_MULTIPLE_REGISTERS => write_multiple_registers(bank, fc, tail, response),
        _ => Err(Exception::IllegalFunction),
    }
}

/// A missing field means the frame length and the function disagree, which
/// is a data value problem, not an address problem.
fn field(tail: &[u8], at: usize) -> Result<u16, Exception> {
    match tail.get(at..at + 2) {
        Some(bytes) => Ok(u16::from_be_bytes([bytes[0], bytes[1]])),
        None => Err(Exception::IllegalDataValue),
    }
}

fn read_bits(
    bank: &RegisterBank,
    fc: u8,
    tail: &[u8],
    response: &mut [u8],
    get: impl Fn(&RegisterBank, u16) -> Result<bool, Exception>,
) -> Result<usize, Exception> {
    let start = field(tail, 0)?;
    let quantity = field(tail, 2)?;

    if quantity < 1 || quantity > MAX_READ_BITS {
        return Err(Exception::IllegalDataValue);
    }

    let byte_count = (quantity as usize + 7) / 8;
    response[0] = fc;
    response[1] = byte_count as u8;
    response[2..2 + byte_count].fill(0);

    for i in 0..quantity {
        // Bit i of the response occupies byte i / 8, position i % 8.
        if get(bank, start.wrapping_add(i))? {
            response[2 + i as usize / 8] |= 1 << (i % 8);
        }
    }

    Ok(2 + byte_count)
}

fn read_registers<'a>(
    fc: u8,
    tail: &[u8],
    response: &mut [u8],
    get: impl FnOnce(u16, u16) -> Result<&'a [u16], Exception>,
) -> Result<usize, Exception> {
    let start = field(tail, 0)?;
    let quantity = field(tail, 2)?;

    if quantity < 1 || quantity > MAX_READ_REGISTERS {
        return Err(Exception::IllegalDataValue);
    }

    let words = get(start, quantity)?;
    response[0] = fc;
    response[1] = (quantity * 2) as u8;
    for (i, word) in words.iter().enumerate() {
        response[2 + i * 2..4 + i * 2].copy_from_slice(&word.to_be_bytes());
    }

    Ok(2 + quantity as usize * 2)
}

fn write_single_coil(
    bank: &mut RegisterBank,
    fc: u8,
    tail: &[u8],
    response: &mut [u8],
) -> Result<usize, Exception> {
    let addr = field(tail, 0)?;
    let value = field(tail, 2)?;

    if value != COIL_ON && value != COIL_OFF {
        return Err(Exception::IllegalDataValue);
    }
    bank.set_coil(addr, value == COIL_ON)?;

    echo(fc, addr, value, response)
}

fn write_single_register(
    bank: &mut RegisterBank,
    fc: u8,
    tail: &[u8],
    response: &mut [u8],
) -> Result<usize, Exception> {
    let addr = field(tail, 0)?;
    let value = field(tail, 2)?;

    bank.write_holding(addr, value)?;

    echo(fc, addr, value, response)
}

fn write_multiple_coils(
    bank: &mut RegisterBank,
    fc: u8,
    tail: &[u8],
    response: &mut [u8],
) -> Result<usize, Exception> {
    let start = field(tail, 0)?;
    let quantity = field(tail, 2)?;

    if quantity < 1 || quantity > MAX_WRITE_BITS {
        return Err(Exception::IllegalDataValue);
    }
    let byte_count = (quantity as usize + 7) / 8;
    if tail.get(4).copied() != Some(byte_count as u8) || tail.len() < 5 + byte_count {
        return Err(Exception::IllegalDataValue);
    }
    if start as usize + quantity as usize > COIL_COUNT {
        return Err(Exception::IllegalDataAddress);
    }

    let bits = &tail[5..5 + byte_count];
    for i in 0..quantity {
        let on = bits[i as usize / 8] & (1 << (i % 8)) != 0;
        bank.set_coil(start + i, on)?;
    }

    echo(fc, start, quantity, response)
}

fn write_multiple_registers(
    bank: &mut RegisterBank,
    fc: u8,
    tail: &[u8],
    response: &mut [u8],
) -> Result<usize, Exception> {
    let start = field(tail, 0)?;
    let quantity = field(tail, 2)?;

    if quantity < 1 || quantity > MAX_WRITE_REGISTERS {
        return Err(Exception::IllegalDataValue);
    }
    let byte_count = quantity as usize * 2;
    if tail.get(4).copied() != Some(byte_count as u8) || tail.len() < 5 + byte_count {
        return Err(Exception::IllegalDataValue);
    }
    if start as usize + quantity as usize > HOLDING_REGISTER_COUNT {
        return Err(Exception::IllegalDataAddress);
    }

    for i in 0..quantity {
        let value = field(tail, 5 + i as usize * 2)?;
        bank.write_holding(start + i, value)?;
    }

    echo(fc, start, quantity, response)
}

fn echo(fc: u8, first: u16, second: u16, response: &mut [u8]) -> Result<usize, Exception> {
    response[0] = fc;
    response[1..3].copy_from_slice(&first.to_be_bytes());
    response[3..5].copy_from_slice(&second.to_be_bytes());
    Ok(5)
}

// Compile-time reminder that quantity limits cannot outrun the tables.
const _: () = {
    assert!(MAX_READ_BITS as usize <= COIL_COUNT);
    assert!(MAX_READ_BITS as usize <= DISCRETE_INPUT_COUNT);
    assert!(MAX_READ_REGISTERS as usize <= HOLDING_REGISTER_COUNT);
    assert!(MAX_READ_REGISTERS as usize <= INPUT_REGISTER_COUNT);
};

#[cfg(test)]
mod test {
    use super::*;

    fn run(bank: &mut RegisterBank, request: &[u8]) -> Vec<u8> {
        let mut buf = [0u8; 253];
        let len = process(bank, request, &mut buf);
        buf[..len].to_vec()
    }

    #[test]
    fn read_holding_registers() {
        let mut bank = RegisterBank::new();
        bank.write_holding(1000, 0x42AF).unwrap();
        bank.write_holding(1001, 0x0000).unwrap();

        let resp = run(&mut bank, &[0x03, 0x03, 0xE8, 0x00, 0x02]);
        assert_eq!(resp, [0x03, 0x04, 0x42, 0xAF, 0x00, 0x00]);
    }

    #[test]
    fn read_quantity_limits() {
        let mut bank = RegisterBank::new();
        // Zero registers.
        let resp = run(&mut bank, &[0x03, 0x03, 0xE8, 0x00, 0x00]);
        assert_eq!(resp, [0x83, 0x03]);
        // One past the 125 register ceiling.
        let resp = run(&mut bank, &[0x03, 0x03, 0xE8, 0x00, 0x7E]);
        assert_eq!(resp, [0x83, 0x03]);
        // 125 on the nose is fine.
        let resp = run(&mut bank, &[0x03, 0x03, 0xE8, 0x00, 0x7D]);
        assert_eq!(resp.len(), 2 + 250);
    }

    #[test]
    fn read_past_the_store_is_an_address_error() {
        let mut bank = RegisterBank::new();
        // 49_999 + 2 crosses the end of the holding table.
        let resp = run(&mut bank, &[0x03, 0xC3, 0x4F, 0x00, 0x02]);
        assert_eq!(resp, [0x83, 0x02]);

        // Same rule for coils.
        let resp = run(&mut bank, &[0x01, 0xC3, 0x4F, 0x00, 0x02]);
        assert_eq!(resp, [0x81, 0x02]);
    }

    #[test]
    fn unpopulated_registers_read_as_zero() {
        let mut bank = RegisterBank::new();
        let resp = run(&mut bank, &[0x04, 0x9C, 0x3E, 0x00, 0x02]);
        assert_eq!(resp, [0x04, 0x04, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn read_coils_packs_bits() {
        let mut bank = RegisterBank::new();
        bank.set_coil(0, true).unwrap();
        bank.set_coil(2, true).unwrap();
        bank.set_coil(8, true).unwrap();

        let resp = run(&mut bank, &[0x01, 0x00, 0x00, 0x00, 0x0A]);
        // Ten coils pack into two bytes, bit i in byte i / 8 at i % 8.
        assert_eq!(resp, [0x01, 0x02, 0b0000_0101, 0b0000_0001]);
    }

    #[test]
    fn write_single_coil() {
        let mut bank = RegisterBank::new();
        let resp = run(&mut bank, &[0x05, 0x00, 0x07, 0xFF, 0x00]);
        assert_eq!(resp, [0x05, 0x00, 0x07, 0xFF, 0x00]);
        assert_eq!(bank.coil(7), Ok(true));

        let resp = run(&mut bank, &[0x05, 0x00, 0x07, 0x00, 0x00]);
        assert_eq!(resp, [0x05, 0x00, 0x07, 0x00, 0x00]);
        assert_eq!(bank.coil(7), Ok(false));
    }

    #[test]
    fn write_single_coil_rejects_other_values() {
        let mut bank = RegisterBank::new();
        let resp = run(&mut bank, &[0x05, 0x00, 0x07, 0x12, 0x34]);
        assert_eq!(resp, [0x85, 0x03]);
        assert_eq!(bank.coil(7), Ok(false));
    }

    #[test]
    fn write_single_register_echoes() {
        let mut bank = RegisterBank::new();
        let resp = run(&mut bank, &[0x06, 0x03, 0xE8, 0xAB, 0xCD]);
        assert_eq!(resp, [0x06, 0x03, 0xE8, 0xAB, 0xCD]);
        assert_eq!(bank.holding(1000, 1).unwrap(), &[0xABCD]);
    }

    #[test]
    fn write_multiple_registers() {
        let mut bank = RegisterBank::new();
        // SOC = 87.5 written as the register pair 0x42AF 0x0000.
        let resp = run(
            &mut bank,
            &[0x10, 0x03, 0xE8, 0x00, 0x02, 0x04, 0x42, 0xAF, 0x00, 0x00],
        );
        assert_eq!(resp, [0x10, 0x03, 0xE8, 0x00, 0x02]);
        assert_eq!(bank.read_float(1000), Ok(87.5));

        // Reading the pair back returns the same words.
        let resp = run(&mut bank, &[0x03, 0x03, 0xE8, 0x00, 0x02]);
        assert_eq!(resp, [0x03, 0x04, 0x42, 0xAF, 0x00, 0x00]);
    }

    #[test]
    fn write_multiple_registers_checks_byte_count() {
        let mut bank = RegisterBank::new();
        // byte_count says 2 but quantity says 2 registers.
        let resp = run(
            &mut bank,
            &[0x10, 0x03, 0xE8, 0x00, 0x02, 0x02, 0x42, 0xAF, 0x00, 0x00],
        );
        assert_eq!(resp, [0x90, 0x03]);
        // Truncated data.
        let resp = run(&mut bank, &[0x10, 0x03, 0xE8, 0x00, 0x02, 0x04, 0x42]);
        assert_eq!(resp, [0x90, 0x03]);
    }

    #[test]
    fn write_multiple_coils() {
        let mut bank = RegisterBank::new();
        let resp = run(&mut bank, &[0x0F, 0x00, 0x10, 0x00, 0x0A, 0x02, 0xCD, 0x01]);
        assert_eq!(resp, [0x0F, 0x00, 0x10, 0x00, 0x0A]);
        // 0xCD = 0b1100_1101 for coils 16..24, 0x01 for coils 24..26.
        for (offset, expected) in [
            (0, true),
            (1, false),
            (2, true),
            (3, true),
            (4, false),
            (5, false),
            (6, true),
            (7, true),
            (8, true),
            (9, false),
        ] {
            assert_eq!(bank.coil(16 + offset), Ok(expected));
        }
    }

    #[test]
    fn unsupported_function() {
        let mut bank = RegisterBank::new();
        let resp = run(&mut bank, &[0x2B, 0x0E, 0x01, 0x00]);
        assert_eq!(resp, [0xAB, 0x01]);
    }

    #[test]
    fn truncated_request_is_a_value_error() {
        let mut bank = RegisterBank::new();
        let resp = run(&mut bank, &[0x03, 0x03]);
        assert_eq!(resp, [0x83, 0x03]);
    }

    #[test]
    fn empty_request_gets_no_answer() {
        let mut bank = RegisterBank::new();
        let mut buf = [0u8; 253];
        assert_eq!(process(&mut bank, &[], &mut buf), 0);
    }
}
