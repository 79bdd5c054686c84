//! Balancing command planner.
//!
//! A discharge command for one 104-cell pack goes out as four 8-byte CAN
//! frames. Identifier 0x97 carries cells 1..=54 (BMUs 1..3 of the low
//! half), identifier 0x98 carries cells 55..=104 renumbered from 1 (BMUs
//! 1..3 of the high half). The first frame of each pair holds the masks for
//! BMU 1 and BMU 2 behind their opcodes, the second frame holds BMU 3.
//! An empty cell set produces the bare skeletons, which the BMUs take as
//! "stop discharging".

use crate::address::{CELLS_PER_BMU, CELLS_PER_PACK};

/// Identifier of the command pair covering cells 1..=54.
pub const BALANCE_LOW_ID: u16 = 0x97;
/// Identifier of the command pair covering cells 55..=104.
pub const BALANCE_HIGH_ID: u16 = 0x98;

/// Cells addressed by one identifier before the split moves to the next.
const CELLS_PER_HALF: u8 = 54;

/// First frame of a pair: BMU 1 opcode, three mask bytes, BMU 2 opcode,
/// three mask bytes.
const SKELETON_FIRST: [u8; 8] = [0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00];
/// Second frame of a pair: BMU 3 opcode and its three mask bytes.
const SKELETON_SECOND: [u8; 8] = [0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

/// A planned command frame, ready to put on the bus.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BalanceFrame {
    pub id: u16,
    pub data: [u8; 8],
}

/// Cell index outside 1..=104.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InvalidCell(pub u8);

/// Builds the four command frames for a set of pack cells, in the send
/// order 0x97 first, 0x97 second, 0x98 first, 0x98 second.
pub fn plan(cells: &[u8]) -> Result<[BalanceFrame; 4], InvalidCell> {
    let mut low_first = SKELETON_FIRST;
    let mut low_second = SKELETON_SECOND;
    let mut high_first = SKELETON_FIRST;
    let mut high_second = SKELETON_SECOND;

    for &cell in cells {
        if cell < 1 || cell > CELLS_PER_PACK {
            return Err(InvalidCell(cell));
        }

        let (frames, half_cell) = if cell <= CELLS_PER_HALF {
            ((&mut low_first, &mut low_second), cell)
        } else {
            ((&mut high_first, &mut high_second), cell - CELLS_PER_HALF)
        };

        let bmu_index = (half_cell - 1) / CELLS_PER_BMU;
        let cell_in_bmu = (half_cell - 1) % CELLS_PER_BMU + 1;
        let byte_index = ((cell_in_bmu - 1) / 8) as usize;
        let bit = (cell_in_bmu - 1) % 8;

        match bmu_index {
            0 => frames.0[1 + byte_index] |= 1 << bit,
            1 => frames.0[5 + byte_index] |= 1 << bit,
            _ => frames.1[1 + byte_index] |= 1 << bit,
        }
    }

    Ok([
        BalanceFrame { id: BALANCE_LOW_ID, data: low_first },
        BalanceFrame { id: BALANCE_LOW_ID, data: low_second },
        BalanceFrame { id: BALANCE_HIGH_ID, data: high_first },
        BalanceFrame { id: BALANCE_HIGH_ID, data: high_second },
    ])
}

/// The four frames a stop command consists of.
pub fn stop() -> [BalanceFrame; 4] {
    [
        BalanceFrame { id: BALANCE_LOW_ID, data: SKELETON_FIRST },
        BalanceFrame { id: BALANCE_LOW_ID, data: SKELETON_SECOND },
        BalanceFrame { id: BALANCE_HIGH_ID, data: SKELETON_FIRST },
        BalanceFrame { id: BALANCE_HIGH_ID, data: SKELETON_SECOND },
    ]
}
