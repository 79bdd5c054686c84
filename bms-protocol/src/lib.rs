#![cfg_attr(not(test), no_std)]

//! Protocol core for the battery-telemetry gateway.
//!
//! This crate holds everything that can be reasoned about without hardware:
//! the CAN identifier and 64-byte telemetry frame codec, the register
//! address calculator for the cell/sensor space, the balancing command
//! planner and the per-cycle pack aggregates. The firmware crate wires these
//! to the FDCAN peripheral and the Modbus register bank.

pub mod address;
pub mod aggregate;
pub mod balancing;
pub mod codec;

pub use address::AddressError;
pub use codec::DecodeError;
