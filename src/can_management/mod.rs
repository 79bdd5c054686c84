pub mod can_controller;
pub mod frame;

use embassy_time::Timer;

pub use can_controller::CanController;
pub use can_controller::CanError;
pub use can_controller::MAX_COLLECTED_FRAMES;
pub use frame::CommandFrame;
pub use frame::TelemetryEnvelope;

use bms_protocol::balancing::BalanceFrame;

use crate::types::CanMsg;

/// Sends the wake-up query that starts one telemetry cycle.
pub async fn send_query(can: &mut CanController<'_>, payload: &[u8; 8]) -> Result<(), CanError> {
    let frame = CommandFrame::new(CanMsg::QueryId.as_raw(), payload);
    match can.write(&frame).await {
        Ok(_) => {
            defmt::info!(
                "query sent: id=0x{:03X} data={:02X}",
                frame.id(),
                frame.bytes()
            );
            Ok(())
        }

        Err(CanError::Timeout) => {
            defmt::warn!("query send timed out");
            Err(CanError::Timeout)
        }

        Err(_) => Err(CanError::WriteError),
    }
}

/// Puts the four balancing command frames on the bus in their fixed order,
/// spaced so slow BMU firmware keeps up.
pub async fn send_balancing_command(
    frames: &[BalanceFrame; 4],
    can: &mut CanController<'_>,
) -> Result<(), CanError> {
    for planned in frames {
        let frame = CommandFrame::new(planned.id, &planned.data);
        match can.write(&frame).await {
            Ok(_) => {
                defmt::info!(
                    "balancing frame sent: id=0x{:03X} data={:02X}",
                    frame.id(),
                    frame.bytes()
                );
            }

            Err(CanError::Timeout) => {
                defmt::warn!("balancing frame 0x{:03X} timed out", planned.id);
                return Err(CanError::Timeout);
            }

            Err(_) => {
                return Err(CanError::WriteError);
            }
        }
        Timer::after_millis(100).await;
    }
    Ok(())
}
