//! FDCAN controller wrapper.
//!
//! Owns the peripheral in normal mode and exposes the two operations the
//! gateway needs: a bounded classic-frame send for queries and commands,
//! and a deadline-bounded collection of 64-byte CAN-FD responses.

use embassy_futures::select::{select, Either};
use embassy_stm32::can::{self, Can};
use embassy_stm32::peripherals::{FDCAN1, PD0, PD1};
use embassy_stm32::{bind_interrupts, peripherals};
use embassy_time::{with_timeout, Duration, Instant, Timer};
use heapless::Vec;

use super::frame::{CommandFrame, TelemetryEnvelope};

bind_interrupts!(struct Irqs {
    FDCAN1_IT0 => can::IT0InterruptHandler<peripherals::FDCAN1>;
    FDCAN1_IT1 => can::IT1InterruptHandler<peripherals::FDCAN1>;
});

/// Upper bound on frames kept per collection. One cycle expects 24.
pub const MAX_COLLECTED_FRAMES: usize = 32;

/// A send that cannot drain within this window means nobody on the bus is
/// acknowledging.
const WRITE_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Copy, Clone, Eq, PartialEq, defmt::Format)]
pub enum CanError {
    Timeout,
    WriteError,
    ReadError,
}

pub struct CanController<'a> {
    can: Can<'a>,
}

impl CanController<'_> {
    /// Brings FDCAN1 up on PD0/PD1 at the given arbitration and data phase
    /// bitrates and leaves it in normal mode.
    pub async fn new(
        peri: FDCAN1,
        rx: PD0,
        tx: PD1,
        bitrate: u32,
        data_bitrate: u32,
    ) -> CanController<'static> {
        let mut configurator = can::CanConfigurator::new(peri, rx, tx, Irqs);
        configurator.set_bitrate(bitrate);
        configurator.set_fd_data_bitrate(data_bitrate, false);

        let can = configurator.into_normal_mode();

        CanController { can }
    }

    /// Queues one classic frame for transmission.
    pub async fn write(&mut self, frame: &CommandFrame) -> Result<(), CanError> {
        match with_timeout(WRITE_TIMEOUT, self.can.write(frame.frame())).await {
            Ok(_) => Ok(()),
            Err(_) => Err(CanError::Timeout),
        }
    }

    /// Reads frames off the bus until `expected` 64-byte telemetry frames
    /// arrived or `deadline` ran out. Frames with any other payload length
    /// are counted and dropped. Whatever was collected by the deadline is
    /// returned; a partial batch is not an error.
    pub async fn collect_frames(
        &mut self,
        expected: usize,
        deadline: Duration,
    ) -> Vec<TelemetryEnvelope, MAX_COLLECTED_FRAMES> {
        let started = Instant::now();
        let ends_at = started + deadline;
        let mut frames: Vec<TelemetryEnvelope, MAX_COLLECTED_FRAMES> = Vec::new();
        let mut other_frames: u32 = 0;

        while frames.len() < expected.min(MAX_COLLECTED_FRAMES) {
            match select(Timer::at(ends_at), self.can.read_fd()).await {
                Either::First(_) => break,
                Either::Second(Ok(envelope)) => {
                    let envelope = TelemetryEnvelope::from_fd_envelope(envelope);
                    if envelope.is_telemetry() {
                        defmt::debug!(
                            "telemetry frame {} collected, id 0x{:03X}",
                            frames.len() + 1,
                            envelope.id()
                        );
                        let _ = frames.push(envelope);
                    } else {
                        other_frames += 1;
                        defmt::debug!(
                            "dropping {} byte frame, id 0x{:03X}",
                            envelope.len(),
                            envelope.id()
                        );
                    }
                }
                Either::Second(Err(err)) => {
                    // Error frames end the collection; the next cycle
                    // starts over.
                    defmt::warn!("CAN bus error during collection: {}", err);
                    break;
                }
            }
        }

        defmt::info!(
            "collection done: {} telemetry frames, {} other frames, {} ms",
            frames.len(),
            other_frames,
            started.elapsed().as_millis()
        );
        frames
    }
}
