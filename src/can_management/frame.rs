use embassy_stm32::can::frame::FdEnvelope;
use embassy_stm32::can::{Frame, Id, StandardId};

use bms_protocol::codec::TELEMETRY_FRAME_LEN;

/// A host-originated 8-byte classic frame: the wake-up query or one of the
/// balancing command frames.
#[derive(Clone)]
pub struct CommandFrame {
    id: u16,
    data: [u8; 8],
    frame: Frame,
}

impl CommandFrame {
    pub fn new(id: u16, data: &[u8]) -> Self {
        let mut frame_data = [0u8; 8];
        let len = data.len().min(8);

        frame_data[..len].copy_from_slice(&data[..len]);

        let tx_frame = Frame::new_data(
            StandardId::new(id).unwrap(),
            &frame_data[..len],
        ).unwrap();

        CommandFrame {
            id,
            data: frame_data,
            frame: tx_frame,
        }
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn bytes(&self) -> [u8; 8] {
        self.data
    }

    pub fn id(&self) -> u16 {
        self.id
    }
}

/// One received CAN-FD envelope with its payload copied out. Telemetry
/// responses carry exactly 64 bytes; anything else is counted and dropped
/// by the controller.
pub struct TelemetryEnvelope {
    id: u16,
    data: [u8; TELEMETRY_FRAME_LEN],
    len: usize,
}

impl TelemetryEnvelope {
    pub fn from_fd_envelope(envelope: FdEnvelope) -> Self {
        let rx_frame = envelope.frame;
        let mut data = [0u8; TELEMETRY_FRAME_LEN];
        let len = (rx_frame.header().len() as usize).min(TELEMETRY_FRAME_LEN);

        data[..len].copy_from_slice(&rx_frame.data()[..len]);

        let id = match rx_frame.id() {
            Id::Standard(id) => id.as_raw(),
            Id::Extended(id) => id.standard_id().as_raw(),
        };

        TelemetryEnvelope { id, data, len }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_telemetry(&self) -> bool {
        self.len == TELEMETRY_FRAME_LEN
    }
}
