//! MBAP framing.
//!
//! Every Modbus/TCP request and response starts with the seven byte MBAP
//! header: transaction id, protocol id (always zero), the byte count of
//! everything after the length field, and the unit id. A header that fails
//! validation is not answered, the connection is dropped instead.

pub const MBAP_HEADER_LEN: usize = 7;

/// Largest ADU we accept on the wire. Header plus unit and a full PDU.
pub const MAX_ADU_LEN: usize = 260;

/// Largest PDU, function code included.
pub const MAX_PDU_LEN: usize = MAX_ADU_LEN - MBAP_HEADER_LEN;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Bytes following the length field: unit id plus PDU.
    pub length: u16,
    pub unit_id: u8,
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameError {
    /// Protocol id was not zero.
    ProtocolId(u16),
    /// Length field outside what a legal ADU can carry.
    Length(u16),
}

impl MbapHeader {
    pub fn parse(bytes: &[u8; MBAP_HEADER_LEN]) -> Self {
        MbapHeader {
            transaction_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            protocol_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
            unit_id: bytes[6],
        }
    }

    /// Checks the fixed fields. The unit id is echoed, never validated.
    pub fn validate(&self) -> Result<(), FrameError> {
        if self.protocol_id != 0 {
            return Err(FrameError::ProtocolId(self.protocol_id));
        }
        // At least the unit id and a function code, at most a full PDU.
        if self.length < 2 || self.length as usize > MAX_PDU_LEN + 1 {
            return Err(FrameError::Length(self.length));
        }
        Ok(())
    }

    pub fn encode(&self, out: &mut [u8; MBAP_HEADER_LEN]) {
        out[0..2].copy_from_slice(&self.transaction_id.to_be_bytes());
        out[2..4].copy_from_slice(&self.protocol_id.to_be_bytes());
        out[4..6].copy_from_slice(&self.length.to_be_bytes());
        out[6] = self.unit_id;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_and_encode() {
        let bytes = [0x12, 0x34, 0x00, 0x00, 0x00, 0x06, 0xFF];
        let header = MbapHeader::parse(&bytes);
        assert_eq!(header.transaction_id, 0x1234);
        assert_eq!(header.protocol_id, 0);
        assert_eq!(header.length, 6);
        assert_eq!(header.unit_id, 0xFF);
        assert_eq!(header.validate(), Ok(()));

        let mut out = [0u8; MBAP_HEADER_LEN];
        header.encode(&mut out);
        assert_eq!(out, bytes);
    }

    #[test]
    fn rejects_nonzero_protocol_id() {
        let header = MbapHeader::parse(&[0, 1, 0, 1, 0, 6, 1]);
        assert_eq!(header.validate(), Err(FrameError::ProtocolId(1)));
    }

    #[test]
    fn rejects_bad_lengths() {
        let empty = MbapHeader::parse(&[0, 1, 0, 0, 0, 0, 1]);
        assert_eq!(empty.validate(), Err(FrameError::Length(0)));

        let unit_only = MbapHeader::parse(&[0, 1, 0, 0, 0, 1, 1]);
        assert_eq!(unit_only.validate(), Err(FrameError::Length(1)));

        let oversized = MbapHeader::parse(&[0, 1, 0, 0, 1, 4, 1]);
        assert_eq!(oversized.validate(), Err(FrameError::Length(260)));

        let largest = MbapHeader::parse(&[0, 1, 0, 0, 0, 254, 1]);
        assert_eq!(largest.validate(), Ok(()));
    }
}
