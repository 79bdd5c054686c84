//! Build-time gateway configuration.
//!
//! One `GatewayConfig` value is baked into the firmware and validated once
//! at boot. The CAN interface itself is fixed by board wiring (FDCAN1 on
//! PD0/PD1), everything an operator would reasonably tune sits here.

use embassy_time::Duration;

use crate::can_management::MAX_COLLECTED_FRAMES;

#[derive(Debug, Copy, Clone)]
pub struct GatewayConfig {
    /// Nominal (arbitration phase) CAN bitrate.
    pub can_bitrate: u32,
    /// Data phase bitrate for the 64-byte response frames.
    pub can_data_bitrate: u32,
    /// Pause between polling cycles.
    pub query_period: Duration,
    /// How long one cycle waits for its responses.
    pub collect_timeout: Duration,
    /// Responses expected per cycle, 4 packs by 6 BMUs.
    pub expected_responses: usize,
    /// Wake-up payload the BMU vendor defines; opaque to the gateway.
    pub query_payload: [u8; 8],
    /// TCP port of the Modbus server.
    pub modbus_port: u16,
    /// MAC address of the Ethernet interface.
    pub mac_address: [u8; 6],
    /// String the balancing command surface addresses.
    pub balancing_string: u8,
    /// Pack the balancing command surface addresses.
    pub balancing_pack: u8,
    /// Requested discharge current. Latched and logged with each command;
    /// the command frames themselves do not carry it.
    pub balancing_current_ma: u16,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, defmt::Format)]
pub enum ConfigError {
    ZeroBitrate,
    ZeroPeriod,
    TooManyResponses(usize),
    ZeroPort,
    BalancingTargetOutOfRange,
}

impl GatewayConfig {
    pub const fn default_config() -> Self {
        GatewayConfig {
            can_bitrate: 250_000,
            can_data_bitrate: 2_000_000,
            query_period: Duration::from_secs(30),
            collect_timeout: Duration::from_secs(30),
            expected_responses: 24,
            query_payload: [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08],
            modbus_port: 1024,
            mac_address: [0x02, 0x00, 0x00, 0xB1, 0x45, 0x01],
            balancing_string: 1,
            balancing_pack: 1,
            balancing_current_ma: 0,
        }
    }

    /// Boot-time sanity check. A failure here is fatal; the gateway must
    /// not come up half-configured.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.can_bitrate == 0 || self.can_data_bitrate == 0 {
            return Err(ConfigError::ZeroBitrate);
        }
        if self.query_period.as_ticks() == 0 || self.collect_timeout.as_ticks() == 0 {
            return Err(ConfigError::ZeroPeriod);
        }
        if self.expected_responses == 0 || self.expected_responses > MAX_COLLECTED_FRAMES {
            return Err(ConfigError::TooManyResponses(self.expected_responses));
        }
        if self.modbus_port == 0 {
            return Err(ConfigError::ZeroPort);
        }
        if self.balancing_string < 1
            || self.balancing_string > bms_protocol::address::STRING_COUNT
            || self.balancing_pack < 1
            || self.balancing_pack > bms_protocol::address::PACKS_PER_STRING
        {
            return Err(ConfigError::BalancingTargetOutOfRange);
        }
        Ok(())
    }
}
