//! Ethernet bring-up and the Modbus listener pool.
//!
//! The H723 drives its own MAC over RMII; `embassy-net` supplies DHCP and
//! the TCP sockets. Each listener task owns one socket and serves one
//! client at a time, the pool size bounds how many clients connect
//! concurrently.

use embassy_executor::Spawner;
use embassy_net::tcp::TcpSocket;
use embassy_net::{Runner, Stack, StackResources};
use embassy_stm32::eth::generic_smi::GenericSMI;
use embassy_stm32::eth::{Ethernet, PacketQueue};
use embassy_stm32::peripherals::{ETH, PA1, PA2, PA7, PB13, PC1, PC4, PC5, PG11, PG13, RNG};
use embassy_stm32::rng::Rng;
use embassy_stm32::{bind_interrupts, eth, peripherals, rng};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_time::Duration;
use static_cell::StaticCell;

use modbus_server::storage::RegisterBank;
use modbus_server::ModbusServer;

use crate::config::GatewayConfig;

bind_interrupts!(struct Irqs {
    ETH => eth::InterruptHandler;
    RNG => rng::InterruptHandler<peripherals::RNG>;
});

pub type Device = Ethernet<'static, ETH, GenericSMI>;

/// Concurrent Modbus clients served.
pub const MODBUS_WORKERS: usize = 2;

static PACKETS: StaticCell<PacketQueue<4, 4>> = StaticCell::new();
static RESOURCES: StaticCell<StackResources<{ MODBUS_WORKERS + 2 }>> = StaticCell::new();

/// Brings the interface up with DHCP and blocks until an address is
/// assigned.
pub async fn init(
    spawner: &Spawner,
    eth: ETH,
    ref_clk: PA1,
    mdio: PA2,
    mdc: PC1,
    crs_dv: PA7,
    rx_d0: PC4,
    rx_d1: PC5,
    tx_d0: PG13,
    tx_d1: PB13,
    tx_en: PG11,
    rng: RNG,
    config: &GatewayConfig,
) -> Stack<'static> {
    // DHCP wants a random seed that survives reconnects.
    let mut rng = Rng::new(rng, Irqs);
    let mut seed = [0u8; 8];
    rng.async_fill_bytes(&mut seed).await.unwrap();
    let seed = u64::from_le_bytes(seed);

    let device = Ethernet::new(
        PACKETS.init(PacketQueue::<4, 4>::new()),
        eth,
        Irqs,
        ref_clk,
        mdio,
        mdc,
        crs_dv,
        rx_d0,
        rx_d1,
        tx_d0,
        tx_d1,
        tx_en,
        GenericSMI::new(0),
        config.mac_address,
    );

    let net_config = embassy_net::Config::dhcpv4(Default::default());
    let (stack, runner) =
        embassy_net::new(device, net_config, RESOURCES.init(StackResources::new()), seed);

    spawner.spawn(net_task(runner)).unwrap();

    stack.wait_config_up().await;
    if let Some(cfg) = stack.config_v4() {
        defmt::info!("network up: {}", cfg.address);
    }

    stack
}

#[embassy_executor::task]
async fn net_task(mut runner: Runner<'static, Device>) -> ! {
    runner.run().await
}

/// One Modbus worker. Accepts a peer on the configured port, serves it to
/// completion, accepts the next.
#[embassy_executor::task(pool_size = 2)]
pub async fn modbus_task(
    stack: Stack<'static>,
    bank: &'static Mutex<CriticalSectionRawMutex, RegisterBank>,
    port: u16,
) -> ! {
    let mut rx_buffer = [0u8; 512];
    let mut tx_buffer = [0u8; 512];

    let mut socket = TcpSocket::new(stack, &mut rx_buffer, &mut tx_buffer);
    // Kick dead peers instead of pinning the worker forever.
    socket.set_timeout(Some(Duration::from_secs(120)));

    let mut server = ModbusServer::new(bank);
    server.listen(&mut socket, port).await
}
