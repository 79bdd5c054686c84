#![no_std]
#![no_main]

//! # Battery telemetry gateway
//! Polls a bank of Battery Management Units over CAN-FD, mirrors the
//! decoded telemetry into a Modbus/TCP register map and relays balancing
//! commands back onto the bus, on an STM32H723 using the Embassy async
//! runtime.

use embassy_executor::Spawner;
use embassy_stm32::Config;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use static_cell::StaticCell;
use {defmt_rtt as _, panic_probe as _};

/// Internal modules
mod can_management;
mod config;
mod net;
mod query;
mod types;

use can_management::CanController;
use config::GatewayConfig;
use defmt::info;
use modbus_server::storage::RegisterBank;
use query::BalanceIntent;

/// Shared state (mutex protected)
static CONFIG: GatewayConfig = GatewayConfig::default_config();
static REGISTERS: Mutex<CriticalSectionRawMutex, RegisterBank> = Mutex::new(RegisterBank::new());
static BALANCE_INTENT: Mutex<CriticalSectionRawMutex, BalanceIntent> =
    Mutex::new(BalanceIntent::new());
static CAN: StaticCell<Mutex<CriticalSectionRawMutex, CanController<'static>>> = StaticCell::new();

/// Main entry point for the embedded async runtime
#[embassy_executor::main]
async fn main(spawner: Spawner) {
    // Clock setup
    let mut config = Config::default();
    {
        use embassy_stm32::rcc::*;
        config.rcc.hsi = Some(HSIPrescaler::DIV1);
        config.rcc.csi = true;
        config.rcc.hsi48 = Some(Hsi48Config { sync_from_usb: false });

        config.rcc.pll1 = Some(Pll {
            source: PllSource::HSI,
            prediv: PllPreDiv::DIV4,
            mul: PllMul::MUL50,
            divp: Some(PllDiv::DIV2),
            divq: Some(PllDiv::DIV8),
            divr: None,
        });

        config.rcc.sys = Sysclk::PLL1_P;
        config.rcc.ahb_pre = AHBPrescaler::DIV2;
        config.rcc.apb1_pre = APBPrescaler::DIV2;
        config.rcc.apb2_pre = APBPrescaler::DIV2;
        config.rcc.apb3_pre = APBPrescaler::DIV2;
        config.rcc.apb4_pre = APBPrescaler::DIV2;
        config.rcc.voltage_scale = VoltageScale::Scale1;

        // FDCAN kernel clock from PLL1 Q at 100 MHz.
        config.rcc.mux.fdcansel = mux::Fdcansel::PLL1_Q;
    }

    let p = embassy_stm32::init(config);

    if let Err(e) = CONFIG.validate() {
        defmt::panic!("invalid gateway configuration: {}", e);
    }

    // Registers a client reads before the first cycle hold the documented
    // defaults rather than zeros.
    REGISTERS.lock().await.seed_defaults();

    // CAN setup
    let can = CanController::new(
        p.FDCAN1,
        p.PD0,
        p.PD1,
        CONFIG.can_bitrate,
        CONFIG.can_data_bitrate,
    )
    .await;
    let can_mutex = Mutex::new(can);
    let can = StaticCell::init(&CAN, can_mutex);

    spawner.spawn(query_cycle(can)).unwrap();

    // Ethernet and the Modbus listeners
    let stack = net::init(
        &spawner,
        p.ETH,
        p.PA1,
        p.PA2,
        p.PC1,
        p.PA7,
        p.PC4,
        p.PC5,
        p.PG13,
        p.PB13,
        p.PG11,
        p.RNG,
        &CONFIG,
    )
    .await;

    for _ in 0..net::MODBUS_WORKERS {
        spawner
            .spawn(net::modbus_task(stack, &REGISTERS, CONFIG.modbus_port))
            .unwrap();
    }

    info!(
        "gateway up: modbus on port {}, polling every {} s",
        CONFIG.modbus_port,
        CONFIG.query_period.as_secs()
    );

    loop {
        embassy_time::Timer::after_millis(10).await;
    }
}

/// Task driving the poll/balance cycle; the only telemetry writer.
#[embassy_executor::task]
async fn query_cycle(
    can: &'static Mutex<CriticalSectionRawMutex, CanController<'static>>,
) -> ! {
    query::run(can, &REGISTERS, &BALANCE_INTENT, &CONFIG).await
}
