//! Serves the register bank on 0.0.0.0:1024 over std sockets, seeded with
//! the default scalar values. Point any Modbus/TCP client at it, e.g.
//! reading two holding registers at address 1000 returns SOC = 88.5.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use modbus_server::connector::std_compat::StdTcpSocket;
use modbus_server::storage::RegisterBank;
use modbus_server::ModbusServer;

fn main() {
    smol::block_on(run());
}

async fn run() {
    static BANK: Mutex<CriticalSectionRawMutex, RegisterBank> = Mutex::new(RegisterBank::new());
    BANK.lock().await.seed_defaults();

    let mut socket = StdTcpSocket::new();
    let mut server = ModbusServer::new(&BANK);

    println!("modbus server on 0.0.0.0:1024");
    server.listen(&mut socket, 1024).await
}
