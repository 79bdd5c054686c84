#![cfg_attr(not(any(test, feature = "std")), no_std)]

//! Modbus/TCP server over a shared register bank.
//!
//! The server owns nothing but a reference to the bank mutex. Each
//! `ModbusServer` instance drives one socket: accept a peer, answer
//! MBAP-framed requests until the peer hangs up or sends garbage, close,
//! accept the next peer. Running several instances on separate sockets
//! gives concurrent clients; the bank lock is only ever held for the
//! duration of a single request, so telemetry writers interleave cleanly.

mod fmt;

pub mod connector;
pub mod frame;
pub mod pdu;
pub mod storage;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::mutex::Mutex;
use embedded_io_async::ReadExactError;

use crate::connector::Connection;
use crate::fmt::{debug, warn};
use crate::frame::{FrameError, MbapHeader, MAX_PDU_LEN, MBAP_HEADER_LEN};
use crate::storage::RegisterBank;

/// Why a connection was torn down.
#[derive(Debug)]
pub enum ServeError<E> {
    /// Socket I/O failed.
    Io(E),
    /// Peer closed in the middle of a frame.
    UnexpectedEof,
    /// Header failed validation; per protocol there is no reply to send.
    Frame(FrameError),
}

impl<E> From<ReadExactError<E>> for ServeError<E> {
    fn from(value: ReadExactError<E>) -> Self {
        match value {
            ReadExactError::UnexpectedEof => ServeError::UnexpectedEof,
            ReadExactError::Other(e) => ServeError::Io(e),
        }
    }
}

pub struct ModbusServer<'a, M: RawMutex> {
    bank: &'a Mutex<M, RegisterBank>,
}

impl<'a, M: RawMutex> ModbusServer<'a, M> {
    pub fn new(bank: &'a Mutex<M, RegisterBank>) -> Self {
        ModbusServer { bank }
    }

    /// Accept loop. Serves one peer at a time on this socket and never
    /// returns; a second server on its own socket handles further peers.
    pub async fn listen<C: Connection>(&mut self, socket: &mut C, port: u16) -> ! {
        loop {
            debug!("modbus: waiting for connection");

            if let Err(_e) = socket.listen(port).await {
                warn!("modbus: accept error: {:?}", defmt::Debug2Format(&_e));
                socket.close();
                continue;
            }

            debug!("modbus: client connected");
            match self.serve(socket).await {
                Ok(()) => debug!("modbus: client disconnected"),
                Err(_e) => warn!("modbus: connection dropped: {:?}", defmt::Debug2Format(&_e)),
            }

            socket.close();
        }
    }

    /// Request/reply loop for one connected peer. Returns `Ok` on a clean
    /// close between frames.
    pub async fn serve<C: Connection>(
        &mut self,
        socket: &mut C,
    ) -> Result<(), ServeError<C::Error>> {
        let mut header_buf = [0u8; MBAP_HEADER_LEN];
        let mut request = [0u8; MAX_PDU_LEN];
        let mut response = [0u8; MBAP_HEADER_LEN + MAX_PDU_LEN];

        loop {
            match socket.read_exact(&mut header_buf).await {
                Ok(()) => {}
                // A peer that goes away between requests is normal.
                Err(ReadExactError::UnexpectedEof) => return Ok(()),
                Err(ReadExactError::Other(e)) => return Err(ServeError::Io(e)),
            }

            let header = MbapHeader::parse(&header_buf);
            header.validate().map_err(ServeError::Frame)?;

            // The unit id arrived with the header; the rest of the ADU is
            // the PDU proper.
            let pdu_len = header.length as usize - 1;
            socket.read_exact(&mut request[..pdu_len]).await?;

            let response_len = {
                let mut bank = self.bank.lock().await;
                pdu::process(&mut bank, &request[..pdu_len], &mut response[MBAP_HEADER_LEN..])
            };
            if response_len == 0 {
                return Err(ServeError::Frame(FrameError::Length(header.length)));
            }

            let reply_header = MbapHeader {
                transaction_id: header.transaction_id,
                protocol_id: 0,
                length: response_len as u16 + 1,
                unit_id: header.unit_id,
            };
            let mut head = [0u8; MBAP_HEADER_LEN];
            reply_header.encode(&mut head);
            response[..MBAP_HEADER_LEN].copy_from_slice(&head);

            socket
                .write_all(&response[..MBAP_HEADER_LEN + response_len])
                .await
                .map_err(ServeError::Io)?;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // A scripted byte-stream peer, enough to exercise the framing layer
    // without a network.
    struct ScriptedPeer {
        input: Vec<u8>,
        read_pos: usize,
        output: Vec<u8>,
    }

    impl ScriptedPeer {
        fn new(input: &[u8]) -> Self {
            ScriptedPeer {
                input: input.to_vec(),
                read_pos: 0,
                output: Vec::new(),
            }
        }
    }

    #[derive(Debug)]
    struct NoError;

    impl embedded_io_async::Error for NoError {
        fn kind(&self) -> embedded_io_async::ErrorKind {
            embedded_io_async::ErrorKind::Other
        }
    }

    impl embedded_io_async::ErrorType for ScriptedPeer {
        type Error = NoError;
    }

    impl embedded_io_async::Read for ScriptedPeer {
        async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
            let remaining = &self.input[self.read_pos..];
            let n = remaining.len().min(buf.len());
            buf[..n].copy_from_slice(&remaining[..n]);
            self.read_pos += n;
            Ok(n)
        }
    }

    impl embedded_io_async::Write for ScriptedPeer {
        async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }
    }

    impl Connection for ScriptedPeer {
        type AcceptError = NoError;

        async fn listen(&mut self, _port: u16) -> Result<(), Self::AcceptError> {
            Ok(())
        }

        fn close(&mut self) {}
    }

    fn block_on<F: core::future::Future>(fut: F) -> F::Output {
        // The scripted peer never actually pends, so a trivial executor
        // that polls once is enough.
        use core::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

        fn raw() -> RawWaker {
            fn no_op(_: *const ()) {}
            fn clone(_: *const ()) -> RawWaker {
                raw()
            }
            RawWaker::new(
                core::ptr::null(),
                &RawWakerVTable::new(clone, no_op, no_op, no_op),
            )
        }

        let waker = unsafe { Waker::from_raw(raw()) };
        let mut cx = Context::from_waker(&waker);
        let mut fut = core::pin::pin!(fut);
        loop {
            if let Poll::Ready(out) = fut.as_mut().poll(&mut cx) {
                return out;
            }
        }
    }

    type TestMutex = embassy_sync::blocking_mutex::raw::NoopRawMutex;

    #[test]
    fn answers_a_read_and_echoes_the_transaction() {
        let bank: Mutex<TestMutex, RegisterBank> = Mutex::new(RegisterBank::new());
        block_on(async {
            bank.lock().await.write_float(1000, 87.5).unwrap();
        });

        // FC 0x03, address 1000, quantity 2, transaction 0x0102, unit 0x11.
        let mut peer = ScriptedPeer::new(&[
            0x01, 0x02, 0x00, 0x00, 0x00, 0x06, 0x11, 0x03, 0x03, 0xE8, 0x00, 0x02,
        ]);

        let mut server = ModbusServer::new(&bank);
        let result = block_on(server.serve(&mut peer));
        assert!(result.is_ok());

        assert_eq!(
            peer.output,
            // Header with length 7, then FC 3, byte count 4, 0x42AF 0x0000.
            [0x01, 0x02, 0x00, 0x00, 0x00, 0x07, 0x11, 0x03, 0x04, 0x42, 0xAF, 0x00, 0x00]
        );
    }

    #[test]
    fn nonzero_protocol_id_closes_without_reply() {
        let bank: Mutex<TestMutex, RegisterBank> = Mutex::new(RegisterBank::new());
        let mut peer = ScriptedPeer::new(&[
            0x00, 0x01, 0x00, 0x01, 0x00, 0x06, 0x01, 0x03, 0x03, 0xE8, 0x00, 0x02,
        ]);

        let mut server = ModbusServer::new(&bank);
        let result = block_on(server.serve(&mut peer));
        assert!(matches!(
            result,
            Err(ServeError::Frame(FrameError::ProtocolId(1)))
        ));
        assert!(peer.output.is_empty());
    }

    #[test]
    fn oversized_length_closes_without_reply() {
        let bank: Mutex<TestMutex, RegisterBank> = Mutex::new(RegisterBank::new());
        let mut peer = ScriptedPeer::new(&[0x00, 0x01, 0x00, 0x00, 0x01, 0x04, 0x01]);

        let mut server = ModbusServer::new(&bank);
        let result = block_on(server.serve(&mut peer));
        assert!(matches!(
            result,
            Err(ServeError::Frame(FrameError::Length(260)))
        ));
        assert!(peer.output.is_empty());
    }

    #[test]
    fn writes_apply_in_request_order() {
        let bank: Mutex<TestMutex, RegisterBank> = Mutex::new(RegisterBank::new());
        // Two FC 0x06 writes to the same register in one stream.
        let mut peer = ScriptedPeer::new(&[
            0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x06, 0x00, 0x64, 0x00, 0x0A,
            0x00, 0x02, 0x00, 0x00, 0x00, 0x06, 0x01, 0x06, 0x00, 0x64, 0x00, 0x0B,
        ]);

        let mut server = ModbusServer::new(&bank);
        block_on(server.serve(&mut peer)).unwrap();

        let value = block_on(async { bank.lock().await.holding(100, 1).unwrap()[0] });
        assert_eq!(value, 0x000B);
    }
}
