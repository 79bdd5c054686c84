//! Socket abstraction the server runs on.
//!
//! The firmware serves Modbus over `embassy-net` TCP sockets; host tools
//! and the example use plain std sockets behind the `std` feature. Both
//! speak the same small `Connection` contract: wait for a peer on a port,
//! exchange bytes, tear the socket down so it can accept again.

use core::fmt::Debug;

use embedded_io_async::{Read, Write};

pub trait Connection: Read + Write {
    type AcceptError: Debug;

    /// Waits for one inbound connection on `port`.
    async fn listen(&mut self, port: u16) -> Result<(), Self::AcceptError>;

    /// Drops the peer. The socket must be able to `listen` again afterwards.
    fn close(&mut self);
}

#[cfg(feature = "embassy")]
pub mod embassy_net_compat {
    use embassy_net::tcp::{AcceptError, TcpSocket};
    use embassy_net::IpListenEndpoint;

    use super::*;

    impl<'a> Connection for TcpSocket<'a> {
        type AcceptError = AcceptError;

        async fn listen(&mut self, port: u16) -> Result<(), Self::AcceptError> {
            self.accept(IpListenEndpoint { addr: None, port }).await
        }

        fn close(&mut self) {
            TcpSocket::close(self);
            TcpSocket::abort(self);
        }
    }
}

#[cfg(feature = "std")]
pub mod std_compat {
    use std::net::{SocketAddr, TcpListener, TcpStream};

    use async_io::Async;
    use smol::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    /// A lazily bound server-side socket over std networking.
    pub struct StdTcpSocket {
        socket: Option<Async<TcpStream>>,
    }

    impl StdTcpSocket {
        pub fn new() -> Self {
            Self { socket: None }
        }
    }

    impl Default for StdTcpSocket {
        fn default() -> Self {
            Self::new()
        }
    }

    #[derive(Debug)]
    pub struct StdError(std::io::Error);

    impl From<std::io::Error> for StdError {
        fn from(value: std::io::Error) -> Self {
            Self(value)
        }
    }

    impl embedded_io_async::Error for StdError {
        fn kind(&self) -> embedded_io_async::ErrorKind {
            embedded_io_async::ErrorKind::Other
        }
    }

    impl embedded_io_async::ErrorType for StdTcpSocket {
        type Error = StdError;
    }

    impl Read for StdTcpSocket {
        async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
            match self.socket.as_mut() {
                Some(socket) => Ok(socket.read(buf).await?),
                None => Ok(0),
            }
        }
    }

    impl Write for StdTcpSocket {
        async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
            match self.socket.as_mut() {
                Some(socket) => Ok(socket.write(buf).await?),
                None => Ok(0),
            }
        }
    }

    impl Connection for StdTcpSocket {
        type AcceptError = StdError;

        async fn listen(&mut self, port: u16) -> Result<(), Self::AcceptError> {
            let listener = Async::<TcpListener>::bind(SocketAddr::from(([0, 0, 0, 0], port)))?;
            let (socket, _) = listener.accept().await?;

            self.socket = Some(socket);

            Ok(())
        }

        fn close(&mut self) {
            let Some(socket) = self.socket.take() else {
                return;
            };
            if let Ok(socket) = socket.into_inner() {
                let _ = socket.shutdown(std::net::Shutdown::Both);
            }
        }
    }
}
