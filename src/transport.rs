//! # MQTT Transport Abstraction
//!
//! This module defines the `MqttTransport` trait, which abstracts the underlying
//! communication channel (like TCP, UART, etc.), allowing the MQTT client to be
//! hardware and network-stack agnostic. The client owns connection lifetime, so
//! the trait covers connect and close as well as the byte pipe.
//!
//! With the Rust 2024 Edition, this trait uses native `async fn`, removing the
//! need for the `#[async_trait]` macro.

use crate::error::{MqttError, ProtocolError};
use embassy_net::dns::{self, DnsQueryType};
use embassy_net::tcp::{ConnectError, Error as TcpError, TcpSocket};
use embassy_net::{IpAddress, Stack};
use embassy_time::{Duration, Timer};
use embedded_io_async::Write;

/// A placeholder error type used in contexts where the actual transport error is not known,
/// such as in the `EncodePacket` trait.
#[derive(Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ErrorPlaceHolder;

/// A trait representing a transport for MQTT packets.
#[allow(async_fn_in_trait)]
pub trait MqttTransport {
    /// The error type returned by the transport.
    type Error: core::fmt::Debug;

    /// Establishes the underlying connection to the broker.
    async fn connect(&mut self) -> Result<(), Self::Error>;

    /// Tears the connection down. Safe to call when already closed.
    async fn close(&mut self);

    /// Sends a buffer of data over the transport.
    async fn send(&mut self, buf: &[u8]) -> Result<(), Self::Error>;

    /// Receives data from the transport into a buffer.
    ///
    /// Returns the number of bytes read. Reads are bounded by `buf`, so one
    /// inbound MQTT packet may span several calls.
    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;
}

/// A marker trait for transport-related errors.
pub trait TransportError: core::fmt::Debug {}

// Allow the placeholder to be treated as a transport error for generic contexts.
impl TransportError for ErrorPlaceHolder {}

// Implement TransportError for MqttError so TcpTransport works with client methods
impl<T: core::fmt::Debug> TransportError for MqttError<T> {}

impl TransportError for TcpError {}
impl TransportError for TcpLinkError {}

/// Where the broker lives.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BrokerAddress<'a> {
    /// Resolved via DNS on first connect; the result is cached for the life
    /// of the transport.
    Hostname(&'a str),
    Ip(IpAddress),
}

/// Errors of the TCP transport.
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TcpLinkError {
    Connect(ConnectError),
    Dns(dns::Error),
    /// DNS resolution succeeded but returned no address.
    HostNotFound,
    Tcp(TcpError),
}

/// TCP transport implementation using `embassy-net`.
pub struct TcpTransport<'a> {
    stack: Stack<'a>,
    socket: TcpSocket<'a>,
    address: BrokerAddress<'a>,
    port: u16,
    resolved: Option<IpAddress>,
    connect_timeout: Duration,
}

impl<'a> TcpTransport<'a> {
    /// Creates a new `TcpTransport` connecting to `address:port`.
    pub fn new(
        stack: Stack<'a>,
        socket: TcpSocket<'a>,
        address: BrokerAddress<'a>,
        port: u16,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            stack,
            socket,
            address,
            port,
            resolved: None,
            connect_timeout,
        }
    }

    async fn resolve(&mut self) -> Result<IpAddress, MqttError<TcpLinkError>> {
        if let Some(ip) = self.resolved {
            return Ok(ip);
        }
        let ip = match self.address {
            BrokerAddress::Ip(ip) => ip,
            BrokerAddress::Hostname(host) => {
                let addresses = self
                    .stack
                    .dns_query(host, DnsQueryType::A)
                    .await
                    .map_err(|e| MqttError::Transport(TcpLinkError::Dns(e)))?;
                *addresses
                    .first()
                    .ok_or(MqttError::Transport(TcpLinkError::HostNotFound))?
            }
        };
        self.resolved = Some(ip);
        Ok(ip)
    }
}

impl<'a> MqttTransport for TcpTransport<'a> {
    type Error = MqttError<TcpLinkError>;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        let ip = self.resolve().await?;

        // Race the TCP handshake against a timer, as a dead broker address
        // would otherwise stall the reconnect loop on retransmissions.
        let connect_fut = self.socket.connect((ip, self.port));
        let timer = Timer::after(self.connect_timeout);

        match futures::future::select(core::pin::pin!(connect_fut), core::pin::pin!(timer)).await {
            futures::future::Either::Left((Ok(()), _)) => Ok(()),
            futures::future::Either::Left((Err(e), _)) => {
                Err(MqttError::Transport(TcpLinkError::Connect(e)))
            }
            futures::future::Either::Right(((), _)) => Err(MqttError::Timeout),
        }
    }

    async fn close(&mut self) {
        self.socket.abort();
        // Flush pushes the RST out before the socket is reused.
        let _ = self.socket.flush().await;
    }

    async fn send(&mut self, buf: &[u8]) -> Result<(), Self::Error> {
        self.socket
            .write_all(buf)
            .await
            .map_err(|e| MqttError::Transport(TcpLinkError::Tcp(e)))?;

        // Flush to ensure data is actually sent to the network
        self.socket
            .flush()
            .await
            .map_err(|e| MqttError::Transport(TcpLinkError::Tcp(e)))
    }

    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        match self.socket.read(buf).await {
            // The peer closing the connection surfaces as a zero-length read.
            Ok(0) => Err(MqttError::Protocol(ProtocolError::ConnectionClosed)),
            Ok(n) => Ok(n),
            Err(e) => Err(MqttError::Transport(TcpLinkError::Tcp(e))),
        }
    }
}
