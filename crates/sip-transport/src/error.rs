use std::io;
use std::net::SocketAddr;

use lws_infra_common::errors::{
    ErrorCode, LWS_ERR_INVALID_PARAM, LWS_ERR_INVALID_STATE, LWS_ERR_MQTT, LWS_ERR_SOCKET_BIND,
    LWS_ERR_SOCKET_CONNECT, LWS_ERR_SOCKET_CREATE, LWS_ERR_SOCKET_RECV, LWS_ERR_SOCKET_SEND,
    LWS_ERR_TLS, LWS_ERR_TRANSPORT_CLOSED,
};
use thiserror::Error;

/// Result type for SIP transport operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for SIP transport operations
#[derive(Error, Debug)]
pub enum Error {
    /// Socket could not be created
    #[error("Failed to create socket: {0}")]
    CreateFailed(io::Error),

    /// Failed to bind to the specified address
    #[error("Failed to bind to {0}: {1}")]
    BindFailed(SocketAddr, io::Error),

    /// Failed to connect to the specified address
    #[error("Failed to connect to {0}: {1}")]
    ConnectFailed(SocketAddr, io::Error),

    /// Failed to send to the specified address
    #[error("Failed to send to {0}: {1}")]
    SendFailed(SocketAddr, io::Error),

    /// Failed to receive
    #[error("Failed to receive: {0}")]
    ReceiveFailed(io::Error),

    /// Failed to get local address
    #[error("Failed to get local address: {0}")]
    LocalAddrFailed(io::Error),

    /// Send or poll on a transport that is not connected
    #[error("Transport not connected")]
    NotConnected,

    /// Transport is closed
    #[error("Transport closed")]
    TransportClosed,

    /// Connection closed by peer
    #[error("Connection closed by peer: {0}")]
    ConnectionClosedByPeer(SocketAddr),

    /// Payload exceeds the datagram limit
    #[error("Message too large for transport ({0} bytes)")]
    MessageTooLarge(usize),

    /// TLS setup or handshake error
    #[error("TLS error: {0}")]
    TlsError(String),

    /// MQTT client error
    #[error("MQTT error: {0}")]
    MqttError(String),

    /// Invalid address
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Invalid state transition
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    /// Status code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::CreateFailed(_) | Error::LocalAddrFailed(_) => LWS_ERR_SOCKET_CREATE,
            Error::BindFailed(..) => LWS_ERR_SOCKET_BIND,
            Error::ConnectFailed(..) => LWS_ERR_SOCKET_CONNECT,
            Error::SendFailed(..) | Error::MessageTooLarge(_) => LWS_ERR_SOCKET_SEND,
            Error::ReceiveFailed(_) | Error::ConnectionClosedByPeer(_) => LWS_ERR_SOCKET_RECV,
            Error::NotConnected | Error::TransportClosed => LWS_ERR_TRANSPORT_CLOSED,
            Error::TlsError(_) => LWS_ERR_TLS,
            Error::MqttError(_) => LWS_ERR_MQTT,
            Error::InvalidAddress(_) => LWS_ERR_INVALID_PARAM,
            Error::InvalidState(_) => LWS_ERR_INVALID_STATE,
        }
    }

    /// Whether this error moves a connection-oriented transport to `Error`
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConnectFailed(..)
                | Error::ReceiveFailed(_)
                | Error::ConnectionClosedByPeer(_)
                | Error::TlsError(_)
        )
    }
}
