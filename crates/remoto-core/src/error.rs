//! Error types shared across the connection and session layers.

use thiserror::Error;


/// Errors raised while parsing or building a wire message.
#[derive( Debug, Error )]
pub enum MessageError {
    #[error( "Invalid JSON: {0}" )]
    Json( #[from] serde_json::Error ),

    #[error( "Missing field: {0}" )]
    MissingField( &'static str ),

    #[error( "Unknown message type: {0}" )]
    UnknownType( String ),
}


/// Failure delivered to whoever is waiting on a request.
///
/// Exactly one `Result` is delivered per request, so this is cheap to clone
/// and carries no transport details beyond a message string.
#[derive( Debug, Clone, PartialEq, Eq, Error )]
pub enum RequestError {
    #[error( "Request canceled" )]
    Canceled,

    #[error( "Request timed out" )]
    TimedOut,

    #[error( "Not connected" )]
    NotConnected,

    #[error( "Client is not registered" )]
    UnknownClient,

    #[error( "Server error: {0}" )]
    Server( String ),

    #[error( "Connection service stopped" )]
    ServiceStopped,

    #[error( "Malformed response: {0}" )]
    Malformed( String ),
}


/// Errors raised while establishing the socket.
#[derive( Debug, Error )]
pub enum ConnectError {
    #[error( "Connection timed out" )]
    Timeout,

    #[error( "Invalid address: {0}" )]
    InvalidAddress( String ),

    #[error( "WebSocket error: {0}" )]
    WebSocket( #[from] tokio_tungstenite::tungstenite::Error ),

    #[error( "Handshake failed: {0}" )]
    Handshake( String ),

    #[error( "Invalid credentials" )]
    InvalidCredentials,
}
