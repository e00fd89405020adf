//! Connection management
//!
//! One persistent socket shared by every client of the server. The
//! `ConnectionManager` is a synchronous state machine owning the client
//! registry, the correlation table and all reconnect/keepalive timers. The
//! service module runs it on a single task and exposes a cloneable
//! `ConnectionHandle`.

mod correlation;
mod manager;
mod service;
mod transport;

use std::sync::atomic::{ AtomicU64, Ordering };
use std::sync::Arc;

use crate::error::RequestError;
use crate::message::SocketMessage;

pub use correlation::Completion;
pub use manager::{ ConnectionManager, Effect, Interceptor, LinkParts, Responder };
pub use service::{ ConnectionHandle, ConnectionStatus, PendingResponse };
pub use transport::{ Connector, Established, TransportEvent, WebSocketConnector };


/// Identity of a registered client.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord )]
pub struct ClientId( pub u64 );


impl ClientId {
    /// The connection's own client, used for keepalive traffic.
    pub const INTERNAL: ClientId = ClientId( 0 );
}


/// Identity of one sent request.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord )]
pub struct CallId( pub u64 );


impl CallId {
    /// Returned when a message could not be sent.
    pub const INVALID: CallId = CallId( 0 );


    pub fn is_valid( &self ) -> bool {
        *self != Self::INVALID
    }
}


/// Identity of a registered interceptor.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Hash )]
pub struct InterceptorId( pub u64 );


/// Allocates ids from a shared counter. Zero is never handed out.
#[derive( Debug, Clone, Default )]
pub struct IdAllocator( Arc<AtomicU64> );


impl IdAllocator {
    pub fn next( &self ) -> u64 {
        self.0.fetch_add( 1, Ordering::Relaxed ) + 1
    }
}


/// Socket state as seen by clients.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Default )]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}


/// Notifications delivered to registered clients.
#[derive( Debug, Clone, PartialEq )]
pub enum ClientEvent {
    /// State transition. A freshly registered client receives `new == old`.
    StateChanged { new: ConnectionState, old: ConnectionState },

    /// A broadcast, or a response nobody was waiting for.
    Message( SocketMessage ),

    /// The server rejected the configured password.
    InvalidCredentials,
}


/// Called exactly once with the outcome of a request.
pub type ResponseCallback = Box<dyn FnOnce( Result<SocketMessage, RequestError> ) + Send>;
