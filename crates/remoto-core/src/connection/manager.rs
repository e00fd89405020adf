//! Connection state machine
//!
//! `ConnectionManager` never performs I/O itself. Time is passed in
//! explicitly, connection attempts are requested through `Effect`s, and the
//! socket is represented by the sending half of a frame channel. This keeps
//! every transition on one logical context and makes the whole protocol
//! testable without a network.

use std::collections::HashMap;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

use super::correlation::{ Completion, CorrelationTable, Entry, Waiter };
use super::{ CallId, ClientEvent, ClientId, ConnectionState, IdAllocator, InterceptorId };
use crate::config::Timing;
use crate::error::{ ConnectError, RequestError };
use crate::message::{ MessageBuilder, MessageType, SocketMessage };
use crate::protocol::{ key, request, MINIMUM_SUPPORTED_API_VERSION };


/// Work the driver must perform on the manager's behalf.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum Effect {
    /// Start a connect-and-authenticate worker tagged with `attempt`.
    /// Any earlier worker's result is stale from now on.
    Connect { attempt: u64 },
}


/// Pushes synthetic responses back into the receive pipeline.
#[derive( Debug, Clone )]
pub struct Responder {
    loopback: UnboundedSender<SocketMessage>,
}


impl Responder {
    pub fn new( loopback: UnboundedSender<SocketMessage> ) -> Self {
        Self { loopback }
    }


    /// Queues `response` as if it had arrived from the server. Delivery
    /// happens on a later turn, after the send that triggered it finished.
    pub fn respond( &self, response: SocketMessage ) {
        if self.loopback.send( response ).is_err() {
            tracing::debug!( "Responder: connection service is gone" );
        }
    }
}


/// Claims outgoing messages before they reach the wire.
pub trait Interceptor: Send {
    /// Returns true if `message` was claimed. A claimed message is never
    /// transmitted; answer it through `responder`.
    fn intercept( &mut self, message: &SocketMessage, responder: &Responder ) -> bool;
}


impl<F> Interceptor for F
where
    F: FnMut( &SocketMessage, &Responder ) -> bool + Send,
{
    fn intercept( &mut self, message: &SocketMessage, responder: &Responder ) -> bool {
        self( message, responder )
    }
}


/// What a successful connect worker hands to the manager.
#[derive( Debug )]
pub struct LinkParts {
    pub api_version: i64,
    pub outgoing: UnboundedSender<String>,
}


struct Link {
    id: u64,
    outgoing: UnboundedSender<String>,
}


pub struct ConnectionManager {
    timing: Timing,
    state: ConnectionState,
    clients: HashMap<ClientId, UnboundedSender<ClientEvent>>,
    correlation: CorrelationTable,
    interceptors: Vec<( InterceptorId, Box<dyn Interceptor> )>,
    responder: Responder,
    call_ids: IdAllocator,
    link: Option<Link>,
    attempt: u64,
    auto_reconnect: bool,
    credentials_rejected: bool,
    server_api_version: i64,
    effects: Vec<Effect>,

    sweep_at: Option<Instant>,
    reconnect_at: Option<Instant>,
    failsafe_at: Option<Instant>,
    teardown_at: Option<Instant>,
    ping_at: Option<Instant>,
    ping_deadline: Option<Instant>,
}


impl ConnectionManager {
    /// Creates a disconnected manager.
    ///
    /// @param timing - Protocol intervals
    /// @param loopback - Channel the driver reads synthetic responses from
    /// @param now - Current time, used to schedule the first sweep
    pub fn new( timing: Timing, loopback: UnboundedSender<SocketMessage>, now: Instant ) -> Self {
        let sweep_at = Some( now + timing.sweep_interval );
        Self {
            timing,
            state: ConnectionState::Disconnected,
            clients: HashMap::new(),
            correlation: CorrelationTable::default(),
            interceptors: Vec::new(),
            responder: Responder::new( loopback ),
            call_ids: IdAllocator::default(),
            link: None,
            attempt: 0,
            auto_reconnect: false,
            credentials_rejected: false,
            server_api_version: -1,
            effects: Vec::new(),
            sweep_at,
            reconnect_at: None,
            failsafe_at: None,
            teardown_at: None,
            ping_at: None,
            ping_deadline: None,
        }
    }


    pub fn state( &self ) -> ConnectionState {
        self.state
    }


    /// Api version reported by the server during authentication, or -1.
    pub fn server_api_version( &self ) -> i64 {
        self.server_api_version
    }


    /// True when the server is newer than this client understands.
    pub fn should_upgrade( &self ) -> bool {
        self.server_api_version > 0 && self.server_api_version > MINIMUM_SUPPORTED_API_VERSION
    }


    /// Shared allocator for call ids, so handles can tag requests up front.
    pub fn call_ids( &self ) -> IdAllocator {
        self.call_ids.clone()
    }


    /// Id of the live socket, if any.
    pub fn link_id( &self ) -> Option<u64> {
        self.link.as_ref().map( |link| link.id )
    }


    pub fn client_count( &self ) -> usize {
        self.clients.len()
    }


    pub fn pending_requests( &self ) -> usize {
        self.correlation.len()
    }


    pub fn take_effects( &mut self ) -> Vec<Effect> {
        std::mem::take( &mut self.effects )
    }


    /// Registers interest in the connection. The client immediately receives
    /// the current state as a `new == old` transition.
    pub fn register_client( &mut self, client: ClientId, events: UnboundedSender<ClientEvent>, now: Instant ) {
        let first = self.clients.is_empty();
        let known = self.clients.insert( client, events ).is_some();
        self.teardown_at = None;

        if !known {
            tracing::debug!( "Client {:?} registered ({} total)", client, self.clients.len() );
        }

        if self.state == ConnectionState::Disconnected && !self.credentials_rejected {
            if first {
                self.failsafe_at = Some( now + self.timing.network_failsafe );
            }
            self.reconnect();
        }

        self.notify( client, ClientEvent::StateChanged { new: self.state, old: self.state } );
    }


    /// Drops interest in the connection and cancels the client's requests.
    /// The socket closes after a grace period once nobody is left.
    pub fn deregister_client( &mut self, client: ClientId, now: Instant ) {
        if self.clients.remove( &client ).is_none() {
            return;
        }

        self.cancel_messages_for( client );

        if self.clients.is_empty() {
            tracing::debug!( "Last client left; disconnecting in {:?}", self.timing.disconnect_grace );
            self.failsafe_at = None;
            self.teardown_at = Some( now + self.timing.disconnect_grace );
        }
    }


    pub fn add_interceptor( &mut self, id: InterceptorId, interceptor: Box<dyn Interceptor> ) {
        self.interceptors.push(( id, interceptor ));
    }


    pub fn remove_interceptor( &mut self, id: InterceptorId ) {
        self.interceptors.retain( |( existing, _ )| *existing != id );
    }


    /// Sends `message` on behalf of `client`.
    ///
    /// @param call - Id to associate with the request
    /// @param completion - Receives the outcome; `None` for fire-and-forget
    ///
    /// @returns `call`, or `CallId::INVALID` if the message could not be
    /// sent. A completion handed to a failed send is failed immediately.
    pub fn send(
        &mut self,
        call: CallId,
        message: SocketMessage,
        client: ClientId,
        completion: Option<Completion>,
        now: Instant,
    ) -> CallId {
        if completion.is_some() && client != ClientId::INTERNAL && !self.clients.contains_key( &client ) {
            tracing::warn!( "send: client {:?} is not registered", client );
            if let Some( completion ) = completion {
                completion.complete( Err( RequestError::UnknownClient ) );
            }
            return CallId::INVALID;
        }

        let intercepted = self.intercept( &message );

        if !intercepted && !self.transmit( &message, now ) {
            if let Some( completion ) = completion {
                completion.complete( Err( RequestError::NotConnected ) );
            }
            return CallId::INVALID;
        }

        if let Some( completion ) = completion {
            let entry = Entry {
                call,
                client,
                enqueued: now,
                intercepted,
                waiter: Waiter::External( completion ),
            };
            if let Some( replaced ) = self.correlation.insert( message.id().to_string(), entry ) {
                replaced.fail( RequestError::Canceled );
            }
        }

        if intercepted {
            tracing::debug!( "send: {} intercepted (call {:?})", message.name(), call );
        }

        call
    }


    /// Cancels one request. Its completion fires with `Canceled`.
    pub fn cancel_message( &mut self, call: CallId ) {
        if let Some( entry ) = self.correlation.take_call( call ) {
            entry.fail( RequestError::Canceled );
        }
    }


    /// Cancels every request owned by `client`.
    pub fn cancel_messages_for( &mut self, client: ClientId ) {
        for entry in self.correlation.drain_where( |entry| entry.client == client ) {
            entry.fail( RequestError::Canceled );
        }
    }


    /// Enables auto-reconnect and connects if not already connected.
    pub fn reconnect( &mut self ) {
        self.auto_reconnect = true;
        self.connect_if_not_connected();
    }


    /// Explicit user retry. Also clears a previous credential rejection.
    pub fn retry( &mut self ) {
        self.credentials_rejected = false;
        self.reconnect();
    }


    /// New credentials or address: drop the link and start over.
    pub fn reconfigure( &mut self, timing: Timing, now: Instant ) {
        self.timing = timing;
        self.credentials_rejected = false;
        self.disconnect_internal( true, now );
        self.reconnect();
    }


    /// Closes the socket and disables auto-reconnect.
    pub fn disconnect( &mut self, now: Instant ) {
        self.disconnect_internal( false, now );
    }


    /// The host reports that the network became available.
    pub fn network_available( &mut self ) {
        if self.auto_reconnect {
            self.connect_if_not_connected();
        }
    }


    /// Delivers the outcome of connect worker `attempt`.
    ///
    /// @returns true if the link was adopted; stale results return false
    pub fn on_connect_result( &mut self, attempt: u64, result: Result<LinkParts, ConnectError>, now: Instant ) -> bool {
        if attempt != self.attempt || self.state != ConnectionState::Connecting {
            tracing::debug!( "Ignoring stale connect result for attempt {}", attempt );
            return false;
        }

        match result {
            Ok( parts ) => {
                tracing::info!( "Connected (server api version {})", parts.api_version );
                self.link = Some( Link { id: attempt, outgoing: parts.outgoing } );
                self.server_api_version = parts.api_version;
                self.set_state( ConnectionState::Connected );
                self.ping( now );
                true
            }
            Err( ConnectError::InvalidCredentials ) => {
                self.reject_credentials( now );
                false
            }
            Err( e ) => {
                tracing::warn!( "Connection attempt {} failed: {}", attempt, e );
                self.disconnect_internal( true, now );
                false
            }
        }
    }


    /// Handles a frame received on link `link`.
    pub fn on_frame( &mut self, link: u64, text: &str, now: Instant ) {
        if self.link_id() != Some( link ) {
            return;
        }

        match SocketMessage::parse( text ) {
            Ok( message ) => self.dispatch( message, now ),
            Err( e ) => tracing::warn!( "Dropping malformed frame: {}", e ),
        }
    }


    /// Handles the close of link `link`.
    pub fn on_closed( &mut self, link: u64, code: Option<u16>, now: Instant ) {
        if self.link_id() != Some( link ) {
            return;
        }

        if code == Some( crate::protocol::CLOSE_POLICY_VIOLATION ) {
            self.reject_credentials( now );
        } else {
            tracing::info!( "Socket closed (code {:?})", code );
            self.disconnect_internal( true, now );
        }
    }


    /// Handles a synthetic response pushed by an interceptor.
    pub fn on_loopback( &mut self, message: SocketMessage, now: Instant ) {
        self.dispatch( message, now );
    }


    /// Earliest instant at which `on_tick` has work to do.
    pub fn next_deadline( &self ) -> Option<Instant> {
        [
            self.sweep_at,
            self.reconnect_at,
            self.failsafe_at,
            self.teardown_at,
            self.ping_at,
            self.ping_deadline,
        ]
        .into_iter()
        .flatten()
        .min()
    }


    /// Fires every timer that is due.
    pub fn on_tick( &mut self, now: Instant ) {
        if due( self.sweep_at, now ) {
            self.sweep_at = Some( now + self.timing.sweep_interval );
            let expired = self.correlation.expire( now, self.timing.request_timeout );
            if !expired.is_empty() {
                tracing::info!( "Sweeping {} expired requests", expired.len() );
            }
            for entry in expired {
                entry.fail( RequestError::TimedOut );
            }
        }

        if due( self.ping_deadline, now ) {
            tracing::warn!( "Keepalive timed out" );
            self.ping_deadline = None;
            self.drop_internal_entries();
            let auto = self.state == ConnectionState::Connected || self.auto_reconnect;
            self.disconnect_internal( auto, now );
        }

        if due( self.ping_at, now ) {
            self.ping_at = None;
            self.ping( now );
        }

        if due( self.teardown_at, now ) {
            self.teardown_at = None;
            tracing::info!( "No clients left; disconnecting" );
            self.disconnect_internal( false, now );
        }

        if due( self.reconnect_at, now ) {
            self.reconnect_at = None;
            if self.state == ConnectionState::Disconnected && self.auto_reconnect {
                self.reconnect();
            }
        }

        if due( self.failsafe_at, now ) {
            self.failsafe_at = None;
            if self.state == ConnectionState::Disconnected && self.auto_reconnect {
                self.reconnect();
            }
        }
    }


    fn connect_if_not_connected( &mut self ) {
        if self.state != ConnectionState::Disconnected {
            return;
        }

        self.reconnect_at = None;

        if self.clients.is_empty() {
            return;
        }

        self.teardown_at = None;
        self.attempt += 1;
        tracing::info!( "Connecting (attempt {})", self.attempt );
        self.set_state( ConnectionState::Connecting );
        self.effects.push( Effect::Connect { attempt: self.attempt } );
    }


    fn disconnect_internal( &mut self, auto_reconnect: bool, now: Instant ) {
        // Invalidates any worker still in flight.
        self.attempt += 1;
        self.auto_reconnect = auto_reconnect;
        self.link = None;
        self.ping_at = None;
        self.ping_deadline = None;
        self.server_api_version = -1;

        for entry in self.correlation.drain_where( |entry| !entry.intercepted ) {
            entry.fail( RequestError::Canceled );
        }

        self.set_state( ConnectionState::Disconnected );

        if auto_reconnect {
            self.reconnect_at = Some( now + self.timing.reconnect_backoff );
        } else {
            self.reconnect_at = None;
        }
    }


    fn reject_credentials( &mut self, now: Instant ) {
        tracing::warn!( "Server rejected credentials; auto-reconnect disabled" );
        self.credentials_rejected = true;
        self.disconnect_internal( false, now );
        self.broadcast( ClientEvent::InvalidCredentials );
    }


    fn intercept( &mut self, message: &SocketMessage ) -> bool {
        let responder = &self.responder;
        self.interceptors
            .iter_mut()
            .any( |( _, interceptor )| interceptor.intercept( message, responder ) )
    }


    /// Writes a frame. A dead writer forces a disconnect.
    fn transmit( &mut self, message: &SocketMessage, now: Instant ) -> bool {
        let Some( link ) = self.link.as_ref() else {
            return false;
        };

        if link.outgoing.send( message.to_string() ).is_ok() {
            return true;
        }

        tracing::warn!( "Socket writer is gone; forcing reconnect" );
        self.disconnect_internal( true, now );
        false
    }


    fn dispatch( &mut self, message: SocketMessage, now: Instant ) {
        if message.kind() != MessageType::Broadcast {
            if let Some( entry ) = self.correlation.take( message.id() ) {
                match entry.waiter {
                    Waiter::Keepalive => self.on_pong( now ),
                    Waiter::External( completion ) => {
                        let result = match message.error() {
                            Some( error ) => Err( RequestError::Server( error.to_string() ) ),
                            None => Ok( message ),
                        };
                        completion.complete( result );
                    }
                }
                return;
            }
        }

        tracing::trace!( "Dispatching {} to {} clients", message.name(), self.clients.len() );
        self.broadcast( ClientEvent::Message( message ) );
    }


    fn ping( &mut self, now: Instant ) {
        if self.state != ConnectionState::Connected {
            return;
        }

        self.drop_internal_entries();

        let ping = MessageBuilder::request( request::PING ).build();
        if !self.transmit( &ping, now ) {
            return;
        }

        let entry = Entry {
            call: CallId( self.call_ids.next() ),
            client: ClientId::INTERNAL,
            enqueued: now,
            intercepted: false,
            waiter: Waiter::Keepalive,
        };
        self.correlation.insert( ping.id().to_string(), entry );
        self.ping_deadline = Some( now + self.timing.keepalive_timeout() );
    }


    fn on_pong( &mut self, now: Instant ) {
        self.ping_deadline = None;
        self.ping_at = Some( now + self.timing.ping_interval );
    }


    fn drop_internal_entries( &mut self ) {
        for entry in self.correlation.drain_where( |entry| entry.client == ClientId::INTERNAL ) {
            entry.fail( RequestError::Canceled );
        }
    }


    fn set_state( &mut self, new: ConnectionState ) {
        let old = self.state;
        if old == new {
            return;
        }

        tracing::info!( "Connection state: {:?} -> {:?}", old, new );
        self.state = new;
        self.broadcast( ClientEvent::StateChanged { new, old } );
    }


    fn notify( &self, client: ClientId, event: ClientEvent ) {
        if let Some( tx ) = self.clients.get( &client ) {
            let _ = tx.send( event );
        }
    }


    fn broadcast( &self, event: ClientEvent ) {
        for tx in self.clients.values() {
            let _ = tx.send( event.clone() );
        }
    }
}


fn due( deadline: Option<Instant>, now: Instant ) -> bool {
    matches!( deadline, Some( at ) if at <= now )
}


/// Reads `environment.api_version` from an authenticate response.
pub( crate ) fn api_version_of( message: &SocketMessage ) -> i64 {
    message
        .get_object( key::ENVIRONMENT )
        .and_then( |env| env.get( key::API_VERSION ) )
        .and_then( Value::as_i64 )
        .unwrap_or( -1 )
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::sync::{ Arc, Mutex };
    use std::time::Duration;

    use tokio::sync::mpsc::{ unbounded_channel, UnboundedReceiver };


    type Outcomes = Arc<Mutex<Vec<Result<SocketMessage, RequestError>>>>;


    struct Harness {
        manager: ConnectionManager,
        start: Instant,
        loopback: UnboundedReceiver<SocketMessage>,
    }


    impl Harness {
        fn new() -> Self {
            let start = Instant::now();
            let ( tx, loopback ) = unbounded_channel();
            Self {
                manager: ConnectionManager::new( Timing::default(), tx, start ),
                start,
                loopback,
            }
        }


        fn at( &self, millis: u64 ) -> Instant {
            self.start + Duration::from_millis( millis )
        }


        fn register( &mut self, id: u64 ) -> UnboundedReceiver<ClientEvent> {
            let ( tx, rx ) = unbounded_channel();
            let now = self.at( 0 );
            self.manager.register_client( ClientId( id ), tx, now );
            rx
        }


        /// Registers a client and completes the pending connect attempt.
        fn connect( &mut self ) -> ( UnboundedReceiver<ClientEvent>, UnboundedReceiver<String> ) {
            let events = self.register( 1 );
            let attempt = match self.manager.take_effects().as_slice() {
                [ Effect::Connect { attempt } ] => *attempt,
                other => panic!( "unexpected effects {:?}", other ),
            };
            let ( outgoing, wire ) = unbounded_channel();
            let now = self.at( 0 );
            assert!( self.manager.on_connect_result( attempt, Ok( LinkParts { api_version: 20, outgoing } ), now ) );
            ( events, wire )
        }


        fn link( &self ) -> u64 {
            self.manager.link_id().unwrap()
        }
    }


    fn recorder() -> ( Outcomes, Completion ) {
        let outcomes: Outcomes = Arc::new( Mutex::new( Vec::new() ) );
        let sink = Arc::clone( &outcomes );
        let completion = Completion::Callback( Box::new( move |result| {
            sink.lock().unwrap().push( result );
        }));
        ( outcomes, completion )
    }


    fn response_to( wire_text: &str, error: Option<&str> ) -> String {
        let request = SocketMessage::parse( wire_text ).unwrap();
        let mut builder = MessageBuilder::respond_to( &request );
        if let Some( error ) = error {
            builder = builder.add_option( key::ERROR, error );
        }
        builder.build().to_string()
    }


    fn drain_wire( wire: &mut UnboundedReceiver<String> ) -> Vec<SocketMessage> {
        let mut frames = Vec::new();
        while let Ok( text ) = wire.try_recv() {
            frames.push( SocketMessage::parse( &text ).unwrap() );
        }
        frames
    }


    #[test]
    fn test_send_while_disconnected_is_rejected() {
        let mut h = Harness::new();
        let _events = h.register( 1 );
        h.manager.disconnect( h.at( 0 ) );

        let ( outcomes, completion ) = recorder();
        let message = MessageBuilder::request( "query_tracks" ).build();
        let call = h.manager.send( CallId( 5 ), message, ClientId( 1 ), Some( completion ), h.at( 1 ) );

        assert_eq!( call, CallId::INVALID );
        assert_eq!( h.manager.pending_requests(), 0 );
        assert_eq!( *outcomes.lock().unwrap(), vec![ Err( RequestError::NotConnected ) ] );
    }


    #[test]
    fn test_unregistered_client_is_rejected() {
        let mut h = Harness::new();
        let ( _events, _wire ) = h.connect();
        let ( outcomes, completion ) = recorder();
        let message = MessageBuilder::request( "query_tracks" ).build();

        let call = h.manager.send( CallId( 5 ), message, ClientId( 99 ), Some( completion ), h.at( 1 ) );

        assert_eq!( call, CallId::INVALID );
        assert_eq!( *outcomes.lock().unwrap(), vec![ Err( RequestError::UnknownClient ) ] );
    }


    #[test]
    fn test_registration_bootstraps_state_and_connects() {
        let mut h = Harness::new();
        let mut events = h.register( 1 );

        assert_eq!( h.manager.state(), ConnectionState::Connecting );
        assert_eq!( h.manager.take_effects().len(), 1 );

        let mut seen = Vec::new();
        while let Ok( event ) = events.try_recv() {
            seen.push( event );
        }
        assert!( seen.contains( &ClientEvent::StateChanged {
            new: ConnectionState::Connecting,
            old: ConnectionState::Connecting,
        }));
    }


    #[test]
    fn test_connect_sends_ping_and_response_completes_once() {
        let mut h = Harness::new();
        let ( _events, mut wire ) = h.connect();
        assert_eq!( h.manager.state(), ConnectionState::Connected );
        assert!( h.manager.should_upgrade() );

        let frames = drain_wire( &mut wire );
        assert_eq!( frames.len(), 1 );
        assert_eq!( frames[ 0 ].name(), "ping" );

        let ( outcomes, completion ) = recorder();
        let message = MessageBuilder::request( "query_tracks" ).build();
        let call = h.manager.send( CallId( 7 ), message, ClientId( 1 ), Some( completion ), h.at( 10 ) );
        assert_eq!( call, CallId( 7 ) );

        let sent = drain_wire( &mut wire ).pop().unwrap().to_string();
        let reply = response_to( &sent, None );
        let link = h.link();
        h.manager.on_frame( link, &reply, h.at( 20 ) );
        h.manager.on_frame( link, &reply, h.at( 21 ) );

        let outcomes = outcomes.lock().unwrap();
        assert_eq!( outcomes.len(), 1 );
        assert!( outcomes[ 0 ].is_ok() );
    }


    #[test]
    fn test_error_response_routes_to_error() {
        let mut h = Harness::new();
        let ( _events, mut wire ) = h.connect();
        drain_wire( &mut wire );

        let ( outcomes, completion ) = recorder();
        let message = MessageBuilder::request( "query_tracks" ).build();
        h.manager.send( CallId( 3 ), message, ClientId( 1 ), Some( completion ), h.at( 10 ) );

        let sent = drain_wire( &mut wire ).pop().unwrap().to_string();
        let link = h.link();
        h.manager.on_frame( link, &response_to( &sent, Some( "invalid request" ) ), h.at( 20 ) );

        assert_eq!(
            *outcomes.lock().unwrap(),
            vec![ Err( RequestError::Server( "invalid request".into() ) ) ]
        );
    }


    #[test]
    fn test_keepalive_timeout_disconnects_and_schedules_reconnect() {
        let mut h = Harness::new();
        let ( _events, mut wire ) = h.connect();
        drain_wire( &mut wire );

        h.manager.on_tick( h.at( 6999 ) );
        assert_eq!( h.manager.state(), ConnectionState::Connected );

        h.manager.on_tick( h.at( 7000 ) );
        assert_eq!( h.manager.state(), ConnectionState::Disconnected );
        assert!( h.manager.take_effects().is_empty() );

        h.manager.on_tick( h.at( 8999 ) );
        assert_eq!( h.manager.state(), ConnectionState::Disconnected );

        h.manager.on_tick( h.at( 9000 ) );
        assert_eq!( h.manager.state(), ConnectionState::Connecting );
        assert!( matches!( h.manager.take_effects().as_slice(), [ Effect::Connect { .. } ] ) );
    }


    #[test]
    fn test_keepalive_reply_schedules_next_ping() {
        let mut h = Harness::new();
        let ( _events, mut wire ) = h.connect();
        let ping = drain_wire( &mut wire ).pop().unwrap().to_string();

        let link = h.link();
        h.manager.on_frame( link, &response_to( &ping, None ), h.at( 100 ) );
        assert_eq!( h.manager.pending_requests(), 0 );

        h.manager.on_tick( h.at( 3599 ) );
        assert!( drain_wire( &mut wire ).is_empty() );

        h.manager.on_tick( h.at( 3600 ) );
        let frames = drain_wire( &mut wire );
        assert_eq!( frames.len(), 1 );
        assert_eq!( frames[ 0 ].name(), "ping" );

        // Well past the first ping's deadline, but the second one is fresh.
        h.manager.on_tick( h.at( 8000 ) );
        assert_eq!( h.manager.state(), ConnectionState::Connected );
    }


    #[test]
    fn test_disconnect_preserves_intercepted_entries() {
        let mut h = Harness::new();
        let ( _events, mut wire ) = h.connect();
        drain_wire( &mut wire );

        h.manager.add_interceptor( InterceptorId( 1 ), Box::new( |message: &SocketMessage, _: &Responder| {
            message.name() == "offline_query"
        }));

        let ( local, local_completion ) = recorder();
        let ( remote, remote_completion ) = recorder();
        let offline = MessageBuilder::request( "offline_query" ).build();
        let online = MessageBuilder::request( "query_tracks" ).build();
        h.manager.send( CallId( 1 ), offline, ClientId( 1 ), Some( local_completion ), h.at( 1 ) );
        h.manager.send( CallId( 2 ), online, ClientId( 1 ), Some( remote_completion ), h.at( 1 ) );

        let link = h.link();
        h.manager.on_closed( link, Some( 1006 ), h.at( 2 ) );

        assert_eq!( *remote.lock().unwrap(), vec![ Err( RequestError::Canceled ) ] );
        assert!( local.lock().unwrap().is_empty() );
        assert_eq!( h.manager.pending_requests(), 1 );
    }


    #[test]
    fn test_interceptor_answers_through_loopback() {
        let mut h = Harness::new();
        let ( _events, mut wire ) = h.connect();
        drain_wire( &mut wire );

        h.manager.add_interceptor( InterceptorId( 1 ), Box::new( |message: &SocketMessage, responder: &Responder| {
            responder.respond( MessageBuilder::respond_to( message ).add_option( "count", 3 ).build() );
            true
        }));
        h.manager.add_interceptor( InterceptorId( 2 ), Box::new( |_: &SocketMessage, _: &Responder| -> bool {
            panic!( "second interceptor must not run" )
        }));

        let ( outcomes, completion ) = recorder();
        let message = MessageBuilder::request( "query_tracks" ).build();
        h.manager.send( CallId( 1 ), message, ClientId( 1 ), Some( completion ), h.at( 1 ) );

        assert!( drain_wire( &mut wire ).is_empty() );
        assert!( outcomes.lock().unwrap().is_empty() );

        let synthetic = h.loopback.try_recv().unwrap();
        h.manager.on_loopback( synthetic, h.at( 2 ) );

        let outcomes = outcomes.lock().unwrap();
        assert_eq!( outcomes.len(), 1 );
        assert_eq!( outcomes[ 0 ].as_ref().unwrap().get_i32( "count", 0 ), 3 );
    }


    #[test]
    fn test_intercepted_send_works_while_disconnected() {
        let mut h = Harness::new();
        let _events = h.register( 1 );
        h.manager.disconnect( h.at( 0 ) );
        h.manager.add_interceptor( InterceptorId( 1 ), Box::new( |_: &SocketMessage, _: &Responder| true ) );

        let ( _outcomes, completion ) = recorder();
        let message = MessageBuilder::request( "query_tracks" ).build();
        let call = h.manager.send( CallId( 4 ), message, ClientId( 1 ), Some( completion ), h.at( 1 ) );

        assert_eq!( call, CallId( 4 ) );
        assert_eq!( h.manager.pending_requests(), 1 );
    }


    #[test]
    fn test_stale_connect_result_is_ignored() {
        let mut h = Harness::new();
        let _events = h.register( 1 );
        let first = match h.manager.take_effects().as_slice() {
            [ Effect::Connect { attempt } ] => *attempt,
            _ => unreachable!(),
        };

        // A failed attempt schedules a retry; the retry supersedes `first`.
        h.manager.on_connect_result( first, Err( ConnectError::Timeout ), h.at( 10 ) );
        h.manager.on_tick( h.at( 2010 ) );
        assert_eq!( h.manager.state(), ConnectionState::Connecting );

        let ( outgoing, _wire ) = unbounded_channel();
        let adopted = h.manager.on_connect_result( first, Ok( LinkParts { api_version: 1, outgoing } ), h.at( 2020 ) );
        assert!( !adopted );
        assert_eq!( h.manager.state(), ConnectionState::Connecting );
    }


    #[test]
    fn test_policy_violation_reports_invalid_credentials() {
        let mut h = Harness::new();
        let ( mut events, _wire ) = h.connect();
        while events.try_recv().is_ok() {}

        let link = h.link();
        h.manager.on_closed( link, Some( 1008 ), h.at( 5 ) );

        assert_eq!( h.manager.state(), ConnectionState::Disconnected );
        let mut seen = Vec::new();
        while let Ok( event ) = events.try_recv() {
            seen.push( event );
        }
        assert!( seen.contains( &ClientEvent::InvalidCredentials ) );

        h.manager.on_tick( h.at( 60_000 ) );
        assert_eq!( h.manager.state(), ConnectionState::Disconnected );
        assert!( h.manager.take_effects().is_empty() );

        // New clients do not retry rejected credentials.
        let _late = h.register( 2 );
        assert_eq!( h.manager.state(), ConnectionState::Disconnected );
    }


    #[test]
    fn test_stale_requests_are_swept() {
        let mut h = Harness::new();
        let ( _events, mut wire ) = h.connect();

        let ( outcomes, completion ) = recorder();
        let message = MessageBuilder::request( "query_tracks" ).build();
        h.manager.send( CallId( 9 ), message, ClientId( 1 ), Some( completion ), h.at( 0 ) );

        // Keep the link alive while time passes.
        let mut now = 0;
        while now < 35_000 {
            now += 1000;
            for frame in drain_wire( &mut wire ) {
                if frame.name() == "ping" {
                    let link = h.link();
                    h.manager.on_frame( link, &response_to( &frame.to_string(), None ), h.at( now ) );
                }
            }
            h.manager.on_tick( h.at( now ) );
        }

        assert_eq!( *outcomes.lock().unwrap(), vec![ Err( RequestError::TimedOut ) ] );
    }


    #[test]
    fn test_last_client_leaving_tears_down_after_grace() {
        let mut h = Harness::new();
        let ( _events, _wire ) = h.connect();

        h.manager.deregister_client( ClientId( 1 ), h.at( 100 ) );
        assert_eq!( h.manager.state(), ConnectionState::Connected );

        h.manager.on_tick( h.at( 10_100 ) );
        assert_eq!( h.manager.state(), ConnectionState::Disconnected );

        h.manager.on_tick( h.at( 20_000 ) );
        assert!( h.manager.take_effects().is_empty() );
    }


    #[test]
    fn test_cancel_fires_once() {
        let mut h = Harness::new();
        let ( _events, mut wire ) = h.connect();
        drain_wire( &mut wire );

        let ( outcomes, completion ) = recorder();
        let message = MessageBuilder::request( "query_tracks" ).build();
        let call = h.manager.send( CallId( 11 ), message, ClientId( 1 ), Some( completion ), h.at( 1 ) );
        let sent = drain_wire( &mut wire ).pop().unwrap().to_string();

        h.manager.cancel_message( call );
        h.manager.cancel_message( call );
        let link = h.link();
        h.manager.on_frame( link, &response_to( &sent, None ), h.at( 2 ) );

        assert_eq!( *outcomes.lock().unwrap(), vec![ Err( RequestError::Canceled ) ] );
    }


    #[test]
    fn test_dead_writer_forces_disconnect() {
        let mut h = Harness::new();
        let ( _events, wire ) = h.connect();
        drop( wire );

        let message = MessageBuilder::request( "query_tracks" ).build();
        let call = h.manager.send( CallId( 2 ), message, ClientId( 1 ), None, h.at( 1 ) );

        assert_eq!( call, CallId::INVALID );
        assert_eq!( h.manager.state(), ConnectionState::Disconnected );
    }


    #[test]
    fn test_broadcasts_reach_every_client() {
        let mut h = Harness::new();
        let ( mut first, _wire ) = h.connect();
        let mut second = h.register( 2 );
        while first.try_recv().is_ok() {}
        while second.try_recv().is_ok() {}

        let broadcast = MessageBuilder::broadcast( "play_queue_changed" ).build();
        let link = h.link();
        h.manager.on_frame( link, &broadcast.to_string(), h.at( 1 ) );

        assert!( matches!( first.try_recv(), Ok( ClientEvent::Message( m ) ) if m.name() == "play_queue_changed" ) );
        assert!( matches!( second.try_recv(), Ok( ClientEvent::Message( _ ) ) ) );
    }


    #[test]
    fn test_api_version_extraction() {
        let message = SocketMessage::parse(
            r#"{"name":"authenticate","id":"1","type":"response","options":{"environment":{"api_version":16}}}"#
        ).unwrap();
        assert_eq!( api_version_of( &message ), 16 );
    }
}
