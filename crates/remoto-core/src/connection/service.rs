//! Connection service
//!
//! Runs a `ConnectionManager` on its own task. Commands, socket frames,
//! interceptor responses and connect-worker results all arrive through
//! channels and are applied one at a time, so the manager is never touched
//! concurrently. `ConnectionHandle` is the cloneable front door.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ Context, Poll };
use std::time::Instant;

use tokio::sync::mpsc::{ unbounded_channel, UnboundedReceiver, UnboundedSender };
use tokio::sync::{ oneshot, watch };
use tokio::task::JoinHandle;

use super::correlation::Completion;
use super::manager::{ ConnectionManager, Effect, Interceptor, LinkParts };
use super::transport::{ Connector, Established, TransportEvent };
use super::{
    CallId, ClientEvent, ClientId, ConnectionState, IdAllocator, InterceptorId, ResponseCallback,
};
use crate::config::ConnectionConfig;
use crate::error::{ ConnectError, RequestError };
use crate::message::SocketMessage;


/// Snapshot of the connection published after every turn.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Default )]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub api_version: i64,
    pub should_upgrade: bool,
}


enum Command {
    Register { client: ClientId, events: UnboundedSender<ClientEvent> },
    Deregister { client: ClientId },
    Send {
        call: CallId,
        message: SocketMessage,
        client: ClientId,
        completion: Option<Completion>,
        accepted: Option<oneshot::Sender<CallId>>,
    },
    Cancel { call: CallId },
    CancelFor { client: ClientId },
    AddInterceptor { id: InterceptorId, interceptor: Box<dyn Interceptor> },
    RemoveInterceptor { id: InterceptorId },
    Reconnect,
    Disconnect,
    NetworkAvailable,
    Reconfigure( ConnectionConfig ),
    Shutdown,
}


/// Cloneable access to a running connection service.
#[derive( Clone )]
pub struct ConnectionHandle {
    commands: UnboundedSender<Command>,
    call_ids: IdAllocator,
    client_ids: IdAllocator,
    interceptor_ids: IdAllocator,
    status: watch::Receiver<ConnectionStatus>,
}


impl ConnectionHandle {
    /// Starts the service on the current tokio runtime.
    ///
    /// @param config - Server address, credentials and timing
    /// @param connector - Opens authenticated sockets
    ///
    /// @returns A handle; the service stops when `shutdown` is called or every
    /// handle is dropped
    pub fn spawn<C: Connector>( config: ConnectionConfig, connector: C ) -> Self {
        let ( commands_tx, commands_rx ) = unbounded_channel();
        let ( loopback_tx, loopback_rx ) = unbounded_channel();
        let ( results_tx, results_rx ) = unbounded_channel();
        let ( status_tx, status_rx ) = watch::channel( ConnectionStatus::default() );

        let manager = ConnectionManager::new( config.timing.clone(), loopback_tx, Instant::now() );
        let call_ids = manager.call_ids();

        let driver = Driver {
            manager,
            config,
            connector: Arc::new( connector ),
            commands: commands_rx,
            loopback: loopback_rx,
            results_tx,
            results: results_rx,
            link: None,
            worker: None,
            status: status_tx,
        };
        tokio::spawn( driver.run() );

        Self {
            commands: commands_tx,
            call_ids,
            client_ids: IdAllocator::default(),
            interceptor_ids: IdAllocator::default(),
            status: status_rx,
        }
    }


    /// Allocates a client identity. Register it to start receiving events.
    pub fn new_client_id( &self ) -> ClientId {
        ClientId( self.client_ids.next() )
    }


    /// Registers interest in the connection. The first registration connects.
    pub fn register_client( &self, client: ClientId, events: UnboundedSender<ClientEvent> ) {
        self.command( Command::Register { client, events } );
    }


    /// Drops interest. Pending requests of the client are canceled.
    pub fn deregister_client( &self, client: ClientId ) {
        self.command( Command::Deregister { client } );
    }


    /// Sends a message, optionally with a callback for the response.
    ///
    /// @returns The call id, or `CallId::INVALID` if the message could not
    /// be sent (the callback then fires with the reason)
    pub async fn send(
        &self,
        message: SocketMessage,
        client: ClientId,
        callback: Option<ResponseCallback>,
    ) -> CallId {
        let call = CallId( self.call_ids.next() );
        let ( accepted_tx, accepted_rx ) = oneshot::channel();

        let command = Command::Send {
            call,
            message,
            client,
            completion: callback.map( Completion::Callback ),
            accepted: Some( accepted_tx ),
        };

        if let Err( rejected ) = self.commands.send( command ) {
            if let Command::Send { completion: Some( completion ), .. } = rejected.0 {
                completion.complete( Err( RequestError::ServiceStopped ) );
            }
            return CallId::INVALID;
        }

        accepted_rx.await.unwrap_or( CallId::INVALID )
    }


    /// Sends a request and returns a future resolving to its response.
    /// Dropping the future before it resolves cancels the request.
    pub fn observe( &self, message: SocketMessage, client: ClientId ) -> PendingResponse {
        let call = CallId( self.call_ids.next() );
        let ( tx, rx ) = oneshot::channel();

        let command = Command::Send {
            call,
            message,
            client,
            completion: Some( Completion::Channel( tx ) ),
            accepted: None,
        };

        let done = self.commands.send( command ).is_err();

        PendingResponse {
            call,
            response: rx,
            commands: self.commands.clone(),
            done,
        }
    }


    /// Sends a request and waits for its response.
    pub async fn request( &self, message: SocketMessage, client: ClientId ) -> Result<SocketMessage, RequestError> {
        self.observe( message, client ).await
    }


    pub fn cancel_message( &self, call: CallId ) {
        self.command( Command::Cancel { call } );
    }


    pub fn cancel_messages_for( &self, client: ClientId ) {
        self.command( Command::CancelFor { client } );
    }


    /// Installs an interceptor after every existing one.
    pub fn add_interceptor<I: Interceptor + 'static>( &self, interceptor: I ) -> InterceptorId {
        let id = InterceptorId( self.interceptor_ids.next() );
        self.command( Command::AddInterceptor { id, interceptor: Box::new( interceptor ) } );
        id
    }


    pub fn remove_interceptor( &self, id: InterceptorId ) {
        self.command( Command::RemoveInterceptor { id } );
    }


    /// Enables auto-reconnect and connects if needed. Also retries after a
    /// credential rejection.
    pub fn reconnect( &self ) {
        self.command( Command::Reconnect );
    }


    /// Closes the socket and disables auto-reconnect.
    pub fn disconnect( &self ) {
        self.command( Command::Disconnect );
    }


    /// Signals that the network came back.
    pub fn network_available( &self ) {
        self.command( Command::NetworkAvailable );
    }


    /// Replaces address/credentials and reconnects.
    pub fn reconfigure( &self, config: ConnectionConfig ) {
        self.command( Command::Reconfigure( config ) );
    }


    pub fn shutdown( &self ) {
        self.command( Command::Shutdown );
    }


    pub fn status( &self ) -> ConnectionStatus {
        *self.status.borrow()
    }


    pub fn state( &self ) -> ConnectionState {
        self.status.borrow().state
    }


    /// Receiver that changes whenever the connection status does.
    pub fn subscribe( &self ) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }


    fn command( &self, command: Command ) {
        if self.commands.send( command ).is_err() {
            tracing::debug!( "Connection service is not running" );
        }
    }
}


/// Response to a request sent with `ConnectionHandle::observe`.
pub struct PendingResponse {
    call: CallId,
    response: oneshot::Receiver<Result<SocketMessage, RequestError>>,
    commands: UnboundedSender<Command>,
    done: bool,
}


impl PendingResponse {
    pub fn call_id( &self ) -> CallId {
        self.call
    }
}


impl Future for PendingResponse {
    type Output = Result<SocketMessage, RequestError>;


    fn poll( mut self: Pin<&mut Self>, cx: &mut Context<'_> ) -> Poll<Self::Output> {
        match Pin::new( &mut self.response ).poll( cx ) {
            Poll::Ready( result ) => {
                self.done = true;
                Poll::Ready( result.unwrap_or( Err( RequestError::ServiceStopped ) ) )
            }
            Poll::Pending => Poll::Pending,
        }
    }
}


impl Drop for PendingResponse {
    fn drop( &mut self ) {
        if !self.done {
            let _ = self.commands.send( Command::Cancel { call: self.call } );
        }
    }
}


type ConnectResult = ( u64, Result<Established, ConnectError> );


struct Driver {
    manager: ConnectionManager,
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    commands: UnboundedReceiver<Command>,
    loopback: UnboundedReceiver<SocketMessage>,
    results_tx: UnboundedSender<ConnectResult>,
    results: UnboundedReceiver<ConnectResult>,
    link: Option<( u64, UnboundedReceiver<TransportEvent> )>,
    worker: Option<JoinHandle<()>>,
    status: watch::Sender<ConnectionStatus>,
}


impl Driver {
    async fn run( mut self ) {
        tracing::debug!( "Connection service started" );

        loop {
            self.after_turn();

            let deadline = self.manager.next_deadline();
            let sleep = async {
                match deadline {
                    Some( at ) => tokio::time::sleep_until( tokio::time::Instant::from_std( at ) ).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        None | Some( Command::Shutdown ) => break,
                        Some( command ) => self.on_command( command ),
                    }
                }
                Some( message ) = self.loopback.recv() => {
                    self.manager.on_loopback( message, Instant::now() );
                }
                Some(( attempt, result )) = self.results.recv() => {
                    self.on_connect_result( attempt, result );
                }
                ( link, event ) = next_transport_event( &mut self.link ) => {
                    let now = Instant::now();
                    match event {
                        Some( TransportEvent::Frame( text ) ) => self.manager.on_frame( link, &text, now ),
                        Some( TransportEvent::Closed { code } ) => self.manager.on_closed( link, code, now ),
                        None => self.manager.on_closed( link, None, now ),
                    }
                }
                _ = sleep => {
                    self.manager.on_tick( Instant::now() );
                }
            }
        }

        if let Some( worker ) = self.worker.take() {
            worker.abort();
        }
        self.manager.disconnect( Instant::now() );
        self.publish();
        tracing::debug!( "Connection service stopped" );
    }


    fn on_command( &mut self, command: Command ) {
        let now = Instant::now();
        match command {
            Command::Register { client, events } => self.manager.register_client( client, events, now ),
            Command::Deregister { client } => self.manager.deregister_client( client, now ),
            Command::Send { call, message, client, completion, accepted } => {
                let call = self.manager.send( call, message, client, completion, now );
                if let Some( accepted ) = accepted {
                    let _ = accepted.send( call );
                }
            }
            Command::Cancel { call } => self.manager.cancel_message( call ),
            Command::CancelFor { client } => self.manager.cancel_messages_for( client ),
            Command::AddInterceptor { id, interceptor } => self.manager.add_interceptor( id, interceptor ),
            Command::RemoveInterceptor { id } => self.manager.remove_interceptor( id ),
            Command::Reconnect => self.manager.retry(),
            Command::Disconnect => self.manager.disconnect( now ),
            Command::NetworkAvailable => self.manager.network_available(),
            Command::Reconfigure( config ) => {
                let timing = config.timing.clone();
                self.config = config;
                self.manager.reconfigure( timing, now );
            }
            Command::Shutdown => {}
        }
    }


    fn on_connect_result( &mut self, attempt: u64, result: Result<Established, ConnectError> ) {
        let now = Instant::now();
        match result {
            Ok( established ) => {
                let parts = LinkParts {
                    api_version: established.api_version,
                    outgoing: established.outgoing,
                };
                if self.manager.on_connect_result( attempt, Ok( parts ), now ) {
                    self.link = Some(( attempt, established.incoming ));
                }
            }
            Err( e ) => {
                self.manager.on_connect_result( attempt, Err( e ), now );
            }
        }
    }


    /// Applies effects, drops receivers of dead links and publishes status.
    fn after_turn( &mut self ) {
        for effect in self.manager.take_effects() {
            match effect {
                Effect::Connect { attempt } => self.start_worker( attempt ),
            }
        }

        let live = self.manager.link_id();
        if self.link.as_ref().map( |( id, _ )| Some( *id ) != live ).unwrap_or( false ) {
            self.link = None;
        }

        self.publish();
    }


    fn start_worker( &mut self, attempt: u64 ) {
        if let Some( previous ) = self.worker.take() {
            previous.abort();
        }

        let connector = Arc::clone( &self.connector );
        let config = self.config.clone();
        let results = self.results_tx.clone();

        self.worker = Some( tokio::spawn( async move {
            let result = connector.connect( &config ).await;
            let _ = results.send(( attempt, result ));
        }));
    }


    fn publish( &self ) {
        let status = ConnectionStatus {
            state: self.manager.state(),
            api_version: self.manager.server_api_version(),
            should_upgrade: self.manager.should_upgrade(),
        };
        self.status.send_if_modified( |current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}


/// Waits for the next event of the live link; pends forever without one.
async fn next_transport_event(
    link: &mut Option<( u64, UnboundedReceiver<TransportEvent> )>,
) -> ( u64, Option<TransportEvent> ) {
    match link {
        Some(( id, incoming )) => ( *id, incoming.recv().await ),
        None => std::future::pending().await,
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::sync::atomic::{ AtomicUsize, Ordering };
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::message::MessageBuilder;
    use crate::protocol::request;


    /// Connector whose "server" echoes every request as a successful response
    /// with `echo: true`.
    struct EchoConnector {
        connects: Arc<AtomicUsize>,
        fail: bool,
    }


    #[async_trait]
    impl Connector for EchoConnector {
        async fn connect( &self, _config: &ConnectionConfig ) -> Result<Established, ConnectError> {
            self.connects.fetch_add( 1, Ordering::SeqCst );
            if self.fail {
                return Err( ConnectError::InvalidCredentials );
            }

            let ( outgoing, mut wire ) = unbounded_channel::<String>();
            let ( server, incoming ) = unbounded_channel();
            tokio::spawn( async move {
                while let Some( text ) = wire.recv().await {
                    let Ok( request ) = SocketMessage::parse( &text ) else { continue };
                    let response = MessageBuilder::respond_to( &request ).add_option( "echo", true ).build();
                    if server.send( TransportEvent::Frame( response.to_string() ) ).is_err() {
                        break;
                    }
                }
            });

            Ok( Established { api_version: 20, outgoing, incoming } )
        }
    }


    fn echo( fail: bool ) -> ( ConnectionHandle, Arc<AtomicUsize> ) {
        let connects = Arc::new( AtomicUsize::new( 0 ) );
        let connector = EchoConnector { connects: Arc::clone( &connects ), fail };
        ( ConnectionHandle::spawn( ConnectionConfig::default(), connector ), connects )
    }


    async fn wait_for_state( handle: &ConnectionHandle, state: ConnectionState ) {
        let mut rx = handle.subscribe();
        tokio::time::timeout( Duration::from_secs( 2 ), rx.wait_for( |s| s.state == state ) )
            .await
            .expect( "state not reached" )
            .expect( "service stopped" );
    }


    #[tokio::test]
    async fn test_request_round_trip() {
        let ( handle, connects ) = echo( false );
        let client = handle.new_client_id();
        let ( tx, _rx ) = unbounded_channel();
        handle.register_client( client, tx );
        wait_for_state( &handle, ConnectionState::Connected ).await;

        let response = handle
            .request( MessageBuilder::request( request::QUERY_TRACKS ).build(), client )
            .await
            .unwrap();
        assert!( response.get_bool( "echo", false ) );
        assert_eq!( connects.load( Ordering::SeqCst ), 1 );
        assert_eq!( handle.status().api_version, 20 );
    }


    #[tokio::test]
    async fn test_send_with_callback() {
        let ( handle, _ ) = echo( false );
        let client = handle.new_client_id();
        let ( tx, _rx ) = unbounded_channel();
        handle.register_client( client, tx );
        wait_for_state( &handle, ConnectionState::Connected ).await;

        let ( done_tx, done_rx ) = oneshot::channel();
        let call = handle.send(
            MessageBuilder::request( request::QUERY_TRACKS ).build(),
            client,
            Some( Box::new( move |result| {
                let _ = done_tx.send( result.is_ok() );
            })),
        ).await;

        assert!( call.is_valid() );
        assert!( done_rx.await.unwrap() );
    }


    #[tokio::test]
    async fn test_invalid_credentials_notify_clients() {
        let ( handle, connects ) = echo( true );
        let client = handle.new_client_id();
        let ( tx, mut rx ) = unbounded_channel();
        handle.register_client( client, tx );

        let event = tokio::time::timeout( Duration::from_secs( 2 ), async {
            loop {
                match rx.recv().await {
                    Some( ClientEvent::InvalidCredentials ) => break true,
                    Some( _ ) => continue,
                    None => break false,
                }
            }
        }).await.unwrap();

        assert!( event );
        assert_eq!( handle.state(), ConnectionState::Disconnected );
        assert_eq!( connects.load( Ordering::SeqCst ), 1 );
    }


    #[tokio::test]
    async fn test_request_without_connection_fails_fast() {
        let ( handle, _ ) = echo( false );
        let client = handle.new_client_id();

        let result = handle
            .request( MessageBuilder::request( request::QUERY_TRACKS ).build(), client )
            .await;
        assert_eq!( result, Err( RequestError::UnknownClient ) );
    }
}
