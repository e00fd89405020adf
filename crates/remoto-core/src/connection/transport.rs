//! Socket transport
//!
//! A `Connector` performs the blocking part of a connection: transport
//! connect, authentication and waiting for the server's verdict. On success
//! it hands back a pair of frame channels backed by reader/writer tasks.

use async_trait::async_trait;
use futures_util::{ SinkExt, StreamExt };
use tokio::sync::mpsc::{ unbounded_channel, UnboundedReceiver, UnboundedSender };
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use super::manager::api_version_of;
use crate::config::ConnectionConfig;
use crate::error::ConnectError;
use crate::message::{ MessageBuilder, SocketMessage };
use crate::protocol::{ key, request, CLOSE_POLICY_VIOLATION };


/// Raw events from an established socket.
#[derive( Debug, Clone, PartialEq, Eq )]
pub enum TransportEvent {
    Frame( String ),
    Closed { code: Option<u16> },
}


/// An authenticated socket.
#[derive( Debug )]
pub struct Established {
    pub api_version: i64,
    /// Frames to write. Dropping the sender closes the socket.
    pub outgoing: UnboundedSender<String>,
    pub incoming: UnboundedReceiver<TransportEvent>,
}


/// Opens and authenticates sockets.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect( &self, config: &ConnectionConfig ) -> Result<Established, ConnectError>;
}


/// `Connector` over WebSockets (`ws://` or `wss://`).
#[derive( Debug, Clone, Copy, Default )]
pub struct WebSocketConnector;


#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect( &self, config: &ConnectionConfig ) -> Result<Established, ConnectError> {
        match tokio::time::timeout( config.timing.connect_timeout, open( config ) ).await {
            Ok( result ) => result,
            Err( _ ) => Err( ConnectError::Timeout ),
        }
    }
}


async fn open( config: &ConnectionConfig ) -> Result<Established, ConnectError> {
    if config.host.trim().is_empty() {
        return Err( ConnectError::InvalidAddress( "empty host".into() ) );
    }

    let url = config.socket_url();
    tracing::debug!( "Opening {}", url );

    let ( stream, _ ) = connect_async( url ).await?;
    let ( mut write, mut read ) = stream.split();

    let auth = MessageBuilder::request( request::AUTHENTICATE )
        .add_option( key::PASSWORD, config.password.clone() )
        .build();
    write.send( Message::Text( auth.to_string() ) ).await?;

    let api_version = loop {
        match read.next().await {
            Some( Ok( Message::Text( text ) ) ) => {
                let Ok( message ) = SocketMessage::parse( &text ) else {
                    continue;
                };
                if message.name() != request::AUTHENTICATE {
                    continue;
                }
                if let Some( error ) = message.error() {
                    return Err( ConnectError::Handshake( error.to_string() ) );
                }
                break api_version_of( &message );
            }
            Some( Ok( Message::Close( frame ) ) ) => {
                let code = frame.map( |f| u16::from( f.code ) );
                if code == Some( CLOSE_POLICY_VIOLATION ) {
                    return Err( ConnectError::InvalidCredentials );
                }
                return Err( ConnectError::Handshake( format!( "closed during authentication ({:?})", code ) ) );
            }
            Some( Ok( _ ) ) => continue,
            Some( Err( e ) ) => return Err( e.into() ),
            None => return Err( ConnectError::Handshake( "connection closed".into() ) ),
        }
    };

    let ( outgoing, mut outbox ) = unbounded_channel::<String>();
    tokio::spawn( async move {
        while let Some( text ) = outbox.recv().await {
            if let Err( e ) = write.send( Message::Text( text ) ).await {
                tracing::debug!( "Socket write failed: {}", e );
                return;
            }
        }
        let _ = write.close().await;
    });

    let ( inbox, incoming ) = unbounded_channel();
    tokio::spawn( async move {
        let code = loop {
            match read.next().await {
                Some( Ok( Message::Text( text ) ) ) => {
                    if inbox.send( TransportEvent::Frame( text ) ).is_err() {
                        return;
                    }
                }
                Some( Ok( Message::Close( frame ) ) ) => break frame.map( |f| u16::from( f.code ) ),
                Some( Ok( _ ) ) => {}
                Some( Err( e ) ) => {
                    tracing::debug!( "Socket read failed: {}", e );
                    break None;
                }
                None => break None,
            }
        };
        let _ = inbox.send( TransportEvent::Closed { code } );
    });

    Ok( Established { api_version, outgoing, incoming } )
}
