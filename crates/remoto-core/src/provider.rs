//! Data provider
//!
//! Typed queries against the server on top of a `ConnectionHandle`. The
//! provider is one client of the connection; `attach` registers it (which
//! opens the socket) and `detach` lets go.

use std::sync::{ Arc, Mutex, MutexGuard };

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::{ broadcast, watch };
use tokio::task::JoinHandle;

use crate::connection::{ ClientEvent, ClientId, ConnectionHandle, ConnectionState };
use crate::error::RequestError;
use crate::message::{ MessageBuilder, SocketMessage };
use crate::protocol::{ broadcast as notice, key, request, value };
use crate::query::{ QueryContext, QueryFactory, QueryKind, TrackQueryFactory, TrackSource };
use crate::track::{ CategoryValue, Track };


/// Server-originated events interesting to the rest of the app.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum ProviderEvent {
    /// The server's play queue changed.
    PlayQueueChanged,
    /// The server rejected our password.
    AuthFailure,
}


/// Which copy of the server play queue to read.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum PlayQueueType {
    Live,
    Snapshot,
}


impl PlayQueueType {
    fn as_str( &self ) -> &'static str {
        match self {
            PlayQueueType::Live => value::LIVE,
            PlayQueueType::Snapshot => value::SNAPSHOT,
        }
    }
}


/// Window of a paged request.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}


struct Inner {
    connection: ConnectionHandle,
    client: ClientId,
    forward: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<ProviderEvent>,
    state: watch::Sender<ConnectionState>,
}


/// Cloneable, typed access to the server's library and play queue.
#[derive( Clone )]
pub struct DataProvider {
    inner: Arc<Inner>,
}


impl DataProvider {
    pub fn new( connection: ConnectionHandle ) -> Self {
        let client = connection.new_client_id();
        let ( events, _ ) = broadcast::channel( 16 );
        let ( state, _ ) = watch::channel( ConnectionState::Disconnected );

        Self {
            inner: Arc::new( Inner {
                connection,
                client,
                forward: Mutex::new( None ),
                events,
                state,
            }),
        }
    }


    pub fn connection( &self ) -> &ConnectionHandle {
        &self.inner.connection
    }


    pub fn is_attached( &self ) -> bool {
        self.forward().is_some()
    }


    /// Registers with the connection. Must be called from within a tokio
    /// runtime. Attaching twice is a no-op.
    pub fn attach( &self ) {
        let mut forward = self.forward();
        if forward.is_some() {
            return;
        }

        let ( tx, mut rx ) = unbounded_channel();
        let events = self.inner.events.clone();
        let state = self.inner.state.clone();

        *forward = Some( tokio::spawn( async move {
            while let Some( event ) = rx.recv().await {
                match event {
                    ClientEvent::StateChanged { new, .. } => {
                        state.send_replace( new );
                    }
                    ClientEvent::Message( message ) => {
                        if message.name() == notice::PLAY_QUEUE_CHANGED {
                            let _ = events.send( ProviderEvent::PlayQueueChanged );
                        }
                    }
                    ClientEvent::InvalidCredentials => {
                        let _ = events.send( ProviderEvent::AuthFailure );
                    }
                }
            }
        }));

        tracing::debug!( "DataProvider: attached as {:?}", self.inner.client );
        self.inner.connection.register_client( self.inner.client, tx );
    }


    /// Deregisters from the connection, canceling outstanding requests.
    pub fn detach( &self ) {
        let Some( forward ) = self.forward().take() else {
            return;
        };

        tracing::debug!( "DataProvider: detached" );
        self.inner.connection.deregister_client( self.inner.client );
        forward.abort();
        self.inner.state.send_replace( ConnectionState::Disconnected );
    }


    pub fn subscribe( &self ) -> broadcast::Receiver<ProviderEvent> {
        self.inner.events.subscribe()
    }


    /// Connection state as seen by this provider.
    pub fn state( &self ) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }


    /// Number of library tracks matching `filter`.
    pub async fn query_track_count( &self, filter: &str ) -> Result<usize, RequestError> {
        let message = MessageBuilder::request( request::QUERY_TRACKS )
            .add_option( key::FILTER, filter )
            .add_option( key::COUNT_ONLY, true )
            .build();
        self.count( message ).await
    }


    /// Library tracks matching `filter`.
    pub async fn query_tracks( &self, filter: &str, page: Option<Page> ) -> Result<Vec<Track>, RequestError> {
        let message = paged( MessageBuilder::request( request::QUERY_TRACKS ).add_option( key::FILTER, filter ), page );
        self.tracks( message ).await
    }


    pub async fn query_track_count_by_category(
        &self,
        category: &str,
        id: i64,
        filter: &str,
    ) -> Result<usize, RequestError> {
        let message = by_category( category, id, filter ).add_option( key::COUNT_ONLY, true ).build();
        self.count( message ).await
    }


    /// Tracks of one category value, e.g. every track of album 12.
    pub async fn query_tracks_by_category(
        &self,
        category: &str,
        id: i64,
        filter: &str,
        page: Option<Page>,
    ) -> Result<Vec<Track>, RequestError> {
        let message = paged( by_category( category, id, filter ), page );
        self.tracks( message ).await
    }


    pub async fn query_play_queue_count( &self, kind: PlayQueueType ) -> Result<usize, RequestError> {
        let message = MessageBuilder::request( request::QUERY_PLAY_QUEUE_TRACKS )
            .add_option( key::TYPE, kind.as_str() )
            .add_option( key::COUNT_ONLY, true )
            .build();
        self.count( message ).await
    }


    pub async fn query_play_queue_tracks( &self, kind: PlayQueueType, page: Option<Page> ) -> Result<Vec<Track>, RequestError> {
        let builder = MessageBuilder::request( request::QUERY_PLAY_QUEUE_TRACKS ).add_option( key::TYPE, kind.as_str() );
        self.tracks( paged( builder, page ) ).await
    }


    /// Values of a browse category (albums, artists, genres...).
    pub async fn query_category( &self, category: &str, filter: &str ) -> Result<Vec<CategoryValue>, RequestError> {
        let message = MessageBuilder::request( request::QUERY_CATEGORY )
            .add_option( key::CATEGORY, category )
            .add_option( key::FILTER, filter )
            .build();
        let response = self.request( message ).await?;
        Ok( CategoryValue::from_values( data( &response )? ) )
    }


    /// Freezes the server's play queue so it can be continued locally.
    pub async fn snapshot_play_queue( &self ) -> Result<(), RequestError> {
        self.request( MessageBuilder::request( request::SNAPSHOT_PLAY_QUEUE ).build() ).await?;
        Ok( () )
    }


    pub fn invalidate_play_queue_snapshot( &self ) {
        let connection = self.inner.connection.clone();
        let client = self.inner.client;
        tokio::spawn( async move {
            let message = MessageBuilder::request( request::INVALIDATE_PLAY_QUEUE_SNAPSHOT ).build();
            connection.send( message, client, None ).await;
        });
    }


    /// Toggles playback on the server itself.
    pub async fn pause_or_resume_server( &self ) -> Result<(), RequestError> {
        self.request( MessageBuilder::request( request::PAUSE_OR_RESUME ).build() ).await?;
        Ok( () )
    }


    /// Query factory listing one browse category.
    pub fn categories( &self, category: impl Into<String>, filter: impl Into<String> ) -> CategoryQuery {
        CategoryQuery {
            provider: self.clone(),
            category: category.into(),
            filter: filter.into(),
        }
    }


    async fn request( &self, message: SocketMessage ) -> Result<SocketMessage, RequestError> {
        tracing::trace!( "DataProvider: {} {}", message.name(), message.id() );
        self.inner.connection.request( message, self.inner.client ).await
    }


    async fn count( &self, message: SocketMessage ) -> Result<usize, RequestError> {
        let response = self.request( message ).await?;
        let count = response.get_i64( key::COUNT, 0 );
        Ok( usize::try_from( count ).unwrap_or( 0 ) )
    }


    async fn tracks( &self, message: SocketMessage ) -> Result<Vec<Track>, RequestError> {
        let response = self.request( message ).await?;
        Ok( Track::from_values( data( &response )? ) )
    }


    fn forward( &self ) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner.forward.lock().unwrap_or_else( |e| e.into_inner() )
    }
}


#[async_trait]
impl TrackSource for DataProvider {
    fn query( &self, context: Arc<QueryContext> ) -> TrackQueryFactory {
        Arc::new( TrackQuery { provider: self.clone(), context } )
    }


    async fn snapshot_play_queue( &self ) -> Result<(), RequestError> {
        DataProvider::snapshot_play_queue( self ).await
    }


    fn invalidate_play_queue_snapshot( &self ) {
        DataProvider::invalidate_play_queue_snapshot( self )
    }


    fn attach( &self ) {
        DataProvider::attach( self )
    }


    fn detach( &self ) {
        DataProvider::detach( self )
    }


    fn subscribe( &self ) -> broadcast::Receiver<ProviderEvent> {
        DataProvider::subscribe( self )
    }
}


/// Tracks described by a `QueryContext`.
pub struct TrackQuery {
    provider: DataProvider,
    context: Arc<QueryContext>,
}


#[async_trait]
impl QueryFactory for TrackQuery {
    type Item = Track;


    async fn count( &self ) -> Result<usize, RequestError> {
        let context = &self.context;
        match context.kind {
            QueryKind::Tracks => self.provider.query_track_count( &context.filter ).await,
            QueryKind::TracksByCategory => {
                let category = context.category.as_deref().unwrap_or_default();
                self.provider.query_track_count_by_category( category, context.category_id, &context.filter ).await
            }
            QueryKind::PlayQueue => self.provider.query_play_queue_count( PlayQueueType::Live ).await,
            QueryKind::Snapshot => self.provider.query_play_queue_count( PlayQueueType::Snapshot ).await,
        }
    }


    async fn page( &self, offset: usize, limit: usize ) -> Result<Vec<Track>, RequestError> {
        let context = &self.context;
        let page = Some( Page { offset, limit } );
        match context.kind {
            QueryKind::Tracks => self.provider.query_tracks( &context.filter, page ).await,
            QueryKind::TracksByCategory => {
                let category = context.category.as_deref().unwrap_or_default();
                self.provider
                    .query_tracks_by_category( category, context.category_id, &context.filter, page )
                    .await
            }
            QueryKind::PlayQueue => self.provider.query_play_queue_tracks( PlayQueueType::Live, page ).await,
            QueryKind::Snapshot => self.provider.query_play_queue_tracks( PlayQueueType::Snapshot, page ).await,
        }
    }
}


/// Values of one browse category. The server returns the whole list at
/// once, so pages are cut locally.
pub struct CategoryQuery {
    provider: DataProvider,
    category: String,
    filter: String,
}


#[async_trait]
impl QueryFactory for CategoryQuery {
    type Item = CategoryValue;


    async fn count( &self ) -> Result<usize, RequestError> {
        Ok( self.provider.query_category( &self.category, &self.filter ).await?.len() )
    }


    async fn page( &self, offset: usize, limit: usize ) -> Result<Vec<CategoryValue>, RequestError> {
        let values = self.provider.query_category( &self.category, &self.filter ).await?;
        Ok( values.into_iter().skip( offset ).take( limit ).collect() )
    }
}


fn by_category( category: &str, id: i64, filter: &str ) -> MessageBuilder {
    MessageBuilder::request( request::QUERY_TRACKS_BY_CATEGORY )
        .add_option( key::CATEGORY, category )
        .add_option( key::ID, id )
        .add_option( key::FILTER, filter )
}


fn paged( builder: MessageBuilder, page: Option<Page> ) -> SocketMessage {
    match page {
        Some( page ) => builder
            .add_option( key::OFFSET, page.offset )
            .add_option( key::LIMIT, page.limit )
            .build(),
        None => builder.build(),
    }
}


fn data( response: &SocketMessage ) -> Result<&[Value], RequestError> {
    response
        .get_array( key::DATA )
        .map( |values| values.as_slice() )
        .ok_or_else( || RequestError::Malformed( format!( "{} response has no data", response.name() ) ) )
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;

    use crate::config::ConnectionConfig;
    use crate::connection::{ Connector, Established, TransportEvent };
    use crate::error::ConnectError;


    /// In-memory server with a library of `size` tracks and a play queue of
    /// the first three. A snapshot request also broadcasts a queue change.
    struct LibraryServer {
        size: usize,
    }


    fn track_json( index: usize ) -> Value {
        json!({ "id": index as i64, "external_id": format!( "ext-{}", index ), "title": format!( "Track {}", index ) })
    }


    fn answer( incoming: &SocketMessage, size: usize ) -> Vec<SocketMessage> {
        let total = match incoming.name() {
            request::QUERY_PLAY_QUEUE_TRACKS => 3,
            _ => size,
        };

        let response = MessageBuilder::respond_to( incoming );
        let response = match incoming.name() {
            request::QUERY_CATEGORY => response.add_option(
                key::DATA,
                json!([ { "id": 1, "value": "Alpha" }, { "id": 2, "value": "Beta" }, { "id": 3, "value": "Gamma" } ]),
            ),
            request::SNAPSHOT_PLAY_QUEUE => response,
            request::QUERY_TRACKS | request::QUERY_TRACKS_BY_CATEGORY | request::QUERY_PLAY_QUEUE_TRACKS => {
                if incoming.get_bool( key::COUNT_ONLY, false ) {
                    response.add_option( key::COUNT, total )
                } else {
                    let offset = incoming.get_i64( key::OFFSET, 0 ) as usize;
                    let limit = incoming.get_i64( key::LIMIT, total as i64 ) as usize;
                    let end = ( offset + limit ).min( total );
                    let data: Vec<Value> = ( offset.min( end )..end ).map( track_json ).collect();
                    response.add_option( key::DATA, data )
                }
            }
            _ => response.add_option( key::ERROR, "unsupported" ),
        };

        let mut out = vec![ response.build() ];
        if incoming.name() == request::SNAPSHOT_PLAY_QUEUE {
            out.push( MessageBuilder::broadcast( notice::PLAY_QUEUE_CHANGED ).build() );
        }
        out
    }


    #[async_trait]
    impl Connector for LibraryServer {
        async fn connect( &self, _config: &ConnectionConfig ) -> Result<Established, ConnectError> {
            let size = self.size;
            let ( outgoing, mut wire ) = unbounded_channel::<String>();
            let ( server, incoming ) = unbounded_channel();
            tokio::spawn( async move {
                while let Some( text ) = wire.recv().await {
                    let Ok( request ) = SocketMessage::parse( &text ) else { continue };
                    for message in answer( &request, size ) {
                        let _ = server.send( TransportEvent::Frame( message.to_string() ) );
                    }
                }
            });
            Ok( Established { api_version: 20, outgoing, incoming } )
        }
    }


    struct RejectingServer;


    #[async_trait]
    impl Connector for RejectingServer {
        async fn connect( &self, _config: &ConnectionConfig ) -> Result<Established, ConnectError> {
            Err( ConnectError::InvalidCredentials )
        }
    }


    async fn attached( size: usize ) -> DataProvider {
        let connection = ConnectionHandle::spawn( ConnectionConfig::default(), LibraryServer { size } );
        let provider = DataProvider::new( connection );
        provider.attach();

        let mut state = provider.state();
        tokio::time::timeout( Duration::from_secs( 2 ), state.wait_for( |s| *s == ConnectionState::Connected ) )
            .await
            .expect( "never connected" )
            .expect( "provider dropped" );
        provider
    }


    #[tokio::test]
    async fn test_track_count_and_pages() {
        let provider = attached( 20 ).await;

        assert_eq!( provider.query_track_count( "" ).await.unwrap(), 20 );

        let page = provider.query_tracks( "", Some( Page { offset: 18, limit: 5 } ) ).await.unwrap();
        assert_eq!( page.len(), 2 );
        assert_eq!( page[ 0 ].id, 18 );
        assert_eq!( page[ 1 ].external_id, "ext-19" );
    }


    #[tokio::test]
    async fn test_track_query_factory_follows_context() {
        let provider = attached( 20 ).await;

        let queue = provider.query( Arc::new( QueryContext::play_queue() ) );
        assert_eq!( queue.count().await.unwrap(), 3 );
        assert_eq!( queue.page( 1, 10 ).await.unwrap().len(), 2 );

        let album = provider.query( Arc::new( QueryContext::by_category( "album", 4, "" ) ) );
        assert_eq!( album.count().await.unwrap(), 20 );
    }


    #[tokio::test]
    async fn test_category_query_pages_locally() {
        let provider = attached( 5 ).await;

        let categories = provider.categories( "genre", "" );
        assert_eq!( categories.count().await.unwrap(), 3 );

        let page = categories.page( 1, 1 ).await.unwrap();
        assert_eq!( page, vec![ CategoryValue { id: 2, value: "Beta".into() } ] );
    }


    #[tokio::test]
    async fn test_server_error_surfaces_to_caller() {
        let provider = attached( 5 ).await;

        let result = provider.pause_or_resume_server().await;
        assert_eq!( result, Err( RequestError::Server( "unsupported".into() ) ) );
    }


    #[tokio::test]
    async fn test_play_queue_broadcast_becomes_event() {
        let provider = attached( 5 ).await;
        let mut events = provider.subscribe();

        provider.snapshot_play_queue().await.unwrap();

        let event = tokio::time::timeout( Duration::from_secs( 2 ), events.recv() ).await.unwrap().unwrap();
        assert_eq!( event, ProviderEvent::PlayQueueChanged );
    }


    #[tokio::test]
    async fn test_rejected_password_becomes_event() {
        let connection = ConnectionHandle::spawn( ConnectionConfig::default(), RejectingServer );
        let provider = DataProvider::new( connection );
        let mut events = provider.subscribe();
        provider.attach();

        let event = tokio::time::timeout( Duration::from_secs( 2 ), events.recv() ).await.unwrap().unwrap();
        assert_eq!( event, ProviderEvent::AuthFailure );
    }


    #[tokio::test]
    async fn test_detach_is_idempotent() {
        let provider = attached( 5 ).await;
        assert!( provider.is_attached() );

        provider.detach();
        provider.detach();
        assert!( !provider.is_attached() );
        assert_eq!( *provider.state().borrow(), ConnectionState::Disconnected );
    }
}
