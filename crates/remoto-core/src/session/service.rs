//! Session service
//!
//! Owns a `PlaybackSession` on its own task, next to the session's mailbox
//! and the track source's notifications. `SessionHandle` is the cloneable,
//! non-blocking front door used by UIs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast::{ self, error::RecvError };
use tokio::sync::mpsc::{ unbounded_channel, UnboundedReceiver, UnboundedSender };
use tokio::sync::watch;
use tokio::time::{ Instant, MissedTickBehavior };

use super::{ PlaybackSession, SessionEvent, SessionOptions, SessionSnapshot, SessionState };
use crate::config::StreamUrls;
use crate::error::RequestError;
use crate::player::BackendFactory;
use crate::provider::ProviderEvent;
use crate::query::{ QueryContext, QueryFactory, TrackQueryFactory, TrackSource };
use crate::track::Track;


/// Snapshot refresh period while playing.
const SNAPSHOT_INTERVAL: Duration = Duration::from_millis( 250 );


#[derive( Debug )]
enum Command {
    Play { context: QueryContext, index: usize, offset: Duration },
    PlayAt( usize ),
    PlaySnapshot { index: usize, offset: Duration },
    Pause,
    Resume,
    PauseOrResume,
    Stop,
    Next,
    Prev,
    SeekTo( Duration ),
    SeekForward,
    SeekBackward,
    ToggleShuffle,
    ToggleMute,
    ToggleRepeat,
    VolumeUp,
    VolumeDown,
    QueueChanged,
    Acquire,
    Release,
    Shutdown,
}


/// Cloneable access to a running session service. Every method returns
/// immediately; results show up in `snapshot()`.
#[derive( Clone )]
pub struct SessionHandle {
    commands: UnboundedSender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
    queue: watch::Receiver<Option<TrackQueryFactory>>,
}


impl SessionHandle {
    /// Starts the service on the current tokio runtime.
    ///
    /// @param source - Where queues and tracks come from
    /// @param backends - Creates one audio backend per player
    /// @param urls - Resolves a track's stream url
    pub fn spawn(
        source: Arc<dyn TrackSource>,
        backends: Arc<dyn BackendFactory>,
        urls: StreamUrls,
        options: SessionOptions,
    ) -> Self {
        let ( commands_tx, commands_rx ) = unbounded_channel();
        let ( mailbox_tx, mailbox_rx ) = unbounded_channel();
        let provider_events = source.subscribe();

        let session = PlaybackSession::new( Arc::clone( &source ), backends, urls, options, mailbox_tx );
        let ( snapshot_tx, snapshot_rx ) = watch::channel( session.snapshot() );
        let ( queue_tx, queue_rx ) = watch::channel( None );

        let service = Service {
            session,
            source,
            commands: commands_rx,
            mailbox: mailbox_rx,
            provider_events: Some( provider_events ),
            snapshot: snapshot_tx,
            queue: queue_tx,
            listeners: 0,
            attached: false,
            detach_delay: options.detach_delay,
            detach_at: None,
        };
        tokio::spawn( service.run() );

        Self {
            commands: commands_tx,
            snapshot: snapshot_rx,
            queue: queue_rx,
        }
    }


    fn command( &self, command: Command ) {
        if self.commands.send( command ).is_err() {
            tracing::debug!( "Session service is gone" );
        }
    }


    /// Registers interest in the session. The track source stays attached
    /// while any listener is alive; after the last one drops it is detached
    /// once playback has been stopped for a while.
    pub fn connect( &self ) -> SessionListener {
        self.command( Command::Acquire );
        SessionListener { commands: self.commands.clone() }
    }


    /// Plays every library track matching `filter` from the start.
    pub fn play_all( &self, filter: &str ) {
        self.play_context( QueryContext::all_tracks( filter ), 0 );
    }


    /// Plays `index` of the current queue.
    pub fn play_at( &self, index: usize ) {
        self.command( Command::PlayAt( index ) );
    }


    /// Plays the tracks of one category value, e.g. an album.
    pub fn play( &self, category: &str, id: i64, index: usize, filter: &str ) {
        self.play_context( QueryContext::by_category( category, id, filter ), index );
    }


    /// Plays the server's live play queue.
    pub fn play_queue( &self, index: usize ) {
        self.play_context( QueryContext::play_queue(), index );
    }


    pub fn play_context( &self, context: QueryContext, index: usize ) {
        self.command( Command::Play { context, index, offset: Duration::ZERO } );
    }


    /// Freezes the server's play queue and continues it here.
    pub fn play_snapshot( &self, index: usize, offset: Duration ) {
        self.command( Command::PlaySnapshot { index, offset } );
    }


    pub fn pause( &self ) {
        self.command( Command::Pause );
    }


    pub fn resume( &self ) {
        self.command( Command::Resume );
    }


    pub fn pause_or_resume( &self ) {
        self.command( Command::PauseOrResume );
    }


    pub fn stop( &self ) {
        self.command( Command::Stop );
    }


    pub fn next( &self ) {
        self.command( Command::Next );
    }


    pub fn prev( &self ) {
        self.command( Command::Prev );
    }


    pub fn seek( &self, seconds: f64 ) {
        self.seek_to( Duration::from_secs_f64( seconds.max( 0.0 ) ) );
    }


    pub fn seek_to( &self, position: Duration ) {
        self.command( Command::SeekTo( position ) );
    }


    pub fn seek_forward( &self ) {
        self.command( Command::SeekForward );
    }


    pub fn seek_backward( &self ) {
        self.command( Command::SeekBackward );
    }


    pub fn toggle_shuffle( &self ) {
        self.command( Command::ToggleShuffle );
    }


    pub fn toggle_mute( &self ) {
        self.command( Command::ToggleMute );
    }


    pub fn toggle_repeat_mode( &self ) {
        self.command( Command::ToggleRepeat );
    }


    pub fn volume_up( &self ) {
        self.command( Command::VolumeUp );
    }


    pub fn volume_down( &self ) {
        self.command( Command::VolumeDown );
    }


    /// Drops cached metadata for the play queue and recounts it.
    pub fn queue_changed( &self ) {
        self.command( Command::QueueChanged );
    }


    /// Stops playback and ends the service.
    pub fn shutdown( &self ) {
        self.command( Command::Shutdown );
    }


    pub fn snapshot( &self ) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }


    pub fn state( &self ) -> SessionState {
        self.snapshot.borrow().state
    }


    pub fn queue_position( &self ) -> Option<usize> {
        self.snapshot.borrow().queue_position
    }


    pub fn queue_count( &self ) -> usize {
        self.snapshot.borrow().queue_count
    }


    pub fn duration( &self ) -> Duration {
        self.snapshot.borrow().duration
    }


    pub fn current_time( &self ) -> Duration {
        self.snapshot.borrow().current_time
    }


    pub fn buffered_time( &self ) -> Duration {
        self.snapshot.borrow().buffered_time
    }


    pub fn subscribe( &self ) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }


    /// Query factory over whichever queue the session is playing.
    pub fn queue_factory( &self ) -> LiveQueue {
        LiveQueue { current: self.queue.clone() }
    }
}


/// Keeps the session's track source attached while alive.
pub struct SessionListener {
    commands: UnboundedSender<Command>,
}


impl Drop for SessionListener {
    fn drop( &mut self ) {
        let _ = self.commands.send( Command::Release );
    }
}


/// Follows the session's current queue. Empty while nothing was played.
#[derive( Clone )]
pub struct LiveQueue {
    current: watch::Receiver<Option<TrackQueryFactory>>,
}


impl LiveQueue {
    fn factory( &self ) -> Option<TrackQueryFactory> {
        self.current.borrow().clone()
    }


    /// Resolves once the session switches to another queue.
    pub async fn changed( &mut self ) -> bool {
        self.current.changed().await.is_ok()
    }
}


#[async_trait]
impl QueryFactory for LiveQueue {
    type Item = Track;


    async fn count( &self ) -> Result<usize, RequestError> {
        match self.factory() {
            Some( query ) => query.count().await,
            None => Ok( 0 ),
        }
    }


    async fn page( &self, offset: usize, limit: usize ) -> Result<Vec<Track>, RequestError> {
        match self.factory() {
            Some( query ) => query.page( offset, limit ).await,
            None => Ok( Vec::new() ),
        }
    }
}


struct Service {
    session: PlaybackSession,
    source: Arc<dyn TrackSource>,
    commands: UnboundedReceiver<Command>,
    mailbox: UnboundedReceiver<SessionEvent>,
    provider_events: Option<broadcast::Receiver<ProviderEvent>>,
    snapshot: watch::Sender<SessionSnapshot>,
    queue: watch::Sender<Option<TrackQueryFactory>>,
    listeners: usize,
    attached: bool,
    detach_delay: Duration,
    detach_at: Option<Instant>,
}


impl Service {
    async fn run( mut self ) {
        let mut refresh = tokio::time::interval( SNAPSHOT_INTERVAL );
        refresh.set_missed_tick_behavior( MissedTickBehavior::Skip );

        loop {
            let playing = self.session.state() == SessionState::Playing;
            let detach_at = self.detach_at;

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some( Command::Shutdown ) | None => break,
                    Some( command ) => self.on_command( command ),
                },
                Some( event ) = self.mailbox.recv() => self.session.handle( event ),
                event = next_provider_event( &mut self.provider_events ) => self.on_provider_event( event ),
                _ = refresh.tick(), if playing => {}
                _ = tokio::time::sleep_until( detach_at.unwrap_or_else( Instant::now ) ), if detach_at.is_some() => {
                    self.on_detach_deadline();
                }
            }

            self.after_turn();
        }

        tracing::info!( "Session service stopping" );
        self.session.stop();
        if self.attached {
            self.source.detach();
        }
    }


    fn on_command( &mut self, command: Command ) {
        tracing::trace!( "Session command: {:?}", command );
        match command {
            Command::Play { context, index, offset } => {
                self.ensure_attached();
                self.session.play( context, index, offset );
            }
            Command::PlayAt( index ) => {
                self.ensure_attached();
                self.session.play_at( index );
            }
            Command::PlaySnapshot { index, offset } => {
                self.ensure_attached();
                self.session.play_snapshot( index, offset );
            }
            Command::Pause => self.session.pause(),
            Command::Resume => self.session.resume(),
            Command::PauseOrResume => self.session.pause_or_resume(),
            Command::Stop => self.session.stop(),
            Command::Next => self.session.next(),
            Command::Prev => self.session.prev(),
            Command::SeekTo( position ) => self.session.seek_to( position ),
            Command::SeekForward => self.session.seek_forward(),
            Command::SeekBackward => self.session.seek_backward(),
            Command::ToggleShuffle => self.session.toggle_shuffle(),
            Command::ToggleMute => self.session.toggle_mute(),
            Command::ToggleRepeat => self.session.toggle_repeat_mode(),
            Command::VolumeUp => self.session.volume_up(),
            Command::VolumeDown => self.session.volume_down(),
            Command::QueueChanged => self.session.queue_changed(),
            Command::Acquire => {
                self.listeners += 1;
                self.detach_at = None;
                self.ensure_attached();
            }
            Command::Release => {
                self.listeners = self.listeners.saturating_sub( 1 );
            }
            Command::Shutdown => {}
        }
    }


    fn on_provider_event( &mut self, event: Option<Result<ProviderEvent, RecvError>> ) {
        match event {
            Some( Ok( ProviderEvent::PlayQueueChanged ) ) => self.session.queue_changed(),
            Some( Ok( ProviderEvent::AuthFailure ) ) => {
                tracing::warn!( "Session: server rejected credentials" );
            }
            Some( Err( RecvError::Lagged( missed ) ) ) => {
                tracing::debug!( "Session: missed {} provider events", missed );
                self.session.queue_changed();
            }
            Some( Err( RecvError::Closed ) ) | None => {
                self.provider_events = None;
            }
        }
    }


    fn on_detach_deadline( &mut self ) {
        self.detach_at = None;
        if self.listeners == 0 && self.session.state() == SessionState::Stopped && self.attached {
            tracing::info!( "Session: no listeners; detaching track source" );
            self.source.detach();
            self.attached = false;
        }
    }


    fn ensure_attached( &mut self ) {
        if !self.attached {
            self.source.attach();
            self.attached = true;
        }
    }


    fn after_turn( &mut self ) {
        let idle = self.listeners == 0 && self.session.state() == SessionState::Stopped && self.attached;
        if idle && self.detach_at.is_none() {
            self.detach_at = Some( Instant::now() + self.detach_delay );
        } else if !idle {
            self.detach_at = None;
        }

        let snapshot = self.session.snapshot();
        self.snapshot.send_if_modified( |current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });

        let query = self.session.query();
        self.queue.send_if_modified( |current| {
            let same = match ( current.as_ref(), query.as_ref() ) {
                ( Some( a ), Some( b ) ) => Arc::ptr_eq( a, b ),
                ( None, None ) => true,
                _ => false,
            };
            if same {
                return false;
            }
            *current = query;
            true
        });
    }
}


async fn next_provider_event(
    events: &mut Option<broadcast::Receiver<ProviderEvent>>,
) -> Option<Result<ProviderEvent, RecvError>> {
    match events {
        Some( events ) => Some( events.recv().await ),
        None => std::future::pending().await,
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use crate::config::ConnectionConfig;
    use crate::player::fake::FakeFactory;
    use crate::session::fake::FakeSource;


    fn spawn( count: usize, detach_delay: Duration ) -> ( SessionHandle, Arc<FakeSource> ) {
        let source = Arc::new( FakeSource::new( count ) );
        let options = SessionOptions { detach_delay, ..SessionOptions::default() };
        let handle = SessionHandle::spawn(
            Arc::clone( &source ) as Arc<dyn TrackSource>,
            Arc::new( FakeFactory::default() ),
            StreamUrls::new( &ConnectionConfig::default() ),
            options,
        );
        ( handle, source )
    }


    async fn wait_for( handle: &SessionHandle, check: impl Fn( &SessionSnapshot ) -> bool ) -> SessionSnapshot {
        let mut updates = handle.subscribe();
        tokio::time::timeout( Duration::from_secs( 2 ), async {
            loop {
                if check( &updates.borrow_and_update() ) {
                    return updates.borrow().clone();
                }
                updates.changed().await.unwrap();
            }
        })
        .await
        .expect( "session did not reach the expected state" )
    }


    #[tokio::test]
    async fn test_play_all_reaches_playing() {
        let ( handle, source ) = spawn( 4, Duration::from_secs( 5 ) );

        handle.play_all( "" );
        let snapshot = wait_for( &handle, |s| s.state == SessionState::Playing ).await;

        assert_eq!( snapshot.queue_position, Some( 0 ) );
        assert_eq!( snapshot.queue_count, 4 );
        assert_eq!( snapshot.duration, Duration::from_secs( 180 ) );
        assert_eq!( source.stats.attached.load( Ordering::SeqCst ), 1 );
    }


    #[tokio::test]
    async fn test_queue_factory_follows_session() {
        let ( handle, _source ) = spawn( 6, Duration::from_secs( 5 ) );
        let queue = handle.queue_factory();
        assert_eq!( queue.count().await.unwrap(), 0 );

        handle.play_all( "" );
        wait_for( &handle, |s| s.state == SessionState::Playing ).await;

        assert_eq!( queue.count().await.unwrap(), 6 );
        let page = queue.page( 2, 2 ).await.unwrap();
        assert_eq!( page.iter().map( |t| t.id ).collect::<Vec<_>>(), vec![ 2, 3 ] );
    }


    #[tokio::test]
    async fn test_play_queue_change_bumps_revision() {
        let ( handle, source ) = spawn( 3, Duration::from_secs( 5 ) );
        handle.play_queue( 0 );
        let before = wait_for( &handle, |s| s.state == SessionState::Playing ).await;

        source.events.send( ProviderEvent::PlayQueueChanged ).unwrap();
        wait_for( &handle, |s| s.queue_revision > before.queue_revision ).await;
    }


    #[tokio::test]
    async fn test_last_listener_detaches_when_stopped() {
        let ( handle, source ) = spawn( 3, Duration::from_millis( 50 ) );

        let first = handle.connect();
        let second = handle.connect();
        handle.play_all( "" );
        wait_for( &handle, |s| s.state == SessionState::Playing ).await;

        drop( first );
        drop( second );
        tokio::time::sleep( Duration::from_millis( 150 ) ).await;
        // Still playing, so the source stays attached.
        assert_eq!( source.stats.detached.load( Ordering::SeqCst ), 0 );

        handle.stop();
        wait_for( &handle, |s| s.state == SessionState::Stopped ).await;
        tokio::time::sleep( Duration::from_millis( 150 ) ).await;
        assert_eq!( source.stats.detached.load( Ordering::SeqCst ), 1 );
        assert_eq!( source.stats.attached.load( Ordering::SeqCst ), 1 );
    }


    #[tokio::test]
    async fn test_new_listener_cancels_detach() {
        let ( handle, source ) = spawn( 3, Duration::from_millis( 80 ) );

        drop( handle.connect() );
        tokio::time::sleep( Duration::from_millis( 20 ) ).await;
        let _listener = handle.connect();
        tokio::time::sleep( Duration::from_millis( 200 ) ).await;

        assert_eq!( source.stats.detached.load( Ordering::SeqCst ), 0 );
    }
}
