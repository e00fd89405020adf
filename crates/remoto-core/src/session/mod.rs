//! Playback session engine
//!
//! `PlaybackSession` resolves the active queue through a `TrackSource`,
//! keeps a current and a next `PlayerWrapper`, prefetches the next track
//! while the current one plays and promotes it when the current one
//! finishes. All asynchronous work (queries, player events) comes back as
//! `SessionEvent`s on the session's mailbox and is applied by `handle`.
//! Results tagged with an outdated generation or query serial are dropped.

mod context;
mod navigation;
mod service;

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc::UnboundedSender;

use crate::cache::{ index_cache, IndexCache };
use crate::config::StreamUrls;
use crate::error::RequestError;
use crate::player::{
    AudioSession, BackendEvents, BackendFactory, PlayerEvent, PlayerEventSink, PlayerId, PlayerState, PlayerWrapper,
};
use crate::query::{ QueryContext, QueryKind, TrackQueryFactory, TrackSource };
use crate::track::Track;

pub use context::{ PlaybackContext, Role };
pub use navigation::{ resolve_next_index, resolve_prev_index, RepeatMode };
pub use service::{ LiveQueue, SessionHandle, SessionListener };


pub const METADATA_CACHE_CAPACITY: usize = 50;

/// Tracks fetched around the playing index once playback starts.
pub const PRECACHE_WINDOW: usize = 10;

/// Going back within this much of a track's start loads the previous track;
/// later it restarts the current one.
pub const PREV_RESTART_THRESHOLD: Duration = Duration::from_millis( 3500 );

pub const SEEK_STEP: Duration = Duration::from_millis( 5000 );

/// How long the track source stays attached after the last listener leaves.
pub const DETACH_DELAY: Duration = Duration::from_secs( 5 );


/// Session-level playback state.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Default )]
pub enum SessionState {
    #[default]
    Stopped,
    Buffering,
    Playing,
    Paused,
}


/// Results and notifications delivered to the session's mailbox.
#[derive( Debug )]
pub enum SessionEvent {
    CountResolved { generation: u64, serial: u64, count: Result<usize, RequestError> },
    TrackLoaded { generation: u64, serial: u64, index: usize, track: Result<Option<Track>, RequestError> },
    Precached { serial: u64, offset: usize, tracks: Result<Vec<Track>, RequestError> },
    QueueCounted { serial: u64, count: Result<usize, RequestError> },
    SnapshotReady { token: u64, index: usize, offset: Duration, result: Result<(), RequestError> },
    Player( PlayerEvent ),
}


/// Initial session flags.
#[derive( Debug, Clone, Copy, PartialEq )]
pub struct SessionOptions {
    pub shuffled: bool,
    pub repeat: RepeatMode,
    pub volume: f32,
    pub muted: bool,
    pub detach_delay: Duration,
}


impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            shuffled: false,
            repeat: RepeatMode::None,
            volume: 1.0,
            muted: false,
            detach_delay: DETACH_DELAY,
        }
    }
}


/// Read-only view of the session for UIs.
#[derive( Debug, Clone, PartialEq, Default )]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub queue_position: Option<usize>,
    pub queue_count: usize,
    pub duration: Duration,
    pub current_time: Duration,
    pub buffered_time: Duration,
    pub shuffled: bool,
    pub muted: bool,
    pub repeat: RepeatMode,
    pub volume: f32,
    pub track: Option<Track>,
    /// Bumped whenever the queue source or its contents change.
    pub queue_revision: u64,
}


pub struct PlaybackSession {
    source: Arc<dyn TrackSource>,
    backends: Arc<dyn BackendFactory>,
    urls: StreamUrls,
    events: UnboundedSender<SessionEvent>,
    sink: PlayerEventSink,

    query_context: Option<Arc<QueryContext>>,
    query: Option<TrackQueryFactory>,
    serial: u64,
    snapshot_token: u64,
    pending_snapshot: Option<u64>,

    generation: u64,
    context: PlaybackContext,
    pending_offset: Duration,
    metadata: IndexCache<Track>,
    retiring: Vec<PlayerWrapper>,
    player_ids: u64,

    state: SessionState,
    shuffled: bool,
    repeat: RepeatMode,
    audio: AudioSession,
    rng: StdRng,
    queue_revision: u64,
}


impl PlaybackSession {
    /// @param events - The session's own mailbox; everything it spawns
    /// reports back through it
    pub fn new(
        source: Arc<dyn TrackSource>,
        backends: Arc<dyn BackendFactory>,
        urls: StreamUrls,
        options: SessionOptions,
        events: UnboundedSender<SessionEvent>,
    ) -> Self {
        let player_events = events.clone();
        let sink: PlayerEventSink = Arc::new( move |event| {
            let _ = player_events.send( SessionEvent::Player( event ) );
        });

        Self {
            source,
            backends,
            urls,
            events,
            sink,
            query_context: None,
            query: None,
            serial: 0,
            snapshot_token: 0,
            pending_snapshot: None,
            generation: 0,
            context: PlaybackContext::default(),
            pending_offset: Duration::ZERO,
            metadata: index_cache( METADATA_CACHE_CAPACITY ),
            retiring: Vec::new(),
            player_ids: 0,
            state: SessionState::Stopped,
            shuffled: options.shuffled,
            repeat: options.repeat,
            audio: AudioSession::new( options.volume, options.muted ),
            rng: StdRng::from_os_rng(),
            queue_revision: 0,
        }
    }


    pub fn state( &self ) -> SessionState {
        self.state
    }


    pub fn context( &self ) -> &PlaybackContext {
        &self.context
    }


    pub fn query_context( &self ) -> Option<&QueryContext> {
        self.query_context.as_deref()
    }


    /// Factory for the queue currently being played.
    pub fn query( &self ) -> Option<TrackQueryFactory> {
        self.query.clone()
    }


    pub fn queue_revision( &self ) -> u64 {
        self.queue_revision
    }


    pub fn is_shuffled( &self ) -> bool {
        self.shuffled
    }


    pub fn repeat_mode( &self ) -> RepeatMode {
        self.repeat
    }


    pub fn audio( &self ) -> &AudioSession {
        &self.audio
    }


    pub fn snapshot( &self ) -> SessionSnapshot {
        let player = self.context.current_player();
        let track = self.context.current_track.clone();
        let duration = player
            .and_then( PlayerWrapper::duration )
            .or_else( || track.as_ref().filter( |t| t.duration > 0.0 ).map( |t| Duration::from_secs_f64( t.duration ) ) )
            .unwrap_or_default();

        SessionSnapshot {
            state: self.state,
            queue_position: self.context.current_index,
            queue_count: self.context.queue_count,
            duration,
            current_time: player.map( PlayerWrapper::position ).unwrap_or_default(),
            buffered_time: player.map( PlayerWrapper::buffered_time ).unwrap_or_default(),
            shuffled: self.shuffled,
            muted: self.audio.is_muted(),
            repeat: self.repeat,
            volume: self.audio.volume(),
            track,
            queue_revision: self.queue_revision,
        }
    }


    /// Plays `context` from `index`.
    pub fn play( &mut self, context: QueryContext, index: usize, offset: Duration ) {
        self.pending_snapshot = None;
        self.set_query_context( context );
        self.load( index, offset );
    }


    /// Plays every library track matching `filter`.
    pub fn play_all( &mut self, index: usize, filter: &str ) {
        self.play( QueryContext::all_tracks( filter ), index, Duration::ZERO );
    }


    /// Plays `index` of the current queue (all tracks when none is set).
    pub fn play_at( &mut self, index: usize ) {
        let context = self
            .query_context
            .as_deref()
            .cloned()
            .unwrap_or_else( || QueryContext::all_tracks( "" ) );
        self.play( context, index, Duration::ZERO );
    }


    /// Freezes the server's play queue and continues it locally.
    pub fn play_snapshot( &mut self, index: usize, offset: Duration ) {
        self.snapshot_token += 1;
        let token = self.snapshot_token;
        self.pending_snapshot = Some( token );

        let source = Arc::clone( &self.source );
        let events = self.events.clone();
        tokio::spawn( async move {
            let result = source.snapshot_play_queue().await;
            let _ = events.send( SessionEvent::SnapshotReady { token, index, offset, result } );
        });
    }


    pub fn pause( &mut self ) {
        if let Some( player ) = self.context.current_player_mut() {
            player.pause();
        }
    }


    /// Resumes the current player. A track that ended while paused hands
    /// over to the next one instead.
    pub fn resume( &mut self ) {
        if self.context.current_player().map( PlayerWrapper::state ) == Some( PlayerState::Finished ) {
            self.move_to_next( false );
            return;
        }
        if let Some( player ) = self.context.current_player_mut() {
            player.resume();
        }
    }


    pub fn pause_or_resume( &mut self ) {
        match self.state {
            SessionState::Playing | SessionState::Buffering => self.pause(),
            _ => self.resume(),
        }
    }


    /// Disposes both players and clears the metadata cache. The queue
    /// source is kept.
    pub fn stop( &mut self ) {
        tracing::info!( "Session: stop" );
        self.pending_snapshot = None;
        self.retire_players();
        self.generation += 1;
        self.context = PlaybackContext::empty( self.generation );
        self.metadata.invalidate_all();
        self.set_state( SessionState::Stopped );
    }


    /// Manual skip. Ignores track repeat.
    pub fn next( &mut self ) {
        self.move_to_next( true );
    }


    /// Restarts the current track, or loads the previous one when close to
    /// the start.
    pub fn prev( &mut self ) {
        let Some( current ) = self.context.current_index else {
            return;
        };

        let position = self.context.current_player().map( PlayerWrapper::position ).unwrap_or_default();
        if position > PREV_RESTART_THRESHOLD {
            self.seek_to( Duration::ZERO );
            return;
        }

        let index = resolve_prev_index( self.repeat, current, self.context.queue_count );
        self.load( index, Duration::ZERO );
    }


    pub fn seek_to( &mut self, position: Duration ) {
        let Some( player ) = self.context.current_player_mut() else {
            return;
        };

        let position = match player.duration() {
            Some( duration ) => position.min( duration ),
            None => position,
        };
        player.seek( position );
    }


    pub fn seek_forward( &mut self ) {
        let position = self.snapshot().current_time;
        self.seek_to( position + SEEK_STEP );
    }


    pub fn seek_backward( &mut self ) {
        let position = self.snapshot().current_time;
        self.seek_to( position.saturating_sub( SEEK_STEP ) );
    }


    pub fn toggle_shuffle( &mut self ) {
        self.shuffled = !self.shuffled;
        tracing::info!( "Session: shuffle {}", if self.shuffled { "on" } else { "off" } );
        self.refresh_next();
    }


    pub fn toggle_repeat_mode( &mut self ) {
        self.repeat = self.repeat.next();
        tracing::info!( "Session: repeat {}", self.repeat.label() );
        self.refresh_next();
    }


    pub fn toggle_mute( &mut self ) {
        self.audio.toggle_mute();
        self.apply_volume();
    }


    pub fn volume_up( &mut self ) {
        self.audio.volume_up();
        self.apply_volume();
    }


    pub fn volume_down( &mut self ) {
        self.audio.volume_down();
        self.apply_volume();
    }


    /// The server reported a play queue change.
    pub fn queue_changed( &mut self ) {
        self.metadata.invalidate_all();
        self.queue_revision += 1;

        let live = self.query_context.as_ref().map( |c| c.kind == QueryKind::PlayQueue ).unwrap_or( false );
        let Some( query ) = self.query.clone().filter( |_| live ) else {
            return;
        };

        let serial = self.serial;
        let events = self.events.clone();
        tokio::spawn( async move {
            let count = query.count().await;
            let _ = events.send( SessionEvent::QueueCounted { serial, count } );
        });
    }


    /// Applies one mailbox event.
    pub fn handle( &mut self, event: SessionEvent ) {
        match event {
            SessionEvent::CountResolved { generation, serial, count } => self.on_count_resolved( generation, serial, count ),
            SessionEvent::TrackLoaded { generation, serial, index, track } => {
                self.on_track_loaded( generation, serial, index, track )
            }
            SessionEvent::Precached { serial, offset, tracks } => self.on_precached( serial, offset, tracks ),
            SessionEvent::QueueCounted { serial, count } => self.on_queue_counted( serial, count ),
            SessionEvent::SnapshotReady { token, index, offset, result } => {
                self.on_snapshot_ready( token, index, offset, result )
            }
            SessionEvent::Player( event ) => self.on_player_event( event ),
        }
    }


    fn set_query_context( &mut self, context: QueryContext ) {
        if self.query_context.as_deref() == Some( &context ) {
            return;
        }

        let leaving_snapshot = self.query_context.as_ref().map( |c| c.is_snapshot() ).unwrap_or( false );
        if leaving_snapshot && !context.is_snapshot() {
            self.source.invalidate_play_queue_snapshot();
        }

        tracing::debug!( "Session: query context {:?}", context );
        let context = Arc::new( context );
        self.query = Some( self.source.query( Arc::clone( &context ) ) );
        self.query_context = Some( context );
        self.serial += 1;
        self.metadata.invalidate_all();
        self.queue_revision += 1;
    }


    /// Starts a fresh context at `index`: count, then current and next
    /// metadata, then play.
    fn load( &mut self, index: usize, offset: Duration ) {
        let Some( query ) = self.query.clone() else {
            return;
        };

        self.retire_players();
        self.generation += 1;
        self.context = PlaybackContext::new( self.generation, index );
        self.pending_offset = offset;
        self.set_state( SessionState::Buffering );

        tracing::info!( "Session: loading index {} (generation {})", index, self.generation );

        let generation = self.generation;
        let serial = self.serial;
        let events = self.events.clone();
        tokio::spawn( async move {
            let count = query.count().await;
            let _ = events.send( SessionEvent::CountResolved { generation, serial, count } );
        });
    }


    fn is_current( &self, generation: u64, serial: u64 ) -> bool {
        generation == self.context.generation && serial == self.serial
    }


    fn on_count_resolved( &mut self, generation: u64, serial: u64, count: Result<usize, RequestError> ) {
        if !self.is_current( generation, serial ) {
            tracing::trace!( "Session: dropping stale count" );
            return;
        }

        let count = match count {
            Ok( 0 ) => {
                tracing::info!( "Session: queue is empty" );
                self.stop();
                return;
            }
            Ok( count ) => count,
            Err( e ) => {
                tracing::warn!( "Session: could not count queue: {}", e );
                self.stop();
                return;
            }
        };

        let index = self.context.current_index.unwrap_or( 0 ).min( count - 1 );
        self.context.queue_count = count;
        self.context.current_index = Some( index );
        self.context.next_index = self.resolve_next( index, false );

        let mut wanted = vec![ index ];
        wanted.extend( self.context.next_index );
        self.fetch_tracks( wanted );
    }


    /// Resolves metadata for `indices` in order, from the cache or with one
    /// request at a time.
    fn fetch_tracks( &mut self, indices: Vec<usize> ) {
        let mut missing = Vec::new();
        for index in indices {
            match self.metadata.get( &index ) {
                Some( track ) => self.apply_track( index, track ),
                None => missing.push( index ),
            }
        }

        let Some( query ) = self.query.clone() else {
            return;
        };
        if missing.is_empty() {
            return;
        }

        let generation = self.context.generation;
        let serial = self.serial;
        let events = self.events.clone();
        tokio::spawn( async move {
            for index in missing {
                let track = query.page( index, 1 ).await.map( |tracks| tracks.into_iter().next() );
                if events.send( SessionEvent::TrackLoaded { generation, serial, index, track } ).is_err() {
                    break;
                }
            }
        });
    }


    fn on_track_loaded( &mut self, generation: u64, serial: u64, index: usize, track: Result<Option<Track>, RequestError> ) {
        if serial != self.serial {
            return;
        }

        match track {
            Ok( Some( track ) ) => {
                self.metadata.insert( index, track.clone() );
                if generation == self.context.generation {
                    self.apply_track( index, track );
                }
            }
            other => {
                let waiting = generation == self.context.generation
                    && self.context.current_index == Some( index )
                    && self.context.current_track.is_none();
                if waiting {
                    match other {
                        Err( e ) => tracing::warn!( "Session: could not load track {}: {}", index, e ),
                        _ => tracing::warn!( "Session: track {} does not exist", index ),
                    }
                    self.stop();
                }
            }
        }
    }


    fn apply_track( &mut self, index: usize, track: Track ) {
        if self.context.current_index == Some( index ) && self.context.current_track.is_none() {
            self.context.current_track = Some( track );
            self.start_current();
        } else if self.context.next_index == Some( index ) && self.context.next_track.is_none() {
            self.context.next_track = Some( track );
            if self.current_player_state() == Some( PlayerState::Playing ) {
                self.prefetch_next();
            }
        }
    }


    fn start_current( &mut self ) {
        let Some( track ) = self.context.current_track.clone() else {
            return;
        };

        let Some( uri ) = self.urls.resolve( &track ) else {
            tracing::warn!( "Session: track {} has no stream url", track.id );
            self.stop();
            return;
        };

        tracing::info!( "Session: playing {} ({})", track.display_title(), uri );
        let offset = std::mem::take( &mut self.pending_offset );
        let mut player = self.new_player();
        player.play( &uri, track, offset );

        if let Some( old ) = self.context.set_current_player( player ) {
            self.retire( old );
        }
    }


    /// Prepares the next track's audio in a second player.
    fn prefetch_next( &mut self ) {
        if self.context.next_player().is_some() {
            return;
        }

        let Some( index ) = self.context.next_index else {
            return;
        };

        let Some( track ) = self.context.next_track.clone() else {
            self.fetch_tracks( vec![ index ] );
            return;
        };

        let Some( uri ) = self.urls.resolve( &track ) else {
            return;
        };

        tracing::debug!( "Session: prefetching index {}", index );
        let mut player = self.new_player();
        player.prefetch( &uri, track );
        if let Some( old ) = self.context.set_next_player( player ) {
            self.retire( old );
        }
    }


    /// Fetches a window of metadata around `index` so skips are cheap.
    fn precache_around( &mut self, index: usize ) {
        let count = self.context.queue_count;
        if count == 0 {
            return;
        }

        let limit = PRECACHE_WINDOW.min( count );
        let offset = index.saturating_sub( PRECACHE_WINDOW / 2 ).min( count - limit );
        if ( offset..offset + limit ).all( |i| self.metadata.contains_key( &i ) ) {
            return;
        }

        let Some( query ) = self.query.clone() else {
            return;
        };

        let serial = self.serial;
        let events = self.events.clone();
        tokio::spawn( async move {
            let tracks = query.page( offset, limit ).await;
            let _ = events.send( SessionEvent::Precached { serial, offset, tracks } );
        });
    }


    fn on_precached( &mut self, serial: u64, offset: usize, tracks: Result<Vec<Track>, RequestError> ) {
        if serial != self.serial {
            return;
        }

        match tracks {
            Ok( tracks ) => {
                for ( i, track ) in tracks.into_iter().enumerate() {
                    self.metadata.insert( offset + i, track );
                }
            }
            Err( e ) => tracing::debug!( "Session: precache failed: {}", e ),
        }
    }


    fn on_queue_counted( &mut self, serial: u64, count: Result<usize, RequestError> ) {
        if serial != self.serial {
            return;
        }

        match count {
            Ok( count ) => {
                self.context.queue_count = count;
                self.refresh_next();
            }
            Err( e ) => tracing::debug!( "Session: queue recount failed: {}", e ),
        }
    }


    fn on_snapshot_ready( &mut self, token: u64, index: usize, offset: Duration, result: Result<(), RequestError> ) {
        if self.pending_snapshot != Some( token ) {
            return;
        }
        self.pending_snapshot = None;

        match result {
            Ok( () ) => {
                self.set_query_context( QueryContext::snapshot() );
                self.load( index, offset );
            }
            Err( e ) => tracing::warn!( "Session: play queue snapshot failed: {}", e ),
        }
    }


    fn on_player_event( &mut self, event: PlayerEvent ) {
        match event {
            PlayerEvent::Backend { player, event } => {
                if let Some( wrapper ) = self.context.player_mut( player ) {
                    wrapper.on_backend_event( event );
                } else if let Some( pos ) = self.retiring.iter().position( |p| p.id() == player ) {
                    self.retiring[ pos ].on_backend_event( event );
                    if self.retiring[ pos ].state() == PlayerState::Disposed {
                        self.retiring.swap_remove( pos );
                    }
                }
            }
            PlayerEvent::StateChanged { player, state } => match self.context.role_of( player ) {
                Some( Role::Current ) => self.on_current_state( state ),
                Some( Role::Next ) => self.on_next_state( state ),
                None => {}
            },
        }
    }


    fn on_current_state( &mut self, state: PlayerState ) {
        match state {
            PlayerState::Preparing | PlayerState::Buffering => self.set_state( SessionState::Buffering ),
            PlayerState::Playing => {
                self.set_state( SessionState::Playing );
                self.prefetch_next();
                if let Some( index ) = self.context.current_index {
                    self.precache_around( index );
                }
            }
            PlayerState::Paused => self.set_state( SessionState::Paused ),
            PlayerState::Error => {
                tracing::warn!( "Session: player failed; pausing" );
                self.set_state( SessionState::Paused );
            }
            PlayerState::Finished => {
                if self.state != SessionState::Paused {
                    self.move_to_next( false );
                }
            }
            PlayerState::Stopped | PlayerState::Prepared | PlayerState::Killing | PlayerState::Disposed => {}
        }
    }


    fn on_next_state( &mut self, state: PlayerState ) {
        match state {
            PlayerState::Prepared => {
                let uri = self.context.next_player().and_then( |p| p.uri() ).map( str::to_string );
                if let Some( current ) = self.context.current_player_mut() {
                    current.set_next( uri.as_deref() );
                }
            }
            PlayerState::Error => {
                tracing::debug!( "Session: prefetch failed; will reload on track end" );
                if let Some( player ) = self.context.take_next_player() {
                    self.retire( player );
                }
            }
            _ => {}
        }
    }


    fn move_to_next( &mut self, user_initiated: bool ) {
        let Some( current ) = self.context.current_index else {
            return;
        };
        if self.context.queue_count == 0 {
            return;
        }

        if user_initiated {
            let next = self.resolve_next( current, true );
            if next != self.context.next_index {
                self.drop_next();
                self.context.next_index = next;
            }
        }

        let Some( next_index ) = self.context.next_index else {
            tracing::info!( "Session: end of queue" );
            self.stop();
            return;
        };

        let ready = self.context.next_track.is_some()
            && self.context.next_player().map( |p| !p.state().is_terminal() && p.state() != PlayerState::Error ).unwrap_or( false );

        if !ready {
            tracing::debug!( "Session: next track not prefetched; reloading index {}", next_index );
            self.load( next_index, Duration::ZERO );
            return;
        }

        tracing::info!( "Session: advancing to index {}", next_index );
        if let Some( old ) = self.context.promote_next() {
            self.retire( old );
        }
        if let Some( player ) = self.context.current_player_mut() {
            player.set_next( None );
            player.resume();
        }

        self.context.next_index = self.resolve_next( next_index, false );
        if let Some( index ) = self.context.next_index {
            self.fetch_tracks( vec![ index ] );
        }
    }


    /// Re-resolves the next index after a navigation flag changed.
    fn refresh_next( &mut self ) {
        let Some( current ) = self.context.current_index else {
            return;
        };
        if self.context.queue_count == 0 {
            return;
        }

        let next = self.resolve_next( current, false );
        if next == self.context.next_index && !self.shuffled {
            return;
        }

        self.drop_next();
        self.context.next_index = next;
        if let Some( player ) = self.context.current_player_mut() {
            player.set_next( None );
        }
        if let Some( index ) = next {
            self.fetch_tracks( vec![ index ] );
        }
    }


    fn drop_next( &mut self ) {
        if let Some( player ) = self.context.clear_next() {
            self.retire( player );
        }
    }


    fn resolve_next( &mut self, current: usize, user_initiated: bool ) -> Option<usize> {
        resolve_next_index(
            self.shuffled,
            self.repeat,
            user_initiated,
            current,
            self.context.queue_count,
            &mut self.rng,
        )
    }


    fn new_player( &mut self ) -> PlayerWrapper {
        self.player_ids += 1;
        let id = PlayerId( self.player_ids );
        let backend = self.backends.create( BackendEvents::new( id, Arc::clone( &self.sink ) ) );
        let mut player = PlayerWrapper::new( id, backend, Arc::clone( &self.sink ), self.urls.is_transcoding() );
        player.update_volume( &self.audio );
        player
    }


    /// Disposes `player`; one still preparing is kept until it settles.
    fn retire( &mut self, mut player: PlayerWrapper ) {
        player.dispose();
        if player.state() != PlayerState::Disposed {
            self.retiring.push( player );
        }
    }


    fn retire_players( &mut self ) {
        for player in self.context.take_players() {
            self.retire( player );
        }
    }


    fn apply_volume( &mut self ) {
        let audio = self.audio;
        for player in self.context.players_mut() {
            player.update_volume( &audio );
        }
    }


    fn current_player_state( &self ) -> Option<PlayerState> {
        self.context.current_player().map( PlayerWrapper::state )
    }


    fn set_state( &mut self, state: SessionState ) {
        if self.state != state {
            tracing::debug!( "Session: {:?} -> {:?}", self.state, state );
            self.state = state;
        }
    }
}


#[cfg( test )]
pub( crate ) mod fake {
    use std::sync::atomic::{ AtomicUsize, Ordering };
    use std::sync::{ Arc, Mutex };

    use async_trait::async_trait;
    use tokio::sync::broadcast;

    use crate::error::RequestError;
    use crate::provider::ProviderEvent;
    use crate::query::{ QueryContext, QueryFactory, QueryKind, TrackQueryFactory, TrackSource };
    use crate::track::Track;


    #[derive( Default )]
    pub struct Stats {
        pub counts: AtomicUsize,
        pub pages: AtomicUsize,
        pub snapshots: AtomicUsize,
        pub invalidations: AtomicUsize,
        pub attached: AtomicUsize,
        pub detached: AtomicUsize,
    }


    pub struct FakeQuery {
        tracks: Arc<Vec<Track>>,
        stats: Arc<Stats>,
    }


    #[async_trait]
    impl QueryFactory for FakeQuery {
        type Item = Track;


        async fn count( &self ) -> Result<usize, RequestError> {
            self.stats.counts.fetch_add( 1, Ordering::SeqCst );
            Ok( self.tracks.len() )
        }


        async fn page( &self, offset: usize, limit: usize ) -> Result<Vec<Track>, RequestError> {
            self.stats.pages.fetch_add( 1, Ordering::SeqCst );
            Ok( self.tracks.iter().skip( offset ).take( limit ).cloned().collect() )
        }
    }


    /// Library of `count` tracks streamed from `mem://track/<i>`.
    pub struct FakeSource {
        tracks: Arc<Vec<Track>>,
        pub stats: Arc<Stats>,
        pub kinds: Mutex<Vec<QueryKind>>,
        pub events: broadcast::Sender<ProviderEvent>,
    }


    impl FakeSource {
        pub fn new( count: usize ) -> Self {
            let tracks = ( 0..count )
                .map( |i| Track {
                    id: i as i64,
                    uri: format!( "mem://track/{}", i ),
                    title: format!( "Track {}", i ),
                    ..Track::default()
                })
                .collect();

            Self {
                tracks: Arc::new( tracks ),
                stats: Arc::default(),
                kinds: Mutex::new( Vec::new() ),
                events: broadcast::channel( 16 ).0,
            }
        }
    }


    #[async_trait]
    impl TrackSource for FakeSource {
        fn query( &self, context: Arc<QueryContext> ) -> TrackQueryFactory {
            self.kinds.lock().unwrap().push( context.kind );
            Arc::new( FakeQuery { tracks: Arc::clone( &self.tracks ), stats: Arc::clone( &self.stats ) } )
        }


        async fn snapshot_play_queue( &self ) -> Result<(), RequestError> {
            self.stats.snapshots.fetch_add( 1, Ordering::SeqCst );
            Ok( () )
        }


        fn invalidate_play_queue_snapshot( &self ) {
            self.stats.invalidations.fetch_add( 1, Ordering::SeqCst );
        }


        fn attach( &self ) {
            self.stats.attached.fetch_add( 1, Ordering::SeqCst );
        }


        fn detach( &self ) {
            self.stats.detached.fetch_add( 1, Ordering::SeqCst );
        }


        fn subscribe( &self ) -> broadcast::Receiver<ProviderEvent> {
            self.events.subscribe()
        }
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use tokio::sync::mpsc::{ unbounded_channel, UnboundedReceiver };

    use super::fake::FakeSource;
    use crate::config::ConnectionConfig;
    use crate::player::fake::{ FakeBackend, FakeFactory };
    use crate::player::BackendEvent;


    struct Harness {
        session: PlaybackSession,
        mailbox: UnboundedReceiver<SessionEvent>,
        backends: FakeFactory,
        source: Arc<FakeSource>,
    }


    impl Harness {
        fn new( count: usize, options: SessionOptions ) -> Self {
            let ( tx, mailbox ) = unbounded_channel();
            let backends = FakeFactory::default();
            let source = Arc::new( FakeSource::new( count ) );
            let session = PlaybackSession::new(
                Arc::clone( &source ) as Arc<dyn TrackSource>,
                Arc::new( backends.clone() ),
                StreamUrls::new( &ConnectionConfig::default() ),
                options,
                tx,
            );
            Self { session, mailbox, backends, source }
        }


        /// Applies events until the mailbox stays quiet.
        async fn settle( &mut self ) {
            while let Ok( Some( event ) ) =
                tokio::time::timeout( Duration::from_millis( 50 ), self.mailbox.recv() ).await
            {
                self.session.handle( event );
            }
        }


        fn current_id( &self ) -> PlayerId {
            self.session.context().current_player().map( PlayerWrapper::id ).unwrap()
        }


        fn next_id( &self ) -> Option<PlayerId> {
            self.session.context().next_player().map( PlayerWrapper::id )
        }


        fn backend( &self, player: PlayerId ) -> FakeBackend {
            self.backends.backend( player ).unwrap()
        }
    }


    #[tokio::test]
    async fn test_play_starts_current_and_prefetches_next() {
        let mut h = Harness::new( 5, SessionOptions::default() );

        h.session.play_all( 0, "" );
        assert_eq!( h.session.state(), SessionState::Buffering );
        h.settle().await;

        assert_eq!( h.session.state(), SessionState::Playing );
        let snapshot = h.session.snapshot();
        assert_eq!( snapshot.queue_position, Some( 0 ) );
        assert_eq!( snapshot.queue_count, 5 );
        assert_eq!( snapshot.track.map( |t| t.id ), Some( 0 ) );

        let current = h.backend( h.current_id() );
        assert!( current.calls().contains( &"prepare mem://track/0".to_string() ) );
        assert!( current.calls().contains( &"start".to_string() ) );

        let next = h.backend( h.next_id().unwrap() );
        assert!( next.calls().contains( &"prepare mem://track/1".to_string() ) );
        assert!( !next.calls().contains( &"start".to_string() ) );

        // The current player was told about its successor.
        assert_eq!( current.next(), Some( "mem://track/1".to_string() ) );
    }


    #[tokio::test]
    async fn test_finished_promotes_prefetched_next() {
        let mut h = Harness::new( 5, SessionOptions::default() );
        h.session.play_all( 0, "" );
        h.settle().await;

        let first = h.current_id();
        let second = h.next_id().unwrap();

        h.backends.emit( first, BackendEvent::Ended );
        h.settle().await;

        assert_eq!( h.session.context().current_index, Some( 1 ) );
        assert_eq!( h.current_id(), second );
        assert_eq!( h.session.state(), SessionState::Playing );
        assert!( h.backend( first ).calls().contains( &"release".to_string() ) );
        assert!( h.backend( second ).calls().contains( &"start".to_string() ) );

        let third = h.next_id().unwrap();
        assert!( h.backend( third ).calls().contains( &"prepare mem://track/2".to_string() ) );
        assert_eq!( h.session.context().next_index, Some( 2 ) );
    }


    #[tokio::test]
    async fn test_track_ending_while_paused_waits_for_resume() {
        let mut h = Harness::new( 5, SessionOptions::default() );
        h.session.play_all( 0, "" );
        h.settle().await;

        let first = h.current_id();
        let second = h.next_id().unwrap();
        h.session.pause();
        h.settle().await;
        assert_eq!( h.session.state(), SessionState::Paused );

        h.backends.emit( first, BackendEvent::Ended );
        h.settle().await;

        assert_eq!( h.session.state(), SessionState::Paused );
        assert_eq!( h.session.context().current_index, Some( 0 ) );
        assert_eq!( h.current_id(), first );
        assert!( !h.backend( second ).calls().contains( &"start".to_string() ) );

        h.session.resume();
        h.settle().await;

        assert_eq!( h.session.context().current_index, Some( 1 ) );
        assert_eq!( h.current_id(), second );
        assert_eq!( h.session.state(), SessionState::Playing );
    }


    #[tokio::test]
    async fn test_end_of_queue_stops() {
        let mut h = Harness::new( 5, SessionOptions::default() );
        h.session.play_all( 4, "" );
        h.settle().await;

        assert_eq!( h.next_id(), None );
        let last = h.current_id();

        h.backends.emit( last, BackendEvent::Ended );
        h.settle().await;

        assert_eq!( h.session.state(), SessionState::Stopped );
        assert!( h.session.context().current_player().is_none() );
        assert!( h.backend( last ).calls().contains( &"release".to_string() ) );
    }


    #[tokio::test]
    async fn test_list_repeat_wraps_to_start() {
        let options = SessionOptions { repeat: RepeatMode::List, ..SessionOptions::default() };
        let mut h = Harness::new( 5, options );
        h.session.play_all( 4, "" );
        h.settle().await;

        assert_eq!( h.session.context().next_index, Some( 0 ) );

        h.backends.emit( h.current_id(), BackendEvent::Ended );
        h.settle().await;
        assert_eq!( h.session.context().current_index, Some( 0 ) );
    }


    #[tokio::test]
    async fn test_manual_next_skips_track_repeat() {
        let options = SessionOptions { repeat: RepeatMode::Track, ..SessionOptions::default() };
        let mut h = Harness::new( 5, options );
        h.session.play_all( 2, "" );
        h.settle().await;

        assert_eq!( h.session.context().next_index, Some( 2 ) );

        h.session.next();
        h.settle().await;
        assert_eq!( h.session.context().current_index, Some( 3 ) );
        assert_eq!( h.session.state(), SessionState::Playing );
    }


    #[tokio::test]
    async fn test_stale_load_is_ignored() {
        let mut h = Harness::new( 5, SessionOptions::default() );

        h.session.play_all( 1, "" );
        h.session.play_at( 3 );
        h.settle().await;

        assert_eq!( h.session.context().current_index, Some( 3 ) );
        let prepared: Vec<String> = ( 1..=h.backends.created() as u64 )
            .flat_map( |id| h.backend( PlayerId( id ) ).calls() )
            .filter( |call| call.starts_with( "prepare" ) )
            .collect();
        assert!( !prepared.contains( &"prepare mem://track/1".to_string() ) );
    }


    #[tokio::test]
    async fn test_player_error_pauses_session() {
        let mut h = Harness::new( 5, SessionOptions::default() );
        h.session.play_all( 0, "" );
        h.settle().await;

        let current = h.current_id();
        h.backends.emit( current, BackendEvent::Failed( "decoder fault".into() ) );
        h.settle().await;

        assert_eq!( h.session.state(), SessionState::Paused );
        assert_eq!( h.current_id(), current );
        assert_eq!( h.session.context().current_index, Some( 0 ) );
    }


    #[tokio::test]
    async fn test_prev_restarts_after_threshold() {
        let mut h = Harness::new( 5, SessionOptions::default() );
        h.session.play_all( 2, "" );
        h.settle().await;

        let current = h.backend( h.current_id() );
        current.set_position( Duration::from_secs( 10 ) );
        h.session.prev();
        assert_eq!( current.calls().last().unwrap(), "seek 0" );
        assert_eq!( h.session.context().current_index, Some( 2 ) );

        current.set_position( Duration::from_secs( 1 ) );
        h.session.prev();
        h.settle().await;
        assert_eq!( h.session.context().current_index, Some( 1 ) );
    }


    #[tokio::test]
    async fn test_seek_steps() {
        let mut h = Harness::new( 5, SessionOptions::default() );
        h.session.play_all( 0, "" );
        h.settle().await;

        let current = h.backend( h.current_id() );
        current.set_position( Duration::from_secs( 10 ) );
        h.session.seek_forward();
        assert_eq!( current.calls().last().unwrap(), "seek 15000" );

        current.set_position( Duration::from_secs( 3 ) );
        h.session.seek_backward();
        assert_eq!( current.calls().last().unwrap(), "seek 0" );
    }


    #[tokio::test]
    async fn test_toggle_shuffle_replaces_prefetched_next() {
        let mut h = Harness::new( 5, SessionOptions::default() );
        h.session.play_all( 0, "" );
        h.settle().await;

        let old_next = h.next_id().unwrap();
        h.session.toggle_shuffle();
        h.settle().await;

        assert!( h.session.is_shuffled() );
        assert!( h.backend( old_next ).calls().contains( &"release".to_string() ) );
        let next = h.session.context().next_index.unwrap();
        assert_ne!( next, 0 );
        assert!( next < 5 );
        assert_ne!( h.next_id(), Some( old_next ) );
    }


    #[tokio::test]
    async fn test_repeat_toggle_at_end_resolves_next() {
        let mut h = Harness::new( 5, SessionOptions::default() );
        h.session.play_all( 4, "" );
        h.settle().await;
        assert_eq!( h.session.context().next_index, None );

        h.session.toggle_repeat_mode();
        h.settle().await;

        assert_eq!( h.session.repeat_mode(), RepeatMode::List );
        assert_eq!( h.session.context().next_index, Some( 0 ) );
        assert!( h.next_id().is_some() );
    }


    #[tokio::test]
    async fn test_volume_reaches_every_player() {
        let mut h = Harness::new( 5, SessionOptions::default() );
        h.session.play_all( 0, "" );
        h.settle().await;

        h.session.volume_down();
        assert_eq!( h.backend( h.current_id() ).calls().last().unwrap(), "volume 0.90" );
        assert_eq!( h.backend( h.next_id().unwrap() ).calls().last().unwrap(), "volume 0.90" );

        h.session.toggle_mute();
        assert!( h.session.snapshot().muted );
        assert_eq!( h.backend( h.current_id() ).calls().last().unwrap(), "volume 0.00" );
    }


    #[tokio::test]
    async fn test_stop_disposes_players_and_clears_cache() {
        let mut h = Harness::new( 5, SessionOptions::default() );
        h.session.play_all( 0, "" );
        h.settle().await;

        let current = h.current_id();
        let next = h.next_id().unwrap();
        h.session.stop();

        assert_eq!( h.session.state(), SessionState::Stopped );
        assert!( h.backend( current ).calls().contains( &"release".to_string() ) );
        assert!( h.backend( next ).calls().contains( &"release".to_string() ) );

        let pages = h.source.stats.pages.load( Ordering::SeqCst );
        h.session.play_at( 0 );
        h.settle().await;
        assert!( h.source.stats.pages.load( Ordering::SeqCst ) > pages );
    }


    #[tokio::test]
    async fn test_cached_metadata_skips_requests() {
        let mut h = Harness::new( 5, SessionOptions::default() );
        h.session.play_all( 0, "" );
        h.settle().await;

        // The precache window already holds index 3.
        let pages = h.source.stats.pages.load( Ordering::SeqCst );
        h.session.play_at( 3 );
        h.settle().await;

        assert_eq!( h.session.context().current_index, Some( 3 ) );
        assert_eq!( h.source.stats.pages.load( Ordering::SeqCst ), pages );
    }


    #[tokio::test]
    async fn test_snapshot_playback_and_invalidation() {
        let mut h = Harness::new( 5, SessionOptions::default() );

        h.session.play_snapshot( 1, Duration::from_secs( 20 ) );
        h.settle().await;

        assert_eq!( h.source.stats.snapshots.load( Ordering::SeqCst ), 1 );
        assert!( h.session.query_context().unwrap().is_snapshot() );
        assert_eq!( h.session.context().current_index, Some( 1 ) );
        assert!( h.backend( h.current_id() ).calls().contains( &"seek 20000".to_string() ) );

        h.session.play_all( 0, "" );
        h.settle().await;
        assert_eq!( h.source.stats.invalidations.load( Ordering::SeqCst ), 1 );
        assert_eq!( *h.source.kinds.lock().unwrap(), vec![ QueryKind::Snapshot, QueryKind::Tracks ] );
    }


    #[tokio::test]
    async fn test_queue_change_bumps_revision() {
        let mut h = Harness::new( 5, SessionOptions::default() );
        h.session.play( QueryContext::play_queue(), 0, Duration::ZERO );
        h.settle().await;

        let revision = h.session.queue_revision();
        let counts = h.source.stats.counts.load( Ordering::SeqCst );
        h.session.queue_changed();
        h.settle().await;

        assert_eq!( h.session.queue_revision(), revision + 1 );
        assert_eq!( h.source.stats.counts.load( Ordering::SeqCst ), counts + 1 );
    }


    #[tokio::test]
    async fn test_dispose_while_preparing_waits_for_settle() {
        let mut h = Harness::new( 5, SessionOptions::default() );
        h.session.play_all( 0, "" );

        // Let the count and metadata arrive but stop before Ready is applied.
        while h.session.context().current_player().is_none() {
            let event = h.mailbox.recv().await.unwrap();
            h.session.handle( event );
        }

        let first = h.current_id();
        h.session.stop();
        assert!( !h.backend( first ).calls().contains( &"release".to_string() ) );

        h.settle().await;
        assert!( h.backend( first ).calls().contains( &"release".to_string() ) );
    }
}
