//! Playback backend seam.

use std::time::Duration;

use super::{ PlayerEvent, PlayerEventSink, PlayerId };


/// Progress reported by a backend.
#[derive( Debug, Clone, PartialEq, Eq )]
pub enum BackendEvent {
    /// Ran out of data while playing.
    Buffering,
    /// Prepared, or recovered from `Buffering`.
    Ready,
    /// Reached the end of the stream.
    Ended,
    Failed( String ),
    /// Percentage of the stream available locally.
    BufferProgress( u8 ),
}


/// Handle a backend uses to report events for its wrapper.
#[derive( Clone )]
pub struct BackendEvents {
    player: PlayerId,
    sink: PlayerEventSink,
}


impl BackendEvents {
    pub fn new( player: PlayerId, sink: PlayerEventSink ) -> Self {
        Self { player, sink }
    }


    pub fn player( &self ) -> PlayerId {
        self.player
    }


    pub fn emit( &self, event: BackendEvent ) {
        ( self.sink )( PlayerEvent::Backend { player: self.player, event } );
    }
}


impl std::fmt::Debug for BackendEvents {
    fn fmt( &self, f: &mut std::fmt::Formatter<'_> ) -> std::fmt::Result {
        f.debug_struct( "BackendEvents" ).field( "player", &self.player ).finish()
    }
}


/// One media engine instance. Every call returns immediately; outcomes are
/// reported through `BackendEvents`.
pub trait PlaybackBackend: Send {
    /// Starts loading `uri`. Emits `Ready` or `Failed` when settled.
    fn prepare( &mut self, uri: &str );

    fn start( &mut self );

    fn pause( &mut self );

    fn seek( &mut self, position: Duration );

    fn position( &self ) -> Duration;

    fn duration( &self ) -> Option<Duration>;

    /// Percentage of the stream available locally.
    fn buffered_percent( &self ) -> u8;

    fn set_volume( &mut self, volume: f32 );

    /// Hands over the uri of the track that follows, for engines that can
    /// chain streams without a gap.
    fn set_next( &mut self, _uri: Option<&str> ) {}

    /// Frees every resource. The backend is not used afterwards.
    fn release( &mut self );
}


/// Creates backends for new wrappers.
pub trait BackendFactory: Send + Sync {
    fn create( &self, events: BackendEvents ) -> Box<dyn PlaybackBackend>;
}
