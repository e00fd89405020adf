//! Lifecycle state machine around one backend.

use std::time::Duration;

use super::{ AudioSession, BackendEvent, PlaybackBackend, PlayerEvent, PlayerEventSink, PlayerId, PlayerState };
use crate::track::Track;


/// Percentage points kept back from the buffered frontier when clamping
/// seeks into a transcoded stream.
const SEEK_MARGIN_PERCENT: u8 = 2;


pub struct PlayerWrapper {
    id: PlayerId,
    state: PlayerState,
    backend: Box<dyn PlaybackBackend>,
    sink: PlayerEventSink,
    transcoding: bool,
    uri: Option<String>,
    track: Option<Track>,
    /// Start playing as soon as the prepare settles.
    autoplay: bool,
    /// Applied once after prepare, exempt from the seek clamp.
    initial_offset: Option<Duration>,
    /// Position at the time of the last failure.
    error_position: Option<Duration>,
}


impl PlayerWrapper {
    /// @param transcoding - Seeks are clamped to the buffered range when set
    pub fn new( id: PlayerId, backend: Box<dyn PlaybackBackend>, sink: PlayerEventSink, transcoding: bool ) -> Self {
        Self {
            id,
            state: PlayerState::Stopped,
            backend,
            sink,
            transcoding,
            uri: None,
            track: None,
            autoplay: false,
            initial_offset: None,
            error_position: None,
        }
    }


    pub fn id( &self ) -> PlayerId {
        self.id
    }


    pub fn state( &self ) -> PlayerState {
        self.state
    }


    pub fn uri( &self ) -> Option<&str> {
        self.uri.as_deref()
    }


    pub fn track( &self ) -> Option<&Track> {
        self.track.as_ref()
    }


    /// Loads `uri` and starts playing once prepared.
    ///
    /// @param offset - Position to start from
    pub fn play( &mut self, uri: &str, track: Track, offset: Duration ) {
        if self.state.is_terminal() {
            return;
        }

        tracing::debug!( "Player {:?}: play {} at {:?}", self.id, uri, offset );
        self.autoplay = true;
        self.load( uri, track, offset );
    }


    /// Loads `uri` without producing audio.
    pub fn prefetch( &mut self, uri: &str, track: Track ) {
        if self.state.is_terminal() {
            return;
        }

        tracing::debug!( "Player {:?}: prefetch {}", self.id, uri );
        self.autoplay = false;
        self.load( uri, track, Duration::ZERO );
    }


    pub fn pause( &mut self ) {
        match self.state {
            PlayerState::Playing | PlayerState::Buffering => {
                self.backend.pause();
                self.set_state( PlayerState::Paused );
            }
            PlayerState::Preparing => self.autoplay = false,
            _ => {}
        }
    }


    /// Starts or resumes playback. A failed player is prepared again and
    /// continues where it failed.
    pub fn resume( &mut self ) {
        match self.state {
            PlayerState::Prepared | PlayerState::Paused => {
                self.backend.start();
                self.set_state( PlayerState::Playing );
            }
            PlayerState::Preparing => self.autoplay = true,
            PlayerState::Error => {
                let Some( uri ) = self.uri.clone() else {
                    return;
                };
                let offset = self.error_position.take().unwrap_or_default();
                let track = self.track.clone().unwrap_or_default();
                tracing::info!( "Player {:?}: retrying {} at {:?}", self.id, uri, offset );
                self.autoplay = true;
                self.load( &uri, track, offset );
            }
            _ => {}
        }
    }


    /// Seeks within the current stream. Into a transcoded stream that is
    /// still downloading, the target is clamped below the buffered frontier.
    pub fn seek( &mut self, position: Duration ) {
        if !matches!(
            self.state,
            PlayerState::Prepared | PlayerState::Playing | PlayerState::Paused | PlayerState::Buffering
        ) {
            return;
        }

        let target = self.clamp_seek( position );
        if target != position {
            tracing::debug!( "Player {:?}: seek {:?} clamped to {:?}", self.id, position, target );
        }
        self.backend.seek( target );
    }


    pub fn position( &self ) -> Duration {
        match self.state {
            PlayerState::Error => self.error_position.unwrap_or_default(),
            PlayerState::Stopped | PlayerState::Killing | PlayerState::Disposed => Duration::ZERO,
            _ => self.backend.position(),
        }
    }


    pub fn duration( &self ) -> Option<Duration> {
        if self.state.is_terminal() {
            return None;
        }
        self.backend.duration()
    }


    pub fn buffered_percent( &self ) -> u8 {
        if self.state.is_terminal() {
            return 0;
        }
        self.backend.buffered_percent()
    }


    /// Amount of the stream available locally, as a duration.
    pub fn buffered_time( &self ) -> Duration {
        self.duration()
            .map( |d| d.mul_f64( f64::from( self.buffered_percent() ) / 100.0 ) )
            .unwrap_or_default()
    }


    pub fn update_volume( &mut self, audio: &AudioSession ) {
        if !self.state.is_terminal() {
            self.backend.set_volume( audio.effective_volume() );
        }
    }


    /// Tells the backend which stream follows this one.
    pub fn set_next( &mut self, uri: Option<&str> ) {
        if !self.state.is_terminal() {
            self.backend.set_next( uri );
        }
    }


    /// Tears the wrapper down. While a prepare is in flight the release is
    /// deferred until it settles.
    pub fn dispose( &mut self ) {
        match self.state {
            PlayerState::Killing | PlayerState::Disposed => {}
            PlayerState::Preparing => {
                tracing::debug!( "Player {:?}: dispose deferred until prepared", self.id );
                self.set_state( PlayerState::Killing );
            }
            _ => self.release(),
        }
    }


    /// Applies an event reported by this wrapper's backend.
    pub fn on_backend_event( &mut self, event: BackendEvent ) {
        match event {
            BackendEvent::Ready => self.on_ready(),
            BackendEvent::Buffering => {
                if self.state == PlayerState::Playing {
                    self.set_state( PlayerState::Buffering );
                }
            }
            BackendEvent::Ended => {
                if matches!( self.state, PlayerState::Playing | PlayerState::Buffering | PlayerState::Paused ) {
                    self.set_state( PlayerState::Finished );
                }
            }
            BackendEvent::Failed( reason ) => {
                if self.state == PlayerState::Killing {
                    self.release();
                    return;
                }
                if self.state == PlayerState::Disposed {
                    return;
                }
                tracing::warn!( "Player {:?}: playback failed: {}", self.id, reason );
                self.error_position = Some( self.backend.position() );
                self.set_state( PlayerState::Error );
            }
            BackendEvent::BufferProgress( _ ) => {}
        }
    }


    fn on_ready( &mut self ) {
        match self.state {
            PlayerState::Killing => self.release(),
            PlayerState::Preparing => {
                self.set_state( PlayerState::Prepared );
                if let Some( offset ) = self.initial_offset.take() {
                    self.backend.seek( offset );
                }
                if self.autoplay {
                    self.backend.start();
                    self.set_state( PlayerState::Playing );
                }
            }
            PlayerState::Buffering => self.set_state( PlayerState::Playing ),
            _ => {}
        }
    }


    fn load( &mut self, uri: &str, track: Track, offset: Duration ) {
        self.uri = Some( uri.to_string() );
        self.track = Some( track );
        self.initial_offset = if offset.is_zero() { None } else { Some( offset ) };
        self.error_position = None;
        self.set_state( PlayerState::Preparing );
        self.backend.prepare( uri );
    }


    fn release( &mut self ) {
        tracing::debug!( "Player {:?}: released", self.id );
        self.backend.release();
        self.set_state( PlayerState::Disposed );
    }


    fn clamp_seek( &self, position: Duration ) -> Duration {
        let buffered = self.backend.buffered_percent();
        if !self.transcoding || buffered >= 100 {
            return position;
        }

        let Some( duration ) = self.backend.duration() else {
            return position;
        };

        let usable = buffered.saturating_sub( SEEK_MARGIN_PERCENT );
        let limit = duration.mul_f64( f64::from( usable ) / 100.0 );
        position.min( limit )
    }


    fn set_state( &mut self, state: PlayerState ) {
        if self.state == state {
            return;
        }

        tracing::trace!( "Player {:?}: {:?} -> {:?}", self.id, self.state, state );
        self.state = state;
        ( self.sink )( PlayerEvent::StateChanged { player: self.id, state } );
    }
}


impl std::fmt::Debug for PlayerWrapper {
    fn fmt( &self, f: &mut std::fmt::Formatter<'_> ) -> std::fmt::Result {
        f.debug_struct( "PlayerWrapper" )
            .field( "id", &self.id )
            .field( "state", &self.state )
            .field( "uri", &self.uri )
            .finish()
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::sync::{ Arc, Mutex };

    use crate::player::fake::FakeBackend;


    fn wrapper( transcoding: bool ) -> ( PlayerWrapper, FakeBackend, Arc<Mutex<Vec<PlayerEvent>>> ) {
        let events = Arc::new( Mutex::new( Vec::new() ) );
        let sink_events = Arc::clone( &events );
        let sink: PlayerEventSink = Arc::new( move |event| sink_events.lock().unwrap().push( event ) );

        let backend = FakeBackend::default();
        let wrapper = PlayerWrapper::new( PlayerId( 1 ), Box::new( backend.clone() ), sink, transcoding );
        ( wrapper, backend, events )
    }


    fn states( events: &Arc<Mutex<Vec<PlayerEvent>>> ) -> Vec<PlayerState> {
        events
            .lock()
            .unwrap()
            .iter()
            .filter_map( |event| match event {
                PlayerEvent::StateChanged { state, .. } => Some( *state ),
                _ => None,
            })
            .collect()
    }


    #[test]
    fn test_play_starts_when_ready() {
        let ( mut player, backend, events ) = wrapper( false );

        player.play( "http://x/1", Track::default(), Duration::ZERO );
        assert_eq!( player.state(), PlayerState::Preparing );
        assert_eq!( backend.calls(), vec![ "prepare http://x/1" ] );

        player.on_backend_event( BackendEvent::Ready );
        assert_eq!( player.state(), PlayerState::Playing );
        assert_eq!(
            states( &events ),
            vec![ PlayerState::Preparing, PlayerState::Prepared, PlayerState::Playing ]
        );
        assert_eq!( backend.calls(), vec![ "prepare http://x/1", "start" ] );
    }


    #[test]
    fn test_prefetch_stops_at_prepared() {
        let ( mut player, backend, _ ) = wrapper( false );

        player.prefetch( "http://x/2", Track::default() );
        player.on_backend_event( BackendEvent::Ready );
        assert_eq!( player.state(), PlayerState::Prepared );
        assert!( !backend.calls().contains( &"start".to_string() ) );

        player.resume();
        assert_eq!( player.state(), PlayerState::Playing );
    }


    #[test]
    fn test_resume_while_preparing_plays_on_ready() {
        let ( mut player, _, _ ) = wrapper( false );

        player.prefetch( "http://x/2", Track::default() );
        player.resume();
        player.on_backend_event( BackendEvent::Ready );
        assert_eq!( player.state(), PlayerState::Playing );
    }


    #[test]
    fn test_initial_offset_applied_after_prepare() {
        let ( mut player, backend, _ ) = wrapper( true );
        backend.set_buffered( 0 );
        backend.set_duration( Duration::from_secs( 200 ) );

        player.play( "http://x/1", Track::default(), Duration::from_secs( 30 ) );
        player.on_backend_event( BackendEvent::Ready );

        // Exempt from the buffered clamp.
        assert!( backend.calls().contains( &"seek 30000".to_string() ) );
    }


    #[test]
    fn test_seek_clamped_to_buffered_when_transcoding() {
        let ( mut player, backend, _ ) = wrapper( true );
        backend.set_duration( Duration::from_secs( 100 ) );
        backend.set_buffered( 50 );

        player.play( "http://x/1", Track::default(), Duration::ZERO );
        player.on_backend_event( BackendEvent::Ready );
        player.seek( Duration::from_secs( 80 ) );

        assert_eq!( backend.calls().last().unwrap(), "seek 48000" );

        backend.set_buffered( 100 );
        player.seek( Duration::from_secs( 80 ) );
        assert_eq!( backend.calls().last().unwrap(), "seek 80000" );
    }


    #[test]
    fn test_seek_unclamped_without_transcoding() {
        let ( mut player, backend, _ ) = wrapper( false );
        backend.set_duration( Duration::from_secs( 100 ) );
        backend.set_buffered( 10 );

        player.play( "http://x/1", Track::default(), Duration::ZERO );
        player.on_backend_event( BackendEvent::Ready );
        player.seek( Duration::from_secs( 80 ) );

        assert_eq!( backend.calls().last().unwrap(), "seek 80000" );
    }


    #[test]
    fn test_dispose_while_preparing_defers_release() {
        let ( mut player, backend, _ ) = wrapper( false );

        player.play( "http://x/1", Track::default(), Duration::ZERO );
        player.dispose();
        assert_eq!( player.state(), PlayerState::Killing );
        assert!( !backend.calls().contains( &"release".to_string() ) );

        player.on_backend_event( BackendEvent::Ready );
        assert_eq!( player.state(), PlayerState::Disposed );
        assert_eq!( backend.calls().last().unwrap(), "release" );
        assert!( !backend.calls().contains( &"start".to_string() ) );
    }


    #[test]
    fn test_dispose_while_preparing_settles_on_failure() {
        let ( mut player, _, _ ) = wrapper( false );

        player.play( "http://x/1", Track::default(), Duration::ZERO );
        player.dispose();
        player.on_backend_event( BackendEvent::Failed( "404".into() ) );
        assert_eq!( player.state(), PlayerState::Disposed );
    }


    #[test]
    fn test_failure_remembers_position_and_resume_retries() {
        let ( mut player, backend, _ ) = wrapper( false );

        player.play( "http://x/1", Track::default(), Duration::ZERO );
        player.on_backend_event( BackendEvent::Ready );
        backend.set_position( Duration::from_secs( 42 ) );
        player.on_backend_event( BackendEvent::Failed( "reset".into() ) );

        assert_eq!( player.state(), PlayerState::Error );
        assert_eq!( player.position(), Duration::from_secs( 42 ) );

        player.resume();
        assert_eq!( player.state(), PlayerState::Preparing );
        player.on_backend_event( BackendEvent::Ready );
        assert_eq!( player.state(), PlayerState::Playing );

        let calls = backend.calls();
        assert_eq!( calls.iter().filter( |c| c.starts_with( "prepare" ) ).count(), 2 );
        assert!( calls.contains( &"seek 42000".to_string() ) );
    }


    #[test]
    fn test_end_of_stream_finishes() {
        let ( mut player, _, _ ) = wrapper( false );

        player.play( "http://x/1", Track::default(), Duration::ZERO );
        player.on_backend_event( BackendEvent::Ready );
        player.on_backend_event( BackendEvent::Buffering );
        assert_eq!( player.state(), PlayerState::Buffering );
        player.on_backend_event( BackendEvent::Ready );
        assert_eq!( player.state(), PlayerState::Playing );
        player.on_backend_event( BackendEvent::Ended );
        assert_eq!( player.state(), PlayerState::Finished );
    }


    #[test]
    fn test_volume_follows_audio_session() {
        let ( mut player, backend, _ ) = wrapper( false );
        let mut audio = AudioSession::new( 0.5, false );

        player.update_volume( &audio );
        audio.toggle_mute();
        player.update_volume( &audio );

        assert_eq!( backend.calls(), vec![ "volume 0.50", "volume 0.00" ] );
    }
}
