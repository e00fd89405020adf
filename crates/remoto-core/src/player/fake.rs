//! In-memory backend for tests.

use std::sync::{ Arc, Mutex, MutexGuard };
use std::time::Duration;

use super::{ BackendEvent, BackendEvents, BackendFactory, PlaybackBackend, PlayerId };


#[derive( Debug )]
struct FakeState {
    calls: Vec<String>,
    position: Duration,
    duration: Option<Duration>,
    buffered: u8,
    next: Option<String>,
}


impl Default for FakeState {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            position: Duration::ZERO,
            duration: Some( Duration::from_secs( 180 ) ),
            buffered: 100,
            next: None,
        }
    }
}


/// Records every call. Optionally reports `Ready` as soon as it is asked
/// to prepare.
#[derive( Debug, Clone, Default )]
pub struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
    events: Option<BackendEvents>,
}


impl FakeBackend {
    fn lock( &self ) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }


    pub fn calls( &self ) -> Vec<String> {
        self.lock().calls.clone()
    }


    pub fn next( &self ) -> Option<String> {
        self.lock().next.clone()
    }


    pub fn set_position( &self, position: Duration ) {
        self.lock().position = position;
    }


    pub fn set_duration( &self, duration: Duration ) {
        self.lock().duration = Some( duration );
    }


    pub fn set_buffered( &self, percent: u8 ) {
        self.lock().buffered = percent;
    }


    fn record( &self, call: String ) {
        self.lock().calls.push( call );
    }
}


impl PlaybackBackend for FakeBackend {
    fn prepare( &mut self, uri: &str ) {
        self.record( format!( "prepare {}", uri ) );
        if let Some( events ) = &self.events {
            events.emit( BackendEvent::Ready );
        }
    }


    fn start( &mut self ) {
        self.record( "start".into() );
    }


    fn pause( &mut self ) {
        self.record( "pause".into() );
    }


    fn seek( &mut self, position: Duration ) {
        self.record( format!( "seek {}", position.as_millis() ) );
        self.lock().position = position;
    }


    fn position( &self ) -> Duration {
        self.lock().position
    }


    fn duration( &self ) -> Option<Duration> {
        self.lock().duration
    }


    fn buffered_percent( &self ) -> u8 {
        self.lock().buffered
    }


    fn set_volume( &mut self, volume: f32 ) {
        self.record( format!( "volume {:.2}", volume ) );
    }


    fn set_next( &mut self, uri: Option<&str> ) {
        self.lock().next = uri.map( str::to_string );
    }


    fn release( &mut self ) {
        self.record( "release".into() );
    }
}


/// Hands out `FakeBackend`s that report `Ready` immediately and keeps a
/// handle to each so tests can inspect them and inject events.
#[derive( Clone, Default )]
pub struct FakeFactory {
    created: Arc<Mutex<Vec<( BackendEvents, FakeBackend )>>>,
}


impl FakeFactory {
    pub fn backend( &self, player: PlayerId ) -> Option<FakeBackend> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .find( |( events, _ )| events.player() == player )
            .map( |( _, backend )| backend.clone() )
    }


    /// Reports `event` as if backend `player` had raised it.
    pub fn emit( &self, player: PlayerId, event: BackendEvent ) {
        let events = self.created
            .lock()
            .unwrap()
            .iter()
            .find( |( events, _ )| events.player() == player )
            .map( |( events, _ )| events.clone() );
        if let Some( events ) = events {
            events.emit( event );
        }
    }


    pub fn created( &self ) -> usize {
        self.created.lock().unwrap().len()
    }
}


impl BackendFactory for FakeFactory {
    fn create( &self, events: BackendEvents ) -> Box<dyn PlaybackBackend> {
        let backend = FakeBackend {
            state: Arc::default(),
            events: Some( events.clone() ),
        };
        self.created.lock().unwrap().push(( events, backend.clone() ));
        Box::new( backend )
    }
}
