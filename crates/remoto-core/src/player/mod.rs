//! Player wrapper
//!
//! A `PlayerWrapper` drives one `PlaybackBackend` through a lifecycle state
//! machine. Backends report progress as `BackendEvent`s and wrappers report
//! transitions as `PlayerEvent::StateChanged`; both travel through the
//! owner's `PlayerEventSink`, so nothing ever calls back into the owner
//! while it is mid-operation.

mod audio_session;
mod backend;
mod wrapper;

#[cfg( test )]
pub( crate ) mod fake;

use std::sync::Arc;

pub use audio_session::{ AudioSession, VOLUME_STEP };
pub use backend::{ BackendEvent, BackendEvents, BackendFactory, PlaybackBackend };
pub use wrapper::PlayerWrapper;


/// Identity of one wrapper, unique per session.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord )]
pub struct PlayerId( pub u64 );


/// Lifecycle of a wrapper.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum PlayerState {
    Stopped,
    Preparing,
    Prepared,
    Playing,
    Paused,
    Buffering,
    Error,
    Finished,
    /// Disposed while preparing; waiting for the prepare to settle.
    Killing,
    Disposed,
}


impl PlayerState {
    /// True once the wrapper can no longer produce audio.
    pub fn is_terminal( &self ) -> bool {
        matches!( self, PlayerState::Killing | PlayerState::Disposed )
    }
}


/// Everything a wrapper or its backend reports to the owner.
#[derive( Debug, Clone, PartialEq )]
pub enum PlayerEvent {
    StateChanged { player: PlayerId, state: PlayerState },
    Backend { player: PlayerId, event: BackendEvent },
}


/// Receives player events. Called from any thread; implementations queue
/// the event rather than act on it.
pub type PlayerEventSink = Arc<dyn Fn( PlayerEvent ) + Send + Sync>;
