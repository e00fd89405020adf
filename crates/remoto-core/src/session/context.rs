//! Playback context: the current and next track with their players.

use crate::player::{ PlayerId, PlayerWrapper };
use crate::track::Track;


/// Which slot of the context a player occupies.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum Role {
    Current,
    Next,
}


/// One "play queue X from index Y" run. Owns at most two players; players
/// only leave through `take_*`, `promote_next` or `take_players`, so every
/// player has exactly one owner.
#[derive( Debug, Default )]
pub struct PlaybackContext {
    pub generation: u64,
    pub current_index: Option<usize>,
    pub next_index: Option<usize>,
    pub current_track: Option<Track>,
    pub next_track: Option<Track>,
    pub queue_count: usize,
    current_player: Option<PlayerWrapper>,
    next_player: Option<PlayerWrapper>,
}


impl PlaybackContext {
    pub fn new( generation: u64, index: usize ) -> Self {
        Self {
            generation,
            current_index: Some( index ),
            ..Self::default()
        }
    }


    /// A context with no index and no players, as left behind by `stop`.
    pub fn empty( generation: u64 ) -> Self {
        Self { generation, ..Self::default() }
    }


    pub fn current_player( &self ) -> Option<&PlayerWrapper> {
        self.current_player.as_ref()
    }


    pub fn current_player_mut( &mut self ) -> Option<&mut PlayerWrapper> {
        self.current_player.as_mut()
    }


    pub fn next_player( &self ) -> Option<&PlayerWrapper> {
        self.next_player.as_ref()
    }


    pub fn next_player_mut( &mut self ) -> Option<&mut PlayerWrapper> {
        self.next_player.as_mut()
    }


    /// Installs the current player, returning the one it replaces.
    pub fn set_current_player( &mut self, player: PlayerWrapper ) -> Option<PlayerWrapper> {
        self.current_player.replace( player )
    }


    /// Installs the next player, returning the one it replaces.
    pub fn set_next_player( &mut self, player: PlayerWrapper ) -> Option<PlayerWrapper> {
        self.next_player.replace( player )
    }


    pub fn take_next_player( &mut self ) -> Option<PlayerWrapper> {
        self.next_player.take()
    }


    /// Forgets the resolved next track and returns its player, if any.
    pub fn clear_next( &mut self ) -> Option<PlayerWrapper> {
        self.next_index = None;
        self.next_track = None;
        self.next_player.take()
    }


    /// Moves next into current. Returns the previous current player, which
    /// the caller must dispose.
    pub fn promote_next( &mut self ) -> Option<PlayerWrapper> {
        let retired = self.current_player.take();
        self.current_index = self.next_index.take();
        self.current_track = self.next_track.take();
        self.current_player = self.next_player.take();
        retired
    }


    /// Removes both players.
    pub fn take_players( &mut self ) -> Vec<PlayerWrapper> {
        self.current_player.take().into_iter().chain( self.next_player.take() ).collect()
    }


    pub fn role_of( &self, player: PlayerId ) -> Option<Role> {
        if self.current_player.as_ref().map( PlayerWrapper::id ) == Some( player ) {
            Some( Role::Current )
        } else if self.next_player.as_ref().map( PlayerWrapper::id ) == Some( player ) {
            Some( Role::Next )
        } else {
            None
        }
    }


    pub fn player_mut( &mut self, player: PlayerId ) -> Option<&mut PlayerWrapper> {
        match self.role_of( player )? {
            Role::Current => self.current_player.as_mut(),
            Role::Next => self.next_player.as_mut(),
        }
    }


    pub fn players_mut( &mut self ) -> impl Iterator<Item = &mut PlayerWrapper> {
        self.current_player.iter_mut().chain( self.next_player.iter_mut() )
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::player::fake::FakeBackend;
    use crate::player::PlayerEventSink;


    fn player( id: u64 ) -> PlayerWrapper {
        let sink: PlayerEventSink = Arc::new( |_| {} );
        PlayerWrapper::new( PlayerId( id ), Box::new( FakeBackend::default() ), sink, false )
    }


    fn track( id: i64 ) -> Track {
        Track { id, ..Track::default() }
    }


    #[test]
    fn test_promote_moves_next_into_current() {
        let mut context = PlaybackContext::new( 1, 3 );
        context.current_track = Some( track( 3 ) );
        context.set_current_player( player( 1 ) );
        context.next_index = Some( 4 );
        context.next_track = Some( track( 4 ) );
        context.set_next_player( player( 2 ) );

        let retired = context.promote_next().unwrap();
        assert_eq!( retired.id(), PlayerId( 1 ) );
        assert_eq!( context.current_index, Some( 4 ) );
        assert_eq!( context.current_track.as_ref().map( |t| t.id ), Some( 4 ) );
        assert_eq!( context.current_player().map( PlayerWrapper::id ), Some( PlayerId( 2 ) ) );
        assert!( context.next_player().is_none() );
        assert_eq!( context.next_index, None );
    }


    #[test]
    fn test_roles() {
        let mut context = PlaybackContext::new( 1, 0 );
        context.set_current_player( player( 5 ) );
        context.set_next_player( player( 6 ) );

        assert_eq!( context.role_of( PlayerId( 5 ) ), Some( Role::Current ) );
        assert_eq!( context.role_of( PlayerId( 6 ) ), Some( Role::Next ) );
        assert_eq!( context.role_of( PlayerId( 7 ) ), None );

        let players = context.take_players();
        assert_eq!( players.len(), 2 );
        assert!( context.current_player().is_none() );
    }
}
