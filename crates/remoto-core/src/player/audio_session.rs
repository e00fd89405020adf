//! Volume and mute shared by every player of a session.


/// Amount `volume_up`/`volume_down` move the volume.
pub const VOLUME_STEP: f32 = 0.1;


#[derive( Debug, Clone, Copy, PartialEq )]
pub struct AudioSession {
    volume: f32,
    muted: bool,
}


impl Default for AudioSession {
    fn default() -> Self {
        Self { volume: 1.0, muted: false }
    }
}


impl AudioSession {
    pub fn new( volume: f32, muted: bool ) -> Self {
        Self { volume: volume.clamp( 0.0, 1.0 ), muted }
    }


    pub fn volume( &self ) -> f32 {
        self.volume
    }


    pub fn is_muted( &self ) -> bool {
        self.muted
    }


    /// Volume players should actually use.
    pub fn effective_volume( &self ) -> f32 {
        if self.muted { 0.0 } else { self.volume }
    }


    /// Sets the volume, clamped to [0, 1]. Adjusting the volume unmutes.
    pub fn set_volume( &mut self, volume: f32 ) {
        self.volume = volume.clamp( 0.0, 1.0 );
        self.muted = false;
    }


    pub fn volume_up( &mut self ) {
        self.set_volume( self.volume + VOLUME_STEP );
    }


    pub fn volume_down( &mut self ) {
        self.set_volume( self.volume - VOLUME_STEP );
    }


    pub fn toggle_mute( &mut self ) {
        self.muted = !self.muted;
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_volume_clamps() {
        let mut audio = AudioSession::new( 0.95, false );
        audio.volume_up();
        assert_eq!( audio.volume(), 1.0 );

        let mut audio = AudioSession::new( 0.05, false );
        audio.volume_down();
        assert_eq!( audio.volume(), 0.0 );
    }


    #[test]
    fn test_adjusting_volume_unmutes() {
        let mut audio = AudioSession::new( 0.5, false );
        audio.toggle_mute();
        assert!( audio.is_muted() );
        assert_eq!( audio.effective_volume(), 0.0 );

        audio.volume_down();
        assert!( !audio.is_muted() );
        assert!( ( audio.effective_volume() - 0.4 ).abs() < 1e-6 );
    }
}
