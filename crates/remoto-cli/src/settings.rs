//! Application settings management
//!
//! Persists the server connection and the last playback flags in
//! `<config dir>/remoto/settings.json`.

use std::fs;
use std::path::PathBuf;

use serde::{ Deserialize, Serialize };

use remoto_core::{ ConnectionConfig, RepeatMode, SessionOptions, SessionSnapshot };

use crate::cli::Args;


/// Application settings.
#[derive( Debug, Clone, PartialEq, Serialize, Deserialize )]
#[serde( default )]
pub struct Settings {
    pub connection: ConnectionConfig,

    pub shuffled: bool,

    pub repeat: RepeatMode,

    /// 0.0 to 1.0
    pub volume: f32,

    pub muted: bool,
}


impl Default for Settings {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            shuffled: false,
            repeat: RepeatMode::None,
            volume: 1.0,
            muted: false,
        }
    }
}


impl Settings {
    /// Returns the path to the settings file.
    fn settings_path() -> Option<PathBuf> {
        dirs::config_dir().map( |p| p.join( "remoto" ).join( "settings.json" ) )
    }


    /// Loads settings from disk, or returns defaults if not found.
    pub fn load() -> Self {
        let path = match Self::settings_path() {
            Some( p ) => p,
            None => return Self::default(),
        };

        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string( &path ) {
            Ok( contents ) => Self::from_json( &contents ),
            Err( e ) => {
                tracing::warn!( "Failed to read settings: {}", e );
                Self::default()
            }
        }
    }


    fn from_json( contents: &str ) -> Self {
        serde_json::from_str( contents ).unwrap_or_else( |e| {
            tracing::warn!( "Ignoring malformed settings: {}", e );
            Self::default()
        })
    }


    /// Saves settings to disk.
    pub fn save( &self ) {
        let path = match Self::settings_path() {
            Some( p ) => p,
            None => return,
        };

        if let Some( parent ) = path.parent() {
            if !parent.exists() {
                if let Err( e ) = fs::create_dir_all( parent ) {
                    tracing::warn!( "Failed to create settings directory: {}", e );
                    return;
                }
            }
        }

        match serde_json::to_string_pretty( self ) {
            Ok( json ) => {
                if let Err( e ) = fs::write( &path, json ) {
                    tracing::warn!( "Failed to save settings: {}", e );
                }
            }
            Err( e ) => {
                tracing::warn!( "Failed to serialize settings: {}", e );
            }
        }
    }


    /// Command-line flags win over the file.
    pub fn apply_args( &mut self, args: &Args ) {
        let connection = &mut self.connection;
        if let Some( host ) = &args.host {
            connection.host = host.clone();
        }
        if let Some( port ) = args.port {
            connection.port = port;
        }
        if let Some( port ) = args.audio_port {
            connection.audio_port = port;
        }
        if let Some( password ) = &args.password {
            connection.password = password.clone();
        }
        if args.tls {
            connection.use_tls = true;
        }
    }


    pub fn session_options( &self ) -> SessionOptions {
        SessionOptions {
            shuffled: self.shuffled,
            repeat: self.repeat,
            volume: self.volume,
            muted: self.muted,
            ..SessionOptions::default()
        }
    }


    /// Remembers the session's flags. Returns true when anything changed.
    pub fn remember( &mut self, snapshot: &SessionSnapshot ) -> bool {
        let before = self.clone();
        self.shuffled = snapshot.shuffled;
        self.repeat = snapshot.repeat;
        self.volume = snapshot.volume;
        self.muted = snapshot.muted;
        *self != before
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_args_override_file() {
        let mut settings = Settings::from_json( r#"{ "connection": { "host": "nas", "port": 9000 } }"# );
        assert_eq!( settings.connection.host, "nas" );
        assert_eq!( settings.connection.audio_port, 7906 );

        let args = Args { port: Some( 7000 ), tls: true, ..Args::default() };
        settings.apply_args( &args );
        assert_eq!( settings.connection.host, "nas" );
        assert_eq!( settings.connection.port, 7000 );
        assert!( settings.connection.use_tls );
    }


    #[test]
    fn test_malformed_file_falls_back_to_defaults() {
        assert_eq!( Settings::from_json( "not json" ), Settings::default() );
    }


    #[test]
    fn test_remember_flags() {
        let mut settings = Settings::default();
        let snapshot = SessionSnapshot { shuffled: true, repeat: RepeatMode::List, volume: 1.0, ..SessionSnapshot::default() };

        assert!( settings.remember( &snapshot ) );
        assert!( !settings.remember( &snapshot ) );
        assert_eq!( settings.session_options().repeat, RepeatMode::List );
    }
}
