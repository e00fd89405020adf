//! Connection configuration
//!
//! Server address, credentials, transcoding preferences and every protocol
//! interval. All fields have defaults so partial settings files load.

use std::time::Duration;

use serde::{ Deserialize, Serialize };

use crate::track::Track;


/// Protocol intervals. Serialized in milliseconds.
#[derive( Debug, Clone, PartialEq, Eq, Serialize, Deserialize )]
#[serde( default )]
pub struct Timing {
    /// Delay before retrying after a transient disconnect.
    #[serde( with = "millis" )]
    pub reconnect_backoff: Duration,

    /// Age after which an unanswered request is failed with a timeout.
    #[serde( with = "millis" )]
    pub request_timeout: Duration,

    /// Limit on socket connect plus authentication.
    #[serde( with = "millis" )]
    pub connect_timeout: Duration,

    /// Keepalive period. A ping unanswered for twice this long drops the link.
    #[serde( with = "millis" )]
    pub ping_interval: Duration,

    /// Retry period after a network-availability signal.
    #[serde( with = "millis" )]
    pub network_failsafe: Duration,

    /// Grace period between the last client leaving and the socket closing.
    #[serde( with = "millis" )]
    pub disconnect_grace: Duration,

    /// How often stale correlation entries are swept.
    #[serde( with = "millis" )]
    pub sweep_interval: Duration,
}


impl Default for Timing {
    fn default() -> Self {
        Self {
            reconnect_backoff: Duration::from_millis( 2000 ),
            request_timeout: Duration::from_millis( 30_000 ),
            connect_timeout: Duration::from_millis( 5000 ),
            ping_interval: Duration::from_millis( 3500 ),
            network_failsafe: Duration::from_millis( 2000 ),
            disconnect_grace: Duration::from_millis( 10_000 ),
            sweep_interval: Duration::from_millis( 5000 ),
        }
    }
}


impl Timing {
    /// Time without a keepalive reply after which the link is considered dead.
    pub fn keepalive_timeout( &self ) -> Duration {
        self.ping_interval * 2
    }
}


/// Where and how to reach the server.
#[derive( Debug, Clone, PartialEq, Eq, Serialize, Deserialize )]
#[serde( default )]
pub struct ConnectionConfig {
    pub host: String,

    /// WebSocket (metadata) port.
    pub port: u16,

    /// HTTP audio port.
    pub audio_port: u16,

    pub password: String,

    pub use_tls: bool,

    /// Ask the server to transcode streams to this bitrate (kbps).
    pub transcode_bitrate: Option<u32>,

    /// Container requested when transcoding.
    pub transcode_format: String,

    pub timing: Timing,
}


impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 7905,
            audio_port: 7906,
            password: String::new(),
            use_tls: false,
            transcode_bitrate: None,
            transcode_format: "mp3".to_string(),
            timing: Timing::default(),
        }
    }
}


impl ConnectionConfig {
    /// Returns the WebSocket url.
    pub fn socket_url( &self ) -> String {
        let scheme = if self.use_tls { "wss" } else { "ws" };
        format!( "{}://{}:{}", scheme, self.host, self.port )
    }


    /// Returns true when streams are requested transcoded.
    pub fn is_transcoding( &self ) -> bool {
        self.transcode_bitrate.is_some()
    }
}


/// Resolves the audio url for a track.
#[derive( Debug, Clone, PartialEq, Eq )]
pub struct StreamUrls {
    base: String,
    bitrate: Option<u32>,
    format: String,
}


impl StreamUrls {
    pub fn new( config: &ConnectionConfig ) -> Self {
        let scheme = if config.use_tls { "https" } else { "http" };
        Self {
            base: format!( "{}://{}:{}", scheme, config.host, config.audio_port ),
            bitrate: config.transcode_bitrate,
            format: config.transcode_format.clone(),
        }
    }


    /// Returns true when urls request a transcoded stream.
    pub fn is_transcoding( &self ) -> bool {
        self.bitrate.is_some()
    }


    /// Returns the track's own uri if it has one, otherwise the server's
    /// external-id endpoint. `None` when the track has neither.
    pub fn resolve( &self, track: &Track ) -> Option<String> {
        if !track.uri.is_empty() {
            return Some( track.uri.clone() );
        }

        if track.external_id.is_empty() {
            return None;
        }

        let mut url = format!(
            "{}/audio/external_id/{}",
            self.base,
            urlencoding::encode( &track.external_id )
        );

        if let Some( bitrate ) = self.bitrate {
            url.push_str( &format!( "?bitrate={}&format={}", bitrate, self.format ) );
        }

        Some( url )
    }
}


mod millis {
    use std::time::Duration;

    use serde::{ Deserialize, Deserializer, Serializer };


    pub fn serialize<S: Serializer>( value: &Duration, serializer: S ) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64( value.as_millis() as u64 )
    }


    pub fn deserialize<'de, D: Deserializer<'de>>( deserializer: D ) -> Result<Duration, D::Error> {
        u64::deserialize( deserializer ).map( Duration::from_millis )
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    fn track( uri: &str, external_id: &str ) -> Track {
        Track {
            uri: uri.to_string(),
            external_id: external_id.to_string(),
            ..Track::default()
        }
    }


    #[test]
    fn test_keepalive_timeout_is_twice_interval() {
        let timing = Timing::default();
        assert_eq!( timing.keepalive_timeout(), Duration::from_millis( 7000 ) );
    }


    #[test]
    fn test_socket_url() {
        let mut config = ConnectionConfig::default();
        config.host = "10.0.0.2".into();
        assert_eq!( config.socket_url(), "ws://10.0.0.2:7905" );
        config.use_tls = true;
        assert_eq!( config.socket_url(), "wss://10.0.0.2:7905" );
    }


    #[test]
    fn test_stream_url_prefers_track_uri() {
        let urls = StreamUrls::new( &ConnectionConfig::default() );
        let url = urls.resolve( &track( "http://elsewhere/a.mp3", "ext" ) );
        assert_eq!( url.as_deref(), Some( "http://elsewhere/a.mp3" ) );
    }


    #[test]
    fn test_stream_url_from_external_id() {
        let mut config = ConnectionConfig::default();
        config.transcode_bitrate = Some( 192 );
        let urls = StreamUrls::new( &config );
        let url = urls.resolve( &track( "", "a b" ) );
        assert_eq!(
            url.as_deref(),
            Some( "http://localhost:7906/audio/external_id/a%20b?bitrate=192&format=mp3" )
        );
    }


    #[test]
    fn test_stream_url_missing() {
        let urls = StreamUrls::new( &ConnectionConfig::default() );
        assert_eq!( urls.resolve( &track( "", "" ) ), None );
    }


    #[test]
    fn test_partial_config_uses_defaults() {
        let config: ConnectionConfig = serde_json::from_str(
            r#"{ "host": "music.lan", "timing": { "ping_interval": 1000 } }"#
        ).unwrap();
        assert_eq!( config.host, "music.lan" );
        assert_eq!( config.port, 7905 );
        assert_eq!( config.timing.ping_interval, Duration::from_millis( 1000 ) );
        assert_eq!( config.timing.reconnect_backoff, Duration::from_millis( 2000 ) );
    }
}
