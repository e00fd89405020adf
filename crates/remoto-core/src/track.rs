//! Track and category models as returned by the server.

use serde::{ Deserialize, Serialize };
use serde_json::Value;


/// Metadata for one track.
#[derive( Debug, Clone, Default, PartialEq, Serialize, Deserialize )]
#[serde( default )]
pub struct Track {
    pub id: i64,
    pub external_id: String,
    /// Direct stream uri, when the server provides one.
    pub uri: String,
    pub title: String,
    pub album: String,
    pub album_id: i64,
    pub album_artist: String,
    pub album_artist_id: i64,
    pub artist: String,
    pub artist_id: i64,
    pub genre: String,
    pub genre_id: i64,
    #[serde( rename = "track" )]
    pub track_num: i32,
    pub thumbnail_id: i64,
    /// Duration in seconds, zero when unknown.
    pub duration: f64,
}


impl Track {
    /// Parses a track from a JSON object, ignoring unknown keys.
    pub fn from_value( value: &Value ) -> Option<Self> {
        if !value.is_object() {
            return None;
        }

        match serde_json::from_value( value.clone() ) {
            Ok( track ) => Some( track ),
            Err( e ) => {
                tracing::debug!( "Skipping malformed track: {}", e );
                None
            }
        }
    }


    /// Parses every well-formed track in `values`.
    pub fn from_values( values: &[Value] ) -> Vec<Self> {
        values.iter().filter_map( Self::from_value ).collect()
    }


    /// Title suitable for display.
    pub fn display_title( &self ) -> &str {
        if self.title.is_empty() {
            "Unknown title"
        } else {
            &self.title
        }
    }
}


/// One value of a browse category (an album, an artist, a genre...).
#[derive( Debug, Clone, Default, PartialEq, Serialize, Deserialize )]
#[serde( default )]
pub struct CategoryValue {
    pub id: i64,
    pub value: String,
}


impl CategoryValue {
    pub fn from_values( values: &[Value] ) -> Vec<Self> {
        values
            .iter()
            .filter_map( |v| serde_json::from_value( v.clone() ).ok() )
            .collect()
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use serde_json::json;


    #[test]
    fn test_parse_track() {
        let value = json!({
            "id": 12,
            "external_id": "abc",
            "title": "Song",
            "track": 3,
            "album": "Record",
            "artist_id": 7,
            "unknown_key": true
        });

        let track = Track::from_value( &value ).unwrap();
        assert_eq!( track.id, 12 );
        assert_eq!( track.external_id, "abc" );
        assert_eq!( track.track_num, 3 );
        assert_eq!( track.artist_id, 7 );
        assert_eq!( track.uri, "" );
    }


    #[test]
    fn test_from_values_skips_garbage() {
        let values = vec![ json!( { "id": 1 } ), json!( "nope" ), json!( { "id": "x" } ) ];
        let tracks = Track::from_values( &values );
        assert_eq!( tracks.len(), 1 );
        assert_eq!( tracks[ 0 ].id, 1 );
    }


    #[test]
    fn test_display_title() {
        let track = Track::default();
        assert_eq!( track.display_title(), "Unknown title" );
    }
}
