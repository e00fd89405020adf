//! Wire messages
//!
//! A `SocketMessage` is one immutable protocol frame: a request, a response
//! or a broadcast. Frames serialize to a JSON object with `name`, `id`,
//! `type` and an optional `options` payload. Option lookups are permissive:
//! a missing or mistyped key yields the caller-supplied default.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{ AtomicU64, Ordering };

use serde_json::{ Map, Value };

use crate::error::MessageError;
use crate::protocol::{ frame, key };


static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new( 0 );


/// Returns a process-wide unique message id.
pub fn next_message_id() -> String {
    format!( "remoto-{}", NEXT_MESSAGE_ID.fetch_add( 1, Ordering::Relaxed ) )
}


/// Kind of frame.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Hash )]
pub enum MessageType {
    Request,
    Response,
    Broadcast,
}


impl MessageType {
    /// Returns the wire representation.
    pub fn as_str( &self ) -> &'static str {
        match self {
            MessageType::Request => "request",
            MessageType::Response => "response",
            MessageType::Broadcast => "broadcast",
        }
    }
}


impl FromStr for MessageType {
    type Err = MessageError;


    fn from_str( s: &str ) -> Result<Self, Self::Err> {
        match s {
            "request" => Ok( MessageType::Request ),
            "response" => Ok( MessageType::Response ),
            "broadcast" => Ok( MessageType::Broadcast ),
            other => Err( MessageError::UnknownType( other.to_string() ) ),
        }
    }
}


/// One protocol frame.
#[derive( Debug, Clone, PartialEq )]
pub struct SocketMessage {
    name: String,
    id: String,
    kind: MessageType,
    options: Map<String, Value>,
}


impl SocketMessage {
    /// Parses a frame from its JSON text.
    ///
    /// @param text - Raw frame as received from the socket
    ///
    /// @returns The parsed message, or an error if `name`, `id` or `type`
    /// is missing or invalid
    pub fn parse( text: &str ) -> Result<Self, MessageError> {
        let mut root: Map<String, Value> = serde_json::from_str( text )?;

        let name = match root.remove( frame::NAME ) {
            Some( Value::String( s ) ) if !s.is_empty() => s,
            _ => return Err( MessageError::MissingField( frame::NAME ) ),
        };

        let id = match root.remove( frame::ID ) {
            Some( Value::String( s ) ) if !s.is_empty() => s,
            _ => return Err( MessageError::MissingField( frame::ID ) ),
        };

        let kind = match root.remove( frame::TYPE ) {
            Some( Value::String( s ) ) => s.parse()?,
            _ => return Err( MessageError::MissingField( frame::TYPE ) ),
        };

        let options = match root.remove( frame::OPTIONS ) {
            Some( Value::Object( map ) ) => map,
            _ => Map::new(),
        };

        Ok( Self { name, id, kind, options } )
    }


    pub fn name( &self ) -> &str {
        &self.name
    }


    pub fn id( &self ) -> &str {
        &self.id
    }


    pub fn kind( &self ) -> MessageType {
        self.kind
    }


    pub fn options( &self ) -> &Map<String, Value> {
        &self.options
    }


    /// Returns true if the payload contains `key`.
    pub fn has_option( &self, key: &str ) -> bool {
        self.options.contains_key( key )
    }


    /// Returns the non-empty `error` option carried by a failed response.
    pub fn error( &self ) -> Option<&str> {
        match self.options.get( key::ERROR ) {
            Some( Value::String( s ) ) if !s.is_empty() => Some( s.as_str() ),
            _ => None,
        }
    }


    pub fn get_string( &self, key: &str, default: &str ) -> String {
        match self.options.get( key ) {
            Some( Value::String( s ) ) => s.clone(),
            Some( Value::Number( n ) ) => n.to_string(),
            Some( Value::Bool( b ) ) => b.to_string(),
            _ => default.to_string(),
        }
    }


    pub fn get_i64( &self, key: &str, default: i64 ) -> i64 {
        self.options.get( key ).and_then( value_as_i64 ).unwrap_or( default )
    }


    pub fn get_i32( &self, key: &str, default: i32 ) -> i32 {
        self.options
            .get( key )
            .and_then( value_as_i64 )
            .and_then( |v| i32::try_from( v ).ok() )
            .unwrap_or( default )
    }


    pub fn get_f64( &self, key: &str, default: f64 ) -> f64 {
        match self.options.get( key ) {
            Some( Value::Number( n ) ) => n.as_f64().unwrap_or( default ),
            Some( Value::String( s ) ) => s.trim().parse().unwrap_or( default ),
            _ => default,
        }
    }


    pub fn get_bool( &self, key: &str, default: bool ) -> bool {
        match self.options.get( key ) {
            Some( Value::Bool( b ) ) => *b,
            Some( Value::String( s ) ) => match s.as_str() {
                "true" => true,
                "false" => false,
                _ => default,
            },
            _ => default,
        }
    }


    pub fn get_object( &self, key: &str ) -> Option<&Map<String, Value>> {
        self.options.get( key ).and_then( Value::as_object )
    }


    pub fn get_array( &self, key: &str ) -> Option<&Vec<Value>> {
        self.options.get( key ).and_then( Value::as_array )
    }


    /// Returns the frame as a JSON value.
    pub fn to_value( &self ) -> Value {
        let mut root = Map::new();
        root.insert( frame::NAME.into(), Value::String( self.name.clone() ) );
        root.insert( frame::ID.into(), Value::String( self.id.clone() ) );
        root.insert( frame::TYPE.into(), Value::String( self.kind.as_str().into() ) );
        root.insert( frame::OPTIONS.into(), Value::Object( self.options.clone() ) );
        Value::Object( root )
    }
}


impl fmt::Display for SocketMessage {
    fn fmt( &self, f: &mut fmt::Formatter<'_> ) -> fmt::Result {
        write!( f, "{}", self.to_value() )
    }
}


fn value_as_i64( value: &Value ) -> Option<i64> {
    match value {
        Value::Number( n ) => n.as_i64().or_else( || n.as_f64().map( |f| f as i64 ) ),
        Value::String( s ) => s.trim().parse().ok(),
        Value::Bool( b ) => Some( *b as i64 ),
        _ => None,
    }
}


/// Builds `SocketMessage`s.
#[derive( Debug, Clone )]
pub struct MessageBuilder {
    name: String,
    id: String,
    kind: MessageType,
    options: Map<String, Value>,
}


impl MessageBuilder {
    /// Starts a request with a fresh id.
    pub fn request( name: impl Into<String> ) -> Self {
        Self::new( name.into(), next_message_id(), MessageType::Request )
    }


    /// Starts a broadcast with a fresh id.
    pub fn broadcast( name: impl Into<String> ) -> Self {
        Self::new( name.into(), next_message_id(), MessageType::Broadcast )
    }


    /// Starts a response echoing the name and id of `message`.
    pub fn respond_to( message: &SocketMessage ) -> Self {
        Self::new( message.name.clone(), message.id.clone(), MessageType::Response )
    }


    /// Starts a copy of `message` with a fresh id, keeping its name, type
    /// and options. Used to derive paged variants of a cached query.
    pub fn build_upon( message: &SocketMessage ) -> Self {
        Self {
            name: message.name.clone(),
            id: next_message_id(),
            kind: message.kind,
            options: message.options.clone(),
        }
    }


    fn new( name: String, id: String, kind: MessageType ) -> Self {
        Self { name, id, kind, options: Map::new() }
    }


    pub fn add_option( mut self, key: &str, value: impl Into<Value> ) -> Self {
        self.options.insert( key.to_string(), value.into() );
        self
    }


    pub fn add_options( mut self, options: Map<String, Value> ) -> Self {
        self.options.extend( options );
        self
    }


    pub fn remove_option( mut self, key: &str ) -> Self {
        self.options.remove( key );
        self
    }


    pub fn build( self ) -> SocketMessage {
        SocketMessage {
            name: self.name,
            id: self.id,
            kind: self.kind,
            options: self.options,
        }
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use serde_json::json;


    #[test]
    fn test_round_trip_preserves_fields() {
        let message = MessageBuilder::request( "query_tracks" )
            .add_option( "filter", "abc" )
            .add_option( "limit", 10 )
            .add_option( "nested", json!( { "a": [ 1, 2, 3 ] } ) )
            .build();

        let parsed = SocketMessage::parse( &message.to_string() ).unwrap();
        assert_eq!( parsed, message );
    }


    #[test]
    fn test_ids_are_unique() {
        let a = MessageBuilder::request( "ping" ).build();
        let b = MessageBuilder::request( "ping" ).build();
        assert_ne!( a.id(), b.id() );
    }


    #[test]
    fn test_respond_to_echoes_name_and_id() {
        let request = MessageBuilder::request( "authenticate" ).build();
        let response = MessageBuilder::respond_to( &request ).build();
        assert_eq!( response.name(), "authenticate" );
        assert_eq!( response.id(), request.id() );
        assert_eq!( response.kind(), MessageType::Response );
    }


    #[test]
    fn test_build_upon_copies_options_with_new_id() {
        let base = MessageBuilder::request( "query_tracks" )
            .add_option( "filter", "x" )
            .build();
        let derived = MessageBuilder::build_upon( &base )
            .add_option( "offset", 20 )
            .build();

        assert_ne!( derived.id(), base.id() );
        assert_eq!( derived.get_string( "filter", "" ), "x" );
        assert_eq!( derived.get_i32( "offset", 0 ), 20 );
        assert!( !base.has_option( "offset" ) );
    }


    #[test]
    fn test_missing_options_default_to_empty() {
        let parsed = SocketMessage::parse( r#"{"name":"ping","id":"1","type":"response"}"# ).unwrap();
        assert!( parsed.options().is_empty() );
        assert_eq!( parsed.get_i32( "count", 7 ), 7 );
        assert_eq!( parsed.get_string( "title", "none" ), "none" );
        assert!( parsed.get_bool( "success", true ) );
    }


    #[test]
    fn test_typed_accessors_coerce() {
        let parsed = SocketMessage::parse(
            r#"{"name":"x","id":"1","type":"response","options":{"count":"12","big":5000000000,"ratio":0.5}}"#
        ).unwrap();
        assert_eq!( parsed.get_i32( "count", 0 ), 12 );
        assert_eq!( parsed.get_i64( "big", 0 ), 5_000_000_000 );
        assert_eq!( parsed.get_i32( "big", -1 ), -1 );
        assert_eq!( parsed.get_f64( "ratio", 0.0 ), 0.5 );
    }


    #[test]
    fn test_error_option() {
        let parsed = SocketMessage::parse(
            r#"{"name":"x","id":"1","type":"response","options":{"error":"bad request"}}"#
        ).unwrap();
        assert_eq!( parsed.error(), Some( "bad request" ) );

        let empty = SocketMessage::parse(
            r#"{"name":"x","id":"1","type":"response","options":{"error":""}}"#
        ).unwrap();
        assert_eq!( empty.error(), None );
    }


    #[test]
    fn test_parse_rejects_incomplete_frames() {
        assert!( matches!(
            SocketMessage::parse( r#"{"id":"1","type":"request"}"# ),
            Err( MessageError::MissingField( "name" ) )
        ));
        assert!( matches!(
            SocketMessage::parse( r#"{"name":"x","type":"request"}"# ),
            Err( MessageError::MissingField( "id" ) )
        ));
        assert!( matches!(
            SocketMessage::parse( r#"{"name":"x","id":"1","type":"bogus"}"# ),
            Err( MessageError::UnknownType( _ ) )
        ));
        assert!( SocketMessage::parse( "not json" ).is_err() );
    }
}
