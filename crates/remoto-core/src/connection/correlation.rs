//! Correlation table: in-flight requests keyed by message id.

use std::collections::HashMap;
use std::time::{ Duration, Instant };

use tokio::sync::oneshot;

use super::{ CallId, ClientId, ResponseCallback };
use crate::error::RequestError;
use crate::message::SocketMessage;


/// How the outcome of a request is delivered.
pub enum Completion {
    Callback( ResponseCallback ),
    Channel( oneshot::Sender<Result<SocketMessage, RequestError>> ),
}


impl Completion {
    /// Delivers `result`. Consumes the completion so it can only fire once.
    pub fn complete( self, result: Result<SocketMessage, RequestError> ) {
        match self {
            Completion::Callback( callback ) => callback( result ),
            Completion::Channel( tx ) => {
                // Receiver gone means the caller stopped caring.
                let _ = tx.send( result );
            }
        }
    }
}


impl std::fmt::Debug for Completion {
    fn fmt( &self, f: &mut std::fmt::Formatter<'_> ) -> std::fmt::Result {
        match self {
            Completion::Callback( _ ) => f.write_str( "Completion::Callback" ),
            Completion::Channel( _ ) => f.write_str( "Completion::Channel" ),
        }
    }
}


pub( crate ) enum Waiter {
    External( Completion ),
    Keepalive,
}


pub( crate ) struct Entry {
    pub call: CallId,
    pub client: ClientId,
    pub enqueued: Instant,
    pub intercepted: bool,
    pub waiter: Waiter,
}


impl Entry {
    /// Fails the entry. Keepalive entries are dropped silently.
    pub fn fail( self, error: RequestError ) {
        if let Waiter::External( completion ) = self.waiter {
            completion.complete( Err( error ) );
        }
    }
}


#[derive( Default )]
pub( crate ) struct CorrelationTable {
    entries: HashMap<String, Entry>,
}


impl CorrelationTable {
    /// Adds an entry. A previous entry for the same message id is returned
    /// so the caller can fail it; only one may be live at a time.
    pub fn insert( &mut self, message_id: String, entry: Entry ) -> Option<Entry> {
        self.entries.insert( message_id, entry )
    }


    pub fn take( &mut self, message_id: &str ) -> Option<Entry> {
        self.entries.remove( message_id )
    }


    pub fn take_call( &mut self, call: CallId ) -> Option<Entry> {
        let key = self.entries
            .iter()
            .find( |( _, entry )| entry.call == call )
            .map( |( key, _ )| key.clone() )?;
        self.entries.remove( &key )
    }


    /// Removes every entry matching `predicate`.
    pub fn drain_where<F>( &mut self, mut predicate: F ) -> Vec<Entry>
    where
        F: FnMut( &Entry ) -> bool,
    {
        let keys: Vec<String> = self.entries
            .iter()
            .filter( |( _, entry )| predicate( entry ) )
            .map( |( key, _ )| key.clone() )
            .collect();

        keys.iter().filter_map( |key| self.entries.remove( key ) ).collect()
    }


    /// Removes entries older than `timeout`.
    pub fn expire( &mut self, now: Instant, timeout: Duration ) -> Vec<Entry> {
        self.drain_where( |entry| now.saturating_duration_since( entry.enqueued ) > timeout )
    }


    pub fn len( &self ) -> usize {
        self.entries.len()
    }
}
