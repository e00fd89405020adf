//! Query abstraction
//!
//! Lists on the server are remote, filterable and paginated. A
//! `QueryContext` describes which list, a `QueryFactory` fetches its size
//! and pages of it. The session engine and the sliding window both consume
//! lists only through these traits.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::RequestError;
use crate::provider::ProviderEvent;
use crate::track::Track;


/// Which server request backs a query.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Hash )]
pub enum QueryKind {
    /// Every track in the library, optionally filtered.
    Tracks,
    /// Tracks belonging to one category value (an album, an artist, ...).
    TracksByCategory,
    /// The server's live play queue.
    PlayQueue,
    /// A frozen copy of the server's play queue.
    Snapshot,
}


/// Immutable description of the active list.
#[derive( Debug, Clone, PartialEq, Eq )]
pub struct QueryContext {
    pub kind: QueryKind,
    pub category: Option<String>,
    pub category_id: i64,
    pub filter: String,
}


impl QueryContext {
    pub fn all_tracks( filter: impl Into<String> ) -> Self {
        Self {
            kind: QueryKind::Tracks,
            category: None,
            category_id: -1,
            filter: filter.into(),
        }
    }


    /// Tracks of one category value. An empty category falls back to all
    /// tracks.
    pub fn by_category( category: impl Into<String>, id: i64, filter: impl Into<String> ) -> Self {
        let category = category.into();
        if category.is_empty() {
            return Self::all_tracks( filter );
        }

        Self {
            kind: QueryKind::TracksByCategory,
            category: Some( category ),
            category_id: id,
            filter: filter.into(),
        }
    }


    pub fn play_queue() -> Self {
        Self {
            kind: QueryKind::PlayQueue,
            category: None,
            category_id: -1,
            filter: String::new(),
        }
    }


    pub fn snapshot() -> Self {
        Self {
            kind: QueryKind::Snapshot,
            category: None,
            category_id: -1,
            filter: String::new(),
        }
    }


    pub fn is_snapshot( &self ) -> bool {
        self.kind == QueryKind::Snapshot
    }
}


/// Fetches the size of a remote list and pages of it.
#[async_trait]
pub trait QueryFactory: Send + Sync {
    type Item: Clone + Send + 'static;

    async fn count( &self ) -> Result<usize, RequestError>;

    /// Up to `limit` items starting at absolute index `offset`.
    async fn page( &self, offset: usize, limit: usize ) -> Result<Vec<Self::Item>, RequestError>;
}


pub type TrackQueryFactory = Arc<dyn QueryFactory<Item = Track>>;


/// Where the session engine gets its tracks from.
#[async_trait]
pub trait TrackSource: Send + Sync + 'static {
    /// Returns a factory for `context`.
    fn query( &self, context: Arc<QueryContext> ) -> TrackQueryFactory;

    /// Asks the server to freeze its current play queue.
    async fn snapshot_play_queue( &self ) -> Result<(), RequestError>;

    /// Releases a snapshot taken earlier. Fire and forget.
    fn invalidate_play_queue_snapshot( &self );

    /// Starts holding the connection open.
    fn attach( &self );

    /// Stops holding the connection open.
    fn detach( &self );

    /// Server-side notifications about the lists this source serves.
    fn subscribe( &self ) -> broadcast::Receiver<ProviderEvent>;
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_empty_category_means_all_tracks() {
        let context = QueryContext::by_category( "", 12, "foo" );
        assert_eq!( context.kind, QueryKind::Tracks );
        assert_eq!( context.category, None );
        assert_eq!( context.filter, "foo" );
    }


    #[test]
    fn test_category_context() {
        let context = QueryContext::by_category( "album", 12, "" );
        assert_eq!( context.kind, QueryKind::TracksByCategory );
        assert_eq!( context.category.as_deref(), Some( "album" ) );
        assert_eq!( context.category_id, 12 );
        assert!( !context.is_snapshot() );
        assert!( QueryContext::snapshot().is_snapshot() );
    }
}
