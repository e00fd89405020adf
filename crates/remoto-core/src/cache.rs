//! Bounded caches keyed by absolute queue index.
//!
//! Used for the session's track-metadata cache and the sliding window's item
//! cache. Eviction is least-recently-used so the entries around the reader
//! survive while it moves through a long list.

use moka::policy::EvictionPolicy;
use moka::sync::Cache;


pub type IndexCache<V> = Cache<usize, V>;


/// Creates an empty cache holding at most `capacity` entries.
pub fn index_cache<V: Clone + Send + Sync + 'static>( capacity: usize ) -> IndexCache<V> {
    Cache::builder()
        .max_capacity( capacity as u64 )
        .eviction_policy( EvictionPolicy::lru() )
        .build()
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_evicts_least_recently_used() {
        let cache = index_cache( 2 );
        cache.insert( 1, "a" );
        cache.insert( 2, "b" );
        cache.run_pending_tasks();
        cache.get( &1 );
        cache.insert( 3, "c" );
        cache.run_pending_tasks();

        assert!( cache.contains_key( &1 ) );
        assert!( !cache.contains_key( &2 ) );
        assert!( cache.contains_key( &3 ) );
        assert_eq!( cache.entry_count(), 2 );
    }


    #[test]
    fn test_reinsert_replaces_value() {
        let cache = index_cache( 3 );
        cache.insert( 1, 10 );
        cache.insert( 1, 11 );
        cache.run_pending_tasks();
        assert_eq!( cache.entry_count(), 1 );
        assert_eq!( cache.get( &1 ), Some( 11 ) );
    }


    #[test]
    fn test_invalidate_all_hides_entries_immediately() {
        let cache = index_cache( 4 );
        cache.insert( 7, "x" );
        cache.invalidate_all();
        assert_eq!( cache.get( &7 ), None );

        cache.insert( 8, "y" );
        assert_eq!( cache.get( &8 ), Some( "y" ) );
    }
}
