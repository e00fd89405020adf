//! Sliding window over a remote list
//!
//! `SlidingWindow` virtualizes a large remote list behind a bounded LRU of
//! recently fetched items. Reads never wait: a missing or dirty item kicks
//! off a page fetch around it (unless the view is scrolling) and the result
//! arrives later on the window's update channel, to be applied with
//! `apply`.

use std::sync::Arc;

use tokio::sync::mpsc::{ unbounded_channel, UnboundedReceiver, UnboundedSender };
use tokio::task::JoinHandle;

use crate::cache::{ index_cache, IndexCache };
use crate::error::RequestError;
use crate::query::QueryFactory;


pub const WINDOW_CAPACITY: usize = 150;
pub const PAGE_SIZE: usize = 75;

/// Items fetched before the requested index.
pub const LOOK_BEHIND: usize = 10;


/// A completed fetch, delivered on the window's channel.
#[derive( Debug )]
pub enum WindowUpdate<T> {
    Counted { sequence: u64, count: Result<usize, RequestError> },
    Page { sequence: u64, offset: usize, limit: usize, items: Result<Vec<T>, RequestError> },
}


/// What changed after applying an update.
#[derive( Debug, Clone, PartialEq )]
pub enum WindowNotice {
    Reloaded { count: usize },
    Loaded { offset: usize, len: usize },
    Failed( RequestError ),
}


#[derive( Clone )]
struct Entry<T> {
    item: T,
    dirty: bool,
}


pub struct SlidingWindow<T: Clone + Send + Sync + 'static> {
    query: Arc<dyn QueryFactory<Item = T>>,
    cache: IndexCache<Entry<T>>,
    updates: UnboundedSender<WindowUpdate<T>>,
    sequence: u64,
    count: usize,
    scrolling: bool,
    fast_scrolling: bool,
    paused: bool,
    /// Last index read that was missing or dirty.
    wanted: Option<usize>,
    counting: Option<JoinHandle<()>>,
    paging: Option<JoinHandle<()>>,
}


impl<T: Clone + Send + Sync + 'static> SlidingWindow<T> {
    /// Creates an empty window. Call `requery` to load it.
    ///
    /// @returns The window and the channel its fetches complete on
    pub fn new( query: Arc<dyn QueryFactory<Item = T>> ) -> ( Self, UnboundedReceiver<WindowUpdate<T>> ) {
        let ( updates, rx ) = unbounded_channel();
        let window = Self {
            query,
            cache: index_cache( WINDOW_CAPACITY ),
            updates,
            sequence: 0,
            count: 0,
            scrolling: false,
            fast_scrolling: false,
            paused: false,
            wanted: None,
            counting: None,
            paging: None,
        };
        ( window, rx )
    }


    /// Number of items in the list as of the last count.
    pub fn count( &self ) -> usize {
        self.count
    }


    pub fn is_loading( &self ) -> bool {
        self.counting.is_some() || self.paging.is_some()
    }


    /// Recounts the list. Cached items stay readable but are refetched on
    /// their next read.
    pub fn requery( &mut self ) {
        let entries: Vec<_> = self.cache.iter().collect();
        for ( index, mut entry ) in entries {
            entry.dirty = true;
            self.cache.insert( *index, entry );
        }

        self.cancel_tasks();
        if self.paused {
            return;
        }

        tracing::debug!( "Window: requery (sequence {})", self.sequence );
        let query = Arc::clone( &self.query );
        let updates = self.updates.clone();
        let sequence = self.sequence;
        self.counting = Some( tokio::spawn( async move {
            let count = query.count().await;
            let _ = updates.send( WindowUpdate::Counted { sequence, count } );
        }));
    }


    /// Returns the cached item at `index`, possibly stale, and schedules a
    /// fetch if it is missing or dirty.
    pub fn item( &mut self, index: usize ) -> Option<T> {
        if index >= self.count {
            return None;
        }

        let ( item, fresh ) = match self.cache.get( &index ) {
            Some( entry ) => ( Some( entry.item ), !entry.dirty ),
            None => ( None, false ),
        };

        if !fresh {
            self.wanted = Some( index );
            self.fetch_wanted();
        }

        item
    }


    /// Applies a completed fetch. Results from before the last requery are
    /// dropped.
    pub fn apply( &mut self, update: WindowUpdate<T> ) -> Option<WindowNotice> {
        match update {
            WindowUpdate::Counted { sequence, count } => {
                if sequence != self.sequence {
                    return None;
                }
                self.counting = None;

                match count {
                    Ok( count ) => {
                        self.count = count;
                        self.fetch_wanted();
                        Some( WindowNotice::Reloaded { count } )
                    }
                    Err( e ) => {
                        tracing::warn!( "Window: count failed: {}", e );
                        Some( WindowNotice::Failed( e ) )
                    }
                }
            }
            WindowUpdate::Page { sequence, offset, limit, items } => {
                if sequence != self.sequence {
                    return None;
                }
                self.paging = None;

                match items {
                    Ok( items ) => {
                        let len = items.len();
                        for ( i, item ) in items.into_iter().enumerate() {
                            self.cache.insert( offset + i, Entry { item, dirty: false } );
                        }
                        // A short page means the list shrank since it was counted.
                        if len < limit {
                            self.count = self.count.min( offset + len );
                        }
                        if self.wanted.is_some_and( |w| ( offset..offset + limit ).contains( &w ) ) {
                            self.wanted = None;
                        }
                        self.fetch_wanted();
                        Some( WindowNotice::Loaded { offset, len } )
                    }
                    Err( e ) => {
                        tracing::warn!( "Window: page at {} failed: {}", offset, e );
                        self.wanted = None;
                        Some( WindowNotice::Failed( e ) )
                    }
                }
            }
        }
    }


    /// While scrolling, reads do not fetch.
    pub fn set_scrolling( &mut self, scrolling: bool ) {
        self.scrolling = scrolling;
        self.fetch_wanted();
    }


    /// Same as `set_scrolling`, for an external fast-scroll gesture.
    pub fn set_fast_scrolling( &mut self, fast_scrolling: bool ) {
        self.fast_scrolling = fast_scrolling;
        self.fetch_wanted();
    }


    /// Stops fetching and cancels pending work.
    pub fn pause( &mut self ) {
        self.paused = true;
        self.cancel_tasks();
    }


    /// Resumes fetching with a fresh count.
    pub fn resume( &mut self ) {
        self.paused = false;
        self.requery();
    }


    /// The underlying list changed on the server.
    pub fn on_queue_changed( &mut self ) {
        self.requery();
    }


    fn fetch_wanted( &mut self ) {
        if self.scrolling || self.fast_scrolling || self.paused {
            return;
        }
        if self.counting.is_some() || self.paging.is_some() {
            return;
        }

        let Some( index ) = self.wanted else {
            return;
        };
        if index >= self.count {
            self.wanted = None;
            return;
        }

        let offset = index.saturating_sub( LOOK_BEHIND );
        let limit = PAGE_SIZE.min( self.count - offset );
        tracing::trace!( "Window: fetching {}..{}", offset, offset + limit );

        let query = Arc::clone( &self.query );
        let updates = self.updates.clone();
        let sequence = self.sequence;
        self.paging = Some( tokio::spawn( async move {
            let items = query.page( offset, limit ).await;
            let _ = updates.send( WindowUpdate::Page { sequence, offset, limit, items } );
        }));
    }


    fn cancel_tasks( &mut self ) {
        self.sequence += 1;
        for task in self.counting.take().into_iter().chain( self.paging.take() ) {
            task.abort();
        }
    }
}


impl<T: Clone + Send + Sync + 'static> Drop for SlidingWindow<T> {
    fn drop( &mut self ) {
        self.cancel_tasks();
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::sync::atomic::{ AtomicUsize, Ordering };
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;


    struct Numbers {
        items: Mutex<Vec<u32>>,
        pages: AtomicUsize,
    }


    impl Numbers {
        fn new( count: u32 ) -> Arc<Self> {
            Arc::new( Self { items: Mutex::new( ( 0..count ).collect() ), pages: AtomicUsize::new( 0 ) } )
        }
    }


    #[async_trait]
    impl QueryFactory for Numbers {
        type Item = u32;


        async fn count( &self ) -> Result<usize, RequestError> {
            Ok( self.items.lock().unwrap().len() )
        }


        async fn page( &self, offset: usize, limit: usize ) -> Result<Vec<u32>, RequestError> {
            self.pages.fetch_add( 1, Ordering::SeqCst );
            Ok( self.items.lock().unwrap().iter().skip( offset ).take( limit ).copied().collect() )
        }
    }


    async fn next_notice( window: &mut SlidingWindow<u32>, rx: &mut UnboundedReceiver<WindowUpdate<u32>> ) -> WindowNotice {
        loop {
            let update = tokio::time::timeout( Duration::from_secs( 1 ), rx.recv() ).await.unwrap().unwrap();
            if let Some( notice ) = window.apply( update ) {
                return notice;
            }
        }
    }


    async fn loaded( count: u32 ) -> ( SlidingWindow<u32>, UnboundedReceiver<WindowUpdate<u32>>, Arc<Numbers> ) {
        let numbers = Numbers::new( count );
        let ( mut window, mut rx ) = SlidingWindow::new( Arc::clone( &numbers ) as Arc<dyn QueryFactory<Item = u32>> );
        window.requery();
        assert_eq!( next_notice( &mut window, &mut rx ).await, WindowNotice::Reloaded { count: count as usize } );
        ( window, rx, numbers )
    }


    #[tokio::test]
    async fn test_missing_item_fetches_page_around_it() {
        let ( mut window, mut rx, _ ) = loaded( 500 ).await;

        assert_eq!( window.item( 100 ), None );
        assert_eq!( next_notice( &mut window, &mut rx ).await, WindowNotice::Loaded { offset: 90, len: PAGE_SIZE } );
        assert_eq!( window.item( 100 ), Some( 100 ) );
        assert_eq!( window.item( 90 ), Some( 90 ) );
        assert_eq!( window.item( 500 ), None );
    }


    #[tokio::test]
    async fn test_page_is_clipped_to_count() {
        let ( mut window, mut rx, _ ) = loaded( 30 ).await;

        window.item( 25 );
        assert_eq!( next_notice( &mut window, &mut rx ).await, WindowNotice::Loaded { offset: 15, len: 15 } );
    }


    #[tokio::test]
    async fn test_scrolling_defers_fetch() {
        let ( mut window, mut rx, numbers ) = loaded( 500 ).await;

        window.set_scrolling( true );
        assert_eq!( window.item( 200 ), None );
        assert_eq!( window.item( 210 ), None );
        tokio::time::sleep( Duration::from_millis( 20 ) ).await;
        assert_eq!( numbers.pages.load( Ordering::SeqCst ), 0 );

        window.set_scrolling( false );
        assert_eq!( next_notice( &mut window, &mut rx ).await, WindowNotice::Loaded { offset: 200, len: PAGE_SIZE } );
        assert_eq!( numbers.pages.load( Ordering::SeqCst ), 1 );
    }


    #[tokio::test]
    async fn test_fast_scroll_defers_fetch() {
        let ( mut window, mut rx, numbers ) = loaded( 500 ).await;

        window.set_fast_scrolling( true );
        window.item( 300 );
        tokio::time::sleep( Duration::from_millis( 20 ) ).await;
        assert_eq!( numbers.pages.load( Ordering::SeqCst ), 0 );

        window.set_fast_scrolling( false );
        assert_eq!( next_notice( &mut window, &mut rx ).await, WindowNotice::Loaded { offset: 290, len: PAGE_SIZE } );
    }


    #[tokio::test]
    async fn test_requery_serves_stale_items_then_refreshes() {
        let ( mut window, mut rx, numbers ) = loaded( 100 ).await;
        window.item( 5 );
        next_notice( &mut window, &mut rx ).await;

        numbers.items.lock().unwrap()[ 5 ] = 555;
        window.on_queue_changed();
        assert_eq!( next_notice( &mut window, &mut rx ).await, WindowNotice::Reloaded { count: 100 } );

        // Dirty but still readable.
        assert_eq!( window.item( 5 ), Some( 5 ) );
        next_notice( &mut window, &mut rx ).await;
        assert_eq!( window.item( 5 ), Some( 555 ) );
    }


    #[tokio::test]
    async fn test_stale_updates_are_dropped() {
        let ( mut window, _rx, _ ) = loaded( 100 ).await;

        let stale = WindowUpdate::Page { sequence: 0, offset: 0, limit: 3, items: Ok( vec![ 9, 9, 9 ] ) };
        assert_eq!( window.apply( stale ), None );
        assert_eq!( window.count(), 100 );

        window.requery();
        let stale = WindowUpdate::Counted { sequence: 1, count: Ok( 3 ) };
        assert_eq!( window.apply( stale ), None );
    }


    #[tokio::test]
    async fn test_pause_stops_fetching_until_resumed() {
        let ( mut window, mut rx, numbers ) = loaded( 100 ).await;

        window.pause();
        window.item( 50 );
        tokio::time::sleep( Duration::from_millis( 20 ) ).await;
        assert_eq!( numbers.pages.load( Ordering::SeqCst ), 0 );

        window.resume();
        assert_eq!( next_notice( &mut window, &mut rx ).await, WindowNotice::Reloaded { count: 100 } );
        assert_eq!( next_notice( &mut window, &mut rx ).await, WindowNotice::Loaded { offset: 40, len: 60 } );
    }


    #[tokio::test]
    async fn test_short_page_shrinks_count_without_refetching() {
        let ( mut window, mut rx, numbers ) = loaded( 100 ).await;
        numbers.items.lock().unwrap().truncate( 45 );

        assert_eq!( window.item( 50 ), None );
        assert_eq!( next_notice( &mut window, &mut rx ).await, WindowNotice::Loaded { offset: 40, len: 5 } );
        assert_eq!( window.count(), 45 );
        assert_eq!( window.item( 44 ), Some( 44 ) );
        assert_eq!( window.item( 50 ), None );

        tokio::time::sleep( Duration::from_millis( 20 ) ).await;
        assert!( rx.try_recv().is_err() );
        assert_eq!( numbers.pages.load( Ordering::SeqCst ), 1 );
    }


    #[tokio::test]
    async fn test_empty_page_ends_the_list_there() {
        let ( mut window, mut rx, numbers ) = loaded( 100 ).await;
        numbers.items.lock().unwrap().clear();

        window.item( 50 );
        assert_eq!( next_notice( &mut window, &mut rx ).await, WindowNotice::Loaded { offset: 40, len: 0 } );
        assert_eq!( window.count(), 40 );

        tokio::time::sleep( Duration::from_millis( 20 ) ).await;
        assert!( rx.try_recv().is_err() );
        assert_eq!( numbers.pages.load( Ordering::SeqCst ), 1 );
    }


    #[tokio::test]
    async fn test_cache_is_bounded() {
        let ( mut window, mut rx, _ ) = loaded( 1000 ).await;

        for index in [ 10, 110, 210, 310 ] {
            window.item( index );
            next_notice( &mut window, &mut rx ).await;
        }

        window.cache.run_pending_tasks();
        assert!( window.cache.entry_count() <= WINDOW_CAPACITY as u64 );
        assert!( window.cache.contains_key( &310 ) );
        assert!( !window.cache.contains_key( &0 ) );
    }
}
