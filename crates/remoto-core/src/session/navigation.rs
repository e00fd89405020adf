//! Shuffle and repeat navigation.

use rand::Rng;
use serde::{ Deserialize, Serialize };


/// What happens at the end of a track or the queue.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize )]
pub enum RepeatMode {
    #[default]
    None,
    List,
    Track,
}


impl RepeatMode {
    /// None → List → Track → None.
    pub fn next( self ) -> Self {
        match self {
            RepeatMode::None => RepeatMode::List,
            RepeatMode::List => RepeatMode::Track,
            RepeatMode::Track => RepeatMode::None,
        }
    }


    pub fn label( &self ) -> &'static str {
        match self {
            RepeatMode::None => "off",
            RepeatMode::List => "list",
            RepeatMode::Track => "track",
        }
    }
}


/// Index that plays after `current`, or `None` when playback should stop.
///
/// A manual skip (`user_initiated`) ignores track repeat. Shuffle picks
/// uniformly among every index except `current`.
pub fn resolve_next_index<R: Rng + ?Sized>(
    shuffled: bool,
    repeat: RepeatMode,
    user_initiated: bool,
    current: usize,
    count: usize,
    rng: &mut R,
) -> Option<usize> {
    if count == 0 {
        return None;
    }

    if shuffled {
        if count <= 1 {
            return Some( current );
        }
        let pick = rng.random_range( 0..count - 1 );
        return Some( if pick >= current { pick + 1 } else { pick } );
    }

    if !user_initiated && repeat == RepeatMode::Track {
        return Some( current );
    }

    if current + 1 >= count {
        return match repeat {
            RepeatMode::List => Some( 0 ),
            _ => None,
        };
    }

    Some( current + 1 )
}


/// Index that plays when going back from `current`. List repeat wraps from
/// the first entry to the last.
pub fn resolve_prev_index( repeat: RepeatMode, current: usize, count: usize ) -> usize {
    if current == 0 || current >= count {
        return match repeat {
            RepeatMode::List if count > 0 => count - 1,
            _ => 0,
        };
    }
    current - 1
}


#[cfg( test )]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;


    fn next( shuffled: bool, repeat: RepeatMode, user: bool, current: usize, count: usize ) -> Option<usize> {
        let mut rng = StdRng::seed_from_u64( 7 );
        resolve_next_index( shuffled, repeat, user, current, count, &mut rng )
    }


    #[test]
    fn test_list_repeat_wraps_at_end() {
        assert_eq!( next( false, RepeatMode::List, false, 4, 5 ), Some( 0 ) );
    }


    #[test]
    fn test_no_repeat_stops_at_end() {
        assert_eq!( next( false, RepeatMode::None, false, 4, 5 ), None );
        assert_eq!( next( false, RepeatMode::None, true, 4, 5 ), None );
    }


    #[test]
    fn test_sequential_advance() {
        assert_eq!( next( false, RepeatMode::None, false, 1, 5 ), Some( 2 ) );
    }


    #[test]
    fn test_track_repeat_pins_unless_user_skips() {
        assert_eq!( next( false, RepeatMode::Track, false, 2, 5 ), Some( 2 ) );
        assert_eq!( next( false, RepeatMode::Track, true, 2, 5 ), Some( 3 ) );
        assert_eq!( next( false, RepeatMode::Track, true, 4, 5 ), None );
    }


    #[test]
    fn test_empty_queue_has_no_next() {
        assert_eq!( next( false, RepeatMode::List, false, 0, 0 ), None );
        assert_eq!( next( true, RepeatMode::None, false, 0, 0 ), None );
    }


    #[test]
    fn test_shuffle_single_entry_stays() {
        assert_eq!( next( true, RepeatMode::None, false, 0, 1 ), Some( 0 ) );
    }


    #[test]
    fn test_shuffle_never_repeats_current_and_covers_all_others() {
        let mut rng = StdRng::seed_from_u64( 42 );
        let count = 5;
        let current = 2;
        let mut seen = [ 0usize; 5 ];

        for _ in 0..2000 {
            let index = resolve_next_index( true, RepeatMode::None, false, current, count, &mut rng ).unwrap();
            assert!( index < count );
            assert_ne!( index, current );
            seen[ index ] += 1;
        }

        for ( index, hits ) in seen.iter().enumerate() {
            if index != current {
                assert!( *hits > 300, "index {} picked only {} times", index, hits );
            }
        }
    }


    #[test]
    fn test_shuffle_reaches_last_index() {
        let mut rng = StdRng::seed_from_u64( 1 );
        let hit_last = ( 0..500 )
            .filter_map( |_| resolve_next_index( true, RepeatMode::None, false, 0, 3, &mut rng ) )
            .any( |index| index == 2 );
        assert!( hit_last );
    }


    #[test]
    fn test_prev_index() {
        assert_eq!( resolve_prev_index( RepeatMode::None, 3, 5 ), 2 );
        assert_eq!( resolve_prev_index( RepeatMode::None, 0, 5 ), 0 );
        assert_eq!( resolve_prev_index( RepeatMode::List, 0, 5 ), 4 );
    }


    #[test]
    fn test_repeat_cycle() {
        assert_eq!( RepeatMode::None.next(), RepeatMode::List );
        assert_eq!( RepeatMode::List.next(), RepeatMode::Track );
        assert_eq!( RepeatMode::Track.next(), RepeatMode::None );
    }
}
