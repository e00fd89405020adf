//! View mode management and display helpers for the TUI.

use std::time::Duration;

use remoto_core::{ ConnectionState, RepeatMode, SessionState };


#[derive( Debug, Clone, Copy, PartialEq, Eq, Default )]
pub enum ViewMode {
    /// The playing queue.
    #[default]
    Queue,

    /// Help overlay.
    Help,
}


/// Visible rows of a list that scrolls by keeping the selection on screen.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Default )]
pub struct Viewport {
    pub selected: usize,
    pub offset: usize,
}


impl Viewport {
    /// Moves the selection by `delta` rows within `count` items.
    pub fn move_by( &mut self, delta: isize, count: usize ) {
        if count == 0 {
            self.selected = 0;
            return;
        }
        let target = self.selected as isize + delta;
        self.selected = target.clamp( 0, count as isize - 1 ) as usize;
    }


    pub fn select( &mut self, index: usize, count: usize ) {
        self.selected = index.min( count.saturating_sub( 1 ) );
    }


    /// Adjusts the offset so the selection is inside `height` rows.
    pub fn fit( &mut self, height: usize, count: usize ) {
        if height == 0 {
            return;
        }
        self.selected = self.selected.min( count.saturating_sub( 1 ) );
        if self.selected < self.offset {
            self.offset = self.selected;
        } else if self.selected >= self.offset + height {
            self.offset = self.selected + 1 - height;
        }
        self.offset = self.offset.min( count.saturating_sub( height ) );
    }
}


/// Formats as M:SS.
pub fn format_time( d: Duration ) -> String {
    let secs = d.as_secs();
    format!( "{}:{:02}", secs / 60, secs % 60 )
}


/// Progress bar with a buffered segment, e.g. `[███▒▒░░░░░]`.
pub fn progress_bar( position: Duration, buffered: Duration, duration: Duration, width: usize ) -> String {
    let fraction = |d: Duration| {
        if duration.is_zero() {
            0.0
        } else {
            ( d.as_secs_f64() / duration.as_secs_f64() ).min( 1.0 )
        }
    };

    let played = ( fraction( position ) * width as f64 ).round() as usize;
    let loaded = ( ( fraction( buffered ) * width as f64 ).round() as usize ).max( played );
    format!(
        "[{}{}{}]",
        "█".repeat( played ),
        "▒".repeat( loaded - played ),
        "░".repeat( width - loaded )
    )
}


pub fn state_symbol( state: SessionState ) -> &'static str {
    match state {
        SessionState::Playing => "▶",
        SessionState::Paused => "⏸",
        SessionState::Buffering => "…",
        SessionState::Stopped => "⏹",
    }
}


pub fn repeat_badge( repeat: RepeatMode ) -> &'static str {
    match repeat {
        RepeatMode::None => "",
        RepeatMode::List => "[R]",
        RepeatMode::Track => "[R1]",
    }
}


pub fn connection_label( state: ConnectionState ) -> &'static str {
    match state {
        ConnectionState::Connected => "connected",
        ConnectionState::Connecting => "connecting",
        ConnectionState::Disconnected => "offline",
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_viewport_follows_selection() {
        let mut view = Viewport::default();
        view.move_by( 12, 100 );
        view.fit( 10, 100 );
        assert_eq!( view, Viewport { selected: 12, offset: 3 } );

        view.move_by( -10, 100 );
        view.fit( 10, 100 );
        assert_eq!( view, Viewport { selected: 2, offset: 2 } );

        view.move_by( 500, 100 );
        view.fit( 10, 100 );
        assert_eq!( view, Viewport { selected: 99, offset: 90 } );
    }


    #[test]
    fn test_viewport_shrinking_list() {
        let mut view = Viewport { selected: 40, offset: 35 };
        view.fit( 10, 5 );
        assert_eq!( view, Viewport { selected: 4, offset: 0 } );
    }


    #[test]
    fn test_format_time() {
        assert_eq!( format_time( Duration::from_secs( 0 ) ), "0:00" );
        assert_eq!( format_time( Duration::from_secs( 754 ) ), "12:34" );
    }


    #[test]
    fn test_progress_bar() {
        let bar = progress_bar( Duration::from_secs( 30 ), Duration::from_secs( 60 ), Duration::from_secs( 120 ), 8 );
        assert_eq!( bar, "[██▒▒░░░░]" );
        assert_eq!( progress_bar( Duration::ZERO, Duration::ZERO, Duration::ZERO, 4 ), "[░░░░]" );
    }
}
