//! Input mode handling for the TUI.
//!
//! Normal mode maps keys to actions; command mode edits a slash command
//! with a small history of earlier commands.


const HISTORY_LIMIT: usize = 50;


#[derive( Debug, Clone, Copy, PartialEq, Eq, Default )]
pub enum InputMode {
    /// Keyboard shortcuts active.
    #[default]
    Normal,

    /// Typing a slash command.
    Command,
}


/// Single-line editor for the command prompt.
#[derive( Debug, Default )]
pub struct InputBuffer {
    content: String,
    /// Byte offset, always on a char boundary.
    cursor: usize,
    history: Vec<String>,
    /// Position while browsing history; `None` when editing fresh input.
    recall: Option<usize>,
}


impl InputBuffer {
    pub fn new() -> Self {
        Self::default()
    }


    pub fn insert( &mut self, c: char ) {
        self.content.insert( self.cursor, c );
        self.cursor += c.len_utf8();
        self.recall = None;
    }


    /// Deletes the character before the cursor.
    pub fn backspace( &mut self ) {
        if let Some( prev ) = self.prev_boundary() {
            self.content.remove( prev );
            self.cursor = prev;
        }
    }


    /// Deletes the character at the cursor.
    pub fn delete( &mut self ) {
        if self.cursor < self.content.len() {
            self.content.remove( self.cursor );
        }
    }


    pub fn clear( &mut self ) {
        self.content.clear();
        self.cursor = 0;
        self.recall = None;
    }


    /// Empties the buffer, recording non-blank input in the history.
    pub fn submit( &mut self ) -> String {
        let line = std::mem::take( &mut self.content );
        self.clear();

        let trimmed = line.trim();
        if !trimmed.is_empty() && self.history.last().map( String::as_str ) != Some( trimmed ) {
            self.history.push( trimmed.to_string() );
            if self.history.len() > HISTORY_LIMIT {
                self.history.remove( 0 );
            }
        }
        line
    }


    pub fn content( &self ) -> &str {
        &self.content
    }


    /// Cursor position in characters, for display.
    pub fn cursor_char_pos( &self ) -> usize {
        self.content[ ..self.cursor ].chars().count()
    }


    pub fn move_left( &mut self ) {
        if let Some( prev ) = self.prev_boundary() {
            self.cursor = prev;
        }
    }


    pub fn move_right( &mut self ) {
        if let Some( c ) = self.content[ self.cursor.. ].chars().next() {
            self.cursor += c.len_utf8();
        }
    }


    pub fn move_home( &mut self ) {
        self.cursor = 0;
    }


    pub fn move_end( &mut self ) {
        self.cursor = self.content.len();
    }


    pub fn is_empty( &self ) -> bool {
        self.content.is_empty()
    }


    /// Replaces the line with the previous history entry.
    pub fn history_prev( &mut self ) {
        if self.history.is_empty() {
            return;
        }
        let index = match self.recall {
            Some( 0 ) => 0,
            Some( i ) => i - 1,
            None => self.history.len() - 1,
        };
        self.show_history( index );
    }


    /// Moves forward through history; past the newest entry the line clears.
    pub fn history_next( &mut self ) {
        match self.recall {
            Some( i ) if i + 1 < self.history.len() => self.show_history( i + 1 ),
            Some( _ ) => self.clear(),
            None => {}
        }
    }


    fn show_history( &mut self, index: usize ) {
        self.content = self.history[ index ].clone();
        self.cursor = self.content.len();
        self.recall = Some( index );
    }


    fn prev_boundary( &self ) -> Option<usize> {
        self.content[ ..self.cursor ].char_indices().last().map( |( i, _ )| i )
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_editing_multibyte() {
        let mut input = InputBuffer::new();
        for c in "séek".chars() {
            input.insert( c );
        }
        input.move_left();
        input.move_left();
        input.backspace();
        assert_eq!( input.content(), "sek" );
        assert_eq!( input.cursor_char_pos(), 1 );

        input.move_right();
        input.delete();
        assert_eq!( input.content(), "se" );
    }


    #[test]
    fn test_history_recall() {
        let mut input = InputBuffer::new();
        for line in [ "play", "next", "next" ] {
            for c in line.chars() {
                input.insert( c );
            }
            input.submit();
        }

        input.history_prev();
        assert_eq!( input.content(), "next" );
        input.history_prev();
        assert_eq!( input.content(), "play" );
        input.history_prev();
        assert_eq!( input.content(), "play" );

        input.history_next();
        assert_eq!( input.content(), "next" );
        input.history_next();
        assert!( input.is_empty() );
    }


    #[test]
    fn test_blank_lines_stay_out_of_history() {
        let mut input = InputBuffer::new();
        input.insert( ' ' );
        assert_eq!( input.submit(), " " );

        input.history_prev();
        assert!( input.is_empty() );
    }
}
