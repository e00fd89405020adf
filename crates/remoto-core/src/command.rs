//! Slash command parsing.
//!
//! Commands typed after `/` in the terminal client. Parsing is pure; the
//! client maps each command onto the session and connection handles.

use std::time::Duration;

use thiserror::Error;


#[derive( Debug, Error, PartialEq )]
pub enum CommandError {
    #[error( "Unknown command: {0}" )]
    Unknown( String ),

    #[error( "Invalid argument: {0}" )]
    InvalidArgument( String ),

    #[error( "Missing argument: {0}" )]
    MissingArgument( String ),
}


/// Parsed slash command.
#[derive( Debug, Clone, PartialEq )]
pub enum Command {
    // Queue sources
    Play { filter: String },
    Category { category: String, id: i64, filter: String },
    Queue,
    Snapshot,

    // Transport
    Pause,
    Resume,
    Stop,
    Next,
    Prev,
    Seek { position: Duration },

    // Flags
    Shuffle,
    Repeat,
    Mute,
    Volume { direction: VolumeStep },

    Reconnect,
    Help,
    Quit,
}


#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum VolumeStep {
    Up,
    Down,
}


impl std::str::FromStr for VolumeStep {
    type Err = CommandError;


    fn from_str( s: &str ) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "up" | "+" => Ok( VolumeStep::Up ),
            "down" | "-" => Ok( VolumeStep::Down ),
            _ => Err( CommandError::InvalidArgument(
                format!( "Invalid volume step: '{}'. Use 'up' or 'down'", s )
            )),
        }
    }
}


impl Command {
    /// Parses a command string (without the leading `/`).
    ///
    /// @param input - The command string to parse
    ///
    /// @returns The parsed command or an error
    pub fn parse( input: &str ) -> Result<Self, CommandError> {
        let input = input.trim();
        let mut parts = input.splitn( 2, ' ' );
        let cmd = parts.next().unwrap_or( "" ).to_lowercase();
        let args = parts.next().map( str::trim ).filter( |s| !s.is_empty() );

        match cmd.as_str() {
            "play" | "p" => Ok( Command::Play { filter: args.unwrap_or( "" ).to_string() } ),
            "category" | "cat" => parse_category( args ),
            "queue" | "qu" => Ok( Command::Queue ),
            "snapshot" | "snap" => Ok( Command::Snapshot ),

            "pause" | "pa" => Ok( Command::Pause ),
            "resume" | "res" => Ok( Command::Resume ),
            "stop" | "st" => Ok( Command::Stop ),
            "next" | "n" => Ok( Command::Next ),
            "prev" | "previous" | "pr" => Ok( Command::Prev ),
            "seek" | "sk" => {
                let time_str = args
                    .ok_or_else( || CommandError::MissingArgument( "time position".into() ) )?;
                let position = parse_time( time_str )?;
                Ok( Command::Seek { position } )
            }

            "shuffle" | "sh" => Ok( Command::Shuffle ),
            "repeat" | "rep" => Ok( Command::Repeat ),
            "mute" | "m" => Ok( Command::Mute ),
            "vol" | "volume" => {
                let direction = args
                    .ok_or_else( || CommandError::MissingArgument( "up or down".into() ) )?
                    .parse()?;
                Ok( Command::Volume { direction } )
            }

            "reconnect" | "rc" => Ok( Command::Reconnect ),
            "help" | "h" => Ok( Command::Help ),
            "quit" | "q" | "exit" => Ok( Command::Quit ),

            "" => Err( CommandError::Unknown( "empty command".into() ) ),
            other => Err( CommandError::Unknown( other.to_string() ) ),
        }
    }


    /// Returns a brief description of the command for help text.
    pub fn description( &self ) -> &'static str {
        match self {
            Command::Play { .. } => "Play all tracks matching a filter",
            Command::Category { .. } => "Play one album, artist or genre",
            Command::Queue => "Play the server's play queue",
            Command::Snapshot => "Continue the server's play queue here",
            Command::Pause => "Pause playback",
            Command::Resume => "Resume playback",
            Command::Stop => "Stop playback",
            Command::Next => "Next track",
            Command::Prev => "Previous track",
            Command::Seek { .. } => "Seek to position",
            Command::Shuffle => "Toggle shuffle",
            Command::Repeat => "Cycle repeat mode",
            Command::Mute => "Toggle mute",
            Command::Volume { .. } => "Volume up or down",
            Command::Reconnect => "Reconnect to the server",
            Command::Help => "Show help",
            Command::Quit => "Quit application",
        }
    }
}


/// `<type> <id> [filter]`
fn parse_category( args: Option<&str> ) -> Result<Command, CommandError> {
    let args = args.ok_or_else( || CommandError::MissingArgument( "category type".into() ) )?;
    let mut parts = args.splitn( 3, ' ' );

    let category = parts.next().unwrap_or( "" ).to_lowercase();
    let id = parts
        .next()
        .ok_or_else( || CommandError::MissingArgument( "category id".into() ) )?;
    let id: i64 = id
        .parse()
        .map_err( |_| CommandError::InvalidArgument( format!( "Invalid id: {}", id ) ) )?;
    let filter = parts.next().map( str::trim ).unwrap_or( "" ).to_string();

    Ok( Command::Category { category, id, filter } )
}


/// Parses a time string like "1:30" or "90" into a Duration.
///
/// @param s - Time string in format "MM:SS", "M:SS", or just seconds
///
/// @returns Duration or error
pub fn parse_time( s: &str ) -> Result<Duration, CommandError> {
    let s = s.trim();

    if let Some(( min, sec )) = s.split_once( ':' ) {
        let minutes: u64 = min.parse()
            .map_err( |_| CommandError::InvalidArgument( format!( "Invalid minutes: {}", min ) ) )?;
        let seconds: u64 = sec.parse()
            .map_err( |_| CommandError::InvalidArgument( format!( "Invalid seconds: {}", sec ) ) )?;
        Ok( Duration::from_secs( minutes * 60 + seconds ) )
    } else {
        let seconds: u64 = s.parse()
            .map_err( |_| CommandError::InvalidArgument( format!( "Invalid time: {}", s ) ) )?;
        Ok( Duration::from_secs( seconds ) )
    }
}


/// Returns help text listing all available commands.
pub fn help_text() -> &'static str {
    r#"Queue Commands:
  /play [filter]               Play all matching tracks   [a]
  /category <type> <id> [f]    Play an album/artist/genre
  /queue                       Play the server play queue
  /snapshot                    Continue the server queue here

Playback Commands:
  /pause, /resume              Pause or resume            [space]
  /stop                        Stop playback
  /next, /prev                 Skip                       [n/p]
  /seek <time>                 Seek (e.g., 1:30)          [←/→]

Other Commands:
  /shuffle                     Toggle shuffle             [s]
  /repeat                      Cycle off/list/track       [r]
  /mute                        Toggle mute                [m]
  /vol up|down                 Volume                     [+/-]
  /reconnect                   Reconnect to the server
  /help                        Show this help             [?]
  /quit                        Exit remoto                [q]"#
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_parse_play_with_filter() {
        let cmd = Command::parse( "play miles davis" ).unwrap();
        assert_eq!( cmd, Command::Play { filter: "miles davis".into() } );
        assert_eq!( Command::parse( "p" ).unwrap(), Command::Play { filter: String::new() } );
    }


    #[test]
    fn test_parse_category() {
        let cmd = Command::parse( "category Album 42 blue" ).unwrap();
        assert_eq!( cmd, Command::Category { category: "album".into(), id: 42, filter: "blue".into() } );
    }


    #[test]
    fn test_parse_category_bad_id() {
        let result = Command::parse( "cat artist x" );
        assert!( matches!( result, Err( CommandError::InvalidArgument( _ ) ) ) );

        let result = Command::parse( "cat artist" );
        assert!( matches!( result, Err( CommandError::MissingArgument( _ ) ) ) );
    }


    #[test]
    fn test_parse_seek() {
        let cmd = Command::parse( "seek 1:30" ).unwrap();
        assert_eq!( cmd, Command::Seek { position: Duration::from_secs( 90 ) } );
    }


    #[test]
    fn test_parse_seek_seconds() {
        let cmd = Command::parse( "seek 45" ).unwrap();
        assert_eq!( cmd, Command::Seek { position: Duration::from_secs( 45 ) } );
    }


    #[test]
    fn test_parse_volume() {
        assert_eq!( Command::parse( "vol up" ).unwrap(), Command::Volume { direction: VolumeStep::Up } );
        assert_eq!( Command::parse( "volume -" ).unwrap(), Command::Volume { direction: VolumeStep::Down } );
        assert!( matches!( Command::parse( "vol loud" ), Err( CommandError::InvalidArgument( _ ) ) ) );
    }


    #[test]
    fn test_parse_unknown() {
        let result = Command::parse( "foobar" );
        assert!( matches!( result, Err( CommandError::Unknown( _ ) ) ) );
    }


    #[test]
    fn test_parse_missing_arg() {
        let result = Command::parse( "seek" );
        assert!( matches!( result, Err( CommandError::MissingArgument( _ ) ) ) );
    }
}
