//! Remoto CLI - terminal remote for a networked music server

mod cli;
mod input;
mod logging;
mod settings;
mod view;

use std::io;
use std::sync::Arc;
use std::time::{ Duration, Instant };

use anyhow::Result;
use clap::Parser;
use crossterm::{
    event::{ self, Event, KeyCode, KeyEventKind, KeyModifiers, MouseEventKind },
    terminal::{ disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen },
    ExecutableCommand,
};
use ratatui::{
    prelude::*,
    widgets::{ Block, Borders, List, ListItem, ListState, Paragraph, Wrap },
};
use tokio::sync::mpsc::UnboundedReceiver;

use cli::Args;
use input::{ InputBuffer, InputMode };
use settings::Settings;
use view::{ ViewMode, Viewport };

use remoto_core::{
    audio::StreamingBackendFactory,
    command::{ self, VolumeStep },
    session::SessionListener,
    Command, ConnectionHandle, ConnectionState, ConnectionStatus, DataProvider, QueryFactory, SessionHandle,
    SessionSnapshot, SessionState, SlidingWindow, StreamUrls, Track, TrackSource, WebSocketConnector, WindowNotice,
    WindowUpdate,
};


/// How long after the last scroll key the queue window starts fetching.
const SCROLL_SETTLE: Duration = Duration::from_millis( 250 );


/// Application state.
struct App {
    connection: ConnectionHandle,
    session: SessionHandle,
    _listener: SessionListener,
    should_quit: bool,

    // Queue browsing
    window: SlidingWindow<Track>,
    window_updates: UnboundedReceiver<WindowUpdate<Track>>,
    queue_revision: u64,
    viewport: Viewport,
    scroll_settles_at: Option<Instant>,

    // Latest published state
    snapshot: SessionSnapshot,
    connection_status: ConnectionStatus,

    view_mode: ViewMode,
    input_mode: InputMode,
    input_buffer: InputBuffer,
    help_scroll: u16,

    status_message: Option<String>,
    status_clear_at: Option<Instant>,

    settings: Settings,
}


impl App {
    /// Wires connection, data provider, session and queue window together.
    /// Must run inside the tokio runtime.
    fn new( settings: Settings ) -> Result<Self> {
        let config = settings.connection.clone();
        let connection = ConnectionHandle::spawn( config.clone(), WebSocketConnector );
        let provider = DataProvider::new( connection.clone() );
        let backends = StreamingBackendFactory::new( &config )?;

        let session = SessionHandle::spawn(
            Arc::new( provider ) as Arc<dyn TrackSource>,
            Arc::new( backends ),
            StreamUrls::new( &config ),
            settings.session_options(),
        );
        let listener = session.connect();

        let queue: Arc<dyn QueryFactory<Item = Track>> = Arc::new( session.queue_factory() );
        let ( window, window_updates ) = SlidingWindow::new( queue );

        tracing::info!( "Remoto started against {}", config.socket_url() );

        Ok( Self {
            snapshot: session.snapshot(),
            connection_status: connection.status(),
            connection,
            session,
            _listener: listener,
            should_quit: false,
            window,
            window_updates,
            queue_revision: 0,
            viewport: Viewport::default(),
            scroll_settles_at: None,
            view_mode: ViewMode::Queue,
            input_mode: InputMode::Normal,
            input_buffer: InputBuffer::new(),
            help_scroll: 0,
            status_message: None,
            status_clear_at: None,
            settings,
        })
    }


    /// Sets a status message that auto-clears after a delay.
    fn set_status( &mut self, msg: impl Into<String> ) {
        self.status_message = Some( msg.into() );
        self.status_clear_at = Some( Instant::now() + Duration::from_secs( 3 ) );
    }


    /// Pulls published state and applies finished window fetches.
    fn tick( &mut self ) {
        let now = Instant::now();
        if self.status_clear_at.is_some_and( |at| now >= at ) {
            self.status_message = None;
            self.status_clear_at = None;
        }

        if self.scroll_settles_at.is_some_and( |at| now >= at ) {
            self.scroll_settles_at = None;
            self.window.set_scrolling( false );
        }

        let status = self.connection.status();
        if status.state != self.connection_status.state {
            self.set_status( format!( "Server {}", view::connection_label( status.state ) ) );
            if status.state == ConnectionState::Connected && status.should_upgrade {
                self.set_status( "Server is older than this client supports" );
            }
        }
        self.connection_status = status;

        let snapshot = self.session.snapshot();
        if snapshot.queue_revision != self.queue_revision {
            self.queue_revision = snapshot.queue_revision;
            self.window.requery();
        }
        if snapshot.queue_position != self.snapshot.queue_position {
            if let Some( index ) = snapshot.queue_position {
                self.viewport.select( index, snapshot.queue_count );
            }
        }
        self.settings.remember( &snapshot );
        self.snapshot = snapshot;

        while let Ok( update ) = self.window_updates.try_recv() {
            if let Some( WindowNotice::Failed( e ) ) = self.window.apply( update ) {
                self.set_status( format!( "Queue: {}", e ) );
            }
        }
    }


    fn handle_key( &mut self, code: KeyCode, modifiers: KeyModifiers ) {
        match self.input_mode {
            InputMode::Normal => self.handle_normal_key( code, modifiers ),
            InputMode::Command => self.handle_command_key( code ),
        }
    }


    fn handle_mouse( &mut self, kind: MouseEventKind ) {
        match kind {
            MouseEventKind::ScrollUp => self.scroll( -3 ),
            MouseEventKind::ScrollDown => self.scroll( 3 ),
            _ => {}
        }
    }


    fn handle_normal_key( &mut self, code: KeyCode, modifiers: KeyModifiers ) {
        match code {
            KeyCode::Char( '/' ) => {
                self.input_mode = InputMode::Command;
                self.input_buffer.clear();
                return;
            }
            KeyCode::Char( '?' ) => {
                self.view_mode = match self.view_mode {
                    ViewMode::Help => ViewMode::Queue,
                    ViewMode::Queue => ViewMode::Help,
                };
                return;
            }
            KeyCode::Char( 'c' ) if modifiers.contains( KeyModifiers::CONTROL ) => {
                self.should_quit = true;
                return;
            }
            KeyCode::Esc if self.view_mode == ViewMode::Help => {
                self.view_mode = ViewMode::Queue;
                return;
            }
            _ => {}
        }

        match self.view_mode {
            ViewMode::Queue => self.handle_queue_key( code ),
            ViewMode::Help => self.handle_help_key( code ),
        }
    }


    fn handle_queue_key( &mut self, code: KeyCode ) {
        match code {
            KeyCode::Char( 'q' ) => self.should_quit = true,
            KeyCode::Char( ' ' ) => {
                if self.snapshot.state == SessionState::Stopped {
                    self.play_selected();
                } else {
                    self.session.pause_or_resume();
                }
            }
            KeyCode::Char( 'n' ) => self.session.next(),
            KeyCode::Char( 'p' ) => self.session.prev(),
            KeyCode::Left => self.session.seek_backward(),
            KeyCode::Right => self.session.seek_forward(),
            KeyCode::Char( 's' ) => self.session.toggle_shuffle(),
            KeyCode::Char( 'r' ) => self.session.toggle_repeat_mode(),
            KeyCode::Char( 'm' ) => self.session.toggle_mute(),
            KeyCode::Char( '+' ) | KeyCode::Char( '=' ) => self.session.volume_up(),
            KeyCode::Char( '-' ) => self.session.volume_down(),
            KeyCode::Char( 'a' ) => {
                self.session.play_all( "" );
                self.set_status( "Playing all tracks" );
            }
            KeyCode::Up => self.scroll( -1 ),
            KeyCode::Down => self.scroll( 1 ),
            KeyCode::PageUp => self.scroll( -20 ),
            KeyCode::PageDown => self.scroll( 20 ),
            KeyCode::Home => self.scroll( isize::MIN / 2 ),
            KeyCode::End => self.scroll( isize::MAX / 2 ),
            KeyCode::Enter => self.play_selected(),
            _ => {}
        }
    }


    fn handle_help_key( &mut self, code: KeyCode ) {
        match code {
            KeyCode::Up | KeyCode::Char( 'k' ) => self.help_scroll = self.help_scroll.saturating_sub( 1 ),
            KeyCode::Down | KeyCode::Char( 'j' ) => self.help_scroll = self.help_scroll.saturating_add( 1 ),
            KeyCode::Char( 'q' ) => self.should_quit = true,
            _ => {}
        }
    }


    fn handle_command_key( &mut self, code: KeyCode ) {
        match code {
            KeyCode::Enter => {
                let input = self.input_buffer.submit();
                self.input_mode = InputMode::Normal;
                self.execute_command( &input );
            }
            KeyCode::Esc => {
                self.input_mode = InputMode::Normal;
                self.input_buffer.clear();
            }
            KeyCode::Backspace => {
                if self.input_buffer.is_empty() {
                    self.input_mode = InputMode::Normal;
                } else {
                    self.input_buffer.backspace();
                }
            }
            KeyCode::Delete => self.input_buffer.delete(),
            KeyCode::Left => self.input_buffer.move_left(),
            KeyCode::Right => self.input_buffer.move_right(),
            KeyCode::Home => self.input_buffer.move_home(),
            KeyCode::End => self.input_buffer.move_end(),
            KeyCode::Up => self.input_buffer.history_prev(),
            KeyCode::Down => self.input_buffer.history_next(),
            KeyCode::Char( c ) => self.input_buffer.insert( c ),
            _ => {}
        }
    }


    fn execute_command( &mut self, input: &str ) {
        match Command::parse( input ) {
            Ok( cmd ) => self.run_command( cmd ),
            Err( e ) => self.set_status( format!( "{}", e ) ),
        }
    }


    fn run_command( &mut self, cmd: Command ) {
        match cmd {
            Command::Play { filter } => {
                self.session.play_all( &filter );
                if filter.is_empty() {
                    self.set_status( "Playing all tracks" );
                } else {
                    self.set_status( format!( "Playing tracks matching '{}'", filter ) );
                }
            }
            Command::Category { category, id, filter } => {
                self.session.play( &category, id, 0, &filter );
                self.set_status( format!( "Playing {} {}", category, id ) );
            }
            Command::Queue => {
                self.session.play_queue( 0 );
                self.set_status( "Playing the server play queue" );
            }
            Command::Snapshot => {
                self.session.play_snapshot( 0, Duration::ZERO );
                self.set_status( "Continuing the server play queue" );
            }
            Command::Pause => self.session.pause(),
            Command::Resume => self.session.resume(),
            Command::Stop => self.session.stop(),
            Command::Next => self.session.next(),
            Command::Prev => self.session.prev(),
            Command::Seek { position } => self.session.seek_to( position ),
            Command::Shuffle => self.session.toggle_shuffle(),
            Command::Repeat => self.session.toggle_repeat_mode(),
            Command::Mute => self.session.toggle_mute(),
            Command::Volume { direction: VolumeStep::Up } => self.session.volume_up(),
            Command::Volume { direction: VolumeStep::Down } => self.session.volume_down(),
            Command::Reconnect => {
                self.connection.reconnect();
                self.set_status( "Reconnecting" );
            }
            Command::Help => self.view_mode = ViewMode::Help,
            Command::Quit => self.should_quit = true,
        }
    }


    /// Moves the selection and holds queue fetches until scrolling settles.
    fn scroll( &mut self, delta: isize ) {
        self.viewport.move_by( delta, self.window.count() );
        self.window.set_scrolling( true );
        self.scroll_settles_at = Some( Instant::now() + SCROLL_SETTLE );
    }


    fn play_selected( &mut self ) {
        if self.window.count() == 0 {
            self.session.play_all( "" );
        } else {
            self.session.play_at( self.viewport.selected );
        }
    }


    fn shutdown( &mut self ) {
        self.settings.save();
        self.session.shutdown();
        self.connection.shutdown();
    }
}


fn main() -> Result<()> {
    let args = Args::parse();

    let mut settings = Settings::load();
    settings.apply_args( &args );
    let log_file = logging::init( args.log_level.as_deref() );

    let runtime = tokio::runtime::Runtime::new()?;
    let _guard = runtime.enter();

    let mut app = App::new( settings )?;
    if let Some( path ) = log_file {
        app.set_status( format!( "Logging to {}", path.display() ) );
    }

    // Setup terminal
    enable_raw_mode()?;
    io::stdout().execute( EnterAlternateScreen )?;
    io::stdout().execute( crossterm::event::EnableMouseCapture )?;

    let mut terminal = Terminal::new( CrosstermBackend::new( io::stdout() ) )?;

    let result = run( &mut terminal, &mut app );

    // Cleanup
    io::stdout().execute( crossterm::event::DisableMouseCapture )?;
    disable_raw_mode()?;
    io::stdout().execute( LeaveAlternateScreen )?;

    app.shutdown();
    drop( app );
    runtime.shutdown_timeout( Duration::from_secs( 1 ) );

    result
}


fn run( terminal: &mut Terminal<CrosstermBackend<io::Stdout>>, app: &mut App ) -> Result<()> {
    loop {
        app.tick();
        terminal.draw( |frame| draw_ui( frame, app ) )?;

        if event::poll( Duration::from_millis( 100 ) )? {
            match event::read()? {
                Event::Key( key ) if key.kind == KeyEventKind::Press => {
                    app.handle_key( key.code, key.modifiers );
                }
                Event::Mouse( mouse ) => app.handle_mouse( mouse.kind ),
                _ => {}
            }
        }

        if app.should_quit {
            return Ok( () );
        }
    }
}


/// Draws the main UI.
fn draw_ui( frame: &mut Frame, app: &mut App ) {
    let chunks = Layout::default()
        .direction( Direction::Vertical )
        .constraints([
            Constraint::Length( 2 ),  // Header
            Constraint::Min( 0 ),     // Main content
            Constraint::Length( 5 ),  // Now playing
            Constraint::Length( 1 ),  // Status bar
        ])
        .split( frame.area() );

    let view_indicator = match app.view_mode {
        ViewMode::Queue => "QUEUE",
        ViewMode::Help => "HELP",
    };
    let header = Paragraph::new( format!(
        "  REMOTO - {}  ({} {})",
        view_indicator,
        app.settings.connection.host,
        view::connection_label( app.connection_status.state ),
    ))
    .style( Style::default().fg( Color::Cyan ).bold() )
    .block( Block::default().borders( Borders::BOTTOM ) );
    frame.render_widget( header, chunks[0] );

    match app.view_mode {
        ViewMode::Queue => draw_queue( frame, app, chunks[1] ),
        ViewMode::Help => draw_help( frame, app, chunks[1] ),
    }

    draw_now_playing( frame, app, chunks[2] );
    draw_status_bar( frame, app, chunks[3] );
}


/// Renders only the visible rows; the window fetches what is missing.
fn draw_queue( frame: &mut Frame, app: &mut App, area: Rect ) {
    let count = app.window.count();
    let height = area.height.saturating_sub( 2 ) as usize;
    app.viewport.fit( height, count );

    let playing = app.snapshot.queue_position;
    let end = ( app.viewport.offset + height ).min( count );
    let items: Vec<ListItem> = ( app.viewport.offset..end )
        .map( |index| {
            let marker = if Some( index ) == playing { "▶ " } else { "  " };
            let text = match app.window.item( index ) {
                Some( track ) if track.artist.is_empty() => format!( "{}{}", marker, track.display_title() ),
                Some( track ) => format!( "{}{} - {}", marker, track.display_title(), track.artist ),
                None => format!( "{}…", marker ),
            };
            ListItem::new( text )
        })
        .collect();

    let title = format!(
        " Queue ({}) {} {} ",
        count,
        if app.snapshot.shuffled { "[S]" } else { "" },
        view::repeat_badge( app.snapshot.repeat ),
    );

    let mut state = ListState::default();
    if count > 0 {
        state.select( Some( app.viewport.selected - app.viewport.offset ) );
    }

    let list = List::new( items )
        .block( Block::default().title( title ).borders( Borders::ALL ) )
        .highlight_style( Style::default().bg( Color::DarkGray ) )
        .highlight_symbol( ">> " );

    frame.render_stateful_widget( list, area, &mut state );
}


fn draw_help( frame: &mut Frame, app: &mut App, area: Rect ) {
    let help_text = command::help_text();
    let line_count = help_text.lines().count() as u16;
    let visible_height = area.height.saturating_sub( 2 );

    let max_scroll = line_count.saturating_sub( visible_height );
    app.help_scroll = app.help_scroll.min( max_scroll );

    let help = Paragraph::new( help_text )
        .block( Block::default()
            .title( " Help (↑↓ scroll, ? or Esc to close) " )
            .borders( Borders::ALL )
        )
        .wrap( Wrap { trim: false } )
        .scroll(( app.help_scroll, 0 ));

    frame.render_widget( help, area );
}


fn draw_now_playing( frame: &mut Frame, app: &App, area: Rect ) {
    let snapshot = &app.snapshot;

    let ( title, artist_album ) = match &snapshot.track {
        Some( track ) => {
            let artist_album = match ( track.artist.is_empty(), track.album.is_empty() ) {
                ( false, false ) => format!( "{} - {}", track.artist, track.album ),
                ( false, true ) => track.artist.clone(),
                ( true, false ) => track.album.clone(),
                ( true, true ) => String::new(),
            };
            ( track.display_title().to_string(), artist_album )
        }
        None => ( "No track".to_string(), String::new() ),
    };

    let mut lines = vec![
        Line::from( Span::styled(
            format!( " {} {} ", view::state_symbol( snapshot.state ), title ),
            Style::default().bold(),
        )),
    ];

    if !artist_album.is_empty() {
        lines.push( Line::from( Span::styled( format!( "   {} ", artist_album ), Style::default().fg( Color::Gray ) ) ) );
    }

    let bar = view::progress_bar( snapshot.current_time, snapshot.buffered_time, snapshot.duration, 20 );
    let volume = if snapshot.muted {
        "muted".to_string()
    } else {
        format!( "{}%", ( snapshot.volume * 100.0 ).round() as i32 )
    };
    let position = match snapshot.queue_position {
        Some( index ) => format!( "{}/{}", index + 1, snapshot.queue_count ),
        None => String::new(),
    };

    lines.push( Line::from( format!(
        " {} {} / {}  {}  {} ",
        bar,
        view::format_time( snapshot.current_time ),
        view::format_time( snapshot.duration ),
        volume,
        position,
    )));

    let now_playing = Paragraph::new( lines )
        .block( Block::default().title( " Now Playing " ).borders( Borders::ALL ) );

    frame.render_widget( now_playing, area );
}


fn draw_status_bar( frame: &mut Frame, app: &App, area: Rect ) {
    let ( text, style ) = match app.input_mode {
        InputMode::Command => {
            ( format!( "/{}", app.input_buffer.content() ), Style::default().fg( Color::Yellow ) )
        }
        InputMode::Normal => {
            if let Some( ref msg ) = app.status_message {
                ( msg.clone(), Style::default().fg( Color::Green ) )
            } else {
                let hint = match app.view_mode {
                    ViewMode::Queue => " [/]Cmd [Space]Play [n/p]Skip [←→]Seek [s]Shuffle [r]Repeat [a]All [?]Help [q]Quit ",
                    ViewMode::Help => " [?]Close [Esc]Close ",
                };
                ( hint.to_string(), Style::default().fg( Color::DarkGray ) )
            }
        }
    };

    let status = Paragraph::new( text ).style( style );
    frame.render_widget( status, area );

    if app.input_mode == InputMode::Command {
        let cursor_x = area.x + 1 + app.input_buffer.cursor_char_pos() as u16;
        frame.set_cursor_position(( cursor_x, area.y ));
    }
}
