//! Download-backed media source
//!
//! Audio is downloaded to a temporary file while the decoder reads from the
//! same file. Reads past the downloaded frontier block until more bytes
//! arrive, the download completes, or it is canceled.

use std::fs::File;
use std::io::{ self, Read, Seek, SeekFrom };
use std::path::{ Path, PathBuf };
use std::sync::atomic::{ AtomicBool, AtomicU64, Ordering };
use std::sync::{ Arc, Mutex };
use std::thread;
use std::time::Duration;

use symphonia::core::io::MediaSource;

use crate::player::{ BackendEvent, BackendEvents };


const STALL_POLL: Duration = Duration::from_millis( 20 );


/// Progress of one download, shared between the writer and readers.
/// The temporary file is removed when the last reference goes away.
#[derive( Debug )]
pub struct Download {
    path: PathBuf,
    written: AtomicU64,
    /// Zero while unknown.
    total: AtomicU64,
    complete: AtomicBool,
    canceled: AtomicBool,
    failure: Mutex<Option<String>>,
    report_stalls: AtomicBool,
}


impl Download {
    pub fn new( path: PathBuf ) -> Self {
        Self {
            path,
            written: AtomicU64::new( 0 ),
            total: AtomicU64::new( 0 ),
            complete: AtomicBool::new( false ),
            canceled: AtomicBool::new( false ),
            failure: Mutex::new( None ),
            report_stalls: AtomicBool::new( false ),
        }
    }


    pub fn path( &self ) -> &Path {
        &self.path
    }


    pub fn set_total( &self, total: u64 ) {
        self.total.store( total, Ordering::Release );
    }


    pub fn total( &self ) -> Option<u64> {
        match self.total.load( Ordering::Acquire ) {
            0 => None,
            total => Some( total ),
        }
    }


    /// Records `bytes` more flushed to disk.
    pub fn advance( &self, bytes: u64 ) {
        self.written.fetch_add( bytes, Ordering::AcqRel );
    }


    pub fn written( &self ) -> u64 {
        self.written.load( Ordering::Acquire )
    }


    pub fn finish( &self ) {
        self.complete.store( true, Ordering::Release );
    }


    pub fn is_complete( &self ) -> bool {
        self.complete.load( Ordering::Acquire )
    }


    pub fn fail( &self, reason: String ) {
        *self.failure.lock().unwrap_or_else( |e| e.into_inner() ) = Some( reason );
    }


    pub fn failure( &self ) -> Option<String> {
        self.failure.lock().unwrap_or_else( |e| e.into_inner() ).clone()
    }


    pub fn cancel( &self ) {
        self.canceled.store( true, Ordering::Release );
    }


    pub fn is_canceled( &self ) -> bool {
        self.canceled.load( Ordering::Acquire )
    }


    /// Starts reporting stalls as `Buffering`. Off while probing.
    pub fn report_stalls( &self ) {
        self.report_stalls.store( true, Ordering::Release );
    }


    /// Downloaded share of the stream, 0 to 100.
    pub fn percent( &self ) -> u8 {
        if self.is_complete() {
            return 100;
        }

        match self.total() {
            Some( total ) => ( self.written().saturating_mul( 100 ) / total ).min( 100 ) as u8,
            None => 0,
        }
    }
}


impl Drop for Download {
    fn drop( &mut self ) {
        if let Err( e ) = std::fs::remove_file( &self.path ) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::debug!( "Could not remove {:?}: {}", self.path, e );
            }
        }
    }
}


/// Reader over a file that is still being written.
pub struct StreamingFile {
    file: File,
    download: Arc<Download>,
    position: u64,
    events: BackendEvents,
    stalled: bool,
}


impl StreamingFile {
    pub fn open( download: Arc<Download>, events: BackendEvents ) -> io::Result<Self> {
        let file = File::open( download.path() )?;
        Ok( Self { file, download, position: 0, events, stalled: false } )
    }


    fn set_stalled( &mut self, stalled: bool ) {
        if self.stalled == stalled {
            return;
        }
        self.stalled = stalled;
        if self.download.report_stalls.load( Ordering::Acquire ) {
            self.events.emit( if stalled { BackendEvent::Buffering } else { BackendEvent::Ready } );
        }
    }
}


impl Read for StreamingFile {
    fn read( &mut self, buf: &mut [u8] ) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok( 0 );
        }

        loop {
            if self.download.is_canceled() {
                return Err( io::Error::other( "download canceled" ) );
            }

            let available = self.download.written();
            if self.position < available {
                let max = ( available - self.position ).min( buf.len() as u64 ) as usize;
                let read = self.file.read( &mut buf[ ..max ] )?;
                self.position += read as u64;
                self.set_stalled( false );
                return Ok( read );
            }

            if self.download.is_complete() {
                return Ok( 0 );
            }

            if let Some( reason ) = self.download.failure() {
                return Err( io::Error::other( reason ) );
            }

            self.set_stalled( true );
            thread::sleep( STALL_POLL );
        }
    }
}


impl Seek for StreamingFile {
    fn seek( &mut self, pos: SeekFrom ) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start( offset ) => Some( offset ),
            SeekFrom::Current( delta ) => self.position.checked_add_signed( delta ),
            SeekFrom::End( delta ) => {
                let end = self.download.total().ok_or_else( || {
                    io::Error::new( io::ErrorKind::Unsupported, "stream length unknown" )
                })?;
                end.checked_add_signed( delta )
            }
        };

        let target = target.ok_or_else( || io::Error::new( io::ErrorKind::InvalidInput, "seek before start" ) )?;
        self.position = self.file.seek( SeekFrom::Start( target ) )?;
        Ok( self.position )
    }
}


impl MediaSource for StreamingFile {
    fn is_seekable( &self ) -> bool {
        true
    }


    fn byte_len( &self ) -> Option<u64> {
        self.download.total()
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::io::Write;

    use crate::player::{ PlayerEvent, PlayerEventSink, PlayerId };


    fn events() -> ( BackendEvents, Arc<Mutex<Vec<PlayerEvent>>> ) {
        let seen = Arc::new( Mutex::new( Vec::new() ) );
        let sink_seen = Arc::clone( &seen );
        let sink: PlayerEventSink = Arc::new( move |event| sink_seen.lock().unwrap().push( event ) );
        ( BackendEvents::new( PlayerId( 7 ), sink ), seen )
    }


    fn temp_path( name: &str ) -> PathBuf {
        std::env::temp_dir().join( format!( "remoto-test-{}-{}", std::process::id(), name ) )
    }


    #[test]
    fn test_reads_block_until_bytes_arrive() {
        let path = temp_path( "block" );
        let mut writer = File::create( &path ).unwrap();
        let download = Arc::new( Download::new( path ) );
        download.set_total( 6 );
        download.report_stalls();

        let ( events, seen ) = events();
        let mut reader = StreamingFile::open( Arc::clone( &download ), events ).unwrap();

        let feeder = Arc::clone( &download );
        let handle = thread::spawn( move || {
            writer.write_all( b"abc" ).unwrap();
            writer.flush().unwrap();
            feeder.advance( 3 );
            thread::sleep( Duration::from_millis( 60 ) );
            writer.write_all( b"def" ).unwrap();
            writer.flush().unwrap();
            feeder.advance( 3 );
            feeder.finish();
        });

        let mut out = Vec::new();
        reader.read_to_end( &mut out ).unwrap();
        handle.join().unwrap();

        assert_eq!( out, b"abcdef" );
        assert_eq!( download.percent(), 100 );

        let seen = seen.lock().unwrap();
        assert!( seen.contains( &PlayerEvent::Backend { player: PlayerId( 7 ), event: BackendEvent::Buffering } ) );
    }


    #[test]
    fn test_failed_download_errors_reader() {
        let path = temp_path( "fail" );
        File::create( &path ).unwrap();
        let download = Arc::new( Download::new( path ) );
        download.fail( "HTTP 500".into() );

        let ( events, _ ) = events();
        let mut reader = StreamingFile::open( download, events ).unwrap();
        let mut buf = [ 0u8; 4 ];
        assert!( reader.read( &mut buf ).is_err() );
    }


    #[test]
    fn test_percent_and_cleanup() {
        let path = temp_path( "cleanup" );
        File::create( &path ).unwrap();
        let download = Download::new( path.clone() );

        assert_eq!( download.percent(), 0 );
        download.set_total( 200 );
        download.advance( 50 );
        assert_eq!( download.percent(), 25 );

        drop( download );
        assert!( !path.exists() );
    }
}
