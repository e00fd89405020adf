//! Streaming playback backend
//!
//! Downloads a track over HTTP into a temporary file, decodes it with
//! symphonia while the download is still running, resamples with rubato
//! when the device needs a different rate, and plays through cpal.

use std::sync::atomic::{ AtomicBool, AtomicU32, AtomicU64, Ordering };
use std::sync::{ Arc, Mutex };
use std::thread;
use std::time::Duration;

use futures_util::StreamExt;
use rubato::{ FastFixedOut, PolynomialDegree, Resampler };
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;

use super::decoder::Decoder;
use super::output::{ AudioOutput, SampleBuffer };
use super::source::{ Download, StreamingFile };
use crate::config::ConnectionConfig;
use crate::player::{ BackendEvent, BackendEvents, BackendFactory, PlaybackBackend };


/// The audio endpoint authenticates every user as "default".
const AUDIO_USER: &str = "default";


#[derive( Debug, Error )]
pub enum StreamError {
    #[error( "HTTP error: {0}" )]
    Http( #[from] reqwest::Error ),

    #[error( "Server answered {0}" )]
    Status( u16 ),

    #[error( "IO error: {0}" )]
    Io( #[from] std::io::Error ),
}


/// State shared between a backend and its playback thread.
struct PlaybackControl {
    paused: AtomicBool,
    stop: AtomicBool,
    /// Volume stored as f32 bits.
    volume: AtomicU32,
    frames: AtomicU64,
    sample_rate: AtomicU32,
    /// Milliseconds, `u64::MAX` while unknown.
    duration_ms: AtomicU64,
    seek: Mutex<Option<Duration>>,
}


impl PlaybackControl {
    fn new( volume: f32 ) -> Self {
        Self {
            paused: AtomicBool::new( true ),
            stop: AtomicBool::new( false ),
            volume: AtomicU32::new( volume.to_bits() ),
            frames: AtomicU64::new( 0 ),
            sample_rate: AtomicU32::new( 0 ),
            duration_ms: AtomicU64::new( u64::MAX ),
            seek: Mutex::new( None ),
        }
    }


    fn stopped( &self ) -> bool {
        self.stop.load( Ordering::Relaxed )
    }


    fn volume( &self ) -> f32 {
        f32::from_bits( self.volume.load( Ordering::Relaxed ) )
    }


    fn position( &self ) -> Duration {
        match self.sample_rate.load( Ordering::Relaxed ) {
            0 => Duration::ZERO,
            rate => Duration::from_secs_f64( self.frames.load( Ordering::Relaxed ) as f64 / f64::from( rate ) ),
        }
    }


    fn duration( &self ) -> Option<Duration> {
        match self.duration_ms.load( Ordering::Relaxed ) {
            u64::MAX => None,
            ms => Some( Duration::from_millis( ms ) ),
        }
    }


    fn request_seek( &self, position: Duration ) {
        *self.seek.lock().unwrap_or_else( |e| e.into_inner() ) = Some( position );
    }


    fn take_seek( &self ) -> Option<Duration> {
        self.seek.lock().unwrap_or_else( |e| e.into_inner() ).take()
    }
}


struct Job {
    control: Arc<PlaybackControl>,
    download: Arc<Download>,
    fetch: JoinHandle<()>,
}


/// `PlaybackBackend` that streams from the server's audio endpoint.
pub struct StreamingBackend {
    events: BackendEvents,
    http: reqwest::Client,
    password: String,
    volume: f32,
    serial: u64,
    job: Option<Job>,
}


impl StreamingBackend {
    pub fn new( events: BackendEvents, http: reqwest::Client, password: String ) -> Self {
        Self {
            events,
            http,
            password,
            volume: 1.0,
            serial: 0,
            job: None,
        }
    }


    fn stop_job( &mut self ) {
        if let Some( job ) = self.job.take() {
            job.control.stop.store( true, Ordering::Relaxed );
            job.download.cancel();
            job.fetch.abort();
        }
    }
}


impl PlaybackBackend for StreamingBackend {
    fn prepare( &mut self, uri: &str ) {
        self.stop_job();
        self.serial += 1;

        let path = std::env::temp_dir().join( format!(
            "remoto-{}-{}-{}.stream",
            std::process::id(),
            self.events.player().0,
            self.serial
        ));

        let file = match std::fs::File::create( &path ) {
            Ok( file ) => file,
            Err( e ) => {
                self.events.emit( BackendEvent::Failed( format!( "cannot create {:?}: {}", path, e ) ) );
                return;
            }
        };

        let download = Arc::new( Download::new( path ) );
        let control = Arc::new( PlaybackControl::new( self.volume ) );

        let fetch = tokio::spawn( fetch(
            self.http.clone(),
            uri.to_string(),
            self.password.clone(),
            tokio::fs::File::from_std( file ),
            Arc::clone( &download ),
            self.events.clone(),
        ));

        let thread_download = Arc::clone( &download );
        let thread_control = Arc::clone( &control );
        let thread_events = self.events.clone();
        let extension = extension_hint( uri );
        let spawned = thread::Builder::new()
            .name( format!( "remoto-playback-{}", self.events.player().0 ) )
            .spawn( move || playback( thread_download, thread_control, thread_events, extension ) );

        if let Err( e ) = spawned {
            fetch.abort();
            self.events.emit( BackendEvent::Failed( format!( "cannot start playback thread: {}", e ) ) );
            return;
        }

        self.job = Some( Job { control, download, fetch } );
    }


    fn start( &mut self ) {
        if let Some( job ) = &self.job {
            job.control.paused.store( false, Ordering::Relaxed );
        }
    }


    fn pause( &mut self ) {
        if let Some( job ) = &self.job {
            job.control.paused.store( true, Ordering::Relaxed );
        }
    }


    fn seek( &mut self, position: Duration ) {
        if let Some( job ) = &self.job {
            job.control.request_seek( position );
        }
    }


    fn position( &self ) -> Duration {
        self.job.as_ref().map( |job| job.control.position() ).unwrap_or_default()
    }


    fn duration( &self ) -> Option<Duration> {
        self.job.as_ref().and_then( |job| job.control.duration() )
    }


    fn buffered_percent( &self ) -> u8 {
        self.job.as_ref().map( |job| job.download.percent() ).unwrap_or( 0 )
    }


    fn set_volume( &mut self, volume: f32 ) {
        self.volume = volume;
        if let Some( job ) = &self.job {
            job.control.volume.store( volume.to_bits(), Ordering::Relaxed );
        }
    }


    fn release( &mut self ) {
        self.stop_job();
    }
}


impl Drop for StreamingBackend {
    fn drop( &mut self ) {
        self.stop_job();
    }
}


/// Creates a `StreamingBackend` per player.
#[derive( Debug, Clone )]
pub struct StreamingBackendFactory {
    http: reqwest::Client,
    password: String,
}


impl StreamingBackendFactory {
    pub fn new( config: &ConnectionConfig ) -> Result<Self, StreamError> {
        let http = reqwest::Client::builder()
            .connect_timeout( config.timing.connect_timeout )
            .build()?;

        Ok( Self { http, password: config.password.clone() } )
    }
}


impl BackendFactory for StreamingBackendFactory {
    fn create( &self, events: BackendEvents ) -> Box<dyn PlaybackBackend> {
        Box::new( StreamingBackend::new( events, self.http.clone(), self.password.clone() ) )
    }
}


/// Guesses the container from a stream url: an explicit `format=` query
/// parameter wins over the path extension.
fn extension_hint( uri: &str ) -> Option<String> {
    let ( path, query ) = match uri.split_once( '?' ) {
        Some(( path, query )) => ( path, Some( query ) ),
        None => ( uri, None ),
    };

    let format = query.and_then( |q| {
        q.split( '&' )
            .filter_map( |pair| pair.split_once( '=' ) )
            .find( |( key, _ )| *key == "format" )
            .map( |( _, value )| value.to_string() )
    });

    format.or_else( || {
        let name = path.rsplit( '/' ).next()?;
        let ( _, ext ) = name.rsplit_once( '.' )?;
        ( !ext.is_empty() && ext.len() <= 5 ).then( || ext.to_lowercase() )
    })
}


async fn fetch(
    http: reqwest::Client,
    uri: String,
    password: String,
    file: tokio::fs::File,
    download: Arc<Download>,
    events: BackendEvents,
) {
    match fetch_into( &http, &uri, &password, file, &download, &events ).await {
        Ok( () ) => {
            tracing::debug!( "Downloaded {} ({} bytes)", uri, download.written() );
            download.finish();
            events.emit( BackendEvent::BufferProgress( 100 ) );
        }
        Err( e ) => {
            tracing::warn!( "Download of {} failed: {}", uri, e );
            download.fail( e.to_string() );
        }
    }
}


async fn fetch_into(
    http: &reqwest::Client,
    uri: &str,
    password: &str,
    mut file: tokio::fs::File,
    download: &Download,
    events: &BackendEvents,
) -> Result<(), StreamError> {
    let response = http
        .get( uri )
        .basic_auth( AUDIO_USER, Some( password ) )
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        return Err( StreamError::Status( status.as_u16() ) );
    }

    if let Some( total ) = response.content_length() {
        download.set_total( total );
    }

    let mut body = std::pin::pin!( response.bytes_stream() );
    let mut reported = 0;
    while let Some( chunk ) = body.next().await {
        let chunk = chunk?;
        file.write_all( &chunk ).await?;
        file.flush().await?;
        download.advance( chunk.len() as u64 );

        let percent = download.percent();
        if percent != reported {
            reported = percent;
            events.emit( BackendEvent::BufferProgress( percent ) );
        }
    }

    Ok( () )
}


/// Body of the playback thread.
fn playback( download: Arc<Download>, control: Arc<PlaybackControl>, events: BackendEvents, extension: Option<String> ) {
    let outcome = open_and_play( &download, &control, &events, extension.as_deref() );

    if control.stopped() {
        tracing::debug!( "Playback thread for {:?}: stopped", events.player() );
        return;
    }

    match outcome {
        Ok( () ) => events.emit( BackendEvent::Ended ),
        Err( reason ) => events.emit( BackendEvent::Failed( reason ) ),
    }
}


fn open_and_play(
    download: &Arc<Download>,
    control: &PlaybackControl,
    events: &BackendEvents,
    extension: Option<&str>,
) -> Result<(), String> {
    let source = StreamingFile::open( Arc::clone( download ), events.clone() ).map_err( |e| e.to_string() )?;
    let mut decoder = Decoder::open( Box::new( source ), extension ).map_err( |e| e.to_string() )?;

    let source_rate = decoder.sample_rate();
    let channels = decoder.channels();
    control.sample_rate.store( source_rate, Ordering::Relaxed );
    if let Some( secs ) = decoder.duration() {
        control.duration_ms.store( ( secs * 1000.0 ) as u64, Ordering::Relaxed );
    }

    download.report_stalls();
    events.emit( BackendEvent::Ready );

    // The device is only opened once playback actually starts.
    while control.paused.load( Ordering::Relaxed ) {
        if control.stopped() {
            return Ok( () );
        }
        thread::sleep( Duration::from_millis( 10 ) );
    }

    let ( output, sample_buffer ) = AudioOutput::new( source_rate, channels as u16 ).map_err( |e| e.to_string() )?;
    output.play().map_err( |e| e.to_string() )?;

    let target_rate = output.sample_rate();
    let resampler = if source_rate != target_rate {
        tracing::info!( "Resampling: {} Hz → {} Hz", source_rate, target_rate );
        let resampler = FastFixedOut::<f32>::new(
            f64::from( target_rate ) / f64::from( source_rate ),
            2.0,
            PolynomialDegree::Cubic,
            1024,
            channels,
        ).map_err( |e| format!( "Failed to create resampler: {}", e ) )?;
        Some( resampler )
    } else {
        None
    };

    decode_loop( &mut decoder, &sample_buffer, control, resampler )
}


/// Decodes into `sample_buffer` until EOF, a stop request or an error.
/// Returns after the buffer drained at EOF.
fn decode_loop(
    decoder: &mut Decoder,
    sample_buffer: &SampleBuffer,
    control: &PlaybackControl,
    mut resampler: Option<FastFixedOut<f32>>,
) -> Result<(), String> {
    let channels = decoder.channels();
    let source_rate = decoder.sample_rate();
    let mut pending: Vec<Vec<f32>> = ( 0..channels ).map( |_| Vec::new() ).collect();

    loop {
        if control.stopped() {
            return Ok( () );
        }

        if let Some( target ) = control.take_seek() {
            match decoder.seek( target.as_secs_f64() ) {
                Ok( () ) => {
                    sample_buffer.clear();
                    pending.iter_mut().for_each( Vec::clear );
                    let frames = ( target.as_secs_f64() * f64::from( source_rate ) ) as u64;
                    control.frames.store( frames, Ordering::Relaxed );
                }
                Err( e ) => tracing::warn!( "Seek failed: {}", e ),
            }
        }

        sample_buffer.set_volume( control.volume() );
        let paused = control.paused.load( Ordering::Relaxed );
        sample_buffer.set_paused( paused );
        if paused {
            thread::sleep( Duration::from_millis( 10 ) );
            continue;
        }

        // Keep about 50ms decoded ahead.
        let target_buffer = ( source_rate as usize * channels ) / 20;
        if sample_buffer.len() > target_buffer {
            thread::sleep( Duration::from_millis( 5 ) );
            continue;
        }

        match decoder.decode_next() {
            Ok( Some( samples ) ) => {
                control.frames.fetch_add( ( samples.len() / channels ) as u64, Ordering::Relaxed );

                let output = match resampler.as_mut() {
                    Some( resampler ) => resample( resampler, &mut pending, &samples ),
                    None => samples,
                };
                push_all( sample_buffer, control, &output );
            }
            Ok( None ) => {
                if let Some( resampler ) = resampler.as_mut() {
                    if !pending[ 0 ].is_empty() {
                        match resampler.process_partial( Some( &pending ), None ) {
                            Ok( resampled ) => push_all( sample_buffer, control, &interleave( &resampled ) ),
                            Err( e ) => tracing::error!( "Final resample error: {}", e ),
                        }
                    }
                }

                tracing::info!( "Playback reached end of stream" );
                while !sample_buffer.is_empty() && !control.stopped() {
                    thread::sleep( Duration::from_millis( 10 ) );
                }
                return Ok( () );
            }
            Err( e ) => return Err( e.to_string() ),
        }
    }
}


/// Feeds interleaved `samples` through the resampler. Frames that do not
/// fill a whole resampler chunk stay in `pending`.
fn resample( resampler: &mut FastFixedOut<f32>, pending: &mut [Vec<f32>], samples: &[f32] ) -> Vec<f32> {
    let channels = pending.len();
    for frame in samples.chunks( channels ) {
        for ( ch, sample ) in frame.iter().enumerate() {
            pending[ ch ].push( *sample );
        }
    }

    let mut out = Vec::new();
    while pending[ 0 ].len() >= resampler.input_frames_next() {
        let needed = resampler.input_frames_next();
        let chunk: Vec<Vec<f32>> = pending.iter_mut().map( |ch| ch.drain( ..needed ).collect() ).collect();
        match resampler.process( &chunk, None ) {
            Ok( resampled ) => out.extend( interleave( &resampled ) ),
            Err( e ) => {
                tracing::error!( "Resample error: {}", e );
                break;
            }
        }
    }
    out
}


fn push_all( sample_buffer: &SampleBuffer, control: &PlaybackControl, samples: &[f32] ) {
    let mut offset = 0;
    while offset < samples.len() && !control.stopped() {
        let pushed = sample_buffer.push( &samples[ offset.. ] );
        offset += pushed;
        if pushed == 0 {
            thread::sleep( Duration::from_millis( 5 ) );
        }
    }
}


/// [[L0, L1, ...], [R0, R1, ...]] → [L0, R0, L1, R1, ...]
fn interleave( channels: &[Vec<f32>] ) -> Vec<f32> {
    let Some( first ) = channels.first() else {
        return Vec::new();
    };

    let mut out = Vec::with_capacity( first.len() * channels.len() );
    for f in 0..first.len() {
        for ch in channels {
            out.push( ch[ f ] );
        }
    }
    out
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_extension_from_format_parameter() {
        assert_eq!(
            extension_hint( "http://h:7906/audio/external_id/abc?bitrate=192&format=ogg" ),
            Some( "ogg".into() )
        );
    }


    #[test]
    fn test_extension_from_path() {
        assert_eq!( extension_hint( "http://h/music/Song.FLAC" ), Some( "flac".into() ) );
        assert_eq!( extension_hint( "http://h:7906/audio/external_id/abc" ), None );
    }


    #[test]
    fn test_interleave() {
        let planar = vec![ vec![ 1.0, 2.0 ], vec![ 3.0, 4.0 ] ];
        assert_eq!( interleave( &planar ), vec![ 1.0, 3.0, 2.0, 4.0 ] );
        assert!( interleave( &[] ).is_empty() );
    }


    #[test]
    fn test_control_reports_position_and_duration() {
        let control = PlaybackControl::new( 1.0 );
        assert_eq!( control.position(), Duration::ZERO );
        assert_eq!( control.duration(), None );

        control.sample_rate.store( 1000, Ordering::Relaxed );
        control.frames.store( 2500, Ordering::Relaxed );
        control.duration_ms.store( 60_000, Ordering::Relaxed );
        assert_eq!( control.position(), Duration::from_millis( 2500 ) );
        assert_eq!( control.duration(), Some( Duration::from_secs( 60 ) ) );

        control.request_seek( Duration::from_secs( 3 ) );
        assert_eq!( control.take_seek(), Some( Duration::from_secs( 3 ) ) );
        assert_eq!( control.take_seek(), None );
    }
}
