//! Audio output via cpal
//!
//! Sends decoded PCM samples to the system audio device.

use std::collections::VecDeque;
use std::sync::atomic::{ AtomicBool, AtomicU32, Ordering };
use std::sync::{ Arc, Mutex, MutexGuard };

use cpal::traits::{ DeviceTrait, HostTrait, StreamTrait };
use thiserror::Error;


/// Errors that can occur with audio output.
#[derive( Debug, Error )]
pub enum OutputError {
    #[error( "No output device available" )]
    NoDevice,

    #[error( "Failed to get default stream config: {0}" )]
    StreamConfig( String ),

    #[error( "Failed to build output stream: {0}" )]
    BuildStream( String ),

    #[error( "Failed to play stream: {0}" )]
    PlayStream( String ),
}


/// Sample queue between the decode thread and the audio callback.
/// Converts between source and output channel layouts on the way out.
pub struct SampleBuffer {
    buffer: Mutex<VecDeque<f32>>,
    capacity: usize,
    paused: AtomicBool,
    /// Volume stored as f32 bits.
    volume: AtomicU32,
    source_channels: usize,
    output_channels: usize,
}


impl SampleBuffer {
    pub fn new( capacity: usize, source_channels: u16, output_channels: u16 ) -> Self {
        Self {
            buffer: Mutex::new( VecDeque::with_capacity( capacity ) ),
            capacity,
            paused: AtomicBool::new( false ),
            volume: AtomicU32::new( 1.0_f32.to_bits() ),
            source_channels: usize::from( source_channels.max( 1 ) ),
            output_channels: usize::from( output_channels.max( 1 ) ),
        }
    }


    fn lock( &self ) -> MutexGuard<'_, VecDeque<f32>> {
        self.buffer.lock().unwrap_or_else( |e| e.into_inner() )
    }


    /// Queues as many samples as fit. Returns the number queued.
    pub fn push( &self, samples: &[f32] ) -> usize {
        let mut buf = self.lock();
        let available = self.capacity.saturating_sub( buf.len() );
        let to_push = samples.len().min( available );
        buf.extend( samples[ ..to_push ].iter().copied() );
        to_push
    }


    /// Fills `output` with whole frames, remixed to the output layout, and
    /// silence after them. Returns the number of samples written.
    pub fn pop( &self, output: &mut [f32] ) -> usize {
        if self.paused.load( Ordering::Relaxed ) {
            output.fill( 0.0 );
            return 0;
        }

        let volume = self.volume();
        let src_ch = self.source_channels;
        let out_ch = self.output_channels;

        let mut buf = self.lock();
        let frames = ( output.len() / out_ch ).min( buf.len() / src_ch );
        let mut frame = vec![ 0.0; src_ch ];

        for out_frame in output.chunks_exact_mut( out_ch ).take( frames ) {
            for ( slot, sample ) in frame.iter_mut().zip( buf.drain( ..src_ch ) ) {
                *slot = sample;
            }
            remix( &frame, out_frame );
            for sample in out_frame.iter_mut() {
                *sample *= volume;
            }
        }
        drop( buf );

        let written = frames * out_ch;
        output[ written.. ].fill( 0.0 );
        written
    }


    pub fn len( &self ) -> usize {
        self.lock().len()
    }


    pub fn is_empty( &self ) -> bool {
        self.lock().is_empty()
    }


    pub fn clear( &self ) {
        self.lock().clear();
    }


    pub fn set_paused( &self, paused: bool ) {
        self.paused.store( paused, Ordering::Relaxed );
    }


    pub fn is_paused( &self ) -> bool {
        self.paused.load( Ordering::Relaxed )
    }


    pub fn set_volume( &self, volume: f32 ) {
        self.volume.store( volume.to_bits(), Ordering::Relaxed );
    }


    pub fn volume( &self ) -> f32 {
        f32::from_bits( self.volume.load( Ordering::Relaxed ) )
    }
}


/// Maps one source frame onto one output frame.
fn remix( source: &[f32], output: &mut [f32] ) {
    match ( source.len(), output.len() ) {
        ( s, o ) if s == o => output.copy_from_slice( source ),
        ( 2, 1 ) => output[ 0 ] = ( source[ 0 ] + source[ 1 ] ) * 0.5,
        _ => {
            let last = source.len() - 1;
            for ( ch, sample ) in output.iter_mut().enumerate() {
                *sample = source[ ch.min( last ) ];
            }
        }
    }
}


/// Audio output handler.
/// Not Send: cpal streams must stay on the thread that created them.
pub struct AudioOutput {
    stream: cpal::Stream,
    sample_rate: u32,
    channels: u16,
}


impl AudioOutput {
    /// Opens the default device for the given source format.
    ///
    /// @returns The output and the buffer to push decoded samples into
    pub fn new(
        source_sample_rate: u32,
        source_channels: u16,
    ) -> Result<( Self, Arc<SampleBuffer> ), OutputError> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or( OutputError::NoDevice )?;

        tracing::info!( "Using output device: {:?}", device.name() );

        let supported_configs: Vec<_> = device
            .supported_output_configs()
            .map_err( |e| OutputError::StreamConfig( e.to_string() ) )?
            .collect();

        let supports_rate = |c: &cpal::SupportedStreamConfigRange| {
            c.min_sample_rate().0 <= source_sample_rate && c.max_sample_rate().0 >= source_sample_rate
        };

        // Exact match first, then any layout at our rate, then the default.
        let config = if let Some( c ) = supported_configs
            .iter()
            .find( |c| c.channels() == source_channels && supports_rate( c ) )
        {
            c.clone().with_sample_rate( cpal::SampleRate( source_sample_rate ) ).config()
        } else if let Some( c ) = supported_configs.iter().find( |c| supports_rate( c ) ) {
            tracing::info!(
                "Channel conversion: stream has {} channels, device using {}",
                source_channels,
                c.channels()
            );
            c.clone().with_sample_rate( cpal::SampleRate( source_sample_rate ) ).config()
        } else {
            let default_config = device
                .default_output_config()
                .map_err( |e| OutputError::StreamConfig( e.to_string() ) )?;
            tracing::info!(
                "Device does not support {} Hz; resampling to {} Hz",
                source_sample_rate,
                default_config.sample_rate().0
            );
            default_config.config()
        };

        tracing::info!(
            "Audio output config: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        // About half a second of source audio.
        let buffer_capacity = ( source_sample_rate as usize ) * ( source_channels as usize ) / 2;
        let sample_buffer = Arc::new( SampleBuffer::new( buffer_capacity, source_channels, config.channels ) );
        let callback_buffer = Arc::clone( &sample_buffer );

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    callback_buffer.pop( data );
                },
                |err| {
                    tracing::error!( "Audio output error: {}", err );
                },
                None,
            )
            .map_err( |e| OutputError::BuildStream( e.to_string() ) )?;

        Ok((
            Self {
                stream,
                sample_rate: config.sample_rate.0,
                channels: config.channels,
            },
            sample_buffer,
        ))
    }


    pub fn play( &self ) -> Result<(), OutputError> {
        self.stream
            .play()
            .map_err( |e| OutputError::PlayStream( e.to_string() ) )
    }


    /// Actual device sample rate.
    pub fn sample_rate( &self ) -> u32 {
        self.sample_rate
    }


    pub fn channels( &self ) -> u16 {
        self.channels
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_mono_to_stereo() {
        let buffer = SampleBuffer::new( 16, 1, 2 );
        buffer.push( &[ 0.5, -0.5 ] );

        let mut out = [ 1.0; 6 ];
        assert_eq!( buffer.pop( &mut out ), 4 );
        assert_eq!( out, [ 0.5, 0.5, -0.5, -0.5, 0.0, 0.0 ] );
    }


    #[test]
    fn test_stereo_to_mono_with_volume() {
        let buffer = SampleBuffer::new( 16, 2, 1 );
        buffer.set_volume( 0.5 );
        buffer.push( &[ 1.0, 0.0, 0.5, 0.5 ] );

        let mut out = [ 0.0; 2 ];
        assert_eq!( buffer.pop( &mut out ), 2 );
        assert_eq!( out, [ 0.25, 0.25 ] );
    }


    #[test]
    fn test_paused_outputs_silence() {
        let buffer = SampleBuffer::new( 16, 2, 2 );
        buffer.push( &[ 1.0, 1.0 ] );
        buffer.set_paused( true );

        let mut out = [ 1.0; 2 ];
        assert_eq!( buffer.pop( &mut out ), 0 );
        assert_eq!( out, [ 0.0, 0.0 ] );
        assert_eq!( buffer.len(), 2 );
    }


    #[test]
    fn test_push_respects_capacity() {
        let buffer = SampleBuffer::new( 3, 1, 1 );
        assert_eq!( buffer.push( &[ 0.1, 0.2, 0.3, 0.4 ] ), 3 );
        assert_eq!( buffer.push( &[ 0.5 ] ), 0 );
        buffer.clear();
        assert!( buffer.is_empty() );
    }
}
