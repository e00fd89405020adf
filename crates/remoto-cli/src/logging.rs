//! Log setup. The terminal belongs to the UI, so logs go to a file.

use std::fs::{ self, File };
use std::path::PathBuf;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;


const DEFAULT_FILTER: &str = "remoto=info,remoto_core=info";


/// Installs the global subscriber.
///
/// @param level - Overrides `RUST_LOG` and the default filter
///
/// @returns The log file path, if one could be opened
pub fn init( level: Option<&str> ) -> Option<PathBuf> {
    let filter = match level {
        Some( level ) => EnvFilter::new( level ),
        None => EnvFilter::try_from_default_env().unwrap_or_else( |_| EnvFilter::new( DEFAULT_FILTER ) ),
    };

    let path = log_path()?;
    let file = match File::create( &path ) {
        Ok( file ) => file,
        Err( _ ) => return None,
    };

    let installed = tracing_subscriber::fmt()
        .with_env_filter( filter )
        .with_writer( Mutex::new( file ) )
        .with_ansi( false )
        .try_init()
        .is_ok();

    installed.then_some( path )
}


fn log_path() -> Option<PathBuf> {
    let dir = dirs::data_local_dir().or_else( dirs::cache_dir )?.join( "remoto" );
    fs::create_dir_all( &dir ).ok()?;
    Some( dir.join( "remoto.log" ) )
}
