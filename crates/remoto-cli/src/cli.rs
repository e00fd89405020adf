//! Command-line argument parsing for Remoto.

use clap::Parser;


/// Remoto - play a networked music server's library from the terminal.
#[derive( Parser, Debug, Default )]
#[command( name = "remoto" )]
#[command( version, about, long_about = None )]
pub struct Args {
    /// Server host name or address.
    #[arg( long )]
    pub host: Option<String>,

    /// WebSocket port.
    #[arg( short, long )]
    pub port: Option<u16>,

    /// HTTP audio port.
    #[arg( long )]
    pub audio_port: Option<u16>,

    /// Server password.
    #[arg( long )]
    pub password: Option<String>,

    /// Connect with TLS (wss/https).
    #[arg( long )]
    pub tls: bool,

    /// Log filter, e.g. "debug" or "remoto_core=trace".
    #[arg( long )]
    pub log_level: Option<String>,
}
