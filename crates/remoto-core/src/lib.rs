//! Remoto Core - remote music client engine
//!
//! This crate provides the core functionality for playing a remote music
//! server's library: the request/response socket connection, queries over
//! remote lists, gapless playback through two rotating players, and a
//! sliding window for browsing large lists.

pub mod audio;
pub mod cache;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod player;
pub mod protocol;
pub mod provider;
pub mod query;
pub mod session;
pub mod track;
pub mod window;

pub use command::{ Command, CommandError };
pub use config::{ ConnectionConfig, StreamUrls, Timing };
pub use connection::{ ConnectionHandle, ConnectionState, ConnectionStatus, WebSocketConnector };
pub use error::{ ConnectError, MessageError, RequestError };
pub use message::{ MessageBuilder, SocketMessage };
pub use provider::{ DataProvider, ProviderEvent };
pub use query::{ QueryContext, QueryFactory, TrackSource };
pub use session::{ RepeatMode, SessionHandle, SessionOptions, SessionSnapshot, SessionState };
pub use track::{ CategoryValue, Track };
pub use window::{ SlidingWindow, WindowNotice, WindowUpdate };
