#![warn(future_incompatible, nonstandard_style, rust_2018_idioms, unused)]
#![warn(clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::wildcard_imports,
    clippy::similar_names,
    clippy::cast_possible_truncation,
    clippy::too_many_lines
)]

mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod flags;
pub mod flow;
pub mod frame;
pub mod handshake;
pub mod hpack;
pub mod request;
pub mod response;
pub mod scheduler;
pub mod settings;
pub mod stream;
pub mod types;

pub use bytes::Bytes;
pub use client::Client;
pub use config::Config;
pub use connection::{Connection, PushedExchange, ResponseHandle, SessionState};
pub use error::{H2Error, LocalError};
pub use request::{Method, Request};
pub use response::Response;
pub use url::Url;
