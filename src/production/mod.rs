//! Production implementations of traits

mod http_sender;

pub use http_sender::HttpRelaySender;
