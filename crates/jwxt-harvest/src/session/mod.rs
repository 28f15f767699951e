//! Session state: the live cookie jar and its encrypted on-disk bundle.

pub mod jar;
pub mod store;

pub use jar::SessionJar;
pub use store::{clear, load_bundle, load_or_create_key_pair, save_bundle, StoredSession};
