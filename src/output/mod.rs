//! Output engines: windowed caches over the stream and over search results.

pub mod search;
pub mod stream;
mod window;

pub use search::SearchOutput;
pub use stream::StreamOutput;
