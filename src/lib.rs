//! Private document retrieval over SimplePIR. A client embeds its question
//! elsewhere, picks the nearest document locally from public embeddings,
//! then fetches that document without the server learning which one.

pub mod client;
pub mod clustering;
pub mod corpus;
pub mod encoding;
pub mod error;
pub mod math;
pub mod pir;
pub mod server;
pub mod tcp;

pub use error::{Error, Result};
