//! Worker thread bodies: the download pool and the single writer.

pub mod download;
pub mod writer;

pub use download::download_worker;
pub use writer::writer_worker;
