//! Random access into gzip files through saved decoder checkpoints.
//!
//! A sequential pass over a gzip file records, every N records, the
//! decoder state at the nearest preceding deflate block boundary. Seeking
//! to record k later restores the closest checkpoint at or before k and
//! decodes forward from there instead of from the start of the file.

pub mod checkpoint;
pub mod inflate;
pub mod reader;

pub use checkpoint::{Checkpoint, CheckpointSet};
pub use inflate::{Boundary, Inflater};
pub use reader::{build_checkpoints, CheckpointedGzip};
