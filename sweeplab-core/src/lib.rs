//! Sweeplab Core — configuration identity and sweep expansion.
//!
//! This crate holds everything that decides *what* a sweep runs and *where*
//! each run lives:
//! - Configuration values, dotted paths and the immutable `ConfigTree`
//! - Sweep specifications and the Cartesian `SweepExpander`
//! - Canonical run identities (`path=value,path=value`)
//! - Run records and the on-disk run directory layout

pub mod error;
pub mod identity;
pub mod path;
pub mod record;
pub mod run_dir;
pub mod sweep;
pub mod tree;
pub mod value;

pub use error::{ConfigError, SchemaError};
pub use identity::{encode_pairs, RunIdentity};
pub use path::ConfigPath;
pub use record::{RunRecord, RunStatus};
pub use run_dir::{Checkpoint, LayoutError, RunDirectory, RunLayout};
pub use sweep::{Expansion, SweepAxis, SweepError, SweepExpander, SweepSpec};
pub use tree::{parse_override, ConfigTree};
pub use value::{ByteSize, Value, WallClock};
