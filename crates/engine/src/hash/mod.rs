mod digest;
mod run;

pub use self::digest::hash_file;
pub use self::run::{run_hash_phase, DispatchMode, HashOptions};
