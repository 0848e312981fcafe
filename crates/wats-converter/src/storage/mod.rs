pub mod filesystem;

pub use filesystem::{
    atomic_rename, atomic_write, delete_file, ensure_directory, move_file, move_into,
    resolve_conflict, zip_into, TEMP_SUFFIX,
};
