pub mod path;

pub use path::{os_path_to_string, string_to_os_path, LogicalPath};
