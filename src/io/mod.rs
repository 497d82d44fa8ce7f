pub mod file;

pub use file::FileExt;
