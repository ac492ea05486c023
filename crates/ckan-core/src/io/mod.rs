pub mod archive;
pub mod download;
