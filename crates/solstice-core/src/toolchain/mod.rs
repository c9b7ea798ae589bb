pub mod download;
pub mod solc;
pub mod version;
