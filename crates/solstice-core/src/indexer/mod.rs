pub mod depgraph;
pub mod diff;
pub mod filesystem;
pub mod imports;
pub mod parser;
pub mod pipeline;
