//! Built-in Solidity libraries shipped with the crate.
//!
//! They are written into the project's library directory on open and
//! exposed to sources through remappings (`import "solstice/console.sol";`).

use std::path::Path;

use tracing::debug;

use crate::errors::SolsticeResult;
use crate::indexer::imports::RemappingTable;

pub const SYSTEM_SOURCES: &[(&str, &str)] = &[
    ("solstice/assert.sol", include_str!("../sol/assert.sol")),
    ("solstice/console.sol", include_str!("../sol/console.sol")),
];

/// Write the built-in sources under `lib_dir` and return their remappings.
/// Files already holding the same content are left untouched so their
/// modification time stays stable.
pub fn install(lib_dir: &Path) -> SolsticeResult<RemappingTable> {
    let mut table = RemappingTable::new();
    for (name, code) in SYSTEM_SOURCES {
        let path = lib_dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let current = std::fs::read(&path).ok();
        if current.as_deref() != Some(code.as_bytes()) {
            debug!(path = %path.display(), "installing system source");
            std::fs::write(&path, code)?;
        }
        table.insert(*name, path);
    }
    Ok(table)
}
