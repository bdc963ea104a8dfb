//! Free-space lookup for the volume that holds the content store.

use std::path::Path;
use sysinfo::Disks;

/// Bytes available to the current user on the disk containing `path`.
///
/// Picks the disk with the longest mount point that prefixes the
/// canonicalized path. Returns `None` when no disk matches, in which case
/// callers skip the pre-flight check.
pub fn available_space(path: &Path) -> Option<u64> {
    let resolved = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();

    disks
        .list()
        .iter()
        .filter(|disk| resolved.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_available_space_for_temp_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        // Containers may hide mount info; only check the value when present.
        if let Some(free) = available_space(dir.path()) {
            assert!(free > 0);
        }
    }
}
