//! Fuzz target: virtual path resolution
//!
//! Drives `VirtualDirTable::resolve` with arbitrary paths and verifies:
//! - No panics under arbitrary UTF-8 input
//! - A resolved path always stays inside the mapped local directory
//! - Paths containing a `..` component never resolve
//!
//! cargo fuzz run fuzz_virtual_path

#![no_main]

use std::sync::OnceLock;

use cloudlink::services::filesystem::VirtualDirTable;
use libfuzzer_sys::fuzz_target;

fn table() -> &'static (VirtualDirTable, std::path::PathBuf) {
    static TABLE: OnceLock<(VirtualDirTable, std::path::PathBuf)> = OnceLock::new();
    TABLE.get_or_init(|| {
        let root = std::env::temp_dir().join("cloudlink-fuzz-vdir");
        std::fs::create_dir_all(&root).unwrap();
        let mut t = VirtualDirTable::new();
        t.add("logs", &root).unwrap();
        (t, root)
    })
}

fuzz_target!(|data: &[u8]| {
    let Ok(path) = core::str::from_utf8(data) else {
        return;
    };
    let (table, root) = table();

    if let Some(resolved) = table.resolve(path) {
        assert!(
            resolved.starts_with(root),
            "'{path}' escaped to {}",
            resolved.display()
        );
        assert!(
            !path.split('/').any(|c| c == ".."),
            "'{path}' resolved despite a parent component"
        );
    }
});
