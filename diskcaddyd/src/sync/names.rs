pub const SUPPORTED_EXTENSIONS: [&str; 7] = ["d64", "d81", "g64", "nib", "nbz", "t64", "prg"];

/// Replaces path separators so a name can never address a directory on the device.
pub fn sanitize_name(name: &str) -> String {
    name.replace(['/', '\\'], "_")
}

/// Extension after the last dot, without the dot and with its case preserved.
pub fn extension_of(name: &str) -> Option<&str> {
    name.rfind('.').map(|idx| &name[idx + 1..])
}

pub fn base_of(name: &str) -> &str {
    match name.rfind('.') {
        Some(idx) => &name[..idx],
        None => name,
    }
}

/// Last component of an archive path (`disks/A.D64` -> `A.D64`).
pub fn file_name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

pub fn is_supported(name: &str) -> bool {
    extension_of(name).is_some_and(|ext| {
        SUPPORTED_EXTENSIONS
            .iter()
            .any(|supported| ext.eq_ignore_ascii_case(supported))
    })
}

pub fn is_archive(name: &str) -> bool {
    extension_of(name).is_some_and(|ext| ext.eq_ignore_ascii_case("zip"))
}

pub fn truncate_chars(value: &str, max_chars: usize) -> &str {
    match value.char_indices().nth(max_chars) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}
