//! Canonical path form and leaf-name sanitisation.
//!
//! Canonical form: forward-slash separated, single leading slash, no
//! trailing slash except for the root itself. Comparison is
//! case-insensitive, case-preserving.

/// Characters not allowed in a leaf name.
const INVALID_CHARS: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Device names that cannot be used as a file stem.
const RESERVED_NAMES: [&str; 22] = [
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

const MAX_NAME_LEN: usize = 255;

/// Normalise any user/provider supplied path into canonical form.
pub fn canonicalize(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    out.push('/');
    let mut first = true;
    for segment in path.split(['/', '\\']) {
        if segment.is_empty() || segment == "." {
            continue;
        }
        if !first {
            out.push('/');
        }
        out.push_str(segment);
        first = false;
    }
    out
}

pub fn is_root(path: &str) -> bool {
    path == "/"
}

/// Case-insensitive path equality.
pub fn paths_equal(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Case-insensitive name equality within a folder.
pub fn names_equal(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Split a canonical path into (parent, leaf); the parent of a top-level
/// entry is "/". Returns `None` for the root.
pub fn split_parent(path: &str) -> Option<(&str, &str)> {
    if is_root(path) {
        return None;
    }
    let cut = path.rfind('/').unwrap_or(0);
    if cut == 0 {
        Some(("/", &path[1..]))
    } else {
        Some((&path[..cut], &path[cut + 1..]))
    }
}

pub fn join(parent: &str, leaf: &str) -> String {
    if is_root(parent) {
        format!("/{leaf}")
    } else {
        format!("{parent}/{leaf}")
    }
}

/// Segments of a canonical path, root excluded.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// True when `path` is `ancestor` itself or lies underneath it.
pub fn is_within(path: &str, ancestor: &str) -> bool {
    if is_root(ancestor) {
        return true;
    }
    if path.len() == ancestor.len() {
        return paths_equal(path, ancestor);
    }
    path.len() > ancestor.len()
        && path.as_bytes()[ancestor.len()] == b'/'
        && path[..ancestor.len()].eq_ignore_ascii_case(ancestor)
}

fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    }
}

/// Sanitise one leaf name: replace invalid characters, trim trailing spaces
/// and dots, rename reserved device stems, cap the length keeping the
/// extension. Idempotent.
pub fn sanitize_name(name: &str) -> String {
    let mut cleaned: String = name
        .chars()
        .map(|c| if INVALID_CHARS.contains(&c) { '_' } else { c })
        .collect();
    while cleaned.ends_with(' ') || cleaned.ends_with('.') {
        cleaned.pop();
    }
    if cleaned.is_empty() {
        cleaned.push('_');
    }

    let (stem, ext) = split_extension(&cleaned);
    if RESERVED_NAMES
        .iter()
        .any(|r| r.eq_ignore_ascii_case(stem))
    {
        cleaned = format!("{stem}_File{ext}");
    }

    if cleaned.len() > MAX_NAME_LEN {
        let (stem, ext) = split_extension(&cleaned);
        let keep = MAX_NAME_LEN.saturating_sub(ext.len());
        let mut cut = keep.min(stem.len());
        while cut > 0 && !stem.is_char_boundary(cut) {
            cut -= 1;
        }
        cleaned = format!("{}{}", &stem[..cut], ext);
    }
    cleaned
}

/// `name`, `name (1)`, `name (2)`, … with the suffix before the extension.
pub fn collision_variant(name: &str, n: u32) -> String {
    if n == 0 {
        return name.to_string();
    }
    let (stem, ext) = split_extension(name);
    format!("{stem} ({n}){ext}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize() {
        assert_eq!(canonicalize(""), "/");
        assert_eq!(canonicalize("/"), "/");
        assert_eq!(canonicalize("a/b"), "/a/b");
        assert_eq!(canonicalize("//a///b/"), "/a/b");
        assert_eq!(canonicalize("\\a\\b"), "/a/b");
        assert_eq!(canonicalize("/a/./b"), "/a/b");
    }

    #[test]
    fn test_split_parent() {
        assert_eq!(split_parent("/"), None);
        assert_eq!(split_parent("/a"), Some(("/", "a")));
        assert_eq!(split_parent("/a/b/c"), Some(("/a/b", "c")));
    }

    #[test]
    fn test_is_within() {
        assert!(is_within("/a/b", "/a"));
        assert!(is_within("/A/b", "/a"));
        assert!(is_within("/a", "/a"));
        assert!(!is_within("/ab", "/a"));
        assert!(!is_within("/b", "/a"));
        assert!(is_within("/anything", "/"));
    }

    #[test]
    fn test_sanitize_invalid_chars() {
        assert_eq!(sanitize_name("a<b>c:d\"e|f?g*h"), "a_b_c_d_e_f_g_h");
        assert_eq!(sanitize_name("movie [1080p].mkv"), "movie [1080p].mkv");
    }

    #[test]
    fn test_sanitize_trailing_dots_and_spaces() {
        assert_eq!(sanitize_name("name. "), "name");
        assert_eq!(sanitize_name("name..."), "name");
        assert_eq!(sanitize_name("   "), "_");
    }

    #[test]
    fn test_sanitize_reserved_names() {
        assert_eq!(sanitize_name("CON"), "CON_File");
        assert_eq!(sanitize_name("con.txt"), "con_File.txt");
        assert_eq!(sanitize_name("LPT7.log"), "LPT7_File.log");
        assert_eq!(sanitize_name("console.txt"), "console.txt");
    }

    #[test]
    fn test_sanitize_truncates_keeping_extension() {
        let long = format!("{}.mkv", "x".repeat(300));
        let out = sanitize_name(&long);
        assert_eq!(out.len(), 255);
        assert!(out.ends_with(".mkv"));
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        for name in ["CON", "a<b", "name. ", &format!("{}.mkv", "y".repeat(300))] {
            let once = sanitize_name(name);
            assert_eq!(sanitize_name(&once), once);
        }
    }

    #[test]
    fn test_collision_variant() {
        assert_eq!(collision_variant("a.txt", 0), "a.txt");
        assert_eq!(collision_variant("a.txt", 1), "a (1).txt");
        assert_eq!(collision_variant("folder", 2), "folder (2)");
    }
}
