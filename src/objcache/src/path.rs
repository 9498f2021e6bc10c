//! Path-key canonicalization helpers.
//!
//! Two paths name the same node iff their path-keys are equal. On a
//! case-sensitive backend the path-key is the path itself; on a
//! case-insensitive backend each scalar is case-folded first.

/// Case-fold a path for use as a lookup key on case-insensitive backends.
/// ASCII letters are upper-cased directly; other scalars take their
/// uppercase mapping. Idempotent.
pub fn normalize_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_ascii() {
            out.push(c.to_ascii_uppercase());
        } else {
            out.extend(c.to_uppercase());
        }
    }
    out
}

/// All prefixes of `path` from the root down: `["/", "/a", "/a/b", ...]`.
/// Empty components and repeated separators are ignored. The last element
/// is the leaf; all others are its ancestors.
pub fn partial_paths(path: &str) -> Vec<String> {
    let mut paths = vec!["/".to_string()];
    let mut partial = String::new();
    for comp in path.split('/') {
        if comp.is_empty() {
            continue;
        }
        partial.push('/');
        partial.push_str(comp);
        paths.push(partial.clone());
    }
    paths
}

/// True if path-key `a` equals `b` or lives underneath it. A component
/// boundary is required: `/ab` is not under `/a`.
pub fn path_key_has_prefix(a: &[u8], b: &[u8]) -> bool {
    let (alen, blen) = (a.len(), b.len());
    alen >= blen
        && a[..blen] == *b
        && (alen == blen || (blen == 1 && b[0] == b'/') || a[blen] == b'/')
}

/// Join a child name onto a parent path or path-key.
pub fn join_key(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{}{}", parent, name)
    } else {
        format!("{}/{}", parent, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_case_idempotent() {
        for s in ["/a/b", "/Straße", "/ελληνικά/Path", "/MiXeD/case"] {
            let once = normalize_case(s);
            assert_eq!(normalize_case(&once), once);
        }
        assert_eq!(normalize_case("/abc"), "/ABC");
        assert_eq!(normalize_case("/aBc/DeF"), "/ABC/DEF");
    }

    #[test]
    fn test_partial_paths_root() {
        assert_eq!(partial_paths("/"), vec!["/"]);
        assert_eq!(partial_paths(""), vec!["/"]);
    }

    #[test]
    fn test_partial_paths_components() {
        assert_eq!(partial_paths("/a/b/c"), vec!["/", "/a", "/a/b", "/a/b/c"]);
        // repeated separators collapse
        assert_eq!(partial_paths("//a///b"), vec!["/", "/a", "/a/b"]);

        for p in ["/a", "/a/b/c", "/x//y", "/one/two/three/four"] {
            let parts = partial_paths(p);
            let comps = p.split('/').filter(|c| !c.is_empty()).count();
            assert_eq!(parts.len(), 1 + comps);
            for w in parts.windows(2) {
                assert!(path_key_has_prefix(w[1].as_bytes(), w[0].as_bytes()));
            }
        }
    }

    #[test]
    fn test_path_key_has_prefix_boundaries() {
        assert!(path_key_has_prefix(b"/a/b", b"/a"));
        assert!(path_key_has_prefix(b"/a", b"/a"));
        assert!(path_key_has_prefix(b"/a", b"/"));
        assert!(!path_key_has_prefix(b"/ab", b"/a"));
        assert!(!path_key_has_prefix(b"/a", b"/a/b"));
    }

    #[test]
    fn test_join_key() {
        assert_eq!(join_key("/", "a"), "/a");
        assert_eq!(join_key("/a", "b"), "/a/b");
    }
}
