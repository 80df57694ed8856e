//! Path handling. Both separators are accepted because containers move
//! between hosts.

/// Split a path into its components. Empty segments collapse, so
/// `"/a//b/"` and `"a\\b"` name the same node; the empty path is the
/// root.
pub fn split_path(path: &str) -> Vec<&str> {
    path.split(['/', '\\']).filter(|s| !s.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splitting() {
        assert_eq!(split_path(""), Vec::<&str>::new());
        assert_eq!(split_path("/"), Vec::<&str>::new());
        assert_eq!(split_path("///"), Vec::<&str>::new());
        assert_eq!(split_path("/hello"), vec!["hello"]);
        assert_eq!(split_path("hello"), vec!["hello"]);
        assert_eq!(split_path("/a/b/c"), vec!["a", "b", "c"]);
        assert_eq!(split_path("/a//b/"), vec!["a", "b"]);
        assert_eq!(split_path("a\\b\\c"), vec!["a", "b", "c"]);
        assert_eq!(split_path("\\mixed/style\\path"), vec!["mixed", "style", "path"]);
    }
}
