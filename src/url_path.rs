//! Small string helpers for slicing URL paths.

/// Strip every leading and trailing occurrence of `ch`.
pub fn trim_char(input: &str, ch: char) -> &str {
    input.trim_matches(ch)
}

/// The text after the final `/`, or the whole input when there is none.
pub fn last_segment(url: &str) -> &str {
    match url.rfind('/') {
        Some(idx) => &url[idx + 1..],
        None => url,
    }
}

/// Everything before the final `/`. An input without a slash yields an empty string.
pub fn strip_last_segment(url: &str) -> &str {
    match url.rfind('/') {
        Some(idx) => &url[..idx],
        None => "",
    }
}

/// Directory of `url` joined with a relative `sub_path`.
pub fn sibling(url: &str, sub_path: &str) -> String {
    format!("{}/{}", trim_char(strip_last_segment(url), '/'), sub_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trim_char() {
        assert_eq!(trim_char("//a/b//", '/'), "a/b");
        assert_eq!(trim_char("abc", '/'), "abc");
        assert_eq!(trim_char("////", '/'), "");
        assert_eq!(trim_char("", '/'), "");
    }

    #[test]
    fn test_last_segment() {
        assert_eq!(last_segment("https://host/docs/readme.md"), "readme.md");
        assert_eq!(last_segment("https://host/docs/"), "");
        assert_eq!(last_segment("plain"), "plain");
    }

    #[test]
    fn test_strip_last_segment() {
        assert_eq!(strip_last_segment("https://h/pkg/module.json"), "https://h/pkg");
        assert_eq!(strip_last_segment("no-slash"), "");
    }

    #[test]
    fn test_sibling() {
        assert_eq!(
            sibling("https://h/pkg/module.json", "icon.png"),
            "https://h/pkg/icon.png"
        );
        assert_eq!(
            sibling("https://h/docs/README.md", "img/shot.png"),
            "https://h/docs/img/shot.png"
        );
    }
}
