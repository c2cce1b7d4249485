//! Destination naming helpers

use std::path::PathBuf;

/// Name used when a URL has no usable last path segment
pub const FALLBACK_FILE_NAME: &str = "download.bin";

/// File name from the last non-empty path segment of `url`, percent-decoded.
///
/// Path separators and NUL are replaced so the name stays inside its directory.
pub fn file_name_from_url(url: &str) -> String {
    let Ok(parsed) = url::Url::parse(url) else {
        return FALLBACK_FILE_NAME.to_string();
    };

    let last = parsed
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .map(|s| {
            urlencoding::decode(s)
                .map(|decoded| decoded.into_owned())
                .unwrap_or_else(|_| s.to_string())
        });

    match last.map(|name| sanitize(&name)) {
        Some(name) if !name.is_empty() && name != "." && name != ".." => name,
        _ => FALLBACK_FILE_NAME.to_string(),
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

/// `<home>/Downloads`, or a relative `Downloads` when no home is known
pub fn default_save_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join("Downloads"))
        .unwrap_or_else(|| PathBuf::from("Downloads"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_segment_is_decoded() {
        assert_eq!(
            file_name_from_url("https://example.com/files/My%20Report.pdf?x=1"),
            "My Report.pdf"
        );
        assert_eq!(file_name_from_url("http://example.com/a/b/"), "b");
    }

    #[test]
    fn falls_back_when_nothing_usable() {
        assert_eq!(file_name_from_url("http://example.com/"), FALLBACK_FILE_NAME);
        assert_eq!(file_name_from_url("http://example.com"), FALLBACK_FILE_NAME);
        assert_eq!(file_name_from_url("not a url"), FALLBACK_FILE_NAME);
        assert_eq!(file_name_from_url("http://example.com/%2E%2E"), FALLBACK_FILE_NAME);
    }

    #[test]
    fn encoded_separators_stay_in_the_name() {
        assert_eq!(file_name_from_url("http://example.com/a%2Fb.txt"), "a_b.txt");
    }

    #[test]
    fn default_dir_ends_in_downloads() {
        assert!(default_save_dir().ends_with("Downloads"));
    }
}
