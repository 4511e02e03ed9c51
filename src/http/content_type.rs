use std::collections::HashMap;

#[rustfmt::skip]
const SUFFIXES: [(&str, &str); 12] = [
    (".html", "text/html"),
    (".htm",  "text/html"),
    (".css",  "text/css"),
    (".js",   "application/x-javascript"),
    (".json", "application/json"),
    (".jpeg", "image/jpeg"),
    (".png",  "application/x-png"),
    (".ico",  "image/x-icon"),
    (".tif",  "image/tiff"),
    (".xml",  "text/xml"),
    (".xsl",  "text/xml"),
    (".txt",  "text/plain"),
];

/// Maps a file suffix (dot included) to the `Content-Type` value sent with it.
#[derive(Debug, Clone)]
pub(crate) struct ContentTypes {
    types: HashMap<&'static str, Box<str>>,
    default_type: Option<Box<str>>,
}

impl ContentTypes {
    /// Builds the table, appending `; charset=..` to `text/*` types when
    /// `charset` is non-empty. A non-empty `default_type` answers unknown
    /// suffixes.
    pub(crate) fn new(charset: &str, default_type: &str) -> Self {
        let types = SUFFIXES
            .iter()
            .map(|&(suffix, mime)| {
                let value = if !charset.is_empty() && mime.starts_with("text/") {
                    format!("{mime}; charset={charset}")
                } else {
                    mime.to_owned()
                };

                (suffix, value.into_boxed_str())
            })
            .collect();

        let default_type = (!default_type.is_empty()).then(|| default_type.into());

        Self {
            types,
            default_type,
        }
    }

    #[inline]
    pub(crate) fn get(&self, suffix: &str) -> Option<&str> {
        self.types
            .get(suffix)
            .or(self.default_type.as_ref())
            .map(|value| &**value)
    }
}

impl Default for ContentTypes {
    fn default() -> Self {
        Self::new("", "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_table() {
        let types = ContentTypes::default();

        #[rustfmt::skip]
        let cases = [
            (".html",  Some("text/html")),
            (".htm",   Some("text/html")),
            (".js",    Some("application/x-javascript")),
            (".png",   Some("application/x-png")),
            (".txt",   Some("text/plain")),
            (".HTML",  None),
            (".php",   None),
            ("",       None),
        ];

        for (suffix, expected) in cases {
            assert_eq!(types.get(suffix), expected, "{suffix:?}");
        }
    }

    #[test]
    fn charset_and_default() {
        let types = ContentTypes::new("utf-8", "application/octet-stream");

        #[rustfmt::skip]
        let cases = [
            (".html", "text/html; charset=utf-8"),
            (".xml",  "text/xml; charset=utf-8"),
            (".json", "application/json"),
            (".bin",  "application/octet-stream"),
        ];

        for (suffix, expected) in cases {
            assert_eq!(types.get(suffix), Some(expected), "{suffix:?}");
        }
    }
}
