//! View Query Paths
//!
//! A view query is addressed by an HTTP-style path:
//!
//! ```text
//! [/<bucket>]/_design/<ddoc>/_view/<view>[?<query>]
//! [/<bucket>]/_all_docs[?<query>]
//! ```

/// A parsed view query path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewPath {
    /// Bucket segment, when the path is bucket-qualified
    pub bucket: Option<String>,
    /// Design document name; `None` for `_all_docs`
    pub design: Option<String>,
    pub view: String,
    /// Query parameters in order of appearance
    pub query: Vec<(String, String)>,
}

impl ViewPath {
    /// Name of the built-in view listing every document.
    pub const ALL_DOCS: &'static str = "_all_docs";

    /// Parses a view path, returning `None` when it addresses no view.
    ///
    /// # Example
    ///
    /// ```
    /// use couchlink::transport::ViewPath;
    ///
    /// let path = ViewPath::parse("/bucket/_design/x/_view/y?limit=10").unwrap();
    /// assert_eq!(path.name(), "x/y");
    /// assert_eq!(path.param("limit"), Some("10"));
    /// ```
    pub fn parse(path: &str) -> Option<ViewPath> {
        let (path, query) = match path.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (path, None),
        };

        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let (bucket, rest) = match segments.split_first() {
            Some((first, rest)) if !first.starts_with('_') => (Some(first.to_string()), rest),
            _ => (None, segments.as_slice()),
        };

        let (design, view) = match rest {
            [view] if *view == Self::ALL_DOCS => (None, view.to_string()),
            ["_design", design, "_view", view] => (Some(design.to_string()), view.to_string()),
            _ => return None,
        };

        Some(ViewPath {
            bucket,
            design,
            view,
            query: query.map(parse_query).unwrap_or_default(),
        })
    }

    /// `ddoc/view`, or `_all_docs`.
    pub fn name(&self) -> String {
        match &self.design {
            Some(design) => format!("{}/{}", design, self.view),
            None => self.view.clone(),
        }
    }

    /// Last value given for a query parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .rev()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (decode_component(key), decode_component(value)),
            None => (decode_component(pair), String::new()),
        })
        .collect()
}

/// Form-decodes one query component: `+` is a space, `%XX` a byte.
/// A malformed escape is kept as written.
fn decode_component(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' => match (bytes.get(i + 1).and_then(hex), bytes.get(i + 2).and_then(hex)) {
                (Some(high), Some(low)) => {
                    out.push(high << 4 | low);
                    i += 2;
                }
                _ => out.push(b'%'),
            },
            byte => out.push(byte),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex(byte: &u8) -> Option<u8> {
    (*byte as char).to_digit(16).map(|digit| digit as u8)
}
