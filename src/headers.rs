pub const HEADER_ACCEPT: &str = "Accept";
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
pub const HEADER_CONTENT_ID: &str = "Content-ID";
pub const HEADER_CONTENT_TRANSFER_ENCODING: &str = "Content-Transfer-Encoding";
pub const HEADER_ODATA_VERSION: &str = "OData-Version";
pub const HEADER_IF_MATCH: &str = "If-Match";
pub const HEADER_ETAG: &str = "ETag";
pub const HEADER_SET_COOKIE: &str = "Set-Cookie";
pub const HEADER_CSRF_TOKEN: &str = "x-csrf-token";

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_HTTP: &str = "application/http";

#[derive(Debug, Clone, PartialEq, Eq)]
struct HeaderEntry {
    name: String,
    values: Vec<String>,
}

/// Ordered, case-insensitive header multimap.
///
/// Names keep the spelling of their first insertion and iterate in insertion order; values of a
/// name keep their own insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<HeaderEntry>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.name.eq_ignore_ascii_case(name))
    }

    /// First value stored for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name).first().map(String::as_str)
    }

    /// All values stored for `name`, in insertion order.
    pub fn get_all(&self, name: &str) -> &[String] {
        self.position(name)
            .map(|index| self.entries[index].values.as_slice())
            .unwrap_or_default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Replace every value of `name` with `value`.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.insert_all(name, [value.into()]);
    }

    /// Replace every value of `name` with `values`.
    pub fn insert_all(
        &mut self,
        name: impl Into<String>,
        values: impl IntoIterator<Item = String>,
    ) {
        let name = name.into();
        let values = values.into_iter().collect();
        match self.position(&name) {
            Some(index) => self.entries[index].values = values,
            None => self.entries.push(HeaderEntry { name, values }),
        }
    }

    /// Add `value` after the existing values of `name`.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.position(&name) {
            Some(index) => self.entries[index].values.push(value),
            None => self.entries.push(HeaderEntry {
                name,
                values: vec![value],
            }),
        }
    }

    /// Add `value` only when `name` carries no value yet. Returns whether it was added.
    pub fn insert_if_absent(&mut self, name: impl Into<String>, value: impl Into<String>) -> bool {
        let name = name.into();
        if self.contains(&name) {
            return false;
        }
        self.append(name, value);
        true
    }

    pub fn remove(&mut self, name: &str) -> Vec<String> {
        match self.position(name) {
            Some(index) => self.entries.remove(index).values,
            None => Vec::new(),
        }
    }

    /// Merge all values of `other` into `self`, appending to existing names.
    pub fn extend(&mut self, other: &HeaderMap) {
        for (name, value) in other.iter() {
            self.append(name, value);
        }
    }

    /// Every `(name, value)` pair, grouped by name in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().flat_map(|entry| {
            entry
                .values
                .iter()
                .map(move |value| (entry.name.as_str(), value.as_str()))
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Individual values of a header whose raw values may hold lists.
    ///
    /// List headers are split on `,`. `Set-Cookie` is the exception: cookie attributes may
    /// contain commas (e.g. `Expires`), so its values are split on `;` instead.
    pub fn split_values(&self, name: &str) -> Vec<String> {
        let separator = if name.eq_ignore_ascii_case(HEADER_SET_COOKIE) {
            ';'
        } else {
            ','
        };
        self.get_all(name)
            .iter()
            .flat_map(|value| value.split(separator))
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_owned)
            .collect()
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for HeaderMap {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        let mut headers = Self::new();
        for (name, value) in iter {
            headers.append(name, value);
        }
        headers
    }
}
