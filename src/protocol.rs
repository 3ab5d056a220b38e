use std::fmt;

/// JSON path into a response payload. Each entry is a list of alternative field names; the first
/// name that is present at a level wins.
pub type JsonPath = &'static [&'static [&'static str]];

const V2_RESULT_SET: JsonPath = &[&["d"], &["results"]];
const V2_SINGLE: JsonPath = &[&["d"]];
const V2_INLINE_COUNT: JsonPath = &[&["d"], &["__count"]];
const V2_NEXT_LINK: JsonPath = &[&["d"], &["__next"]];

const V4_RESULT_SET: JsonPath = &[&["value"]];
const V4_SINGLE: JsonPath = &[];
const V4_PRIMITIVE: JsonPath = &[&["value"]];
const V4_INLINE_COUNT: JsonPath = &[&["@odata.count", "@count"]];
const V4_NEXT_LINK: JsonPath = &[&["@odata.nextLink", "@nextLink"]];
const V4_DELTA_LINK: JsonPath = &[&["@odata.deltaLink", "@deltaLink"]];

/// OData protocol version a request is built and decoded for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ODataProtocol {
    V2,
    V4,
}

impl ODataProtocol {
    /// Value sent in the `OData-Version` header.
    pub fn version(self) -> &'static str {
        match self {
            Self::V2 => "2.0",
            Self::V4 => "4.0",
        }
    }

    /// Location of the entity collection inside a collection response.
    pub fn result_set_path(self) -> JsonPath {
        match self {
            Self::V2 => V2_RESULT_SET,
            Self::V4 => V4_RESULT_SET,
        }
    }

    /// Location of a single entity. V4 entities are the payload root.
    pub fn single_path(self) -> JsonPath {
        match self {
            Self::V2 => V2_SINGLE,
            Self::V4 => V4_SINGLE,
        }
    }

    /// Location of a primitive value.
    ///
    /// V2 wraps primitives in an object with a single, function-named field below `d`, so the
    /// caller descends into `d` and then takes the only field present.
    pub fn primitive_path(self) -> JsonPath {
        match self {
            Self::V2 => V2_SINGLE,
            Self::V4 => V4_PRIMITIVE,
        }
    }

    pub fn inline_count_path(self) -> JsonPath {
        match self {
            Self::V2 => V2_INLINE_COUNT,
            Self::V4 => V4_INLINE_COUNT,
        }
    }

    pub fn next_link_path(self) -> JsonPath {
        match self {
            Self::V2 => V2_NEXT_LINK,
            Self::V4 => V4_NEXT_LINK,
        }
    }

    /// Delta links only exist in V4.
    pub fn delta_link_path(self) -> Option<JsonPath> {
        match self {
            Self::V2 => None,
            Self::V4 => Some(V4_DELTA_LINK),
        }
    }

    /// Query option asking the service to include the total count alongside a page.
    pub fn inline_count_option(self, include: bool) -> (&'static str, &'static str) {
        match (self, include) {
            (Self::V2, true) => ("$inlinecount", "allpages"),
            (Self::V2, false) => ("$inlinecount", "none"),
            (Self::V4, true) => ("$count", "true"),
            (Self::V4, false) => ("$count", "false"),
        }
    }
}

impl fmt::Display for ODataProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OData {}", self.version())
    }
}
