use crate::parameters::{ParameterPosition, ParameterSet};
use crate::uri::UriEncodingStrategy;

#[derive(Debug, Clone, PartialEq)]
pub struct PathSegment {
    name: Option<String>,
    parameters: Option<ParameterSet>,
}

impl PathSegment {
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn parameters(&self) -> Option<&ParameterSet> {
        self.parameters.as_ref()
    }

    fn encode(&self, strategy: UriEncodingStrategy) -> String {
        let mut encoded = self
            .name
            .as_deref()
            .map(|name| strategy.escape_path_segment(name))
            .unwrap_or_default();
        if let Some(parameters) = &self.parameters {
            encoded.push_str(&parameters.render(strategy, ParameterPosition::Path));
        }
        encoded
    }
}

/// Unencoded path of a resource below the service path, e.g. `People('Fridolin')/Trips`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResourcePath {
    segments: Vec<PathSegment>,
}

impl ResourcePath {
    pub fn new() -> Self {
        Self::default()
    }

    /// Path with a single segment named `name`. The name is taken literally; a `/` inside it is
    /// escaped on encoding.
    pub fn of(name: impl Into<String>) -> Self {
        Self::new().segment(name)
    }

    /// Path addressing one entity of `entity_set` by `key`.
    pub fn of_key(entity_set: impl Into<String>, key: ParameterSet) -> Self {
        Self::of(entity_set).with_parameters(key)
    }

    /// Append a named segment.
    #[must_use]
    pub fn segment(mut self, name: impl Into<String>) -> Self {
        self.segments.push(PathSegment {
            name: Some(name.into()),
            parameters: None,
        });
        self
    }

    /// Append a segment made only of parameters.
    #[must_use]
    pub fn parameter_segment(mut self, parameters: ParameterSet) -> Self {
        self.segments.push(PathSegment {
            name: None,
            parameters: Some(parameters),
        });
        self
    }

    /// Attach `parameters` to the last segment, replacing any it had. An empty path gains a
    /// parameter-only segment.
    #[must_use]
    pub fn with_parameters(mut self, parameters: ParameterSet) -> Self {
        if self.segments.is_empty() {
            return self.parameter_segment(parameters);
        }
        if let Some(last) = self.segments.last_mut() {
            last.parameters = Some(parameters);
        }
        self
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Encoded path with each segment prefixed by `/`. Empty for an empty path.
    pub fn to_encoded_path(&self, strategy: UriEncodingStrategy) -> String {
        self.segments
            .iter()
            .map(|segment| format!("/{}", segment.encode(strategy)))
            .collect()
    }
}

/// Splits on `/`, one segment per non-empty part.
impl From<&str> for ResourcePath {
    fn from(path: &str) -> Self {
        path.split('/')
            .filter(|segment| !segment.is_empty())
            .fold(Self::new(), |path, segment| path.segment(segment))
    }
}

impl From<String> for ResourcePath {
    fn from(path: String) -> Self {
        Self::from(path.as_str())
    }
}
