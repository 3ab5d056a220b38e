use tracing::warn;

use crate::error::ODataError;
use crate::literal::ODataLiteral;
use crate::protocol::ODataProtocol;
use crate::uri::UriEncodingStrategy;

/// How a [`ParameterSet`] spells its entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterStyle {
    /// Entity keys: a single entry is rendered without its name, `Entity('k')`.
    EntityKey,
    /// Function parameters: entries are always named, `Fn(really=true)`.
    FunctionParameters,
}

/// Where a rendered [`ParameterSet`] is placed in the URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterPosition {
    /// Attached to a path segment, wrapped in parentheses and joined with `,`.
    Path,
    /// Rendered as query options joined with `&`.
    Query,
}

/// Ordered name to literal mapping for entity keys and function parameters. Names are unique.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSet {
    protocol: ODataProtocol,
    style: ParameterStyle,
    entries: Vec<(String, ODataLiteral)>,
}

impl ParameterSet {
    pub fn new(protocol: ODataProtocol, style: ParameterStyle) -> Self {
        Self {
            protocol,
            style,
            entries: Vec::new(),
        }
    }

    pub fn entity_key(protocol: ODataProtocol) -> Self {
        Self::new(protocol, ParameterStyle::EntityKey)
    }

    pub fn function_parameters(protocol: ODataProtocol) -> Self {
        Self::new(protocol, ParameterStyle::FunctionParameters)
    }

    /// Add an entry. Fails, leaving the set untouched, when `name` is already present.
    pub fn add(
        &mut self,
        name: impl Into<String>,
        value: impl Into<ODataLiteral>,
    ) -> Result<&mut Self, ODataError> {
        let name = name.into();
        if self.contains(&name) {
            return Err(ODataError::request_construction(format!(
                "parameter '{name}' is already present and cannot be added twice"
            )));
        }
        self.entries.push((name, value.into()));
        Ok(self)
    }

    /// Owned variant of [`ParameterSet::add`] for building sets inline.
    pub fn with(
        mut self,
        name: impl Into<String>,
        value: impl Into<ODataLiteral>,
    ) -> Result<Self, ODataError> {
        self.add(name, value)?;
        Ok(self)
    }

    pub fn protocol(&self) -> ODataProtocol {
        self.protocol
    }

    pub fn style(&self) -> ParameterStyle {
        self.style
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(existing, _)| existing == name)
    }

    pub fn get(&self, name: &str) -> Option<&ODataLiteral> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ODataLiteral)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value))
    }

    /// Render the set for the given position, escaping names and values with `strategy`.
    ///
    /// Delimiters are inserted unescaped. An empty entity key renders as `()` and logs a
    /// warning, since no service accepts it.
    pub fn render(&self, strategy: UriEncodingStrategy, position: ParameterPosition) -> String {
        let escape = |raw: &str| match position {
            ParameterPosition::Path => strategy.escape_path_segment(raw),
            ParameterPosition::Query => strategy.escape_query(raw),
        };

        if self.entries.is_empty() && self.style == ParameterStyle::EntityKey {
            warn!(
                "rendering an empty entity key; \
                 the resulting request will not address an entity"
            );
        }

        let omit_name = self.style == ParameterStyle::EntityKey && self.entries.len() == 1;
        let rendered: Vec<String> = self
            .entries
            .iter()
            .map(|(name, value)| {
                let value = escape(&value.render(self.protocol));
                if omit_name {
                    value
                } else {
                    format!("{}={value}", escape(name))
                }
            })
            .collect();

        match position {
            ParameterPosition::Path => format!("({})", rendered.join(",")),
            ParameterPosition::Query => rendered.join("&"),
        }
    }
}
