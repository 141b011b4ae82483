use std::{fmt::Display, str::FromStr};

use url::form_urlencoded;

use crate::prelude::*;

/// Single query string parameter.
///
/// The meter APIs rely on value-less parameters like `?inst&tot`, which the usual
/// `key=value` serializers cannot express.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum QueryParam {
    /// Bare parameter without `=`.
    Flag(String),

    /// Regular `name=value` pair.
    Pair(String, String),
}

impl QueryParam {
    pub fn name(&self) -> &str {
        match self {
            Self::Flag(name) | Self::Pair(name, _) => name,
        }
    }

    fn encode(&self) -> Result<String> {
        let name = self.name();
        if name.is_empty() || name.chars().any(char::is_control) {
            return Err(Error::InvalidParameter(name.to_owned()));
        }
        Ok(match self {
            Self::Flag(name) => encode_component(name),
            Self::Pair(name, value) => {
                format!("{}={}", encode_component(name), encode_component(value))
            }
        })
    }
}

/// Ordered list of query parameters.
///
/// The order is preserved on encoding: the device interprets some flag combinations
/// positionally.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[must_use]
pub struct Query(Vec<QueryParam>);

impl Query {
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    pub fn flag(mut self, name: impl Into<String>) -> Self {
        self.0.push(QueryParam::Flag(name.into()));
        self
    }

    pub fn pair(mut self, name: impl Into<String>, value: impl Display) -> Self {
        self.0.push(QueryParam::Pair(name.into(), value.to_string()));
        self
    }

    pub fn push(&mut self, param: QueryParam) {
        self.0.push(param);
    }

    #[must_use]
    pub fn params(&self) -> &[QueryParam] {
        &self.0
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Encode the parameters without the leading `?`.
    pub fn encode(&self) -> Result<String> {
        Ok(self.0.iter().map(QueryParam::encode).collect::<Result<Vec<_>>>()?.join("&"))
    }
}

impl FromIterator<QueryParam> for Query {
    fn from_iter<T: IntoIterator<Item = QueryParam>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl FromStr for Query {
    type Err = Error;

    /// Parse an encoded query string, with or without the leading `?`.
    fn from_str(query: &str) -> Result<Self> {
        query
            .trim_start_matches('?')
            .split('&')
            .filter(|chunk| !chunk.is_empty())
            .map(|chunk| {
                let (name, value) = form_urlencoded::parse(chunk.as_bytes())
                    .next()
                    .ok_or_else(|| Error::InvalidParameter(chunk.to_owned()))?;
                Ok(if chunk.contains('=') {
                    QueryParam::Pair(name.into_owned(), value.into_owned())
                } else {
                    QueryParam::Flag(name.into_owned())
                })
            })
            .collect()
    }
}

/// Percent-encode the component, spaces become `%20` rather than `+`.
fn encode_component(component: &str) -> String {
    // `byte_serialize` escapes literal pluses, so every remaining `+` is a space.
    form_urlencoded::byte_serialize(component.as_bytes()).collect::<String>().replace('+', "%20")
}
