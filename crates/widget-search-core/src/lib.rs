use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

mod evaluate;
mod expression;
mod policy;

pub use evaluate::{Capability, CapabilitySet, EvaluationContext, HostType, HostValue, Value};
pub use expression::{
    parse_expression, BinaryOp, CollectionOp, Expression, Literal, UnaryOp, MAX_NESTING_DEPTH,
};
pub use policy::{
    compose_selection_query, FilterPolicy, PriceRange, WidgetFilter, FILTER_ALLOW_LIST_PATTERN,
    PLAIN_NUMBER_PATTERN,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum WidgetError {
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum EvaluationError {
    #[error("parse error at position {position}: {message}")]
    Parse { position: usize, message: String },
    #[error("capability `{}` is not granted by this evaluation context", .0.as_str())]
    CapabilityDenied(Capability),
    #[error("property `{property}` cannot be found on {target}")]
    UnknownProperty { property: String, target: &'static str },
    #[error("method `{method}` with {arity} argument(s) cannot be found on {target}")]
    UnknownMethod { method: String, arity: usize, target: &'static str },
    #[error("type `{0}` cannot be resolved")]
    UnknownType(String),
    #[error("variable `#{0}` is not defined")]
    UnknownVariable(String),
    #[error("operator `{operator}` cannot be applied to {found}")]
    TypeMismatch { operator: &'static str, found: String },
    #[error("`{0}` was dereferenced on null")]
    NullTarget(String),
    #[error("arithmetic error: {0}")]
    Arithmetic(String),
    #[error("index {index} is out of bounds for a collection of {len}")]
    IndexOutOfBounds { index: i64, len: usize },
    #[error("host call failed: {0}")]
    HostCall(String),
    #[error("expected a collection of widgets but the query produced {0}")]
    UnexpectedResult(&'static str),
}

/// Failure of a filtered search. Both kinds are reported to callers as the same client error.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum FilterError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),
}

impl FilterError {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Evaluation(_) => "evaluation",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct WidgetId(pub i64);

impl Display for WidgetId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Widget {
    pub id: WidgetId,
    pub name: String,
    pub price: f64,
    pub enabled: bool,
}

/// A widget that has not been assigned an identity by the repository yet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewWidget {
    pub name: String,
    pub price: f64,
    pub enabled: bool,
}

impl NewWidget {
    /// Check the fields a repository must never store.
    ///
    /// # Errors
    /// Returns [`WidgetError::Validation`] for a blank name or a negative / non-finite price.
    pub fn validate(&self) -> Result<(), WidgetError> {
        if self.name.trim().is_empty() {
            return Err(WidgetError::Validation("name must not be empty".to_string()));
        }
        if !self.price.is_finite() || self.price < 0.0 {
            return Err(WidgetError::Validation(format!(
                "price must be a finite, non-negative number (got {})",
                self.price
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn with_id(self, id: WidgetId) -> Widget {
        Widget { id, name: self.name, price: self.price, enabled: self.enabled }
    }
}

/// Keep the first occurrence of every widget identity, preserving input order.
#[must_use]
pub fn distinct_by_id<I>(widgets: I) -> Vec<Widget>
where
    I: IntoIterator<Item = Widget>,
{
    let mut seen = BTreeSet::new();
    widgets.into_iter().filter(|widget| seen.insert(widget.id)).collect()
}

/// The demo catalogue seeded into fresh databases.
#[must_use]
pub fn fixture_catalogue() -> Vec<NewWidget> {
    [
        ("Blue Widget", 9.99, true),
        ("Red Widget", 14.5, true),
        ("Green Widget", 24.0, false),
        ("Widget Deluxe", 49.95, true),
        ("Gadget", 7.25, true),
    ]
    .into_iter()
    .map(|(name, price, enabled)| NewWidget { name: name.to_string(), price, enabled })
    .collect()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub(crate) fn fixture_widgets() -> Vec<Widget> {
        fixture_catalogue()
            .into_iter()
            .zip(1_i64..)
            .map(|(widget, id)| widget.with_id(WidgetId(id)))
            .collect()
    }

    pub(crate) fn matching(widgets: &[Widget], term: &str) -> Vec<Widget> {
        widgets.iter().filter(|widget| widget.name.contains(term)).cloned().collect()
    }

    pub(crate) fn ids(widgets: &[Widget]) -> Vec<i64> {
        widgets.iter().map(|widget| widget.id.0).collect()
    }
}
