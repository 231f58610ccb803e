use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::evaluate::{EvaluationContext, Value};
use crate::expression::parse_expression;
use crate::{distinct_by_id, EvaluationError, FilterError, Widget};

/// Characters a `safest` filter fragment may contain: letters, digits, dot and whitespace.
pub const FILTER_ALLOW_LIST_PATTERN: &str = r"^[A-Za-z0-9.\s]+$";

/// A price bound is an optionally negative decimal.
///
/// Exponents and named values such as `NaN` are rejected.
pub const PLAIN_NUMBER_PATTERN: &str = r"^-?[0-9]+(\.[0-9]+)?$";

/// Wrap an untrusted fragment into the selection query evaluated against the candidates.
#[must_use]
pub fn compose_selection_query(fragment: &str) -> String {
    format!("#this.?[enabled and ({fragment})]")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FilterPolicy {
    Unsafe,
    Safer,
    Safest,
}

impl FilterPolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unsafe => "unsafe",
            Self::Safer => "safer",
            Self::Safest => "safest",
        }
    }

    /// Only `unsafe` receives the unrestricted context.
    #[must_use]
    pub fn evaluation_context(self) -> EvaluationContext {
        match self {
            Self::Unsafe => EvaluationContext::unrestricted(),
            Self::Safer | Self::Safest => EvaluationContext::read_only(),
        }
    }

    #[must_use]
    pub fn checks_allow_list(self) -> bool {
        matches!(self, Self::Safest)
    }
}

/// Inclusive price bounds for the parameterized search. No expression text is involved.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PriceRange {
    pub min: f64,
    pub max: f64,
}

impl PriceRange {
    #[must_use]
    pub fn contains(&self, price: f64) -> bool {
        self.min <= price && price <= self.max
    }

    /// Enabled candidates priced within the range, in candidate order.
    #[must_use]
    pub fn apply(&self, candidates: &[Widget]) -> Vec<Widget> {
        distinct_by_id(
            candidates
                .iter()
                .filter(|widget| widget.enabled && self.contains(widget.price))
                .cloned(),
        )
    }
}

/// Applies the filter policies to candidate widgets.
///
/// Holds only compiled patterns, so one instance is built at startup and shared.
#[derive(Debug, Clone)]
pub struct WidgetFilter {
    allow_list: Regex,
    plain_number: Regex,
}

impl WidgetFilter {
    /// # Errors
    /// Returns an error if one of the built-in patterns fails to compile.
    pub fn new() -> Result<Self, regex_lite::Error> {
        Ok(Self {
            allow_list: Regex::new(FILTER_ALLOW_LIST_PATTERN)?,
            plain_number: Regex::new(PLAIN_NUMBER_PATTERN)?,
        })
    }

    /// Reject any fragment containing a character outside the allow-list.
    ///
    /// # Errors
    /// Returns [`FilterError::Validation`] when the fragment is empty or has a disallowed
    /// character.
    pub fn check_allow_list(&self, fragment: &str) -> Result<(), FilterError> {
        if self.allow_list.is_match(fragment) {
            Ok(())
        } else {
            Err(FilterError::Validation("filter contains invalid characters".to_string()))
        }
    }

    /// Run `fragment` through `policy` against `candidates`.
    ///
    /// # Errors
    /// Returns [`FilterError::Validation`] when the `safest` allow-list rejects the fragment
    /// (evaluation is never attempted), and [`FilterError::Evaluation`] for parse failures,
    /// denied capabilities, runtime errors, or a query that does not yield widgets.
    pub fn apply(
        &self,
        policy: FilterPolicy,
        candidates: &[Widget],
        fragment: &str,
    ) -> Result<Vec<Widget>, FilterError> {
        if policy.checks_allow_list() {
            self.check_allow_list(fragment)?;
        }

        let expression = parse_expression(&compose_selection_query(fragment))?;
        let root = Value::widgets(candidates);
        let result = policy.evaluation_context().evaluate(&expression, &root)?;
        Ok(collect_widgets(result)?)
    }

    /// Validate both bounds independently as plain decimal numbers.
    ///
    /// # Errors
    /// Returns [`FilterError::Validation`] naming the first bound that is not a plain number.
    pub fn price_range(&self, min: &str, max: &str) -> Result<PriceRange, FilterError> {
        let min = self.plain_number(min, "min-price")?;
        let max = self.plain_number(max, "max-price")?;
        Ok(PriceRange { min, max })
    }

    fn plain_number(&self, raw: &str, field: &str) -> Result<f64, FilterError> {
        let invalid = || FilterError::Validation(format!("{field} must be a plain number"));
        if !self.plain_number.is_match(raw) {
            return Err(invalid());
        }
        raw.parse::<f64>().ok().filter(|value| value.is_finite()).ok_or_else(invalid)
    }
}

fn collect_widgets(result: Value) -> Result<Vec<Widget>, EvaluationError> {
    let items = match result {
        Value::List(items) => items,
        other => return Err(EvaluationError::UnexpectedResult(other.type_name())),
    };
    let widgets = items
        .into_iter()
        .map(|item| match item {
            Value::Widget(widget) => Ok(widget),
            other => Err(EvaluationError::UnexpectedResult(other.type_name())),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(distinct_by_id(widgets))
}
