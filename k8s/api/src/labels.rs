use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

/// An immutable, cheaply-clonable view of a pod's labels.
#[derive(Clone, Debug, Default)]
pub struct Labels(Arc<Map>);

pub type Map = BTreeMap<String, String>;

/// Selects a set of pods protected by a `PodProtector`. The result of
/// `match_labels` and `match_expressions` are ANDed.
#[derive(Clone, Debug, Eq, PartialEq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    match_labels: Option<Map>,
    match_expressions: Option<Vec<Expression>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct Expression {
    pub key: String,
    pub operator: Operator,
    pub values: Option<BTreeSet<String>>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// A selector that deserialized structurally but cannot be evaluated.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InvalidSelector {
    #[error("operator {operator:?} on key {key:?} requires a non-empty value set")]
    MissingValues { key: String, operator: Operator },

    #[error("operator {operator:?} on key {key:?} does not accept values")]
    UnexpectedValues { key: String, operator: Operator },
}

// === Selector ===

impl Selector {
    pub fn new(match_labels: Map, match_expressions: Vec<Expression>) -> Self {
        Self {
            match_labels: Some(match_labels),
            match_expressions: Some(match_expressions),
        }
    }

    pub fn from_map(map: Map) -> Self {
        Self {
            match_labels: Some(map),
            match_expressions: None,
        }
    }

    pub fn from_expressions(exprs: Vec<Expression>) -> Self {
        Self {
            match_labels: None,
            match_expressions: Some(exprs),
        }
    }

    /// Checks that every expression carries the value set its operator
    /// demands. A selector must be validated once before it is tracked;
    /// `matches` treats ill-formed expressions as non-matching.
    pub fn validate(&self) -> Result<(), InvalidSelector> {
        for expr in self.match_expressions.iter().flatten() {
            let has_values = expr.values.as_ref().is_some_and(|vs| !vs.is_empty());
            match expr.operator {
                Operator::In | Operator::NotIn if !has_values => {
                    return Err(InvalidSelector::MissingValues {
                        key: expr.key.clone(),
                        operator: expr.operator,
                    });
                }
                Operator::Exists | Operator::DoesNotExist if expr.values.is_some() => {
                    return Err(InvalidSelector::UnexpectedValues {
                        key: expr.key.clone(),
                        operator: expr.operator,
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Iterates over the equality requirements (`k=v` pairs) of this selector.
    /// These are the requirements an inverted index can key on.
    pub fn exact_matches(&self) -> impl Iterator<Item = (&str, &str)> {
        self.match_labels
            .iter()
            .flatten()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Indicates whether this selector has no requirements at all, i.e.
    /// matches every pod including pods with no labels.
    pub fn is_empty(&self) -> bool {
        self.match_labels.as_ref().is_none_or(|l| l.is_empty())
            && self.match_expressions.as_ref().is_none_or(|e| e.is_empty())
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        if let Some(match_labels) = self.match_labels.as_ref() {
            for (k, v) in match_labels {
                if labels.0.get(k) != Some(v) {
                    return false;
                }
            }
        }

        self.match_expressions
            .iter()
            .flatten()
            .all(|expr| expr.matches(labels.as_ref()))
    }
}

impl std::iter::FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        Self::from_map(
            iter.into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

impl std::iter::FromIterator<Expression> for Selector {
    fn from_iter<T: IntoIterator<Item = Expression>>(iter: T) -> Self {
        Self::from_expressions(iter.into_iter().collect())
    }
}

// === Expression ===

impl Expression {
    pub fn new(key: impl Into<String>, operator: Operator, values: &[&str]) -> Self {
        Self {
            key: key.into(),
            operator,
            values: if values.is_empty() {
                None
            } else {
                Some(values.iter().map(|v| v.to_string()).collect())
            },
        }
    }

    fn matches(&self, labels: &Map) -> bool {
        match (self.operator, self.values.as_ref()) {
            (Operator::In, Some(values)) => {
                labels.get(&self.key).is_some_and(|v| values.contains(v))
            }
            (Operator::NotIn, Some(values)) => {
                labels.get(&self.key).is_none_or(|v| !values.contains(v))
            }
            (Operator::Exists, None) => labels.contains_key(&self.key),
            (Operator::DoesNotExist, None) => !labels.contains_key(&self.key),
            (operator, values) => {
                tracing::warn!(?operator, key = %self.key, ?values, "illegal match expression");
                false
            }
        }
    }
}

// === Labels ===

impl From<Option<Map>> for Labels {
    #[inline]
    fn from(labels: Option<Map>) -> Self {
        labels.unwrap_or_default().into()
    }
}

impl From<Map> for Labels {
    #[inline]
    fn from(labels: Map) -> Self {
        Self(Arc::new(labels))
    }
}

impl AsRef<Map> for Labels {
    #[inline]
    fn as_ref(&self) -> &Map {
        self.0.as_ref()
    }
}

impl std::cmp::PartialEq<Self> for Labels {
    #[inline]
    fn eq(&self, t: &Self) -> bool {
        self.0.as_ref().eq(t.as_ref())
    }
}

impl std::iter::FromIterator<(String, String)> for Labels {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(Arc::new(iter.into_iter().collect()))
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Labels {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::iter::FromIterator;

    #[test]
    fn matches() {
        for (selector, labels, expected, msg) in &[
            (
                Selector::default(),
                Labels::default(),
                true,
                "empty selector matches unlabeled pod",
            ),
            (
                Selector::from_iter(Some(("app", "store"))),
                Labels::default(),
                false,
                "unlabeled pod only matches empty selector",
            ),
            (
                Selector::from_iter(Some(("app", "store"))),
                Labels::from_iter(vec![("app", "store"), ("tier", "cache")]),
                true,
                "subset equality match",
            ),
            (
                Selector::from_iter(Some(("app", "store"))),
                Labels::from_iter(Some(("app", "web"))),
                false,
                "equality mismatch",
            ),
            (
                Selector::from_iter(Some(Expression::new("tier", Operator::In, &["cache", "db"]))),
                Labels::from_iter(Some(("tier", "cache"))),
                true,
                "In match",
            ),
            (
                Selector::from_iter(Some(Expression::new("tier", Operator::NotIn, &["db"]))),
                Labels::from_iter(Some(("tier", "cache"))),
                true,
                "NotIn match",
            ),
            (
                Selector::from_iter(Some(Expression::new("tier", Operator::NotIn, &["db"]))),
                Labels::default(),
                true,
                "NotIn matches absent key",
            ),
            (
                Selector::from_iter(Some(Expression::new("tier", Operator::Exists, &[]))),
                Labels::from_iter(Some(("tier", "cache"))),
                true,
                "Exists match",
            ),
            (
                Selector::from_iter(Some(Expression::new("tier", Operator::DoesNotExist, &[]))),
                Labels::from_iter(Some(("tier", "cache"))),
                false,
                "DoesNotExist non-match",
            ),
            (
                Selector {
                    match_labels: Some(Map::from([("app".to_string(), "store".to_string())])),
                    match_expressions: Some(vec![Expression::new(
                        "tier",
                        Operator::In,
                        &["cache"],
                    )]),
                },
                Labels::from_iter(vec![("app", "store"), ("tier", "db")]),
                false,
                "labels match but expressions do not",
            ),
        ] {
            assert_eq!(selector.matches(labels), *expected, "{}", msg);
        }
    }

    #[test]
    fn validate() {
        assert!(Selector::default().validate().is_ok());
        assert!(Selector::from_iter(Some(("app", "store"))).validate().is_ok());

        let missing = Selector::from_iter(Some(Expression {
            key: "tier".into(),
            operator: Operator::In,
            values: None,
        }));
        assert_eq!(
            missing.validate(),
            Err(InvalidSelector::MissingValues {
                key: "tier".into(),
                operator: Operator::In,
            }),
        );

        let unexpected = Selector::from_iter(Some(Expression::new(
            "tier",
            Operator::Exists,
            &["cache"],
        )));
        assert!(matches!(
            unexpected.validate(),
            Err(InvalidSelector::UnexpectedValues { .. })
        ));
    }

    #[test]
    fn exact_matches_are_equality_requirements_only() {
        let selector = Selector {
            match_labels: Some(Map::from([("app".to_string(), "store".to_string())])),
            match_expressions: Some(vec![Expression::new("tier", Operator::Exists, &[])]),
        };
        let exact: Vec<_> = selector.exact_matches().collect();
        assert_eq!(exact, vec![("app", "store")]);
    }
}
