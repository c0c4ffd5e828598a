//! # Routing Attribute Expressions
//!
//! Skill eligibility for a step is described by expressions over the routing
//! attributes an agent carries. An attribute is either a boolean flag
//! ("sales", "spanish") or an integer proficiency ("billing = 7").
//!
//! ## Evaluation rules
//!
//! - Terms are combined strictly left to right using each term's
//!   *preceding* join. `a OR b AND c` is `(a OR b) AND c`; there is no
//!   operator precedence.
//! - The first term's join is ignored; an unspecified join is AND.
//! - An agent without a value for the referenced attribute fails that term.
//!   Comparing a boolean with an integer also fails the term.
//! - Expressions of a step are combined the same way, each expression
//!   carrying the join that links it to the previous one.
//! - An empty expression list matches every agent.
//!
//! Evaluation is a pure function of the attribute map and the expression, so
//! it can run concurrently from any number of threads without locking.
//!
//! ```
//! use std::collections::HashMap;
//! use rvoip_routing_engine::expression::{
//!     matches, AttributeSet, AttributeValue, BooleanJoin, Expression, RelationalOperator, Term,
//! };
//!
//! let mut attributes: AttributeSet = HashMap::new();
//! attributes.insert("sales".into(), AttributeValue::Bool(true));
//! attributes.insert("english".into(), AttributeValue::Int(8));
//!
//! let expression = Expression::new(vec![
//!     Term::new("sales", RelationalOperator::Eq, AttributeValue::Bool(true)),
//!     Term::new("english", RelationalOperator::Ge, AttributeValue::Int(5))
//!         .with_join(BooleanJoin::And),
//! ]);
//!
//! assert!(matches(&attributes, &expression));
//! ```

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RoutingError};

/// Identifier of a routing attribute ("sales", "spanish", "billing")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttributeId(pub String);

impl From<&str> for AttributeId {
    fn from(s: &str) -> Self {
        AttributeId(s.to_string())
    }
}

impl From<String> for AttributeId {
    fn from(s: String) -> Self {
        AttributeId(s)
    }
}

impl fmt::Display for AttributeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Value of a routing attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeValue {
    /// Flag attribute
    Bool(bool),
    /// Proficiency attribute
    Int(i64),
}

/// An agent's routing attribute values keyed by attribute id
pub type AttributeSet = HashMap<AttributeId, AttributeValue>;

/// Relational operator of a term
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationalOperator {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
}

/// Boolean join linking a term (or expression) to the one before it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BooleanJoin {
    #[default]
    And,
    Or,
}

impl BooleanJoin {
    fn combine(self, left: bool, right: bool) -> bool {
        match self {
            BooleanJoin::And => left && right,
            BooleanJoin::Or => left || right,
        }
    }
}

/// A single attribute comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Term {
    pub attribute_id: AttributeId,
    pub operator: RelationalOperator,
    pub value: AttributeValue,
    /// Join with the preceding term; `None` means AND
    #[serde(default)]
    pub join: Option<BooleanJoin>,
}

impl Term {
    pub fn new(
        attribute_id: impl Into<AttributeId>,
        operator: RelationalOperator,
        value: AttributeValue,
    ) -> Self {
        Self {
            attribute_id: attribute_id.into(),
            operator,
            value,
            join: None,
        }
    }

    pub fn with_join(mut self, join: BooleanJoin) -> Self {
        self.join = Some(join);
        self
    }

    /// Evaluate this term against an agent's attributes
    pub fn evaluate(&self, attributes: &AttributeSet) -> bool {
        let Some(actual) = attributes.get(&self.attribute_id) else {
            return false;
        };
        compare(*actual, self.operator, self.value)
    }
}

fn compare(actual: AttributeValue, operator: RelationalOperator, expected: AttributeValue) -> bool {
    use RelationalOperator::*;

    match (actual, expected) {
        (AttributeValue::Int(a), AttributeValue::Int(b)) => match operator {
            Eq => a == b,
            Ne => a != b,
            Gt => a > b,
            Ge => a >= b,
            Lt => a < b,
            Le => a <= b,
        },
        (AttributeValue::Bool(a), AttributeValue::Bool(b)) => match operator {
            Eq => a == b,
            Ne => a != b,
            // ordering is meaningless for flags
            Gt | Ge | Lt | Le => false,
        },
        _ => false,
    }
}

/// Ordered sequence of terms combined left to right
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Expression {
    pub terms: Vec<Term>,
    /// Join with the preceding expression of the same step; `None` means AND
    #[serde(default)]
    pub join: Option<BooleanJoin>,
}

impl Expression {
    pub fn new(terms: Vec<Term>) -> Self {
        Self { terms, join: None }
    }

    pub fn with_join(mut self, join: BooleanJoin) -> Self {
        self.join = Some(join);
        self
    }

    /// Structural validation of attribute references
    pub fn validate(&self) -> Result<()> {
        for (position, term) in self.terms.iter().enumerate() {
            if term.attribute_id.0.trim().is_empty() {
                return Err(RoutingError::configuration(format!(
                    "term {} references an empty attribute id",
                    position
                )));
            }
        }
        Ok(())
    }

    /// Attribute ids referenced by this expression
    pub fn attribute_ids(&self) -> impl Iterator<Item = &AttributeId> {
        self.terms.iter().map(|t| &t.attribute_id)
    }
}

/// Evaluate `expression` against an agent's attribute values
pub fn matches(attributes: &AttributeSet, expression: &Expression) -> bool {
    fold_left(
        expression
            .terms
            .iter()
            .map(|term| (term.join, term.evaluate(attributes))),
    )
}

/// Evaluate every expression of a step, combining them left to right
pub fn matches_all(attributes: &AttributeSet, expressions: &[Expression]) -> bool {
    fold_left(
        expressions
            .iter()
            .map(|expression| (expression.join, matches(attributes, expression))),
    )
}

fn fold_left(mut results: impl Iterator<Item = (Option<BooleanJoin>, bool)>) -> bool {
    let Some((_, mut acc)) = results.next() else {
        return true;
    };
    for (join, value) in results {
        acc = join.unwrap_or_default().combine(acc, value);
    }
    acc
}
