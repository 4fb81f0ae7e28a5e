//! Metadata matchers: the filter language for stream reads.
//!
//! A [`MetadataMatcher`] is a conjunction of [`MetadataMatch`] entries. Each
//! entry targets either a key of the event's metadata blob or one of the
//! built-in [`MessageProperty`] columns. Rendering into backend SQL lives in
//! the backend crate; this module owns the backend-independent validation.

use crate::errors::EventStoreError;
use crate::validation::is_metadata_key;
use serde_json::Value;

/// Which part of a stored event a match targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldDomain {
    /// A key inside the event's metadata blob.
    Metadata,
    /// A built-in message property column.
    MessageProperty,
}

/// Built-in properties every stored event exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageProperty {
    /// Per-stream sequence number (`no`).
    Sequence,
    /// Event identifier.
    EventId,
    /// Event type name.
    EventName,
    /// Creation timestamp.
    CreatedAt,
    /// Owning aggregate type.
    AggregateType,
    /// Owning aggregate identifier.
    AggregateId,
    /// Owning aggregate version.
    AggregateVersion,
}

impl MessageProperty {
    /// Every property, in column order.
    pub const ALL: [Self; 7] = [
        Self::Sequence,
        Self::EventId,
        Self::EventName,
        Self::CreatedAt,
        Self::AggregateType,
        Self::AggregateId,
        Self::AggregateVersion,
    ];

    /// Stored column name.
    pub fn column(self) -> &'static str {
        match self {
            Self::Sequence => "no",
            Self::EventId => "event_id",
            Self::EventName => "event_name",
            Self::CreatedAt => "created_at",
            Self::AggregateType => "aggregate_type",
            Self::AggregateId => "aggregate_id",
            Self::AggregateVersion => "aggregate_version",
        }
    }

    /// Look a property up by its column name.
    pub fn from_field(field: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|property| property.column() == field)
    }
}

/// Comparison applied by a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchOperator {
    /// `=`
    Equals,
    /// `!=`
    NotEquals,
    /// `>`
    GreaterThan,
    /// `>=`
    GreaterThanEquals,
    /// `<`
    LowerThan,
    /// `<=`
    LowerThanEquals,
    /// Membership in a caller-supplied set literal.
    In,
    /// Non-membership in a caller-supplied set literal.
    NotIn,
    /// Regular-expression match.
    Regex,
}

impl MatchOperator {
    /// SQL comparison operator for the ordering and equality operators.
    ///
    /// Returns `None` for the set and regex operators, which need their own
    /// rendering.
    pub fn comparison(self) -> Option<&'static str> {
        match self {
            Self::Equals => Some("="),
            Self::NotEquals => Some("!="),
            Self::GreaterThan => Some(">"),
            Self::GreaterThanEquals => Some(">="),
            Self::LowerThan => Some("<"),
            Self::LowerThanEquals => Some("<="),
            Self::In | Self::NotIn | Self::Regex => None,
        }
    }
}

/// Value a match compares against.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchValue {
    /// Boolean, rendered inline rather than bound.
    Bool(bool),
    /// Integer number.
    Integer(i64),
    /// Floating point number.
    Float(f64),
    /// String; also carries set literals and regular expressions.
    Text(String),
}

impl MatchValue {
    /// JSON form of the value.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Bool(value) => Value::Bool(*value),
            Self::Integer(value) => Value::from(*value),
            Self::Float(value) => Value::from(*value),
            Self::Text(value) => Value::String(value.clone()),
        }
    }
}

impl From<bool> for MatchValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for MatchValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for MatchValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<u32> for MatchValue {
    fn from(value: u32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for MatchValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for MatchValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for MatchValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// One predicate of a matcher.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataMatch {
    field: String,
    domain: FieldDomain,
    operator: MatchOperator,
    value: MatchValue,
}

impl MetadataMatch {
    /// Build a match.
    pub fn new(
        field: impl Into<String>,
        domain: FieldDomain,
        operator: MatchOperator,
        value: impl Into<MatchValue>,
    ) -> Self {
        Self {
            field: field.into(),
            domain,
            operator,
            value: value.into(),
        }
    }

    /// Field name: a metadata key or a property column.
    pub fn field(&self) -> &str {
        &self.field
    }

    /// Field domain.
    pub fn domain(&self) -> FieldDomain {
        self.domain
    }

    /// Operator.
    pub fn operator(&self) -> MatchOperator {
        self.operator
    }

    /// Comparison value.
    pub fn value(&self) -> &MatchValue {
        &self.value
    }

    /// Resolve the targeted property for `MessageProperty` matches.
    pub fn property(&self) -> Result<Option<MessageProperty>, EventStoreError> {
        match self.domain {
            FieldDomain::Metadata => Ok(None),
            FieldDomain::MessageProperty => MessageProperty::from_field(&self.field)
                .map(Some)
                .ok_or_else(|| self.invalid("unknown message property")),
        }
    }

    /// Check the combination of field, operator and value.
    ///
    /// Booleans only support ordering and equality, regular expressions must
    /// be strings and the set operators need a parsable set literal.
    pub fn validate(&self) -> Result<(), EventStoreError> {
        if self.domain == FieldDomain::Metadata && !is_metadata_key(&self.field) {
            return Err(self.invalid("metadata keys may only contain [A-Za-z0-9_.-]"));
        }
        let _ = self.property()?;
        if let MatchValue::Float(value) = self.value {
            if !value.is_finite() {
                return Err(self.invalid("float must be finite"));
            }
        }

        match (self.operator, &self.value) {
            (MatchOperator::In | MatchOperator::NotIn, MatchValue::Text(literal)) => {
                parse_set_literal(&self.field, literal).map(|_| ())
            }
            (MatchOperator::In | MatchOperator::NotIn, _) => {
                Err(self.invalid("membership operators expect a set literal such as ('a', 'b')"))
            }
            (MatchOperator::Regex, MatchValue::Text(_)) => Ok(()),
            (MatchOperator::Regex, _) => Err(self.invalid("regex operator expects a string")),
            _ => Ok(()),
        }
    }

    /// Build an `InvalidMatcher` error for this match.
    pub fn invalid(&self, detail: impl Into<String>) -> EventStoreError {
        EventStoreError::InvalidMatcher {
            field: self.field.clone(),
            detail: detail.into(),
        }
    }
}

/// Conjunction of metadata matches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataMatcher {
    matches: Vec<MetadataMatch>,
}

impl MetadataMatcher {
    /// Matcher that accepts every event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a match on a metadata key.
    #[must_use]
    pub fn with_metadata_match(
        self,
        field: impl Into<String>,
        operator: MatchOperator,
        value: impl Into<MatchValue>,
    ) -> Self {
        self.with_match(MetadataMatch::new(
            field,
            FieldDomain::Metadata,
            operator,
            value,
        ))
    }

    /// Add a match on a message property.
    #[must_use]
    pub fn with_property_match(
        self,
        property: MessageProperty,
        operator: MatchOperator,
        value: impl Into<MatchValue>,
    ) -> Self {
        self.with_match(MetadataMatch::new(
            property.column(),
            FieldDomain::MessageProperty,
            operator,
            value,
        ))
    }

    /// Add a prebuilt match.
    #[must_use]
    pub fn with_match(mut self, matched: MetadataMatch) -> Self {
        self.matches.push(matched);
        self
    }

    /// Iterate in insertion order.
    pub fn iter(&self) -> std::slice::Iter<'_, MetadataMatch> {
        self.matches.iter()
    }

    /// Number of matches.
    pub fn len(&self) -> usize {
        self.matches.len()
    }

    /// True when no matches are present.
    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }
}

impl<'a> IntoIterator for &'a MetadataMatcher {
    type Item = &'a MetadataMatch;
    type IntoIter = std::slice::Iter<'a, MetadataMatch>;

    fn into_iter(self) -> Self::IntoIter {
        self.matches.iter()
    }
}

impl FromIterator<MetadataMatch> for MetadataMatcher {
    fn from_iter<I: IntoIterator<Item = MetadataMatch>>(iter: I) -> Self {
        Self {
            matches: iter.into_iter().collect(),
        }
    }
}

/// Split a set literal such as `('a', 'b''c', 3)` into its elements.
///
/// Elements may be single-quoted (`''` escapes a quote), double-quoted or
/// bare. Bare elements cannot contain whitespace or quotes. The set must be
/// non-empty.
pub fn parse_set_literal(field: &str, literal: &str) -> Result<Vec<String>, EventStoreError> {
    let invalid = |detail: &str| EventStoreError::InvalidMatcher {
        field: field.to_string(),
        detail: format!("{detail} in set literal {literal}"),
    };

    let inner = literal
        .trim()
        .strip_prefix('(')
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(|| invalid("missing parentheses"))?;

    let mut elements = Vec::new();
    let mut chars = inner.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let element = match chars.peek().copied() {
            None => return Err(invalid("empty element")),
            Some(quote @ ('\'' | '"')) => {
                let _ = chars.next();
                let mut element = String::new();
                loop {
                    match chars.next() {
                        None => return Err(invalid("unterminated quote")),
                        Some(c) if c == quote => {
                            if chars.next_if_eq(&quote).is_some() {
                                element.push(quote);
                            } else {
                                break;
                            }
                        }
                        Some(c) => element.push(c),
                    }
                }
                element
            }
            Some(_) => {
                let mut element = String::new();
                while let Some(c) = chars.next_if(|c| *c != ',' && !c.is_whitespace()) {
                    if c == '\'' || c == '"' {
                        return Err(invalid("stray quote"));
                    }
                    element.push(c);
                }
                if element.is_empty() {
                    return Err(invalid("empty element"));
                }
                element
            }
        };
        elements.push(element);

        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        match chars.next() {
            None => break,
            Some(',') => continue,
            Some(_) => return Err(invalid("expected a comma between elements")),
        }
    }

    Ok(elements)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn set_literal_elements_are_unquoted() {
        let elements = parse_set_literal("status", "('open', \"closed\", 3, 'it''s')")
            .expect("valid set literal");

        assert_eq!(elements, vec!["open", "closed", "3", "it's"]);
    }

    #[test]
    fn set_literal_without_parentheses_is_rejected() {
        let error = parse_set_literal("status", "'open', 'closed'").expect_err("not a set");

        assert!(matches!(
            error,
            EventStoreError::InvalidMatcher { ref field, .. } if field == "status"
        ));
    }

    #[test]
    fn empty_set_literal_is_rejected() {
        assert!(parse_set_literal("status", "()").is_err());
        assert!(parse_set_literal("status", "('a',)").is_err());
    }

    #[test]
    fn unterminated_quote_is_rejected() {
        assert!(parse_set_literal("status", "('open)").is_err());
    }

    #[test]
    fn bool_membership_is_invalid() {
        let matched = MetadataMatch::new("flag", FieldDomain::Metadata, MatchOperator::In, true);

        assert!(matched.validate().is_err());
    }

    #[test]
    fn non_finite_floats_are_invalid() {
        for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let matched =
                MetadataMatch::new("ratio", FieldDomain::Metadata, MatchOperator::Equals, value);

            let error = matched.validate().expect_err("non-finite float");
            assert!(matches!(
                error,
                EventStoreError::InvalidMatcher { ref detail, .. }
                    if detail == "float must be finite"
            ));
        }
        let finite =
            MetadataMatch::new("ratio", FieldDomain::Metadata, MatchOperator::Equals, 0.5);
        assert!(finite.validate().is_ok());
    }

    #[test]
    fn regex_requires_a_string() {
        let numeric = MetadataMatch::new("n", FieldDomain::Metadata, MatchOperator::Regex, 3);
        let text = MetadataMatch::new("n", FieldDomain::Metadata, MatchOperator::Regex, "^a");

        assert!(numeric.validate().is_err());
        assert!(text.validate().is_ok());
    }

    #[test]
    fn unknown_message_property_is_invalid() {
        let matched = MetadataMatch::new(
            "payload",
            FieldDomain::MessageProperty,
            MatchOperator::Equals,
            "x",
        );

        assert!(matched.validate().is_err());
    }

    #[test]
    fn metadata_key_with_quote_is_invalid() {
        let matched =
            MetadataMatch::new("a'b", FieldDomain::Metadata, MatchOperator::Equals, "x");

        assert!(matched.validate().is_err());
    }

    #[test]
    fn properties_round_trip_through_their_column_names() {
        for property in MessageProperty::ALL {
            assert_eq!(MessageProperty::from_field(property.column()), Some(property));
        }
    }

    #[test]
    fn matcher_keeps_insertion_order() {
        let matcher = MetadataMatcher::new()
            .with_metadata_match("integer", MatchOperator::LowerThanEquals, 2)
            .with_metadata_match("bool", MatchOperator::Equals, true);

        let fields: Vec<&str> = matcher.iter().map(MetadataMatch::field).collect();

        assert_eq!(fields, vec!["integer", "bool"]);
    }

    proptest! {
        #[test]
        fn quoted_elements_survive_parsing(
            elements in prop::collection::vec("[a-z0-9 ']{0,8}", 1..6)
        ) {
            let literal = format!(
                "({})",
                elements
                    .iter()
                    .map(|e| format!("'{}'", e.replace('\'', "''")))
                    .collect::<Vec<_>>()
                    .join(", ")
            );

            let parsed = parse_set_literal("field", &literal).expect("valid literal");

            prop_assert_eq!(parsed, elements);
        }
    }
}
