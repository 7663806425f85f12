//! Tests for token identity and value-range containment.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use crate::model::{Operator, RangeScope, Token, Value, ValueRange};

    #[test]
    fn token__scopes_are_distinct() {
        let record = Token::for_record(1);
        let key = Token::for_key("name");
        let field = Token::for_field("name", 1);
        assert_ne!(record, key);
        assert_ne!(record, field);
        assert_ne!(key, field);
    }

    #[test]
    fn token__is_deterministic() {
        assert_eq!(Token::for_field("name", 1), Token::for_field("name", 1));
        assert_ne!(Token::for_field("name", 1), Token::for_field("name", 2));
    }

    #[test]
    fn token__round_trips_through_bytes() {
        let token = Token::for_key("age");
        assert_eq!(Token::from_bytes(token.to_bytes()), token);
    }

    #[test]
    fn range__greater_than_rejects_strictly_below_only() {
        let ranges = ValueRange::from_operator(Operator::GreaterThan, &[Value::Integer(50)]);
        assert_eq!(ranges.len(), 1);
        assert!(ranges[0].contains(&Value::Integer(51)));
        // The boundary is conflict-inclusive: ordered operators can
        // accept boundary values of other numeric kinds, so a boundary
        // write must count as intersecting.
        assert!(ranges[0].contains(&Value::Integer(50)));
        assert!(!ranges[0].contains(&Value::Integer(49)));
    }

    #[test]
    fn range__between_rejects_strictly_outside_values() {
        let ranges = ValueRange::from_operator(
            Operator::Between,
            &[Value::Integer(10), Value::Integer(20)],
        );
        assert!(ranges[0].contains(&Value::Integer(10)));
        assert!(ranges[0].contains(&Value::Integer(19)));
        // Conflict-inclusive upper boundary.
        assert!(ranges[0].contains(&Value::Integer(20)));
        assert!(!ranges[0].contains(&Value::Integer(9)));
        assert!(!ranges[0].contains(&Value::Integer(21)));
    }

    #[test]
    fn range__equals_collapses_to_points() {
        let ranges =
            ValueRange::from_operator(Operator::Equals, &[Value::Integer(5), Value::Integer(9)]);
        assert_eq!(ranges.len(), 2);
        assert!(ranges[0].contains(&Value::Integer(5)));
        assert!(!ranges[0].contains(&Value::Integer(6)));
    }

    #[test]
    fn range__containment_agrees_with_loose_equality() {
        // `Operator::Equals` matches across numeric kinds and
        // case-insensitively between Tag and Text; containment must
        // agree or conflicting writes go undetected.
        let ranges = ValueRange::from_operator(Operator::Equals, &[Value::Integer(5)]);
        assert!(ranges[0].contains(&Value::Long(5)));
        assert!(ranges[0].contains(&Value::Double(5.0)));
        assert!(!ranges[0].contains(&Value::Long(6)));

        let ranges =
            ValueRange::from_operator(Operator::Equals, &[Value::Text("jeff".into())]);
        assert!(ranges[0].contains(&Value::Tag("JEFF".into())));
        assert!(!ranges[0].contains(&Value::Tag("other".into())));
    }

    #[test]
    fn range__not_equals_observes_everything() {
        let ranges = ValueRange::from_operator(Operator::NotEquals, &[Value::Integer(5)]);
        assert_eq!(ranges.len(), 1);
        assert!(ranges[0].contains(&Value::Integer(5)));
        assert!(ranges[0].contains(&Value::Text("anything".into())));
    }

    #[test]
    fn range__numeric_containment_crosses_kinds() {
        let ranges = ValueRange::from_operator(Operator::GreaterThan, &[Value::Integer(50)]);
        assert!(ranges[0].contains(&Value::Double(50.5)));
        assert!(ranges[0].contains(&Value::Long(51)));
    }

    #[test]
    fn scope__intersects_matching_key_and_value() {
        let scope = RangeScope {
            key: "age".to_string(),
            ranges: ValueRange::from_operator(Operator::GreaterThan, &[Value::Integer(50)]),
        };
        assert!(scope.intersects("age", &Value::Integer(60)));
        assert!(!scope.intersects("age", &Value::Integer(40)));
        assert!(!scope.intersects("height", &Value::Integer(60)));
    }
}
