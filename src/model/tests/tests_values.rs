//! Tests for the numeric-aware value comparator and matching rules.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use crate::model::{Component, Value};

    #[test]
    fn value__classes_order_bool_number_text_link() {
        let mut values = vec![
            Value::Link(1),
            Value::Text("a".into()),
            Value::Integer(5),
            Value::Boolean(true),
        ];
        values.sort();
        assert!(matches!(values[0], Value::Boolean(_)));
        assert!(matches!(values[1], Value::Integer(_)));
        assert!(matches!(values[2], Value::Text(_)));
        assert!(matches!(values[3], Value::Link(_)));
    }

    #[test]
    fn value__numbers_compare_across_kinds() {
        assert!(Value::Integer(2) < Value::Long(3));
        assert!(Value::Double(2.5) > Value::Integer(2));
        assert!(Value::Double(2.5) < Value::Long(3));
        assert!(Value::Float(1.5) < Value::Double(1.75));
    }

    #[test]
    fn value__large_longs_compare_exactly_against_doubles() {
        // 2^62 + 1 is not representable as f64; the comparison must
        // not round it to 2^62.
        let long = Value::Long((1i64 << 62) + 1);
        let double = Value::Double((1u64 << 62) as f64);
        assert!(long > double);
    }

    #[test]
    fn value__numeric_ties_break_by_kind_for_total_order() {
        let a = Value::Integer(1);
        let b = Value::Long(1);
        assert_ne!(a, b);
        assert_ne!(a.cmp(&b), std::cmp::Ordering::Equal);
    }

    #[test]
    fn value__matches_is_numeric_aware() {
        assert!(Value::Integer(30).matches(&Value::Long(30)));
        assert!(Value::Long(30).matches(&Value::Double(30.0)));
        assert!(!Value::Integer(30).matches(&Value::Double(30.5)));
    }

    #[test]
    fn value__tag_matches_text_case_insensitively() {
        assert!(Value::Tag("Jeff".into()).matches(&Value::Text("jeff".into())));
        assert!(Value::Text("JEFF".into()).matches(&Value::Tag("jeff".into())));
        // Same-kind comparisons stay exact.
        assert!(!Value::Text("Jeff".into()).matches(&Value::Text("jeff".into())));
    }

    #[test]
    fn value__text_orders_case_sensitively() {
        assert!(Value::Text("Jeff".into()) < Value::Text("jeff".into()));
    }

    #[test]
    fn value__wire_round_trip() {
        let values = [
            Value::Boolean(true),
            Value::Integer(-5),
            Value::Long(i64::MAX),
            Value::Float(1.5),
            Value::Double(-2.25),
            Value::Text("hello world".into()),
            Value::Tag("hello world".into()),
            Value::Link(99),
        ];
        for value in values {
            let mut buf = Vec::new();
            value.write_bytes(&mut buf).unwrap();
            let decoded = Value::from_bytes(&buf).unwrap();
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn value__unknown_tag_is_rejected() {
        assert!(Value::from_bytes(&[0xAB, 0x00]).is_err());
    }
}
