//! Tests for revision/write wire formats and canonical ordering.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use crate::encoding::{Decode, encode_to_vec};
    use crate::model::{
        Action, PrimaryRevision, Revision, Value, Write, composite_one, composite_three,
        composite_two,
    };

    fn revision(record: u64, key: &str, value: i32, version: u64) -> PrimaryRevision {
        Revision::new(
            record,
            key.to_string(),
            Value::Integer(value),
            version,
            Action::Add,
        )
    }

    #[test]
    fn revision__wire_round_trip() {
        let original = revision(7, "age", 30, 1000);
        let bytes = encode_to_vec(&original).unwrap();
        let (decoded, consumed) = PrimaryRevision::decode_from(&bytes).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn revision__wire_layout_starts_with_action_and_version() {
        let bytes = encode_to_vec(&revision(7, "age", 30, 1000)).unwrap();
        assert_eq!(bytes[0], 1); // ADD
        assert_eq!(&bytes[1..9], &1000u64.to_be_bytes());
        // locatorSize:4 | keySize:4 | valueSize:4
        assert_eq!(&bytes[9..13], &8u32.to_be_bytes());
        assert_eq!(&bytes[13..17], &3u32.to_be_bytes());
        assert_eq!(&bytes[17..21], &5u32.to_be_bytes()); // tag + i32
    }

    #[test]
    fn revision__canonical_order_is_locator_key_version() {
        let mut revisions = vec![
            revision(2, "a", 1, 10),
            revision(1, "b", 1, 5),
            revision(1, "a", 1, 20),
            revision(1, "a", 1, 10),
        ];
        revisions.sort();
        assert_eq!(
            revisions
                .iter()
                .map(|r| (*r.locator(), r.key().clone(), r.version()))
                .collect::<Vec<_>>(),
            vec![
                (1, "a".to_string(), 10),
                (1, "a".to_string(), 20),
                (1, "b".to_string(), 5),
                (2, "a".to_string(), 10),
            ]
        );
    }

    #[test]
    fn composites__are_prefix_unambiguous() {
        // (locator="ab", key="c") must not collide with
        // (locator="a", key="bc").
        let a = composite_two(&"ab".to_string(), &"c".to_string());
        let b = composite_two(&"a".to_string(), &"bc".to_string());
        assert_ne!(a, b);

        let one = composite_one(&"ab".to_string());
        assert!(a.starts_with(&one));
    }

    #[test]
    fn composites__datum_extends_prefix() {
        let datum = composite_three(&1u64, &"k".to_string(), &Value::Integer(5));
        let prefix = composite_two(&1u64, &"k".to_string());
        assert!(datum.starts_with(&prefix));
        assert!(datum.len() > prefix.len());
    }

    #[test]
    fn write__wire_round_trip_preserves_version_and_action() {
        let original = Write::remove("name", Value::Text("jeff".into()), 42, 777);
        let bytes = encode_to_vec(&original).unwrap();
        let (decoded, consumed) = Write::decode_from(&bytes).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded.version(), 777);
        assert_eq!(decoded.action(), Action::Remove);
    }

    #[test]
    fn write__fans_out_into_primary_and_index_revisions() {
        let write = Write::add("name", Value::Text("jeff".into()), 42, 777);

        let primary = write.primary_revision();
        assert_eq!(*primary.locator(), 42);
        assert_eq!(primary.key(), "name");

        let index = write.index_revision();
        assert_eq!(index.locator(), "name");
        assert_eq!(*index.value(), 42);
        assert_eq!(index.version(), 777);
    }

    #[test]
    fn write__inverse_flips_action_only() {
        let write = Write::add("name", Value::Text("jeff".into()), 42, 777);
        let inverse = write.inverse(778);
        assert_eq!(inverse.action(), Action::Remove);
        assert!(inverse.same_datum(&write));
        assert_eq!(inverse.version(), 778);
    }
}
