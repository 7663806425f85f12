//! Tests for the sparse manifest, including the lazy streaming path.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use crate::block::Block;
    use crate::block::manifest::{Manifest, composite_hash};
    use crate::model::{Action, Value};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    type PrimaryBlock = Block<u64, String, Value>;

    fn ranges_of(entries: &[(&[u8], u64, u64)]) -> BTreeMap<[u8; 16], (u64, u64)> {
        entries
            .iter()
            .map(|(composite, start, end)| (composite_hash(composite), (*start, *end)))
            .collect()
    }

    #[test]
    fn manifest__lookup_finds_recorded_ranges() {
        let manifest = Manifest::from_ranges(&ranges_of(&[
            (b"alpha", 0, 100),
            (b"beta", 100, 250),
        ]));
        assert_eq!(manifest.lookup(b"alpha"), Some((0, 100)));
        assert_eq!(manifest.lookup(b"beta"), Some((100, 250)));
        assert_eq!(manifest.lookup(b"gamma"), None);
        assert_eq!(manifest.len(), 2);
    }

    #[test]
    fn manifest__raw_table_round_trips_through_load() {
        let original = Manifest::from_ranges(&ranges_of(&[
            (b"alpha", 0, 100),
            (b"beta", 100, 250),
            (b"gamma", 250, 300),
        ]));
        let raw = original.raw_bytes().to_vec();

        // Eager load (table under the threshold).
        let eager = Manifest::load(raw.clone(), usize::MAX).unwrap();
        assert_eq!(eager.lookup(b"beta"), Some((100, 250)));

        // Lazy load (threshold zero): queries binary-search the raw
        // table until the background materialiser lands.
        let lazy = Manifest::load(raw, 0).unwrap();
        assert_eq!(lazy.lookup(b"alpha"), Some((0, 100)));
        assert_eq!(lazy.lookup(b"gamma"), Some((250, 300)));
        assert_eq!(lazy.lookup(b"delta"), None);
    }

    #[test]
    fn manifest__rejects_misaligned_tables() {
        assert!(Manifest::load(vec![0u8; 33], usize::MAX).is_err());
    }

    #[test]
    fn manifest__block_seeks_work_before_materialisation() {
        let tmp = TempDir::new().unwrap();
        let block = PrimaryBlock::create(tmp.path(), 1, 1000);
        for record in 1..=50u64 {
            block
                .insert(
                    record,
                    "age".to_string(),
                    Value::Integer(record as i32),
                    record,
                    Action::Add,
                )
                .unwrap();
        }
        block.sync().unwrap();
        drop(block);

        // Threshold 0 forces the lazy path on reopen.
        let reopened = PrimaryBlock::open(tmp.path(), 1, 0).unwrap();
        for record in [1u64, 25, 50] {
            let hits = reopened.seek(&record, None).unwrap();
            assert_eq!(hits.len(), 1, "record {record} must resolve lazily");
        }
        assert!(reopened.seek(&99, None).unwrap().is_empty());
    }

    #[test]
    fn manifest__covers_locator_and_prefix_composites() {
        let tmp = TempDir::new().unwrap();
        let block = PrimaryBlock::create(tmp.path(), 1, 1000);
        block
            .insert(
                7,
                "age".to_string(),
                Value::Integer(30),
                10,
                Action::Add,
            )
            .unwrap();
        block
            .insert(
                7,
                "name".to_string(),
                Value::Integer(1),
                20,
                Action::Add,
            )
            .unwrap();
        block.sync().unwrap();
        drop(block);

        let reopened = PrimaryBlock::open(tmp.path(), 1, usize::MAX).unwrap();
        // One locator range + two prefix ranges are all resolvable.
        assert_eq!(reopened.seek(&7, None).unwrap().len(), 2);
        assert_eq!(reopened.seek(&7, Some(&"age".to_string())).unwrap().len(), 1);
        assert_eq!(
            reopened
                .seek(&7, Some(&"name".to_string()))
                .unwrap()
                .len(),
            1
        );
    }
}
