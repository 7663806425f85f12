//! Cross-block deduplication tests (crash-replay reconciliation).

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use crate::clock::Clock;
    use crate::config::Config;
    use crate::database::Database;
    use crate::model::{Value, Write};
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Simulates a crash-replay duplicate: the same writes land in two
    /// sealed segments, then the database is reopened.
    #[test]
    fn dedupe__reopen_drops_replayed_duplicates() {
        let tmp = TempDir::new().unwrap();
        let clock = Arc::new(Clock::new());
        let config = Config::default();
        let value = Value::Text("jeff".into());

        {
            let db = Database::open(tmp.path(), &config, Arc::clone(&clock)).unwrap();
            let writes = vec![
                Write::add("name", value.clone(), 1, clock.next()),
                Write::add("name", Value::Text("ashleah".into()), 2, clock.next()),
            ];
            let segment = db.build_segment(&writes).unwrap();
            db.merge(segment).unwrap();
            // The replayed duplicate: identical tuples in a second
            // segment.
            let segment = db.build_segment(&writes).unwrap();
            db.merge(segment).unwrap();

            // The duplicate is visible in the history until the
            // reconciliation pass runs.
            assert_eq!(db.audit_field("name", 1, u64::MAX).unwrap().len(), 2);
        }

        let db = Database::open(tmp.path(), &config, Arc::clone(&clock)).unwrap();
        assert!(db.verify("name", &value, 1, u64::MAX).unwrap());
        assert_eq!(db.audit_field("name", 1, u64::MAX).unwrap().len(), 1);
    }

    #[test]
    fn dedupe__disjoint_blocks_are_untouched() {
        let tmp = TempDir::new().unwrap();
        let clock = Arc::new(Clock::new());
        let config = Config::default();

        {
            let db = Database::open(tmp.path(), &config, Arc::clone(&clock)).unwrap();
            for record in 1..=4u64 {
                let writes = vec![Write::add(
                    "age",
                    Value::Integer(record as i32),
                    record,
                    clock.next(),
                )];
                let segment = db.build_segment(&writes).unwrap();
                db.merge(segment).unwrap();
            }
        }

        let db = Database::open(tmp.path(), &config, Arc::clone(&clock)).unwrap();
        for record in 1..=4u64 {
            assert!(
                db.verify("age", &Value::Integer(record as i32), record, u64::MAX)
                    .unwrap()
            );
        }
    }

    #[test]
    fn dedupe__fully_duplicated_block_is_deleted() {
        let tmp = TempDir::new().unwrap();
        let clock = Arc::new(Clock::new());
        let config = Config::default();
        let value = Value::Integer(7);

        {
            let db = Database::open(tmp.path(), &config, Arc::clone(&clock)).unwrap();
            let writes = vec![Write::add("age", value.clone(), 1, clock.next())];
            let segment = db.build_segment(&writes).unwrap();
            db.merge(segment).unwrap();
            let segment = db.build_segment(&writes).unwrap();
            db.merge(segment).unwrap();
        }

        let db = Database::open(tmp.path(), &config, Arc::clone(&clock)).unwrap();
        assert!(db.verify("age", &value, 1, u64::MAX).unwrap());

        // Only one primary block file remains.
        let blocks = std::fs::read_dir(tmp.path().join("cpb"))
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .path()
                    .extension()
                    .is_some_and(|ext| ext == "blk")
            })
            .count();
        assert_eq!(blocks, 1);
    }
}
