//! Transaction isolation, durability, and nesting tests.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use crate::atomic::transaction::TransactionError;
    use crate::atomic::{AtomicError, read_backup, write_backup};
    use crate::engine::Engine;
    use crate::engine::lock::LockIntent;
    use crate::engine::tests::helpers::*;
    use crate::model::{Token, Value, Write};
    use tempfile::TempDir;

    fn text(s: &str) -> Value {
        Value::Text(s.into())
    }

    #[test]
    fn transaction__staged_writes_commit_atomically() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), batch_config()).unwrap();

        let tx = engine.start_transaction();
        assert!(tx.add("name", text("jeff"), 1).unwrap());
        assert!(tx.add("age", Value::Integer(30), 1).unwrap());

        // Isolation: nothing is visible outside the transaction.
        assert!(!engine.verify("name", &text("jeff"), 1).unwrap());
        assert!(tx.verify("name", &text("jeff"), 1).unwrap());

        tx.commit().unwrap();
        assert!(engine.verify("name", &text("jeff"), 1).unwrap());
        assert!(engine.verify("age", &Value::Integer(30), 1).unwrap());

        engine.stop().unwrap();
    }

    #[test]
    fn transaction__external_write_invalidates_read_set() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), batch_config()).unwrap();

        let tx = engine.start_transaction();
        let _ = tx.select("name", 1).unwrap();
        tx.add("nickname", text("j"), 1).unwrap();

        // An external writer updates the field the transaction read.
        engine.add("name", text("intruder"), 1).unwrap();

        assert!(matches!(tx.commit(), Err(TransactionError::Invalidated)));
        assert!(!engine.verify("nickname", &text("j"), 1).unwrap());

        engine.stop().unwrap();
    }

    #[test]
    fn transaction__abort_discards_everything() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), batch_config()).unwrap();

        let tx = engine.start_transaction();
        tx.add("name", text("jeff"), 1).unwrap();
        tx.abort();

        assert!(matches!(
            tx.commit(),
            Err(TransactionError::Finished)
        ));
        assert!(!engine.verify("name", &text("jeff"), 1).unwrap());

        engine.stop().unwrap();
    }

    #[test]
    fn transaction__reads_compose_engine_and_queue() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), batch_config()).unwrap();
        engine.add("name", text("stored"), 1).unwrap();

        let tx = engine.start_transaction();
        tx.add("name", text("staged"), 1).unwrap();
        tx.remove("name", text("stored"), 1).unwrap();

        assert_eq!(tx.select("name", 1).unwrap(), [text("staged")].into());
        // The engine still sees the pre-transaction state.
        assert_eq!(engine.select("name", 1).unwrap(), [text("stored")].into());

        tx.commit().unwrap();
        assert_eq!(engine.select("name", 1).unwrap(), [text("staged")].into());

        engine.stop().unwrap();
    }

    #[test]
    fn transaction__nested_operation_sees_transaction_writes() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), batch_config()).unwrap();

        let tx = engine.start_transaction();
        tx.add("name", text("jeff"), 1).unwrap();

        let mut nested = tx.start_atomic_operation();
        assert!(nested.verify("name", &text("jeff"), 1).unwrap());
        assert!(nested.add("age", Value::Integer(30), 1).unwrap());
        nested.commit().unwrap();

        // The nested commit folded into the transaction, not the
        // engine.
        assert!(tx.verify("age", &Value::Integer(30), 1).unwrap());
        assert!(!engine.verify("age", &Value::Integer(30), 1).unwrap());

        tx.commit().unwrap();
        assert!(engine.verify("age", &Value::Integer(30), 1).unwrap());

        engine.stop().unwrap();
    }

    #[test]
    fn transaction__direct_write_preempts_nested_reader() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), batch_config()).unwrap();

        let tx = engine.start_transaction();
        let mut nested = tx.start_atomic_operation();
        let _ = nested.select("name", 1).unwrap();

        // A direct transaction write to the observed field.
        tx.add("name", text("jeff"), 1).unwrap();

        assert!(matches!(nested.commit(), Err(AtomicError::Preempted)));
        // The parent transaction is unaffected.
        tx.commit().unwrap();
        assert!(engine.verify("name", &text("jeff"), 1).unwrap());

        engine.stop().unwrap();
    }

    #[test]
    fn transaction__nested_failure_does_not_kill_parent() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), batch_config()).unwrap();

        let tx = engine.start_transaction();
        tx.add("name", text("jeff"), 1).unwrap();

        let mut nested = tx.start_atomic_operation();
        let _ = nested.select("city", 2).unwrap();
        tx.add("city", text("atlanta"), 2).unwrap();
        assert!(matches!(nested.commit(), Err(AtomicError::Preempted)));

        tx.commit().unwrap();
        assert!(engine.verify("name", &text("jeff"), 1).unwrap());
        assert!(engine.verify("city", &text("atlanta"), 2).unwrap());

        engine.stop().unwrap();
    }

    /// # Scenario
    /// A nested operation performs a ranged `find`; an external writer
    /// then writes inside (or outside) the observed range.
    ///
    /// # Expected behavior
    /// The ranged read is recorded at the transaction level, so an
    /// in-range external write invalidates the transaction's commit; an
    /// out-of-range write on the same key does not.
    #[test]
    fn transaction__nested_find_records_ranges_at_transaction_level() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), batch_config()).unwrap();

        let tx = engine.start_transaction();
        let mut nested = tx.start_atomic_operation();
        let found = nested
            .find("age", crate::model::Operator::GreaterThan, &[Value::Integer(50)])
            .unwrap();
        assert!(found.is_empty());
        nested.commit().unwrap();

        engine.add("age", Value::Integer(60), 1).unwrap();
        assert!(matches!(tx.commit(), Err(TransactionError::Invalidated)));

        // Same shape, but the external write lands below the range.
        let tx = engine.start_transaction();
        let mut nested = tx.start_atomic_operation();
        let _ = nested
            .find("age", crate::model::Operator::GreaterThan, &[Value::Integer(50)])
            .unwrap();
        nested.commit().unwrap();

        engine.add("age", Value::Integer(10), 2).unwrap();
        tx.commit().unwrap();

        engine.stop().unwrap();
    }

    #[test]
    fn transaction__doomed_parent_dooms_nested_operations() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), batch_config()).unwrap();

        let tx = engine.start_transaction();
        let _ = tx.select("name", 1).unwrap();

        // External write invalidates the transaction-level read.
        engine.add("name", text("intruder"), 1).unwrap();

        let mut nested = tx.start_atomic_operation();
        assert!(matches!(
            nested.add("age", Value::Integer(1), 1),
            Err(AtomicError::Preempted)
        ));

        engine.stop().unwrap();
    }

    #[test]
    fn backup__round_trips_locks_and_writes() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("42.txn");
        let intents = vec![
            LockIntent {
                token: Token::for_field("name", 1),
                exclusive: true,
            },
            LockIntent {
                token: Token::for_key("name"),
                exclusive: false,
            },
        ];
        let writes = vec![
            Write::add("name", text("jeff"), 1, 100),
            Write::remove("name", text("old"), 1, 101),
        ];

        write_backup(&path, &intents, &writes).unwrap();
        let restored = read_backup(&path).unwrap();
        assert_eq!(restored, writes);
    }

    #[test]
    fn backup__corruption_is_detected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("42.txn");
        write_backup(
            &path,
            &[],
            &[Write::add("name", text("jeff"), 1, 100)],
        )
        .unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        assert!(read_backup(&path).is_err());
    }

    /// # Scenario
    /// A backup file lingers in `transactions/` (a crash between the
    /// durable backup and the write-through).
    ///
    /// # Expected behavior
    /// Opening the engine replays the backed-up writes and deletes the
    /// file.
    #[test]
    fn backup__engine_restore_completes_interrupted_commits() {
        let tmp = TempDir::new().unwrap();
        {
            let engine = Engine::open(tmp.path(), batch_config()).unwrap();
            engine.stop().unwrap();
        }

        let backup = tmp.path().join("transactions").join("999.txn");
        write_backup(
            &backup,
            &[],
            &[
                Write::add("name", text("restored"), 7, 500),
                Write::add("age", Value::Integer(30), 7, 501),
            ],
        )
        .unwrap();

        let engine = Engine::open(tmp.path(), batch_config()).unwrap();
        assert!(engine.verify("name", &text("restored"), 7).unwrap());
        assert!(engine.verify("age", &Value::Integer(30), 7).unwrap());
        assert!(!backup.exists(), "restored backup must be deleted");

        engine.stop().unwrap();
    }
}
