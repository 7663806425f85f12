//! Atomic operation state-machine and conflict tests.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use crate::atomic::AtomicError;
    use crate::engine::Engine;
    use crate::engine::tests::helpers::*;
    use crate::model::{Operator, Value};
    use std::sync::{Arc, Barrier};
    use tempfile::TempDir;

    fn text(s: &str) -> Value {
        Value::Text(s.into())
    }

    #[test]
    fn atomic__staged_writes_are_invisible_until_commit() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), batch_config()).unwrap();

        let mut op = engine.start_atomic_operation();
        assert!(op.add("name", text("jeff"), 1).unwrap());
        assert!(!engine.verify("name", &text("jeff"), 1).unwrap());
        // The operation's own view sees the staged write.
        assert!(op.verify("name", &text("jeff"), 1).unwrap());

        op.commit().unwrap();
        assert!(engine.verify("name", &text("jeff"), 1).unwrap());

        engine.stop().unwrap();
    }

    #[test]
    fn atomic__redundant_add_is_a_noop_within_the_view() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), batch_config()).unwrap();
        engine.add("name", text("jeff"), 1).unwrap();

        let mut op = engine.start_atomic_operation();
        assert!(!op.add("name", text("jeff"), 1).unwrap());
        assert!(op.remove("name", text("jeff"), 1).unwrap());
        assert!(!op.remove("name", text("jeff"), 1).unwrap());
        op.commit().unwrap();

        assert!(!engine.verify("name", &text("jeff"), 1).unwrap());
        // One add before, one remove from the operation.
        assert_eq!(engine.audit_field("name", 1).unwrap().len(), 2);

        engine.stop().unwrap();
    }

    #[test]
    fn atomic__conflicting_engine_write_preempts_reader() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), batch_config()).unwrap();

        let mut op = engine.start_atomic_operation();
        let _ = op.select("name", 1).unwrap();

        // External write to the observed field.
        engine.add("name", text("intruder"), 1).unwrap();

        assert!(matches!(op.commit(), Err(AtomicError::Preempted)));
        engine.stop().unwrap();
    }

    #[test]
    fn atomic__unrelated_write_does_not_preempt() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), batch_config()).unwrap();

        let mut op = engine.start_atomic_operation();
        let _ = op.select("name", 1).unwrap();
        op.add("name", text("jeff"), 1).unwrap();

        engine.add("other", text("noise"), 99).unwrap();

        op.commit().unwrap();
        assert!(engine.verify("name", &text("jeff"), 1).unwrap());
        engine.stop().unwrap();
    }

    #[test]
    fn atomic__ranged_find_is_preempted_by_in_range_write_only() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), batch_config()).unwrap();
        engine.add("age", Value::Integer(60), 1).unwrap();

        let mut op = engine.start_atomic_operation();
        let found = op
            .find("age", Operator::GreaterThan, &[Value::Integer(50)])
            .unwrap();
        assert_eq!(found, [1].into());

        // A write inside the observed range preempts the operation.
        engine.add("age", Value::Integer(70), 2).unwrap();
        assert!(matches!(op.commit(), Err(AtomicError::Preempted)));

        // Writes to another key, or to the same key outside the
        // observed range, do not.
        let mut op = engine.start_atomic_operation();
        let found = op
            .find("age", Operator::GreaterThan, &[Value::Integer(50)])
            .unwrap();
        assert_eq!(found, [1, 2].into());
        engine.add("height", Value::Integer(10), 3).unwrap();
        engine.add("age", Value::Integer(10), 4).unwrap();
        op.commit().unwrap();

        engine.stop().unwrap();
    }

    /// # Scenario
    /// A reader holds `find("age", Equals, [Integer(5)])` while a
    /// concurrent writer adds the numerically equal `Long(5)`.
    ///
    /// # Expected behavior
    /// `Equals` matches across numeric kinds, so the write intersects
    /// the observed range and preempts the reader.
    #[test]
    fn atomic__equals_find_is_preempted_across_numeric_kinds() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), batch_config()).unwrap();

        let mut op = engine.start_atomic_operation();
        let found = op
            .find("age", Operator::Equals, &[Value::Integer(5)])
            .unwrap();
        assert!(found.is_empty());

        engine.add("age", Value::Long(5), 1).unwrap();
        assert!(matches!(op.commit(), Err(AtomicError::Preempted)));

        engine.stop().unwrap();
    }

    #[test]
    fn atomic__operations_error_after_finishing() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), batch_config()).unwrap();

        let mut op = engine.start_atomic_operation();
        op.add("name", text("jeff"), 1).unwrap();
        op.commit().unwrap();

        assert!(matches!(op.commit(), Err(AtomicError::Finished)));
        assert!(matches!(
            op.verify("name", &text("jeff"), 1),
            Err(AtomicError::Finished)
        ));

        let mut op = engine.start_atomic_operation();
        op.abort();
        assert!(matches!(
            op.add("name", text("x"), 1),
            Err(AtomicError::Finished)
        ));

        engine.stop().unwrap();
    }

    /// # Scenario
    /// Two operations read the same field, then both stage writes to
    /// it and race their commits.
    ///
    /// # Expected behavior
    /// Exactly one commit succeeds; the other is preempted.
    #[test]
    fn atomic__exactly_one_of_two_conflicting_commits_wins() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), batch_config()).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let mut handles = Vec::new();
        for t in 0..2u64 {
            let engine = engine.clone();
            let barrier = Arc::clone(&barrier);
            handles.push(std::thread::spawn(move || {
                let mut op = engine.start_atomic_operation();
                let _ = op.select("name", 1).unwrap();
                op.add("name", Value::Text(format!("writer_{t}")), 1)
                    .unwrap();
                barrier.wait();
                op.commit().is_ok()
            }));
        }
        let outcomes: Vec<bool> = handles
            .into_iter()
            .map(|h| h.join().expect("committer panicked"))
            .collect();

        assert_eq!(
            outcomes.iter().filter(|ok| **ok).count(),
            1,
            "exactly one conflicting commit must win, got {outcomes:?}"
        );
        assert_eq!(engine.select("name", 1).unwrap().len(), 1);

        engine.stop().unwrap();
    }

    /// # Scenario
    /// N contending read-modify-write loops on one counter field, each
    /// retrying on preemption.
    ///
    /// # Expected behavior
    /// Every increment eventually lands exactly once.
    #[test]
    fn atomic__retry_loops_terminate_under_contention() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), batch_config()).unwrap();
        engine.add("count", Value::Integer(0), 1).unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let engine = engine.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..5 {
                    loop {
                        let mut op = engine.start_atomic_operation();
                        let current = op
                            .select("count", 1)
                            .unwrap()
                            .into_iter()
                            .find_map(|v| match v {
                                Value::Integer(i) => Some(i),
                                _ => None,
                            })
                            .unwrap();
                        op.remove("count", Value::Integer(current), 1).unwrap();
                        op.add("count", Value::Integer(current + 1), 1).unwrap();
                        match op.commit() {
                            Ok(()) => break,
                            Err(AtomicError::Preempted) => continue,
                            Err(e) => panic!("unexpected commit error: {e}"),
                        }
                    }
                }
            }));
        }
        for h in handles {
            h.join().expect("incrementer panicked");
        }

        assert_eq!(
            engine.select("count", 1).unwrap(),
            [Value::Integer(20)].into()
        );
        engine.stop().unwrap();
    }
}
