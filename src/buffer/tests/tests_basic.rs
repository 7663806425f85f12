//! Buffer append, page-roll, and crash-recovery tests.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use crate::buffer::{Buffer, BufferError};
    use crate::clock::Clock;
    use crate::limbo::Limbo;
    use crate::model::{Value, Write};
    use std::sync::Arc;
    use tempfile::TempDir;

    const SMALL_PAGE: usize = 512;

    fn open(dir: &std::path::Path, clock: &Arc<Clock>) -> Buffer {
        Buffer::open(dir, SMALL_PAGE, 1000, Arc::clone(clock)).unwrap()
    }

    fn write(clock: &Clock, key: &str, value: &str, record: u64) -> Write {
        Write::add(key, Value::Text(value.into()), record, clock.next())
    }

    fn collect(buffer: &Buffer) -> Vec<Write> {
        let mut out = Vec::new();
        buffer.for_each_write(&mut |w| out.push(w.clone()));
        out
    }

    #[test]
    fn buffer__insert_then_iterate_in_order() {
        let tmp = TempDir::new().unwrap();
        let clock = Arc::new(Clock::new());
        let buffer = open(tmp.path(), &clock);

        let writes: Vec<Write> = (0..10)
            .map(|i| write(&clock, "name", &format!("value_{i}"), i))
            .collect();
        for w in &writes {
            buffer.insert(w.clone()).unwrap();
        }

        assert_eq!(collect(&buffer), writes);
        assert_eq!(buffer.pending().unwrap(), 10);
    }

    #[test]
    fn buffer__rolls_pages_when_full() {
        let tmp = TempDir::new().unwrap();
        let clock = Arc::new(Clock::new());
        let buffer = open(tmp.path(), &clock);

        // Each write is ~60 bytes; 50 of them exceed one 512-byte page.
        for i in 0..50 {
            buffer
                .insert(write(&clock, "name", &format!("value_{i:04}"), i))
                .unwrap();
        }
        assert_eq!(buffer.pending().unwrap(), 50);

        let pages = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .path()
                    .extension()
                    .is_some_and(|ext| ext == "buf")
            })
            .count();
        assert!(pages > 1, "expected multiple pages, found {pages}");
    }

    #[test]
    fn buffer__oversized_write_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let clock = Arc::new(Clock::new());
        let buffer = open(tmp.path(), &clock);

        let huge = "x".repeat(SMALL_PAGE * 2);
        let err = buffer
            .insert(write(&clock, "name", &huge, 1))
            .unwrap_err();
        assert!(matches!(err, BufferError::OversizedWrite(_)));

        // The buffer keeps accepting ordinary writes afterwards.
        buffer.insert(write(&clock, "name", "small", 1)).unwrap();
        assert_eq!(buffer.pending().unwrap(), 1);
    }

    #[test]
    fn buffer__reopen_yields_the_same_iterator() {
        let tmp = TempDir::new().unwrap();
        let clock = Arc::new(Clock::new());
        let buffer = open(tmp.path(), &clock);

        let writes: Vec<Write> = (0..30)
            .map(|i| write(&clock, "name", &format!("value_{i:04}"), i))
            .collect();
        for w in &writes {
            buffer.insert(w.clone()).unwrap();
        }
        drop(buffer);

        let reopened = open(tmp.path(), &clock);
        assert_eq!(collect(&reopened), writes);
        assert_eq!(reopened.pending().unwrap(), 30);
    }

    #[test]
    fn buffer__reopen_appends_after_recovered_writes() {
        let tmp = TempDir::new().unwrap();
        let clock = Arc::new(Clock::new());
        let buffer = open(tmp.path(), &clock);
        buffer.insert(write(&clock, "name", "before", 1)).unwrap();
        drop(buffer);

        let reopened = open(tmp.path(), &clock);
        reopened
            .insert(write(&clock, "name", "after", 2))
            .unwrap();

        let all = collect(&reopened);
        assert_eq!(all.len(), 2);
        assert!(all[0].version() < all[1].version());
    }

    #[test]
    fn buffer__verify_uses_toggle_semantics() {
        let tmp = TempDir::new().unwrap();
        let clock = Arc::new(Clock::new());
        let buffer = open(tmp.path(), &clock);

        let value = Value::Text("jeff".into());
        buffer
            .insert(Write::add("name", value.clone(), 1, clock.next()))
            .unwrap();
        assert!(buffer.verify("name", &value, 1, u64::MAX));

        buffer
            .insert(Write::remove("name", value.clone(), 1, clock.next()))
            .unwrap();
        assert!(!buffer.verify("name", &value, 1, u64::MAX));
    }

    #[test]
    fn buffer__concurrent_appends_are_all_observed() {
        let tmp = TempDir::new().unwrap();
        let clock = Arc::new(Clock::new());
        let buffer = Arc::new(open(tmp.path(), &clock));

        let mut handles = Vec::new();
        for t in 0..4u64 {
            let buffer = Arc::clone(&buffer);
            let clock = Arc::clone(&clock);
            handles.push(std::thread::spawn(move || {
                for i in 0..25u64 {
                    buffer
                        .insert(Write::add(
                            "key",
                            Value::Long((t * 100 + i) as i64),
                            t,
                            clock.next(),
                        ))
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.join().expect("writer thread panicked");
        }
        assert_eq!(buffer.pending().unwrap(), 100);
    }
}
