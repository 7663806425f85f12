//! Full-text search through the engine's composite view.

#[cfg(test)]
#[allow(non_snake_case)]
mod tests {
    use crate::engine::Engine;
    use crate::engine::tests::helpers::*;
    use crate::model::Value;
    use tempfile::TempDir;

    fn text(s: &str) -> Value {
        Value::Text(s.into())
    }

    #[test]
    fn search__matches_substrings_of_indexed_text() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), batch_config()).unwrap();

        engine.add("name", text("jeff"), 1).unwrap();
        assert_eq!(engine.search("name", "ef").unwrap(), [1].into());
        assert_eq!(engine.search("name", "jeff").unwrap(), [1].into());
        assert!(engine.search("name", "xyz").unwrap().is_empty());

        engine.stop().unwrap();
    }

    #[test]
    fn search__removed_text_stops_matching() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), batch_config()).unwrap();

        engine.add("name", text("jeff"), 1).unwrap();
        engine.remove("name", text("jeff"), 1).unwrap();
        assert!(engine.search("name", "ef").unwrap().is_empty());

        engine.stop().unwrap();
    }

    #[test]
    fn search__results_identical_after_transport() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), batch_config()).unwrap();

        engine.add("bio", text("storage engines are fun"), 1).unwrap();
        engine.add("bio", text("search engines differ"), 2).unwrap();

        let before = engine.search("bio", "engines").unwrap();
        assert_eq!(before, [1, 2].into());

        wait_for_transport(&engine);
        assert_eq!(engine.search("bio", "engines").unwrap(), before);

        engine.stop().unwrap();
    }

    #[test]
    fn search__half_transported_remove_does_not_resurrect() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), batch_config()).unwrap();

        engine.add("name", text("jeff"), 1).unwrap();
        wait_for_transport(&engine);
        // The remove is buffered; the add is in the database.
        engine.remove("name", text("jeff"), 1).unwrap();

        assert!(engine.search("name", "ef").unwrap().is_empty());

        engine.stop().unwrap();
    }

    #[test]
    fn search__stopwords_are_ignored_in_queries() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), batch_config()).unwrap();

        engine.add("bio", text("keeper of the flame"), 1).unwrap();
        assert_eq!(engine.search("bio", "keeper").unwrap(), [1].into());
        // "the" is a stopword; a stopword-only query matches nothing.
        assert!(engine.search("bio", "the").unwrap().is_empty());

        engine.stop().unwrap();
    }

    #[test]
    fn search__tag_values_are_exempt() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), batch_config()).unwrap();

        engine.add("name", Value::Tag("jeff".into()), 1).unwrap();
        assert!(engine.search("name", "jeff").unwrap().is_empty());

        engine.stop().unwrap();
    }

    #[test]
    fn search__is_case_insensitive() {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::open(tmp.path(), batch_config()).unwrap();

        engine.add("name", text("Jeff Nelson"), 1).unwrap();
        assert_eq!(engine.search("name", "jeff").unwrap(), [1].into());
        assert_eq!(engine.search("name", "NELSON").unwrap(), [1].into());

        engine.stop().unwrap();
    }
}
