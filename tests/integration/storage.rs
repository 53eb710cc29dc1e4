use std::path::PathBuf;

use crest::history::{HistoryStore, Settings};
use crest::storage::Storage;

struct TempDatabase {
    path: PathBuf,
}

impl TempDatabase {
    fn new() -> Self {
        let path = std::env::temp_dir().join(format!("crest-{}.db", uuid::Uuid::new_v4()));
        Self { path }
    }

    fn url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.path.display())
    }
}

impl Drop for TempDatabase {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let mut path = self.path.clone().into_os_string();
            path.push(suffix);
            let _ = std::fs::remove_file(path);
        }
    }
}

#[tokio::test]
async fn items_survive_a_restart() {
    crate::common::enable_tracing();
    let db = TempDatabase::new();

    {
        let storage = Storage::open(&db.url()).await.unwrap();
        let history = HistoryStore::new(storage.context(), Settings::default());
        history.store_urls(&["http://b.test/".to_string(), "http://a.test/".to_string()]);
        history.store_headers(&["Accept: */*".to_string()]);
        history.set_history_limit(10);
        storage.context().remove_item("headerHistory");
        storage.flush().await.unwrap();
    }

    let storage = Storage::open(&db.url()).await.unwrap();
    let history = HistoryStore::new(storage.context(), Settings::default());

    assert_eq!(history.list_urls(), vec!["http://a.test/", "http://b.test/"]);
    assert!(history.list_headers().is_empty());
    assert_eq!(history.settings().history_limit, 10);
    assert_eq!(storage.context().get_item("headerHistory"), None);
}

#[tokio::test]
async fn contexts_share_one_storage() {
    let storage = Storage::in_memory();
    let first = storage.context();
    let second = storage.context();
    let mut changes = second.subscribe();

    first.set_item("urlHistory", r#"["http://a.test/"]"#.to_string());

    assert_eq!(second.get_item("urlHistory").as_deref(), Some(r#"["http://a.test/"]"#));
    let change = changes.recv().await.unwrap();
    assert_eq!(change.key, "urlHistory");
    assert_eq!(change.new_value.as_deref(), Some(r#"["http://a.test/"]"#));
}
