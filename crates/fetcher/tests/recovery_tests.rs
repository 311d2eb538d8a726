mod common;

use common::*;
use pgext_core::Manifest;
use pgext_fetcher::{CacheState, Catalog, ExtensionRequestHandler, Readiness, RequestOptions};
use std::sync::Arc;

/// Files in a directory, sorted.
fn list(dir: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn crash_before_rename_leads_to_fresh_download() {
    let env = TestEnv::new().await;
    env.store.insert(CONTROL_KEY, "comment = 'complete'");

    // What a crash between payload write and rename leaves behind.
    let ext_dir = env.cache_root().join("v15/test_ext");
    std::fs::create_dir_all(&ext_dir).unwrap();
    std::fs::write(ext_dir.join(".test_ext.control.Xy12Ab.tmp"), "comment = 'par").unwrap();

    let coordinator = env.restart().await;
    assert_eq!(list(&ext_dir), Vec::<String>::new());
    assert_eq!(
        coordinator
            .cache()
            .lookup(v15(), &ext("test_ext"), &key(CONTROL_KEY))
            .state,
        CacheState::Missing
    );

    let manifest = Manifest::from_entries([entry("test_ext", v15(), &[CONTROL_KEY])]).unwrap();
    let handler = ExtensionRequestHandler::new(Arc::new(Catalog::from_manifest(manifest)), coordinator);
    let readiness = handler.ensure(v15(), &ext("test_ext")).await;

    assert_eq!(readiness, Readiness::Ready(vec![ext_dir.join("test_ext.control")]));
    assert_eq!(env.store.gets(), 1);
    assert_eq!(
        std::fs::read(ext_dir.join("test_ext.control")).unwrap(),
        b"comment = 'complete'"
    );
    assert_eq!(list(&ext_dir), vec!["test_ext.control"]);
}

#[tokio::test]
async fn installed_files_survive_restart() {
    let env = TestEnv::new().await;
    env.store.insert(CONTROL_KEY, "x");
    let path = env
        .coordinator
        .request(v15(), &ext("test_ext"), &file(CONTROL_KEY), RequestOptions::default())
        .await
        .unwrap();

    let restarted = env.restart().await;
    let again = restarted
        .request(v15(), &ext("test_ext"), &file(CONTROL_KEY), RequestOptions::default())
        .await
        .unwrap();

    assert_eq!(again, path);
    assert_eq!(env.store.gets(), 1);
    assert_eq!(restarted.stats().cache_hits, 1);
}

#[tokio::test]
async fn recovered_files_are_not_copied_by_key() {
    // A recovered file has no recorded key, so another extension fetches its
    // own copy rather than trusting it.
    let env = TestEnv::new().await;
    env.store.insert(SHARED_KEY, "common");
    env.coordinator
        .request(v15(), &ext("ext_a"), &file(SHARED_KEY), RequestOptions::default())
        .await
        .unwrap();

    let restarted = env.restart().await;
    restarted
        .request(v15(), &ext("ext_b"), &file(SHARED_KEY), RequestOptions::default())
        .await
        .unwrap();

    assert_eq!(env.store.gets(), 2);
    assert_eq!(restarted.stats().local_copies, 0);
}
