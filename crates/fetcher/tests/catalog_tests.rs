mod common;

use common::*;
use pgext_core::{ContentHash, Fingerprint, ManifestSource};
use pgext_fetcher::{Catalog, CatalogStatus, ExtensionRequestHandler, Readiness};
use pgext_storage::FetchClient;
use std::sync::Arc;

const INDEX: &str = r#"{
    "v15": {
        "test_ext": {"files": [
            "v15/share/extension/test_ext.control",
            {"key": "v15/lib/test_ext.so", "fingerprint": "sha256:FP"}
        ]},
        "other_ext": {"files": ["v15/share/extension/other_ext.control"]}
    },
    "v16": {
        "test_ext": {"files": ["v16/share/extension/test_ext.control"]}
    }
}"#;

fn index_source() -> ManifestSource {
    ManifestSource::Index {
        key: "ext_index.json".to_string(),
    }
}

fn index_document() -> String {
    INDEX.replace("FP", &ContentHash::compute(b"lib").to_hex())
}

#[tokio::test]
async fn loads_index_document() {
    let store = MockStore::new();
    store.insert("ext_index.json", index_document());

    let catalog = Catalog::load(index_source(), FetchClient::new(store.clone(), fast_policy())).await;

    assert_eq!(catalog.status(), CatalogStatus::Ready { extensions: 3 });
    let entry = catalog.resolve(v15(), &ext("test_ext")).unwrap();
    assert_eq!(entry.files.len(), 2);
    assert_eq!(entry.files[0].key, key(CONTROL_KEY));
    assert_eq!(
        entry.files[1].fingerprint,
        Some(Fingerprint::Sha256(ContentHash::compute(b"lib")))
    );

    let v16_entry = catalog.resolve(v16(), &ext("test_ext")).unwrap();
    assert_eq!(v16_entry.files[0].key, key("v16/share/extension/test_ext.control"));
    assert_eq!(catalog.extensions(v15()).len(), 2);
}

#[tokio::test]
async fn index_fetch_is_retried() {
    let store = MockStore::new();
    store.insert("ext_index.json", index_document());
    store.script("ext_index.json", [Fault::Transient]);

    let catalog = Catalog::load(index_source(), FetchClient::new(store.clone(), fast_policy())).await;

    assert!(catalog.status().is_ready());
    assert_eq!(store.gets(), 2);
}

#[tokio::test]
async fn unavailable_until_reloaded() {
    let env = TestEnv::new().await;
    let client = FetchClient::new(env.store.clone(), fast_policy());
    let catalog = Arc::new(Catalog::load(index_source(), client).await);
    assert!(matches!(catalog.status(), CatalogStatus::Unavailable { .. }));

    let handler = ExtensionRequestHandler::new(catalog.clone(), env.coordinator.clone());
    let calls = env.store.calls();
    assert_eq!(handler.ensure(v15(), &ext("test_ext")).await, Readiness::NotFound);
    assert_eq!(env.store.calls(), calls);

    env.store.insert("ext_index.json", index_document());
    env.store.insert(CONTROL_KEY, "comment = 'test'");
    env.store.insert("v15/lib/test_ext.so", "lib");
    assert_eq!(catalog.reload().await, CatalogStatus::Ready { extensions: 3 });

    assert!(handler.ensure(v15(), &ext("test_ext")).await.is_ready());
}

#[tokio::test]
async fn malformed_index_is_unavailable() {
    let store = MockStore::new();
    store.insert("ext_index.json", "{not json");

    let catalog = Catalog::load(index_source(), FetchClient::new(store.clone(), fast_policy())).await;

    let CatalogStatus::Unavailable { reason } = catalog.status() else {
        panic!("expected unavailable catalog");
    };
    assert!(reason.contains("index"));
    assert!(catalog.resolve(v15(), &ext("test_ext")).is_none());
}

#[tokio::test]
async fn listing_derives_entries() {
    let store = MockStore::new();
    for k in [
        "v15/share/extension/test_ext.control",
        "v15/share/extension/test_ext--1.1.sql",
        "v15/share/extension/test_ext--1.0.sql",
        "v15/share/extension/bare.control",
        "v15/lib/test_ext.so",
        "v15/lib/unrelated.so",
        "v16/share/extension/test_ext.control",
    ] {
        store.insert(k, "x");
    }

    let source = ManifestSource::Listing {
        versions: vec![v15()],
    };
    let catalog = Catalog::load(source, FetchClient::new(store.clone(), fast_policy())).await;

    assert_eq!(catalog.status(), CatalogStatus::Ready { extensions: 2 });
    let entry = catalog.resolve(v15(), &ext("test_ext")).unwrap();
    let keys: Vec<&str> = entry.files.iter().map(|f| f.key.as_str()).collect();
    assert_eq!(keys, vec![
        "v15/share/extension/test_ext.control",
        "v15/share/extension/test_ext--1.0.sql",
        "v15/share/extension/test_ext--1.1.sql",
        "v15/lib/test_ext.so",
    ]);

    let bare = catalog.resolve(v15(), &ext("bare")).unwrap();
    assert_eq!(bare.files.len(), 1);
    assert!(catalog.resolve(v16(), &ext("test_ext")).is_none());
    assert_eq!(store.lists(), 2);
}
