mod common;

use common::*;
use pgext_core::{AppConfig, ManifestSource};
use pgext_fetcher::{CatalogStatus, ErrorKind, Readiness};

#[tokio::test]
async fn simultaneous_requests_for_one_extension() {
    let env = TestEnv::new().await;
    env.store.insert(CONTROL_KEY, "comment = 'test'");
    let handler = env.handler(vec![entry("test_ext", v15(), &[CONTROL_KEY])]);

    let (ext_a, ext_b) = (ext("test_ext"), ext("test_ext"));
    let (a, b) = tokio::join!(
        handler.ensure(v15(), &ext_a),
        handler.ensure(v15(), &ext_b),
    );

    let expected = Readiness::Ready(vec![env.cache_root().join("v15/test_ext/test_ext.control")]);
    assert_eq!(a, expected);
    assert_eq!(b, expected);
    assert_eq!(env.store.gets(), 1);
}

#[tokio::test]
async fn transient_failures_then_ready() {
    let env = TestEnv::new().await;
    env.store.insert(CONTROL_KEY, "comment = 'test'");
    env.store.script(CONTROL_KEY, [Fault::Transient, Fault::Transient]);
    let handler = env.handler(vec![entry("test_ext", v15(), &[CONTROL_KEY])]);

    let readiness = handler.ensure(v15(), &ext("test_ext")).await;

    assert!(readiness.is_ready());
    assert!(env.store.gets() <= 3);
}

#[tokio::test]
async fn unknown_extension_makes_no_network_calls() {
    let env = TestEnv::new().await;
    let handler = env.handler(vec![entry("test_ext", v15(), &[CONTROL_KEY])]);

    assert_eq!(
        handler.ensure(v15(), &ext("nonexistent_ext")).await,
        Readiness::NotFound
    );
    // Known name, other version.
    assert_eq!(handler.ensure(v16(), &ext("test_ext")).await, Readiness::NotFound);
    assert_eq!(env.store.calls(), 0);
}

#[tokio::test]
async fn shared_file_is_fetched_once() {
    let env = TestEnv::new().await;
    env.store.insert("v15/share/extension/ext_a.control", "a");
    env.store.insert("v15/share/extension/ext_b.control", "b");
    env.store.insert(SHARED_KEY, "common");
    let handler = env.handler(vec![
        entry("ext_a", v15(), &["v15/share/extension/ext_a.control", SHARED_KEY]),
        entry("ext_b", v15(), &["v15/share/extension/ext_b.control", SHARED_KEY]),
    ]);

    let reports = handler.ensure_all(v15(), &[ext("ext_a"), ext("ext_b")]).await;

    assert_eq!(reports.len(), 2);
    for (name, readiness) in &reports {
        let Readiness::Ready(paths) = readiness else {
            panic!("{name} not ready: {readiness}");
        };
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[1], env.cache_root().join(format!("v15/{name}/common.so")));
        assert_eq!(std::fs::read(&paths[1]).unwrap(), b"common");
    }
    assert_eq!(env.store.gets(), 3);
}

#[tokio::test]
async fn paths_follow_manifest_order() {
    let env = TestEnv::new().await;
    let keys = [
        CONTROL_KEY,
        "v15/share/extension/test_ext--1.0.sql",
        "v15/share/extension/test_ext--1.0--1.1.sql",
        "v15/lib/test_ext.so",
    ];
    for k in keys {
        env.store.insert(k, k.to_string());
    }
    let handler = env.handler(vec![entry("test_ext", v15(), &keys)]);

    let Readiness::Ready(paths) = handler.ensure(v15(), &ext("test_ext")).await else {
        panic!("not ready");
    };
    let names: Vec<_> = paths
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec![
        "test_ext.control",
        "test_ext--1.0.sql",
        "test_ext--1.0--1.1.sql",
        "test_ext.so"
    ]);
}

#[tokio::test]
async fn first_failure_is_reported_and_others_finish() {
    let env = TestEnv::new().await;
    env.store.insert(CONTROL_KEY, "x");
    let handler = env.handler(vec![entry("test_ext", v15(), &[
        CONTROL_KEY,
        "v15/lib/test_ext.so",
    ])]);

    let readiness = handler.ensure(v15(), &ext("test_ext")).await;
    let Readiness::Error(err) = readiness else {
        panic!("expected error, got {readiness}");
    };
    assert_eq!(err.kind, ErrorKind::NotFound);
    assert_eq!(err.key, key("v15/lib/test_ext.so"));

    let cache = handler.coordinator().unwrap().cache().clone();
    wait_until(|| cache.lookup(v15(), &ext("test_ext"), &key(CONTROL_KEY)).is_present()).await;
}

#[tokio::test]
async fn build_from_filesystem_remote() {
    let temp = tempfile::tempdir().unwrap();
    let remote = temp.path().join("remote");
    let control = remote.join("v15/share/extension");
    std::fs::create_dir_all(&control).unwrap();
    std::fs::create_dir_all(remote.join("v15/lib")).unwrap();
    std::fs::write(control.join("test_ext.control"), "comment = 'test'").unwrap();
    std::fs::write(control.join("test_ext--1.0.sql"), "CREATE FUNCTION f();").unwrap();
    std::fs::write(remote.join("v15/lib/test_ext.so"), b"\x7fELF").unwrap();

    let mut config = AppConfig::for_testing(&remote, temp.path().join("cache"));
    config.catalog.source = ManifestSource::Listing {
        versions: vec![v15()],
    };

    let handler = pgext_fetcher::build(&config).await.unwrap();
    assert_eq!(handler.catalog().status(), CatalogStatus::Ready { extensions: 1 });

    let Readiness::Ready(paths) = handler.ensure(v15(), &ext("test_ext")).await else {
        panic!("not ready");
    };
    let ext_dir = temp.path().join("cache/v15/test_ext");
    assert_eq!(paths, vec![
        ext_dir.join("test_ext.control"),
        ext_dir.join("test_ext--1.0.sql"),
        ext_dir.join("test_ext.so"),
    ]);
    assert_eq!(std::fs::read(&paths[2]).unwrap(), b"\x7fELF");

    assert_eq!(
        handler.ensure(v15(), &ext("nonexistent_ext")).await,
        Readiness::NotFound
    );
}
