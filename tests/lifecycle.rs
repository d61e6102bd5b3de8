//! Container lifecycle against a file-backed registry

use std::collections::HashMap;
use std::sync::Arc;

use subgate::error::OrchestratorError;
use subgate::fake::FakeEngine;
use subgate::orchestrator::{LaunchSettings, Orchestrator};
use subgate::registry::SqliteRegistry;
use subgate::routes::ReverseProxy;
use tempfile::TempDir;

fn setup(
    engine: Arc<FakeEngine>,
    dir: &TempDir,
) -> (Orchestrator, Arc<ReverseProxy>) {
    let registry = SqliteRegistry::open(dir.path().join("subgate.db")).unwrap();
    let proxy = Arc::new(ReverseProxy::new());
    let orchestrator = Orchestrator::new(
        engine,
        Arc::new(registry),
        proxy.clone(),
        LaunchSettings::default(),
    );
    (orchestrator, proxy)
}

fn branch(name: &str) -> HashMap<String, String> {
    HashMap::from([("branch".to_string(), name.to_string())])
}

#[tokio::test]
async fn test_launch_list_terminate() {
    let dir = TempDir::new().unwrap();
    let engine = Arc::new(FakeEngine::new());
    let (orchestrator, proxy) = setup(engine.clone(), &dir);

    let record = orchestrator
        .launch("app1", "demo:latest", "app1-c1", &branch("main"))
        .await
        .unwrap();
    assert_eq!(record.subdomain, "app1");
    assert_eq!(record.git_branch, "main");
    assert_eq!(record.short_id, record.id[..12]);

    let listed = orchestrator.list().await.unwrap();
    assert_eq!(listed, vec![record.clone()]);
    assert_eq!(proxy.lookup("app1"), Some(record.ip_address.clone()));

    orchestrator.terminate("app1").await.unwrap();
    assert!(orchestrator.list().await.unwrap().is_empty());
    assert_eq!(proxy.lookup("app1"), None);
    assert_eq!(engine.stop_calls(), vec![record.id]);

    let err = orchestrator.terminate("app1").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound(_)));
}

#[tokio::test]
async fn test_records_survive_restart() {
    let dir = TempDir::new().unwrap();
    let engine = Arc::new(FakeEngine::new());

    let (first, second) = {
        let (orchestrator, _) = setup(engine.clone(), &dir);
        let first = orchestrator
            .launch("app1", "demo:latest", "app1-c1", &branch("main"))
            .await
            .unwrap();
        let second = orchestrator
            .launch("app2", "demo:latest", "app2-c1", &HashMap::new())
            .await
            .unwrap();
        (first, second)
    };

    // The second container went away while the process was down
    engine.remove_container(&second.id);

    let (orchestrator, proxy) = setup(engine.clone(), &dir);
    assert!(proxy.bindings().is_empty());

    assert_eq!(orchestrator.restore_routes().await.unwrap(), 1);
    assert_eq!(
        proxy.bindings(),
        vec![("app1".to_string(), first.ip_address.clone())]
    );
    assert_eq!(orchestrator.list().await.unwrap(), vec![first]);

    // The stale record is still registered until pruned
    assert_eq!(orchestrator.prune().await.unwrap(), vec!["app2".to_string()]);
    assert!(orchestrator.prune().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_relaunch_replaces_container() {
    let dir = TempDir::new().unwrap();
    let engine = Arc::new(FakeEngine::new());
    let (orchestrator, proxy) = setup(engine.clone(), &dir);

    let old = orchestrator
        .launch("app1", "demo:1", "app1-c1", &branch("main"))
        .await
        .unwrap();
    let new = orchestrator
        .launch("app1", "demo:2", "app1-c2", &branch("next"))
        .await
        .unwrap();

    assert_ne!(old.id, new.id);
    assert_eq!(engine.stop_calls(), vec![old.id]);
    assert_eq!(proxy.lookup("app1"), Some(new.ip_address.clone()));

    let listed = orchestrator.list().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].image, "demo:2");
    assert_eq!(listed[0].git_branch, "next");
}
