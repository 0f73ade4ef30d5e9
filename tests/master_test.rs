//! Master-side validation and launch behavior.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fidelio::runtime::{ContainerRuntime, LaunchSpec};
use fidelio::schema::{
    AppSchema, ContainerDescriptor, ContainerEnvironment, ContainerType, ProcessGroup, Resource,
};
use fidelio::store::MemoryStore;
use fidelio::{Error, Master, ProgramConfig, StoreLayout};

fn container(name: &str, requires: &[&str]) -> ContainerDescriptor {
    ContainerDescriptor {
        service_name: name.to_string(),
        container_type: ContainerType::Web,
        requires: requires.iter().map(|r| r.to_string()).collect(),
        is_required_from: Default::default(),
        start: ProcessGroup {
            pre_main: vec![],
            main: Some(Resource::new("main", "/bin/sleep").with_args(&["30"])),
            post_main: vec![],
        },
        stop: ProcessGroup::default(),
        tasks: None,
        env: ContainerEnvironment::default(),
    }
}

/// Records runtime calls instead of launching anything.
#[derive(Default)]
struct RecordingRuntime {
    events: Mutex<Vec<String>>,
}

impl RecordingRuntime {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContainerRuntime for RecordingRuntime {
    async fn create_container(&self, spec: &LaunchSpec) -> fidelio::Result<String> {
        self.events
            .lock()
            .unwrap()
            .push(format!("create:{}", spec.service_name));
        Ok(spec.service_name.clone())
    }

    async fn start_container(&self, id: &str) -> fidelio::Result<()> {
        self.events.lock().unwrap().push(format!("start:{}", id));
        Ok(())
    }

    async fn stop_container(&self, _id: &str, _timeout: Duration) -> fidelio::Result<()> {
        Ok(())
    }

    async fn remove_container(&self, _id: &str) -> fidelio::Result<()> {
        Ok(())
    }

    async fn list_containers(&self) -> fidelio::Result<Vec<String>> {
        Ok(Vec::new())
    }
}

fn master_for(
    containers: Vec<ContainerDescriptor>,
) -> (fidelio::Result<Master>, MemoryStore, Arc<RecordingRuntime>) {
    let store = MemoryStore::new();
    let runtime = Arc::new(RecordingRuntime::default());
    let master = Master::new(
        Arc::new(store.clone()),
        runtime.clone(),
        ProgramConfig::default(),
        StoreLayout::default(),
        AppSchema {
            name: "app".to_string(),
            containers,
        },
    );
    (master, store, runtime)
}

#[test]
fn circular_dependency_refuses_launch() {
    let (master, _, runtime) = master_for(vec![container("a", &["b"]), container("b", &["a"])]);
    match master {
        Err(Error::InvalidSchema(reason)) => assert!(reason.contains("circular")),
        other => panic!("expected InvalidSchema, got {:?}", other.err()),
    }
    assert!(runtime.events().is_empty(), "nothing may be launched");
}

#[test]
fn duplicate_service_name_refuses_launch() {
    let (master, _, runtime) = master_for(vec![container("web1", &[]), container("web1", &[])]);
    match master {
        Err(Error::InvalidSchema(reason)) => assert!(reason.contains("duplicate")),
        other => panic!("expected InvalidSchema, got {:?}", other.err()),
    }
    assert!(runtime.events().is_empty());
}

#[test]
fn unknown_dependency_refuses_launch() {
    let (master, _, _) = master_for(vec![container("a", &["ghost"])]);
    assert!(matches!(master, Err(Error::InvalidSchema(_))));
}

#[test]
fn analyzer_populates_reverse_edges() {
    let (master, _, _) = master_for(vec![
        container("a", &[]),
        container("b", &["a"]),
        container("c", &["a"]),
    ]);
    let master = master.unwrap();
    let a = master
        .containers()
        .iter()
        .find(|c| c.service_name == "a")
        .unwrap();
    let dependents: Vec<&str> = a.is_required_from.iter().map(|s| s.as_str()).collect();
    assert_eq!(dependents, ["b", "c"]);
}

#[tokio::test]
async fn start_publishes_configuration_and_launches_every_container() {
    let (master, store, runtime) = master_for(vec![container("a", &[]), container("b", &["a"])]);
    let master = master.unwrap();
    master.start().await.unwrap();

    let layout = StoreLayout::default();
    for name in ["a", "b"] {
        let data = store
            .peek(&layout.conf_path(name))
            .expect("configuration node published");
        let published = ContainerDescriptor::from_bytes(&data).unwrap();
        assert_eq!(published.service_name, name);
    }
    // The published descriptor for a carries the derived reverse edge.
    let a = ContainerDescriptor::from_bytes(&store.peek(&layout.conf_path("a")).unwrap()).unwrap();
    assert!(a.is_required_from.contains("b"));

    assert_eq!(
        runtime.events(),
        ["create:a", "start:a", "create:b", "start:b"]
    );
}

#[tokio::test]
async fn start_clears_a_stale_shutdown_node() {
    let (master, store, _) = master_for(vec![container("a", &[])]);
    let master = master.unwrap();
    let layout = StoreLayout::default();

    master.stop().await.unwrap();
    assert!(store.peek(&layout.shutdown_path()).is_some());

    master.start().await.unwrap();
    assert!(
        store.peek(&layout.shutdown_path()).is_none(),
        "a stale shutdown node would kill the new run immediately"
    );
}

#[tokio::test]
async fn stop_is_idempotent() {
    let (master, store, _) = master_for(vec![container("a", &[])]);
    let master = master.unwrap();
    master.stop().await.unwrap();
    master.stop().await.unwrap();
    assert!(store.peek(&StoreLayout::default().shutdown_path()).is_some());
}

#[tokio::test]
async fn status_reports_unregistered_services() {
    let (master, _, _) = master_for(vec![container("a", &[]), container("b", &["a"])]);
    let master = master.unwrap();
    let statuses = master.status().await.unwrap();
    assert_eq!(statuses.len(), 2);
    assert!(statuses.iter().all(|(_, status)| status.is_none()));
}
