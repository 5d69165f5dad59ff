mod common;

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use async_trait::async_trait;
use computable::core::tree::{FieldSnapshot, NodeSnapshot};
use computable::{Computable, MemoryTree, PollComputablePool, PollPool, PollPoolOptions, PollSource, TreePoller, TreeSnapshot, TreeSource};
use serde::Deserialize;

/// A remote key-value service that counts how often it is asked
#[derive(Default)]
struct Service {
    values: Mutex<HashMap<String, String>>,
    reads: AtomicUsize,
}

impl Service {
    fn set(&self, key: &str, value: &str) { self.values.lock().unwrap().insert(key.to_string(), value.to_string()); }

    fn reads(&self) -> usize { self.reads.load(Ordering::SeqCst) }
}

struct ServiceSource(Arc<Service>);

#[async_trait]
impl PollSource for ServiceSource {
    type Request = String;
    type Value = String;

    fn key(&self, request: &String) -> String { request.clone() }

    async fn read_value(&self, request: &String) -> anyhow::Result<String> {
        self.0.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.0.values.lock().unwrap().get(request).cloned().unwrap_or_default())
    }

    fn values_equal(&self, old: &String, new: &String) -> bool { old == new }
}

fn fast() -> PollPoolOptions { PollPoolOptions { min_delay: Duration::from_millis(5) } }

#[tokio::test]
async fn test_polling_pauses_without_listeners() -> anyhow::Result<()> {
    let service = Arc::new(Service::default());
    service.set("status", "queued");
    let pool = PollComputablePool::new(ServiceSource(service.clone()), fast());
    let status = pool.get("status".to_string());

    assert_eq!(status.await_stable_value(Some(Duration::from_secs(2))).await?.as_deref(), Some("queued"));

    // nobody listens: the service is left alone
    tokio::time::sleep(Duration::from_millis(30)).await;
    let idle_reads = service.reads();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(service.reads(), idle_reads);

    // a listener resumes polling until the change shows up
    let listener = {
        let status = status.clone();
        tokio::spawn(async move { status.await_change(None, None).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(service.reads() > idle_reads);
    assert!(!listener.is_finished());

    service.set("status", "running");
    tokio::time::timeout(Duration::from_secs(2), listener).await???;
    assert_eq!(status.get_value()?.as_deref(), Some("running"));

    pool.terminate().await;
    assert!(status.get_value().is_err());
    Ok(())
}

#[tokio::test]
async fn test_cells_on_one_key_share_an_entry() -> anyhow::Result<()> {
    let service = Arc::new(Service::default());
    service.set("a", "1");
    let pool = PollComputablePool::new(ServiceSource(service.clone()), fast());

    let first = pool.get("a".to_string());
    let second = pool.get("a".to_string());
    let other = pool.get("b".to_string());
    assert_eq!(pool.len(), 2);

    first.await_stable_value(Some(Duration::from_secs(2))).await?;
    assert_eq!(second.await_stable_value(Some(Duration::from_secs(2))).await?.as_deref(), Some("1"));
    assert_eq!(other.await_stable_value(Some(Duration::from_secs(2))).await?.as_deref(), Some(""));

    // entries live as long as a cell built on them
    drop((first, second));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(pool.len(), 1);
    pool.terminate().await;
    Ok(())
}

/// Serves whatever snapshot the test put there last
#[derive(Default)]
struct Backend {
    snapshot: Mutex<TreeSnapshot>,
    fetches: AtomicUsize,
}

struct BackendSource(Arc<Backend>);

#[async_trait]
impl TreeSource for BackendSource {
    async fn fetch(&self) -> anyhow::Result<TreeSnapshot> {
        self.0.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.0.snapshot.lock().unwrap().clone())
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
struct BlockArgs {
    dataset: String,
}

fn project(args: Option<&str>, output: Option<&str>) -> TreeSnapshot {
    let mut nodes = vec![NodeSnapshot::new("project")
        .ready()
        .with_field("args", FieldSnapshot::node("args"))
        .with_field("output", output.map_or(FieldSnapshot::Unset, |_| FieldSnapshot::node("output")))];
    if let Some(args) = args {
        nodes.push(NodeSnapshot::new("args").ready().with_data(args.to_string()));
    }
    if let Some(output) = output {
        nodes.push(NodeSnapshot::new("output").ready().with_data(output.to_string()));
    }
    TreeSnapshot { nodes }
}

#[tokio::test]
async fn test_tree_snapshot_diff_invalidation() -> anyhow::Result<()> {
    let backend = Arc::new(Backend::default());
    *backend.snapshot.lock().unwrap() = project(Some(r#"{"dataset":"d1"}"#), None);
    let tree = MemoryTree::new();
    let poller = Arc::new(TreePoller::new(BackendSource(backend.clone()), tree.clone()));
    let pool = PollPool::new(fast());
    pool.add(&poller);

    let arg_reads = Arc::new(AtomicUsize::new(0));
    let args = {
        let (tree, arg_reads) = (tree.clone(), arg_reads.clone());
        Computable::make(move |ctx| {
            arg_reads.fetch_add(1, Ordering::SeqCst);
            let args = tree.view(ctx, "project").traverse("args")?;
            Ok(args.map(|node| node.data_as_json::<BlockArgs>()).transpose()?.flatten())
        })
    };
    let output = {
        let tree = tree.clone();
        Computable::make(move |ctx| Ok(tree.view(ctx, "project").traverse_path(&["output"])?.map(|node| node.data_as_string()).transpose()?.flatten()))
    };

    let args_value = args.await_stable_value(Some(Duration::from_secs(2))).await?;
    assert_eq!(args_value, Some(BlockArgs { dataset: "d1".into() }));

    // the output appears later; the args node is untouched by that update
    let pending = {
        let output = output.clone();
        tokio::spawn(async move { output.await_stable_value(Some(Duration::from_secs(2))).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!pending.is_finished());
    let reads_before = arg_reads.load(Ordering::SeqCst);

    *backend.snapshot.lock().unwrap() = project(Some(r#"{"dataset":"d1"}"#), Some("42 rows"));
    assert_eq!(pending.await??.as_deref(), Some("42 rows"));

    // "project" changed (its output field), so args is re-read, but "args" data is the same
    assert_eq!(args.get_value()?, Some(BlockArgs { dataset: "d1".into() }));
    assert_eq!(arg_reads.load(Ordering::SeqCst), reads_before + 1);

    poller.pause();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let fetches = backend.fetches.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(backend.fetches.load(Ordering::SeqCst), fetches);
    pool.terminate().await;
    Ok(())
}
