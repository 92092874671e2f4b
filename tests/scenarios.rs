//! End-to-end scenarios across the umbrella API.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use girder::json::{from_str, to_string, Base, Deserializer, Node};
use girder::pool::{Job, Runnable, WorkerPool};
use pretty_assertions::assert_eq;

#[test]
fn test_roundtrip_object() {
    let mut root = Node::object(vec![("key", Node::string())]);
    from_str(&mut root, "{\"key\":\"value\"}").unwrap();
    assert_eq!(
        root.as_object()
            .unwrap()
            .get("key")
            .unwrap()
            .as_str()
            .unwrap()
            .get(),
        "value"
    );
    let wire = to_string(&root);
    assert_eq!(wire, "{\"key\":\"value\"}");
    // What we emit is plain JSON to any other parser.
    let check: serde_json::Value = serde_json::from_str(&wire).unwrap();
    assert_eq!(check["key"], "value");
}

#[test]
fn test_split_parse() {
    let mut root = Node::object(vec![("n", Node::unsigned(Base::Decimal))]);
    let mut cursor = Deserializer::new();
    cursor.deserialize(&mut root, b"{\"n\":1").unwrap();
    cursor.deserialize(&mut root, b"23}").unwrap();
    assert!(cursor.is_complete());
    assert_eq!(
        root.as_object()
            .unwrap()
            .get("n")
            .unwrap()
            .as_number()
            .unwrap()
            .get_u64(),
        123
    );
}

#[test]
fn test_opaque_capture() {
    let mut root = Node::object(vec![("k", Node::string())]);
    from_str(&mut root, "{\"k\":{\"a\":[1,2]}}").unwrap();
    assert_eq!(
        root.as_object()
            .unwrap()
            .get("k")
            .unwrap()
            .as_str()
            .unwrap()
            .get(),
        "{\"a\":[1,2]}"
    );
}

#[test]
fn test_malformed_recovery() {
    let mut root = Node::object(vec![("k", Node::array_of(Node::unsigned(Base::Decimal)))]);
    let err = from_str(&mut root, "{\"k\":[1,]}").unwrap_err();
    assert_eq!(err.position(), 8);
    assert_eq!(err.context(), "{\"k\":[1,");
    assert!(!root.is_set());
}

struct SelfResubmitter {
    runs: AtomicU32,
    pool: OnceLock<Arc<WorkerPool>>,
    me: OnceLock<Arc<Job<SelfResubmitter>>>,
}

impl Runnable for SelfResubmitter {
    fn run(&self) {
        let count = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        if count < 5 {
            self.pool.get().unwrap().post(self.me.get().unwrap());
        }
    }
}

#[test]
fn test_self_resubmit() {
    let pool = Arc::new(WorkerPool::builder().workers(1).build());
    let job = Arc::new(Job::new(SelfResubmitter {
        runs: AtomicU32::new(0),
        pool: OnceLock::new(),
        me: OnceLock::new(),
    }));
    job.inner().pool.set(Arc::clone(&pool)).ok().unwrap();
    job.inner().me.set(Arc::clone(&job)).ok().unwrap();

    pool.submit(&job, Duration::from_secs(1)).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while job.inner().runs.load(Ordering::SeqCst) < 5 {
        assert!(Instant::now() < deadline, "self-resubmission stalled");
        std::thread::sleep(Duration::from_millis(5));
    }
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(job.inner().runs.load(Ordering::SeqCst), 5);
}

struct NeverRuns {
    runs: AtomicU32,
}

impl Runnable for NeverRuns {
    fn run(&self) {
        self.runs.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_scheduled_revoke_race() {
    let pool = Arc::new(WorkerPool::builder().workers(1).with_scheduler().build());
    let job = Arc::new(Job::new(NeverRuns {
        runs: AtomicU32::new(0),
    }));
    pool.schedule(Instant::now() + Duration::from_millis(100), &job);
    std::thread::sleep(Duration::from_millis(10));
    pool.revoke(&job, Duration::from_millis(50)).unwrap();
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(job.inner().runs.load(Ordering::SeqCst), 0);
}
