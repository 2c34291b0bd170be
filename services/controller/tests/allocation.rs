//! Allocation store behaviour against in-memory and file-backed records.

use std::net::Ipv4Addr;
use std::sync::Arc;

use proptest::prelude::*;
use rstest::rstest;
use vlb_controller::ipam::{AllocError, AllocationStore, PortIndex};
use vlb_controller::store::{FileRecordStore, MemoryRecordStore, RecordStore, ALLOCATIONS_KEY};
use vlb_id::ServiceKey;
use vlb_networking::parse_pool;

fn key(name: &str) -> ServiceKey {
    ServiceKey::new("tenants", name).unwrap()
}

fn two_address_pool() -> Vec<Ipv4Addr> {
    parse_pool("10.1.1.55\n10.1.1.56\n").unwrap()
}

async fn memory_store(pool: Vec<Ipv4Addr>) -> (Arc<MemoryRecordStore>, AllocationStore) {
    let records = Arc::new(MemoryRecordStore::new());
    let store = AllocationStore::load(records.clone(), pool).await.unwrap();
    (records, store)
}

async fn assert_index_consistent(store: &AllocationStore) {
    let snapshot = store.snapshot().await;
    let rebuilt = PortIndex::rebuild(&snapshot).unwrap();
    assert_eq!(store.index().await, rebuilt);
}

#[tokio::test]
async fn first_fit_reuses_freed_address() {
    let (_, store) = memory_store(two_address_pool()).await;

    let a = store.allocate(&key("a"), &[80]).await.unwrap();
    assert_eq!(a.address, Ipv4Addr::new(10, 1, 1, 55));

    let b = store.allocate(&key("b"), &[80]).await.unwrap();
    assert_eq!(b.address, Ipv4Addr::new(10, 1, 1, 56));

    store.release(&key("a")).await.unwrap();

    let c = store.allocate(&key("c"), &[443]).await.unwrap();
    assert_eq!(c.address, Ipv4Addr::new(10, 1, 1, 55));

    assert_index_consistent(&store).await;
}

#[tokio::test]
async fn exhausted_pool_reports_no_capacity_without_partial_state() {
    let (records, store) = memory_store(two_address_pool()).await;
    store.allocate(&key("a"), &[80]).await.unwrap();
    store.allocate(&key("b"), &[80]).await.unwrap();
    let writes = records.put_count();

    let err = store.allocate(&key("d"), &[80]).await.unwrap_err();
    assert_eq!(
        err,
        AllocError::NoCapacity {
            owner: key("d"),
            ports: vec![80]
        }
    );

    assert_eq!(store.get(&key("d")).await, None);
    assert_eq!(records.put_count(), writes);
    assert_index_consistent(&store).await;
}

#[rstest]
#[case::disjoint_ports_share_address(&[80], &[443], true)]
#[case::overlapping_ports_split(&[80, 443], &[443, 8443], false)]
#[case::identical_ports_split(&[53], &[53], false)]
#[tokio::test]
async fn port_sets_decide_address_sharing(
    #[case] first: &[u16],
    #[case] second: &[u16],
    #[case] shared: bool,
) {
    let (_, store) = memory_store(two_address_pool()).await;
    let a = store.allocate(&key("a"), first).await.unwrap();
    let b = store.allocate(&key("b"), second).await.unwrap();

    assert_eq!(a.address == b.address, shared);
    assert_index_consistent(&store).await;
}

#[tokio::test]
async fn same_owner_gets_identical_allocation() {
    let (_, store) = memory_store(two_address_pool()).await;
    let first = store.allocate(&key("a"), &[80, 443]).await.unwrap();
    let second = store.allocate(&key("a"), &[443, 80]).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(store.snapshot().await.len(), 1);
}

#[tokio::test]
async fn releasing_unknown_owner_changes_nothing() {
    let (records, store) = memory_store(two_address_pool()).await;
    store.allocate(&key("a"), &[80]).await.unwrap();
    let before = store.snapshot().await;
    let writes = records.put_count();

    assert_eq!(store.release(&key("nobody")).await.unwrap(), None);

    assert_eq!(store.snapshot().await, before);
    assert_eq!(records.put_count(), writes);
}

#[tokio::test]
async fn persist_failure_rolls_back_allocation() {
    let (records, store) = memory_store(two_address_pool()).await;
    records.fail_puts(true);

    let err = store.allocate(&key("a"), &[80]).await.unwrap_err();
    assert!(matches!(err, AllocError::Persist(_)));
    assert!(err.is_transient());

    assert_eq!(store.get(&key("a")).await, None);
    assert!(store.index().await.is_empty());
    assert_eq!(records.contents(ALLOCATIONS_KEY).await, None);

    records.fail_puts(false);
    let a = store.allocate(&key("a"), &[80]).await.unwrap();
    assert_eq!(a.address, Ipv4Addr::new(10, 1, 1, 55));
}

#[tokio::test]
async fn allocations_survive_restart_on_disk() {
    let dir = tempfile::tempdir().unwrap();

    {
        let records: Arc<dyn RecordStore> = Arc::new(FileRecordStore::open(dir.path()).await.unwrap());
        let store = AllocationStore::load(records, two_address_pool()).await.unwrap();
        store.allocate(&key("b"), &[80]).await.unwrap();
        store.allocate(&key("a"), &[443]).await.unwrap();
    }

    let records: Arc<dyn RecordStore> = Arc::new(FileRecordStore::open(dir.path()).await.unwrap());
    let raw = records.get(ALLOCATIONS_KEY).await.unwrap().unwrap();
    let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    assert_eq!(json[0]["ownerName"], "a");
    assert_eq!(json[1]["ownerName"], "b");

    let store = AllocationStore::load(records, two_address_pool()).await.unwrap();
    assert_eq!(store.snapshot().await.len(), 2);
    assert_eq!(
        store.allocated_addresses().await,
        vec![Ipv4Addr::new(10, 1, 1, 55)]
    );
    assert_index_consistent(&store).await;

    // The restored index still blocks conflicting claims.
    let c = store.allocate(&key("c"), &[80]).await.unwrap();
    assert_eq!(c.address, Ipv4Addr::new(10, 1, 1, 56));
}

#[tokio::test]
async fn corrupt_record_is_fatal_on_load() {
    let records = Arc::new(MemoryRecordStore::with_record(ALLOCATIONS_KEY, "not json"));
    let result = AllocationStore::load(records, two_address_pool()).await;
    assert!(matches!(result, Err(AllocError::Corrupt(_))));
}

#[derive(Debug, Clone)]
enum Op {
    Allocate(u8, Vec<u16>),
    Release(u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..6, prop::collection::vec(prop::sample::select(vec![53u16, 80, 443, 8080]), 1..3))
            .prop_map(|(owner, ports)| Op::Allocate(owner, ports)),
        (0u8..6).prop_map(Op::Release),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn index_matches_rebuild_after_every_operation(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let pool = parse_pool("10.9.0.1-10.9.0.3").unwrap();
            let (_, store) = memory_store(pool).await;

            for op in ops {
                match op {
                    Op::Allocate(owner, ports) => {
                        let owner = key(&format!("svc-{owner}"));
                        match store.allocate(&owner, &ports).await {
                            Ok(allocation) => assert_eq!(store.get(&owner).await, Some(allocation)),
                            Err(AllocError::NoCapacity { .. }) => assert_eq!(store.get(&owner).await, None),
                            Err(e) => panic!("unexpected error {e}"),
                        }
                    }
                    Op::Release(owner) => {
                        store.release(&key(&format!("svc-{owner}"))).await.unwrap();
                    }
                }

                assert_index_consistent(&store).await;
            }
        });
    }
}
