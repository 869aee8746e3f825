use crate::{
    Applier, ApplyBatch, ApplyError, ApplyMode, Config, ErrorKind, IpSetError, IpSetManager,
    ReferenceKind,
};
use ahash::AHashMap as HashMap;
use maplit::hashmap;
use npm_dataplane_core::{hashed_name, pod_key, SetMetadata, SetType, TranslatedIpSet};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Clone, Default)]
struct FakeApplier {
    applied: Arc<Mutex<Vec<ApplyBatch>>>,
    fail_next: Arc<Mutex<Option<ApplyError>>>,
    resets: Arc<Mutex<usize>>,
}

struct TestConfig {
    mgr: IpSetManager<FakeApplier>,
    applier: FakeApplier,
    _tracing: tracing::subscriber::DefaultGuard,
}

impl Applier for FakeApplier {
    fn apply(&self, batch: &ApplyBatch) -> Result<(), ApplyError> {
        if let Some(err) = self.fail_next.lock().take() {
            return Err(err);
        }
        self.applied.lock().push(batch.clone());
        Ok(())
    }

    fn reset(&self) -> Result<(), ApplyError> {
        *self.resets.lock() += 1;
        Ok(())
    }
}

impl TestConfig {
    fn new(mode: ApplyMode) -> Self {
        let _tracing = Self::init_tracing();
        let applier = FakeApplier::default();
        let mgr = IpSetManager::new(
            Config {
                mode,
                network_name: "azure".to_string(),
            },
            applier.clone(),
        );
        Self {
            mgr,
            applier,
            _tracing,
        }
    }

    fn init_tracing() -> tracing::subscriber::DefaultGuard {
        tracing::subscriber::set_default(
            tracing_subscriber::fmt()
                .with_test_writer()
                .with_max_level(tracing::Level::TRACE)
                .finish(),
        )
    }

    fn last_batch(&self) -> ApplyBatch {
        self.applier
            .applied
            .lock()
            .last()
            .expect("an apply should have happened")
            .clone()
    }
}

fn ns(name: &str) -> SetMetadata {
    SetMetadata::new(name, SetType::Namespace)
}

fn podlabel(name: &str) -> SetMetadata {
    SetMetadata::new(name, SetType::KeyValueLabelOfPod)
}

fn nested(name: &str) -> SetMetadata {
    SetMetadata::new(name, SetType::NestedLabelOfPod)
}

#[test]
fn simple_hash_set_lifecycle() {
    let test = TestConfig::new(ApplyMode::ApplyAll);
    test.mgr.create_ipsets(&[ns("a")]);
    test.mgr
        .add_to_sets(&[ns("a")], "10.0.0.1", &pod_key("a", "x"))
        .unwrap();
    test.mgr
        .add_to_sets(&[ns("a")], "10.0.0.2", &pod_key("a", "y"))
        .unwrap();

    test.mgr.apply_ipsets().unwrap();
    assert!(!test.mgr.has_pending_changes());

    let batch = test.last_batch();
    assert!(batch.to_destroy.is_empty());
    assert_eq!(batch.to_add_or_update.len(), 1);
    let delta = &batch.to_add_or_update[0];
    assert_eq!(delta.name, "ns-a");
    assert_eq!(delta.hashed_name, hashed_name("ns-a"));
    assert!(delta.create);
    assert_eq!(delta.members_to_add, vec!["10.0.0.1", "10.0.0.2"]);
    assert!(delta.members_to_delete.is_empty());
    assert_eq!(delta.desired_members, vec!["10.0.0.1", "10.0.0.2"]);
}

#[test]
fn pod_key_override_on_re_add() {
    let test = TestConfig::new(ApplyMode::ApplyAll);
    test.mgr
        .add_to_sets(&[ns("a")], "10.0.0.1", &pod_key("a", "x"))
        .unwrap();
    test.mgr.apply_ipsets().unwrap();

    test.mgr
        .add_to_sets(&[ns("a")], "10.0.0.1", &pod_key("a", "y"))
        .unwrap();
    let set = test.mgr.get_ipset("ns-a").unwrap();
    assert_eq!(set.pod_key_of("10.0.0.1"), Some("a/y"));

    // At most an idempotent re-add may be pending.
    test.mgr.apply_ipsets().unwrap();
    let batch = test.last_batch();
    assert!(batch.to_destroy.is_empty());
    if let Some(delta) = batch.to_add_or_update.first() {
        assert!(!delta.create);
        assert_eq!(delta.members_to_add, vec!["10.0.0.1"]);
        assert!(delta.members_to_delete.is_empty());
    }
}

#[test]
fn stale_delete_is_ignored() {
    let test = TestConfig::new(ApplyMode::ApplyAll);
    test.mgr
        .add_to_sets(&[ns("a")], "10.0.0.1", &pod_key("a", "y"))
        .unwrap();
    test.mgr.apply_ipsets().unwrap();

    test.mgr
        .remove_from_sets(&[ns("a")], "10.0.0.1", &pod_key("a", "x"))
        .unwrap();
    let set = test.mgr.get_ipset("ns-a").unwrap();
    assert_eq!(set.pod_key_of("10.0.0.1"), Some("a/y"));
    assert!(!test.mgr.has_pending_changes());
}

#[test]
fn list_update_propagates_kernel_refcounts() {
    let test = TestConfig::new(ApplyMode::ApplyOnNeed);
    test.mgr.create_ipsets(&[ns("a"), ns("b"), nested("x")]);
    assert!(!test.mgr.has_pending_changes());

    test.mgr
        .add_reference("nestedlabel-x", "netpol-1", ReferenceKind::NetPol)
        .unwrap();
    test.mgr
        .add_to_lists(&[nested("x")], &[ns("a"), ns("b")])
        .unwrap();

    test.mgr.apply_ipsets().unwrap();
    let batch = test.last_batch();
    assert_eq!(batch.to_add_or_update.len(), 3);
    assert!(batch.to_add_or_update.iter().all(|d| d.create));

    let list = batch
        .to_add_or_update
        .iter()
        .find(|d| d.name == "nestedlabel-x")
        .unwrap();
    let mut expected = vec![hashed_name("ns-a"), hashed_name("ns-b")];
    expected.sort_unstable();
    assert_eq!(list.members_to_add, expected);

    for name in ["ns-a", "ns-b"] {
        let set = test.mgr.get_ipset(name).unwrap();
        assert_eq!(set.kernel_ref_count(), 1, "{name}");
        assert_eq!(set.ipset_ref_count(), 1, "{name}");
    }
}

#[test]
fn delete_reference_tears_down_list_and_members() {
    let test = TestConfig::new(ApplyMode::ApplyOnNeed);
    test.mgr.create_ipsets(&[ns("a"), ns("b"), nested("x")]);
    test.mgr
        .add_reference("nestedlabel-x", "netpol-1", ReferenceKind::NetPol)
        .unwrap();
    test.mgr
        .add_to_lists(&[nested("x")], &[ns("a"), ns("b")])
        .unwrap();
    test.mgr.apply_ipsets().unwrap();

    test.mgr
        .delete_reference("nestedlabel-x", "netpol-1", ReferenceKind::NetPol)
        .unwrap();
    assert_eq!(test.mgr.pending_counts(), (0, 3));

    test.mgr.apply_ipsets().unwrap();
    let batch = test.last_batch();
    let mut destroyed: Vec<&str> = batch.to_destroy.iter().map(|d| d.name.as_str()).collect();
    destroyed.sort_unstable();
    assert_eq!(destroyed, vec!["nestedlabel-x", "ns-a", "ns-b"]);

    // The entities stay tracked; only the kernel copies are gone.
    for name in ["nestedlabel-x", "ns-a", "ns-b"] {
        assert!(test.mgr.get_ipset(name).is_some(), "{name}");
    }
    assert_eq!(test.mgr.get_ipset("ns-a").unwrap().kernel_ref_count(), 0);
}

#[test]
fn destroy_then_recreate_lands_in_update() {
    let test = TestConfig::new(ApplyMode::ApplyAll);
    test.mgr.create_ipsets(&[ns("a")]);
    test.mgr.apply_ipsets().unwrap();

    test.mgr.delete_ipset("ns-a");
    assert!(test.mgr.get_ipset("ns-a").is_none());
    assert_eq!(test.mgr.pending_counts(), (0, 1));

    test.mgr.create_ipsets(&[ns("a")]);
    // Back in the update partition, not create and not destroy.
    assert_eq!(test.mgr.pending_counts(), (1, 0));

    test.mgr.apply_ipsets().unwrap();
    let batch = test.last_batch();
    assert!(batch.to_destroy.is_empty());
    assert_eq!(batch.to_add_or_update.len(), 1);
    assert!(!batch.to_add_or_update[0].create);
}

#[test]
fn delete_of_used_set_is_a_silent_noop() {
    let test = TestConfig::new(ApplyMode::ApplyAll);
    test.mgr
        .add_to_sets(&[ns("a")], "10.0.0.1", &pod_key("a", "x"))
        .unwrap();
    test.mgr.delete_ipset("ns-a");
    assert!(test.mgr.get_ipset("ns-a").is_some());

    // And again once a list holds it.
    test.mgr.create_ipsets(&[nested("x")]);
    test.mgr.add_to_lists(&[nested("x")], &[ns("b")]).unwrap();
    test.mgr.delete_ipset("ns-b");
    assert!(test.mgr.get_ipset("ns-b").is_some());
}

#[test]
fn create_in_on_need_mode_stays_out_of_kernel() {
    let test = TestConfig::new(ApplyMode::ApplyOnNeed);
    test.mgr
        .add_to_sets(&[ns("a")], "10.0.0.1", &pod_key("a", "x"))
        .unwrap();
    assert!(!test.mgr.has_pending_changes());

    test.mgr
        .add_reference("ns-a", "policy-1", ReferenceKind::Selector)
        .unwrap();
    assert_eq!(test.mgr.pending_counts(), (1, 0));

    test.mgr.apply_ipsets().unwrap();
    let batch = test.last_batch();
    assert_eq!(batch.to_add_or_update.len(), 1);
    let delta = &batch.to_add_or_update[0];
    assert!(delta.create);
    // Entering the kernel seeds the diff with the current members.
    assert_eq!(delta.members_to_add, vec!["10.0.0.1"]);
}

#[test]
fn reference_validation() {
    let test = TestConfig::new(ApplyMode::ApplyOnNeed);
    assert!(matches!(
        test.mgr
            .add_reference("ns-a", "policy-1", ReferenceKind::Selector),
        Err(IpSetError::SetDoesNotExist(_))
    ));

    test.mgr
        .create_ipsets(&[SetMetadata::new("blocked", SetType::CidrBlocks)]);
    assert!(matches!(
        test.mgr
            .add_reference("cidr-blocked", "policy-1", ReferenceKind::Selector),
        Err(IpSetError::NotSelectorEligible { .. })
    ));
    // A rule reference on the same set is fine.
    test.mgr
        .add_reference("cidr-blocked", "policy-1", ReferenceKind::NetPol)
        .unwrap();

    assert!(matches!(
        test.mgr
            .delete_reference("ns-missing", "policy-1", ReferenceKind::NetPol),
        Err(IpSetError::SetDoesNotExist(_))
    ));
}

#[test]
fn add_to_sets_validation_leaves_state_unchanged() {
    let test = TestConfig::new(ApplyMode::ApplyAll);
    assert!(matches!(
        test.mgr
            .add_to_sets(&[nested("x")], "10.0.0.1", &pod_key("a", "x")),
        Err(IpSetError::KindMismatch { .. })
    ));
    assert!(matches!(
        test.mgr
            .add_to_sets(&[ns("a")], "not-an-ip", &pod_key("a", "x")),
        Err(IpSetError::InvalidMember { .. })
    ));
    assert_eq!(test.mgr.num_sets(), 0);
    assert!(!test.mgr.has_pending_changes());
}

#[test]
fn lists_of_lists_are_rejected() {
    let test = TestConfig::new(ApplyMode::ApplyAll);
    assert!(matches!(
        test.mgr.add_to_lists(&[nested("x")], &[nested("y")]),
        Err(IpSetError::NestedList(_))
    ));
    assert!(matches!(
        test.mgr.remove_from_list(&nested("missing"), &[ns("a")]),
        Err(IpSetError::SetDoesNotExist(_))
    ));
}

#[test]
fn remove_from_list_unwinds_refcounts() {
    let test = TestConfig::new(ApplyMode::ApplyOnNeed);
    test.mgr.create_ipsets(&[nested("x")]);
    test.mgr
        .add_reference("nestedlabel-x", "netpol-1", ReferenceKind::NetPol)
        .unwrap();
    test.mgr
        .add_to_lists(&[nested("x")], &[ns("a"), ns("b")])
        .unwrap();
    test.mgr.apply_ipsets().unwrap();

    test.mgr
        .remove_from_list(&nested("x"), &[ns("a")])
        .unwrap();
    let a = test.mgr.get_ipset("ns-a").unwrap();
    assert_eq!(a.ipset_ref_count(), 0);
    assert_eq!(a.kernel_ref_count(), 0);
    assert!(!test
        .mgr
        .get_ipset("nestedlabel-x")
        .unwrap()
        .contains_member("ns-a"));

    test.mgr.apply_ipsets().unwrap();
    let batch = test.last_batch();
    // The member set leaves the kernel with the unlink.
    assert_eq!(batch.to_destroy.len(), 1);
    assert_eq!(batch.to_destroy[0].name, "ns-a");
    let list = &batch.to_add_or_update[0];
    assert_eq!(list.name, "nestedlabel-x");
    assert_eq!(list.members_to_delete, vec![hashed_name("ns-a")]);
    assert!(list.members_to_add.is_empty());
}

#[test]
fn selector_intersection_of_hash_sets() {
    let test = TestConfig::new(ApplyMode::ApplyAll);
    test.mgr
        .add_to_sets(&[ns("a"), podlabel("app:web")], "10.0.0.1", "a/x")
        .unwrap();
    test.mgr
        .add_to_sets(&[ns("a")], "10.0.0.2", "a/y")
        .unwrap();
    test.mgr
        .add_to_sets(&[podlabel("app:web")], "10.0.0.3", "b/z")
        .unwrap();

    // A single hash set yields its own member map.
    let ips = test
        .mgr
        .get_ips_from_selector_ipsets(&["ns-a".to_string()])
        .unwrap();
    let expected: HashMap<String, String> = hashmap! {
        "10.0.0.1".to_string() => "a/x".to_string(),
        "10.0.0.2".to_string() => "a/y".to_string(),
    }
    .into_iter()
    .collect();
    assert_eq!(ips, expected);

    let ips = test
        .mgr
        .get_ips_from_selector_ipsets(&["ns-a".to_string(), "podlabel-app:web".to_string()])
        .unwrap();
    let expected: HashMap<String, String> = hashmap! {
        "10.0.0.1".to_string() => "a/x".to_string(),
    }
    .into_iter()
    .collect();
    assert_eq!(ips, expected);
}

#[test]
fn selector_intersection_with_list_base() {
    let test = TestConfig::new(ApplyMode::ApplyAll);
    test.mgr
        .add_to_sets(&[podlabel("app:web")], "10.0.0.1", "a/x")
        .unwrap();
    test.mgr
        .add_to_sets(&[podlabel("app:api")], "10.0.0.2", "a/y")
        .unwrap();
    test.mgr
        .add_to_lists(&[nested("app")], &[podlabel("app:web"), podlabel("app:api")])
        .unwrap();
    test.mgr.add_to_sets(&[ns("a")], "10.0.0.1", "a/x").unwrap();

    // A list base scans the union of its members.
    let ips = test
        .mgr
        .get_ips_from_selector_ipsets(&["nestedlabel-app".to_string()])
        .unwrap();
    assert_eq!(ips.len(), 2);

    let ips = test
        .mgr
        .get_ips_from_selector_ipsets(&["nestedlabel-app".to_string(), "ns-a".to_string()])
        .unwrap();
    let expected: HashMap<String, String> = hashmap! {
        "10.0.0.1".to_string() => "a/x".to_string(),
    }
    .into_iter()
    .collect();
    assert_eq!(ips, expected);
}

#[test]
fn selector_intersection_validation() {
    let test = TestConfig::new(ApplyMode::ApplyAll);
    assert!(matches!(
        test.mgr
            .get_ips_from_selector_ipsets(&["ns-missing".to_string()]),
        Err(IpSetError::SetDoesNotExist(_))
    ));

    test.mgr
        .create_ipsets(&[SetMetadata::new("blocked", SetType::CidrBlocks)]);
    assert!(matches!(
        test.mgr
            .get_ips_from_selector_ipsets(&["cidr-blocked".to_string()]),
        Err(IpSetError::NotSelectorEligible { .. })
    ));

    assert!(test
        .mgr
        .get_ips_from_selector_ipsets(&[])
        .unwrap()
        .is_empty());
}

#[test]
fn failed_apply_retains_pending_changes() {
    let test = TestConfig::new(ApplyMode::ApplyAll);
    test.mgr
        .add_to_sets(&[ns("a")], "10.0.0.1", &pod_key("a", "x"))
        .unwrap();

    *test.applier.fail_next.lock() = Some(ApplyError::new(
        ErrorKind::Fatal,
        "restore failed after 5 tries",
    ));
    let err = test.mgr.apply_ipsets().unwrap_err();
    assert!(matches!(err, IpSetError::Apply(ref e) if e.kind() == ErrorKind::Fatal));
    assert!(test.mgr.has_pending_changes());

    // A later apply retries the same batch from scratch.
    test.mgr.apply_ipsets().unwrap();
    assert!(!test.mgr.has_pending_changes());
    let batch = test.last_batch();
    assert_eq!(batch.to_add_or_update[0].members_to_add, vec!["10.0.0.1"]);
}

#[test]
fn apply_without_changes_skips_the_applier() {
    let test = TestConfig::new(ApplyMode::ApplyAll);
    test.mgr.apply_ipsets().unwrap();
    assert!(test.applier.applied.lock().is_empty());
}

#[test]
fn reset_clears_model_and_kernel() {
    let test = TestConfig::new(ApplyMode::ApplyAll);
    test.mgr
        .add_to_sets(&[ns("a")], "10.0.0.1", &pod_key("a", "x"))
        .unwrap();
    test.mgr.reset_ipsets().unwrap();
    assert_eq!(test.mgr.num_sets(), 0);
    assert!(!test.mgr.has_pending_changes());
    assert_eq!(*test.applier.resets.lock(), 1);
}

#[test]
fn translated_sets_are_ingested() {
    let test = TestConfig::new(ApplyMode::ApplyAll);
    let translated = vec![
        TranslatedIpSet::with_members(
            SetMetadata::new("allowed", SetType::CidrBlocks),
            ["10.0.0.0/24", "10.0.1.0/28 nomatch"],
        ),
        TranslatedIpSet::with_members(
            SetMetadata::new("app", SetType::NestedLabelOfPod),
            ["podlabel-app:web", "podlabel-app:api"],
        ),
    ];
    test.mgr.add_translated_sets(&translated).unwrap();

    let cidr = test.mgr.get_ipset("cidr-allowed").unwrap();
    assert!(cidr.contains_member("10.0.0.0/24"));
    assert!(cidr.contains_member("10.0.1.0/28 nomatch"));

    let list = test.mgr.get_ipset("nestedlabel-app").unwrap();
    assert!(list.contains_member("podlabel-app:web"));
    assert_eq!(
        test.mgr
            .get_ipset("podlabel-app:web")
            .unwrap()
            .ipset_ref_count(),
        1
    );

    let bad = vec![TranslatedIpSet::with_members(
        SetMetadata::new("app", SetType::NestedLabelOfPod),
        ["not-a-prefixed-name"],
    )];
    assert!(matches!(
        test.mgr.add_translated_sets(&bad),
        Err(IpSetError::UnknownMemberName(_))
    ));
}
