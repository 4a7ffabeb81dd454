//! Convergence tests against the in-memory cluster
//!
//! These tests verify the engine end to end:
//! - Completeness and idempotence of a reconcile
//! - Shrinking a definition removes only what it no longer wants
//! - Shared objects survive until their last owner lets go, and drift on
//!   them is repaired
//! - Out-of-band drift is repaired
//! - Partial failures, conflicts and pre-existing ServiceAccounts

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRole, RoleBinding, Subject};
use kube::ResourceExt;
use rbac_operator::crd::{
    BindingRule, BindingScope, ClusterRoleSpec, NamespaceSelector, PolicyRuleSpec,
    RbacDefinition, RbacDefinitionSpec, RoleRefSpec, ServiceAccountSpec, SubjectSpec,
};
use rbac_operator::engine::{ConvergenceEngine, ReconcileOutcome, ReconcileReport};
use rbac_operator::kinds::{ObjectKey, RbacKind};
use rbac_operator::memory::{MemoryCluster, Operation};
use rbac_operator::ownership::{owners_of, MANAGED_BY_LABEL};
use std::collections::BTreeMap;
use std::sync::Arc;

fn setup() -> (MemoryCluster, ConvergenceEngine<MemoryCluster>) {
    let cluster = MemoryCluster::new();
    let engine = ConvergenceEngine::new(Arc::new(cluster.clone()));
    (cluster, engine)
}

fn edit_rule(namespaces: &[&str]) -> BindingRule {
    BindingRule {
        name: None,
        role_ref: RoleRefSpec {
            kind: "ClusterRole".to_string(),
            name: "edit".to_string(),
        },
        subjects: vec![SubjectSpec {
            kind: "ServiceAccount".to_string(),
            name: "team-a-sa".to_string(),
            namespace: Some("ns1".to_string()),
        }],
        scope: BindingScope {
            namespaces: namespaces.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        },
    }
}

/// One ServiceAccount in ns1, bound to `edit` in each of `namespaces`
fn team_a(namespaces: &[&str]) -> RbacDefinition {
    RbacDefinition::new(
        "team-a",
        RbacDefinitionSpec {
            service_accounts: vec![ServiceAccountSpec {
                name: "team-a-sa".to_string(),
                namespace: "ns1".to_string(),
                ..Default::default()
            }],
            bindings: vec![edit_rule(namespaces)],
            ..Default::default()
        },
    )
}

fn reader_role() -> ClusterRoleSpec {
    ClusterRoleSpec {
        name: "shared-reader".to_string(),
        rules: vec![PolicyRuleSpec {
            api_groups: vec!["".to_string()],
            resources: vec!["pods".to_string()],
            verbs: vec!["get".to_string(), "list".to_string()],
            ..Default::default()
        }],
    }
}

fn with_reader(name: &str) -> RbacDefinition {
    RbacDefinition::new(
        name,
        RbacDefinitionSpec {
            cluster_roles: vec![reader_role()],
            ..Default::default()
        },
    )
}

async fn applied(engine: &ConvergenceEngine<MemoryCluster>, def: &RbacDefinition) -> ReconcileReport {
    match engine.reconcile(&def.id()).await.unwrap() {
        ReconcileOutcome::Applied { report, .. } => report,
        other => panic!("expected Applied, got {:?}", other),
    }
}

fn key(kind: RbacKind, namespace: Option<&str>, name: &str) -> ObjectKey {
    ObjectKey {
        kind,
        namespace: namespace.map(str::to_string),
        name: name.to_string(),
    }
}

#[tokio::test]
async fn test_team_a_end_to_end() {
    let (cluster, engine) = setup();
    let def = cluster.put_definition(team_a(&["ns1", "ns2"])).await;

    let report = applied(&engine, &def).await;
    assert!(report.is_converged());
    assert_eq!(report.desired, 3);
    assert_eq!(report.created.len(), 3);

    let sa = cluster
        .object::<ServiceAccount>(Some("ns1"), "team-a-sa")
        .await
        .expect("ServiceAccount created");
    assert_eq!(
        sa.labels().get(MANAGED_BY_LABEL).map(String::as_str),
        Some("rbac-operator")
    );

    for ns in ["ns1", "ns2"] {
        let rb = cluster
            .object::<RoleBinding>(Some(ns), "team-a-0-0")
            .await
            .unwrap_or_else(|| panic!("RoleBinding in {} created", ns));
        assert_eq!(rb.role_ref.kind, "ClusterRole");
        assert_eq!(rb.role_ref.name, "edit");
        let subjects = rb.subjects.unwrap();
        assert_eq!(subjects.len(), 1);
        assert_eq!(subjects[0].kind, "ServiceAccount");
        assert_eq!(subjects[0].namespace.as_deref(), Some("ns1"));

        let owners = owners_of(&rb.metadata);
        assert_eq!(owners.len(), 1);
        assert!(owners.contains(&def.id()));
    }
}

#[tokio::test]
async fn test_second_reconcile_writes_nothing() {
    let (cluster, engine) = setup();
    let def = cluster.put_definition(team_a(&["ns1", "ns2"])).await;

    applied(&engine, &def).await;
    let writes = cluster.mutations();

    let report = applied(&engine, &def).await;
    assert!(report.is_converged());
    assert_eq!(report.mutations(), 0);
    assert_eq!(cluster.mutations(), writes);
}

#[tokio::test]
async fn test_shrinking_scope_deletes_only_dropped_binding() {
    let (cluster, engine) = setup();
    let def = cluster.put_definition(team_a(&["ns1", "ns2"])).await;
    applied(&engine, &def).await;

    let def = cluster.put_definition(team_a(&["ns1"])).await;
    assert_eq!(def.metadata.generation, Some(2));
    let report = applied(&engine, &def).await;

    assert_eq!(
        report.deleted,
        vec![key(RbacKind::RoleBinding, Some("ns2"), "team-a-0-0")]
    );
    assert!(cluster
        .object::<RoleBinding>(Some("ns2"), "team-a-0-0")
        .await
        .is_none());
    assert!(cluster
        .object::<RoleBinding>(Some("ns1"), "team-a-0-0")
        .await
        .is_some());
    assert!(cluster
        .object::<ServiceAccount>(Some("ns1"), "team-a-sa")
        .await
        .is_some());
}

#[tokio::test]
async fn test_shared_object_survives_until_last_owner_releases() {
    let (cluster, engine) = setup();
    let d1 = cluster.put_definition(with_reader("d1")).await;
    let d2 = cluster.put_definition(with_reader("d2")).await;

    applied(&engine, &d1).await;
    let report = applied(&engine, &d2).await;
    assert!(report.is_converged(), "{:?}", report.failures);

    let role = cluster
        .object::<ClusterRole>(None, "shared-reader")
        .await
        .unwrap();
    assert_eq!(owners_of(&role.metadata).len(), 2);

    // d1 no longer wants the role
    let d1 = cluster
        .put_definition(RbacDefinition::new("d1", RbacDefinitionSpec::default()))
        .await;
    let report = applied(&engine, &d1).await;
    assert_eq!(
        report.released,
        vec![key(RbacKind::ClusterRole, None, "shared-reader")]
    );
    assert!(report.deleted.is_empty());

    let role = cluster
        .object::<ClusterRole>(None, "shared-reader")
        .await
        .expect("still owned by d2");
    let owners = owners_of(&role.metadata);
    assert_eq!(owners.len(), 1);
    assert!(owners.contains(&d2.id()));

    let d2 = cluster
        .put_definition(RbacDefinition::new("d2", RbacDefinitionSpec::default()))
        .await;
    let report = applied(&engine, &d2).await;
    assert_eq!(report.deleted.len(), 1);
    assert!(cluster
        .object::<ClusterRole>(None, "shared-reader")
        .await
        .is_none());
}

#[tokio::test]
async fn test_diverging_shared_object_is_a_conflict() {
    let (cluster, engine) = setup();
    let d1 = cluster.put_definition(with_reader("d1")).await;
    applied(&engine, &d1).await;

    let mut wider = reader_role();
    wider.rules[0].verbs.push("watch".to_string());
    let d2 = cluster
        .put_definition(RbacDefinition::new(
            "d2",
            RbacDefinitionSpec {
                cluster_roles: vec![wider],
                ..Default::default()
            },
        ))
        .await;

    let report = applied(&engine, &d2).await;
    assert_eq!(report.failures.len(), 1);
    assert!(!report.failures[0].retryable);

    let role = cluster
        .object::<ClusterRole>(None, "shared-reader")
        .await
        .unwrap();
    assert_eq!(role.rules.unwrap()[0].verbs, vec!["get", "list"]);
}

#[tokio::test]
async fn test_drift_on_shared_object_is_restored() {
    let (cluster, engine) = setup();
    let d1 = cluster.put_definition(with_reader("d1")).await;
    let d2 = cluster.put_definition(with_reader("d2")).await;
    applied(&engine, &d1).await;
    applied(&engine, &d2).await;

    let mut role = cluster
        .object::<ClusterRole>(None, "shared-reader")
        .await
        .unwrap();
    role.rules.as_mut().unwrap()[0].verbs = vec!["*".to_string()];
    cluster.put_object(role).await;

    let report = applied(&engine, &d1).await;
    assert!(report.is_converged(), "{:?}", report.failures);
    assert_eq!(
        report.updated,
        vec![key(RbacKind::ClusterRole, None, "shared-reader")]
    );

    // the co-owner agrees with the restored content
    let report = applied(&engine, &d2).await;
    assert!(report.is_converged(), "{:?}", report.failures);
    assert_eq!(report.mutations(), 0);

    let role = cluster
        .object::<ClusterRole>(None, "shared-reader")
        .await
        .unwrap();
    assert_eq!(role.rules.unwrap()[0].verbs, vec!["get", "list"]);
    assert_eq!(owners_of(&role.metadata).len(), 2);
}

#[tokio::test]
async fn test_drifted_subjects_are_restored() {
    let (cluster, engine) = setup();
    let def = cluster.put_definition(team_a(&["ns1"])).await;
    applied(&engine, &def).await;

    let mut rb = cluster
        .object::<RoleBinding>(Some("ns1"), "team-a-0-0")
        .await
        .unwrap();
    rb.subjects = Some(vec![Subject {
        kind: "User".to_string(),
        name: "mallory".to_string(),
        api_group: Some("rbac.authorization.k8s.io".to_string()),
        namespace: None,
    }]);
    cluster.put_object(rb).await;

    let report = applied(&engine, &def).await;
    assert_eq!(
        report.updated,
        vec![key(RbacKind::RoleBinding, Some("ns1"), "team-a-0-0")]
    );

    let rb = cluster
        .object::<RoleBinding>(Some("ns1"), "team-a-0-0")
        .await
        .unwrap();
    assert_eq!(rb.subjects.unwrap()[0].name, "team-a-sa");
}

#[tokio::test]
async fn test_changed_role_ref_is_replaced() {
    let (cluster, engine) = setup();
    let def = cluster.put_definition(team_a(&["ns1"])).await;
    applied(&engine, &def).await;

    let mut rb = cluster
        .object::<RoleBinding>(Some("ns1"), "team-a-0-0")
        .await
        .unwrap();
    rb.role_ref.name = "admin".to_string();
    cluster.put_object(rb).await;

    let report = applied(&engine, &def).await;
    assert_eq!(report.replaced.len(), 1);
    let rb = cluster
        .object::<RoleBinding>(Some("ns1"), "team-a-0-0")
        .await
        .unwrap();
    assert_eq!(rb.role_ref.name, "edit");
}

#[tokio::test]
async fn test_deleted_object_is_recreated() {
    let (cluster, engine) = setup();
    let def = cluster.put_definition(team_a(&["ns1", "ns2"])).await;
    applied(&engine, &def).await;

    cluster
        .remove_object::<RoleBinding>(Some("ns2"), "team-a-0-0")
        .await;

    let report = applied(&engine, &def).await;
    assert_eq!(
        report.created,
        vec![key(RbacKind::RoleBinding, Some("ns2"), "team-a-0-0")]
    );
}

#[tokio::test]
async fn test_partial_failure_converges_on_retry() {
    let (cluster, engine) = setup();
    let def = cluster.put_definition(team_a(&["ns1", "ns2"])).await;
    cluster
        .fail_next(Operation::Create, "RoleBinding", "team-a-0-0", 1)
        .await;

    let outcome = engine.reconcile(&def.id()).await.unwrap();
    let error = outcome.error().expect("one binding failed");
    assert!(error.is_retryable());

    let report = outcome.report().unwrap();
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.created.len(), 2);

    let report = applied(&engine, &def).await;
    assert!(report.is_converged());
    assert_eq!(report.created.len(), 1);
    assert_eq!(cluster.objects::<RoleBinding>().await.len(), 2);
}

#[tokio::test]
async fn test_list_failure_does_not_prune() {
    let (cluster, engine) = setup();
    let def = cluster.put_definition(team_a(&["ns1", "ns2"])).await;
    applied(&engine, &def).await;

    let def = cluster.put_definition(team_a(&["ns1"])).await;
    cluster
        .fail_next(Operation::List, "RoleBinding", "*", 1)
        .await;

    let report = applied(&engine, &def).await;
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].name, "*");
    assert!(report.deleted.is_empty());
    assert_eq!(cluster.objects::<RoleBinding>().await.len(), 2);
}

#[tokio::test]
async fn test_pre_existing_service_account_is_left_alone() {
    let (cluster, engine) = setup();
    let mut existing = ServiceAccount::default();
    existing.metadata.name = Some("team-a-sa".to_string());
    existing.metadata.namespace = Some("ns1".to_string());
    existing.automount_service_account_token = Some(false);
    cluster.put_object(existing).await;

    let def = cluster.put_definition(team_a(&["ns1"])).await;
    let report = applied(&engine, &def).await;

    assert!(report.is_converged());
    assert_eq!(
        report.skipped,
        vec![key(RbacKind::ServiceAccount, Some("ns1"), "team-a-sa")]
    );
    assert_eq!(report.managed(), 1);

    let sa = cluster
        .object::<ServiceAccount>(Some("ns1"), "team-a-sa")
        .await
        .unwrap();
    assert!(sa.metadata.owner_references.is_none());
    assert_eq!(sa.automount_service_account_token, Some(false));
}

#[tokio::test]
async fn test_unowned_binding_is_a_conflict() {
    let (cluster, engine) = setup();
    let mut foreign = RoleBinding::default();
    foreign.metadata.name = Some("team-a-0-0".to_string());
    foreign.metadata.namespace = Some("ns1".to_string());
    foreign.role_ref.api_group = "rbac.authorization.k8s.io".to_string();
    foreign.role_ref.kind = "ClusterRole".to_string();
    foreign.role_ref.name = "view".to_string();
    cluster.put_object(foreign).await;

    let def = cluster.put_definition(team_a(&["ns1", "ns2"])).await;
    let outcome = engine.reconcile(&def.id()).await.unwrap();
    assert!(!outcome.error().unwrap().is_retryable());

    let report = outcome.report().unwrap();
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].name, "ns1/team-a-0-0");

    let foreign = cluster
        .object::<RoleBinding>(Some("ns1"), "team-a-0-0")
        .await
        .unwrap();
    assert_eq!(foreign.role_ref.name, "view");
    assert!(cluster
        .object::<RoleBinding>(Some("ns2"), "team-a-0-0")
        .await
        .is_some());
}

#[tokio::test]
async fn test_invalid_definition_applies_nothing() {
    let (cluster, engine) = setup();
    let mut def = team_a(&["ns1"]);
    def.spec.bindings[0].subjects.clear();
    let def = cluster.put_definition(def).await;

    let outcome = engine.reconcile(&def.id()).await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Invalid { .. }));
    assert_eq!(cluster.mutations(), 0);
}

#[tokio::test]
async fn test_deleted_definition_is_absent_and_collected() {
    let (cluster, engine) = setup();
    let def = cluster.put_definition(team_a(&["ns1", "ns2"])).await;
    applied(&engine, &def).await;

    cluster.delete_definition("team-a").await;
    let outcome = engine.reconcile(&def.id()).await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Absent(_)));
    assert!(cluster.objects::<RoleBinding>().await.is_empty());
    assert!(cluster.objects::<ServiceAccount>().await.is_empty());
}

#[tokio::test]
async fn test_namespace_selector_follows_labels() {
    let (cluster, engine) = setup();
    cluster.put_namespace("ns1", &[("team", "a")]).await;
    cluster.put_namespace("ns2", &[("team", "b")]).await;

    let mut def = team_a(&[]);
    def.spec.bindings[0].scope.namespace_selector = Some(NamespaceSelector {
        match_labels: BTreeMap::from([("team".to_string(), "a".to_string())]),
        ..Default::default()
    });
    let def = cluster.put_definition(def).await;

    applied(&engine, &def).await;
    let namespaces = |bindings: Vec<RoleBinding>| -> Vec<String> {
        bindings.iter().filter_map(|rb| rb.namespace()).collect()
    };
    assert_eq!(namespaces(cluster.objects::<RoleBinding>().await), vec!["ns1"]);

    cluster.put_namespace("ns3", &[("team", "a")]).await;
    cluster.put_namespace("ns1", &[("team", "b")]).await;
    let report = applied(&engine, &def).await;

    assert_eq!(report.created.len(), 1);
    assert_eq!(report.deleted.len(), 1);
    assert_eq!(namespaces(cluster.objects::<RoleBinding>().await), vec!["ns3"]);
}
