//! End-to-end propagation passes against a migrated SQLite database.

mod helpers;

use helpers::{docs_plan, grant_snapshot, Audit, ColumnRuleBuilder, PropagationRuleBuilder, TestDb};
use permsync::authz::{user_has_all_permissions, RequiredPermission};
use permsync::engine::{ensure_owner_permissions, run_pass, RuleOutcome};
use permsync::grants::{self, PermissionTarget};
use permsync::rules::{compile_rules, Rule, RuleConfig};
use permsync::{cursors, entities};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter};
use serde_json::json;
use std::collections::BTreeSet;

fn compile(configs: &[RuleConfig]) -> Vec<Rule> {
    compile_rules(configs, &docs_plan()).expect("Failed to compile rules")
}

fn approvers_rule(name: &str) -> RuleConfig {
    ColumnRuleBuilder::new(name)
        .when("status", "approved", "approvers")
        .build()
}

fn require(spec: &str) -> RequiredPermission {
    RequiredPermission::parse(spec).expect("Invalid permission")
}

async fn group_sources(
    db: &DatabaseConnection,
    group: &str,
    target: &PermissionTarget,
    permission: &str,
) -> BTreeSet<String> {
    let Some(group_id) = grants::find_group(db, group).await.unwrap() else {
        return BTreeSet::new();
    };
    let Some(permission_id) = grants::find_permission(db, target, permission).await.unwrap() else {
        return BTreeSet::new();
    };
    grants::group_permission_sources(db, group_id, permission_id)
        .await
        .unwrap()
        .unwrap_or_default()
}

fn doc(key: &str) -> PermissionTarget {
    PermissionTarget::instance("docs", "document", key)
}

#[tokio::test]
async fn test_approve_then_reject_document() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    let rules = compile(&[approvers_rule("R1")]);
    let tag = rules[0].source_tag();
    assert!(tag.starts_with("generated:R1:"));

    let documents = Audit::new(db, "docs", "documents");
    documents.insert(json!({"id": 7, "status": "approved"})).await;
    run_pass(db, &rules, 100).await.unwrap();

    assert!(grants::find_group(db, "approvers").await.unwrap().is_some());
    assert_eq!(
        group_sources(db, "approvers", &doc("7"), "view").await,
        BTreeSet::from([tag.clone()])
    );

    documents
        .update(json!({"id": 7, "status": "approved"}), json!({"status": "rejected"}))
        .await;
    run_pass(db, &rules, 100).await.unwrap();

    assert!(group_sources(db, "approvers", &doc("7"), "view").await.is_empty());
    assert!(entities::GroupPermission::find().all(db).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_replay_is_idempotent() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    let rules = compile(&[
        ColumnRuleBuilder::new("teams")
            .prefixed("team", "team-")
            .permissions(&["view", "update"])
            .assign_group("created_by")
            .build(),
    ]);

    let documents = Audit::new(db, "docs", "documents");
    documents.insert(json!({"id": 1, "team": "a", "created_by": "alice"})).await;
    documents.insert(json!({"id": 2, "team": "b", "created_by": "bob"})).await;
    documents
        .update(json!({"id": 2, "team": "b", "created_by": "bob"}), json!({"team": "a"}))
        .await;
    run_pass(db, &rules, 100).await.unwrap();
    let once = grant_snapshot(db).await;
    assert!(!once.is_empty());

    // Rewind every cursor and replay the whole trail again
    entities::PermissionCursor::update_many()
        .col_expr(entities::permission_cursor::Column::LastEvent, Expr::value(0))
        .exec(db)
        .await
        .unwrap();
    run_pass(db, &rules, 100).await.unwrap();

    assert_eq!(grant_snapshot(db).await, once);
}

#[tokio::test]
async fn test_source_independence() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    let both = compile(&[approvers_rule("A"), approvers_rule("B")]);

    Audit::new(db, "docs", "documents")
        .insert(json!({"id": 3, "status": "approved"}))
        .await;
    run_pass(db, &both, 100).await.unwrap();

    let group = grants::find_group(db, "approvers").await.unwrap().unwrap();
    grants::add_membership(db, "carol", group).await.unwrap();
    assert_eq!(group_sources(db, "approvers", &doc("3"), "view").await.len(), 2);

    // Retract A: B still justifies the grant
    let only_b = compile(&[approvers_rule("B")]);
    run_pass(db, &only_b, 100).await.unwrap();
    assert_eq!(
        group_sources(db, "approvers", &doc("3"), "view").await,
        BTreeSet::from([only_b[0].source_tag()])
    );
    assert!(user_has_all_permissions(db, "carol", &[require("docs.document:view/3")])
        .await
        .unwrap());

    // Retract B as well
    let none = compile(&[]);
    run_pass(db, &none, 100).await.unwrap();
    assert!(group_sources(db, "approvers", &doc("3"), "view").await.is_empty());
    assert!(!user_has_all_permissions(db, "carol", &[require("docs.document:view/3")])
        .await
        .unwrap());
}

#[tokio::test]
async fn test_cursor_is_monotonic_and_tracks_last_event() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    let rules = compile(&[approvers_rule("R1")]);
    let documents = Audit::new(db, "docs", "documents");
    let folders = Audit::new(db, "docs", "folders");

    let mut previous = 0;
    for round in 0..3 {
        let last = documents
            .insert(json!({"id": round, "status": "approved"}))
            .await;
        // Unwatched by R1
        folders.insert(json!({"id": round})).await;

        run_pass(db, &rules, 2).await.unwrap();
        let cursor = cursors::cursor_for(db, "R1").await.unwrap();
        assert!(cursor >= previous);
        assert_eq!(cursor, last);
        previous = cursor;
    }

    // No new events: nothing moves
    let report = run_pass(db, &rules, 2).await.unwrap();
    assert_eq!(report.events_applied, 0);
    assert_eq!(cursors::cursor_for(db, "R1").await.unwrap(), previous);
}

#[tokio::test]
async fn test_owner_permissions_are_immediate() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();

    ensure_owner_permissions(db, "docs", "document", "alice", &["10".to_string(), "11".to_string()])
        .await
        .unwrap();

    // No pass has run
    for permission in ["view", "update", "delete"] {
        let required = require(&format!("docs.document:{permission}/10,11"));
        assert!(user_has_all_permissions(db, "alice", &[required]).await.unwrap());
    }
    assert!(!user_has_all_permissions(db, "bob", &[require("docs.document:view/10")])
        .await
        .unwrap());

    // Owner grants survive sweeps
    let rules = compile(&[]);
    run_pass(db, &rules, 100).await.unwrap();
    assert!(user_has_all_permissions(db, "alice", &[require("docs.document:delete/11")])
        .await
        .unwrap());

    // Deleting the instance removes them
    Audit::new(db, "docs", "documents")
        .delete(json!({"id": 10}))
        .await;
    run_pass(db, &rules, 100).await.unwrap();
    assert!(!user_has_all_permissions(db, "alice", &[require("docs.document:view/10")])
        .await
        .unwrap());
    assert!(user_has_all_permissions(db, "alice", &[require("docs.document:view/11")])
        .await
        .unwrap());
}

#[tokio::test]
async fn test_group_change_moves_only_rule_grants() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    let rules = compile(&[
        ColumnRuleBuilder::new("owning-team")
            .prefixed("team", "team-")
            .permissions(&["view", "update"])
            .build(),
        ColumnRuleBuilder::new("reviewing-team")
            .prefixed("reviewer_team", "team-")
            .permissions(&["view"])
            .build(),
    ]);
    let owning = rules[0].source_tag();
    let reviewing = rules[1].source_tag();

    let documents = Audit::new(db, "docs", "documents");
    documents
        .insert(json!({"id": 5, "team": "1", "reviewer_team": "1"}))
        .await;
    run_pass(db, &rules, 100).await.unwrap();
    assert_eq!(
        group_sources(db, "team-1", &doc("5"), "view").await,
        BTreeSet::from([owning.clone(), reviewing.clone()])
    );

    documents
        .update(
            json!({"id": 5, "team": "1", "reviewer_team": "1"}),
            json!({"team": "2"}),
        )
        .await;
    run_pass(db, &rules, 100).await.unwrap();

    // team-1 keeps view through the reviewing rule, loses update
    assert_eq!(
        group_sources(db, "team-1", &doc("5"), "view").await,
        BTreeSet::from([reviewing])
    );
    assert!(group_sources(db, "team-1", &doc("5"), "update").await.is_empty());
    // team-2 gains exactly what the owning rule grants
    assert_eq!(
        group_sources(db, "team-2", &doc("5"), "view").await,
        BTreeSet::from([owning.clone()])
    );
    assert_eq!(
        group_sources(db, "team-2", &doc("5"), "update").await,
        BTreeSet::from([owning])
    );
}

#[tokio::test]
async fn test_config_change_regenerates_and_sweeps() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    let v1 = compile(&[approvers_rule("R1")]);

    Audit::new(db, "docs", "documents")
        .insert(json!({"id": 1, "status": "approved"}))
        .await;
    run_pass(db, &v1, 100).await.unwrap();

    let v2 = compile(&[ColumnRuleBuilder::new("R1")
        .when("status", "approved", "approvers")
        .permissions(&["view", "update"])
        .build()]);
    assert_ne!(v1[0].hash, v2[0].hash);

    let report = run_pass(db, &v2, 100).await.unwrap();
    assert!(report.sweep.untagged >= 1);
    assert_eq!(report.sweep.cursors_deleted, 1);

    let new_tag = BTreeSet::from([v2[0].source_tag()]);
    assert_eq!(group_sources(db, "approvers", &doc("1"), "view").await, new_tag);
    assert_eq!(group_sources(db, "approvers", &doc("1"), "update").await, new_tag);

    let remaining: Vec<_> = cursors::list_cursors(db)
        .await
        .unwrap()
        .into_iter()
        .filter(|c| c.name == "R1")
        .collect();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].config_hash, v2[0].hash);
    assert!(remaining[0].active);
}

#[tokio::test]
async fn test_group_propagation_follows_memberships() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    let rules = compile(&[PropagationRuleBuilder::new("managers-see-staff")
        .source("managers")
        .target("staff")
        .target("contractors")
        .build()]);

    // Groups missing: the rule waits without moving its cursor
    let report = run_pass(db, &rules, 100).await.unwrap();
    let outcome = &report.rules[0].outcome;
    assert_eq!(outcome, &RuleOutcome::Skipped);

    let managers = grants::ensure_group(db, "managers").await.unwrap();
    let staff = grants::ensure_group(db, "staff").await.unwrap();
    let contractors = grants::ensure_group(db, "contractors").await.unwrap();
    grants::add_membership(db, "alice", managers).await.unwrap();
    grants::add_membership(db, "bob", staff).await.unwrap();
    grants::add_membership(db, "bob", contractors).await.unwrap();
    run_pass(db, &rules, 100).await.unwrap();

    let see_bob = [require("authz.user:view/bob")];
    assert!(user_has_all_permissions(db, "alice", &see_bob).await.unwrap());
    assert!(!user_has_all_permissions(db, "bob", &see_bob).await.unwrap());

    // Still justified by the contractors membership
    grants::remove_membership(db, "bob", staff).await.unwrap();
    run_pass(db, &rules, 100).await.unwrap();
    assert!(user_has_all_permissions(db, "alice", &see_bob).await.unwrap());

    grants::remove_membership(db, "bob", contractors).await.unwrap();
    run_pass(db, &rules, 100).await.unwrap();
    assert!(!user_has_all_permissions(db, "alice", &see_bob).await.unwrap());
}

#[tokio::test]
async fn test_assign_group_adds_and_removes_member() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    let rules = compile(&[ColumnRuleBuilder::new("authors")
        .prefixed("id", "doc-authors-")
        .permissions(&["update"])
        .assign_group("created_by")
        .build()]);

    let documents = Audit::new(db, "docs", "documents");
    documents.insert(json!({"id": 4, "created_by": "dana"})).await;
    run_pass(db, &rules, 100).await.unwrap();
    assert!(user_has_all_permissions(db, "dana", &[require("docs.document:update/4")])
        .await
        .unwrap());

    documents.delete(json!({"id": 4, "created_by": "dana"})).await;
    run_pass(db, &rules, 100).await.unwrap();
    let group = grants::find_group(db, "doc-authors-4").await.unwrap().unwrap();
    assert!(!grants::is_member_of_any(db, "dana", &[group]).await.unwrap());
    assert!(!user_has_all_permissions(db, "dana", &[require("docs.document:update/4")])
        .await
        .unwrap());
}

#[tokio::test]
async fn test_relation_rows_and_indirect_targets() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    let rules = compile(&[
        // Review rows resolve to their parent document
        ColumnRuleBuilder::new("reviewers")
            .when("verdict", "pending", "reviewers")
            .permissions(&["comment"])
            .build(),
        // Folder rows grant on the document they reference
        ColumnRuleBuilder::new("folder-readers")
            .targets("docs", &["folder"])
            .prefixed("audience", "")
            .indirect("docs", "document", "cover_document")
            .build(),
    ]);

    Audit::new(db, "docs", "document_reviews")
        .insert(json!({"id": 99, "document_id": 12, "verdict": "pending"}))
        .await;
    Audit::new(db, "docs", "folders")
        .insert(json!({"id": 1, "audience": "everyone", "cover_document": 13}))
        .await;
    run_pass(db, &rules, 100).await.unwrap();

    assert_eq!(
        group_sources(db, "reviewers", &doc("12"), "comment").await,
        BTreeSet::from([rules[0].source_tag()])
    );
    assert_eq!(
        group_sources(db, "everyone", &doc("13"), "view").await,
        BTreeSet::from([rules[1].source_tag()])
    );
}

#[tokio::test]
async fn test_truncate_strips_rule_from_type() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    let rules = compile(&[
        approvers_rule("R1"),
        ColumnRuleBuilder::new("folders")
            .targets("docs", &["folder"])
            .when("status", "approved", "approvers")
            .build(),
    ]);

    let documents = Audit::new(db, "docs", "documents");
    documents.insert(json!({"id": 1, "status": "approved"})).await;
    documents.insert(json!({"id": 2, "status": "approved"})).await;
    Audit::new(db, "docs", "folders")
        .insert(json!({"id": 1, "status": "approved"}))
        .await;
    run_pass(db, &rules, 100).await.unwrap();

    documents.truncate().await;
    run_pass(db, &rules, 100).await.unwrap();

    for key in ["1", "2"] {
        assert!(group_sources(db, "approvers", &doc(key), "view").await.is_empty());
    }
    let folder = PermissionTarget::instance("docs", "folder", "1");
    assert_eq!(
        group_sources(db, "approvers", &folder, "view").await,
        BTreeSet::from([rules[1].source_tag()])
    );
}

#[tokio::test]
async fn test_assign_group_member_kept_while_another_row_justifies_it() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    let rules = compile(&[ColumnRuleBuilder::new("teams")
        .prefixed("team", "team-")
        .assign_group("created_by")
        .build()]);

    let documents = Audit::new(db, "docs", "documents");
    documents.insert(json!({"id": 1, "team": "a", "created_by": "alice"})).await;
    documents.insert(json!({"id": 2, "team": "a", "created_by": "alice"})).await;
    run_pass(db, &rules, 100).await.unwrap();

    documents.delete(json!({"id": 1, "team": "a", "created_by": "alice"})).await;
    run_pass(db, &rules, 100).await.unwrap();

    let team = grants::find_group(db, "team-a").await.unwrap().unwrap();
    assert!(grants::is_member_of_any(db, "alice", &[team]).await.unwrap());
    assert!(user_has_all_permissions(db, "alice", &[require("docs.document:view/2")])
        .await
        .unwrap());
    assert!(!user_has_all_permissions(db, "alice", &[require("docs.document:view/1")])
        .await
        .unwrap());

    // The edge was created once and has not been removed yet
    let membership_events = permsync::audit::page_events(db, &[grants::membership_table()], 0, 0, 10)
        .await
        .unwrap();
    assert_eq!(membership_events.len(), 1);

    documents.delete(json!({"id": 2, "team": "a", "created_by": "alice"})).await;
    run_pass(db, &rules, 100).await.unwrap();
    assert!(!grants::is_member_of_any(db, "alice", &[team]).await.unwrap());
}

#[tokio::test]
async fn test_stale_rule_releases_its_memberships() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    let rules = compile(&[ColumnRuleBuilder::new("teams")
        .prefixed("team", "team-")
        .assign_group("created_by")
        .build()]);

    Audit::new(db, "docs", "documents")
        .insert(json!({"id": 1, "team": "a", "created_by": "alice"}))
        .await;
    run_pass(db, &rules, 100).await.unwrap();
    let team = grants::find_group(db, "team-a").await.unwrap().unwrap();
    grants::add_membership(db, "bob", team).await.unwrap();

    let report = run_pass(db, &compile(&[]), 100).await.unwrap();
    assert_eq!(report.sweep.memberships_released, 1);
    assert!(!grants::is_member_of_any(db, "alice", &[team]).await.unwrap());
    // Added by hand, not by the rule
    assert!(grants::is_member_of_any(db, "bob", &[team]).await.unwrap());
}

#[tokio::test]
async fn test_membership_truncate_strips_only_propagation_tag() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    let rules = compile(&[
        PropagationRuleBuilder::new("managers-see-staff")
            .source("managers")
            .target("staff")
            .build(),
        approvers_rule("R1"),
    ]);
    let propagation_tag = rules[0].source_tag();

    let managers = grants::ensure_group(db, "managers").await.unwrap();
    let staff = grants::ensure_group(db, "staff").await.unwrap();
    grants::add_membership(db, "alice", managers).await.unwrap();
    grants::add_membership(db, "bob", staff).await.unwrap();
    ensure_owner_permissions(db, "authz", "user", "bob", &["bob".to_string()])
        .await
        .unwrap();
    Audit::new(db, "docs", "documents")
        .insert(json!({"id": 3, "status": "approved"}))
        .await;
    run_pass(db, &rules, 100).await.unwrap();

    let bob = PermissionTarget::instance("authz", "user", "bob");
    let see_bob = [require("authz.user:view/bob")];
    assert_eq!(
        group_sources(db, "managers", &bob, "view").await,
        BTreeSet::from([propagation_tag])
    );
    assert!(user_has_all_permissions(db, "alice", &see_bob).await.unwrap());

    Audit::new(db, "authz", "group_memberships").truncate().await;
    run_pass(db, &rules, 100).await.unwrap();

    assert!(group_sources(db, "managers", &bob, "view").await.is_empty());
    assert!(!user_has_all_permissions(db, "alice", &see_bob).await.unwrap());
    // Owner and column rule tags are untouched
    assert!(user_has_all_permissions(db, "bob", &see_bob).await.unwrap());
    assert_eq!(
        group_sources(db, "approvers", &doc("3"), "view").await,
        BTreeSet::from([rules[1].source_tag()])
    );
}

#[tokio::test]
async fn test_membership_update_moves_user_between_groups() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    let rules = compile(&[PropagationRuleBuilder::new("managers-see-staff")
        .source("managers")
        .target("staff")
        .build()]);

    let managers = grants::ensure_group(db, "managers").await.unwrap();
    let staff = grants::ensure_group(db, "staff").await.unwrap();
    let visitors = grants::ensure_group(db, "visitors").await.unwrap();
    grants::add_membership(db, "alice", managers).await.unwrap();
    grants::add_membership(db, "bob", staff).await.unwrap();
    run_pass(db, &rules, 100).await.unwrap();

    let see_bob = [require("authz.user:view/bob")];
    assert!(user_has_all_permissions(db, "alice", &see_bob).await.unwrap());

    let memberships = Audit::new(db, "authz", "group_memberships");
    let move_bob = |from: i64, to: i64| async move {
        entities::GroupMembership::update_many()
            .col_expr(entities::group_membership::Column::GroupId, Expr::value(to))
            .filter(entities::group_membership::Column::UserKey.eq("bob"))
            .filter(entities::group_membership::Column::GroupId.eq(from))
            .exec(db)
            .await
            .unwrap();
    };

    // staff -> visitors: bob leaves the only target group
    move_bob(staff, visitors).await;
    memberships
        .update(
            json!({"user_key": "bob", "group_id": staff}),
            json!({"group_id": visitors}),
        )
        .await;
    run_pass(db, &rules, 100).await.unwrap();
    assert!(!user_has_all_permissions(db, "alice", &see_bob).await.unwrap());

    // visitors -> staff: back in
    move_bob(visitors, staff).await;
    memberships
        .update(
            json!({"user_key": "bob", "group_id": visitors}),
            json!({"group_id": staff}),
        )
        .await;
    run_pass(db, &rules, 100).await.unwrap();
    assert!(user_has_all_permissions(db, "alice", &see_bob).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_owner_grants_create_each_permission_once() {
    let test_db = TestDb::new().await;
    let keys: Vec<String> = (0..40).map(|k| k.to_string()).collect();

    let mut writers = Vec::new();
    for _ in 0..4 {
        let db = test_db.connection().clone();
        let keys = keys.clone();
        writers.push(tokio::spawn(async move {
            for key in keys {
                ensure_owner_permissions(&db, "docs", "document", "alice", &[key])
                    .await
                    .unwrap();
            }
        }));
    }
    for writer in writers {
        writer.await.unwrap();
    }

    let db = test_db.connection();
    assert_eq!(entities::Permission::find().count(db).await.unwrap(), 120);
    assert_eq!(entities::UserPermission::find().count(db).await.unwrap(), 120);
    let all_keys = keys.join(",");
    for permission in ["view", "update", "delete"] {
        let required = require(&format!("docs.document:{permission}/{all_keys}"));
        assert!(user_has_all_permissions(db, "alice", &[required]).await.unwrap());
    }
}
