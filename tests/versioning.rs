//! Version sequencing and default-version rules for tests and suites.

mod common;

use common::{create_suite, create_test, database, project, ACTOR};
use flowrun::storage::{DatabaseError, ParentKind};

#[tokio::test]
async fn test_first_version_is_default() {
    let db = database().await;
    let project = project(&db).await;

    let (test, v1) = create_test(&db, &project, "Login", "Log in with a known account").await;

    assert_eq!(v1.number, 1);
    assert!(v1.is_default);
    assert_eq!(test.kind, ParentKind::Test);

    let default = db.default_version(&test).await.unwrap().unwrap();
    assert_eq!(default.slug, v1.slug);
}

#[tokio::test]
async fn test_edit_appends_new_default_version() {
    let db = database().await;
    let project = project(&db).await;
    let (test, v1) = create_test(&db, &project, "Login", "Log in").await;

    let v2 = db
        .edit_entity(&test, "Login v2", "Log in and check the greeting", ACTOR)
        .await
        .unwrap();

    assert_eq!(v2.number, 2);
    assert!(v2.is_default);

    let versions = db.list_versions(&test).await.unwrap();
    let numbers: Vec<i64> = versions.iter().map(|v| v.number).collect();
    assert_eq!(numbers, vec![2, 1]);
    assert_eq!(versions.iter().filter(|v| v.is_default).count(), 1);

    // The original version is untouched.
    let old = db.get_version(&test, &v1.slug).await.unwrap();
    assert_eq!(old.title, "Login");
    assert_eq!(old.description, "Log in");
    assert!(!old.is_default);
}

#[tokio::test]
async fn test_non_default_version_does_not_move_default() {
    let db = database().await;
    let project = project(&db).await;
    let (test, v1) = create_test(&db, &project, "Search", "Search for shoes").await;

    let draft = db
        .create_version(&test, "Search draft", "Search for boots", ACTOR, false)
        .await
        .unwrap();

    assert_eq!(draft.number, 2);
    assert!(!draft.is_default);
    let default = db.default_version(&test).await.unwrap().unwrap();
    assert_eq!(default.slug, v1.slug);
}

#[tokio::test]
async fn test_set_default_switches_exactly_one() {
    let db = database().await;
    let project = project(&db).await;
    let (test, v1) = create_test(&db, &project, "Cart", "Add an item").await;
    db.edit_entity(&test, "Cart", "Add two items", ACTOR)
        .await
        .unwrap();

    let promoted = db.set_default(&test, &v1.slug).await.unwrap();
    assert!(promoted.is_default);

    let versions = db.list_versions(&test).await.unwrap();
    let defaults: Vec<_> = versions.iter().filter(|v| v.is_default).collect();
    assert_eq!(defaults.len(), 1);
    assert_eq!(defaults[0].slug, v1.slug);
}

#[tokio::test]
async fn test_set_default_unknown_version_changes_nothing() {
    let db = database().await;
    let project = project(&db).await;
    let (test, v1) = create_test(&db, &project, "Cart", "Add an item").await;

    let err = db.set_default(&test, "no-such-version").await.unwrap_err();
    assert!(matches!(err, DatabaseError::NotFound(_)));

    let default = db.default_version(&test).await.unwrap().unwrap();
    assert_eq!(default.slug, v1.slug);
}

#[tokio::test]
async fn test_set_default_rejects_version_of_other_parent() {
    let db = database().await;
    let project = project(&db).await;
    let (first, _) = create_test(&db, &project, "First", "One").await;
    let (_, other_v1) = create_test(&db, &project, "Second", "Two").await;

    let err = db.set_default(&first, &other_v1.slug).await.unwrap_err();
    assert!(matches!(err, DatabaseError::NotFound(_)));
}

#[tokio::test]
async fn test_empty_title_is_rejected() {
    let db = database().await;
    let project = project(&db).await;

    let err = db
        .create_entity(ParentKind::Test, &project, "  ", "desc", ACTOR)
        .await
        .unwrap_err();
    assert!(matches!(err, DatabaseError::Validation(_)));
}

#[tokio::test]
async fn test_deleted_entity_is_hidden() {
    let db = database().await;
    let project = project(&db).await;
    let (test, v1) = create_test(&db, &project, "Checkout", "Pay with card").await;

    db.delete_entity(&test).await.unwrap();

    assert!(matches!(
        db.get_entity(ParentKind::Test, &test.slug).await,
        Err(DatabaseError::NotFound(_))
    ));
    assert!(matches!(
        db.get_version(&test, &v1.slug).await,
        Err(DatabaseError::NotFound(_))
    ));
    assert!(matches!(
        db.delete_entity(&test).await,
        Err(DatabaseError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_entity_lookup_is_scoped_to_project() {
    let db = database().await;
    let web = project(&db).await;
    let mobile = db.create_project("acme", "mobile", "Mobile").await.unwrap();
    let (test, _) = create_test(&db, &web, "Login", "Log in").await;

    assert!(db
        .get_entity_in_project(ParentKind::Test, &web, &test.slug)
        .await
        .is_ok());
    assert!(matches!(
        db.get_entity_in_project(ParentKind::Test, &mobile, &test.slug)
            .await,
        Err(DatabaseError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_suite_edit_carries_bindings() {
    let db = database().await;
    let project = project(&db).await;
    let (login, _) = create_test(&db, &project, "Login", "Log in").await;
    let (search, _) = create_test(&db, &project, "Search", "Search").await;
    let (suite, v1) = create_suite(&db, &project, "Smoke", &[&login, &search]).await;

    let v2 = db
        .edit_entity(&suite, "Smoke (nightly)", "Nightly smoke checks", ACTOR)
        .await
        .unwrap();
    assert_eq!(v2.number, v1.number + 1);

    let bound: Vec<String> = db
        .list_suite_tests(&v2)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.slug)
        .collect();
    assert_eq!(bound, vec![login.slug.clone(), search.slug.clone()]);
}

#[tokio::test]
async fn test_binding_unknown_test_fails() {
    let db = database().await;
    let project = project(&db).await;
    let (suite, _) = db
        .create_entity(ParentKind::Suite, &project, "Smoke", "Checks", ACTOR)
        .await
        .unwrap();

    let err = db
        .set_suite_tests(&suite, &["missing".to_string()], ACTOR)
        .await
        .unwrap_err();
    assert!(matches!(err, DatabaseError::NotFound(_)));
}
