//! Group creation, naming, and transitive membership resolution.

use midas_shared::models::PUBLIC_GROUP;

use crate::dbio::DbioError;

use super::inmem_factory;

#[tokio::test]
async fn test_create_group_mints_namespaced_id() {
    let (_backend, factory) = inmem_factory();
    let cli = factory.create_client("dmp", "u1");

    let grp = cli.groups().create_group("friends", None).await.unwrap();
    assert_eq!(grp.id(), "grp0:u1:friends");
    assert_eq!(grp.name(), "friends");
    assert!(grp.is_member("u1"));

    let err = cli.groups().create_group("friends", None).await.unwrap_err();
    assert!(matches!(err, DbioError::AlreadyExists(_)));

    // another user's namespace is distinct
    let cli2 = factory.create_client("dmp", "u2");
    let grp2 = cli2.groups().create_group("friends", None).await.unwrap();
    assert_eq!(grp2.id(), "grp0:u2:friends");
}

#[tokio::test]
async fn test_create_group_for_other_user_requires_superuser() {
    let (_backend, factory) = inmem_factory();
    let cli = factory.create_client("dmp", "u1");
    let err = cli.groups().create_group("theirs", Some("u2")).await.unwrap_err();
    assert!(matches!(err, DbioError::NotAuthorized { .. }));

    let root = factory.create_client("dmp", "rlp");
    let grp = root.groups().create_group("theirs", Some("u2")).await.unwrap();
    assert_eq!(grp.core.owner, "u2");
}

#[tokio::test]
async fn test_select_ids_for_user_is_transitive() {
    let (_backend, factory) = inmem_factory();
    let cli = factory.create_client("dmp", "u1");
    let groups = cli.groups();

    // G1 = {u1}, G2 = {G1}, G3 = {G2, u2}
    let g1 = groups.create_group("g1", None).await.unwrap();
    let mut g2 = groups.create_group("g2", None).await.unwrap();
    g2.members = vec![g1.id().to_string()];
    g2.save(&cli).await.unwrap();
    let mut g3 = groups.create_group("g3", None).await.unwrap();
    g3.members = vec![g2.id().to_string(), "u2".to_string()];
    g3.save(&cli).await.unwrap();

    let ids = groups.select_ids_for_user("u1").await.unwrap();
    let expect: std::collections::HashSet<String> = [
        g1.id().to_string(),
        g2.id().to_string(),
        g3.id().to_string(),
        PUBLIC_GROUP.to_string(),
    ]
    .into_iter()
    .collect();
    assert_eq!(ids, expect);

    let ids = groups.select_ids_for_user("u2").await.unwrap();
    assert!(ids.contains(g3.id()));
    assert!(!ids.contains(g1.id()));
    assert!(ids.contains(PUBLIC_GROUP));
}

#[tokio::test]
async fn test_get_by_name_and_membership_edit() {
    let (_backend, factory) = inmem_factory();
    let cli = factory.create_client("dmp", "u1");

    let mut grp = cli.groups().create_group("team", None).await.unwrap();
    grp.add_member(&cli, &["u2", "u3"]).await.unwrap();
    grp.add_member(&cli, &["u2"]).await.unwrap();
    grp.remove_member(&cli, &["u3"]).await.unwrap();
    grp.save(&cli).await.unwrap();

    let found = cli.groups().get_by_name("team", None).await.unwrap().unwrap();
    assert_eq!(found.members, vec!["u1", "u2"]);
    assert!(cli.groups().get_by_name("nobody", None).await.unwrap().is_none());
}

#[tokio::test]
async fn test_delete_group_requires_delete_perm() {
    let (_backend, factory) = inmem_factory();
    let cli = factory.create_client("dmp", "u1");
    let grp = cli.groups().create_group("temp", None).await.unwrap();

    // a member without delete permission cannot delete
    let other = factory.create_client("dmp", "u2");
    let err = other.groups().delete_group(grp.id()).await.unwrap_err();
    assert!(matches!(err, DbioError::NotAuthorized { .. }));

    assert!(cli.groups().delete_group(grp.id()).await.unwrap());
    assert!(!cli.groups().exists(grp.id()).await.unwrap());
    assert!(!cli.groups().delete_group(grp.id()).await.unwrap());
}
