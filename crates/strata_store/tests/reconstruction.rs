mod common;

use std::rc::Rc;
use std::sync::Arc;

use async_trait::async_trait;
use common::{changes, insert, open, record, reference, refs, registry, remove, text, update};
use strata_store::{
    AuditStore, Criteria, EntitySchema, FieldData, FieldKind, HostValue, LiveRecordLoader,
    LoadState, MaterializeHints, RecordId, RelationDef, SchemaRegistry, Slot, StrataConfig,
    StrataError, StrataResult, Value, VersionGroupId,
};
use tempfile::tempdir;

/// Users own their posts eagerly and posts load author and tags eagerly.
fn eager_registry() -> SchemaRegistry {
    SchemaRegistry::new([
        EntitySchema::new("User", "id")
            .field("name", FieldKind::Text)
            .relation(RelationDef::one_to_many("posts", "Post", "author").eager()),
        EntitySchema::new("Post", "id")
            .field("title", FieldKind::Text)
            .relation(RelationDef::many_to_one("author", "User").eager())
            .relation(RelationDef::many_to_many("tags", "Tag").eager()),
        EntitySchema::new("Tag", "id").field("label", FieldKind::Text),
    ])
    .expect("registry")
}

/// `born` is written under one kind and read back under another.
fn dated_registry(born: FieldKind) -> SchemaRegistry {
    SchemaRegistry::new([
        EntitySchema::new("User", "id")
            .field("name", FieldKind::Text)
            .field("born", born),
        EntitySchema::new("Post", "id")
            .field("title", FieldKind::Text)
            .relation(RelationDef::many_to_one("author", "User").eager()),
    ])
    .expect("registry")
}

/// Host state for records that were never audited.
struct LiveState;

#[async_trait]
impl LiveRecordLoader for LiveState {
    async fn load_current(&self, type_name: &str, id: &RecordId) -> StrataResult<Option<FieldData>> {
        if type_name == "User" && id.as_str() == "42" {
            return Ok(Some(FieldData::from([(
                "name".to_string(),
                Value::Str("Live".to_string()),
            )])));
        }
        Ok(None)
    }

    async fn load_relation_ids(
        &self,
        _type_name: &str,
        _id: &RecordId,
        _field: &str,
    ) -> StrataResult<Option<Vec<RecordId>>> {
        Err(StrataError::storage("host relation store offline"))
    }
}

#[tokio::test]
async fn same_record_materializes_once_per_session() -> StrataResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = open(dir.path()).await?;
    let group = insert(&store, &record("User", 1), changes([("name", text("Alice"))])).await?;

    let manager = store.object_manager();
    let first = manager.find("User", 1i64, group).await?.expect("user");
    let second = manager.find("User", "1", group).await?.expect("user");
    assert!(Rc::ptr_eq(&first, &second));

    let by_name = manager
        .find_by(
            "User",
            &Criteria::from([("name".to_string(), Value::Str("Alice".to_string()))]),
            group,
        )
        .await?
        .expect("user by name");
    assert!(Rc::ptr_eq(&first, &by_name));

    let other_session = store.object_manager();
    let elsewhere = other_session.find("User", 1i64, group).await?.expect("user");
    assert!(!Rc::ptr_eq(&first, &elsewhere));
    Ok(())
}

#[tokio::test]
async fn property_values_never_leak_from_later_groups() -> StrataResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = open(dir.path()).await?;
    let user = record("User", 1);
    let vg1 = insert(&store, &user, changes([("name", text("Alice"))])).await?;
    let vg2 = update(&store, &user, changes([("name", text("Bob"))])).await?;
    let vg3 = update(&store, &user, changes([("name", HostValue::Null)])).await?;

    let manager = store.object_manager();
    let id = RecordId::from(1i64);
    let at = |group| manager.entity_persister("User", group);
    assert_eq!(
        at(vg1)?.get_property_value(&id, "name").await?,
        Some(Value::Str("Alice".to_string()))
    );
    assert_eq!(
        at(vg2)?.get_property_value(&id, "name").await?,
        Some(Value::Str("Bob".to_string()))
    );
    assert_eq!(at(vg3)?.get_property_value(&id, "name").await?, Some(Value::Null));
    assert_eq!(at(vg3)?.get_property_value(&id, "nickname").await?, None);
    assert_eq!(
        at(VersionGroupId(0))?.get_property_value(&id, "name").await?,
        None
    );
    Ok(())
}

#[tokio::test]
async fn reinserted_record_starts_a_fresh_history() -> StrataResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = open(dir.path()).await?;
    let post = record("Post", 3);
    let vg1 = insert(
        &store,
        &post,
        changes([("title", text("First")), ("status", text("draft"))]),
    )
    .await?;
    let vg2 = remove(&store, &post).await?;
    let vg3 = insert(&store, &post, changes([("title", text("Second"))])).await?;

    let manager = store.object_manager();
    let id = RecordId::from(3i64);
    assert!(!manager.entity_persister("Post", vg1)?.is_deleted(&id).await?);
    assert!(manager.entity_persister("Post", vg2)?.is_deleted(&id).await?);
    assert!(manager.find("Post", 3i64, vg2).await?.is_none());

    let again = manager.find("Post", 3i64, vg3).await?.expect("reinserted");
    assert_eq!(
        again.value(&manager, "title").await?,
        Value::Str("Second".to_string())
    );
    assert_eq!(again.value(&manager, "status").await?, Value::Null);

    let data = manager
        .entity_persister("Post", vg1)?
        .load_data_by_identifier(&id)
        .await?
        .expect("data at vg1");
    assert_eq!(data.type_name, "Post");
    assert_eq!(data.fields["status"], Value::Str("draft".to_string()));
    Ok(())
}

#[tokio::test]
async fn scalar_fields_decode_to_their_kinds() -> StrataResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = open(dir.path()).await?;
    let group = insert(
        &store,
        &record("Post", 1),
        changes([
            ("rating", HostValue::Value(Value::F64(4.5))),
            ("draft", HostValue::Value(Value::Bool(true))),
            ("published_at", HostValue::Value(Value::I64(1_700_000_000))),
        ]),
    )
    .await?;

    let manager = store.object_manager();
    let post = manager.find("Post", 1i64, group).await?.expect("post");
    assert_eq!(post.value(&manager, "rating").await?, Value::F64(4.5));
    assert_eq!(post.value(&manager, "draft").await?, Value::Bool(true));
    let published = post.value(&manager, "published_at").await?;
    assert_eq!(
        published.as_time().map(|time| time.timestamp()),
        Some(1_700_000_000)
    );
    assert_eq!(post.value(&manager, "title").await?, Value::Null);
    Ok(())
}

#[tokio::test]
async fn owning_references_start_as_proxies() -> StrataResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = open(dir.path()).await?;
    insert(&store, &record("User", 1), changes([("name", text("Alice"))])).await?;
    let group = insert(
        &store,
        &record("Post", 1),
        changes([("title", text("Hi")), ("author", reference("User", 1))]),
    )
    .await?;

    let manager = store.object_manager();
    let post = manager.find("Post", 1i64, group).await?.expect("post");
    let Some(Slot::One(Some(proxy))) = post.peek("author") else {
        panic!("author should hold a proxy");
    };
    assert!(!proxy.is_initialized());

    let author = post.related(&manager, "author").await?.expect("author");
    assert!(Rc::ptr_eq(&proxy, &author));
    assert!(author.is_initialized());
    assert_eq!(
        author.value(&manager, "name").await?,
        Value::Str("Alice".to_string())
    );
    let direct = manager.find("User", 1i64, group).await?.expect("user");
    assert!(Rc::ptr_eq(&direct, &author));
    Ok(())
}

#[tokio::test]
async fn deleted_targets_read_as_null() -> StrataResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = open(dir.path()).await?;
    let user = record("User", 1);
    insert(&store, &user, changes([("name", text("Alice"))])).await?;
    let before = insert(
        &store,
        &record("Post", 1),
        changes([("author", reference("User", 1))]),
    )
    .await?;
    let after = remove(&store, &user).await?;

    let manager = store.object_manager();
    let post = manager.find("Post", 1i64, before).await?.expect("post");
    assert!(post.related(&manager, "author").await?.is_some());
    let post = manager.find("Post", 1i64, after).await?.expect("post");
    assert!(post.related(&manager, "author").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn proxies_need_an_identifier_and_data() -> StrataResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = open(dir.path()).await?;
    let group = insert(&store, &record("User", 1), changes([("name", text("Alice"))])).await?;

    let manager = store.object_manager();
    let err = manager
        .get_proxy("User", &FieldData::new(), group)
        .expect_err("identifier required");
    assert!(matches!(err, StrataError::MissingIdentifier { .. }));

    let proxy = manager.get_proxy(
        "User",
        &FieldData::from([("id".to_string(), Value::I64(1))]),
        group,
    )?;
    assert!(!proxy.is_initialized());
    manager.initialize_proxy(&proxy).await?;
    manager.initialize_proxy(&proxy).await?;
    assert_eq!(
        proxy.value(&manager, "name").await?,
        Value::Str("Alice".to_string())
    );

    let missing = manager.get_proxy(
        "User",
        &FieldData::from([("id".to_string(), Value::I64(77))]),
        group,
    )?;
    let err = manager
        .initialize_proxy(&missing)
        .await
        .expect_err("no data for 77");
    assert!(err.is_not_found());
    Ok(())
}

#[tokio::test]
async fn one_to_one_sides_point_at_each_other() -> StrataResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = open(dir.path()).await?;
    insert(&store, &record("User", 1), changes([("name", text("Alice"))])).await?;
    let group = insert(
        &store,
        &record("Profile", 7),
        changes([("bio", text("hello")), ("user", reference("User", 1))]),
    )
    .await?;

    let manager = store.object_manager();
    let user = manager.find("User", 1i64, group).await?.expect("user");
    let profile = user.related(&manager, "profile").await?.expect("profile");
    assert_eq!(profile.id(), &RecordId::from(7i64));
    let back = profile.related(&manager, "user").await?.expect("user");
    assert!(Rc::ptr_eq(&user, &back));
    Ok(())
}

#[tokio::test]
async fn inverse_collections_resolve_from_owning_snapshots() -> StrataResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = open(dir.path()).await?;
    let mut commit = store.audit_log().begin_commit();
    commit
        .record_insert(&record("Tag", 10), &changes([("label", text("rust"))]))
        .await?;
    commit
        .record_insert(&record("Post", 1), &changes([("tags", refs("Tag", &[10]))]))
        .await?;
    commit
        .record_insert(&record("Post", 2), &changes([("tags", refs("Tag", &[]))]))
        .await?;
    commit
        .record_insert(&record("Comment", 100), &changes([("post", reference("Post", 1))]))
        .await?;
    commit
        .record_insert(&record("Comment", 101), &changes([("post", reference("Post", 2))]))
        .await?;
    let group = commit.commit().await?.expect("group");

    let manager = store.object_manager();
    let tag = manager.find("Tag", 10i64, group).await?.expect("tag");
    let posts = tag.collection(&manager, "posts").await?.expect("posts");
    assert_eq!(posts.ids(&manager).await?, vec![RecordId::from(1i64)]);

    let post = manager.find("Post", 1i64, group).await?.expect("post");
    let comments = post.collection(&manager, "comments").await?.expect("comments");
    let loaded = comments.items(&manager).await?;
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].id(), &RecordId::from(100i64));
    let owner = loaded[0].related(&manager, "post").await?.expect("post");
    assert!(Rc::ptr_eq(&owner, &post));
    Ok(())
}

#[tokio::test]
async fn polymorphic_records_load_as_their_concrete_type() -> StrataResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = open(dir.path()).await?;
    insert(
        &store,
        &record("Article", 3),
        changes([("title", text("Intro")), ("body", text("Text"))]),
    )
    .await?;
    let group = insert(
        &store,
        &record("Post", 1),
        changes([("featured", reference("Content", 3))]),
    )
    .await?;

    let manager = store.object_manager();
    let content = manager.find("Content", 3i64, group).await?.expect("content");
    assert_eq!(content.type_name(), "Article");
    assert_eq!(
        content.value(&manager, "kind").await?,
        Value::Str("article".to_string())
    );
    assert_eq!(
        content.value(&manager, "body").await?,
        Value::Str("Text".to_string())
    );

    let post = manager.find("Post", 1i64, group).await?.expect("post");
    let Some(Slot::One(Some(featured))) = post.peek("featured") else {
        panic!("featured should be loaded");
    };
    assert!(featured.is_initialized());
    assert!(Rc::ptr_eq(&featured, &content));
    Ok(())
}

#[tokio::test]
async fn never_audited_records_fall_back_to_live_state() -> StrataResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = open(dir.path())
        .await?
        .with_live_loader(Arc::new(LiveState));
    let group = insert(&store, &record("User", 1), changes([("name", text("Alice"))])).await?;

    let manager = store.object_manager();
    let live = manager.find("User", 42i64, group).await?.expect("live user");
    assert_eq!(
        live.value(&manager, "name").await?,
        Value::Str("Live".to_string())
    );
    assert!(manager.find("User", 43i64, group).await?.is_none());

    let mut config = StrataConfig::default_sqlite("audit.sqlite");
    config.reader.live_fallback = false;
    let strict = AuditStore::connect(&config, dir.path(), registry())
        .await?
        .with_live_loader(Arc::new(LiveState));
    let manager = strict.object_manager();
    assert!(manager.find("User", 42i64, group).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn lazy_collections_load_on_first_access_only() -> StrataResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = open(dir.path()).await?;
    let mut commit = store.audit_log().begin_commit();
    for id in [10, 20] {
        commit
            .record_insert(&record("Tag", id), &changes([("label", text("t"))]))
            .await?;
    }
    commit
        .record_insert(&record("Post", 1), &changes([("tags", refs("Tag", &[10]))]))
        .await?;
    let group = commit.commit().await?.expect("group");

    let manager = store.object_manager();
    let post = manager.find("Post", 1i64, group).await?.expect("post");
    let tags = post.collection(&manager, "tags").await?.expect("tags");
    assert_eq!(tags.state(), LoadState::Uninitialized);
    tags.clear();
    assert_eq!(tags.state(), LoadState::Uninitialized);
    assert!(!tags.is_dirty());

    assert_eq!(tags.len(&manager).await?, 1);
    assert!(tags.is_initialized());
    assert!(!tags.is_dirty());

    let extra = manager.find("Tag", 20i64, group).await?.expect("tag");
    tags.add(&manager, extra.clone()).await?;
    assert!(tags.is_dirty());
    assert!(tags.contains(&manager, &extra).await?);
    assert_eq!(tags.snapshot().len(), 1);
    tags.take_snapshot();
    assert!(!tags.is_dirty());
    assert!(tags.remove(&manager, &extra).await?);
    assert!(tags.is_dirty());
    Ok(())
}

#[tokio::test]
async fn failed_collection_load_can_be_retried() -> StrataResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = open(dir.path())
        .await?
        .with_live_loader(Arc::new(LiveState));
    let group = insert(&store, &record("Post", 1), changes([("title", text("No tags"))])).await?;

    let manager = store.object_manager();
    let post = manager.find("Post", 1i64, group).await?.expect("post");
    let tags = post.collection(&manager, "tags").await?.expect("tags");
    assert!(tags.initialize(&manager).await.is_err());
    assert_eq!(tags.state(), LoadState::Uninitialized);
    assert!(tags.items(&manager).await.is_err());
    assert_eq!(tags.state(), LoadState::Uninitialized);
    Ok(())
}

#[tokio::test]
async fn failed_relation_load_leaves_nothing_half_built() -> StrataResult<()> {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("audit.sqlite");
    let writer = AuditStore::connect_sqlite(&path, dated_registry(FieldKind::Text)).await?;
    insert(&writer, &record("User", 1), changes([("born", text("not a date"))])).await?;
    let group = insert(
        &writer,
        &record("Post", 1),
        changes([("title", text("Hello")), ("author", reference("User", 1))]),
    )
    .await?;

    let store = AuditStore::connect_sqlite(&path, dated_registry(FieldKind::DateTime)).await?;
    let manager = store.object_manager();
    for _ in 0..2 {
        let err = manager
            .find("Post", 1i64, group)
            .await
            .expect_err("author cannot be decoded");
        assert!(matches!(err, StrataError::Decode { .. }));
    }
    assert_eq!(manager.identity_map_len(), 0);

    let identifier = FieldData::from([("id".to_string(), Value::I64(1))]);
    let proxy = manager.get_proxy("Post", &identifier, group)?;
    assert!(proxy.value(&manager, "title").await.is_err());
    assert!(!proxy.is_initialized());
    assert!(proxy.peek("title").is_none());
    assert_eq!(manager.identity_map_len(), 1);
    Ok(())
}

#[tokio::test]
async fn values_before_a_deletion_never_match_after_reinsert() -> StrataResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = open(dir.path()).await?;
    insert(&store, &record("Post", 1), changes([("title", text("Hello"))])).await?;
    let comment = record("Comment", 7);
    let vg1 = insert(
        &store,
        &comment,
        changes([("body", text("first")), ("post", reference("Post", 1))]),
    )
    .await?;
    remove(&store, &comment).await?;
    let vg3 = insert(&store, &comment, changes([("body", text("again"))])).await?;

    let manager = store.object_manager();
    let before = manager.find("Post", 1i64, vg1).await?.expect("post at vg1");
    let comments = before.collection(&manager, "comments").await?.expect("comments");
    assert_eq!(comments.ids(&manager).await?, vec![RecordId::from(7i64)]);

    let post = manager.find("Post", 1i64, vg3).await?.expect("post at vg3");
    let again = manager.find("Comment", 7i64, vg3).await?.expect("comment at vg3");
    assert!(again.related(&manager, "post").await?.is_none());
    let comments = post.collection(&manager, "comments").await?.expect("comments");
    assert!(comments.is_empty(&manager).await?);

    let by_post = Criteria::from([("post".to_string(), Value::I64(1))]);
    assert!(manager.find_by("Comment", &by_post, vg3).await?.is_none());
    assert!(manager.find_by("Comment", &by_post, vg1).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn eager_relations_load_with_their_owner() -> StrataResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = AuditStore::connect_sqlite(&dir.path().join("audit.sqlite"), eager_registry()).await?;
    let mut commit = store.audit_log().begin_commit();
    commit
        .record_insert(&record("Tag", 10), &changes([("label", text("rust"))]))
        .await?;
    commit
        .record_insert(&record("User", 1), &changes([("name", text("Alice"))]))
        .await?;
    commit
        .record_insert(
            &record("Post", 1),
            &changes([
                ("title", text("Hello")),
                ("author", reference("User", 1)),
                ("tags", refs("Tag", &[10])),
            ]),
        )
        .await?;
    let group = commit.commit().await?.expect("group");

    let manager = store.object_manager();
    let post = manager.find("Post", 1i64, group).await?.expect("post");

    let Some(Slot::One(Some(author))) = post.peek("author") else {
        panic!("author should be loaded");
    };
    assert!(author.is_initialized());
    assert_eq!(author.id(), &RecordId::from(1i64));

    let Some(Slot::Many(tags)) = post.peek("tags") else {
        panic!("tags should be a collection");
    };
    assert!(tags.is_initialized());
    assert_eq!(tags.ids(&manager).await?, vec![RecordId::from(10i64)]);

    let Some(Slot::Many(posts)) = author.peek("posts") else {
        panic!("posts should be a collection");
    };
    assert!(posts.is_initialized());
    let members = posts.items(&manager).await?;
    assert_eq!(members.len(), 1);
    assert!(Rc::ptr_eq(&members[0], &post));
    assert_eq!(manager.identity_map_len(), 3);
    Ok(())
}

#[tokio::test]
async fn partial_and_fetched_hints_limit_what_materialize_touches() -> StrataResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = open(dir.path()).await?;
    insert(&store, &record("User", 4), changes([("name", text("Ann"))])).await?;
    let group = insert(
        &store,
        &record("Post", 1),
        changes([("title", text("Hello")), ("author", reference("User", 4))]),
    )
    .await?;

    let manager = store.object_manager();
    let data = FieldData::from([("name".to_string(), Value::Str("Partial".to_string()))]);
    let partial = manager
        .materialize(
            "User",
            &RecordId::from(7i64),
            &data,
            group,
            MaterializeHints {
                partial: true,
                ..MaterializeHints::default()
            },
        )
        .await?;
    assert!(partial.is_initialized());
    assert!(partial.peek("profile").is_none());
    assert_eq!(partial.value(&manager, "id").await?, Value::I64(7));
    assert!(partial.related(&manager, "profile").await?.is_none());

    let post = manager.find("Post", 1i64, group).await?.expect("post");
    let Some(Slot::One(Some(original))) = post.peek("author") else {
        panic!("author proxy expected");
    };
    let moved = FieldData::from([
        ("title".to_string(), Value::Str("Edited".to_string())),
        ("author".to_string(), Value::Str("5".to_string())),
    ]);
    let kept = manager
        .materialize(
            "Post",
            &RecordId::from(1i64),
            &moved,
            group,
            MaterializeHints {
                refresh: true,
                fetched: true,
                ..MaterializeHints::default()
            },
        )
        .await?;
    assert!(Rc::ptr_eq(&kept, &post));
    assert_eq!(post.value(&manager, "title").await?, Value::Str("Edited".to_string()));
    let Some(Slot::One(Some(author))) = post.peek("author") else {
        panic!("author should be kept");
    };
    assert!(Rc::ptr_eq(&author, &original));

    manager
        .materialize(
            "Post",
            &RecordId::from(1i64),
            &moved,
            group,
            MaterializeHints {
                refresh: true,
                ..MaterializeHints::default()
            },
        )
        .await?;
    let Some(Slot::One(Some(author))) = post.peek("author") else {
        panic!("author proxy expected");
    };
    assert_eq!(author.id(), &RecordId::from(5i64));
    Ok(())
}

#[tokio::test]
async fn refresh_reloads_a_mapped_object_in_place() -> StrataResult<()> {
    let dir = tempdir().expect("tempdir");
    let store = open(dir.path()).await?;
    let group = insert(&store, &record("Post", 1), changes([("title", text("Hello"))])).await?;

    let manager = store.object_manager();
    let post = manager.find("Post", 1i64, group).await?.expect("post");
    let stale = FieldData::from([("title".to_string(), Value::Str("Stale".to_string()))]);
    manager
        .materialize(
            "Post",
            &RecordId::from(1i64),
            &stale,
            group,
            MaterializeHints {
                refresh: true,
                partial: true,
                ..MaterializeHints::default()
            },
        )
        .await?;

    let persister = manager.entity_persister("Post", group)?;
    let by_id = Criteria::from([("id".to_string(), Value::I64(1))]);
    let cached = persister
        .load(&manager, &by_id, None, MaterializeHints::default())
        .await?
        .expect("post");
    assert!(Rc::ptr_eq(&cached, &post));
    assert_eq!(post.value(&manager, "title").await?, Value::Str("Stale".to_string()));

    let reloaded = persister
        .load(
            &manager,
            &by_id,
            None,
            MaterializeHints {
                refresh: true,
                ..MaterializeHints::default()
            },
        )
        .await?
        .expect("post");
    assert!(Rc::ptr_eq(&reloaded, &post));
    assert_eq!(post.value(&manager, "title").await?, Value::Str("Hello".to_string()));
    Ok(())
}
