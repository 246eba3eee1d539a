use std::sync::Arc;

use tabula::prelude::*;
use tabula::test_utils::MockDatabase;
use tabula::{Loaded, Related};

const SCHEMA: &str = r#"
CREATE TABLE countries (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, country_id INTEGER);
CREATE TABLE posts (id INTEGER PRIMARY KEY, user_id INTEGER NOT NULL, title TEXT NOT NULL);
CREATE TABLE roles (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
CREATE TABLE role_user (user_id INTEGER NOT NULL, role_id INTEGER NOT NULL);
CREATE TABLE videos (id INTEGER PRIMARY KEY, title TEXT NOT NULL);
CREATE TABLE comments (
    id INTEGER PRIMARY KEY,
    body TEXT NOT NULL,
    commentable_type TEXT NOT NULL,
    commentable_id INTEGER NOT NULL
);

INSERT INTO countries (id, name) VALUES (1, 'UK'), (2, 'FI');
INSERT INTO users (id, name, country_id) VALUES (1, 'Ada', 1), (2, 'Grace', 1), (3, 'Linus', 2);
INSERT INTO posts (id, user_id, title) VALUES (1, 1, 'Notes'), (2, 1, 'Engines'), (3, 2, 'Compilers');
INSERT INTO roles (id, name) VALUES (1, 'admin'), (2, 'editor');
INSERT INTO role_user (user_id, role_id) VALUES (1, 1), (1, 2), (2, 2);
INSERT INTO videos (id, title) VALUES (1, 'Talk');
INSERT INTO comments (id, body, commentable_type, commentable_id) VALUES
    (1, 'first', 'post', 1),
    (2, 'second', 'post', 1),
    (3, 'nice talk', 'video', 1);
"#;

async fn setup() -> MockDatabase<tabula::sqlx::Sqlite> {
    let db = MockDatabase::new_sqlite().await.unwrap();
    db.run_script(SCHEMA).await.unwrap();
    db
}

fn countries() -> Arc<ModelSchema> {
    ModelSchema::builder("countries")
        .without_timestamps()
        .relation(
            "posts",
            Relation::has_many_through(Related::Lazy(posts), "users", "country_id", "user_id"),
        )
        .build()
}

fn users() -> Arc<ModelSchema> {
    ModelSchema::builder("users")
        .without_timestamps()
        .relation("posts", Relation::has_many(Related::Lazy(posts)).foreign_key("user_id"))
        .relation(
            "latest_post",
            Relation::has_one(Related::Lazy(posts))
                .foreign_key("user_id")
                .order_by("id", Direction::Desc),
        )
        .relation(
            "first_post",
            Relation::has_one(Related::Lazy(posts))
                .foreign_key("user_id")
                .order_by("id", Direction::Asc)
                .limit(1),
        )
        .relation(
            "roles",
            Relation::belongs_to_many(Related::Lazy(roles)).pivot("role_user", "user_id", "role_id"),
        )
        .build()
}

fn posts() -> Arc<ModelSchema> {
    ModelSchema::builder("posts")
        .without_timestamps()
        .morph_class("post")
        .relation("author", Relation::belongs_to(Related::Lazy(users), "user_id"))
        .relation("comments", Relation::morph_many(Related::Lazy(comments), "commentable"))
        .build()
}

fn roles() -> Arc<ModelSchema> {
    ModelSchema::builder("roles").without_timestamps().build()
}

fn videos() -> Arc<ModelSchema> {
    ModelSchema::builder("videos")
        .without_timestamps()
        .morph_class("video")
        .relation("comments", Relation::morph_many(Related::Lazy(comments), "commentable"))
        .build()
}

fn comments() -> Arc<ModelSchema> {
    ModelSchema::builder("comments")
        .without_timestamps()
        .relation(
            "commentable",
            Relation::morph_to("commentable")
                .map_type("post", Related::Lazy(posts))
                .map_type("video", Related::Lazy(videos)),
        )
        .build()
}

fn names(models: &[Model], column: &str) -> Vec<Value> {
    models.iter().map(|m| m.get_attribute(column)).collect()
}

#[tokio::test]
async fn belongs_to_finds_the_owner() {
    let db = setup().await;
    let mut conn = db.executor();
    let mut post = posts().query(&mut conn).find_or_fail(3).await.unwrap();

    let Loaded::One(Some(author)) = post.load(&mut conn, "author").await.unwrap() else {
        panic!("author not loaded");
    };
    assert_eq!(author.get_attribute("name"), Value::from("Grace"));
    assert!(post.relation("author").is_some());
}

#[tokio::test]
async fn has_many_and_has_one() {
    let db = setup().await;
    let mut conn = db.executor();
    let users = users();
    let ada = users.query(&mut conn).find_or_fail(1).await.unwrap();
    let linus = users.query(&mut conn).find_or_fail(3).await.unwrap();

    let posts = users.relation("posts").unwrap();
    assert_eq!(posts.count(&mut conn, &ada).await.unwrap(), 2);
    assert!(!posts.exists(&mut conn, &linus).await.unwrap());

    let latest = users
        .relation("latest_post")
        .unwrap()
        .first(&mut conn, &ada)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.get_attribute("title"), Value::from("Engines"));
}

#[tokio::test]
async fn belongs_to_many_goes_through_the_pivot() {
    let db = setup().await;
    let mut conn = db.executor();
    let users = users();
    let ada = users.query(&mut conn).find_or_fail(1).await.unwrap();

    let roles = users
        .relation("roles")
        .unwrap()
        .query(&mut conn, &ada)
        .unwrap()
        .order_by("name", Direction::Asc)
        .get()
        .await
        .unwrap();
    assert_eq!(names(&roles, "name"), [Value::from("admin"), Value::from("editor")]);
}

#[tokio::test]
async fn has_many_through_crosses_the_intermediate_table() {
    let db = setup().await;
    let mut conn = db.executor();
    let countries = countries();
    let uk = countries.query(&mut conn).find_or_fail(1).await.unwrap();
    let fi = countries.query(&mut conn).find_or_fail(2).await.unwrap();

    let through = countries.relation("posts").unwrap();
    assert_eq!(through.count(&mut conn, &uk).await.unwrap(), 3);
    assert_eq!(through.count(&mut conn, &fi).await.unwrap(), 0);
}

#[tokio::test]
async fn polymorphic_relations_both_ways() {
    let db = setup().await;
    let mut conn = db.executor();

    let post = posts().query(&mut conn).find_or_fail(1).await.unwrap();
    let video = videos().query(&mut conn).find_or_fail(1).await.unwrap();
    let on_post = post.schema().relation("comments").unwrap();
    assert_eq!(on_post.count(&mut conn, &post).await.unwrap(), 2);
    let on_video = video.schema().relation("comments").unwrap();
    assert_eq!(on_video.count(&mut conn, &video).await.unwrap(), 1);

    let mut comment = comments().query(&mut conn).find_or_fail(3).await.unwrap();
    let Loaded::One(Some(parent)) = comment.load(&mut conn, "commentable").await.unwrap() else {
        panic!("commentable not loaded");
    };
    assert_eq!(parent.schema().table(), "videos");
    assert_eq!(parent.get_attribute("title"), Value::from("Talk"));
}

#[tokio::test]
async fn eager_loading_batches_and_matches_in_memory() {
    let db = setup().await;
    let mut conn = db.executor();

    let users = users()
        .query(&mut conn)
        .include("posts")
        .include("latest_post")
        .order_by("id", Direction::Asc)
        .get()
        .await
        .unwrap();

    let counts: Vec<usize> = users
        .iter()
        .map(|u| match u.relation("posts") {
            Some(Loaded::Many(posts)) => posts.len(),
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    assert_eq!(counts, [2, 1, 0]);

    let Some(Loaded::One(Some(latest))) = users[0].relation("latest_post") else {
        panic!("latest post missing");
    };
    assert_eq!(latest.key(), Some(&Value::Int(2)));
    assert!(matches!(users[2].relation("latest_post"), Some(Loaded::One(None))));

    let json = users[1].to_json();
    assert_eq!(json["posts"][0]["title"], "Compilers");
}

#[tokio::test]
async fn eager_loading_a_limited_relation_fills_every_owner() {
    let db = setup().await;
    let mut conn = db.executor();

    let users = users()
        .query(&mut conn)
        .include("first_post")
        .order_by("id", Direction::Asc)
        .get()
        .await
        .unwrap();

    let firsts: Vec<Option<Value>> = users
        .iter()
        .map(|u| match u.relation("first_post") {
            Some(Loaded::One(post)) => post.as_ref().and_then(|p| p.key().cloned()),
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    assert_eq!(firsts, [Some(Value::Int(1)), Some(Value::Int(3)), None]);
}

#[tokio::test]
async fn eager_belongs_to_dedupes_owner_keys() {
    let db = setup().await;
    let mut conn = db.executor();
    let posts = posts()
        .query(&mut conn)
        .include("author")
        .order_by("id", Direction::Asc)
        .get()
        .await
        .unwrap();

    let authors: Vec<Value> = posts
        .iter()
        .map(|p| match p.relation("author") {
            Some(Loaded::One(Some(author))) => author.get_attribute("name"),
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    assert_eq!(authors, [Value::from("Ada"), Value::from("Ada"), Value::from("Grace")]);
}

#[tokio::test]
async fn unknown_relation_is_not_found() {
    let db = setup().await;
    let mut conn = db.executor();
    let mut post = posts().query(&mut conn).find_or_fail(1).await.unwrap();
    assert!(post.load(&mut conn, "editor").await.unwrap_err().is_not_found());
}
