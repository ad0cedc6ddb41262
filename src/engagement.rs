use crate::get_db_pool;
use crate::middleware::ClientCtx;
use crate::orm::{post_likes, post_views, posts};
use actix_web::{error, post, web, Error, Responder};
use chrono::Utc;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{entity::*, query::*, DatabaseConnection, DbErr};
use serde::Serialize;

/// Outcome of a like toggle, echoed to the client.
#[derive(Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LikeState {
    pub liked: bool,
    pub like_count: i32,
}

/// Collapses a request identity into one column value so the
/// (post_id, viewer_key) unique index can arbitrate duplicate views.
pub fn viewer_key(user_id: Option<&str>, ip_address: &str, session_id: Option<&str>) -> String {
    match user_id {
        Some(uid) => format!("user:{}", uid),
        None => format!("anon:{}:{}", ip_address, session_id.unwrap_or("")),
    }
}

/// Records at most one view per identity per post. The insert-or-ignore keeps
/// the counter exact under concurrent requests from the same identity.
pub async fn record_view(
    db: &DatabaseConnection,
    post_id: &str,
    user_id: Option<&str>,
    ip_address: &str,
    session_id: Option<&str>,
) -> Result<(), DbErr> {
    let view = post_views::ActiveModel {
        id: Set(uuid::Uuid::new_v4().to_string()),
        post_id: Set(post_id.to_owned()),
        user_id: Set(user_id.map(|u| u.to_owned())),
        ip_address: Set(ip_address.to_owned()),
        session_id: Set(session_id.map(|s| s.to_owned())),
        viewer_key: Set(viewer_key(user_id, ip_address, session_id)),
        created_at: Set(Utc::now().naive_utc()),
    };

    let inserted = post_views::Entity::insert(view)
        .on_conflict(
            OnConflict::columns([post_views::Column::PostId, post_views::Column::ViewerKey])
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(db)
        .await?;

    if inserted > 0 {
        posts::Entity::update_many()
            .col_expr(posts::Column::ViewCount, Expr::cust("view_count + 1"))
            .col_expr(
                posts::Column::UpdatedAt,
                Expr::value(Utc::now().naive_utc()),
            )
            .filter(posts::Column::Id.eq(post_id))
            .exec(db)
            .await?;
    }

    Ok(())
}

/// Flips like state for (post, user) and returns the new state with the
/// count read back after the mutation. Delete-first plus insert-or-ignore
/// keeps a double-toggle from the same user down to one row.
pub async fn toggle_like(
    db: &DatabaseConnection,
    post_id: &str,
    user_id: &str,
) -> Result<LikeState, DbErr> {
    let deleted = post_likes::Entity::delete_many()
        .filter(post_likes::Column::PostId.eq(post_id))
        .filter(post_likes::Column::UserId.eq(user_id))
        .exec(db)
        .await?;

    let liked = if deleted.rows_affected > 0 {
        adjust_like_count(db, post_id, "like_count - 1").await?;
        false
    } else {
        let like = post_likes::ActiveModel {
            id: Set(uuid::Uuid::new_v4().to_string()),
            post_id: Set(post_id.to_owned()),
            user_id: Set(user_id.to_owned()),
            created_at: Set(Utc::now().naive_utc()),
        };
        let inserted = post_likes::Entity::insert(like)
            .on_conflict(
                OnConflict::columns([post_likes::Column::PostId, post_likes::Column::UserId])
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(db)
            .await?;
        if inserted > 0 {
            adjust_like_count(db, post_id, "like_count + 1").await?;
        }
        true
    };

    let like_count = posts::Entity::find_by_id(post_id.to_owned())
        .one(db)
        .await?
        .map(|p| p.like_count)
        .unwrap_or(0);

    Ok(LikeState { liked, like_count })
}

pub async fn has_liked(
    db: &DatabaseConnection,
    post_id: &str,
    user_id: &str,
) -> Result<bool, DbErr> {
    Ok(post_likes::Entity::find()
        .filter(post_likes::Column::PostId.eq(post_id))
        .filter(post_likes::Column::UserId.eq(user_id))
        .one(db)
        .await?
        .is_some())
}

async fn adjust_like_count(
    db: &DatabaseConnection,
    post_id: &str,
    delta: &str,
) -> Result<(), DbErr> {
    posts::Entity::update_many()
        .col_expr(posts::Column::LikeCount, Expr::cust(delta))
        .col_expr(
            posts::Column::UpdatedAt,
            Expr::value(Utc::now().naive_utc()),
        )
        .filter(posts::Column::Id.eq(post_id))
        .exec(db)
        .await?;
    Ok(())
}

#[post("/api/posts/{post_id}/like")]
pub async fn like_post(client: ClientCtx, path: web::Path<String>) -> Result<impl Responder, Error> {
    let user_id = client.require_user()?;
    let db = get_db_pool();
    let post_id = path.into_inner();

    posts::Entity::find_by_id(post_id.to_owned())
        .one(db)
        .await
        .map_err(error::ErrorInternalServerError)?
        .ok_or_else(|| error::ErrorNotFound("Post not found."))?;

    let state = toggle_like(db, &post_id, &user_id).await.map_err(|e| {
        log::error!("like_post: {}", e);
        error::ErrorInternalServerError("Failed to toggle like.")
    })?;

    Ok(web::Json(state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::{DatabaseBackend, MockDatabase, MockExecResult};

    fn post_with_likes(like_count: i32) -> posts::Model {
        let now = Utc::now().naive_utc();
        posts::Model {
            id: "p1".to_owned(),
            title: "Hi".to_owned(),
            short_description: "".to_owned(),
            content: "".to_owned(),
            cover_image: None,
            author_id: "a".to_owned(),
            category_id: "c".to_owned(),
            kind: "post".to_owned(),
            published: true,
            view_count: 0,
            like_count,
            created_at: now,
            updated_at: now,
        }
    }

    fn exec(rows_affected: u64) -> MockExecResult {
        MockExecResult {
            last_insert_id: 0,
            rows_affected,
        }
    }

    #[test]
    fn viewer_key_prefers_user_identity() {
        assert_eq!(viewer_key(Some("u1"), "1.2.3.4", Some("s1")), "user:u1");
        assert_eq!(viewer_key(None, "1.2.3.4", Some("s1")), "anon:1.2.3.4:s1");
        assert_eq!(viewer_key(None, "1.2.3.4", None), "anon:1.2.3.4:");
    }

    #[actix_rt::test]
    async fn record_view_increments_on_first_sight() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_results([exec(1), exec(1)])
            .into_connection();

        record_view(&db, "p1", Some("u1"), "1.2.3.4", None)
            .await
            .unwrap();

        // Insert plus the counter update.
        assert_eq!(db.into_transaction_log().len(), 2);
    }

    #[actix_rt::test]
    async fn record_view_ignores_repeat_identity() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_results([exec(0)])
            .into_connection();

        record_view(&db, "p1", Some("u1"), "1.2.3.4", None)
            .await
            .unwrap();

        // Conflicting insert only; no counter update.
        assert_eq!(db.into_transaction_log().len(), 1);
    }

    #[actix_rt::test]
    async fn toggle_like_inserts_when_absent() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_results([exec(0), exec(1), exec(1)])
            .append_query_results([[post_with_likes(1)]])
            .into_connection();

        let state = toggle_like(&db, "p1", "u1").await.unwrap();
        assert_eq!(
            state,
            LikeState {
                liked: true,
                like_count: 1
            }
        );
    }

    #[actix_rt::test]
    async fn toggle_like_removes_when_present() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_results([exec(1), exec(1)])
            .append_query_results([[post_with_likes(0)]])
            .into_connection();

        let state = toggle_like(&db, "p1", "u1").await.unwrap();
        assert_eq!(
            state,
            LikeState {
                liked: false,
                like_count: 0
            }
        );
    }
}
