use crate::get_db_pool;
use crate::middleware::ClientCtx;
use crate::orm::{comments, posts, users};
use actix_web::{delete, error, get, post, web, Error, HttpResponse, Responder};
use chrono::Utc;
use sea_orm::{entity::*, query::*, DatabaseConnection, DbErr};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A comment joined with its author, as the API returns it.
#[derive(Debug, Serialize)]
pub struct CommentWithAuthor {
    #[serde(flatten)]
    pub comment: comments::Model,
    pub author: Option<users::Model>,
}

#[derive(Debug, Deserialize)]
pub struct CommentForm {
    pub content: String,
}

/// Author-joined comments for one post, newest first.
pub async fn get_post_comments(
    db: &DatabaseConnection,
    post_id: &str,
) -> Result<Vec<CommentWithAuthor>, DbErr> {
    Ok(comments::Entity::find()
        .filter(comments::Column::PostId.eq(post_id))
        .order_by_desc(comments::Column::CreatedAt)
        .find_also_related(users::Entity)
        .all(db)
        .await?
        .into_iter()
        .map(|(comment, author)| CommentWithAuthor { comment, author })
        .collect())
}

/// Batched variant for post listings, keyed by post id.
pub async fn get_comments_for_posts(
    db: &DatabaseConnection,
    post_ids: Vec<String>,
) -> Result<HashMap<String, Vec<CommentWithAuthor>>, DbErr> {
    if post_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let rows = comments::Entity::find()
        .filter(comments::Column::PostId.is_in(post_ids))
        .order_by_desc(comments::Column::CreatedAt)
        .find_also_related(users::Entity)
        .all(db)
        .await?;

    let mut result: HashMap<String, Vec<CommentWithAuthor>> = HashMap::new();
    for (comment, author) in rows {
        let v: &mut Vec<_> = result.entry(comment.post_id.to_owned()).or_default();
        v.push(CommentWithAuthor { comment, author });
    }

    Ok(result)
}

#[get("/api/posts/{post_id}/comments")]
pub async fn view_comments(path: web::Path<String>) -> Result<impl Responder, Error> {
    let list = get_post_comments(get_db_pool(), &path.into_inner())
        .await
        .map_err(error::ErrorInternalServerError)?;

    Ok(web::Json(list))
}

#[post("/api/posts/{post_id}/comments")]
pub async fn create_comment(
    client: ClientCtx,
    path: web::Path<String>,
    form: web::Json<CommentForm>,
) -> Result<impl Responder, Error> {
    let author_id = client.require_user()?;
    let db = get_db_pool();
    let post_id = path.into_inner();

    let content = form.content.trim().to_owned();
    if content.is_empty() {
        return Err(error::ErrorBadRequest("Comment must contain content."));
    }

    posts::Entity::find_by_id(post_id.to_owned())
        .one(db)
        .await
        .map_err(error::ErrorInternalServerError)?
        .ok_or_else(|| error::ErrorNotFound("Post not found."))?;

    let comment = comments::ActiveModel {
        id: Set(uuid::Uuid::new_v4().to_string()),
        post_id: Set(post_id),
        author_id: Set(author_id),
        content: Set(content),
        created_at: Set(Utc::now().naive_utc()),
    }
    .insert(db)
    .await
    .map_err(|e| {
        log::error!("create_comment: {}", e);
        error::ErrorInternalServerError("Failed to create comment.")
    })?;

    Ok(web::Json(comment))
}

#[delete("/api/comments/{comment_id}")]
pub async fn destroy_comment(
    client: ClientCtx,
    path: web::Path<String>,
) -> Result<impl Responder, Error> {
    client.require_user()?;
    let db = get_db_pool();

    let comment = comments::Entity::find_by_id(path.into_inner())
        .one(db)
        .await
        .map_err(error::ErrorInternalServerError)?
        .ok_or_else(|| error::ErrorNotFound("Comment not found."))?;

    if !client.can_modify_comment(&comment) {
        return Err(error::ErrorForbidden(
            "You do not have permission to delete this comment.",
        ));
    }

    comments::Entity::delete_by_id(comment.id)
        .exec(db)
        .await
        .map_err(error::ErrorInternalServerError)?;

    Ok(HttpResponse::Ok().json(serde_json::json!({ "message": "Comment deleted." })))
}
