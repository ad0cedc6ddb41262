use crate::category;
use crate::comment::{get_comments_for_posts, CommentWithAuthor};
use crate::engagement::{has_liked, record_view};
use crate::filesystem::{self, FormData};
use crate::get_db_pool;
use crate::middleware::ClientCtx;
use crate::orm::{categories, post_files, posts, users};
use actix_multipart::Multipart;
use actix_web::{delete, error, get, post, put, web, Error, HttpRequest, HttpResponse, Responder};
use chrono::Utc;
use sea_orm::{entity::*, query::*, DatabaseConnection, DbErr};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A post joined with its relational data, as the API returns it.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostWithDetails {
    #[serde(flatten)]
    pub post: posts::Model,
    pub author: Option<users::Model>,
    pub category: Option<categories::Model>,
    pub comments: Vec<CommentWithAuthor>,
    pub files: Vec<post_files::Model>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_liked: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostListQuery {
    pub category_id: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostPatchForm {
    pub title: Option<String>,
    pub short_description: Option<String>,
    pub content: Option<String>,
    pub category_id: Option<String>,
    pub published: Option<bool>,
}

/// Required text fields of a new post or article submission.
struct NewPostFields {
    title: String,
    short_description: String,
    content: String,
    published: bool,
}

fn validate_post_form(form: &FormData) -> Result<NewPostFields, Error> {
    let title = form.text("title").unwrap_or("").trim().to_owned();
    let short_description = form
        .text("shortDescription")
        .unwrap_or("")
        .trim()
        .to_owned();
    let content = form.text("content").unwrap_or("").trim().to_owned();

    if title.is_empty() || short_description.is_empty() || content.is_empty() {
        return Err(error::ErrorBadRequest(
            "Title, short description and content are required.",
        ));
    }

    Ok(NewPostFields {
        title,
        short_description,
        content,
        published: parse_published(form.text("published")),
    })
}

fn parse_published(raw: Option<&str>) -> bool {
    match raw {
        Some(v) => v == "true",
        None => true,
    }
}

/// Loads a post by id, mapping absence to a 404.
async fn find_post(db: &DatabaseConnection, id: &str) -> Result<posts::Model, Error> {
    posts::Entity::find_by_id(id.to_owned())
        .one(db)
        .await
        .map_err(error::ErrorInternalServerError)?
        .ok_or_else(|| error::ErrorNotFound("Post not found."))
}

/// Resolves a submitted category id, falling back to the default category
/// when the client omits one.
async fn resolve_category_id(
    db: &DatabaseConnection,
    submitted: Option<&str>,
) -> Result<String, Error> {
    match submitted {
        Some(id) if !id.is_empty() => {
            categories::Entity::find_by_id(id.to_owned())
                .one(db)
                .await
                .map_err(error::ErrorInternalServerError)?
                .ok_or_else(|| error::ErrorBadRequest("Unknown category."))?;
            Ok(id.to_owned())
        }
        _ => {
            let default = category::get_default_category(db)
                .await
                .map_err(error::ErrorInternalServerError)?;
            Ok(default.id)
        }
    }
}

/// Published posts, newest first, author and category joined, each augmented
/// with its comments and files. Offset pagination.
pub async fn get_posts(
    db: &DatabaseConnection,
    category_id: Option<String>,
    limit: u64,
    offset: u64,
) -> Result<Vec<PostWithDetails>, DbErr> {
    let mut select = posts::Entity::find()
        .filter(posts::Column::Published.eq(true))
        .order_by_desc(posts::Column::CreatedAt)
        .limit(limit)
        .offset(offset);
    if let Some(category_id) = category_id {
        select = select.filter(posts::Column::CategoryId.eq(category_id));
    }

    let rows = select.find_also_related(users::Entity).all(db).await?;
    attach_details(db, rows).await
}

/// Single post with the same joins, or None.
pub async fn get_post(
    db: &DatabaseConnection,
    id: &str,
) -> Result<Option<PostWithDetails>, DbErr> {
    let row = posts::Entity::find_by_id(id.to_owned())
        .find_also_related(users::Entity)
        .one(db)
        .await?;

    match row {
        Some(row) => Ok(attach_details(db, vec![row]).await?.pop()),
        None => Ok(None),
    }
}

/// All posts by an author regardless of publish state, newest first.
pub async fn get_user_posts(
    db: &DatabaseConnection,
    user_id: &str,
) -> Result<Vec<PostWithDetails>, DbErr> {
    let rows = posts::Entity::find()
        .filter(posts::Column::AuthorId.eq(user_id))
        .order_by_desc(posts::Column::CreatedAt)
        .find_also_related(users::Entity)
        .all(db)
        .await?;
    attach_details(db, rows).await
}

/// Batches categories, comments and files for a page of posts instead of
/// querying per row.
async fn attach_details(
    db: &DatabaseConnection,
    rows: Vec<(posts::Model, Option<users::Model>)>,
) -> Result<Vec<PostWithDetails>, DbErr> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let post_ids: Vec<String> = rows.iter().map(|(p, _)| p.id.to_owned()).collect();
    let category_ids: Vec<String> = rows.iter().map(|(p, _)| p.category_id.to_owned()).collect();

    let category_map: HashMap<String, categories::Model> = categories::Entity::find()
        .filter(categories::Column::Id.is_in(category_ids))
        .all(db)
        .await?
        .into_iter()
        .map(|c| (c.id.to_owned(), c))
        .collect();

    let mut comment_map = get_comments_for_posts(db, post_ids.to_owned()).await?;
    let mut file_map = get_files_for_posts(db, post_ids).await?;

    Ok(rows
        .into_iter()
        .map(|(post, author)| {
            let category = category_map.get(&post.category_id).cloned();
            let comments = comment_map.remove(&post.id).unwrap_or_default();
            let files = file_map.remove(&post.id).unwrap_or_default();
            PostWithDetails {
                post,
                author,
                category,
                comments,
                files,
                is_liked: None,
            }
        })
        .collect())
}

/// Files for a set of posts, keyed by post id.
pub async fn get_files_for_posts(
    db: &DatabaseConnection,
    post_ids: Vec<String>,
) -> Result<HashMap<String, Vec<post_files::Model>>, DbErr> {
    let rows = post_files::Entity::find()
        .filter(post_files::Column::PostId.is_in(post_ids))
        .order_by_asc(post_files::Column::CreatedAt)
        .all(db)
        .await?;

    let mut result: HashMap<String, Vec<post_files::Model>> = HashMap::new();
    for file in rows {
        let v: &mut Vec<_> = result.entry(file.post_id.to_owned()).or_default();
        v.push(file);
    }

    Ok(result)
}

/// Deletes a post row and returns the number of rows removed. Comments,
/// files, views and likes go with the row (ON DELETE CASCADE); the uploads
/// the file rows pointed at are then swept from disk.
pub async fn remove_post(db: &DatabaseConnection, post: &posts::Model) -> Result<u64, DbErr> {
    let files = post_files::Entity::find()
        .filter(post_files::Column::PostId.eq(post.id.to_owned()))
        .all(db)
        .await?;

    let deleted = posts::Entity::delete_by_id(post.id.to_owned())
        .exec(db)
        .await?
        .rows_affected;

    if deleted > 0 {
        for file in &files {
            filesystem::remove_upload(&file.filename);
        }
        if let Some(cover) = post
            .cover_image
            .as_deref()
            .and_then(filesystem::filename_from_url)
        {
            filesystem::remove_upload(cover);
        }
    }

    Ok(deleted)
}

async fn insert_post_file(
    db: &DatabaseConnection,
    post_id: &str,
    upload: &filesystem::SavedUpload,
) -> Result<post_files::Model, DbErr> {
    post_files::ActiveModel {
        id: Set(uuid::Uuid::new_v4().to_string()),
        post_id: Set(post_id.to_owned()),
        filename: Set(upload.filename.to_owned()),
        original_name: Set(upload.original_name.to_owned()),
        mime_type: Set(upload.mime_type.to_owned()),
        size: Set(upload.size),
        created_at: Set(Utc::now().naive_utc()),
    }
    .insert(db)
    .await
}

#[get("/api/posts")]
pub async fn view_posts(query: web::Query<PostListQuery>) -> Result<impl Responder, Error> {
    let query = query.into_inner();
    let list = get_posts(
        get_db_pool(),
        query.category_id,
        query.limit.unwrap_or(10),
        query.offset.unwrap_or(0),
    )
    .await
    .map_err(|e| {
        log::error!("view_posts: {}", e);
        error::ErrorInternalServerError("Failed to fetch posts.")
    })?;

    Ok(web::Json(list))
}

#[get("/api/posts/my-posts")]
pub async fn view_my_posts(client: ClientCtx) -> Result<impl Responder, Error> {
    let user_id = client.require_user()?;
    let list = get_user_posts(get_db_pool(), &user_id)
        .await
        .map_err(error::ErrorInternalServerError)?;

    Ok(web::Json(list))
}

#[get("/api/posts/{post_id}")]
pub async fn view_post(
    client: ClientCtx,
    req: HttpRequest,
    path: web::Path<String>,
) -> Result<impl Responder, Error> {
    let db = get_db_pool();
    let post_id = path.into_inner();

    find_post(db, &post_id).await?;

    let ip_address = req
        .connection_info()
        .realip_remote_addr()
        .unwrap_or("unknown")
        .to_owned();
    let user_id = client.get_id();
    let session_id = client.get_session_id();

    record_view(
        db,
        &post_id,
        user_id.as_deref(),
        &ip_address,
        session_id.as_deref(),
    )
    .await
    .map_err(|e| {
        log::error!("view_post: record_view: {}", e);
        error::ErrorInternalServerError("Failed to record view.")
    })?;

    let mut post = get_post(db, &post_id)
        .await
        .map_err(error::ErrorInternalServerError)?
        .ok_or_else(|| error::ErrorNotFound("Post not found."))?;

    if let Some(user_id) = user_id {
        post.is_liked = Some(
            has_liked(db, &post_id, &user_id)
                .await
                .map_err(error::ErrorInternalServerError)?,
        );
    }

    Ok(web::Json(post))
}

#[post("/api/posts")]
pub async fn create_post(client: ClientCtx, payload: Multipart) -> Result<impl Responder, Error> {
    let author_id = client.require_user()?;
    let db = get_db_pool();

    let form = filesystem::read_form(payload).await?;
    let fields = validate_post_form(&form)?;
    let category_id = resolve_category_id(db, form.text("categoryId")).await?;
    let cover_image = form
        .files
        .first()
        .map(|f| filesystem::get_file_url_by_filename(&f.filename));
    // Only the first upload becomes the cover; drop the rest from disk.
    for unused in form.files.iter().skip(1) {
        filesystem::remove_upload(&unused.filename);
    }

    let now = Utc::now().naive_utc();
    let post = posts::ActiveModel {
        id: Set(uuid::Uuid::new_v4().to_string()),
        title: Set(fields.title),
        short_description: Set(fields.short_description),
        content: Set(fields.content),
        cover_image: Set(cover_image),
        author_id: Set(author_id),
        category_id: Set(category_id),
        kind: Set("post".to_owned()),
        published: Set(fields.published),
        view_count: Set(0),
        like_count: Set(0),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .map_err(|e| {
        log::error!("create_post: {}", e);
        error::ErrorInternalServerError("Failed to create post.")
    })?;

    Ok(web::Json(post))
}

#[post("/api/articles")]
pub async fn create_article(
    client: ClientCtx,
    payload: Multipart,
) -> Result<impl Responder, Error> {
    let author_id = client.require_user()?;
    let db = get_db_pool();

    let form = filesystem::read_form(payload).await?;
    let fields = validate_post_form(&form)?;
    let category_id = resolve_category_id(db, form.text("categoryId")).await?;

    let now = Utc::now().naive_utc();
    let article = posts::ActiveModel {
        id: Set(uuid::Uuid::new_v4().to_string()),
        title: Set(fields.title),
        short_description: Set(fields.short_description),
        content: Set(fields.content),
        // Articles carry attached images instead of a cover.
        cover_image: Set(None),
        author_id: Set(author_id),
        category_id: Set(category_id),
        kind: Set("article".to_owned()),
        published: Set(fields.published),
        view_count: Set(0),
        like_count: Set(0),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .map_err(|e| {
        log::error!("create_article: {}", e);
        error::ErrorInternalServerError("Failed to create article.")
    })?;

    for upload in &form.files {
        insert_post_file(db, &article.id, upload).await.map_err(|e| {
            log::error!("create_article: attach file: {}", e);
            error::ErrorInternalServerError("Failed to attach file.")
        })?;
    }

    Ok(web::Json(article))
}

#[put("/api/posts/{post_id}")]
pub async fn update_post(
    client: ClientCtx,
    path: web::Path<String>,
    form: web::Json<PostPatchForm>,
) -> Result<impl Responder, Error> {
    client.require_user()?;
    let db = get_db_pool();

    let post = find_post(db, &path.into_inner()).await?;

    if !client.can_modify_post(&post) {
        return Err(error::ErrorForbidden(
            "You do not have permission to update this post.",
        ));
    }

    let form = form.into_inner();
    let mut post: posts::ActiveModel = post.into();
    if let Some(title) = form.title {
        post.title = Set(title);
    }
    if let Some(short_description) = form.short_description {
        post.short_description = Set(short_description);
    }
    if let Some(content) = form.content {
        post.content = Set(content);
    }
    if let Some(category_id) = form.category_id {
        let category_id = resolve_category_id(db, Some(category_id.as_str())).await?;
        post.category_id = Set(category_id);
    }
    if let Some(published) = form.published {
        post.published = Set(published);
    }
    post.updated_at = Set(Utc::now().naive_utc());

    let post = post
        .update(db)
        .await
        .map_err(error::ErrorInternalServerError)?;

    Ok(web::Json(post))
}

#[delete("/api/posts/{post_id}")]
pub async fn destroy_post(
    client: ClientCtx,
    path: web::Path<String>,
) -> Result<impl Responder, Error> {
    client.require_user()?;
    let db = get_db_pool();

    let post = find_post(db, &path.into_inner()).await?;

    if !client.can_modify_post(&post) {
        return Err(error::ErrorForbidden(
            "You do not have permission to delete this post.",
        ));
    }

    remove_post(db, &post)
        .await
        .map_err(error::ErrorInternalServerError)?;

    Ok(HttpResponse::Ok().json(serde_json::json!({ "message": "Post deleted." })))
}

#[post("/api/posts/{post_id}/files")]
pub async fn add_post_files(
    client: ClientCtx,
    path: web::Path<String>,
    payload: Multipart,
) -> Result<impl Responder, Error> {
    client.require_user()?;
    let db = get_db_pool();

    let post = find_post(db, &path.into_inner()).await?;

    if !client.can_modify_post(&post) {
        return Err(error::ErrorForbidden(
            "You do not have permission to attach files to this post.",
        ));
    }

    let form = filesystem::read_form(payload).await?;
    let mut saved = Vec::with_capacity(form.files.len());
    for upload in &form.files {
        let file = insert_post_file(db, &post.id, upload).await.map_err(|e| {
            log::error!("add_post_files: {}", e);
            error::ErrorInternalServerError("Failed to attach file.")
        })?;
        saved.push(file);
    }

    Ok(web::Json(saved))
}

#[delete("/api/files/{file_id}")]
pub async fn destroy_post_file(
    client: ClientCtx,
    path: web::Path<String>,
) -> Result<impl Responder, Error> {
    client.require_user()?;
    let db = get_db_pool();

    let file = post_files::Entity::find_by_id(path.into_inner())
        .one(db)
        .await
        .map_err(error::ErrorInternalServerError)?
        .ok_or_else(|| error::ErrorNotFound("File not found."))?;

    let post = find_post(db, &file.post_id).await?;

    if !client.can_modify_post(&post) {
        return Err(error::ErrorForbidden(
            "You do not have permission to remove files from this post.",
        ));
    }

    post_files::Entity::delete_by_id(file.id)
        .exec(db)
        .await
        .map_err(error::ErrorInternalServerError)?;
    filesystem::remove_upload(&file.filename);

    Ok(HttpResponse::Ok().json(serde_json::json!({ "message": "File deleted." })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;
    use sea_orm::{DatabaseBackend, MockDatabase, MockExecResult};

    fn sample_post() -> posts::Model {
        let now = Utc::now().naive_utc();
        posts::Model {
            id: "p1".to_owned(),
            title: "Hi".to_owned(),
            short_description: "short".to_owned(),
            content: "body".to_owned(),
            cover_image: None,
            author_id: "a".to_owned(),
            category_id: "c".to_owned(),
            kind: "post".to_owned(),
            published: true,
            view_count: 0,
            like_count: 0,
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

    fn form_with(fields: &[(&str, &str)]) -> FormData {
        let mut form = FormData::default();
        for (k, v) in fields {
            form.fields.insert((*k).to_owned(), (*v).to_owned());
        }
        form
    }

    #[test]
    fn post_form_requires_title_description_content() {
        let form = form_with(&[
            ("title", "Hi"),
            ("shortDescription", "short"),
            ("content", "body"),
        ]);
        let fields = validate_post_form(&form).unwrap();
        assert_eq!(fields.title, "Hi");
        assert!(fields.published);

        let missing = form_with(&[("title", "Hi"), ("content", "body")]);
        assert!(validate_post_form(&missing).is_err());

        let blank = form_with(&[
            ("title", "   "),
            ("shortDescription", "short"),
            ("content", "body"),
        ]);
        assert!(validate_post_form(&blank).is_err());
    }

    #[test]
    fn published_defaults_to_true() {
        assert!(parse_published(None));
        assert!(parse_published(Some("true")));
        assert!(!parse_published(Some("false")));
        assert!(!parse_published(Some("yes")));
    }

    #[actix_rt::test]
    async fn missing_post_is_a_not_found_error() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([Vec::<posts::Model>::new()])
            .into_connection();

        let err = find_post(&db, "nope").await.unwrap_err();
        assert_eq!(err.as_response_error().status_code(), StatusCode::NOT_FOUND);
    }

    #[actix_rt::test]
    async fn destroying_a_post_deletes_the_row() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([Vec::<post_files::Model>::new()])
            .append_exec_results([exec(1)])
            .into_connection();

        let deleted = remove_post(&db, &sample_post()).await.unwrap();
        assert_eq!(deleted, 1);

        // The file lookup plus the delete itself.
        assert_eq!(db.into_transaction_log().len(), 2);
    }

    #[actix_rt::test]
    async fn destroying_an_already_gone_post_removes_nothing() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_results([Vec::<post_files::Model>::new()])
            .append_exec_results([exec(0)])
            .into_connection();

        let deleted = remove_post(&db, &sample_post()).await.unwrap();
        assert_eq!(deleted, 0);
    }
}
