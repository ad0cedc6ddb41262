use crate::get_db_pool;
use crate::middleware::ClientCtx;
use crate::orm::{categories, posts};
use actix_web::{delete, error, get, post, put, web, Error, HttpResponse, Responder};
use chrono::Utc;
use sea_orm::sea_query::OnConflict;
use sea_orm::{entity::*, query::*, DatabaseConnection, DbErr, PaginatorTrait};
use serde::Deserialize;

pub const DEFAULT_CATEGORY_NAME: &str = "Other";

#[derive(Debug, Deserialize)]
pub struct CategoryForm {
    pub name: String,
    pub description: Option<String>,
    pub color: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CategoryPatchForm {
    pub name: Option<String>,
    pub description: Option<String>,
    pub color: Option<String>,
}

/// Idempotently asserts the "Other" category row. Called once at startup and
/// again on the no-category fallback path, so a concurrent first submission
/// cannot race a lazy creation.
pub async fn seed_default_category(db: &DatabaseConnection) -> Result<(), DbErr> {
    let row = categories::ActiveModel {
        id: Set(uuid::Uuid::new_v4().to_string()),
        name: Set(DEFAULT_CATEGORY_NAME.to_owned()),
        description: Set(Some("Miscellaneous topics and general posts.".to_owned())),
        color: Set("gray".to_owned()),
        is_default: Set(true),
        created_at: Set(Utc::now().naive_utc()),
    };

    categories::Entity::insert(row)
        .on_conflict(
            OnConflict::column(categories::Column::Name)
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(db)
        .await?;

    Ok(())
}

/// Returns the default category, asserting it first.
pub async fn get_default_category(db: &DatabaseConnection) -> Result<categories::Model, DbErr> {
    seed_default_category(db).await?;
    categories::Entity::find()
        .filter(categories::Column::Name.eq(DEFAULT_CATEGORY_NAME))
        .one(db)
        .await?
        .ok_or_else(|| DbErr::RecordNotFound("default category".to_owned()))
}

#[get("/api/categories")]
pub async fn view_categories() -> Result<impl Responder, Error> {
    let list = categories::Entity::find()
        .order_by_asc(categories::Column::Name)
        .all(get_db_pool())
        .await
        .map_err(error::ErrorInternalServerError)?;

    Ok(web::Json(list))
}

#[post("/api/categories")]
pub async fn create_category(
    client: ClientCtx,
    form: web::Json<CategoryForm>,
) -> Result<impl Responder, Error> {
    client.require_admin()?;
    let form = form.into_inner();

    let category = categories::ActiveModel {
        id: Set(uuid::Uuid::new_v4().to_string()),
        name: Set(form.name),
        description: Set(form.description),
        color: Set(form.color.unwrap_or_else(|| "blue".to_owned())),
        is_default: Set(false),
        created_at: Set(Utc::now().naive_utc()),
    }
    .insert(get_db_pool())
    .await
    .map_err(|e| {
        log::error!("create_category: {}", e);
        error::ErrorInternalServerError("Failed to create category.")
    })?;

    Ok(web::Json(category))
}

#[put("/api/categories/{category_id}")]
pub async fn update_category(
    client: ClientCtx,
    path: web::Path<String>,
    form: web::Json<CategoryPatchForm>,
) -> Result<impl Responder, Error> {
    client.require_admin()?;
    let db = get_db_pool();

    let category = categories::Entity::find_by_id(path.into_inner())
        .one(db)
        .await
        .map_err(error::ErrorInternalServerError)?
        .ok_or_else(|| error::ErrorNotFound("Category not found."))?;

    let form = form.into_inner();
    let mut category: categories::ActiveModel = category.into();
    if let Some(name) = form.name {
        category.name = Set(name);
    }
    if let Some(description) = form.description {
        category.description = Set(Some(description));
    }
    if let Some(color) = form.color {
        category.color = Set(color);
    }

    let category = category
        .update(db)
        .await
        .map_err(error::ErrorInternalServerError)?;

    Ok(web::Json(category))
}

#[delete("/api/categories/{category_id}")]
pub async fn delete_category(
    client: ClientCtx,
    path: web::Path<String>,
) -> Result<impl Responder, Error> {
    client.require_admin()?;
    let db = get_db_pool();
    let id = path.into_inner();

    // Posts keep a plain FK to categories. Refuse instead of stranding them.
    let in_use = posts::Entity::find()
        .filter(posts::Column::CategoryId.eq(id.to_owned()))
        .count(db)
        .await
        .map_err(error::ErrorInternalServerError)?;
    if in_use > 0 {
        return Err(error::ErrorConflict(
            "Category still has posts and cannot be deleted.",
        ));
    }

    let result = categories::Entity::delete_by_id(id)
        .exec(db)
        .await
        .map_err(error::ErrorInternalServerError)?;
    if result.rows_affected == 0 {
        return Err(error::ErrorNotFound("Category not found."));
    }

    Ok(HttpResponse::Ok().json(serde_json::json!({ "message": "Category deleted." })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::{DatabaseBackend, MockDatabase, MockExecResult};

    #[actix_rt::test]
    async fn seed_default_category_is_idempotent() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_results([
                MockExecResult {
                    last_insert_id: 0,
                    rows_affected: 1,
                },
                MockExecResult {
                    last_insert_id: 0,
                    rows_affected: 0,
                },
            ])
            .into_connection();

        seed_default_category(&db).await.unwrap();
        seed_default_category(&db).await.unwrap();

        let log = db.into_transaction_log();
        assert_eq!(log.len(), 2);
    }
}
