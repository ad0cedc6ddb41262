use crate::get_db_pool;
use crate::middleware::ClientCtx;
use crate::orm::users;
use actix_web::{error, get, put, web, Error, Responder};
use chrono::Utc;
use sea_orm::{entity::*, query::*};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminFlagForm {
    pub is_admin: bool,
}

#[get("/api/admin/users")]
pub async fn view_users(client: ClientCtx) -> Result<impl Responder, Error> {
    client.require_admin()?;

    let list = users::Entity::find()
        .order_by_desc(users::Column::CreatedAt)
        .all(get_db_pool())
        .await
        .map_err(error::ErrorInternalServerError)?;

    Ok(web::Json(list))
}

#[put("/api/admin/users/{user_id}/admin")]
pub async fn update_user_admin(
    client: ClientCtx,
    path: web::Path<String>,
    form: web::Json<AdminFlagForm>,
) -> Result<impl Responder, Error> {
    client.require_admin()?;
    let db = get_db_pool();

    let user = users::Entity::find_by_id(path.into_inner())
        .one(db)
        .await
        .map_err(error::ErrorInternalServerError)?
        .ok_or_else(|| error::ErrorNotFound("User not found."))?;

    let mut user: users::ActiveModel = user.into();
    user.is_admin = Set(form.is_admin);
    user.updated_at = Set(Utc::now().naive_utc());
    user.update(db)
        .await
        .map_err(error::ErrorInternalServerError)?;

    Ok(web::Json(serde_json::json!({ "message": "User admin status updated." })))
}
