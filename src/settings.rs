use crate::get_db_pool;
use crate::middleware::ClientCtx;
use crate::orm::site_settings;
use actix_web::{error, get, put, web, Error, Responder};
use chrono::Utc;
use sea_orm::sea_query::OnConflict;
use sea_orm::{entity::*, query::*, DatabaseConnection, DbErr};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct SettingForm {
    pub value: String,
}

pub async fn get_setting(db: &DatabaseConnection, key: &str) -> Result<Option<String>, DbErr> {
    Ok(site_settings::Entity::find()
        .filter(site_settings::Column::Key.eq(key))
        .one(db)
        .await?
        .and_then(|s| s.value))
}

/// Upsert by key; the unique constraint arbitrates concurrent writers.
pub async fn set_setting(db: &DatabaseConnection, key: &str, value: &str) -> Result<(), DbErr> {
    let row = site_settings::ActiveModel {
        id: Set(uuid::Uuid::new_v4().to_string()),
        key: Set(key.to_owned()),
        value: Set(Some(value.to_owned())),
        updated_at: Set(Utc::now().naive_utc()),
    };

    site_settings::Entity::insert(row)
        .on_conflict(
            OnConflict::column(site_settings::Column::Key)
                .update_columns([
                    site_settings::Column::Value,
                    site_settings::Column::UpdatedAt,
                ])
                .to_owned(),
        )
        .exec_without_returning(db)
        .await?;

    Ok(())
}

#[get("/api/settings/{key}")]
pub async fn view_setting(path: web::Path<String>) -> Result<impl Responder, Error> {
    let value = get_setting(get_db_pool(), &path.into_inner())
        .await
        .map_err(error::ErrorInternalServerError)?;

    Ok(web::Json(serde_json::json!({ "value": value })))
}

#[put("/api/settings/{key}")]
pub async fn update_setting(
    client: ClientCtx,
    path: web::Path<String>,
    form: web::Json<SettingForm>,
) -> Result<impl Responder, Error> {
    client.require_admin()?;

    set_setting(get_db_pool(), &path.into_inner(), &form.value)
        .await
        .map_err(|e| {
            log::error!("update_setting: {}", e);
            error::ErrorInternalServerError("Failed to update setting.")
        })?;

    Ok(web::Json(serde_json::json!({ "message": "Setting updated." })))
}
