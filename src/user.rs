use crate::filesystem;
use crate::get_db_pool;
use crate::middleware::ClientCtx;
use crate::orm::users;
use actix_multipart::Multipart;
use actix_session::Session;
use actix_web::{error, get, post, web, Error, HttpResponse, Responder};
use chrono::Utc;
use sea_orm::{entity::*, DatabaseConnection, DbErr};
use serde::Deserialize;

/// A mini struct holding only what the request cycle needs about a client.
#[derive(Clone, Debug)]
pub struct ClientUser {
    pub id: String,
    pub is_admin: bool,
}

/// Profile supplied by the authentication collaborator on login.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginProfile {
    pub id: String,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub profile_image_url: Option<String>,
}

/// Resolves the session cookie to a user record, or None for guests.
pub async fn authenticate_by_session(session: &Session) -> Option<ClientUser> {
    let uid = match session.get::<String>("uid") {
        Ok(Some(uid)) => uid,
        Ok(None) => return None,
        Err(e) => {
            log::error!("authenticate_by_session: {}", e);
            return None;
        }
    };

    match users::Entity::find_by_id(uid).one(get_db_pool()).await {
        Ok(user) => user.map(|u| ClientUser {
            id: u.id,
            is_admin: u.is_admin,
        }),
        Err(e) => {
            log::error!("authenticate_by_session: {}", e);
            None
        }
    }
}

/// Emails provisioned as admins, from the ADMIN_EMAILS env variable.
pub fn admin_emails() -> Vec<String> {
    parse_admin_emails(&std::env::var("ADMIN_EMAILS").unwrap_or_default())
}

fn parse_admin_emails(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|e| e.trim().to_ascii_lowercase())
        .filter(|e| !e.is_empty())
        .collect()
}

/// The allow-list promotes. It never clears an existing admin flag;
/// demotion is an explicit admin operation.
fn resolve_admin_flag(existing: bool, email: Option<&str>, allow_list: &[String]) -> bool {
    existing
        || email
            .map(|e| allow_list.contains(&e.to_ascii_lowercase()))
            .unwrap_or(false)
}

/// Inserts or updates the user record for a login profile.
pub async fn upsert_user(
    db: &DatabaseConnection,
    profile: LoginProfile,
) -> Result<users::Model, DbErr> {
    let now = Utc::now().naive_utc();
    let allow_list = admin_emails();

    match users::Entity::find_by_id(profile.id.to_owned()).one(db).await? {
        Some(existing) => {
            let is_admin =
                resolve_admin_flag(existing.is_admin, profile.email.as_deref(), &allow_list);
            let mut user: users::ActiveModel = existing.into();
            user.email = Set(profile.email);
            user.first_name = Set(profile.first_name);
            user.last_name = Set(profile.last_name);
            user.profile_image_url = Set(profile.profile_image_url);
            user.is_admin = Set(is_admin);
            user.updated_at = Set(now);
            user.update(db).await
        }
        None => {
            let is_admin = resolve_admin_flag(false, profile.email.as_deref(), &allow_list);
            users::ActiveModel {
                id: Set(profile.id),
                email: Set(profile.email),
                first_name: Set(profile.first_name),
                last_name: Set(profile.last_name),
                profile_image_url: Set(profile.profile_image_url),
                is_admin: Set(is_admin),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(db)
            .await
        }
    }
}

#[post("/api/auth/login")]
pub async fn post_login(
    session: Session,
    profile: web::Json<LoginProfile>,
) -> Result<impl Responder, Error> {
    let user = upsert_user(get_db_pool(), profile.into_inner())
        .await
        .map_err(|e| {
            log::error!("post_login: {}", e);
            error::ErrorInternalServerError("Failed to sync user.")
        })?;

    session
        .insert("uid", &user.id)
        .map_err(error::ErrorInternalServerError)?;

    Ok(web::Json(user))
}

#[post("/api/auth/logout")]
pub async fn post_logout(session: Session) -> Result<impl Responder, Error> {
    session.purge();
    Ok(HttpResponse::NoContent().finish())
}

#[get("/api/auth/user")]
pub async fn view_current_user(client: ClientCtx) -> Result<impl Responder, Error> {
    let id = client.require_user()?;
    let user = users::Entity::find_by_id(id)
        .one(get_db_pool())
        .await
        .map_err(error::ErrorInternalServerError)?
        .ok_or_else(|| error::ErrorNotFound("User not found."))?;

    Ok(web::Json(user))
}

#[post("/api/auth/update-profile")]
pub async fn update_profile(
    client: ClientCtx,
    payload: Multipart,
) -> Result<impl Responder, Error> {
    let id = client.require_user()?;
    let db = get_db_pool();

    let form = filesystem::read_form(payload).await?;

    let user = users::Entity::find_by_id(id)
        .one(db)
        .await
        .map_err(error::ErrorInternalServerError)?
        .ok_or_else(|| error::ErrorNotFound("User not found."))?;

    let mut user: users::ActiveModel = user.into();
    if let Some(first_name) = form.text("firstName") {
        user.first_name = Set(Some(first_name.to_owned()));
    }
    if let Some(last_name) = form.text("lastName") {
        user.last_name = Set(Some(last_name.to_owned()));
    }
    if let Some(upload) = form.files.first() {
        user.profile_image_url = Set(Some(filesystem::get_file_url_by_filename(&upload.filename)));
    }
    user.updated_at = Set(Utc::now().naive_utc());

    let user = user
        .update(db)
        .await
        .map_err(error::ErrorInternalServerError)?;

    Ok(web::Json(user))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_emails_parse_trims_and_lowercases() {
        let list = parse_admin_emails(" Admin@Example.com , other@example.com ,");
        assert_eq!(list, vec!["admin@example.com", "other@example.com"]);
        assert!(parse_admin_emails("").is_empty());
    }

    #[test]
    fn allow_list_promotes_on_match() {
        let allow = vec!["admin@example.com".to_owned()];
        assert!(resolve_admin_flag(false, Some("Admin@Example.com"), &allow));
        assert!(!resolve_admin_flag(false, Some("user@example.com"), &allow));
        assert!(!resolve_admin_flag(false, None, &allow));
    }

    #[test]
    fn allow_list_never_demotes() {
        let allow: Vec<String> = Vec::new();
        assert!(resolve_admin_flag(true, Some("gone@example.com"), &allow));
        assert!(resolve_admin_flag(true, None, &allow));
    }
}
